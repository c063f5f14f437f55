//! Delivery processor orchestration

pub mod attempt;

use std::{sync::Arc, time::Duration};

use mailspool_common::{Signal, internal};
use mailspool_spool::{BackingStore, SpoolPath};
use mailspool_tracing::traced;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};

use crate::{
    clock::{Clock, SystemClock},
    error::{DeliveryError, SystemError},
    policy::RetryPolicy,
    processor::attempt::DeliveryAttempt,
    queue::{ChangeWatcher, QueueDriver, RetrySweep},
    smtp::{SmtpConfig, SmtpMailTransport},
    transport::MailTransport,
};

/// Capacity of the channel between the work producers and the driver
const WORK_QUEUE_CAPACITY: usize = 1024;

const fn default_sweep_interval() -> u64 {
    60
}

const fn default_send_timeout() -> u64 {
    60
}

const fn default_max_concurrent_attempts() -> usize {
    crate::queue::DEFAULT_MAX_CONCURRENT
}

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Processor delivering everything spooled in one folder
///
/// New entries are picked up from the store's change feed as soon as their
/// content is written; failed ones are retried by a periodic sweep.
#[derive(Debug, Deserialize)]
pub struct DeliveryProcessor {
    /// Folder to deliver from
    ///
    /// Default: `/var/spool/queue/mail`
    #[serde(default)]
    pub spool_path: SpoolPath,

    /// How often to look for due retries (in seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound on one whole transport call (in seconds)
    ///
    /// The SMTP transport's own `timeout_ms` applies to each command.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Maximum number of attempts running at once
    #[serde(default = "default_max_concurrent_attempts")]
    pub max_concurrent_attempts: usize,

    /// How long shutdown waits for in-flight attempts (in seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Deliver every message to this address instead of its recipients
    #[serde(default)]
    pub test_recipient: Option<String>,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub smtp: SmtpConfig,

    /// The spool backing store to deliver from (initialized in `init()`)
    #[serde(skip)]
    pub(crate) spool: Option<Arc<dyn BackingStore>>,

    #[serde(skip)]
    pub(crate) transport: Option<Arc<dyn MailTransport>>,

    #[serde(skip)]
    pub(crate) clock: Option<Arc<dyn Clock>>,
}

impl Default for DeliveryProcessor {
    fn default() -> Self {
        Self {
            spool_path: SpoolPath::default(),
            sweep_interval_secs: default_sweep_interval(),
            send_timeout_secs: default_send_timeout(),
            max_concurrent_attempts: default_max_concurrent_attempts(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            test_recipient: None,
            retry: RetryPolicy::default(),
            smtp: SmtpConfig::default(),
            spool: None,
            transport: None,
            clock: None,
        }
    }
}

impl DeliveryProcessor {
    /// Use `transport` instead of the configured SMTP relay
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Initialize the delivery processor
    ///
    /// # Errors
    ///
    /// Returns an error if the SMTP transport cannot be built
    pub fn init(&mut self, spool: Arc<dyn BackingStore>) -> Result<(), DeliveryError> {
        internal!("Initialising Delivery Processor ...");

        if self.transport.is_none() {
            self.transport = Some(Arc::new(SmtpMailTransport::new(&self.smtp)?));
        }
        self.spool = Some(spool);

        if let Some(recipient) = &self.test_recipient {
            mailspool_common::tracing::warn!(
                "Test recipient {recipient} configured, all mail will be redirected"
            );
        }

        internal!(
            "Delivering from {} (sweep every {}s, max {} concurrent attempts, max {} retries)",
            self.spool_path,
            self.sweep_interval_secs,
            self.max_concurrent_attempts,
            self.retry.max_retries
        );

        Ok(())
    }

    fn attempt(
        &self,
        spool: &Arc<dyn BackingStore>,
        transport: &Arc<dyn MailTransport>,
    ) -> DeliveryAttempt {
        DeliveryAttempt::new(spool.clone(), transport.clone())
            .with_policy(self.retry.clone())
            .with_clock(self.clock())
            .with_test_recipient(self.test_recipient.clone())
            .with_send_timeout(Duration::from_secs(self.send_timeout_secs))
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone().unwrap_or_else(|| Arc::new(SystemClock))
    }

    /// Run the delivery processor
    ///
    /// Subscribes to the spool's change feed, resubmits everything that was
    /// left pending while the processor was down, and then runs the change
    /// watcher, the retry sweep and the queue driver until shutdown.
    ///
    /// ## Graceful Shutdown
    ///
    /// When a shutdown signal is received the watcher and sweep stop
    /// producing work, and the driver waits for in-flight attempts up to
    /// `shutdown_timeout_secs`. Entries not finished by then are retried on
    /// the next start.
    ///
    /// # Errors
    ///
    /// Returns an error if `init()` was not called first
    #[traced(instrument(level = mailspool_common::tracing::Level::TRACE, skip_all))]
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let (Some(spool), Some(transport)) = (&self.spool, &self.transport) else {
            return Err(SystemError::NotInitialized(
                "Delivery processor not initialized. Call init() first.".to_string(),
            )
            .into());
        };

        spool.ensure_folder(&self.spool_path).await?;

        let watcher = ChangeWatcher::new(self.spool_path.clone());
        let feed = spool.subscribe(watcher.filter());

        let sweep = RetrySweep::new(spool.clone(), self.spool_path.clone(), self.clock());
        let driver = QueueDriver::new(Arc::new(self.attempt(spool, transport)), spool.clone())
            .with_max_concurrent(self.max_concurrent_attempts)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs));

        let (tx, rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
        let sweep_tx = tx.clone();
        let watcher_shutdown = shutdown.resubscribe();
        let sweep_shutdown = shutdown.resubscribe();

        let watch = async {
            let tx = tx;

            // The feed is already subscribed, so nothing spooled during
            // recovery is missed
            let recovered = sweep.recover(&tx).await;
            internal!("Resubmitted {recovered} pending entries");

            watcher.run(feed, tx, &sweep, watcher_shutdown).await;
        };

        tokio::join!(
            watch,
            sweep.run(
                Duration::from_secs(self.sweep_interval_secs.max(1)),
                sweep_tx,
                sweep_shutdown
            ),
            driver.run(rx, shutdown),
        );

        internal!("Delivery processor shutdown complete");
        Ok(())
    }
}
