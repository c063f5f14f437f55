use std::sync::LazyLock;

use mailspool_common::{Signal, internal, logging, tracing};
use mailspool_delivery::DeliveryProcessor;
use mailspool_spool::SpoolConfig;
use mailspool_tracing::traced;
use serde::Deserialize;
use tokio::sync::broadcast;

/// Everything the binary runs, as read from its RON configuration
#[derive(Debug, Default, Deserialize)]
pub struct Mailspool {
    #[serde(default)]
    spool: SpoolConfig,
    #[serde(default)]
    delivery: DeliveryProcessor,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    // Delivery finishing its in-flight attempts ends `run` before this does,
    // unless a second CTRL+C forces the issue
    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Mailspool {
    /// Run the spool and its delivery queue until shutdown
    ///
    /// # Errors
    ///
    /// This function will return an error if the spool or the delivery
    /// processor fail to initialise.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(mut self) -> anyhow::Result<()> {
        logging::init();

        if let Some(path) = self.spool.path() {
            internal!("Spool directory: {}", path.display());
        }
        let store = self.spool.clone().into_backing_store()?;

        internal!("Controller running");

        self.delivery.init(store)?;

        let ret = tokio::select! {
            r = self.delivery.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Mailspool = ron::from_str("()").unwrap();

        assert_eq!(
            config.spool.path(),
            Some(std::path::Path::new("/var/spool/mailspool"))
        );
        assert_eq!(config.delivery.spool_path.as_str(), "/var/spool/queue/mail");
    }

    #[test]
    fn sample_config_parses() {
        let config: Mailspool =
            ron::from_str(include_str!("../../mailspool.config.ron")).unwrap();

        assert!(matches!(config.spool, SpoolConfig::File { watch: true, .. }));
        assert_eq!(config.delivery.smtp.port, 587);
        assert!(config.delivery.smtp.starttls);
        assert_eq!(config.delivery.retry.max_retries, 12);
    }

    #[test]
    fn memory_spool_config() {
        let config: Mailspool = ron::from_str(
            r#"(
                spool: Memory(capacity: Some(100)),
                delivery: (sweep_interval_secs: 10),
            )"#,
        )
        .unwrap();

        assert!(config.spool.path().is_none());
        assert_eq!(config.delivery.sweep_interval_secs, 10);
    }
}
