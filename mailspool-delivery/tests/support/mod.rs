//! Shared fixtures for delivery integration tests
#![allow(dead_code)] // Not every test file uses every helper

pub mod mock_server;

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use mailspool_delivery::{
    DeliveryError, MailTransport, OutboundMessage, PermanentError, TemporaryError,
};
use mailspool_spool::{
    BackingStore, ChangeFeed, ChangeFilter, Content, EntryId, EntryRef, MemoryBackingStore,
    Origin, RetryState, SpoolEntry, SpoolError, SpoolPath,
};

pub const MESSAGE: &[u8] = b"From: app@example.com\r\n\
    To: user@example.org\r\n\
    Subject: Your receipt\r\n\
    \r\n\
    Thanks for your order.\r\n";

/// How the scripted transport answers one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Transient,
    Permanent,
    /// Never answer
    Hang,
}

/// Transport answering from a script, then with a fallback reply
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    sent: Mutex<Vec<OutboundMessage>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Reply>, fallback: Reply) -> Arc<Self> {
        Self::with_delay(script, fallback, Duration::ZERO)
    }

    pub fn always(reply: Reply) -> Arc<Self> {
        Self::new([], reply)
    }

    pub fn with_delay(
        script: impl IntoIterator<Item = Reply>,
        fallback: Reply,
        delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            delay,
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of send calls, whatever their outcome
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages that were accepted
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match reply {
            Reply::Accept => {
                self.sent.lock().unwrap().push(message.clone());
                Ok(())
            }
            Reply::Transient => Err(TemporaryError::SmtpTemporary(String::from(
                "451 4.3.0 try again later",
            ))
            .into()),
            Reply::Permanent => Err(PermanentError::Rejected(String::from(
                "550 5.1.1 mailbox unavailable",
            ))
            .into()),
            Reply::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Get,
    Delete,
    SetRetry,
    ListDue,
}

/// Memory store whose operations fail on demand
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryBackingStore,
    get: AtomicBool,
    delete: AtomicBool,
    set_retry: AtomicBool,
    list_due: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fault: Fault, failing: bool) {
        self.flag(fault).store(failing, Ordering::SeqCst);
    }

    fn flag(&self, fault: Fault) -> &AtomicBool {
        match fault {
            Fault::Get => &self.get,
            Fault::Delete => &self.delete,
            Fault::SetRetry => &self.set_retry,
            Fault::ListDue => &self.list_due,
        }
    }

    fn check(&self, fault: Fault) -> mailspool_spool::Result<()> {
        if self.flag(fault).load(Ordering::SeqCst) {
            return Err(SpoolError::Io(io::Error::other(format!(
                "injected {fault:?} failure"
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for FaultyStore {
    async fn create(
        &self,
        folder: &SpoolPath,
        id: Option<EntryId>,
        content: Content,
        origin: Origin,
    ) -> mailspool_spool::Result<EntryRef> {
        self.inner.create(folder, id, content, origin).await
    }

    async fn get(&self, entry: &EntryRef) -> mailspool_spool::Result<Option<SpoolEntry>> {
        self.check(Fault::Get)?;
        self.inner.get(entry).await
    }

    async fn delete(&self, entry: &EntryRef, origin: Origin) -> mailspool_spool::Result<bool> {
        self.check(Fault::Delete)?;
        self.inner.delete(entry, origin).await
    }

    async fn list(&self, folder: &SpoolPath) -> mailspool_spool::Result<Vec<EntryRef>> {
        self.inner.list(folder).await
    }

    async fn list_due(
        &self,
        folder: &SpoolPath,
        now: SystemTime,
    ) -> mailspool_spool::Result<Vec<EntryRef>> {
        self.check(Fault::ListDue)?;
        self.inner.list_due(folder, now).await
    }

    async fn set_retry_metadata(
        &self,
        entry: &EntryRef,
        retry: RetryState,
        origin: Origin,
    ) -> mailspool_spool::Result<()> {
        self.check(Fault::SetRetry)?;
        self.inner.set_retry_metadata(entry, retry, origin).await
    }

    async fn ensure_folder(&self, folder: &SpoolPath) -> mailspool_spool::Result<()> {
        self.inner.ensure_folder(folder).await
    }

    fn subscribe(&self, filter: ChangeFilter) -> ChangeFeed {
        self.inner.subscribe(filter)
    }
}

pub fn memory_store() -> Arc<MemoryBackingStore> {
    Arc::new(MemoryBackingStore::new())
}

pub async fn spool(store: &Arc<MemoryBackingStore>, message: &[u8]) -> EntryRef {
    store
        .create(
            &SpoolPath::default(),
            None,
            Content::rfc822(message),
            Origin::Producer,
        )
        .await
        .unwrap()
}

pub async fn spool_with_id(store: &Arc<MemoryBackingStore>, id: &str, content: Content) -> EntryRef {
    store
        .create(
            &SpoolPath::default(),
            Some(EntryId::new(id).unwrap()),
            content,
            Origin::Producer,
        )
        .await
        .unwrap()
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;

    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
