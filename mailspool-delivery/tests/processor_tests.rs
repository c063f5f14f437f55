#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use mailspool_common::Signal;
use mailspool_delivery::{DeliveryAttempt, DeliveryProcessor, ManualClock, QueueDriver, WorkItem};
use mailspool_spool::{BackingStore, MemoryBackingStore, SpoolPath, Spooler};
use pretty_assertions::assert_eq;
use support::{MESSAGE, Reply, ScriptedTransport, memory_store, spool, wait_for};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

const WAIT: Duration = Duration::from_secs(10);

struct Running {
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("processor stops on shutdown")
            .unwrap();
    }
}

fn start(
    store: &Arc<MemoryBackingStore>,
    transport: &Arc<ScriptedTransport>,
    clock: &ManualClock,
) -> Running {
    let mut processor = DeliveryProcessor::default()
        .with_transport(transport.clone())
        .with_clock(Arc::new(clock.clone()));
    processor.sweep_interval_secs = 1;
    processor.init(store.clone()).unwrap();

    let (shutdown, rx) = broadcast::channel(4);
    let handle = tokio::spawn(async move {
        processor.serve(rx).await.unwrap();
    });

    Running { shutdown, handle }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spooled_message_is_delivered() {
    let store = memory_store();
    let transport = ScriptedTransport::always(Reply::Accept);
    let running = start(&store, &transport, &ManualClock::new());

    let spooler = Spooler::new(store.clone(), SpoolPath::default());
    let entry = spooler.spool_raw(MESSAGE).await.unwrap();

    wait_for(WAIT, || transport.sent().len() == 1 && store.is_empty()).await;
    assert_eq!(store.get(&entry).await.unwrap(), None);

    running.stop().await;
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_entries_are_recovered_at_startup() {
    let store = memory_store();
    spool(&store, MESSAGE).await;
    spool(&store, MESSAGE).await;

    let transport = ScriptedTransport::always(Reply::Accept);
    let running = start(&store, &transport, &ManualClock::new());

    wait_for(WAIT, || store.is_empty()).await;
    running.stop().await;

    assert_eq!(transport.sent().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn due_retry_is_picked_up_by_the_sweep() {
    let store = memory_store();
    let transport = ScriptedTransport::new([Reply::Transient], Reply::Accept);
    let clock = ManualClock::new();
    let running = start(&store, &transport, &clock);

    let entry = Spooler::new(store.clone(), SpoolPath::default())
        .spool_raw(MESSAGE)
        .await
        .unwrap();

    wait_for(WAIT, || transport.calls() == 1).await;
    let mut retry = None;
    for _ in 0..100 {
        retry = store.get(&entry).await.unwrap().and_then(|stored| stored.retry);
        if retry.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let retry = retry.expect("retry state recorded");
    assert_eq!(retry.retry_count, 1);

    // Not due yet, so the sweep leaves it alone
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(transport.calls(), 1);

    clock.set(retry.next_attempt_at + Duration::from_secs(1));
    wait_for(WAIT, || store.is_empty()).await;

    running.stop().await;
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_entry_is_never_sent() {
    let store = memory_store();
    let transport = ScriptedTransport::new([Reply::Transient], Reply::Accept);
    let clock = ManualClock::new();
    let running = start(&store, &transport, &clock);

    let spooler = Spooler::new(store.clone(), SpoolPath::default());
    let entry = spooler.spool_raw(MESSAGE).await.unwrap();
    wait_for(WAIT, || transport.calls() == 1).await;

    assert!(spooler.cancel(&entry).await.unwrap());
    clock.advance(Duration::from_secs(365 * 24 * 3600));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    running.stop().await;
    assert_eq!(transport.calls(), 1);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn driver_runs_one_attempt_per_entry_at_a_time() {
    let store = memory_store();
    let transport = ScriptedTransport::with_delay([], Reply::Accept, Duration::from_millis(200));
    let entry = spool(&store, MESSAGE).await;

    let attempt = Arc::new(DeliveryAttempt::new(store.clone(), transport.clone()));
    let driver = QueueDriver::new(attempt, store.clone());
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown, shutdown_rx) = broadcast::channel(1);

    tx.send(WorkItem::Deliver(entry.clone())).await.unwrap();
    tx.send(WorkItem::Deliver(entry.clone())).await.unwrap();
    drop(tx);

    driver.run(rx, shutdown_rx).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(store.get(&entry).await.unwrap(), None);
}

#[tokio::test]
async fn driver_cleans_up_discarded_entries() {
    let store = memory_store();
    let transport = ScriptedTransport::always(Reply::Accept);
    let entry = spool(&store, MESSAGE).await;

    let attempt = Arc::new(DeliveryAttempt::new(store.clone(), transport.clone()));
    let driver = QueueDriver::new(attempt, store.clone());
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown, shutdown_rx) = broadcast::channel(1);

    tx.send(WorkItem::Discard(entry.clone())).await.unwrap();
    drop(tx);

    driver.run(rx, shutdown_rx).await;

    assert!(store.is_empty());
    assert_eq!(transport.calls(), 0);
}
