#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use mailspool_spool::{
    BackingStore, ChangeEvent, ChangeFilter, ChangeKind, EntryId, FileBackingStore,
    MemoryBackingStore, NodeKind, Origin, RetryState, SpoolError, SpoolPath, Spooler,
};
use pretty_assertions::assert_eq;

const MESSAGE: &[u8] = b"From: app@example.com\r\nTo: user@example.org\r\nSubject: Hi\r\n\r\nHello\r\n";

fn stores() -> (Vec<Arc<dyn BackingStore>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut file = FileBackingStore::builder()
        .path(dir.path().to_path_buf())
        .watch(false)
        .build()
        .unwrap();
    file.init().unwrap();

    (vec![Arc::new(MemoryBackingStore::new()), Arc::new(file)], dir)
}

#[tokio::test]
async fn spooled_entries_are_complete_and_pending_first_attempt() {
    let (stores, _dir) = stores();

    for store in stores {
        let spooler = Spooler::new(store.clone(), SpoolPath::default());
        let entry = spooler.spool_raw(MESSAGE).await.unwrap();

        let stored = store.get(&entry).await.unwrap().expect("entry exists");
        assert!(stored.has_message());
        assert_eq!(stored.content.unwrap().data.as_ref(), MESSAGE);
        assert_eq!(stored.retry, None);
    }
}

#[tokio::test]
async fn caller_supplied_ids_must_be_unique() {
    let (stores, _dir) = stores();

    for store in stores {
        let spooler = Spooler::new(store, SpoolPath::default());
        let id = EntryId::new("order-1234-receipt").unwrap();

        let entry = spooler.spool_raw_with_id(id.clone(), MESSAGE).await.unwrap();
        assert_eq!(entry.id, id);

        let again = spooler.spool_raw_with_id(id, MESSAGE).await;
        assert!(matches!(again, Err(SpoolError::AlreadyExists(_))));
    }
}

#[tokio::test]
async fn two_step_create_then_cancel_events() {
    let (stores, _dir) = stores();

    for store in stores {
        let folder = SpoolPath::default();
        let spooler = Spooler::new(store.clone(), folder.clone());
        let mut feed = store.subscribe(ChangeFilter::new(
            folder.as_str(),
            [NodeKind::Entry, NodeKind::Content],
        ));

        let entry = spooler.spool_raw(MESSAGE).await.unwrap();
        assert!(spooler.cancel(&entry).await.unwrap());
        assert!(!spooler.cancel(&entry).await.unwrap());

        let mut events = Vec::new();
        for _ in 0..3 {
            events.extend(feed.recv().await.unwrap());
        }

        assert_eq!(
            events,
            vec![
                ChangeEvent::new(ChangeKind::Added, entry.path(), NodeKind::Entry, Origin::Producer),
                ChangeEvent::new(
                    ChangeKind::Added,
                    entry.content_path(),
                    NodeKind::Content,
                    Origin::Producer
                ),
                ChangeEvent::new(ChangeKind::Removed, entry.path(), NodeKind::Entry, Origin::Client),
            ]
        );
    }
}

#[tokio::test]
async fn list_due_honours_the_boundary() {
    let (stores, _dir) = stores();
    let now = SystemTime::now();

    for store in stores {
        let folder = SpoolPath::default();
        let spooler = Spooler::new(store.clone(), folder.clone());

        let overdue = spooler.spool_raw(MESSAGE).await.unwrap();
        let next_hour = spooler.spool_raw(MESSAGE).await.unwrap();
        spooler.spool_raw(MESSAGE).await.unwrap();

        store
            .set_retry_metadata(
                &overdue,
                RetryState {
                    retry_count: 1,
                    next_attempt_at: now - Duration::from_secs(1),
                },
                Origin::Queue,
            )
            .await
            .unwrap();
        store
            .set_retry_metadata(
                &next_hour,
                RetryState {
                    retry_count: 1,
                    next_attempt_at: now + Duration::from_secs(3600),
                },
                Origin::Queue,
            )
            .await
            .unwrap();

        assert_eq!(store.list_due(&folder, now).await.unwrap(), vec![overdue]);
        assert_eq!(store.list(&folder).await.unwrap().len(), 3);
    }
}
