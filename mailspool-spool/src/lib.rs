pub mod backends;
pub mod config;
pub mod entry;
pub mod error;
pub mod feed;
pub mod session;
pub mod spooler;
pub mod r#trait;
pub mod types;

pub use backends::{FileBackingStore, FileBackingStoreBuilder, MemoryBackingStore};
pub use config::SpoolConfig;
pub use entry::{Content, RetryState, SpoolEntry};
pub use error::{Result, SerializationError, SpoolError, ValidationError};
pub use feed::{
    ChangeBatch, ChangeEvent, ChangeFeed, ChangeFilter, ChangeKind, ChangePublisher, FeedError,
};
pub use session::SpoolSession;
pub use spooler::Spooler;
pub use r#trait::BackingStore;
pub use types::{CONTENT_NODE, EntryId, EntryRef, MESSAGE_RFC822, NodeKind, Origin, SpoolPath};
