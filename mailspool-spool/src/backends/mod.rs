//! Backing store implementations for the spool
//!
//! - `memory`: In-memory storage for tests and transient queues
//! - `file`: File-based storage for production use

pub mod file;
pub mod memory;

pub use file::{FileBackingStore, FileBackingStoreBuilder};
pub use memory::MemoryBackingStore;
