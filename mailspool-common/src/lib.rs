pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast to every long-running component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
