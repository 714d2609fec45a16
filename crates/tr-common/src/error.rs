//! Error taxonomy shared by the dispatcher's contracts and core loop.
//!
//! One variant per external collaborator, so call sites can match on the
//! failure's origin rather than inspecting a string.

use thiserror::Error;

/// An error raised by a `QueueClient`, `Store`, or transport implementation.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("queue error: {0}")]
    Queue(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
