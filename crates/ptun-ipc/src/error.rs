//! IPC errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    /// The transport answered without data: the other process is gone.
    #[error("IPC peer is gone")]
    Gone,

    /// The server was asked to push an event with no buffered slot left.
    #[error("No buffered command left to reply to")]
    BufferUnderflow,

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Worker queue is shut down")]
    QueueClosed,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
