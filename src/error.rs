//! Error types for aperture.

use thiserror::Error;

/// Result type alias using aperture's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for orchestration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A device control operation failed.
    #[error("device operation failed: {0}")]
    Device(String),

    /// No free slot in a bounded registry arena.
    #[error("slots exhausted: no free slot available")]
    SlotsExhausted,

    /// Client requested a format outside the translation table.
    #[error("unknown stream format code: {0:#x}")]
    UnknownFormat(u32),

    /// Parameter id outside the known table.
    #[error("unknown parameter id: {0}")]
    UnknownParameter(u32),

    /// Malformed or out-of-contract message on an external interface.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Operation submitted against a stream id with no live slot.
    #[error("no such stream: {0}")]
    NoSuchStream(u8),

    /// Operation illegal in the stream's current lifecycle state.
    #[error("stream {0} is busy: {1}")]
    StreamBusy(u8, &'static str),

    /// The target worker has already stopped.
    #[error("worker is stopped")]
    WorkerStopped,

    /// The command channel's receiver is gone.
    #[error("command channel closed")]
    ChannelClosed,

    /// Worker init hook failed; the worker never entered its loop.
    #[error("worker init failed: {0}")]
    InitFailed(String),

    /// Memory mapping failed.
    #[error("mapping failed: {0}")]
    MappingFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
