use std::io;

use thiserror::Error;

/// Errors returned by the ringnet engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O or syscall failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// io_uring setup failed (e.g., unsupported kernel features).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Fixed buffer pool registration failed.
    #[error("buffer registration: {0}")]
    BufferRegistration(String),
    /// Configuration file could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// A worker loop thread failed to come up.
    #[error("loop thread startup failed")]
    LoopStartup,
    /// The server was already started.
    #[error("server already started")]
    AlreadyStarted,
}
