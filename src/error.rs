//! Error types for emberq.

use std::io;

use mio::Token;
use thiserror::Error;

/// Main error type for emberq.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Multiplexer rejected handle registration: {0}")]
    Registration(#[source] io::Error),

    #[error("Handle {0:?} is already present in the registry")]
    DuplicateHandle(Token),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Auth plugin error: {0}")]
    Plugin(String),

    #[error("Auth plugin version mismatch: compiled for {expected}, plugin reports {actual}")]
    PluginVersion { expected: i32, actual: i32 },

    #[error("Failed to start worker thread: {0}")]
    ThreadStart(#[source] io::Error),

    #[error("Worker is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
