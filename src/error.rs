//! Error types for taskflow-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("run loop {0} is no longer accepting work")]
    LoopClosed(String),

    #[error("background loop already started")]
    AlreadyStarted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
