use std::io;

use thiserror::Error;

/// Errors reported by buffers, builders and the io pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// `reserve_space` on a non-growing buffer with insufficient capacity.
    #[error("buffer is full")]
    BufferFull,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Malformed XML or PBF input.
    #[error("format error: {0}")]
    Format(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Builder or driver misuse.
    #[error("logic error: {0}")]
    Logic(&'static str),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Error {
        Error::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
