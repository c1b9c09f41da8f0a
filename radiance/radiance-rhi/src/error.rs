//! Error type shared by every backend.
//!
//! None of these are recoverable inside the core: callers propagate them with `?`
//! up to the application, which reports and exits.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RhiError {
    #[error("out of memory while allocating {what}")]
    OutOfMemory { what: &'static str },

    #[error("view table exhausted (capacity {capacity})")]
    ViewTableFull { capacity: u32 },

    #[error("invalid acceleration structure build input: {0}")]
    InvalidBuildInput(String),

    #[error("invalid resource: {0}")]
    InvalidResource(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("device lost")]
    DeviceLost,

    #[error("{context}: {message}")]
    Backend { context: &'static str, message: String },
}

impl RhiError {
    pub fn backend(context: &'static str, message: impl std::fmt::Display) -> Self {
        RhiError::Backend { context, message: message.to_string() }
    }
}
