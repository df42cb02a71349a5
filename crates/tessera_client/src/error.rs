//! Error taxonomy surfaced by the write session.
//!
//! Per-operation failures are delivered through each operation's receipt;
//! batch-wide failures fan the same error out to every operation in the
//! batch, which is why `SessionError` is cloneable.

use thiserror::Error;

/// Terminal value of one applied operation: `Ok(None)` on success,
/// `Ok(Some(row error))` when the server rejected that row, `Err` when the
/// operation or its whole batch failed.
pub type OpResult = Result<Option<RowError>, SessionError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A configuration change was requested while writes are buffered.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Manual flush is enabled and the per-batch buffer is already full.
    #[error("manual flush is enabled but the buffer is too big")]
    BufferFull,

    /// The operation ran out of apply attempts.
    #[error("operation gave up after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The dispatcher returned a payload the session cannot interpret.
    #[error("unexpected write response: {message}")]
    InvalidResponse { message: String },

    /// The server rejected the whole write request.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    /// The dispatcher failed to deliver the request.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// The session went away before completing the operation.
    #[error("the session dropped the operation before completing it")]
    Aborted,
}

impl SessionError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Flatten a dispatcher error chain into a transport failure.
    pub(crate) fn transport(err: &anyhow::Error) -> Self {
        Self::Transport {
            message: format!("{err:#}"),
        }
    }
}

/// Per-row failure reported by the server for one operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// Position of the failed operation within its batch.
    pub row_index: usize,
    pub code: i32,
    pub message: String,
}

impl RowError {
    pub fn new(row_index: usize, code: i32, message: impl Into<String>) -> Self {
        Self {
            row_index,
            code,
            message: message.into(),
        }
    }
}
