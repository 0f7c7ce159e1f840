//! # Client Error Model
//!
//! This module defines the single typed error enum surfaced by the public
//! API and used by the internal plumbing. The kinds mirror the failure
//! classes of the protocol core:
//!
//! - **Timeout**: a synchronous wait exceeded its budget; the underlying
//!   operation has already been cancelled when this is returned.
//! - **InvalidDataStream**: the peer sent bytes that do not parse as PVA
//!   (bad magic, unsupported version, truncated payload). The transport is
//!   closed and its channels re-enter the connecting state.
//! - **ConnectionClosed**: graceful peer close or loss of liveness.
//!   Operations observe this as a disconnect notification, not a failure.
//! - **RemoteError**: the server answered an operation with a non-OK
//!   status; the message is the server-provided text.
//! - **UsageError**: the caller asked for something the channel cannot do
//!   (missing field in a put, wrong subcommand order). Delivered to the
//!   originating callback only, never raised out of transport tasks.
//! - **Cancelled**: user-initiated cancellation, delivered at most once.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error kinds surfaced to user code.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Synchronous wait exceeded its budget; the operation was cancelled
    /// before this error was raised.
    #[error("operation timed out")]
    Timeout,

    /// Header magic/version mismatch or unparseable payload.
    #[error("invalid data stream: {0}")]
    InvalidDataStream(String),

    /// Graceful peer close or loss of liveness.
    #[error("connection closed")]
    ConnectionClosed,

    /// Server returned a non-OK status for an operation.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// The request referred to a missing field or used an operation out of
    /// order.
    #[error("usage error: {0}")]
    UsageError(String),

    /// User-initiated cancellation.
    #[error("operation cancelled")]
    Cancelled,

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Shorthand for an [`ClientError::InvalidDataStream`] with a message.
    pub(crate) fn bad_stream(msg: impl Into<String>) -> Self {
        ClientError::InvalidDataStream(msg.into())
    }

    /// Process exit code conventionally associated with this error.
    ///
    /// Tools built on this crate map errors to exit codes as: 0 normal,
    /// 1 connect failure, 2 timeout, 3 usage.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Timeout => 2,
            ClientError::UsageError(_) => 3,
            _ => 1,
        }
    }
}
