//! Centralized error types for flatmail.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the flatmail engine.
///
/// The validation variants (`InvalidName`, `TryCreate`, `InvalidFormat`)
/// leave everything untouched. `Corrupt` and `Truncated` are structural:
/// the stream that hit them is force-closed and answers every later call
/// with `StreamClosed`.
#[derive(Error, Debug)]
pub enum FlatmailError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{}': {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The mailbox name is not usable as a path.
    #[error("Invalid mailbox name: {0}")]
    InvalidName(String),

    /// The target mailbox does not exist yet. Callers are expected to
    /// create it explicitly and retry; this is not a hard failure.
    #[error("Mailbox does not exist (create it first): {}", .0.display())]
    TryCreate(PathBuf),

    /// The file exists but does not start with a valid internal header.
    #[error("Not a valid flatmail mailbox: {}", .0.display())]
    InvalidFormat(PathBuf),

    /// A malformed record at a specific byte offset. Fatal to the stream;
    /// the file itself is left untouched (detection, not repair).
    #[error("Corrupt mailbox record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The file shrank below the already-parsed size: it was truncated or
    /// rewritten by something else. Fatal to the stream.
    #[error("Mailbox '{}' shrank externally: parsed {} bytes, file is now {}", .path.display(), .parsed, .actual)]
    Truncated {
        path: PathBuf,
        parsed: u64,
        actual: u64,
    },

    /// A non-blocking lock attempt found the file held by another process.
    #[error("Mailbox is locked by another process: {}", .0.display())]
    LockBusy(PathBuf),

    /// The stream was closed (normally or after a fatal condition) and
    /// can no longer be used.
    #[error("Mailbox stream is closed")]
    StreamClosed,

    /// A sequence number outside 1..=total was requested.
    #[error("No such message: {0}")]
    NoSuchMessage(usize),
}

/// Convenience alias for `Result<T, FlatmailError>`.
pub type Result<T> = std::result::Result<T, FlatmailError>;

impl FlatmailError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error tears down the stream that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Truncated { .. })
    }
}

/// Allow `?` on `std::io::Error` inside functions returning `FlatmailError`
/// when no path context is available (rare — prefer `FlatmailError::io`).
impl From<std::io::Error> for FlatmailError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
