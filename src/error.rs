// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the distribution engine.
//!
//! Errors are grouped by how the engine reacts to them rather than by the
//! component that raised them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `LinkConnection` | Yes | Target server unreachable, connection dropped |
//! | `Protocol` | Yes | Malformed handshake reply, short read |
//! | `Io` | Yes | Socket or file I/O failure |
//! | `TransferExhausted` | No | Attempt budget spent against one target |
//! | `Validation` | No | Missing/unreadable/empty source file |
//! | `ChecksumMismatch` | No | Requested checksum differs from computed one |
//! | `Store` | No | Backing store failure (left for the next poll) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Use [`DistributionError::is_retryable()`] to decide whether another
//! transfer attempt makes sense. Nothing here is fatal to the process: the
//! engine logs and continues.

use thiserror::Error;

/// Result type alias for distribution operations.
pub type Result<T> = std::result::Result<T, DistributionError>;

/// Errors that can occur while distributing files.
#[derive(Error, Debug)]
pub enum DistributionError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket or file I/O failure that is not tied to a specific target.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source file cannot be distributed (missing, unreadable, empty).
    ///
    /// Terminal: the task is marked invalid and never retried.
    #[error("Validation error ({path}): {message}")]
    Validation { path: String, message: String },

    /// The checksum supplied with a request does not match the file.
    #[error("Checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Connecting to a target server failed.
    #[error("Link connection error ({target}): {message}")]
    LinkConnection { target: String, message: String },

    /// The target server answered something the protocol does not allow.
    #[error("Protocol error ({target}): {message}")]
    Protocol { target: String, message: String },

    /// All attempts against one target server failed.
    #[error("Transfer of {path} to {target} failed after {attempts} attempts")]
    TransferExhausted {
        path: String,
        target: String,
        attempts: usize,
    },

    /// SQLite error in the backing store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Backing store failure reported by a non-SQL adapter.
    #[error("Store error: {0}")]
    StoreMessage(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DistributionError {
    /// Build a validation error for a source path.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a protocol error for a target server.
    pub fn protocol(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether another transfer attempt could succeed.
    ///
    /// `TargetLink::rsync` stops at the first error that is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LinkConnection { .. } => true,
            Self::Protocol { .. } => true,
            Self::Io(_) => true,
            Self::TransferExhausted { .. } => false,
            Self::Validation { .. } => false,
            Self::ChecksumMismatch { .. } => false,
            Self::Store(_) | Self::StoreMessage(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// True when the error is the symptom of the peer closing the socket.
    ///
    /// Logged at reduced severity by the retry loop.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
