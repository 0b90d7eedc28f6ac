//! CSI error types.
//!
//! All errors in the `libs3csi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.  Every variant maps onto a protocol status
//! [`Code`] through [`CsiError::code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes reported to the caller of a node RPC.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Code {
    /// The request is malformed; retrying it unchanged cannot succeed.
    InvalidArgument,
    /// A referenced object (the bucket) does not exist.
    NotFound,
    /// Filesystem, credential, or mount backend failure.
    Internal,
    /// The operation is not supported by this plugin.
    Unimplemented,
    /// The request deadline passed before the next step could start.
    DeadlineExceeded,
    /// The plugin could not be reached.
    Unavailable,
}

/// Unified error type for node operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid or incomplete request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Credentials could not be resolved or are incomplete.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The bucket backing the volume does not exist.
    #[error("bucket {0} not found")]
    BucketNotFound(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The object storage backend returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// The operation is not implemented by this plugin.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// The request deadline elapsed at an operation boundary.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CsiError::Configuration`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Configuration(e.to_string())
    }

    /// Status code reported for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::BucketNotFound(_) => Code::NotFound,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Self::TransportError(_) => Code::Unavailable,
            Self::Configuration(_)
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::BackendError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}
