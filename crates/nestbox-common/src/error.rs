//! Unified error types for the nestbox workspace.
//!
//! Every primitive returns a typed result. Nothing in the launch path is
//! retried: mount-tree and namespace operations are not safely resumable, so
//! the first error aborts the whole launch.

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum NestboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The launch definition asks for something that cannot be honoured.
    ///
    /// Reported before any namespace is created whenever possible.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A kernel call failed.
    #[error("{op}: {source}")]
    Syscall {
        /// Description of the failed operation.
        op: String,
        /// The errno reported by the kernel.
        source: Errno,
    },

    /// The handshake peer sent something other than the continue token,
    /// or hung up.
    #[error("handshake protocol violation: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// No candidate filesystem type could mount a block device.
    #[error("failed to mount device {} to {}, unable to detect filesystem", device.display(), target.display())]
    FilesystemDetection {
        /// Device that was being mounted.
        device: PathBuf,
        /// Mount point.
        target: PathBuf,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl NestboxError {
    /// Builds a [`NestboxError::Syscall`] from an operation description and errno.
    pub fn syscall(op: impl Into<String>, source: Errno) -> Self {
        Self::Syscall {
            op: op.into(),
            source,
        }
    }

    /// Builds a [`NestboxError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns the kernel errno carried by a syscall failure.
    ///
    /// Lets callers distinguish e.g. an "already mounted" `EBUSY` from a
    /// misconfiguration.
    pub const fn errno(&self) -> Option<Errno> {
        match self {
            Self::Syscall { source, .. } => Some(*source),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, NestboxError>;
