//! Library-wide error type.
//!
//! Every fallible public operation returns a [`DeviceError`]. The two
//! variants mirror the logic/runtime split of the component design: a
//! logic error is a contract violation detectable without touching
//! hardware, a runtime error is a transient or environmental failure.

use std::fmt;

use thiserror::Error;

/// The library-wide error type.
#[derive(Debug, Error, Clone)]
pub enum DeviceError {
    /// A contract violation detectable before any I/O: unknown alias,
    /// missing register, unsupported access mode, out-of-range slice,
    /// cyclic mapping, writing to a read-only register, and so on.
    #[error("{path}: {message}")]
    Logic { path: String, message: String },

    /// A transient or environmental failure: I/O failure, connection
    /// timeout, shared-memory sanity failure, async poisoning after
    /// `setException`.
    #[error("{path}: {message}")]
    Runtime { path: String, message: String },
}

impl DeviceError {
    pub fn logic(path: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Logic {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn runtime(path: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::Runtime {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_logic(&self) -> bool {
        matches!(self, DeviceError::Logic { .. })
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, DeviceError::Runtime { .. })
    }

    pub fn path(&self) -> &str {
        match self {
            DeviceError::Logic { path, .. } | DeviceError::Runtime { path, .. } => path,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            DeviceError::Logic { message, .. } | DeviceError::Runtime { message, .. } => message,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Wraps an I/O error as a runtime error attached to a register path.
///
/// A blanket `From<std::io::Error>` would lose the path, so callers use
/// this helper explicitly at the point where the path is known.
pub(crate) fn io_runtime(path: impl Into<String>, err: impl fmt::Display) -> DeviceError {
    DeviceError::runtime(path, err.to_string())
}
