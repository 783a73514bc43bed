//! Error types for volstore
//!
//! The variants here form the outcome taxonomy every storage operation
//! reports to the protocol layer. [`Error::classify`] is the single place
//! where raw `errno` values coming back from a volume are translated into
//! that taxonomy; everything above it propagates the classified error
//! unchanged.

use crate::types::ObjectPathError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Common result type for volstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// `errno` reported by the platform when an extended attribute is absent
#[cfg(target_os = "linux")]
pub const ENOATTR: i32 = libc::ENODATA;

/// `errno` reported by the platform when an extended attribute is absent
#[cfg(not(target_os = "linux"))]
pub const ENOATTR: i32 = libc::ENOATTR;

/// Build the I/O error a volume returns for a missing extended attribute
#[must_use]
pub fn missing_attribute() -> io::Error {
    io::Error::from_raw_os_error(ENOATTR)
}

/// Check whether an I/O error means "no such extended attribute"
#[must_use]
pub fn is_missing_attribute(err: &io::Error) -> bool {
    err.raw_os_error() == Some(ENOATTR)
}

/// Volume call an error originated from
///
/// Classification depends on the call: out-of-space only means
/// "insufficient storage" for calls that allocate, and "no such file" only
/// means "not found" for calls on the read side and for unlink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageOp {
    Stat,
    Open,
    Read,
    Seek,
    MakeDirs,
    CreateStaging,
    Write,
    Preallocate,
    Sync,
    Rename,
    Unlink,
    GetXattr,
    SetXattr,
    ListDir,
}

impl StorageOp {
    /// Whether the call may consume space on the volume
    #[must_use]
    pub const fn allocates(self) -> bool {
        matches!(
            self,
            Self::MakeDirs
                | Self::CreateStaging
                | Self::Write
                | Self::Preallocate
                | Self::Sync
                | Self::SetXattr
        )
    }

    /// Whether the call only observes existing state
    #[must_use]
    pub const fn reads(self) -> bool {
        matches!(
            self,
            Self::Stat | Self::Open | Self::Read | Self::Seek | Self::GetXattr
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stat => "stat",
            Self::Open => "open",
            Self::Read => "read",
            Self::Seek => "seek",
            Self::MakeDirs => "mkdir",
            Self::CreateStaging => "create",
            Self::Write => "write",
            Self::Preallocate => "fallocate",
            Self::Sync => "fsync",
            Self::Rename => "rename",
            Self::Unlink => "unlink",
            Self::GetXattr => "getxattr",
            Self::SetXattr => "setxattr",
            Self::ListDir => "readdir",
        }
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome class reported to the protocol layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    SpaceExhausted,
    MetadataCorrupt,
    Internal,
}

/// Common error type for volstore
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient storage: {op} {path}: {source}")]
    SpaceExhausted {
        op: StorageOp,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("metadata corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("{op} {path} failed: {source}")]
    Storage {
        op: StorageOp,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid object path: {0}")]
    InvalidPath(#[from] ObjectPathError),

    #[error("{operation} not valid while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Translate a failed volume call into an outcome
    pub fn classify(op: StorageOp, path: impl Into<String>, source: io::Error) -> Self {
        let path = path.into();
        match source.raw_os_error() {
            Some(libc::ENOSPC | libc::EDQUOT) if op.allocates() => {
                Self::SpaceExhausted { op, path, source }
            }
            Some(libc::ENOENT) if op.reads() || op == StorageOp::Unlink => Self::NotFound(path),
            Some(errno) if errno == ENOATTR && op == StorageOp::GetXattr => Self::NotFound(path),
            _ => Self::Storage { op, path, source },
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a metadata corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::MetadataCorrupt(msg.into())
    }

    /// Outcome class of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::SpaceExhausted { .. } => ErrorKind::SpaceExhausted,
            Self::MetadataCorrupt(_) => ErrorKind::MetadataCorrupt,
            _ => ErrorKind::Internal,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }

    /// Check if the device ran out of space or quota
    #[must_use]
    pub const fn is_space_exhausted(&self) -> bool {
        matches!(self.kind(), ErrorKind::SpaceExhausted)
    }

    /// Get HTTP status code for the object server
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidPath(_) => 400,

            // 404 Not Found
            Self::NotFound(_) => 404,

            // 503 Service Unavailable
            Self::DeviceNotFound(_) => 503,

            // 507 Insufficient Storage
            Self::SpaceExhausted { .. } => 507,

            // 500 Internal Server Error
            Self::MetadataCorrupt(_)
            | Self::Storage { .. }
            | Self::InvalidState { .. }
            | Self::Configuration(_)
            | Self::Internal(_) => 500,
        }
    }
}
