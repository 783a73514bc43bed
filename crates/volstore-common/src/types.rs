//! Core type definitions for volstore
//!
//! Object addressing, the derived object state, the well-known metadata
//! attribute names and timestamp normalisation shared by the storage engine
//! and the object server.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier of a device (one mounted volume) on this node
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct DeviceName(String);

impl DeviceName {
    /// Create a new device name
    pub fn new(name: impl Into<String>) -> Result<Self, ObjectPathError> {
        let name = name.into();
        validate_component(&name, "device")?;
        Ok(Self(name))
    }

    /// Get the device name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DeviceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceName({:?})", self.0)
    }
}

/// Logical address of an object: account, container and object name
///
/// Maps deterministically to `/{account}/{container}/{object}` inside the
/// device's volume. Object names may contain `/`, which become intermediate
/// directories.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
    account: String,
    container: String,
    object: String,
    path: String,
}

impl ObjectPath {
    /// Create a new object path (validates every component)
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        object: impl Into<String>,
    ) -> Result<Self, ObjectPathError> {
        let account = account.into();
        let container = container.into();
        let object = object.into();

        validate_component(&account, "account")?;
        validate_component(&container, "container")?;
        if object.is_empty() {
            return Err(ObjectPathError::Empty("object"));
        }
        if object.len() > MAX_OBJECT_NAME_LEN {
            return Err(ObjectPathError::TooLong);
        }
        if object.contains('\0') {
            return Err(ObjectPathError::InvalidChar('\0'));
        }
        if object.starts_with('/') || object.ends_with('/') || object.contains("//") {
            return Err(ObjectPathError::EmptySegment);
        }
        if object.split('/').any(|s| s == "." || s == "..") {
            return Err(ObjectPathError::DotSegment);
        }

        let path = format!("/{account}/{container}/{object}");
        Ok(Self {
            account,
            container,
            object,
            path,
        })
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    #[must_use]
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Path of the object file inside the volume
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Directory that holds the object file
    #[must_use]
    pub fn parent_dir(&self) -> &str {
        // Always at least "/{account}/{container}", so a slash exists past index 0.
        let idx = self.path.rfind('/').unwrap_or(0);
        &self.path[..idx]
    }

    /// Final path segment of the object file
    #[must_use]
    pub fn file_name(&self) -> &str {
        let idx = self.path.rfind('/').map_or(0, |i| i + 1);
        &self.path[idx..]
    }
}

impl fmt::Debug for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPath({:?})", self.path)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Maximum object name length in bytes
pub const MAX_OBJECT_NAME_LEN: usize = 1024;

fn validate_component(value: &str, what: &'static str) -> Result<(), ObjectPathError> {
    if value.is_empty() {
        return Err(ObjectPathError::Empty(what));
    }
    if value == "." || value == ".." {
        return Err(ObjectPathError::DotSegment);
    }
    if let Some(c) = value.chars().find(|c| *c == '/' || *c == '\0') {
        return Err(ObjectPathError::InvalidChar(c));
    }
    Ok(())
}

/// Errors that can occur when building an object path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectPathError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("object name must be at most {MAX_OBJECT_NAME_LEN} bytes")]
    TooLong,
    #[error("path component contains invalid character: {0:?}")]
    InvalidChar(char),
    #[error("object name contains an empty segment")]
    EmptySegment,
    #[error("path segments cannot be '.' or '..'")]
    DotSegment,
}

/// Whether an object is present, derived from a stat of its path
///
/// Computed once per request and never cached across requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectState {
    NotExists,
    Consumable,
}

/// Well-known metadata attribute names
pub mod meta {
    /// Logical path of the object
    pub const NAME: &str = "name";
    /// Object creation timestamp
    pub const TIMESTAMP: &str = "X-Timestamp";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const ETAG: &str = "ETag";
    /// Modification time of the data file when its metadata was last written
    pub const PUT_MTIME: &str = "X-Object-PUT-Mtime";
    /// Prefix of caller-supplied user metadata
    pub const USER_META_PREFIX: &str = "X-Object-Meta-";

    pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
}

/// Format seconds since the epoch the way peers on the volume expect
///
/// Five decimal places, zero padded to sixteen characters.
#[must_use]
pub fn normalize_timestamp(secs: f64) -> String {
    format!("{secs:016.5}")
}

/// Normalised timestamp of a point in time
#[must_use]
pub fn timestamp_of(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    normalize_timestamp(secs)
}

/// Re-normalise a timestamp string read back from stored metadata
///
/// Returns `None` when the value is not a number.
#[must_use]
pub fn renormalize_timestamp(value: &str) -> Option<String> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(normalize_timestamp)
}
