//! Volume capability
//!
//! A volume is a mounted POSIX-like filesystem that stores object data and
//! extended attributes. Everything above this module talks to storage only
//! through [`Volume`] (path-based calls) and [`VolumeFile`] (handle-based
//! calls). Both return raw `std::io::Error`s; translating them into
//! outcomes is left to [`volstore_common::Error::classify`].
//!
//! Paths are volume-relative and start with `/`.

mod memory;
mod posix;

pub use memory::{MemoryFile, MemoryVolume};
pub use posix::{PosixFile, PosixVolume};

use std::fmt;
use std::io::{self, Read, Seek, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::time::SystemTime;
use volstore_common::timestamp_of;

/// Size and modification time of a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

impl FileStat {
    /// Modification time, normalised like stored timestamps
    #[must_use]
    pub fn mtime_timestamp(&self) -> String {
        timestamp_of(self.modified)
    }
}

/// Path-based operations on a mounted volume
///
/// Implementations must tolerate concurrent calls on independent paths.
pub trait Volume: Send + Sync + fmt::Debug {
    fn stat(&self, path: &str) -> io::Result<FileStat>;

    /// Open an existing file for reading
    fn open(&self, path: &str) -> io::Result<Box<dyn VolumeFile>>;

    /// Create a new file for reading and writing, failing if it exists
    fn create_exclusive(&self, path: &str) -> io::Result<Box<dyn VolumeFile>>;

    /// Create a directory and any missing ancestors
    fn mkdir_all(&self, path: &str) -> io::Result<()>;

    /// Atomically replace `to` with `from`
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    fn unlink(&self, path: &str) -> io::Result<()>;

    fn get_xattr(&self, path: &str, name: &str) -> io::Result<Vec<u8>>;

    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()>;

    /// Names of the entries directly under a directory
    fn list_dir(&self, path: &str) -> io::Result<Vec<String>>;
}

/// An open file on a volume
pub trait VolumeFile: Read + Write + Seek + Send {
    /// Volume-relative path the file was opened with
    fn name(&self) -> &str;

    fn stat(&self) -> io::Result<FileStat>;

    /// Flush written data to stable storage
    fn sync(&mut self) -> io::Result<()>;

    fn get_xattr(&self, name: &str) -> io::Result<Vec<u8>>;

    fn set_xattr(&self, name: &str, value: &[u8]) -> io::Result<()>;

    /// Reserve space for `len` bytes starting at `offset`
    fn preallocate(&mut self, _offset: u64, _len: u64) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    /// Raw descriptor, when the handle is backed by an OS file
    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}

/// Where an extended attribute call is directed
///
/// Each variant carries what it needs to perform the call itself.
pub enum XattrTarget<'a> {
    /// A path resolved through a volume
    Path {
        volume: &'a dyn Volume,
        path: &'a str,
    },
    /// An open volume handle
    File(&'a dyn VolumeFile),
    /// A raw OS file descriptor
    Descriptor(BorrowedFd<'a>),
}

impl<'a> XattrTarget<'a> {
    pub fn path(volume: &'a dyn Volume, path: &'a str) -> Self {
        Self::Path { volume, path }
    }

    pub fn get(&self, name: &str) -> io::Result<Vec<u8>> {
        match self {
            Self::Path { volume, path } => volume.get_xattr(path, name),
            Self::File(file) => file.get_xattr(name),
            Self::Descriptor(fd) => posix::fget_xattr(fd.as_raw_fd(), name),
        }
    }

    pub fn set(&self, name: &str, value: &[u8]) -> io::Result<()> {
        match self {
            Self::Path { volume, path } => volume.set_xattr(path, name, value),
            Self::File(file) => file.set_xattr(name, value),
            Self::Descriptor(fd) => posix::fset_xattr(fd.as_raw_fd(), name, value),
        }
    }
}

impl fmt::Display for XattrTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path { path, .. } => f.write_str(path),
            Self::File(file) => f.write_str(file.name()),
            Self::Descriptor(fd) => write!(f, "fd:{}", fd.as_raw_fd()),
        }
    }
}

/// Split a volume path into its parent directory and final segment
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}
