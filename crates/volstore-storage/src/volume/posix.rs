//! POSIX volume backed by a mounted directory tree
//!
//! File operations go through `std::fs`; extended attributes and space
//! preallocation go straight to libc since std has no API for them:
//! - Linux: `getxattr`/`fgetxattr` family and `fallocate`
//! - macOS: the same xattr calls with position/options arguments, no
//!   preallocation

use super::{FileStat, Volume, VolumeFile};
use std::ffi::CString;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::info;
use volstore_common::{Error, Result};

/// Volume rooted at a mount point
#[derive(Debug)]
pub struct PosixVolume {
    root: PathBuf,
}

impl PosixVolume {
    /// Attach to an already-mounted volume
    pub fn mount(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let meta = fs::metadata(&root).map_err(|e| {
            Error::Configuration(format!("volume root {}: {}", root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(Error::Configuration(format!(
                "volume root {} is not a directory",
                root.display()
            )));
        }
        info!("Volume mounted at {}", root.display());
        Ok(Self { root })
    }

    /// Mount point of this volume
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Volume for PosixVolume {
    fn stat(&self, path: &str) -> io::Result<FileStat> {
        stat_from(&fs::metadata(self.resolve(path))?)
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn VolumeFile>> {
        let file = File::open(self.resolve(path))?;
        Ok(Box::new(PosixFile::new(file, path)))
    }

    fn create_exclusive(&self, path: &str) -> io::Result<Box<dyn VolumeFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.resolve(path))?;
        Ok(Box::new(PosixFile::new(file, path)))
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(self.resolve(path))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn get_xattr(&self, path: &str, name: &str) -> io::Result<Vec<u8>> {
        let path = path_cstring(&self.resolve(path))?;
        let name = name_cstring(name)?;
        read_xattr(|buf, len| unsafe { sys::getxattr(path.as_ptr(), name.as_ptr(), buf, len) })
    }

    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()> {
        let path = path_cstring(&self.resolve(path))?;
        let name = name_cstring(name)?;
        let ret = unsafe {
            sys::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Open file on a [`PosixVolume`]
#[derive(Debug)]
pub struct PosixFile {
    file: File,
    name: String,
}

impl PosixFile {
    fn new(file: File, name: &str) -> Self {
        Self {
            file,
            name: name.to_string(),
        }
    }
}

impl Read for PosixFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PosixFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for PosixFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl VolumeFile for PosixFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn stat(&self) -> io::Result<FileStat> {
        stat_from(&self.file.metadata()?)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn get_xattr(&self, name: &str) -> io::Result<Vec<u8>> {
        fget_xattr(self.file.as_raw_fd(), name)
    }

    fn set_xattr(&self, name: &str, value: &[u8]) -> io::Result<()> {
        fset_xattr(self.file.as_raw_fd(), name, value)
    }

    fn preallocate(&mut self, offset: u64, len: u64) -> io::Result<()> {
        sys::preallocate(self.file.as_raw_fd(), offset, len)
    }

    fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        Some(self.file.as_fd())
    }
}

fn stat_from(meta: &fs::Metadata) -> io::Result<FileStat> {
    Ok(FileStat {
        size: meta.len(),
        modified: meta.modified()?,
        is_dir: meta.is_dir(),
    })
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn name_cstring(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "attribute name contains NUL"))
}

/// Read an attribute through a size probe followed by the real read
///
/// Retries when the attribute grows between the two calls.
fn read_xattr(
    mut call: impl FnMut(*mut libc::c_void, usize) -> libc::ssize_t,
) -> io::Result<Vec<u8>> {
    loop {
        let size = call(std::ptr::null_mut(), 0);
        if size < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf = vec![0u8; size as usize];
        if buf.is_empty() {
            return Ok(buf);
        }
        let read = call(buf.as_mut_ptr().cast(), buf.len());
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ERANGE) {
                continue;
            }
            return Err(err);
        }
        buf.truncate(read as usize);
        return Ok(buf);
    }
}

pub(crate) fn fget_xattr(fd: RawFd, name: &str) -> io::Result<Vec<u8>> {
    let name = name_cstring(name)?;
    read_xattr(|buf, len| unsafe { sys::fgetxattr(fd, name.as_ptr(), buf, len) })
}

pub(crate) fn fset_xattr(fd: RawFd, name: &str, value: &[u8]) -> io::Result<()> {
    let name = name_cstring(name)?;
    let ret = unsafe { sys::fsetxattr(fd, name.as_ptr(), value.as_ptr().cast(), value.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod sys {
    use libc::{c_char, c_int, c_void, size_t, ssize_t};
    use std::io;
    use std::os::fd::RawFd;

    pub unsafe fn getxattr(
        path: *const c_char,
        name: *const c_char,
        value: *mut c_void,
        size: size_t,
    ) -> ssize_t {
        unsafe { libc::getxattr(path, name, value, size) }
    }

    pub unsafe fn fgetxattr(
        fd: RawFd,
        name: *const c_char,
        value: *mut c_void,
        size: size_t,
    ) -> ssize_t {
        unsafe { libc::fgetxattr(fd, name, value, size) }
    }

    pub unsafe fn setxattr(
        path: *const c_char,
        name: *const c_char,
        value: *const c_void,
        size: size_t,
    ) -> c_int {
        unsafe { libc::setxattr(path, name, value, size, 0) }
    }

    pub unsafe fn fsetxattr(
        fd: RawFd,
        name: *const c_char,
        value: *const c_void,
        size: size_t,
    ) -> c_int {
        unsafe { libc::fsetxattr(fd, name, value, size, 0) }
    }

    pub fn preallocate(fd: RawFd, offset: u64, len: u64) -> io::Result<()> {
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
        let len = libc::off_t::try_from(len)
            .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
        // Reserve blocks without changing the visible size.
        let ret = unsafe { libc::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, offset, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use libc::{c_char, c_int, c_void, size_t, ssize_t};
    use std::io;
    use std::os::fd::RawFd;

    pub unsafe fn getxattr(
        path: *const c_char,
        name: *const c_char,
        value: *mut c_void,
        size: size_t,
    ) -> ssize_t {
        unsafe { libc::getxattr(path, name, value, size, 0, 0) }
    }

    pub unsafe fn fgetxattr(
        fd: RawFd,
        name: *const c_char,
        value: *mut c_void,
        size: size_t,
    ) -> ssize_t {
        unsafe { libc::fgetxattr(fd, name, value, size, 0, 0) }
    }

    pub unsafe fn setxattr(
        path: *const c_char,
        name: *const c_char,
        value: *const c_void,
        size: size_t,
    ) -> c_int {
        unsafe { libc::setxattr(path, name, value, size, 0, 0) }
    }

    pub unsafe fn fsetxattr(
        fd: RawFd,
        name: *const c_char,
        value: *const c_void,
        size: size_t,
    ) -> c_int {
        unsafe { libc::fsetxattr(fd, name, value, size, 0, 0) }
    }

    pub fn preallocate(_fd: RawFd, _offset: u64, _len: u64) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}
