//! In-memory volume
//!
//! Behaves like a small POSIX filesystem: rename moves an inode, handles
//! keep working after their path is unlinked, attributes have a per-value
//! size ceiling. A capacity limit and per-operation fault injection make it
//! possible to exercise out-of-space and I/O failure paths without a real
//! device.

use super::{FileStat, Volume, VolumeFile, split_path};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::SystemTime;
use volstore_common::StorageOp;
use volstore_common::error::missing_attribute;

/// Largest single attribute value accepted, matching common filesystems
pub const DEFAULT_XATTR_LIMIT: usize = 65536;

#[derive(Debug)]
struct Inode {
    data: Vec<u8>,
    reserved: u64,
    xattrs: HashMap<String, Vec<u8>>,
    modified: SystemTime,
    handles: usize,
}

impl Inode {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            reserved: 0,
            xattrs: HashMap::new(),
            modified: SystemTime::now(),
            handles: 0,
        }
    }

    fn footprint(&self) -> u64 {
        (self.data.len() as u64).max(self.reserved)
    }

    fn stat(&self) -> FileStat {
        FileStat {
            size: self.data.len() as u64,
            modified: self.modified,
            is_dir: false,
        }
    }
}

#[derive(Debug)]
struct State {
    next_ino: u64,
    inodes: HashMap<u64, Inode>,
    files: BTreeMap<String, u64>,
    dirs: BTreeSet<String>,
    capacity: Option<u64>,
    xattr_limit: usize,
    faults: HashMap<StorageOp, i32>,
}

impl State {
    fn check(&self, op: StorageOp) -> io::Result<()> {
        match self.faults.get(&op) {
            Some(errno) => Err(io::Error::from_raw_os_error(*errno)),
            None => Ok(()),
        }
    }

    fn lookup(&self, path: &str) -> io::Result<u64> {
        match self.files.get(path) {
            Some(ino) => Ok(*ino),
            None if self.dirs.contains(path) => Err(io::Error::from_raw_os_error(libc::EISDIR)),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn inode(&self, ino: u64) -> io::Result<&Inode> {
        self.inodes
            .get(&ino)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn inode_mut(&mut self, ino: u64) -> io::Result<&mut Inode> {
        self.inodes
            .get_mut(&ino)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn require_parent(&self, path: &str) -> io::Result<()> {
        let (parent, _) = split_path(path);
        if self.dirs.contains(parent) {
            Ok(())
        } else if self.files.contains_key(parent) {
            Err(io::Error::from_raw_os_error(libc::ENOTDIR))
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    /// Fail with ENOSPC if growing `ino` to `footprint` bytes would overflow
    fn reserve(&self, ino: u64, footprint: u64) -> io::Result<()> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };
        let used: u64 = self
            .inodes
            .iter()
            .filter(|(i, _)| **i != ino)
            .map(|(_, inode)| inode.footprint())
            .sum();
        if used + footprint > capacity {
            return Err(io::Error::from_raw_os_error(libc::ENOSPC));
        }
        Ok(())
    }

    fn set_xattr(&mut self, ino: u64, name: &str, value: &[u8]) -> io::Result<()> {
        self.check(StorageOp::SetXattr)?;
        if value.len() > self.xattr_limit {
            return Err(io::Error::from_raw_os_error(libc::E2BIG));
        }
        self.inode_mut(ino)?
            .xattrs
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn get_xattr(&self, ino: u64, name: &str) -> io::Result<Vec<u8>> {
        self.check(StorageOp::GetXattr)?;
        self.inode(ino)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(missing_attribute)
    }

    /// Drop an inode once no path and no open handle refers to it
    fn release(&mut self, ino: u64) {
        let open = self.inodes.get(&ino).is_some_and(|inode| inode.handles > 0);
        if !open && !self.files.values().any(|i| *i == ino) {
            self.inodes.remove(&ino);
        }
    }

    fn attach(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.handles += 1;
        }
    }
}

/// Volume held entirely in memory
///
/// Cloning yields another handle onto the same filesystem.
#[derive(Clone)]
pub struct MemoryVolume {
    state: Arc<Mutex<State>>,
}

impl MemoryVolume {
    /// Create an empty volume containing only the root directory
    #[must_use]
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(State {
                next_ino: 1,
                inodes: HashMap::new(),
                files: BTreeMap::new(),
                dirs,
                capacity: None,
                xattr_limit: DEFAULT_XATTR_LIMIT,
                faults: HashMap::new(),
            })),
        }
    }

    /// Create a volume that reports ENOSPC once `bytes` are in use
    #[must_use]
    pub fn with_capacity(bytes: u64) -> Self {
        let volume = Self::new();
        volume.state.lock().capacity = Some(bytes);
        volume
    }

    /// Make every call of `op` fail with `errno` until cleared
    pub fn inject_fault(&self, op: StorageOp, errno: i32) {
        self.state.lock().faults.insert(op, errno);
    }

    pub fn clear_fault(&self, op: StorageOp) {
        self.state.lock().faults.remove(&op);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Bytes currently held by files, counting preallocated space
    #[must_use]
    pub fn used(&self) -> u64 {
        self.state.lock().inodes.values().map(Inode::footprint).sum()
    }

    /// Replace a file's contents out of band, creating it and its parents
    ///
    /// Updates the modification time but leaves attributes untouched, like
    /// an in-place rewrite through another filesystem client.
    pub fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        let (parent, _) = split_path(path);
        insert_dirs(&mut state, parent)?;
        let ino = match state.files.get(path) {
            Some(ino) => *ino,
            None => {
                let ino = state.next_ino;
                state.next_ino += 1;
                state.inodes.insert(ino, Inode::new());
                state.files.insert(path.to_string(), ino);
                ino
            }
        };
        let inode = state.inode_mut(ino)?;
        inode.data = data.to_vec();
        inode.modified = SystemTime::now();
        Ok(())
    }

    /// Contents of a file, if it exists
    #[must_use]
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.files.get(path)?;
        state.inodes.get(ino).map(|inode| inode.data.clone())
    }

    /// Set a file's modification time
    pub fn set_modified(&self, path: &str, modified: SystemTime) -> io::Result<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        state.inode_mut(ino)?.modified = modified;
        Ok(())
    }

    /// Names of the attributes set on a file
    pub fn xattr_names(&self, path: &str) -> io::Result<Vec<String>> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        let mut names: Vec<String> = state.inode(ino)?.xattrs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

impl Default for MemoryVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryVolume")
            .field("files", &state.files.len())
            .field("dirs", &state.dirs.len())
            .field("capacity", &state.capacity)
            .finish()
    }
}

fn insert_dirs(state: &mut State, path: &str) -> io::Result<()> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        if state.files.contains_key(&current) {
            return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        state.dirs.insert(current.clone());
    }
    Ok(())
}

impl Volume for MemoryVolume {
    fn stat(&self, path: &str) -> io::Result<FileStat> {
        let state = self.state.lock();
        state.check(StorageOp::Stat)?;
        if state.dirs.contains(path) {
            return Ok(FileStat {
                size: 0,
                modified: SystemTime::UNIX_EPOCH,
                is_dir: true,
            });
        }
        let ino = state.lookup(path)?;
        Ok(state.inode(ino)?.stat())
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn VolumeFile>> {
        let mut state = self.state.lock();
        state.check(StorageOp::Open)?;
        let ino = state.lookup(path)?;
        state.attach(ino);
        Ok(Box::new(MemoryFile::new(self.state.clone(), ino, path)))
    }

    fn create_exclusive(&self, path: &str) -> io::Result<Box<dyn VolumeFile>> {
        let mut state = self.state.lock();
        state.check(StorageOp::CreateStaging)?;
        state.require_parent(path)?;
        if state.files.contains_key(path) || state.dirs.contains(path) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        let ino = state.next_ino;
        state.next_ino += 1;
        state.inodes.insert(ino, Inode::new());
        state.files.insert(path.to_string(), ino);
        state.attach(ino);
        Ok(Box::new(MemoryFile::new(self.state.clone(), ino, path)))
    }

    fn mkdir_all(&self, path: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check(StorageOp::MakeDirs)?;
        insert_dirs(&mut state, path)
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check(StorageOp::Rename)?;
        let ino = state.lookup(from)?;
        state.require_parent(to)?;
        if state.dirs.contains(to) {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        state.files.remove(from);
        if let Some(replaced) = state.files.insert(to.to_string(), ino) {
            state.release(replaced);
        }
        Ok(())
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check(StorageOp::Unlink)?;
        let ino = state.lookup(path)?;
        state.files.remove(path);
        state.release(ino);
        Ok(())
    }

    fn get_xattr(&self, path: &str, name: &str) -> io::Result<Vec<u8>> {
        let state = self.state.lock();
        let ino = state.lookup(path)?;
        state.get_xattr(ino, name)
    }

    fn set_xattr(&self, path: &str, name: &str, value: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        let ino = state.lookup(path)?;
        state.set_xattr(ino, name, value)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<String>> {
        let state = self.state.lock();
        state.check(StorageOp::ListDir)?;
        if !state.dirs.contains(path) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let children = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.as_str() != "/" && split_path(p).0 == path)
            .map(|p| split_path(p).1.to_string())
            .collect::<BTreeSet<_>>();
        Ok(children.into_iter().collect())
    }
}

/// Open file on a [`MemoryVolume`]
pub struct MemoryFile {
    state: Arc<Mutex<State>>,
    ino: u64,
    pos: u64,
    name: String,
}

impl MemoryFile {
    fn new(state: Arc<Mutex<State>>, ino: u64, name: &str) -> Self {
        Self {
            state,
            ino,
            pos: 0,
            name: name.to_string(),
        }
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(inode) = state.inodes.get_mut(&self.ino) {
            inode.handles = inode.handles.saturating_sub(1);
        }
        state.release(self.ino);
    }
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state.lock();
        state.check(StorageOp::Read)?;
        let data = &state.inode(self.ino)?.data;
        let start = usize::try_from(self.pos).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.check(StorageOp::Write)?;
        let end = self.pos + buf.len() as u64;
        let footprint = state.inode(self.ino)?.reserved.max(end);
        state.reserve(self.ino, footprint)?;

        let inode = state.inode_mut(self.ino)?;
        let start = usize::try_from(self.pos)
            .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
        if inode.data.len() < start + buf.len() {
            inode.data.resize(start + buf.len(), 0);
        }
        inode.data[start..start + buf.len()].copy_from_slice(buf);
        inode.modified = SystemTime::now();
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let state = self.state.lock();
        state.check(StorageOp::Seek)?;
        let len = state.inode(self.ino)?.data.len() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => len + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
        };
        self.pos = u64::try_from(target)
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        Ok(self.pos)
    }
}

impl VolumeFile for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn stat(&self) -> io::Result<FileStat> {
        let state = self.state.lock();
        state.check(StorageOp::Stat)?;
        Ok(state.inode(self.ino)?.stat())
    }

    fn sync(&mut self) -> io::Result<()> {
        let state = self.state.lock();
        state.check(StorageOp::Sync)?;
        state.inode(self.ino).map(|_| ())
    }

    fn get_xattr(&self, name: &str) -> io::Result<Vec<u8>> {
        self.state.lock().get_xattr(self.ino, name)
    }

    fn set_xattr(&self, name: &str, value: &[u8]) -> io::Result<()> {
        self.state.lock().set_xattr(self.ino, name, value)
    }

    fn preallocate(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check(StorageOp::Preallocate)?;
        let footprint = state.inode(self.ino)?.footprint().max(offset + len);
        state.reserve(self.ino, footprint)?;
        state.inode_mut(self.ino)?.reserved = footprint;
        Ok(())
    }
}
