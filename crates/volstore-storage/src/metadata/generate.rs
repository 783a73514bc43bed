//! Rebuild metadata from file content

use super::ObjectMetadata;
use crate::volume::{FileStat, VolumeFile};
use std::io::ErrorKind;
use volstore_common::{Error, Result, StorageOp, meta};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Synthesize a record for an object whose metadata is missing or stale
///
/// Hashes the handle from its current position to the end. Size and both
/// timestamps come from `stat`, not from the bytes read.
pub fn generate(file: &mut dyn VolumeFile, stat: &FileStat, name: &str) -> Result<ObjectMetadata> {
    let mut hasher = md5::Context::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.consume(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::classify(StorageOp::Read, file.name(), e)),
        }
    }

    let mtime = stat.mtime_timestamp();
    let mut metadata = ObjectMetadata::new();
    metadata.insert(meta::NAME, name);
    metadata.insert(meta::TIMESTAMP, mtime.clone());
    metadata.insert(meta::PUT_MTIME, mtime);
    metadata.insert(meta::CONTENT_TYPE, meta::DEFAULT_CONTENT_TYPE);
    metadata.insert(meta::CONTENT_LENGTH, stat.size.to_string());
    metadata.insert(meta::ETAG, format!("{:x}", hasher.compute()));
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{MemoryVolume, Volume};
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_generate_from_content() {
        let volume = MemoryVolume::new();
        volume.write_file("/a/c/o", b"hello world").unwrap();
        volume
            .set_modified("/a/c/o", UNIX_EPOCH + Duration::from_millis(1_700_000_000_250))
            .unwrap();

        let mut file = volume.open("/a/c/o").unwrap();
        let stat = file.stat().unwrap();
        let md = generate(file.as_mut(), &stat, "/a/c/o").unwrap();

        assert_eq!(md.get(meta::NAME), Some("/a/c/o"));
        assert_eq!(md.etag(), Some("5eb63bbbe01eeed093cb22bb8f5acdc3"));
        assert_eq!(md.content_length(), Some(11));
        assert_eq!(md.content_type(), Some("application/octet-stream"));
        assert_eq!(md.timestamp(), Some("1700000000.25000"));
        assert_eq!(md.put_mtime(), Some("1700000000.25000"));
    }

    #[test]
    fn test_generate_empty_object() {
        let volume = MemoryVolume::new();
        volume.write_file("/a/c/empty", b"").unwrap();
        let mut file = volume.open("/a/c/empty").unwrap();
        let stat = file.stat().unwrap();

        let md = generate(file.as_mut(), &stat, "/a/c/empty").unwrap();
        assert_eq!(md.etag(), Some("d41d8cd98f00b204e9800998ecf8427e"));
        assert_eq!(md.content_length(), Some(0));
    }

    #[test]
    fn test_generate_spans_buffers() {
        use rand::RngCore;

        let mut data = vec![0u8; READ_BUFFER_SIZE * 3 + 17];
        rand::thread_rng().fill_bytes(&mut data);
        let volume = MemoryVolume::new();
        volume.write_file("/a/c/big", &data).unwrap();

        let mut file = volume.open("/a/c/big").unwrap();
        let stat = file.stat().unwrap();
        let md = generate(file.as_mut(), &stat, "/a/c/big").unwrap();
        assert_eq!(md.etag(), Some(format!("{:x}", md5::compute(&data)).as_str()));
    }

    #[test]
    fn test_read_failure_classified() {
        let volume = MemoryVolume::new();
        volume.write_file("/a/c/o", b"data").unwrap();
        let mut file = volume.open("/a/c/o").unwrap();
        let stat = file.stat().unwrap();

        volume.inject_fault(StorageOp::Read, libc::EIO);
        let err = generate(file.as_mut(), &stat, "/a/c/o").unwrap_err();
        assert!(matches!(err, Error::Storage { op: StorageOp::Read, .. }));
    }
}
