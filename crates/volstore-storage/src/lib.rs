//! Volstore Storage - object semantics on mounted POSIX volumes
//!
//! This crate implements the storage side of the object server:
//! - Volume capability with POSIX and in-memory backends
//! - Device to volume registry
//! - Object metadata in chunked extended attributes
//! - Freshness checks against files changed outside the server
//! - Object lifecycle with atomic publication of writes

pub mod diskfile;
pub mod metadata;
pub mod registry;
pub mod volume;

// Re-exports
pub use diskfile::{DiskFile, DiskFileOptions, DiskFileState, ObjectFile};
pub use metadata::{Freshness, METADATA_CHUNK_SIZE, METADATA_KEY, ObjectMetadata, StaleReason};
pub use registry::{VolumeRegistry, VolumeRegistryBuilder};
pub use volume::{
    FileStat, MemoryFile, MemoryVolume, PosixFile, PosixVolume, Volume, VolumeFile, XattrTarget,
};
