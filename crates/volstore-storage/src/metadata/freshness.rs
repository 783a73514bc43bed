//! Freshness verification
//!
//! Stored metadata can fall behind the file when the volume is written by
//! clients that bypass the object server. A size mismatch always means
//! stale. When the record also carries the last-write timestamp, a
//! same-size rewrite is caught by comparing it with the live mtime.

use super::ObjectMetadata;
use crate::volume::FileStat;
use std::fmt;
use volstore_common::renormalize_timestamp;

/// Result of checking a record against the live file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}

/// Why a record was judged stale
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StaleReason {
    /// Recorded length absent, unparseable or different from the file size
    SizeMismatch { recorded: Option<u64>, actual: u64 },
    /// Recorded last-write time differs from the file's mtime
    MtimeMismatch { recorded: String, actual: String },
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch {
                recorded: Some(recorded),
                actual,
            } => write!(f, "size {recorded} recorded, file has {actual}"),
            Self::SizeMismatch {
                recorded: None,
                actual,
            } => write!(f, "no usable size recorded, file has {actual}"),
            Self::MtimeMismatch { recorded, actual } => {
                write!(f, "mtime {recorded} recorded, file has {actual}")
            }
        }
    }
}

/// Check whether `metadata` still describes the file behind `stat`
#[must_use]
pub fn verify(stat: &FileStat, metadata: &ObjectMetadata) -> Freshness {
    let recorded = metadata.content_length();
    if recorded != Some(stat.size) {
        return Freshness::Stale(StaleReason::SizeMismatch {
            recorded,
            actual: stat.size,
        });
    }

    // Without a recorded write time only the size can be checked.
    let Some(put_mtime) = metadata.put_mtime() else {
        return Freshness::Fresh;
    };

    let actual = stat.mtime_timestamp();
    match renormalize_timestamp(put_mtime) {
        Some(recorded) if recorded == actual => Freshness::Fresh,
        Some(recorded) => Freshness::Stale(StaleReason::MtimeMismatch { recorded, actual }),
        None => Freshness::Stale(StaleReason::MtimeMismatch {
            recorded: put_mtime.to_string(),
            actual,
        }),
    }
}
