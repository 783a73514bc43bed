//! Metadata serialisation and chunked attribute I/O
//!
//! The record is pickled (protocol 2) so other readers of the volume can
//! load it unchanged. Values larger than one attribute slot are split
//! across `user.swift.metadata`, `user.swift.metadata1`, ...

use super::ObjectMetadata;
use crate::volume::XattrTarget;
use serde_pickle::{DeOptions, HashableValue, SerOptions, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::debug;
use volstore_common::error::is_missing_attribute;
use volstore_common::{Error, Result, StorageOp};

/// Name of the first metadata attribute
pub const METADATA_KEY: &str = "user.swift.metadata";

/// Largest value stored in a single attribute
pub const METADATA_CHUNK_SIZE: usize = 65536;

/// Attribute holding chunk `index`
#[must_use]
pub fn attribute_name(index: usize) -> Cow<'static, str> {
    if index == 0 {
        Cow::Borrowed(METADATA_KEY)
    } else {
        Cow::Owned(format!("{METADATA_KEY}{index}"))
    }
}

/// Serialise a record
pub fn encode(metadata: &ObjectMetadata) -> Result<Vec<u8>> {
    serde_pickle::to_vec(metadata, SerOptions::new().proto_v2())
        .map_err(|e| Error::internal(format!("failed to pickle metadata: {e}")))
}

/// Deserialise a record
///
/// Both unicode and byte strings are accepted for keys and values, since
/// older writers store byte strings. Bytes after the end of the pickle are
/// ignored; they are left over when a shorter record overwrites a longer one.
pub fn decode(bytes: &[u8]) -> Result<ObjectMetadata> {
    let mut de = serde_pickle::Deserializer::new(bytes, DeOptions::new().decode_strings());
    let value = de
        .deserialize_value()
        .map_err(|e| Error::corrupt(format!("unpickling failed: {e}")))?;

    let Value::Dict(dict) = value else {
        return Err(Error::corrupt("top-level value is not a dict"));
    };

    let mut map = HashMap::with_capacity(dict.len());
    for (key, value) in dict {
        let key = match key {
            HashableValue::String(s) => s,
            HashableValue::Bytes(b) => utf8(b, "key")?,
            other => return Err(Error::corrupt(format!("non-string key {other:?}"))),
        };
        let value = match value {
            Value::String(s) => s,
            Value::Bytes(b) => utf8(b, "value")?,
            other => {
                return Err(Error::corrupt(format!(
                    "non-string value for {key}: {other:?}"
                )));
            }
        };
        map.insert(key, value);
    }
    Ok(ObjectMetadata::from(map))
}

fn utf8(bytes: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::corrupt(format!("{what} is not valid UTF-8")))
}

/// Store `bytes` across as many attributes as needed, lowest index first
///
/// Empty input writes nothing.
pub fn write_chunked(target: &XattrTarget<'_>, bytes: &[u8]) -> Result<()> {
    for (index, chunk) in bytes.chunks(METADATA_CHUNK_SIZE).enumerate() {
        let name = attribute_name(index);
        target
            .set(&name, chunk)
            .map_err(|e| Error::classify(StorageOp::SetXattr, target.to_string(), e))?;
    }
    Ok(())
}

/// Read back the concatenated attribute chunks
///
/// A missing first chunk is reported as `NotFound`. Continuation chunks are
/// read until one is absent or empty; any other failure is an error.
pub fn read_chunked(target: &XattrTarget<'_>) -> Result<Vec<u8>> {
    let mut bytes = target
        .get(METADATA_KEY)
        .map_err(|e| Error::classify(StorageOp::GetXattr, target.to_string(), e))?;
    if bytes.len() < METADATA_CHUNK_SIZE {
        return Ok(bytes);
    }

    for index in 1.. {
        let chunk = match target.get(&attribute_name(index)) {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => chunk,
            Err(e) if is_missing_attribute(&e) => break,
            Err(e) => return Err(Error::classify(StorageOp::GetXattr, target.to_string(), e)),
        };
        bytes.extend_from_slice(&chunk);
    }
    debug!("Read {} metadata bytes from {}", bytes.len(), target);
    Ok(bytes)
}

/// Load and decode the record stored on `target`
pub fn read_metadata(target: &XattrTarget<'_>) -> Result<ObjectMetadata> {
    decode(&read_chunked(target)?)
}

/// Encode and store a record on `target`
pub fn write_metadata(target: &XattrTarget<'_>, metadata: &ObjectMetadata) -> Result<()> {
    write_chunked(target, &encode(metadata)?)
}
