//! volstore Common - Shared types and utilities
//!
//! This crate provides the error taxonomy (and the classifier that maps raw
//! storage errors onto it), object addressing types and configuration used
//! by the storage engine and the object server.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result, StorageOp};
pub use types::*;
