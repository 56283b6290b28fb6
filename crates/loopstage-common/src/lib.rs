//! # loopstage-common
//!
//! Shared types for the loopstage remediation pipeline:
//! - Error taxonomy for planning, provisioning, and migration
//! - Byte-quantity parsing and display

#![warn(missing_docs)]

pub mod bytes;
pub mod error;

pub use bytes::ByteSize;
pub use error::{LoopstageError, LoopstageResult};
