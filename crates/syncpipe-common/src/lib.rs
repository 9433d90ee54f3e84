//! Syncpipe Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the syncpipe workspace.
//!
//! # Overview
//!
//! - **Types**: the record/batch data model every pipeline stage operates on
//! - **Checksums**: canonical content hashing used for idempotency and cache keys
//! - **Clock**: injectable time source so scheduling stays a pure function of `now`
//! - **Logging**: centralized `tracing` subscriber setup
//!
//! # Example
//!
//! ```
//! use syncpipe_common::types::{DataBatch, DataRecord, Value};
//! use syncpipe_common::checksum::content_hash;
//!
//! let record = DataRecord::new("row-1").with_field("name", Value::from("Ada"));
//! let batch = DataBatch::new("crm", 0, chrono::Utc::now(), vec![record]);
//! let hash = content_hash(&batch.records).unwrap();
//! assert_eq!(hash.len(), 64);
//! ```

pub mod checksum;
pub mod clock;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::{DataBatch, DataRecord, FieldType, Value};
