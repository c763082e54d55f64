//! I/O utilities for file processing and data handling.
//!
//! This module provides utilities for reading NDJSON files and replaying
//! recorded live chat batches.

pub mod ndjson;

// Re-export commonly used types and functions
pub use ndjson::{
    parse_ndjson_file_generic, parse_recorded_batches, NdjsonError, RecordedBatch,
    ReplayFeedClient,
};
