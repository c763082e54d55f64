//! NDJSON (Newline Delimited JSON) file processing utilities.
//!
//! Besides the generic line reader this module provides [`ReplayFeedClient`],
//! a [`FeedClient`] that plays back recorded batches from an NDJSON file.

use crate::api::feed_client::{
    ChannelId, Cursor, FeedClient, FetchError, FetchedBatch, RawEvent, ResolveError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Error types for file I/O and parsing operations.
#[derive(Error, Debug)]
pub enum NdjsonError {
    /// I/O error when reading files
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error at line {line}: {source}")]
    JsonParse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid file format
    #[error("Invalid file format: {reason}")]
    InvalidFormat { reason: String },

    /// Empty or invalid data
    #[error("No valid data found: {context}")]
    NoData { context: String },
}

impl NdjsonError {
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            reason: reason.into(),
        }
    }

    pub fn no_data(context: impl Into<String>) -> Self {
        Self::NoData {
            context: context.into(),
        }
    }
}

/// Parse NDJSON from any reader, skipping blank lines.
///
/// Every entry passes through `validate_entry` when one is given.
pub fn parse_ndjson_reader<T, R, F>(
    reader: R,
    validate_entry: Option<F>,
) -> Result<Vec<T>, NdjsonError>
where
    T: for<'de> Deserialize<'de>,
    R: BufRead,
    F: Fn(&T) -> Result<(), NdjsonError>,
{
    let mut entries = Vec::new();

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;

        // Skip empty lines
        if line.trim().is_empty() {
            continue;
        }

        let entry: T = serde_json::from_str(&line).map_err(|e| NdjsonError::JsonParse {
            line: line_number + 1,
            source: e,
        })?;

        if let Some(ref validator) = validate_entry {
            validator(&entry)?;
        }

        entries.push(entry);
    }

    Ok(entries)
}

/// Parse an NDJSON file. An empty file is an error.
pub fn parse_ndjson_file_generic<T, F>(
    path: impl AsRef<Path>,
    validate_entry: Option<F>,
) -> Result<Vec<T>, NdjsonError>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(&T) -> Result<(), NdjsonError>,
{
    let path = path.as_ref();
    let file = File::open(path)?;
    let entries = parse_ndjson_reader(BufReader::new(file), validate_entry)?;

    if entries.is_empty() {
        return Err(NdjsonError::no_data(format!(
            "No valid entries found in file '{}'",
            path.display()
        )));
    }

    Ok(entries)
}

/// One recorded upstream response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedBatch {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub next_cursor: Cursor,
    #[serde(default)]
    pub ended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_hint_ms: Option<u64>,
}

impl From<RecordedBatch> for FetchedBatch {
    fn from(recorded: RecordedBatch) -> Self {
        FetchedBatch {
            events: recorded.events,
            next_cursor: recorded.next_cursor,
            ended: recorded.ended,
            poll_hint: recorded.poll_hint_ms.map(Duration::from_millis),
        }
    }
}

/// Read recorded batches; every line must contain an `events` array.
pub fn parse_recorded_batches(path: impl AsRef<Path>) -> Result<Vec<RecordedBatch>, NdjsonError> {
    parse_ndjson_file_generic(
        path,
        Some(|value: &serde_json::Value| {
            if value.get("events").map(|e| e.is_array()).unwrap_or(false) {
                Ok(())
            } else {
                Err(NdjsonError::invalid_format("line without an events array"))
            }
        }),
    )?
    .into_iter()
    .enumerate()
    .map(|(index, value)| {
        serde_json::from_value(value)
            .map_err(|e| NdjsonError::invalid_format(format!("batch {}: {}", index + 1, e)))
    })
    .collect()
}

/// Plays back recorded batches as a single feed.
///
/// The first `resolve` finds the feed; once the batches run out the feed
/// reports `Ended` and later resolves report `NotFound`.
#[derive(Debug)]
pub struct ReplayFeedClient {
    batches: Mutex<VecDeque<RecordedBatch>>,
    resolved: AtomicBool,
}

impl ReplayFeedClient {
    pub fn from_batches(batches: Vec<RecordedBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            resolved: AtomicBool::new(false),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NdjsonError> {
        let batches = parse_recorded_batches(path)?;
        tracing::info!("📼 [REPLAY] Loaded {} recorded batch(es)", batches.len());
        Ok(Self::from_batches(batches))
    }

    pub fn remaining(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl FeedClient for ReplayFeedClient {
    type Handle = String;

    async fn resolve(&self, channel: &ChannelId) -> Result<String, ResolveError> {
        if self.resolved.swap(true, Ordering::SeqCst) && self.remaining() == 0 {
            return Err(ResolveError::NotFound);
        }
        Ok(format!("replay:{}", channel))
    }

    async fn fetch_batch(&self, _handle: &String, _cursor: &Cursor) -> Result<FetchedBatch, FetchError> {
        match self.batches.lock().pop_front() {
            Some(batch) => Ok(batch.into()),
            None => Err(FetchError::Ended),
        }
    }
}
