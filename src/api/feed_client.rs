//! Upstream feed boundary.
//!
//! The engine never parses upstream wire formats itself. Everything it knows
//! about a live feed comes through [`FeedClient`]: resolve the currently active
//! feed for a channel, then fetch batches of raw events with an opaque cursor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::time::Duration;

/// Channel identifier: a channel id, an `@handle`, or a literal feed id.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Continuation token returned by the upstream after each fetch.
///
/// An empty cursor means "initial fetch".
#[derive(
    Debug, Clone, Default, PartialEq, Eq, derive_more::Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn initial() -> Self {
        Self(String::new())
    }

    pub fn is_initial(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One untyped upstream event. Only the normalizer looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(pub serde_json::Value);

impl From<serde_json::Value> for RawEvent {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    /// Raw events in upstream order
    pub events: Vec<RawEvent>,
    /// Cursor to pass unchanged into the next fetch
    pub next_cursor: Cursor,
    /// The upstream signalled that this feed has finished
    pub ended: bool,
    /// Delay the upstream asked for before the next fetch, if any
    pub poll_hint: Option<Duration>,
}

impl FetchedBatch {
    pub fn new(events: Vec<RawEvent>, next_cursor: Cursor) -> Self {
        Self {
            events,
            next_cursor,
            ended: false,
            poll_hint: None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The channel has no active feed right now
    #[error("No active feed found")]
    NotFound,
    #[error("Transient upstream error: {0}")]
    Transient(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Transient upstream error: {0}")]
    Transient(String),
    /// The feed finished; the cursor is no longer usable
    #[error("Feed ended")]
    Ended,
}

/// Capability to discover and read a live feed.
///
/// Implementations only report individual call failures. Retry, backoff and
/// feed rotation are handled by the session that owns the client.
#[async_trait]
pub trait FeedClient: Send + Sync + 'static {
    /// Handle to a discovered feed. Stale once the feed ends.
    type Handle: Clone + Debug + Display + Send + Sync + 'static;

    /// Resolve the currently active feed for a channel.
    async fn resolve(&self, channel: &ChannelId) -> Result<Self::Handle, ResolveError>;

    /// Fetch the next batch of raw events after `cursor`.
    async fn fetch_batch(
        &self,
        handle: &Self::Handle,
        cursor: &Cursor,
    ) -> Result<FetchedBatch, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_initial() {
        assert!(Cursor::initial().is_initial());
        assert!(Cursor::default().is_initial());
        assert!(!Cursor::from("tok1").is_initial());
    }

    #[test]
    fn test_channel_id_display() {
        let channel = ChannelId::new("@someone");
        assert_eq!(format!("{}", channel), "@someone");
        assert_eq!(channel.as_str(), "@someone");
    }

    #[test]
    fn test_raw_event_is_transparent() {
        let raw: RawEvent = serde_json::from_str(r#"{"id":"m1"}"#).unwrap();
        assert_eq!(raw.0["id"], "m1");
        assert_eq!(serde_json::to_string(&raw).unwrap(), r#"{"id":"m1"}"#);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ResolveError::NotFound.to_string(), "No active feed found");
        assert_eq!(FetchError::Ended.to_string(), "Feed ended");
        assert!(FetchError::Transient("timeout".into())
            .to_string()
            .contains("timeout"));
    }
}
