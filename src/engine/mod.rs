//! Live chat ingestion and fan-out engine.
//!
//! A [`SessionRegistry`] keeps one [`ChannelSession`] per channel. Each
//! session polls its feed through a [`FeedClient`](crate::api::feed_client::FeedClient),
//! normalizes and deduplicates the events and pushes ordered batches to every
//! attached [`Subscriber`].

pub mod backoff;
pub mod dedup;
pub mod models;
pub mod normalizer;
pub mod registry;
pub mod session;
pub mod subscriber;

pub use backoff::{BackoffConfig, BackoffDecision, BackoffPolicy};
pub use dedup::Deduplicator;
pub use models::{AuthorBadge, ChatMessage, MessageKind, MonetaryAnnotation, PaidTier, RichTextSegment};
pub use normalizer::{normalize, normalize_batch, EventKind};
pub use registry::{SessionHandle, SessionRegistry};
pub use session::{ChannelSession, SessionEnd, SessionState, SessionStatus};
pub use subscriber::{Subscriber, SubscriberEvent, SubscriberId};
