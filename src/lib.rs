pub mod api;
pub mod config;
pub mod engine;
pub mod io;
pub mod utils;

// Re-export the upstream boundary
pub use api::feed_client::{
    ChannelId, Cursor, FeedClient, FetchError, FetchedBatch, RawEvent, ResolveError,
};
pub use api::innertube::{InnerTubeClient, InnerTubeError};

// Re-export the engine surface
pub use engine::{
    ChatMessage, SessionHandle, SessionRegistry, SessionState, SessionStatus, Subscriber,
    SubscriberEvent,
};

// Re-export I/O utilities for convenience
pub use io::{NdjsonError, RecordedBatch, ReplayFeedClient};

pub use config::{AppConfig, ConfigManager, EngineConfig, LogConfig};
