//! YouTube InnerTube live chat adapter.
//!
//! Implements [`FeedClient`] on top of the watch page and the
//! `youtubei/v1/live_chat/get_live_chat` endpoint. All knowledge about the
//! upstream payload shape and continuation variants stays in this module.

use crate::api::feed_client::{
    ChannelId, Cursor, FeedClient, FetchError, FetchedBatch, RawEvent, ResolveError,
};
use crate::api::youtube::{self, ApiKey, ClientVersion, Continuation, VideoId};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const API_ORIGIN: &str = "https://www.youtube.com";

#[derive(thiserror::Error, Debug)]
pub enum InnerTubeError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unexpected HTTP status: {0}")]
    Status(StatusCode),
    #[error("Missing field in watch page: {0}")]
    MissingField(&'static str),
}

/// A resolved live stream: everything needed to call `get_live_chat`.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{video_id}")]
pub struct LiveFeed {
    pub video_id: VideoId,
    pub api_key: ApiKey,
    pub client_version: ClientVersion,
    pub gl: String,
    pub hl: String,
    /// Continuation embedded in the watch page, used for the initial fetch
    pub initial_continuation: Continuation,
}

#[derive(Debug, Clone)]
pub struct InnerTubeClient {
    http_client: reqwest::Client,
}

impl Default for InnerTubeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InnerTubeClient {
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
        }
    }

    async fn fetch_watch_page(&self, url: &str) -> Result<String, InnerTubeError> {
        tracing::info!("🌐 [INNERTUBE] Fetching live page: {}", url);

        let response = self
            .http_client
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        tracing::debug!("📄 [INNERTUBE] Live page status: {}", status);
        if !status.is_success() {
            return Err(InnerTubeError::Status(status));
        }

        let html = response.text().await?;
        tracing::debug!("📄 [INNERTUBE] HTML response length: {} chars", html.len());
        Ok(html)
    }

    async fn post_get_live_chat(
        &self,
        feed: &LiveFeed,
        continuation: &str,
    ) -> Result<Value, InnerTubeError> {
        let url = format!(
            "{}/youtubei/v1/live_chat/get_live_chat?key={}",
            API_ORIGIN, feed.api_key
        );

        let payload = serde_json::json!({
            "context": {
                "client": {
                    "clientName": "WEB",
                    "clientVersion": feed.client_version.to_string(),
                    "gl": feed.gl,
                    "hl": feed.hl,
                }
            },
            "continuation": continuation,
        });

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(InnerTubeError::Status(status));
        }

        let text = response.text().await?;
        if tracing::level_enabled!(tracing::Level::DEBUG) {
            tracing::debug!("📄 [INNERTUBE] Response text length: {} chars", text.len());
        }

        Ok(serde_json::from_str(&text)?)
    }
}

/// Build a [`LiveFeed`] from a watch page.
///
/// A page without a canonical watch URL or without a chat continuation has no
/// live chat right now; a replay is not live either.
pub fn parse_watch_page(html: &str) -> Result<LiveFeed, InnerTubeError> {
    let video_id = youtube::extract_video_id(html).ok_or(InnerTubeError::MissingField("video_id"))?;
    if youtube::extract_replay(html) {
        return Err(InnerTubeError::MissingField("live continuation"));
    }
    let api_key = youtube::extract_api_key(html).ok_or(InnerTubeError::MissingField("api_key"))?;
    let client_version = youtube::extract_client_version(html)
        .ok_or(InnerTubeError::MissingField("client_version"))?;
    let initial_continuation = youtube::extract_continuation(html)
        .ok_or(InnerTubeError::MissingField("continuation"))?;

    Ok(LiveFeed {
        video_id,
        api_key,
        client_version,
        gl: youtube::extract_gl(html).unwrap_or_else(|| "US".to_string()),
        hl: youtube::extract_hl(html).unwrap_or_else(|| "en".to_string()),
        initial_continuation,
    })
}

/// Continuation variants in the order YouTube prefers them.
const CONTINUATION_KEYS: [&str; 3] = [
    "invalidationContinuationData",
    "timedContinuationData",
    "reloadContinuationData",
];

/// Turn a `get_live_chat` response into a [`FetchedBatch`].
///
/// Only `addChatItemAction` items are forwarded; ticker and removal actions
/// are not chat messages. A response without `liveChatContinuation` or
/// without any next continuation means the chat has closed.
pub fn parse_live_chat_response(response: &Value, current: &Cursor) -> FetchedBatch {
    let Some(live_chat) = response
        .get("continuationContents")
        .and_then(|v| v.get("liveChatContinuation"))
    else {
        return FetchedBatch {
            events: Vec::new(),
            next_cursor: current.clone(),
            ended: true,
            poll_hint: None,
        };
    };

    let events = live_chat
        .get("actions")
        .and_then(Value::as_array)
        .map(|actions| {
            actions
                .iter()
                .filter_map(|action| action.get("addChatItemAction")?.get("item"))
                .map(|item| RawEvent(item.clone()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let continuation_data = live_chat
        .get("continuations")
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .and_then(|v| CONTINUATION_KEYS.iter().find_map(|key| v.get(*key)));

    let next = continuation_data
        .and_then(|v| v.get("continuation"))
        .and_then(Value::as_str)
        .map(|s| Cursor(s.to_string()));

    let poll_hint = continuation_data
        .and_then(|v| v.get("timeoutMs"))
        .and_then(Value::as_u64)
        .map(Duration::from_millis);

    match next {
        Some(next_cursor) => FetchedBatch {
            events,
            next_cursor,
            ended: false,
            poll_hint,
        },
        None => FetchedBatch {
            events,
            next_cursor: current.clone(),
            ended: true,
            poll_hint: None,
        },
    }
}

/// Map a failed watch page lookup onto [`ResolveError`].
///
/// A missing page or a page without live chat data means nothing is live.
pub fn resolve_error(error: InnerTubeError) -> ResolveError {
    match error {
        InnerTubeError::Status(StatusCode::NOT_FOUND) | InnerTubeError::MissingField(_) => {
            ResolveError::NotFound
        }
        e => ResolveError::Transient(e.to_string()),
    }
}

/// Map a failed `get_live_chat` call onto [`FetchError`].
///
/// YouTube answers 403/404 once the chat of a finished stream is closed.
pub fn fetch_error(error: InnerTubeError) -> FetchError {
    match error {
        InnerTubeError::Status(status)
            if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND =>
        {
            FetchError::Ended
        }
        e => FetchError::Transient(e.to_string()),
    }
}

#[async_trait]
impl FeedClient for InnerTubeClient {
    type Handle = LiveFeed;

    async fn resolve(&self, channel: &ChannelId) -> Result<LiveFeed, ResolveError> {
        let url = youtube::live_page_url(channel);

        let html = self.fetch_watch_page(&url).await.map_err(|e| {
            let error = resolve_error(e);
            if let ResolveError::Transient(reason) = &error {
                tracing::warn!("❌ [INNERTUBE] Failed to fetch live page: {}", reason);
            }
            error
        })?;

        match parse_watch_page(&html) {
            Ok(feed) => {
                tracing::info!("🎬 [INNERTUBE] Resolved {} → video {}", channel, feed.video_id);
                Ok(feed)
            }
            Err(e) => {
                tracing::debug!("🔍 [INNERTUBE] No live chat for {}: {}", channel, e);
                Err(resolve_error(e))
            }
        }
    }

    async fn fetch_batch(
        &self,
        handle: &LiveFeed,
        cursor: &Cursor,
    ) -> Result<FetchedBatch, FetchError> {
        let continuation = if cursor.is_initial() {
            handle.initial_continuation.0.as_str()
        } else {
            cursor.0.as_str()
        };

        match self.post_get_live_chat(handle, continuation).await {
            Ok(response) => Ok(parse_live_chat_response(&response, cursor)),
            Err(e) => match fetch_error(e) {
                FetchError::Ended => {
                    tracing::info!("🔴 [INNERTUBE] Live chat closed for {}", handle);
                    Err(FetchError::Ended)
                }
                FetchError::Transient(reason) => {
                    tracing::warn!("❌ [INNERTUBE] get_live_chat failed: {}", reason);
                    Err(FetchError::Transient(reason))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATCH_PAGE: &str = r#"
        <link rel="canonical" href="https://www.youtube.com/watch?v=abcdefghijk">
        <script>ytcfg.set({"INNERTUBE_API_KEY": "test_api_key", "INNERTUBE_CLIENT_VERSION": "2.20240101.01.00", "hl": "ja", "gl": "JP"});</script>
        <script>var data = {"liveChatRenderer": {"continuations": [{"reloadContinuationData": {"continuation": "initial_token"}}]}};</script>
    "#;

    #[test]
    fn test_parse_watch_page() {
        let feed = parse_watch_page(WATCH_PAGE).unwrap();
        assert_eq!(feed.video_id.0, "abcdefghijk");
        assert_eq!(feed.api_key.to_string(), "test_api_key");
        assert_eq!(feed.client_version.to_string(), "2.20240101.01.00");
        assert_eq!(feed.gl, "JP");
        assert_eq!(feed.hl, "ja");
        assert_eq!(feed.initial_continuation.0, "initial_token");
        assert_eq!(feed.to_string(), "abcdefghijk");
    }

    #[test]
    fn test_parse_watch_page_not_live() {
        let html = r#"<link rel="canonical" href="https://www.youtube.com/@someone">"#;
        assert!(matches!(
            parse_watch_page(html),
            Err(InnerTubeError::MissingField("video_id"))
        ));
    }

    #[test]
    fn test_parse_watch_page_replay_is_not_live() {
        let html = format!(r#"{} "isReplay": true"#, WATCH_PAGE);
        assert!(parse_watch_page(&html).is_err());
    }

    #[test]
    fn test_parse_live_chat_response_collects_chat_items_in_order() {
        let response = serde_json::json!({
            "continuationContents": {
                "liveChatContinuation": {
                    "continuations": [
                        {"timedContinuationData": {"continuation": "next_token", "timeoutMs": 5000}}
                    ],
                    "actions": [
                        {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {"id": "a"}}}},
                        {"addLiveChatTickerItemAction": {"item": {}}},
                        {"removeChatItemAction": {"targetItemId": "x"}},
                        {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {"id": "b"}}}}
                    ]
                }
            }
        });

        let batch = parse_live_chat_response(&response, &Cursor::from("prev"));
        assert_eq!(batch.events.len(), 2);
        assert_eq!(
            batch.events[0].0["liveChatTextMessageRenderer"]["id"],
            "a"
        );
        assert_eq!(
            batch.events[1].0["liveChatTextMessageRenderer"]["id"],
            "b"
        );
        assert_eq!(batch.next_cursor, Cursor::from("next_token"));
        assert_eq!(batch.poll_hint, Some(Duration::from_millis(5000)));
        assert!(!batch.ended);
    }

    #[test]
    fn test_parse_live_chat_response_prefers_invalidation_continuation() {
        let response = serde_json::json!({
            "continuationContents": {
                "liveChatContinuation": {
                    "continuations": [{
                        "invalidationContinuationData": {"continuation": "inv"},
                        "timedContinuationData": {"continuation": "timed"}
                    }]
                }
            }
        });

        let batch = parse_live_chat_response(&response, &Cursor::initial());
        assert_eq!(batch.next_cursor, Cursor::from("inv"));
        assert!(batch.events.is_empty());
    }

    #[test]
    fn test_parse_live_chat_response_without_contents_is_ended() {
        let response = serde_json::json!({"responseContext": {}});
        let batch = parse_live_chat_response(&response, &Cursor::from("prev"));
        assert!(batch.ended);
        assert_eq!(batch.next_cursor, Cursor::from("prev"));
    }

    #[test]
    fn test_parse_live_chat_response_without_continuation_is_ended() {
        let response = serde_json::json!({
            "continuationContents": {
                "liveChatContinuation": {
                    "actions": [
                        {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {"id": "last"}}}}
                    ]
                }
            }
        });
        let batch = parse_live_chat_response(&response, &Cursor::from("prev"));
        assert!(batch.ended);
        assert_eq!(batch.events.len(), 1);
    }

    #[test]
    fn test_inner_tube_error_display() {
        let error = InnerTubeError::MissingField("api_key");
        assert!(error.to_string().contains("api_key"));
    }

    fn serialization_error() -> InnerTubeError {
        serde_json::from_str::<Value>("{not json")
            .unwrap_err()
            .into()
    }

    #[test]
    fn test_resolve_error_mapping() {
        assert_eq!(
            resolve_error(InnerTubeError::Status(StatusCode::NOT_FOUND)),
            ResolveError::NotFound
        );
        // ライブチャットのないページ
        assert_eq!(
            resolve_error(InnerTubeError::MissingField("continuation")),
            ResolveError::NotFound
        );
        assert_eq!(
            resolve_error(parse_watch_page("<html></html>").unwrap_err()),
            ResolveError::NotFound
        );
        assert!(matches!(
            resolve_error(InnerTubeError::Status(StatusCode::INTERNAL_SERVER_ERROR)),
            ResolveError::Transient(reason) if reason.contains("500")
        ));
        assert!(matches!(
            resolve_error(InnerTubeError::Status(StatusCode::FORBIDDEN)),
            ResolveError::Transient(_)
        ));
        assert!(matches!(
            resolve_error(serialization_error()),
            ResolveError::Transient(_)
        ));
    }

    #[test]
    fn test_fetch_error_mapping() {
        assert_eq!(
            fetch_error(InnerTubeError::Status(StatusCode::FORBIDDEN)),
            FetchError::Ended
        );
        assert_eq!(
            fetch_error(InnerTubeError::Status(StatusCode::NOT_FOUND)),
            FetchError::Ended
        );
        assert!(matches!(
            fetch_error(InnerTubeError::Status(StatusCode::SERVICE_UNAVAILABLE)),
            FetchError::Transient(reason) if reason.contains("503")
        ));
        assert!(matches!(
            fetch_error(InnerTubeError::Status(StatusCode::TOO_MANY_REQUESTS)),
            FetchError::Transient(_)
        ));
        assert!(matches!(
            fetch_error(serialization_error()),
            FetchError::Transient(_)
        ));
    }
}
