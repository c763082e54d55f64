//! 録画済み NDJSON の再生テスト
//!
//! ReplayFeedClient をレジストリ経由で動かし、InnerTube 形式のイベントが
//! 正規化されて購読者に届くことを確認する。

use livechat_relay::engine::models::{AuthorBadge, MessageKind, PaidTier, RichTextSegment};
use livechat_relay::engine::session::STATUS_ENDED;
use livechat_relay::{
    ChatMessage, EngineConfig, RecordedBatch, ReplayFeedClient, SessionRegistry, SubscriberEvent,
};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn replay_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poll_interval_ms = 100;
    config.backoff.max_not_found_attempts = 1;
    config.backoff.not_found_delay_ms = 0;
    config
}

fn recording() -> NamedTempFile {
    let lines = [
        json!({
            "events": [
                {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {
                    "id": "t1",
                    "authorName": {"simpleText": "Alice"},
                    "authorBadges": [{"liveChatAuthorBadgeRenderer": {"icon": {"iconType": "MODERATOR"}}}],
                    "message": {"runs": [{"text": "hi "}, {"emoji": {
                        "emojiId": "wave",
                        "image": {
                            "thumbnails": [{"url": "https://yt3.example/wave.png"}],
                            "accessibility": {"accessibilityData": {"label": "wave"}}
                        }
                    }}]}
                }}}},
                {"addChatItemAction": {"item": {"liveChatViewerEngagementMessageRenderer": {"id": "sys"}}}}
            ],
            "next_cursor": "tok1"
        }),
        json!({
            "events": [
                {"addChatItemAction": {"item": {"liveChatTextMessageRenderer": {
                    "id": "t1",
                    "authorName": {"simpleText": "Alice"},
                    "message": {"runs": [{"text": "hi "}]}
                }}}},
                {"addChatItemAction": {"item": {"liveChatPaidMessageRenderer": {
                    "id": "p1",
                    "authorName": {"simpleText": "Bob"},
                    "purchaseAmountText": {"simpleText": "¥500"},
                    "headerBackgroundColor": 4278237396u64,
                    "message": {"runs": [{"text": "thanks"}]}
                }}}}
            ],
            "next_cursor": "tok2",
            "poll_hint_ms": 50
        }),
    ];

    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file
}

async fn collect(subscriber: &livechat_relay::Subscriber) -> (Vec<ChatMessage>, Vec<String>) {
    let mut messages = Vec::new();
    let mut statuses = Vec::new();
    while let Some(event) = subscriber.recv().await {
        match event {
            SubscriberEvent::Batch(batch) => messages.extend(batch.iter().cloned()),
            SubscriberEvent::Status(status) => statuses.push(status),
        }
    }
    (messages, statuses)
}

#[tokio::test(start_paused = true)]
async fn test_replay_file_through_registry() {
    let file = recording();
    let client = Arc::new(ReplayFeedClient::from_file(file.path()).unwrap());
    let registry = SessionRegistry::new(Arc::clone(&client), replay_config());

    let subscriber = registry.subscriber();
    registry.attach("@replay", &subscriber);

    let (messages, statuses) = tokio::time::timeout(Duration::from_secs(10), collect(&subscriber))
        .await
        .expect("replay should finish");

    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "p1"]);

    let text = &messages[0];
    assert_eq!(text.kind, MessageKind::Text);
    assert_eq!(text.author_name, "Alice");
    assert!(text.has_badge(AuthorBadge::Moderator));
    assert_eq!(
        text.rich_text,
        vec![
            RichTextSegment::text("hi "),
            RichTextSegment::image("https://yt3.example/wave.png", "wave"),
        ]
    );

    let paid = &messages[1];
    assert_eq!(paid.kind, MessageKind::Paid);
    let monetary = paid.monetary_annotation.as_ref().unwrap();
    assert_eq!(monetary.amount, "¥500");
    assert_eq!(monetary.tier, PaidTier::LightBlue);

    assert_eq!(statuses.last().map(String::as_str), Some(STATUS_ENDED));
    assert_eq!(client.remaining(), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recorded_end_signal_rotates_within_recording() {
    let client = Arc::new(ReplayFeedClient::from_batches(vec![
        RecordedBatch {
            events: vec![json!({"id": "a1", "text": "first live"}).into()],
            ended: true,
            ..Default::default()
        },
        RecordedBatch {
            events: vec![json!({"id": "a1", "text": "second live"}).into()],
            next_cursor: "tok".into(),
            ..Default::default()
        },
    ]));
    let registry = SessionRegistry::new(client, replay_config());
    let subscriber = registry.subscriber();
    registry.attach("C1", &subscriber);

    let (messages, _) = tokio::time::timeout(Duration::from_secs(10), collect(&subscriber))
        .await
        .expect("replay should finish");

    // 配信が切り替わると同じIDでも再び届く
    let texts: Vec<String> = messages.iter().map(|m| m.plain_text()).collect();
    assert_eq!(texts, vec!["first live", "second live"]);
}

#[test]
fn test_messages_serialize_losslessly() {
    let file = recording();
    let batches = livechat_relay::io::parse_recorded_batches(file.path()).unwrap();
    let messages =
        livechat_relay::engine::normalize_batch(&batches[1].events, chrono::Utc::now());

    for message in messages {
        let wire = serde_json::to_string(&message).unwrap();
        let back: ChatMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, message);
    }
}
