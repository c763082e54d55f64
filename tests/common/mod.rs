//! テスト用の共通ヘルパー
#![allow(dead_code)]

use async_trait::async_trait;
use livechat_relay::engine::session::SessionState;
use livechat_relay::{
    ChannelId, ChatMessage, Cursor, EngineConfig, FeedClient, FetchError, FetchedBatch, RawEvent,
    ResolveError, SessionRegistry, Subscriber, SubscriberEvent,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 台本どおりに応答する FeedClient
///
/// resolve の台本が尽きると NotFound、fetch の台本が尽きると
/// 同じカーソルの空バッチを返す。
#[derive(Default)]
pub struct ScriptedFeedClient {
    resolves: Mutex<VecDeque<Result<String, ResolveError>>>,
    fetches: Mutex<VecDeque<Result<FetchedBatch, FetchError>>>,
    resolve_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    /// (handle, cursor, 呼び出し時刻)
    fetch_log: Mutex<Vec<(String, Cursor, Instant)>>,
    hang_fetches: AtomicBool,
}

impl ScriptedFeedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_resolve(&self, result: Result<&str, ResolveError>) {
        self.resolves.lock().push_back(result.map(str::to_string));
    }

    pub fn push_fetch(&self, result: Result<FetchedBatch, FetchError>) {
        self.fetches.lock().push_back(result);
    }

    /// 以降の fetch を応答しないまま保留する
    pub fn hang_fetches(&self) {
        self.hang_fetches.store(true, Ordering::SeqCst);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn fetched_cursors(&self) -> Vec<String> {
        self.fetch_log
            .lock()
            .iter()
            .map(|(_, cursor, _)| cursor.0.clone())
            .collect()
    }

    pub fn fetched_handles(&self) -> Vec<String> {
        self.fetch_log
            .lock()
            .iter()
            .map(|(handle, _, _)| handle.clone())
            .collect()
    }

    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetch_log.lock().iter().map(|(_, _, at)| *at).collect()
    }
}

#[async_trait]
impl FeedClient for ScriptedFeedClient {
    type Handle = String;

    async fn resolve(&self, _channel: &ChannelId) -> Result<String, ResolveError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.resolves
            .lock()
            .pop_front()
            .unwrap_or(Err(ResolveError::NotFound))
    }

    async fn fetch_batch(
        &self,
        handle: &String,
        cursor: &Cursor,
    ) -> Result<FetchedBatch, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_log
            .lock()
            .push((handle.clone(), cursor.clone(), Instant::now()));

        if self.hang_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let next = self.fetches.lock().pop_front();
        next.unwrap_or_else(|| Ok(FetchedBatch::new(vec![], cursor.clone())))
    }
}

/// `{id, text}` 形式の最小イベント
pub fn plain(id: &str, text: &str) -> RawEvent {
    RawEvent(serde_json::json!({ "id": id, "text": text }))
}

pub fn batch(events: Vec<RawEvent>, next_cursor: &str) -> Result<FetchedBatch, FetchError> {
    Ok(FetchedBatch::new(events, Cursor::from(next_cursor)))
}

pub fn ended_batch(events: Vec<RawEvent>) -> Result<FetchedBatch, FetchError> {
    Ok(FetchedBatch {
        ended: true,
        ..FetchedBatch::new(events, Cursor::initial())
    })
}

pub fn registry(
    client: &Arc<ScriptedFeedClient>,
    config: EngineConfig,
) -> SessionRegistry<ScriptedFeedClient> {
    SessionRegistry::new(Arc::clone(client), config)
}

/// 次のバッチを待つ（ステータスは読み飛ばす）。閉じられたら None
pub async fn next_batch(subscriber: &Subscriber) -> Option<Arc<Vec<ChatMessage>>> {
    loop {
        match subscriber.recv().await? {
            SubscriberEvent::Batch(batch) => return Some(batch),
            SubscriberEvent::Status(_) => continue,
        }
    }
}

/// 期限付きで次のバッチを待つ
pub async fn next_batch_within(
    subscriber: &Subscriber,
    limit: Duration,
) -> Option<Arc<Vec<ChatMessage>>> {
    tokio::time::timeout(limit, next_batch(subscriber))
        .await
        .ok()
        .flatten()
}

/// キューに溜まっているイベントを全部取り出す
pub fn drain(subscriber: &Subscriber) -> (Vec<Arc<Vec<ChatMessage>>>, Vec<String>) {
    let mut batches = Vec::new();
    let mut statuses = Vec::new();
    while let Some(event) = subscriber.try_recv() {
        match event {
            SubscriberEvent::Batch(batch) => batches.push(batch),
            SubscriberEvent::Status(status) => statuses.push(status),
        }
    }
    (batches, statuses)
}

pub fn ids(batch: &[ChatMessage]) -> Vec<&str> {
    batch.iter().map(|m| m.id.as_str()).collect()
}

pub fn state_of(
    registry: &SessionRegistry<ScriptedFeedClient>,
    channel: &str,
) -> Option<SessionState> {
    registry
        .status(&ChannelId::from(channel))
        .map(|status| status.state)
}

pub fn to_json(message: &ChatMessage) -> Value {
    serde_json::to_value(message).unwrap()
}
