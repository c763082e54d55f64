//! Per-channel session: subscriber set, status and the poll task.
//!
//! [`ChannelSession`] is the part shared with the outside world. Only the
//! subscriber set and the diagnostic fields live behind its lock. The feed
//! handle, cursor and dedup window belong to [`PollLoop`], which runs as the
//! session's single task and is the only code that touches them.

use crate::api::feed_client::{
    ChannelId, Cursor, FeedClient, FetchError, RawEvent, ResolveError,
};
use crate::config::EngineConfig;
use crate::engine::backoff::{BackoffDecision, BackoffPolicy};
use crate::engine::dedup::Deduplicator;
use crate::engine::models::ChatMessage;
use crate::engine::normalizer::normalize_batch;
use crate::engine::subscriber::{SubscriberEvent, SubscriberId, SubscriberSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

pub const STATUS_WAITING: &str = "Waiting for stream…";
pub const STATUS_CONNECTED: &str = "Connected";
pub const STATUS_RECONNECTING: &str = "Reconnecting…";
pub const STATUS_ROTATING: &str = "Stream ended, waiting for next live…";
pub const STATUS_ENDED: &str = "Stream ended";
pub const STATUS_STOPPED: &str = "Disconnected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Resolving,
    Polling,
    Rotating,
    BackingOff,
    Stopping,
    Ended,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopping | SessionState::Ended)
    }
}

/// Why a poll task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SessionEnd {
    /// Stopped from outside: idle teardown or registry shutdown
    #[display("stopped")]
    Stopped,
    /// No active feed and nobody left to wait for one
    #[display("no subscribers")]
    NoSubscribers,
    /// No active feed after the configured number of attempts
    #[display("feed not found")]
    NotFound,
}

impl SessionEnd {
    /// Last status line sent to subscribers still attached.
    pub fn status_text(&self) -> &'static str {
        match self {
            SessionEnd::Stopped => STATUS_STOPPED,
            SessionEnd::NoSubscribers | SessionEnd::NotFound => STATUS_ENDED,
        }
    }
}

/// Diagnostic snapshot of one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub channel_id: ChannelId,
    pub state: SessionState,
    pub subscriber_count: usize,
    pub batches_delivered: u64,
    pub consecutive_failures: u32,
    pub feed: Option<String>,
    pub last_status: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub idle_teardown_scheduled: bool,
}

#[derive(Debug)]
struct SessionInner {
    sinks: HashMap<SubscriberId, SubscriberSink>,
    /// false once the session has committed to stopping
    accepting: bool,
    state: SessionState,
    feed: Option<String>,
    consecutive_failures: u32,
    last_status: Option<String>,
    last_activity_at: DateTime<Utc>,
    idle_timer: Option<AbortHandle>,
}

#[derive(Debug)]
pub struct ChannelSession {
    channel_id: ChannelId,
    inner: Mutex<SessionInner>,
    shutdown: watch::Sender<bool>,
    batches_delivered: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSession {
    pub fn new(channel_id: ChannelId) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            channel_id,
            inner: Mutex::new(SessionInner {
                sinks: HashMap::new(),
                accepting: true,
                state: SessionState::Resolving,
                feed: None,
                consecutive_failures: 0,
                last_status: None,
                last_activity_at: Utc::now(),
                idle_timer: None,
            }),
            shutdown,
            batches_delivered: AtomicU64::new(0),
            task: Mutex::new(None),
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        SessionStatus {
            channel_id: self.channel_id.clone(),
            state: inner.state,
            subscriber_count: inner.sinks.len(),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            consecutive_failures: inner.consecutive_failures,
            feed: inner.feed.clone(),
            last_status: inner.last_status.clone(),
            last_activity_at: inner.last_activity_at,
            idle_teardown_scheduled: inner.idle_timer.is_some(),
        }
    }

    /// Add a subscriber. Fails once the session is stopping.
    ///
    /// A pending idle teardown is cancelled and the current status, if any,
    /// is sent to the new subscriber.
    pub fn try_add(&self, sink: SubscriberSink) -> bool {
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return false;
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
            tracing::debug!(
                "⏱️ [SESSION] Idle teardown cancelled for {}",
                self.channel_id
            );
        }
        if let Some(status) = inner.last_status.clone() {
            sink.push(SubscriberEvent::Status(status));
        }
        inner.sinks.insert(sink.id(), sink);
        inner.last_activity_at = Utc::now();
        true
    }

    /// Remove a subscriber and return how many remain.
    pub fn remove(&self, id: SubscriberId) -> usize {
        let mut inner = self.inner.lock();
        inner.sinks.remove(&id);
        inner.last_activity_at = Utc::now();
        inner.sinks.len()
    }

    /// Push one ordered batch to every live subscriber.
    ///
    /// Subscribers whose owner went away are pruned. Returns the number left.
    pub fn deliver(&self, messages: Vec<ChatMessage>) -> usize {
        let batch = SubscriberEvent::Batch(Arc::new(messages));
        let mut inner = self.inner.lock();
        inner.sinks.retain(|_, sink| sink.push(batch.clone()));
        inner.last_activity_at = Utc::now();
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        inner.sinks.len()
    }

    /// Drop subscribers whose owner went away. Returns the number left.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.sinks.retain(|_, sink| !sink.is_dead());
        inner.sinks.len()
    }

    /// Send a status line to every subscriber when it differs from the last one.
    pub fn notify_status(&self, text: &str) {
        let mut inner = self.inner.lock();
        if inner.last_status.as_deref() == Some(text) {
            return;
        }
        inner.last_status = Some(text.to_string());
        let event = SubscriberEvent::Status(text.to_string());
        inner.sinks.retain(|_, sink| sink.push(event.clone()));
    }

    pub fn set_state(&self, state: SessionState) {
        let mut inner = self.inner.lock();
        if inner.state != state && !inner.state.is_terminal() {
            tracing::debug!(
                "🔀 [SESSION] {} {} -> {}",
                self.channel_id,
                inner.state,
                state
            );
            inner.state = state;
        }
    }

    fn set_feed(&self, feed: Option<String>) {
        self.inner.lock().feed = feed;
    }

    fn set_consecutive_failures(&self, failures: u32) {
        self.inner.lock().consecutive_failures = failures;
    }

    /// Commit to stopping if nobody is attached.
    ///
    /// Subscribers dropped without detaching do not count. Checked and
    /// flipped under one lock so a concurrent attach either lands before (and
    /// keeps the session) or sees a closed session.
    pub fn stop_if_empty(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.sinks.retain(|_, sink| !sink.is_dead());
        if !inner.sinks.is_empty() || !inner.accepting {
            return false;
        }
        inner.accepting = false;
        inner.state = SessionState::Stopping;
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        drop(inner);
        self.shutdown.send_replace(true);
        true
    }

    /// Stop regardless of subscribers.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            inner.accepting = false;
            if inner.state != SessionState::Ended {
                inner.state = SessionState::Stopping;
            }
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
        }
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Start or restart the idle timer.
    pub fn reset_idle_timer(self: &Arc<Self>, grace: Duration) {
        let mut inner = self.inner.lock();
        if !inner.accepting || !inner.sinks.is_empty() {
            return;
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        inner.idle_timer = Some(self.spawn_idle_timer(grace));
    }

    /// Start the idle timer unless one is already running.
    pub fn ensure_idle_timer(self: &Arc<Self>, grace: Duration) {
        let mut inner = self.inner.lock();
        if !inner.accepting || !inner.sinks.is_empty() || inner.idle_timer.is_some() {
            return;
        }
        inner.idle_timer = Some(self.spawn_idle_timer(grace));
    }

    fn spawn_idle_timer(self: &Arc<Self>, grace: Duration) -> AbortHandle {
        tracing::debug!(
            "⏱️ [SESSION] No subscribers on {}, idle teardown in {:?}",
            self.channel_id,
            grace
        );
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(session) = session.upgrade() {
                if session.stop_if_empty() {
                    tracing::info!(
                        "💤 [SESSION] Idle grace elapsed, stopping {}",
                        session.channel_id
                    );
                }
            }
        })
        .abort_handle()
    }

    pub(crate) fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// Final transition: notify remaining subscribers and close them.
    fn finish(&self, end: SessionEnd) {
        let sinks: Vec<SubscriberSink> = {
            let mut inner = self.inner.lock();
            inner.accepting = false;
            inner.state = SessionState::Ended;
            inner.feed = None;
            if let Some(timer) = inner.idle_timer.take() {
                timer.abort();
            }
            inner.sinks.drain().map(|(_, sink)| sink).collect()
        };
        self.shutdown.send_replace(true);

        tracing::info!(
            "🏁 [SESSION] Session for {} ended ({}), {} subscriber(s) notified",
            self.channel_id,
            end,
            sinks.len()
        );
        for sink in sinks {
            sink.push(SubscriberEvent::Status(end.status_text().to_string()));
            sink.close();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveReason {
    Initial,
    /// The previous feed ended
    Rotation,
    /// Forced after too many consecutive transient failures
    Recovery,
}

#[derive(Debug, Clone, Copy)]
enum Next {
    Resolve(ResolveReason),
    Poll,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Resolve(ResolveReason),
    Poll,
    Wait { delay: Duration, then: Next },
    Finish(SessionEnd),
}

impl From<Next> for Phase {
    fn from(next: Next) -> Self {
        match next {
            Next::Resolve(reason) => Phase::Resolve(reason),
            Next::Poll => Phase::Poll,
        }
    }
}

/// The session's poll task.
pub struct PollLoop<C: FeedClient> {
    client: Arc<C>,
    session: Arc<ChannelSession>,
    config: EngineConfig,
    shutdown: watch::Receiver<bool>,
    feed: Option<C::Handle>,
    /// Feed abandoned by a forced re-resolution, compared against its successor
    abandoned_feed: Option<String>,
    cursor: Cursor,
    dedup: Deduplicator,
    backoff: BackoffPolicy,
}

impl<C: FeedClient> PollLoop<C> {
    pub fn new(client: Arc<C>, session: Arc<ChannelSession>, config: EngineConfig) -> Self {
        let shutdown = session.subscribe_shutdown();
        Self {
            dedup: Deduplicator::new(config.dedup_capacity),
            backoff: BackoffPolicy::new(config.backoff.clone()),
            client,
            session,
            config,
            shutdown,
            feed: None,
            abandoned_feed: None,
            cursor: Cursor::initial(),
        }
    }

    /// Drive the session until it stops. Consumes the loop so the cursor,
    /// feed handle and dedup window are released on return.
    pub async fn run(mut self) -> SessionEnd {
        tracing::info!(
            "🚀 [SESSION] Starting poll loop for {}",
            self.session.channel_id()
        );

        let mut phase = Phase::Resolve(ResolveReason::Initial);
        let end = loop {
            phase = match phase {
                Phase::Resolve(reason) => self.resolve(reason).await,
                Phase::Poll => self.poll().await,
                Phase::Wait { delay, then } => self.wait(delay, then).await,
                Phase::Finish(end) => break end,
            };
        };

        self.session.finish(end);
        end
    }

    async fn resolve(&mut self, reason: ResolveReason) -> Phase {
        let channel = self.session.channel_id().clone();
        self.session.set_state(match reason {
            ResolveReason::Rotation => SessionState::Rotating,
            _ => SessionState::Resolving,
        });

        let timeout = self.config.fetch_timeout();
        let client = Arc::clone(&self.client);
        let call = tokio::time::timeout(timeout, client.resolve(&channel));
        let result = match until_stopped(&mut self.shutdown, call).await {
            None => return Phase::Finish(SessionEnd::Stopped),
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(ResolveError::Transient(format!(
                "resolve timed out after {:?}",
                timeout
            ))),
        };

        match result {
            Ok(handle) => {
                tracing::info!(
                    "📡 [SESSION] Resolved feed {} for {} ({:?})",
                    handle,
                    channel,
                    reason
                );
                let feed = handle.to_string();
                if let Some(previous) = self.abandoned_feed.take() {
                    // 別の配信に切り替わった場合はIDの空間も変わる
                    if previous != feed {
                        tracing::debug!(
                            "🧹 [SESSION] Feed changed on {} ({} -> {}), clearing dedup window",
                            channel,
                            previous,
                            feed
                        );
                        self.dedup.clear();
                    }
                }
                self.session.set_feed(Some(feed));
                self.feed = Some(handle);
                self.cursor = Cursor::initial();
                self.backoff.reset();
                self.session.set_consecutive_failures(0);
                self.session.set_state(SessionState::Polling);
                self.session.notify_status(STATUS_CONNECTED);
                Phase::Poll
            }
            Err(ResolveError::NotFound) => {
                if self.session.stop_if_empty() {
                    tracing::info!(
                        "🔍 [SESSION] No active feed for {} and no subscribers left",
                        channel
                    );
                    return Phase::Finish(SessionEnd::NoSubscribers);
                }
                match self.backoff.on_not_found() {
                    Some(delay) => {
                        tracing::debug!(
                            "🔍 [SESSION] No active feed for {} (attempt {}), retrying in {:?}",
                            channel,
                            self.backoff.not_found_attempts(),
                            delay
                        );
                        self.session.notify_status(match reason {
                            ResolveReason::Rotation => STATUS_ROTATING,
                            _ => STATUS_WAITING,
                        });
                        self.back_off(delay, Next::Resolve(reason))
                    }
                    None => {
                        tracing::warn!(
                            "🔍 [SESSION] Giving up on {} after {} attempts without an active feed",
                            channel,
                            self.backoff.not_found_attempts() - 1
                        );
                        Phase::Finish(SessionEnd::NotFound)
                    }
                }
            }
            Err(ResolveError::Transient(e)) => {
                let delay = self.backoff.on_transient_failure().delay();
                tracing::warn!(
                    "⚠️ [SESSION] Resolve failed for {}: {} (retrying in {:?})",
                    channel,
                    e,
                    delay
                );
                self.session
                    .set_consecutive_failures(self.backoff.consecutive_failures());
                self.session.notify_status(STATUS_RECONNECTING);
                self.back_off(delay, Next::Resolve(reason))
            }
        }
    }

    async fn poll(&mut self) -> Phase {
        let Some(feed) = self.feed.clone() else {
            return Phase::Resolve(ResolveReason::Recovery);
        };

        let timeout = self.config.fetch_timeout();
        let client = Arc::clone(&self.client);
        let call = tokio::time::timeout(timeout, client.fetch_batch(&feed, &self.cursor));
        let result = match until_stopped(&mut self.shutdown, call).await {
            None => return Phase::Finish(SessionEnd::Stopped),
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(FetchError::Transient(format!(
                "fetch timed out after {:?}",
                timeout
            ))),
        };

        match result {
            Ok(batch) => {
                if self.backoff.consecutive_failures() > 0 {
                    self.backoff.reset();
                    self.session.set_consecutive_failures(0);
                }
                self.session.set_state(SessionState::Polling);
                self.session.notify_status(STATUS_CONNECTED);

                let messages = self.admit(&batch.events);
                self.cursor = batch.next_cursor;
                if !messages.is_empty() {
                    tracing::debug!(
                        "📨 [SESSION] Delivering {} message(s) on {}",
                        messages.len(),
                        self.session.channel_id()
                    );
                    self.session.deliver(messages);
                }

                if batch.ended {
                    return self.rotate();
                }

                let delay = match batch.poll_hint {
                    Some(hint) => hint.max(self.config.poll_interval()),
                    None => self.config.poll_interval(),
                };
                Phase::Wait {
                    delay,
                    then: Next::Poll,
                }
            }
            Err(FetchError::Ended) => self.rotate(),
            Err(FetchError::Transient(e)) => match self.backoff.on_transient_failure() {
                BackoffDecision::Retry(delay) => {
                    tracing::warn!(
                        "⚠️ [SESSION] Fetch failed for {}: {} (retrying in {:?})",
                        self.session.channel_id(),
                        e,
                        delay
                    );
                    self.session
                        .set_consecutive_failures(self.backoff.consecutive_failures());
                    self.session.notify_status(STATUS_RECONNECTING);
                    self.back_off(delay, Next::Poll)
                }
                BackoffDecision::Exhausted(delay) => {
                    tracing::warn!(
                        "🔁 [SESSION] Too many consecutive failures on {} ({}), re-resolving feed",
                        self.session.channel_id(),
                        e
                    );
                    self.abandoned_feed = self.feed.take().map(|feed| feed.to_string());
                    self.cursor = Cursor::initial();
                    self.session.set_feed(None);
                    self.session.notify_status(STATUS_RECONNECTING);
                    self.back_off(delay, Next::Resolve(ResolveReason::Recovery))
                }
            },
        }
    }

    /// Normalize and deduplicate in upstream order.
    fn admit(&mut self, events: &[RawEvent]) -> Vec<ChatMessage> {
        let received_at = Utc::now();
        normalize_batch(events, received_at)
            .into_iter()
            .filter(|message| self.dedup.check_and_insert(&message.id))
            .collect()
    }

    fn rotate(&mut self) -> Phase {
        tracing::info!(
            "🔄 [SESSION] Feed ended on {}, looking for the next one",
            self.session.channel_id()
        );
        // 配信ごとにメッセージIDの空間が異なる
        self.dedup.clear();
        self.feed = None;
        self.abandoned_feed = None;
        self.cursor = Cursor::initial();
        self.session.set_feed(None);
        self.backoff.reset();
        Phase::Resolve(ResolveReason::Rotation)
    }

    fn back_off(&mut self, delay: Duration, then: Next) -> Phase {
        self.session.set_state(SessionState::BackingOff);
        Phase::Wait { delay, then }
    }

    async fn wait(&mut self, delay: Duration, then: Next) -> Phase {
        if self.session.prune() == 0 {
            self.session.ensure_idle_timer(self.config.idle_grace());
        }
        match until_stopped(&mut self.shutdown, tokio::time::sleep(delay)).await {
            Some(()) => then.into(),
            None => Phase::Finish(SessionEnd::Stopped),
        }
    }

    #[cfg(test)]
    fn dedup_len(&self) -> usize {
        self.dedup.len()
    }
}

/// Run `fut` unless the session is told to stop first.
async fn until_stopped<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stopped(shutdown) => None,
        output = fut => Some(output),
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
