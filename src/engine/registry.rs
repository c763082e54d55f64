//! Process-wide map of channel sessions.
//!
//! The map lock is only held for bookkeeping: lookups, inserts, removals and
//! spawning the poll task. Upstream I/O always happens inside the session's
//! own task. Lock order is map, then session.

use crate::api::feed_client::{ChannelId, FeedClient};
use crate::config::EngineConfig;
use crate::engine::session::{ChannelSession, PollLoop, SessionStatus};
use crate::engine::subscriber::Subscriber;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Returned by [`SessionRegistry::attach`] and passed back to `detach`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    channel_id: ChannelId,
    session: Weak<ChannelSession>,
}

impl SessionHandle {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The session this handle was issued for has not ended yet.
    pub fn is_active(&self) -> bool {
        self.session
            .upgrade()
            .map(|session| session.is_accepting())
            .unwrap_or(false)
    }
}

struct RegistryInner<C: FeedClient> {
    client: Arc<C>,
    config: EngineConfig,
    sessions: Mutex<HashMap<ChannelId, Arc<ChannelSession>>>,
}

impl<C: FeedClient> RegistryInner<C> {
    /// Forget `session` unless the slot already holds its successor.
    fn remove_session(&self, session: &Arc<ChannelSession>) {
        let mut sessions = self.sessions.lock();
        let current = sessions
            .get(session.channel_id())
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false);
        if current {
            sessions.remove(session.channel_id());
            debug!(
                "🗑️ [REGISTRY] Removed session for {} ({} remaining)",
                session.channel_id(),
                sessions.len()
            );
        }
    }
}

pub struct SessionRegistry<C: FeedClient> {
    inner: Arc<RegistryInner<C>>,
}

impl<C: FeedClient> Clone for SessionRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: FeedClient> SessionRegistry<C> {
    pub fn new(client: Arc<C>, config: EngineConfig) -> Self {
        info!("🏗️ [REGISTRY] Creating session registry");
        Self {
            inner: Arc::new(RegistryInner {
                client,
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// New subscriber with the configured queue capacity.
    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.inner.config.subscriber_queue_capacity)
    }

    /// Attach `subscriber` to the session for `channel_id`, starting one if
    /// there is none or the existing one is shutting down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, channel_id: impl Into<ChannelId>, subscriber: &Subscriber) -> SessionHandle {
        let channel_id = channel_id.into();
        let mut sessions = self.inner.sessions.lock();

        if let Some(existing) = sessions.get(&channel_id) {
            if existing.try_add(subscriber.sink()) {
                debug!(
                    "➕ [REGISTRY] Subscriber {} joined {} ({} attached)",
                    subscriber.id(),
                    channel_id,
                    existing.subscriber_count()
                );
                return SessionHandle {
                    channel_id,
                    session: Arc::downgrade(existing),
                };
            }
        }

        let session = ChannelSession::new(channel_id.clone());
        session.try_add(subscriber.sink());
        sessions.insert(channel_id.clone(), Arc::clone(&session));
        self.spawn_poll_task(&session);

        info!(
            "🆕 [REGISTRY] Started session for {} ({} active)",
            channel_id,
            sessions.len()
        );

        SessionHandle {
            channel_id,
            session: Arc::downgrade(&session),
        }
    }

    /// Detach `subscriber`. The last one out starts (or restarts) the idle timer.
    pub fn detach(&self, handle: &SessionHandle, subscriber: &Subscriber) {
        let Some(session) = handle.session.upgrade() else {
            return;
        };

        let remaining = session.remove(subscriber.id());
        debug!(
            "➖ [REGISTRY] Subscriber {} left {} ({} remaining)",
            subscriber.id(),
            handle.channel_id,
            remaining
        );
        if remaining == 0 {
            session.reset_idle_timer(self.inner.config.idle_grace());
        }
    }

    /// Diagnostic snapshot for one channel.
    pub fn status(&self, channel_id: &ChannelId) -> Option<SessionStatus> {
        let session = self.inner.sessions.lock().get(channel_id).cloned()?;
        Some(session.status())
    }

    pub fn active_channels(&self) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self.inner.sessions.lock().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Stop every session and wait for their poll tasks to finish.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ChannelSession>> = {
            let mut sessions = self.inner.sessions.lock();
            sessions.drain().map(|(_, session)| session).collect()
        };

        info!("🛑 [REGISTRY] Shutting down {} session(s)", sessions.len());
        for session in &sessions {
            session.stop();
        }
        for session in sessions {
            if let Some(task) = session.take_task() {
                if let Err(e) = task.await {
                    tracing::warn!(
                        "⚠️ [REGISTRY] Poll task for {} did not finish cleanly: {}",
                        session.channel_id(),
                        e
                    );
                }
            }
        }
        info!("🛑 [REGISTRY] Shutdown completed");
    }

    fn spawn_poll_task(&self, session: &Arc<ChannelSession>) {
        let poll_loop = PollLoop::new(
            Arc::clone(&self.inner.client),
            Arc::clone(session),
            self.inner.config.clone(),
        );
        let registry = Arc::downgrade(&self.inner);
        let owned = Arc::clone(session);

        let task = tokio::spawn(async move {
            let end = poll_loop.run().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_session(&owned);
            }
            debug!(
                "🏁 [REGISTRY] Poll task for {} exited ({})",
                owned.channel_id(),
                end
            );
        });
        session.set_task(task);
    }
}
