use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use shared::{domain::UserId, protocol::ThreadSummary};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{api::MessagingApi, ClientEvent};

/// Thread list with server-owned last-message/unread metadata.
///
/// Nothing here computes unread counts; accepted events only mark the cache stale
/// and the next read pulls the collaborator's truth again.
#[derive(Clone)]
pub struct ConversationDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    api: Arc<dyn MessagingApi>,
    threads: RwLock<Vec<ThreadSummary>>,
    stale: AtomicBool,
    presence: RwLock<HashMap<UserId, bool>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConversationDirectory {
    pub fn new(api: Arc<dyn MessagingApi>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                api,
                threads: RwLock::new(Vec::new()),
                stale: AtomicBool::new(true),
                presence: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn invalidate(&self) {
        self.inner.stale.store(true, Ordering::SeqCst);
        let _ = self.inner.events.send(ClientEvent::DirectoryInvalidated);
    }

    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::SeqCst)
    }

    /// Cached summaries, refetched first if an invalidation is pending.
    pub async fn threads(&self) -> Result<Vec<ThreadSummary>> {
        if self.is_stale() {
            return self.refresh().await;
        }
        Ok(self.inner.threads.read().await.clone())
    }

    pub async fn refresh(&self) -> Result<Vec<ThreadSummary>> {
        // Cleared up front so an invalidation racing the fetch survives it.
        self.inner.stale.store(false, Ordering::SeqCst);
        let threads = match self.inner.api.list_threads().await {
            Ok(threads) => threads,
            Err(err) => {
                self.inner.stale.store(true, Ordering::SeqCst);
                return Err(err);
            }
        };
        debug!(count = threads.len(), "refreshed thread directory");
        *self.inner.threads.write().await = threads.clone();
        Ok(threads)
    }

    pub async fn set_presence(&self, user_id: &UserId, is_online: bool) {
        self.inner
            .presence
            .write()
            .await
            .insert(user_id.clone(), is_online);
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner
            .presence
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(false)
    }
}
