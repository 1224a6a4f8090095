use std::{sync::Arc, time::Duration};

use shared::domain::UserId;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    api::MessagingApi, directory::ConversationDirectory, reconcile::ReconciliationEngine,
    transport::ConnectionState, InboundEvent,
};

/// Periodic refetch of the open conversation and the thread directory while the
/// real-time channel is not `connected`. Stopped when dropped.
pub struct PollingFallback {
    task: JoinHandle<()>,
}

impl PollingFallback {
    pub fn start(
        peer: UserId,
        every: Duration,
        api: Arc<dyn MessagingApi>,
        state: watch::Receiver<ConnectionState>,
        engine: ReconciliationEngine,
        directory: ConversationDirectory,
        inbound: mpsc::UnboundedSender<InboundEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            // Refetches run inline, so a slow one swallows ticks instead of queueing them.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if *state.borrow() == ConnectionState::Connected {
                    continue;
                }

                debug!(peer = %peer, "real-time channel offline; polling conversation");
                let since = engine.revision().await;
                match api.list_messages(&peer).await {
                    Ok(messages) => {
                        let event = InboundEvent::History {
                            peer: peer.clone(),
                            messages,
                            since,
                        };
                        if inbound.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(peer = %peer, error = %format!("{err:#}"), "poll refetch failed"),
                }
                if let Err(err) = directory.refresh().await {
                    warn!(error = %format!("{err:#}"), "poll directory refresh failed");
                }
            }
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.task.abort();
    }
}
