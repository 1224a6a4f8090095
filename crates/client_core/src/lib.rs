use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{MessageId, UserId},
    protocol::{ChatMessage, ClientFrame, SendMessageRequest, ThreadSummary},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod polling;
pub mod reactions;
pub mod reconcile;
pub mod store;
pub mod transport;

pub use api::{AttachmentUpload, HttpMessagingApi, MessagingApi};
pub use config::{load_settings, ClientSettings};
pub use error::{ClientError, TransportError};
pub use transport::{ConnectionState, TransportEvent};

use directory::ConversationDirectory;
use polling::PollingFallback;
use reactions::{ReactionBook, ReactionChange};
use reconcile::{EventLoop, ReconciliationEngine};
use transport::{ReconnectPolicy, TransportChannel};

/// Notifications for the rendering layer. Views re-read through [`MessagingClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionStateChanged(ConnectionState),
    ConversationUpdated { peer: UserId },
    DirectoryInvalidated,
    PeerTyping { peer: UserId, typing: bool },
    PresenceChanged { user_id: UserId, is_online: bool },
    SendFailed { peer: UserId, temp_id: MessageId, reason: String },
    Error(String),
}

/// Everything the reconciliation loop consumes, from every producer, in arrival order.
#[derive(Debug)]
pub enum InboundEvent {
    Transport(TransportEvent),
    /// A refetch whose request was issued at store revision `since`.
    History {
        peer: UserId,
        messages: Vec<ChatMessage>,
        since: u64,
    },
    FocusChanged(Option<UserId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the real-time channel; the ack reconciles asynchronously.
    Pushed { temp_id: MessageId },
    /// Delivered over REST and already reconciled.
    Confirmed(ChatMessage),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;
    async fn open_conversation(&self, peer: &UserId) -> Result<(), ClientError>;
    async fn close_conversation(&self);
    async fn send_message(&self, peer: &UserId, content: &str) -> Result<SendOutcome, ClientError>;
    async fn send_message_with_attachment(
        &self,
        peer: &UserId,
        content: Option<&str>,
        attachment: AttachmentUpload,
    ) -> Result<ChatMessage, ClientError>;
    async fn messages(&self, peer: &UserId) -> Vec<ChatMessage>;
    async fn threads(&self) -> Result<Vec<ThreadSummary>, ClientError>;
    async fn react(&self, message_id: &MessageId, reaction: &str)
        -> Result<ReactionChange, ClientError>;
    async fn archive_thread(&self, peer: &UserId) -> Result<(), ClientError>;
    async fn shutdown(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

/// One authenticated session: the store, its single writer, the real-time channel
/// and the open conversation's polling fallback.
pub struct MessagingClient {
    settings: ClientSettings,
    api: Arc<dyn MessagingApi>,
    engine: ReconciliationEngine,
    directory: ConversationDirectory,
    reactions: Mutex<ReactionBook>,
    events: broadcast::Sender<ClientEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    typing_rx: watch::Receiver<Option<UserId>>,
    inner: Mutex<SessionState>,
}

struct SessionState {
    closed: bool,
    pending_loop: Option<EventLoop>,
    event_loop: Option<JoinHandle<()>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    transport: Option<TransportChannel>,
    polling: Option<PollingFallback>,
    active_peer: Option<UserId>,
}

impl MessagingClient {
    pub fn new(settings: ClientSettings, api: Arc<dyn MessagingApi>, me: UserId) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (typing_tx, typing_rx) = watch::channel(None);

        let directory = ConversationDirectory::new(Arc::clone(&api), events.clone());
        let engine = ReconciliationEngine::new(me, directory.clone(), events.clone());
        let event_loop = EventLoop::new(
            engine.clone(),
            directory.clone(),
            settings.typing_timeout,
            typing_tx,
            events.clone(),
            inbound_rx,
        );

        Arc::new(Self {
            settings,
            api,
            engine,
            directory,
            reactions: Mutex::new(ReactionBook::new()),
            events,
            inbound_tx,
            state_rx,
            typing_rx,
            inner: Mutex::new(SessionState {
                closed: false,
                pending_loop: Some(event_loop),
                event_loop: None,
                state_tx: Some(state_tx),
                transport: None,
                polling: None,
                active_peer: None,
            }),
        })
    }

    pub fn current_user(&self) -> &UserId {
        self.engine.current_user()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The peer currently flagged as typing in the open conversation, if any.
    pub fn typing_peer(&self) -> Option<UserId> {
        self.typing_rx.borrow().clone()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.typing_rx.borrow().is_some()
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.directory.is_online(user_id).await
    }

    pub async fn active_peer(&self) -> Option<UserId> {
        self.inner.lock().await.active_peer.clone()
    }

    pub async fn reactions(&self, message_id: &MessageId) -> Vec<shared::protocol::Reaction> {
        self.reactions.lock().await.reactions(message_id).to_vec()
    }

    fn ensure_event_loop(guard: &mut SessionState) {
        if let Some(event_loop) = guard.pending_loop.take() {
            guard.event_loop = Some(tokio::spawn(event_loop.run()));
        }
    }

    async fn connect_impl(&self) -> Result<(), ClientError> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(ClientError::SessionClosed);
        }
        let Some(state_tx) = guard.state_tx.take() else {
            return Err(ClientError::AlreadyConnected);
        };
        let url = match self.settings.websocket_url() {
            Ok(url) => url,
            Err(err) => {
                guard.state_tx = Some(state_tx);
                return Err(err.into());
            }
        };

        Self::ensure_event_loop(&mut guard);
        info!(user_id = %self.current_user(), %url, "opening real-time channel");
        guard.transport = Some(TransportChannel::connect(
            url,
            ReconnectPolicy::from_settings(&self.settings),
            Arc::clone(&self.api),
            state_tx,
            self.inbound_tx.clone(),
        ));
        Ok(())
    }

    async fn open_conversation_impl(&self, peer: &UserId) -> Result<(), ClientError> {
        {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return Err(ClientError::SessionClosed);
            }
            Self::ensure_event_loop(&mut guard);
            // Outgoing context's timers go before the new ones start.
            if let Some(polling) = guard.polling.take() {
                polling.stop();
            }
            guard.active_peer = Some(peer.clone());
            let _ = self
                .inbound_tx
                .send(InboundEvent::FocusChanged(Some(peer.clone())));
        }

        let since = self.engine.revision().await;
        let history = self.api.list_messages(peer).await;

        let mut guard = self.inner.lock().await;
        if guard.closed || guard.active_peer.as_ref() != Some(peer) {
            debug!(peer = %peer, "conversation switched while loading history");
            return Ok(());
        }
        guard.polling = Some(PollingFallback::start(
            peer.clone(),
            self.settings.poll_interval,
            Arc::clone(&self.api),
            self.state_rx.clone(),
            self.engine.clone(),
            self.directory.clone(),
            self.inbound_tx.clone(),
        ));
        drop(guard);

        self.engine.apply_history(peer, history?, since).await;
        Ok(())
    }

    async fn close_conversation_impl(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(polling) = guard.polling.take() {
            polling.stop();
        }
        if guard.active_peer.take().is_some() {
            let _ = self.inbound_tx.send(InboundEvent::FocusChanged(None));
        }
    }

    async fn send_message_impl(
        &self,
        peer: &UserId,
        content: &str,
    ) -> Result<SendOutcome, ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        if self.inner.lock().await.closed {
            return Err(ClientError::SessionClosed);
        }

        let optimistic = self
            .engine
            .insert_optimistic(peer, Some(content.to_string()), None)
            .await;

        let pushed = {
            let guard = self.inner.lock().await;
            match guard.transport.as_ref() {
                Some(transport) => transport.send(ClientFrame::Message {
                    receiver_id: peer.clone(),
                    content: content.to_string(),
                }),
                None => Err(TransportError::NotConnected),
            }
        };
        match pushed {
            Ok(()) => {
                return Ok(SendOutcome::Pushed {
                    temp_id: optimistic.id,
                })
            }
            Err(err) => debug!(peer = %peer, reason = %err, "push unavailable; sending over REST"),
        }

        let request = SendMessageRequest {
            receiver_id: peer.clone(),
            content: content.to_string(),
        };
        match self.api.send_message(&request).await {
            Ok(confirmed) => {
                self.engine.apply_incoming(confirmed.clone()).await;
                Ok(SendOutcome::Confirmed(confirmed))
            }
            Err(err) => Err(self.fail_send(peer, &optimistic, err).await),
        }
    }

    async fn send_attachment_impl(
        &self,
        peer: &UserId,
        content: Option<&str>,
        attachment: AttachmentUpload,
    ) -> Result<ChatMessage, ClientError> {
        if self.inner.lock().await.closed {
            return Err(ClientError::SessionClosed);
        }
        let content = content.filter(|c| !c.trim().is_empty());
        let optimistic = self
            .engine
            .insert_optimistic(peer, content.map(str::to_string), None)
            .await;

        match self
            .api
            .send_message_with_attachment(peer, content, attachment)
            .await
        {
            Ok(confirmed) => {
                self.engine.apply_incoming(confirmed.clone()).await;
                Ok(confirmed)
            }
            Err(err) => Err(self.fail_send(peer, &optimistic, err).await),
        }
    }

    async fn fail_send(
        &self,
        peer: &UserId,
        optimistic: &ChatMessage,
        err: anyhow::Error,
    ) -> ClientError {
        let reason = format!("{err:#}");
        if self.engine.is_closed() {
            debug!(peer = %peer, %reason, "send failed after shutdown");
            return ClientError::SessionClosed;
        }
        warn!(peer = %peer, temp_id = %optimistic.id, %reason, "send failed; rolling back");
        self.engine.rollback(optimistic).await;
        let _ = self.events.send(ClientEvent::SendFailed {
            peer: peer.clone(),
            temp_id: optimistic.id.clone(),
            reason: reason.clone(),
        });
        ClientError::Send { reason }
    }

    async fn react_impl(
        &self,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<ReactionChange, ClientError> {
        let mut book = self.reactions.lock().await;
        let change = book.plan(message_id, self.current_user(), reaction);
        match &change {
            ReactionChange::Removed(_) => self.api.remove_reaction(message_id).await?,
            ReactionChange::Added(_) | ReactionChange::Replaced { .. } => {
                self.api.add_reaction(message_id, reaction).await?
            }
        }
        book.apply(&change);
        Ok(change)
    }

    async fn shutdown_impl(&self) {
        let (transport, event_loop) = {
            let mut guard = self.inner.lock().await;
            if guard.closed {
                return;
            }
            guard.closed = true;
            self.engine.close();
            if let Some(polling) = guard.polling.take() {
                polling.stop();
            }
            guard.active_peer = None;
            guard.pending_loop = None;
            (guard.transport.take(), guard.event_loop.take())
        };

        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        if let Some(event_loop) = event_loop {
            event_loop.abort();
            let _ = event_loop.await;
        }
        info!(user_id = %self.current_user(), "messaging session closed");
    }
}

#[async_trait]
impl ClientHandle for Arc<MessagingClient> {
    async fn connect(&self) -> Result<(), ClientError> {
        self.connect_impl().await
    }

    async fn open_conversation(&self, peer: &UserId) -> Result<(), ClientError> {
        self.open_conversation_impl(peer).await
    }

    async fn close_conversation(&self) {
        self.close_conversation_impl().await
    }

    async fn send_message(&self, peer: &UserId, content: &str) -> Result<SendOutcome, ClientError> {
        self.send_message_impl(peer, content).await
    }

    async fn send_message_with_attachment(
        &self,
        peer: &UserId,
        content: Option<&str>,
        attachment: AttachmentUpload,
    ) -> Result<ChatMessage, ClientError> {
        self.send_attachment_impl(peer, content, attachment).await
    }

    async fn messages(&self, peer: &UserId) -> Vec<ChatMessage> {
        self.engine.messages(peer).await
    }

    async fn threads(&self) -> Result<Vec<ThreadSummary>, ClientError> {
        Ok(self.directory.threads().await?)
    }

    async fn react(
        &self,
        message_id: &MessageId,
        reaction: &str,
    ) -> Result<ReactionChange, ClientError> {
        self.react_impl(message_id, reaction).await
    }

    async fn archive_thread(&self, peer: &UserId) -> Result<(), ClientError> {
        if self.engine.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        self.api.archive_thread(peer).await?;
        if !self.engine.is_closed() {
            self.directory.invalidate();
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdown_impl().await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod tests_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
