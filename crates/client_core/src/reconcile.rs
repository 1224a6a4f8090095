//! Decision logic that turns pushed, polled and locally sent messages into store mutations.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::Utc;
use shared::{
    domain::{ConversationKey, MessageId, UserId},
    protocol::ChatMessage,
};
use tokio::{
    sync::{broadcast, mpsc, watch, RwLock},
    time::{sleep_until, Duration, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    directory::ConversationDirectory,
    store::{MessageStore, StoreOutcome},
    transport::TransportEvent,
    ClientEvent, InboundEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The confirmed id was already applied.
    Duplicate,
    /// Own message; took the place of its optimistic entry.
    ReplacedOptimistic,
    Appended,
    /// Neither participant is the current user.
    Foreign,
    /// The session was torn down before the message arrived.
    Discarded,
}

impl Disposition {
    pub fn accepted(self) -> bool {
        matches!(self, Disposition::ReplacedOptimistic | Disposition::Appended)
    }
}

/// A temporary entry is claimed by a confirmation with the same sender and content.
///
/// Two identical sends in a row are ambiguous: whichever confirmation lands first
/// claims the newest matching temporary entry.
pub fn is_optimistic_match(temporary: &ChatMessage, confirmed: &ChatMessage) -> bool {
    temporary.is_temporary()
        && temporary.sender_id == confirmed.sender_id
        && temporary.content == confirmed.content
}

pub fn reconcile_message(store: &mut MessageStore, me: &UserId, message: ChatMessage) -> Disposition {
    if message.counterpart(me).is_none() {
        return Disposition::Foreign;
    }

    let key = message.conversation_key();
    if !message.is_temporary() && store.contains_confirmed(&key, &message.id) {
        return Disposition::Duplicate;
    }

    if &message.sender_id == me {
        let confirmed = message.clone();
        return match store.replace_optimistic(message, |temp| is_optimistic_match(temp, &confirmed)) {
            StoreOutcome::Replaced { .. } => Disposition::ReplacedOptimistic,
            StoreOutcome::Appended => Disposition::Appended,
            StoreOutcome::Unchanged => Disposition::Duplicate,
        };
    }

    match store.append(message) {
        StoreOutcome::Unchanged => Disposition::Duplicate,
        _ => Disposition::Appended,
    }
}

pub fn optimistic_message(
    me: &UserId,
    peer: &UserId,
    content: Option<String>,
    image_url: Option<String>,
) -> ChatMessage {
    ChatMessage {
        id: MessageId::temporary(Uuid::new_v4()),
        sender_id: me.clone(),
        receiver_id: peer.clone(),
        content,
        image_url,
        is_read: false,
        created_at: Utc::now(),
    }
}

/// Transient "peer is typing" flag for the open conversation.
#[derive(Debug)]
pub struct TypingIndicator {
    timeout: Duration,
    focused: Option<UserId>,
    typing_until: Option<Instant>,
}

impl TypingIndicator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            focused: None,
            typing_until: None,
        }
    }

    /// Switches the open conversation, returning the peer whose visible flag was cleared.
    pub fn focus(&mut self, peer: Option<UserId>) -> Option<UserId> {
        let previous = std::mem::replace(&mut self.focused, peer);
        self.typing_until.take().and(previous)
    }

    /// Arms (or re-arms) the flag. Signals from other conversations are ignored.
    pub fn signal(&mut self, from: &UserId, now: Instant) -> bool {
        if self.focused.as_ref() != Some(from) {
            return false;
        }
        self.typing_until = Some(now + self.timeout);
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.typing_until
    }

    /// Clears the flag once its deadline has passed, returning the peer it belonged to.
    pub fn expire(&mut self, now: Instant) -> Option<UserId> {
        match self.typing_until {
            Some(until) if until <= now => {
                self.typing_until = None;
                self.focused.clone()
            }
            _ => None,
        }
    }

    pub fn typing_peer(&self, now: Instant) -> Option<&UserId> {
        match self.typing_until {
            Some(until) if until > now => self.focused.as_ref(),
            _ => None,
        }
    }
}

/// Sole writer of the [`MessageStore`]. Refuses every write once closed.
#[derive(Clone)]
pub struct ReconciliationEngine {
    me: UserId,
    store: Arc<RwLock<MessageStore>>,
    directory: ConversationDirectory,
    events: broadcast::Sender<ClientEvent>,
    closed: Arc<AtomicBool>,
}

impl ReconciliationEngine {
    pub fn new(
        me: UserId,
        directory: ConversationDirectory,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            me,
            store: Arc::new(RwLock::new(MessageStore::new())),
            directory,
            events,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn current_user(&self) -> &UserId {
        &self.me
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn revision(&self) -> u64 {
        self.store.read().await.revision()
    }

    pub async fn apply_incoming(&self, message: ChatMessage) -> Disposition {
        let Some(peer) = message.counterpart(&self.me).cloned() else {
            warn!(message_id = %message.id, "dropping message for another user's conversation");
            return Disposition::Foreign;
        };
        let message_id = message.id.clone();

        let disposition = {
            let mut store = self.store.write().await;
            if self.is_closed() {
                debug!(message_id = %message_id, "session closed; ignoring message");
                return Disposition::Discarded;
            }
            reconcile_message(&mut store, &self.me, message)
        };
        debug!(peer = %peer, message_id = %message_id, ?disposition, "reconciled message");

        if disposition.accepted() {
            self.accepted(peer);
        }
        disposition
    }

    pub async fn insert_optimistic(
        &self,
        peer: &UserId,
        content: Option<String>,
        image_url: Option<String>,
    ) -> ChatMessage {
        let message = optimistic_message(&self.me, peer, content, image_url);
        {
            let mut store = self.store.write().await;
            if self.is_closed() {
                return message;
            }
            store.append(message.clone());
        }
        let _ = self.events.send(ClientEvent::ConversationUpdated { peer: peer.clone() });
        message
    }

    pub async fn rollback(&self, message: &ChatMessage) -> bool {
        let removed = {
            let mut store = self.store.write().await;
            !self.is_closed()
                && store
                    .remove_temporary(&message.conversation_key(), &message.id)
                    .is_some()
        };
        if removed {
            if let Some(peer) = message.counterpart(&self.me) {
                let _ = self.events.send(ClientEvent::ConversationUpdated { peer: peer.clone() });
            }
        }
        removed
    }

    /// Merges a refetch whose request was issued at store revision `since`.
    pub async fn apply_history(&self, peer: &UserId, history: Vec<ChatMessage>, since: u64) -> bool {
        let key = ConversationKey::new(&self.me, peer);
        let me = self.me.clone();
        let changed = {
            let mut store = self.store.write().await;
            !self.is_closed()
                && store.replace_history(&key, history, since, |temp, confirmed| {
                    confirmed.sender_id == me && is_optimistic_match(temp, confirmed)
                })
        };
        if changed {
            self.accepted(peer.clone());
        }
        changed
    }

    pub async fn messages(&self, peer: &UserId) -> Vec<ChatMessage> {
        let key = ConversationKey::new(&self.me, peer);
        self.store.read().await.get(&key).to_vec()
    }

    fn accepted(&self, peer: UserId) {
        self.directory.invalidate();
        let _ = self.events.send(ClientEvent::ConversationUpdated { peer });
    }
}

/// Drains the single inbound queue fed by the transport channel, the polling
/// fallback and the session facade.
pub(crate) struct EventLoop {
    engine: ReconciliationEngine,
    directory: ConversationDirectory,
    typing: TypingIndicator,
    typing_tx: watch::Sender<Option<UserId>>,
    events: broadcast::Sender<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

impl EventLoop {
    pub(crate) fn new(
        engine: ReconciliationEngine,
        directory: ConversationDirectory,
        typing_timeout: Duration,
        typing_tx: watch::Sender<Option<UserId>>,
        events: broadcast::Sender<ClientEvent>,
        inbound: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> Self {
        Self {
            engine,
            directory,
            typing: TypingIndicator::new(typing_timeout),
            typing_tx,
            events,
            inbound,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.typing.deadline();
            tokio::select! {
                received = self.inbound.recv() => match received {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(peer) = self.typing.expire(Instant::now()) {
                        self.publish_typing(peer, false);
                    }
                }
            }
        }
        debug!("inbound event loop stopped");
    }

    async fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Transport(event) => self.handle_transport(event).await,
            InboundEvent::History {
                peer,
                messages,
                since,
            } => {
                self.engine.apply_history(&peer, messages, since).await;
            }
            InboundEvent::FocusChanged(peer) => {
                if let Some(previous) = self.typing.focus(peer) {
                    self.publish_typing(previous, false);
                }
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                let _ = self.events.send(ClientEvent::ConnectionStateChanged(state));
            }
            TransportEvent::AuthSuccess => info!("real-time channel authenticated"),
            TransportEvent::AuthError { message } => {
                warn!(reason = %message, "real-time channel rejected credentials");
                let _ = self.events.send(ClientEvent::Error(format!(
                    "real-time authentication failed: {message}"
                )));
            }
            TransportEvent::MessageReceived(message) | TransportEvent::MessageAck(message) => {
                self.engine.apply_incoming(message).await;
            }
            TransportEvent::TypingSignal { user_id } => {
                if self.typing.signal(&user_id, Instant::now()) {
                    self.publish_typing(user_id, true);
                }
            }
            TransportEvent::PresenceChanged { user_id, is_online } => {
                self.directory.set_presence(&user_id, is_online).await;
                let _ = self
                    .events
                    .send(ClientEvent::PresenceChanged { user_id, is_online });
            }
        }
    }

    fn publish_typing(&self, peer: UserId, typing: bool) {
        self.typing_tx
            .send_replace(typing.then(|| peer.clone()));
        let _ = self.events.send(ClientEvent::PeerTyping { peer, typing });
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
