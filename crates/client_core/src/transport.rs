//! Single authenticated real-time connection with bounded exponential reconnect.

use std::{borrow::Cow, fmt, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use shared::{
    domain::UserId,
    error::RequestRejected,
    protocol::{ChatMessage, ClientFrame, ServerFrame},
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{api::MessagingApi, config::ClientSettings, error::TransportError, InboundEvent};

const OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingAuth => "awaiting_auth",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Typed upward events. State changes ride along for the connectivity indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    AuthSuccess,
    AuthError { message: String },
    MessageReceived(ChatMessage),
    MessageAck(ChatMessage),
    TypingSignal { user_id: UserId },
    PresenceChanged { user_id: UserId, is_online: bool },
}

/// Source of the short-lived credential sent in the `auth` frame.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String>;
}

#[async_trait]
impl<T> TokenSource for T
where
    T: MessagingApi + ?Sized,
{
    async fn fetch_token(&self) -> Result<String> {
        self.fetch_ws_token().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base_delay,
            max_delay: settings.reconnect_max_delay,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect number `attempt + 1`: `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Stop,
    Exhausted,
}

/// Connection lifecycle without any I/O:
/// `disconnected -> connecting -> awaiting_auth -> connected`, `error` from anywhere.
#[derive(Debug)]
pub struct ChannelStateMachine {
    state: ConnectionState,
    attempts: u32,
    policy: ReconnectPolicy,
    torn_down: bool,
}

impl ChannelStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            policy,
            torn_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn connect(&mut self) -> bool {
        if self.torn_down
            || matches!(
                self.state,
                ConnectionState::Connecting
                    | ConnectionState::AwaitingAuth
                    | ConnectionState::Connected
            )
        {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn opened(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::AwaitingAuth;
        true
    }

    /// The only transition that resets the reconnect budget.
    pub fn authenticated(&mut self) -> bool {
        if self.state != ConnectionState::AwaitingAuth {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        true
    }

    pub fn auth_rejected(&mut self) -> ReconnectDecision {
        self.state = ConnectionState::Error;
        self.schedule()
    }

    pub fn failed(&mut self) -> ReconnectDecision {
        self.state = ConnectionState::Error;
        self.schedule()
    }

    pub fn closed(&mut self, normal: bool) -> ReconnectDecision {
        self.state = ConnectionState::Disconnected;
        if normal {
            ReconnectDecision::Stop
        } else {
            self.schedule()
        }
    }

    pub fn teardown(&mut self) {
        self.torn_down = true;
        self.state = ConnectionState::Disconnected;
    }

    fn schedule(&mut self) -> ReconnectDecision {
        if self.torn_down {
            return ReconnectDecision::Stop;
        }
        if self.attempts >= self.policy.max_attempts {
            return ReconnectDecision::Exhausted;
        }
        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }
}

/// Handle to the connection worker. One per session; dropping it tears the worker down.
pub struct TransportChannel {
    state: watch::Receiver<ConnectionState>,
    outbound: mpsc::Sender<ClientFrame>,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl TransportChannel {
    pub fn connect<T>(
        url: Url,
        policy: ReconnectPolicy,
        tokens: Arc<T>,
        state_tx: watch::Sender<ConnectionState>,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Self
    where
        T: TokenSource + ?Sized + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = state_tx.subscribe();
        let worker = ChannelWorker {
            url,
            tokens,
            machine: ChannelStateMachine::new(policy),
            state_tx,
            outbound_rx,
            shutdown_rx,
            events,
        };
        Self {
            state,
            outbound,
            shutdown,
            worker: tokio::spawn(worker.run()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queues a frame for the socket. Fails unless the channel is `connected`.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Closes with a normal-closure code and waits for the worker; nothing is emitted afterwards.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "transport worker ended abnormally");
        }
    }
}

enum SessionEnd {
    Shutdown,
    ClosedNormally,
    ClosedAbnormally(String),
    AuthRejected(String),
    Failed(String),
}

struct ChannelWorker<T: ?Sized> {
    url: Url,
    tokens: Arc<T>,
    machine: ChannelStateMachine,
    state_tx: watch::Sender<ConnectionState>,
    outbound_rx: mpsc::Receiver<ClientFrame>,
    shutdown_rx: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<InboundEvent>,
}

impl<T> ChannelWorker<T>
where
    T: TokenSource + ?Sized,
{
    async fn run(mut self) {
        loop {
            if self.shutdown_requested() || !self.machine.connect() {
                break;
            }
            self.publish();

            let end = self.run_session().await;
            let discarded = self.discard_queued();
            if discarded > 0 {
                warn!(discarded, "dropping frames queued for a session that ended");
            }
            let decision = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::ClosedNormally => {
                    info!("real-time channel closed by server");
                    self.machine.closed(true)
                }
                SessionEnd::ClosedAbnormally(reason) => {
                    warn!(%reason, "real-time channel dropped");
                    self.machine.closed(false)
                }
                SessionEnd::AuthRejected(reason) => {
                    warn!(%reason, "real-time channel authentication failed");
                    self.machine.auth_rejected()
                }
                SessionEnd::Failed(reason) => {
                    warn!(%reason, "real-time channel error");
                    self.machine.failed()
                }
            };
            self.publish();

            match decision {
                ReconnectDecision::Retry { attempt, delay } => {
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown_rx.changed() => break,
                    }
                }
                ReconnectDecision::Stop => return,
                ReconnectDecision::Exhausted => {
                    warn!(
                        attempts = self.machine.attempts(),
                        "reconnect budget exhausted; continuing on polling fallback"
                    );
                    return;
                }
            }
        }

        self.machine.teardown();
        self.state_tx.send_replace(self.machine.state());
        debug!("transport worker stopped");
    }

    /// Frames accepted while the previous session was up are never replayed on the
    /// next one; their messages are reconciled by the next refetch instead.
    fn discard_queued(&mut self) -> usize {
        let mut discarded = 0;
        while self.outbound_rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    fn publish(&self) {
        let state = self.machine.state();
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "transport state changed");
            self.emit(TransportEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(InboundEvent::Transport(event));
    }

    async fn run_session(&mut self) -> SessionEnd {
        let connected = tokio::select! {
            result = connect_async(self.url.as_str()) => result,
            _ = self.shutdown_rx.changed() => return SessionEnd::Shutdown,
        };
        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(err) => {
                return SessionEnd::Failed(format!("failed to connect websocket {}: {err}", self.url))
            }
        };
        let (mut writer, mut reader) = ws_stream.split();
        self.machine.opened();
        self.publish();

        let token = tokio::select! {
            token = self.tokens.fetch_token() => token,
            _ = self.shutdown_rx.changed() => {
                close_normally(&mut writer).await;
                return SessionEnd::Shutdown;
            }
        };
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                let _ = writer.send(Message::Close(None)).await;
                let reason = format!("failed to fetch websocket token: {err:#}");
                if err
                    .downcast_ref::<RequestRejected>()
                    .is_some_and(RequestRejected::is_unauthorized)
                {
                    self.emit(TransportEvent::AuthError {
                        message: reason.clone(),
                    });
                    return SessionEnd::AuthRejected(reason);
                }
                return SessionEnd::Failed(reason);
            }
        };
        if let Err(err) = send_frame(&mut writer, &ClientFrame::Auth { token }).await {
            return SessionEnd::Failed(err.to_string());
        }

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    close_normally(&mut writer).await;
                    return SessionEnd::Shutdown;
                }
                Some(frame) = self.outbound_rx.recv() => {
                    if let Err(err) = send_frame(&mut writer, &frame).await {
                        return SessionEnd::Failed(err.to_string());
                    }
                }
                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.handle_text(&text) {
                            let _ = writer.send(Message::Close(None)).await;
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(frame) if frame.code == CloseCode::Normal => SessionEnd::ClosedNormally,
                            Some(frame) => SessionEnd::ClosedAbnormally(format!(
                                "close code {}: {}",
                                u16::from(frame.code),
                                frame.reason
                            )),
                            None => SessionEnd::ClosedAbnormally("close without status".into()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return SessionEnd::Failed(format!("websocket receive failed: {err}"));
                    }
                    None => return SessionEnd::ClosedAbnormally("stream ended".into()),
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) -> Option<SessionEnd> {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed server frame");
                return None;
            }
        };

        let event = match frame {
            ServerFrame::AuthSuccess => {
                if self.machine.authenticated() {
                    self.publish();
                }
                TransportEvent::AuthSuccess
            }
            ServerFrame::AuthError { message } => {
                self.emit(TransportEvent::AuthError {
                    message: message.clone(),
                });
                return Some(SessionEnd::AuthRejected(message));
            }
            ServerFrame::NewMessage { message } => TransportEvent::MessageReceived(message),
            ServerFrame::MessageSent { message } => TransportEvent::MessageAck(message),
            ServerFrame::Typing { user_id } => TransportEvent::TypingSignal { user_id },
            ServerFrame::UserStatusChange { user_id, is_online } => {
                TransportEvent::PresenceChanged { user_id, is_online }
            }
        };
        self.emit(event);
        None
    }
}

async fn send_frame<S>(writer: &mut S, frame: &ClientFrame) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| TransportError::Socket(err.to_string()))
}

async fn close_normally<S>(writer: &mut S)
where
    S: Sink<Message> + Unpin,
{
    let _ = writer
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("session ended"),
        })))
        .await;
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
