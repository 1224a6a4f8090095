use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::tests_support::{message, FakeApi};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::{net::TcpListener, time::timeout};

const NEW_MESSAGE: &str = r#"{"type":"new_message","message":{"id":"msg_1","senderId":"bob","receiverId":"me","content":"hey","imageUrl":null,"isRead":false,"createdAt":"2024-05-01T10:00:00Z"}}"#;

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(25),
        max_attempts,
    }
}

#[test]
fn backoff_doubles_until_capped() {
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        max_attempts: 10,
    };
    let delays: Vec<u64> = (0..6).map(|n| policy.delay_for(n).as_millis() as u64).collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    assert_eq!(policy.delay_for(64), Duration::from_secs(1));
}

#[test]
fn reconnects_stop_after_max_attempts() {
    let mut machine = ChannelStateMachine::new(ReconnectPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(300),
        max_attempts: 3,
    });

    let mut scheduled = Vec::new();
    loop {
        assert!(machine.connect());
        match machine.failed() {
            ReconnectDecision::Retry { attempt, delay } => scheduled.push((attempt, delay)),
            ReconnectDecision::Exhausted => break,
            ReconnectDecision::Stop => panic!("unexpected stop"),
        }
    }

    assert_eq!(
        scheduled,
        vec![
            (1, Duration::from_millis(100)),
            (2, Duration::from_millis(200)),
            (3, Duration::from_millis(300)),
        ]
    );
    assert_eq!(machine.state(), ConnectionState::Error);
    assert_eq!(machine.failed(), ReconnectDecision::Exhausted);
}

#[test]
fn reaching_connected_resets_the_budget() {
    let mut machine = ChannelStateMachine::new(policy(2));
    machine.connect();
    machine.failed();
    machine.connect();
    machine.failed();
    assert_eq!(machine.attempts(), 2);

    assert!(machine.connect());
    assert!(machine.opened());
    assert!(machine.authenticated());
    assert_eq!(machine.state(), ConnectionState::Connected);
    assert_eq!(machine.attempts(), 0);

    assert!(matches!(
        machine.closed(false),
        ReconnectDecision::Retry { attempt: 1, .. }
    ));
}

#[test]
fn auth_success_requires_awaiting_auth() {
    let mut machine = ChannelStateMachine::new(policy(2));
    assert!(!machine.authenticated());
    machine.connect();
    assert!(!machine.authenticated());
    assert!(machine.opened());
    assert_eq!(machine.state(), ConnectionState::AwaitingAuth);
    assert!(!machine.connect());
}

#[test]
fn normal_closure_is_terminal() {
    let mut machine = ChannelStateMachine::new(policy(5));
    machine.connect();
    machine.opened();
    machine.authenticated();
    assert_eq!(machine.closed(true), ReconnectDecision::Stop);
    assert_eq!(machine.state(), ConnectionState::Disconnected);
}

#[test]
fn auth_rejection_goes_through_error() {
    let mut machine = ChannelStateMachine::new(policy(5));
    machine.connect();
    machine.opened();
    assert!(matches!(
        machine.auth_rejected(),
        ReconnectDecision::Retry { attempt: 1, .. }
    ));
    assert_eq!(machine.state(), ConnectionState::Error);
}

#[test]
fn teardown_blocks_further_connects() {
    let mut machine = ChannelStateMachine::new(policy(5));
    machine.teardown();
    assert!(!machine.connect());
    assert_eq!(machine.failed(), ReconnectDecision::Stop);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PeerMode {
    Accept,
    RejectAuth,
}

#[derive(Clone)]
struct PeerState {
    mode: PeerMode,
    pushes: Arc<Vec<String>>,
    connections: Arc<AtomicUsize>,
    frames: mpsc::UnboundedSender<String>,
    close_codes: mpsc::UnboundedSender<Option<u16>>,
}

struct Peer {
    url: Url,
    connections: Arc<AtomicUsize>,
    frames: mpsc::UnboundedReceiver<String>,
    close_codes: mpsc::UnboundedReceiver<Option<u16>>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<PeerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| peer_session(socket, state))
}

async fn peer_session(mut socket: WebSocket, state: PeerState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let Some(Ok(WsMessage::Text(auth))) = socket.recv().await else {
        return;
    };
    let _ = state.frames.send(auth);

    if state.mode == PeerMode::RejectAuth {
        let _ = socket
            .send(WsMessage::Text(
                r#"{"type":"auth_error","message":"bad token"}"#.into(),
            ))
            .await;
        return;
    }
    let _ = socket
        .send(WsMessage::Text(r#"{"type":"auth_success"}"#.into()))
        .await;
    for frame in state.pushes.iter() {
        let _ = socket.send(WsMessage::Text(frame.clone())).await;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Text(text) => {
                let _ = state.frames.send(text);
            }
            WsMessage::Close(frame) => {
                let _ = state.close_codes.send(frame.map(|f| f.code));
                break;
            }
            _ => {}
        }
    }
}

async fn spawn_peer(mode: PeerMode, pushes: Vec<&str>) -> Peer {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (close_tx, close_codes) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let state = PeerState {
        mode,
        pushes: Arc::new(pushes.into_iter().map(str::to_string).collect()),
        connections: Arc::clone(&connections),
        frames: frames_tx,
        close_codes: close_tx,
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Peer {
        url: Url::parse(&format!("ws://{addr}/ws")).expect("url"),
        connections,
        frames,
        close_codes,
    }
}

async fn next_transport_event(
    rx: &mut mpsc::UnboundedReceiver<InboundEvent>,
) -> Option<TransportEvent> {
    match timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(InboundEvent::Transport(event))) => Some(event),
        Ok(Some(other)) => panic!("unexpected inbound event: {other:?}"),
        Ok(None) => None,
        Err(_) => panic!("timed out waiting for transport event"),
    }
}

async fn wait_for_state(state: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
    timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
        .await
        .expect("state reached in time")
        .expect("state sender alive");
}

#[tokio::test]
async fn authenticates_and_forwards_valid_frames_only() {
    let mut peer = spawn_peer(
        PeerMode::Accept,
        vec!["not json", r#"{"type":"bogus"}"#, NEW_MESSAGE, r#"{"type":"typing","userId":"bob"}"#],
    )
    .await;
    let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = TransportChannel::connect(
        peer.url.clone(),
        policy(3),
        Arc::new(FakeApi::default()),
        state_tx,
        events_tx,
    );

    let mut seen = Vec::new();
    while seen.len() < 6 {
        seen.push(next_transport_event(&mut events).await.expect("event"));
    }
    assert_eq!(
        seen,
        vec![
            TransportEvent::StateChanged(ConnectionState::Connecting),
            TransportEvent::StateChanged(ConnectionState::AwaitingAuth),
            TransportEvent::StateChanged(ConnectionState::Connected),
            TransportEvent::AuthSuccess,
            TransportEvent::MessageReceived(message("msg_1", "bob", "me", "hey")),
            TransportEvent::TypingSignal {
                user_id: UserId::from("bob")
            },
        ]
    );

    let auth = peer.frames.recv().await.expect("auth frame");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&auth).expect("json"),
        serde_json::json!({"type": "auth", "token": "ws-token"})
    );
    assert!(channel.is_connected());
    channel.shutdown().await;
}

#[tokio::test]
async fn send_requires_connected_state_and_reaches_peer() {
    let mut peer = spawn_peer(PeerMode::Accept, Vec::new()).await;
    let (state_tx, mut state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, _events) = mpsc::unbounded_channel();
    let frame = ClientFrame::Message {
        receiver_id: UserId::from("bob"),
        content: "hi".into(),
    };

    let channel = TransportChannel::connect(
        peer.url.clone(),
        policy(3),
        Arc::new(FakeApi::default()),
        state_tx,
        events_tx,
    );
    if channel.state() != ConnectionState::Connected {
        assert!(matches!(
            channel.send(frame.clone()),
            Err(TransportError::NotConnected)
        ));
    }

    wait_for_state(&mut state_rx, ConnectionState::Connected).await;
    let _auth = peer.frames.recv().await.expect("auth frame");
    channel.send(frame).expect("send while connected");

    let sent = timeout(Duration::from_secs(5), peer.frames.recv())
        .await
        .expect("frame in time")
        .expect("frame");
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&sent).expect("json"),
        serde_json::json!({"type": "message", "receiverId": "bob", "content": "hi"})
    );
    channel.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_normally_and_goes_quiet() {
    let mut peer = spawn_peer(PeerMode::Accept, Vec::new()).await;
    let (state_tx, mut state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = TransportChannel::connect(
        peer.url.clone(),
        policy(3),
        Arc::new(FakeApi::default()),
        state_tx,
        events_tx,
    );
    wait_for_state(&mut state_rx, ConnectionState::Connected).await;

    channel.shutdown().await;

    let code = timeout(Duration::from_secs(5), peer.close_codes.recv())
        .await
        .expect("close in time")
        .expect("close frame");
    assert_eq!(code, Some(1000));
    assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);

    let mut connects = 0;
    while let Some(event) = next_transport_event(&mut events).await {
        if event == TransportEvent::StateChanged(ConnectionState::Connecting) {
            connects += 1;
        }
    }
    assert_eq!(connects, 1);
}

#[tokio::test]
async fn unreachable_server_gives_up_after_budget() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = TransportChannel::connect(
        Url::parse(&format!("ws://{addr}/ws")).expect("url"),
        policy(2),
        Arc::new(FakeApi::default()),
        state_tx,
        events_tx,
    );
    assert!(matches!(
        channel.send(ClientFrame::Auth { token: "x".into() }),
        Err(TransportError::NotConnected)
    ));

    let mut connects = 0;
    while let Some(event) = next_transport_event(&mut events).await {
        if event == TransportEvent::StateChanged(ConnectionState::Connecting) {
            connects += 1;
        }
    }

    assert_eq!(connects, 3);
    assert_eq!(*state_rx.borrow(), ConnectionState::Error);
    channel.shutdown().await;
}

#[tokio::test]
async fn rejected_auth_reconnects_within_budget() {
    let peer = spawn_peer(PeerMode::RejectAuth, Vec::new()).await;
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = TransportChannel::connect(
        peer.url.clone(),
        policy(1),
        Arc::new(FakeApi::default()),
        state_tx,
        events_tx,
    );

    let mut auth_errors = 0;
    while let Some(event) = next_transport_event(&mut events).await {
        assert_ne!(event, TransportEvent::StateChanged(ConnectionState::Connected));
        if matches!(event, TransportEvent::AuthError { .. }) {
            auth_errors += 1;
        }
    }

    assert_eq!(auth_errors, 2);
    assert_eq!(peer.connections.load(Ordering::SeqCst), 2);
    assert_eq!(*state_rx.borrow(), ConnectionState::Error);
    channel.shutdown().await;
}

#[tokio::test]
async fn token_fetch_failure_is_a_transport_error() {
    let mut peer = spawn_peer(PeerMode::Accept, Vec::new()).await;
    let api = FakeApi::default();
    api.fail_tokens().await;
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = TransportChannel::connect(
        peer.url.clone(),
        policy(0),
        Arc::new(api),
        state_tx,
        events_tx,
    );

    let mut seen = Vec::new();
    while let Some(event) = next_transport_event(&mut events).await {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            TransportEvent::StateChanged(ConnectionState::Connecting),
            TransportEvent::StateChanged(ConnectionState::AwaitingAuth),
            TransportEvent::StateChanged(ConnectionState::Error),
        ]
    );
    assert_eq!(*state_rx.borrow(), ConnectionState::Error);
    assert!(peer.frames.try_recv().is_err());
    channel.shutdown().await;
}

#[tokio::test]
async fn unauthorized_token_endpoint_counts_as_auth_failure() {
    let peer = spawn_peer(PeerMode::Accept, Vec::new()).await;
    let api = FakeApi::default();
    api.reject_tokens(401, r#"{"error":"Unauthorized"}"#).await;
    let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let channel = TransportChannel::connect(
        peer.url.clone(),
        policy(0),
        Arc::new(api),
        state_tx,
        events_tx,
    );

    let mut auth_errors = Vec::new();
    while let Some(event) = next_transport_event(&mut events).await {
        if let TransportEvent::AuthError { message } = event {
            auth_errors.push(message);
        }
    }
    assert_eq!(auth_errors.len(), 1);
    assert!(auth_errors[0].contains("Unauthorized"));
    channel.shutdown().await;
}

#[tokio::test]
async fn frames_queued_for_an_ended_session_are_not_replayed() {
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (_shutdown, shutdown_rx) = watch::channel(false);
    let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events, _events_rx) = mpsc::unbounded_channel();
    let mut worker = ChannelWorker {
        url: Url::parse("ws://127.0.0.1:9/ws").expect("url"),
        tokens: Arc::new(FakeApi::default()),
        machine: ChannelStateMachine::new(policy(1)),
        state_tx,
        outbound_rx,
        shutdown_rx,
        events,
    };

    for content in ["first", "second"] {
        outbound
            .try_send(ClientFrame::Message {
                receiver_id: UserId::from("bob"),
                content: content.into(),
            })
            .expect("queue frame");
    }

    assert_eq!(worker.discard_queued(), 2);
    assert_eq!(worker.discard_queued(), 0);
    assert!(worker.outbound_rx.try_recv().is_err());
}
