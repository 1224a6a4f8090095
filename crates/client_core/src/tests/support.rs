use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, UserId},
    error::RequestRejected,
    protocol::{ChatMessage, SendMessageRequest, ThreadSummary, UserSummary},
};
use tokio::sync::{oneshot, Mutex};

use crate::api::{AttachmentUpload, MessagingApi};

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub fn message(id: &str, sender: &str, receiver: &str, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(id),
        sender_id: UserId::from(sender),
        receiver_id: UserId::from(receiver),
        content: Some(content.to_string()),
        image_url: None,
        is_read: false,
        created_at: at(0),
    }
}

pub fn thread(peer: &str, unread_count: u32) -> ThreadSummary {
    ThreadSummary {
        user: UserSummary {
            id: UserId::from(peer),
            username: Some(peer.to_string()),
            avatar_url: None,
        },
        last_message: None,
        unread_count,
    }
}

/// In-memory REST collaborator. Created messages are sent by `me` and numbered `msg_<n>`.
pub struct FakeApi {
    me: UserId,
    next_id: AtomicU64,
    history: Mutex<Vec<ChatMessage>>,
    threads: Mutex<Vec<ThreadSummary>>,
    token: Mutex<Option<String>>,
    token_rejection: Mutex<Option<RequestRejected>>,
    send_failure: Mutex<Option<String>>,
    send_gate: Mutex<Option<oneshot::Receiver<()>>>,
    history_gate: Mutex<Option<oneshot::Receiver<()>>>,
    sent: Mutex<Vec<SendMessageRequest>>,
    attachments: Mutex<Vec<AttachmentUpload>>,
    reaction_calls: Mutex<Vec<String>>,
    archived: Mutex<Vec<UserId>>,
    list_messages_calls: AtomicUsize,
    list_threads_calls: AtomicUsize,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new("me")
    }
}

impl FakeApi {
    pub fn new(me: &str) -> Self {
        Self {
            me: UserId::from(me),
            next_id: AtomicU64::new(1),
            history: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            token: Mutex::new(Some("ws-token".to_string())),
            token_rejection: Mutex::new(None),
            send_failure: Mutex::new(None),
            send_gate: Mutex::new(None),
            history_gate: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            attachments: Mutex::new(Vec::new()),
            reaction_calls: Mutex::new(Vec::new()),
            archived: Mutex::new(Vec::new()),
            list_messages_calls: AtomicUsize::new(0),
            list_threads_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_next_id(self, next: u64) -> Self {
        self.next_id.store(next, Ordering::SeqCst);
        self
    }

    pub async fn set_history(&self, history: Vec<ChatMessage>) {
        *self.history.lock().await = history;
    }

    pub async fn set_threads(&self, threads: Vec<ThreadSummary>) {
        *self.threads.lock().await = threads;
    }

    pub async fn fail_sends(&self, reason: &str) {
        *self.send_failure.lock().await = Some(reason.to_string());
    }

    pub async fn fail_tokens(&self) {
        *self.token.lock().await = None;
    }

    pub async fn reject_tokens(&self, status: u16, body: &str) {
        *self.token_rejection.lock().await = Some(RequestRejected::from_body(status, body));
    }

    /// Holds the next REST send until the returned sender fires.
    pub async fn gate_next_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock().await = Some(rx);
        tx
    }

    /// Holds the next history fetch until the returned sender fires.
    pub async fn gate_next_history(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.history_gate.lock().await = Some(rx);
        tx
    }

    pub async fn sent(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().await.clone()
    }

    pub async fn attachment_count(&self) -> usize {
        self.attachments.lock().await.len()
    }

    pub async fn reaction_calls(&self) -> Vec<String> {
        self.reaction_calls.lock().await.clone()
    }

    pub async fn archived(&self) -> Vec<UserId> {
        self.archived.lock().await.clone()
    }

    pub async fn list_messages_calls(&self) -> usize {
        self.list_messages_calls.load(Ordering::SeqCst)
    }

    pub async fn list_threads_calls(&self) -> usize {
        self.list_threads_calls.load(Ordering::SeqCst)
    }

    fn created(&self, receiver_id: &UserId, content: Option<String>) -> ChatMessage {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        ChatMessage {
            id: MessageId::new(format!("msg_{n}")),
            sender_id: self.me.clone(),
            receiver_id: receiver_id.clone(),
            content,
            image_url: None,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    async fn pass_gate_or_fail(&self) -> Result<()> {
        let gate = self.send_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(reason) = self.send_failure.lock().await.clone() {
            return Err(anyhow!(reason));
        }
        Ok(())
    }
}

#[async_trait]
impl MessagingApi for FakeApi {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.list_threads_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.threads.lock().await.clone())
    }

    async fn list_messages(&self, peer: &UserId) -> Result<Vec<ChatMessage>> {
        self.list_messages_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.history_gate.lock().await.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self
            .history
            .lock()
            .await
            .iter()
            .filter(|m| m.counterpart(&self.me) == Some(peer))
            .cloned()
            .collect())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        self.sent.lock().await.push(request.clone());
        self.pass_gate_or_fail().await?;
        Ok(self.created(&request.receiver_id, Some(request.content.clone())))
    }

    async fn send_message_with_attachment(
        &self,
        receiver_id: &UserId,
        content: Option<&str>,
        attachment: AttachmentUpload,
    ) -> Result<ChatMessage> {
        let filename = attachment.filename.clone();
        self.attachments.lock().await.push(attachment);
        self.pass_gate_or_fail().await?;
        let mut created = self.created(receiver_id, content.map(str::to_string));
        created.image_url = Some(format!("/uploads/{filename}"));
        Ok(created)
    }

    async fn fetch_ws_token(&self) -> Result<String> {
        if let Some(rejection) = self.token_rejection.lock().await.clone() {
            return Err(rejection.into());
        }
        self.token
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("token endpoint unavailable"))
    }

    async fn add_reaction(&self, message_id: &MessageId, reaction: &str) -> Result<()> {
        self.reaction_calls
            .lock()
            .await
            .push(format!("add {message_id} {reaction}"));
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &MessageId) -> Result<()> {
        self.reaction_calls
            .lock()
            .await
            .push(format!("remove {message_id}"));
        Ok(())
    }

    async fn archive_thread(&self, peer: &UserId) -> Result<()> {
        self.archived.lock().await.push(peer.clone());
        Ok(())
    }
}
