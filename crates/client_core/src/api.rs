use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{MessageId, UserId},
    error::RequestRejected,
    protocol::{
        ChatMessage, ReactionRequest, SendMessageRequest, ThreadSummary, WsTokenResponse,
    },
};

#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Request/response collaborator that owns persistence, unread counts and auth.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>>;
    async fn list_messages(&self, peer: &UserId) -> Result<Vec<ChatMessage>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage>;
    async fn send_message_with_attachment(
        &self,
        receiver_id: &UserId,
        content: Option<&str>,
        attachment: AttachmentUpload,
    ) -> Result<ChatMessage>;
    async fn fetch_ws_token(&self) -> Result<String>;
    async fn add_reaction(&self, message_id: &MessageId, reaction: &str) -> Result<()>;
    async fn remove_reaction(&self, message_id: &MessageId) -> Result<()>;
    async fn archive_thread(&self, peer: &UserId) -> Result<()>;
}

pub struct HttpMessagingApi {
    http: Client,
    server_url: String,
    bearer_token: Option<String>,
}

impl HttpMessagingApi {
    pub fn new(server_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            bearer_token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.server_url));
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RequestRejected::from_body(status.as_u16(), &body).into())
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let response = ensure_success(response).await?;
    response
        .json()
        .await
        .context("failed to decode response body")
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        let response = self.request(Method::GET, "/threads").send().await?;
        read_json(response).await
    }

    async fn list_messages(&self, peer: &UserId) -> Result<Vec<ChatMessage>> {
        let response = self
            .request(Method::GET, "/messages")
            .query(&[("peer", peer.as_str())])
            .send()
            .await
            .with_context(|| format!("failed to load messages with {peer}"))?;
        read_json(response).await
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        let response = self
            .request(Method::POST, "/messages")
            .json(request)
            .send()
            .await?;
        read_json(response).await
    }

    async fn send_message_with_attachment(
        &self,
        receiver_id: &UserId,
        content: Option<&str>,
        attachment: AttachmentUpload,
    ) -> Result<ChatMessage> {
        let mime_type = attachment
            .mime_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let part = multipart::Part::bytes(attachment.bytes)
            .file_name(attachment.filename)
            .mime_str(&mime_type)
            .with_context(|| format!("invalid attachment mime type {mime_type}"))?;
        let mut form = multipart::Form::new()
            .text("receiverId", receiver_id.to_string())
            .part("image", part);
        if let Some(content) = content {
            form = form.text("content", content.to_string());
        }

        let response = self
            .request(Method::POST, "/messages/with-attachment")
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }

    async fn fetch_ws_token(&self) -> Result<String> {
        let response = self.request(Method::GET, "/auth/ws-token").send().await?;
        let body: WsTokenResponse = read_json(response).await?;
        Ok(body.token)
    }

    async fn add_reaction(&self, message_id: &MessageId, reaction: &str) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("/messages/{message_id}/reactions"))
            .json(&ReactionRequest {
                reaction: reaction.to_string(),
            })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn remove_reaction(&self, message_id: &MessageId) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("/messages/{message_id}/reactions"))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn archive_thread(&self, peer: &UserId) -> Result<()> {
        let response = self
            .request(Method::POST, &format!("/threads/{peer}/archive"))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
