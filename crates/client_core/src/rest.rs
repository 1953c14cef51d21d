use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatMessage, ConversationSummary, DeliveryStatus},
    error::ApiError,
    protocol::{DocumentId, WireTimestamp},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{config::ClientConfig, token::TokenStore};

/// REST collaborator consumed for history, edits, and the chat list. The
/// websocket is the send path; persistence happens server-side on receipt.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn get_messages(&self, peer_number: &str) -> Result<Vec<ChatMessage>, ApiError>;
    async fn update_message(&self, message_id: &str, content: &str)
        -> Result<ChatMessage, ApiError>;
    async fn get_chat_list(&self) -> Result<Vec<ConversationSummary>, ApiError>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

#[derive(Debug, Serialize)]
struct GetMessagesRequest<'a> {
    receiver_number: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateMessageRequest<'a> {
    id: &'a str,
    new_message: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagesResponse {
    Bare(Vec<RawStoredMessage>),
    Wrapped { messages: Vec<RawStoredMessage> },
}

/// Stored message as the backend returns it; field names vary between the
/// persistence and websocket paths, so everything is optional with fallbacks.
#[derive(Debug, Deserialize)]
struct RawStoredMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "_id")]
    doc_id: Option<DocumentId>,
    #[serde(default)]
    sender_id: Option<String>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    receiver_id: Option<String>,
    #[serde(default)]
    receiver: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    created_at: Option<WireTimestamp>,
}

#[derive(Debug, Deserialize)]
struct RawChatListItem {
    partner_id: String,
    partner_name: String,
    partner_number: String,
    #[serde(default)]
    last_message: String,
    #[serde(default)]
    last_message_at: Option<WireTimestamp>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

impl HttpChatApi {
    pub fn new(config: &ClientConfig, tokens: Arc<dyn TokenStore>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ApiError::network(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    /// Sends one request with bearer auth. A 401 triggers exactly one token
    /// refresh and retry; a failed refresh clears the stored tokens.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, ApiError> {
        let response = self.request_once(method.clone(), path, body.clone()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!(path, "unauthorized response; attempting token refresh");
        match self.tokens.refresh().await {
            Ok(()) => self.request_once(method, path, body).await,
            Err(err) => {
                self.tokens.clear();
                Err(ApiError::from_status(
                    401,
                    format!("token refresh failed: {}", err.message),
                ))
            }
        }
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, ApiError> {
        let mut request = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = self.tokens.access_token() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        request
            .send()
            .await
            .map_err(|err| ApiError::network(format!("network error: {err}")))
    }

    async fn read_error(response: Response) -> (u16, ErrorBody) {
        let status = response.status().as_u16();
        let body = response.json::<ErrorBody>().await.unwrap_or_default();
        (status, body)
    }

    fn api_error(status: u16, body: ErrorBody) -> ApiError {
        let message = body
            .error
            .or(body.message)
            .unwrap_or_else(|| "api error".to_string());
        ApiError::from_status(status, message)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn get_messages(&self, peer_number: &str) -> Result<Vec<ChatMessage>, ApiError> {
        debug!(peer = %peer_number, "fetching conversation history");
        let payload = serde_json::to_value(GetMessagesRequest {
            receiver_number: peer_number,
        })
        .map_err(|err| ApiError::network(err.to_string()))?;
        let response = self
            .execute(Method::POST, "/get_message", Some(payload))
            .await?;
        let status = response.status();

        if !status.is_success() {
            if matches!(status.as_u16(), 400 | 404) {
                info!(peer = %peer_number, "no conversation found; treating as empty history");
                return Ok(Vec::new());
            }
            let (code, body) = Self::read_error(response).await;
            let detail_says_empty = body
                .details
                .as_deref()
                .is_some_and(|details| details.contains("no messages found"));
            if code == 500 && detail_says_empty {
                info!(peer = %peer_number, "backend reported no messages; treating as empty history");
                return Ok(Vec::new());
            }
            return Err(Self::api_error(code, body));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|err| ApiError::network(format!("invalid messages payload: {err}")))?;
        let raw = match body {
            MessagesResponse::Bare(messages) => messages,
            MessagesResponse::Wrapped { messages } => messages,
        };
        Ok(raw.into_iter().map(stored_message_to_chat).collect())
    }

    async fn update_message(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ApiError> {
        debug!(message_id, "updating message");
        let payload = serde_json::to_value(UpdateMessageRequest {
            id: message_id,
            new_message: content,
        })
        .map_err(|err| ApiError::network(err.to_string()))?;
        let response = self
            .execute(Method::POST, "/update_message", Some(payload))
            .await?;

        if !response.status().is_success() {
            let (code, body) = Self::read_error(response).await;
            return Err(Self::api_error(code, body));
        }

        // the backend acknowledges without echoing the document; assemble the
        // edited view locally
        let now = Utc::now();
        Ok(ChatMessage {
            id: message_id.to_string(),
            sender: String::new(),
            receiver: String::new(),
            content: content.to_string(),
            timestamp: now,
            status: DeliveryStatus::Sent,
            edited: true,
            edited_at: Some(now),
        })
    }

    async fn get_chat_list(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        let response = self.execute(Method::GET, "/chat_list", None).await?;
        let status = response.status();

        if !status.is_success() {
            if matches!(status.as_u16(), 404 | 500) {
                info!("no chat list found; returning empty list");
                return Ok(Vec::new());
            }
            let (code, body) = Self::read_error(response).await;
            return Err(Self::api_error(code, body));
        }

        let items: Vec<RawChatListItem> = response
            .json()
            .await
            .map_err(|err| ApiError::network(format!("invalid chat list payload: {err}")))?;

        // collapse duplicate partners, keeping the newest entry per partner
        let mut latest: HashMap<String, ConversationSummary> = HashMap::new();
        for item in items {
            let summary = ConversationSummary {
                partner_id: item.partner_id,
                partner_name: item.partner_name,
                partner_number: item.partner_number,
                last_message: item.last_message,
                last_message_at: item
                    .last_message_at
                    .as_ref()
                    .and_then(WireTimestamp::parse)
                    .unwrap_or_else(Utc::now),
            };
            match latest.get(&summary.partner_id) {
                Some(existing) if existing.last_message_at >= summary.last_message_at => {}
                _ => {
                    latest.insert(summary.partner_id.clone(), summary);
                }
            }
        }

        let mut list: Vec<ConversationSummary> = latest.into_values().collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(list)
    }
}

fn stored_message_to_chat(raw: RawStoredMessage) -> ChatMessage {
    let id = raw
        .id
        .filter(|value| !value.is_empty())
        .or_else(|| raw.doc_id.map(DocumentId::into_string))
        .unwrap_or_else(|| format!("rest_{}", Uuid::new_v4().simple()));

    ChatMessage {
        id,
        sender: raw.sender_id.or(raw.sender).unwrap_or_default(),
        receiver: raw.receiver_id.or(raw.receiver).unwrap_or_default(),
        content: raw.message.or(raw.content).unwrap_or_default(),
        timestamp: raw
            .created_at
            .as_ref()
            .and_then(WireTimestamp::parse)
            .unwrap_or_else(Utc::now),
        status: DeliveryStatus::Sent,
        edited: false,
        edited_at: None,
    }
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
