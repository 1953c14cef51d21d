use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use shared::{
    domain::{ChatMessage, ConversationSummary, DeliveryStatus},
    error::ApiError,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{channel::SendError, events::Subscription, rest::ChatApi, MessagingService};

/// Timestamp proximity under which a same-content, same-sender message is
/// considered an echo of one already in the list.
const DUPLICATE_WINDOW_MS: i64 = 2_000;

/// The selected conversation partner. `id` is the durable identifier when
/// the backend provided one; `number` is the raw address used on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub number: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, number: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            number: number.into(),
        }
    }

    pub fn from_summary(summary: &ConversationSummary) -> Self {
        Self::new(summary.partner_id.clone(), summary.partner_number.clone())
    }

    fn identifier(&self) -> &str {
        if self.id.is_empty() {
            &self.number
        } else {
            &self.id
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("message content is empty")]
    EmptyMessage,
    #[error("a send is already in flight for this conversation")]
    SendInFlight,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Send(#[from] SendError),
}

struct ConversationState {
    messages: Vec<ChatMessage>,
    is_sending: bool,
    is_loading: bool,
}

/// Authoritative in-memory message list for one conversation: loads history,
/// applies optimistic inserts for sends, reconciles results, and filters the
/// shared inbound stream for relevance. All retries are user-initiated.
pub struct ConversationController {
    api: Arc<dyn ChatApi>,
    messaging: Arc<MessagingService>,
    current_user: String,
    peer: Peer,
    state: Mutex<ConversationState>,
}

impl ConversationController {
    pub fn new(
        api: Arc<dyn ChatApi>,
        messaging: Arc<MessagingService>,
        current_user: impl Into<String>,
        peer: Peer,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            messaging,
            current_user: current_user.into(),
            peer,
            state: Mutex::new(ConversationState {
                messages: Vec::new(),
                is_sending: false,
                is_loading: false,
            }),
        })
    }

    /// Subscribes this conversation to the facade's inbound stream. Dropping
    /// the returned guard detaches it again.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let controller = Arc::clone(self);
        self.messaging
            .on_message(move |message| controller.receive(message))
    }

    /// Replaces the local list with the persisted history, sorted ascending
    /// by timestamp. The REST layer already normalizes "no messages" to an
    /// empty result; anything surfacing here is a real failure.
    pub async fn load_history(&self) -> Result<Vec<ChatMessage>, ConversationError> {
        self.lock().is_loading = true;
        let result = self.api.get_messages(&self.peer.number).await;

        let mut state = self.lock();
        state.is_loading = false;
        let mut messages = match result {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, peer = %self.peer.number, "history load failed");
                return Err(err.into());
            }
        };
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        info!(count = messages.len(), peer = %self.peer.number, "history loaded");
        state.messages = messages.clone();
        Ok(messages)
    }

    /// Optimistically inserts a `sending` entry, then hands the content to
    /// the messaging facade. On success the same entry is reconciled in
    /// place (server fields merged, status `sent`); on failure it flips to
    /// `failed` and stays for a manual retry.
    pub async fn send(&self, content: &str) -> Result<ChatMessage, ConversationError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }

        let temp_id = format!("temp_{}", Uuid::new_v4().simple());
        {
            let mut state = self.lock();
            if state.is_sending {
                return Err(ConversationError::SendInFlight);
            }
            state.is_sending = true;
            let optimistic = ChatMessage {
                id: temp_id.clone(),
                sender: self.current_user.clone(),
                receiver: self.peer.identifier().to_string(),
                content: trimmed.to_string(),
                timestamp: Utc::now(),
                status: DeliveryStatus::Sending,
                edited: false,
                edited_at: None,
            };
            insert_sorted(&mut state.messages, optimistic);
        }

        let result = self.messaging.send_message(&self.peer.number, trimmed).await;

        let mut state = self.lock();
        state.is_sending = false;
        match result {
            Ok(sent) => {
                if let Some(entry) = state.messages.iter_mut().find(|m| m.id == temp_id) {
                    entry.id = sent.id.clone();
                    entry.timestamp = sent.timestamp;
                    entry.status = DeliveryStatus::Sent;
                }
                let confirmed = state
                    .messages
                    .iter()
                    .find(|m| m.id == sent.id)
                    .cloned()
                    .unwrap_or(sent);
                state.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
                Ok(confirmed)
            }
            Err(err) => {
                if let Some(entry) = state.messages.iter_mut().find(|m| m.id == temp_id) {
                    entry.status = DeliveryStatus::Failed;
                }
                warn!(error = %err, "send failed; optimistic entry marked failed");
                Err(err.into())
            }
        }
    }

    /// Inbound-stream handler: drops messages that do not belong to this
    /// conversation, suppresses duplicates (optimistic echo included), and
    /// keeps the list timestamp-sorted.
    pub fn receive(&self, message: &ChatMessage) {
        if !self.is_relevant(message) {
            debug!(
                sender = %message.sender,
                receiver = %message.receiver,
                "message not relevant to this conversation; dropped"
            );
            return;
        }

        let mut state = self.lock();
        if is_duplicate(&state.messages, message) {
            debug!(id = %message.id, "duplicate message suppressed");
            return;
        }
        insert_sorted(&mut state.messages, message.clone());
    }

    /// Rewrites a message's content through the REST collaborator. The local
    /// entry is only touched after the backend accepted the edit.
    pub async fn edit(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ConversationError> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }

        let updated = self.api.update_message(message_id, trimmed).await?;

        let mut state = self.lock();
        if let Some(entry) = state.messages.iter_mut().find(|m| m.id == message_id) {
            entry.content = trimmed.to_string();
            entry.edited = true;
            entry.edited_at = updated.edited_at.or_else(|| Some(Utc::now()));
            return Ok(entry.clone());
        }
        Ok(updated)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock().messages.clone()
    }

    pub fn is_sending(&self) -> bool {
        self.lock().is_sending
    }

    pub fn is_loading(&self) -> bool {
        self.lock().is_loading
    }

    pub fn clear(&self) {
        self.lock().messages.clear();
    }

    fn is_relevant(&self, message: &ChatMessage) -> bool {
        let peer_identifier = self.peer.identifier();
        let incoming = (message.sender == peer_identifier || message.sender == self.peer.number)
            && message.receiver == self.current_user;
        let outgoing = message.sender == self.current_user
            && (message.receiver == peer_identifier || message.receiver == self.peer.number);
        incoming || outgoing
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_duplicate(messages: &[ChatMessage], candidate: &ChatMessage) -> bool {
    messages.iter().any(|existing| {
        existing.id == candidate.id
            || (existing.content == candidate.content
                && existing.sender == candidate.sender
                && (existing.timestamp - candidate.timestamp)
                    .num_milliseconds()
                    .abs()
                    <= DUPLICATE_WINDOW_MS)
    })
}

fn insert_sorted(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    let index = messages.partition_point(|existing| existing.timestamp <= message.timestamp);
    messages.insert(index, message);
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
