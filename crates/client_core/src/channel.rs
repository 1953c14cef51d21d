use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatMessage, DeliveryStatus},
    protocol::{InboundFrame, OutboundChatFrame},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    connection::{OutboundSocket, SocketEvents},
    events::{HandlerRegistry, Subscription},
};

/// A send attempted while the socket was unavailable. Entries live only
/// until the next successful flush or an explicit clear; the UI sees them
/// as a count, never individually.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSend {
    pub receiver_number: String,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("websocket not connected; message queued for the next connection")]
    NotConnected,
    #[error("websocket send failed: {0}")]
    Transport(String),
}

/// Translates between wire frames and `ChatMessage`, owns the pending-send
/// queue, and fans inbound messages and send confirmations out to
/// subscribers. Duplicate suppression is deliberately left to consumers:
/// the channel has no visibility into what is already rendered.
#[derive(Default)]
pub struct MessageChannel {
    message_handlers: HandlerRegistry<ChatMessage>,
    sent_handlers: HandlerRegistry<ChatMessage>,
    pending: Mutex<VecDeque<PendingSend>>,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one raw socket payload. Control frames and malformed chat
    /// frames are dropped here and never reach subscribers.
    pub fn handle_incoming_frame(&self, raw: &str) {
        let frame = match InboundFrame::parse(raw) {
            Ok(InboundFrame::Control(kind)) => {
                debug!(?kind, "control frame received");
                return;
            }
            Ok(InboundFrame::Chat(frame)) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed inbound frame");
                return;
            }
        };

        let message = ChatMessage {
            id: frame
                .id
                .unwrap_or_else(|| format!("ws_{}", Uuid::new_v4().simple())),
            sender: frame.sender_id,
            receiver: frame.receiver_id,
            content: frame.message,
            timestamp: frame.created_at.unwrap_or_else(Utc::now),
            status: DeliveryStatus::Delivered,
            edited: false,
            edited_at: None,
        };

        debug!(id = %message.id, sender = %message.sender, "inbound chat message");
        self.message_handlers.notify(&message);
    }

    /// Transmits a chat payload over the given socket, or queues it when no
    /// open socket is available. Any send failure puts the entry (back) on
    /// the queue; the queue flushes on the next successful open.
    ///
    /// On success a locally synthesized `sent` message is returned
    /// immediately; the channel never waits for a server acknowledgment.
    pub async fn send_message(
        &self,
        socket: Option<&OutboundSocket>,
        receiver_number: &str,
        content: &str,
    ) -> Result<ChatMessage, SendError> {
        let Some(socket) = socket.filter(|socket| socket.is_open()) else {
            warn!(receiver = %receiver_number, "websocket not open; queueing outbound message");
            self.enqueue(receiver_number, content);
            return Err(SendError::NotConnected);
        };

        let clean_receiver = receiver_number.strip_prefix('+').unwrap_or(receiver_number);
        let frame = OutboundChatFrame {
            receiver_number: clean_receiver.to_string(),
            message: content.to_string(),
        };
        let payload = match serde_json::to_string(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.enqueue(receiver_number, content);
                return Err(SendError::Transport(err.to_string()));
            }
        };

        if let Err(err) = socket.send_text(payload).await {
            warn!(error = %err, receiver = %clean_receiver, "websocket send failed; re-queueing");
            self.enqueue(receiver_number, content);
            return Err(SendError::Transport(err.to_string()));
        }

        let sent = ChatMessage {
            id: format!("ws_sent_{}", Uuid::new_v4().simple()),
            // the conversation layer knows the local identity; the channel
            // does not
            sender: String::new(),
            receiver: clean_receiver.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Sent,
            edited: false,
            edited_at: None,
        };

        self.sent_handlers.notify(&sent);
        Ok(sent)
    }

    /// Re-sends every queued entry against a now-open socket. Entries that
    /// fail again re-enter the queue rather than being dropped.
    pub async fn flush_pending(&self, socket: &OutboundSocket) {
        let queued: Vec<PendingSend> = self.lock_pending().drain(..).collect();
        if queued.is_empty() {
            return;
        }

        info!(count = queued.len(), "flushing queued messages");
        for entry in queued {
            if let Err(err) = self
                .send_message(Some(socket), &entry.receiver_number, &entry.content)
                .await
            {
                // send_message already put the entry back on the queue
                warn!(error = %err, receiver = %entry.receiver_number, "queued message failed to flush");
            }
        }
    }

    pub fn on_message(
        &self,
        handler: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.message_handlers.subscribe(handler)
    }

    pub fn on_message_sent(
        &self,
        handler: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.sent_handlers.subscribe(handler)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn clear_pending(&self) {
        self.lock_pending().clear();
    }

    fn enqueue(&self, receiver_number: &str, content: &str) {
        self.lock_pending().push_back(PendingSend {
            receiver_number: receiver_number.to_string(),
            content: content.to_string(),
            queued_at: Utc::now(),
        });
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingSend>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SocketEvents for MessageChannel {
    async fn frame_received(&self, raw: String) {
        self.handle_incoming_frame(&raw);
    }

    async fn socket_opened(&self, socket: OutboundSocket) {
        self.flush_pending(&socket).await;
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
