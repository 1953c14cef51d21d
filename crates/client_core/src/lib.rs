use std::sync::Arc;

use shared::domain::{ChatMessage, ConnectionStatus};

pub mod channel;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod events;
pub mod rest;
pub mod token;

pub use channel::{MessageChannel, PendingSend, SendError};
pub use config::{load_config, ClientConfig};
pub use connection::{ConnectError, ConnectionManager, OutboundSocket, SocketEvents};
pub use conversation::{ConversationController, ConversationError, Peer};
pub use events::Subscription;
pub use rest::{ChatApi, HttpChatApi};
pub use token::{user_id_from_token, InMemoryTokenStore, TokenPair, TokenStore};

/// Single entry point for real-time messaging: one connection manager plus
/// one message channel, wired so every freshly opened socket gets the frame
/// handler attached and the pending queue flushed.
///
/// Construct exactly one per owning scope (application root) and share it by
/// `Arc`; it lives for the session and is dropped on teardown. Tests build
/// fresh instances per case.
pub struct MessagingService {
    connection: Arc<ConnectionManager>,
    channel: Arc<MessageChannel>,
}

impl MessagingService {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenStore>) -> Arc<Self> {
        let channel = Arc::new(MessageChannel::new());
        let connection = ConnectionManager::new(
            config,
            tokens,
            Arc::clone(&channel) as Arc<dyn SocketEvents>,
        );
        Arc::new(Self {
            connection,
            channel,
        })
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn force_reconnect(&self) {
        self.connection.force_reconnect().await;
    }

    /// Sends over the live socket when one is open; otherwise the channel
    /// queues the message and reports `NotConnected`.
    pub async fn send_message(
        &self,
        receiver_number: &str,
        content: &str,
    ) -> Result<ChatMessage, SendError> {
        let socket = self.connection.socket().await;
        self.channel
            .send_message(socket.as_ref(), receiver_number, content)
            .await
    }

    pub fn on_message(
        &self,
        handler: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.channel.on_message(handler)
    }

    pub fn on_message_sent(
        &self,
        handler: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.channel.on_message_sent(handler)
    }

    pub fn on_connection_status(
        &self,
        handler: impl Fn(&ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.connection.on_status(handler)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.current_status()
    }

    pub async fn is_healthy(&self) -> bool {
        self.connection.is_healthy().await
    }

    pub fn pending_count(&self) -> usize {
        self.channel.pending_count()
    }

    pub fn clear_pending(&self) {
        self.channel.clear_pending();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
