use std::sync::Mutex as StdMutex;

use shared::domain::ConnectionState;

use super::*;
use crate::token::InMemoryTokenStore;

use ws_fixture::{wait_until, WsFixture};

struct NullEvents;

#[async_trait]
impl SocketEvents for NullEvents {
    async fn frame_received(&self, _raw: String) {}

    async fn socket_opened(&self, _socket: OutboundSocket) {}
}

fn test_config(ws_base_url: &str) -> ClientConfig {
    ClientConfig {
        ws_base_url: ws_base_url.to_string(),
        reconnect_base_delay: Duration::from_millis(40),
        ..ClientConfig::default()
    }
}

fn manager_with(
    ws_base_url: &str,
    tokens: Arc<dyn TokenStore>,
) -> Arc<ConnectionManager> {
    ConnectionManager::new(test_config(ws_base_url), tokens, Arc::new(NullEvents))
}

fn collect_statuses(
    manager: &ConnectionManager,
) -> (Arc<StdMutex<Vec<ConnectionStatus>>>, Subscription) {
    let statuses = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let subscription = manager.on_status(move |status| {
        sink.lock().expect("lock").push(status.clone());
    });
    (statuses, subscription)
}

#[test]
fn backoff_delay_doubles_per_attempt() {
    let base = Duration::from_secs(1);
    assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
    assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
    assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    assert_eq!(backoff_delay(base, 4), Duration::from_secs(8));
    assert_eq!(backoff_delay(base, 5), Duration::from_secs(16));

    for attempt in 2..=5 {
        assert!(backoff_delay(base, attempt) > backoff_delay(base, attempt - 1));
    }
}

#[tokio::test]
async fn subscriber_receives_current_status_on_registration() {
    let manager = manager_with("ws://127.0.0.1:1", Arc::new(InMemoryTokenStore::new()));
    let (statuses, _sub) = collect_statuses(&manager);

    let statuses = statuses.lock().expect("lock");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].state, ConnectionState::Disconnected);
    assert_eq!(statuses[0].reconnect_attempts, 0);
}

#[tokio::test]
async fn connect_without_token_fails_and_reports_status() {
    let manager = manager_with("ws://127.0.0.1:1", Arc::new(InMemoryTokenStore::new()));
    let (statuses, _sub) = collect_statuses(&manager);

    let err = manager.connect().await.expect_err("must fail");
    assert!(matches!(err, ConnectError::NoCredential));

    let statuses = statuses.lock().expect("lock");
    let last = statuses.last().expect("status");
    assert_eq!(last.state, ConnectionState::Disconnected);
    assert!(last
        .error
        .as_deref()
        .is_some_and(|error| error.contains("authentication")));
}

#[tokio::test]
async fn connect_embeds_access_token_and_reaches_connected() {
    let mut fixture = WsFixture::spawn().await;
    let manager = manager_with(
        &fixture.ws_url,
        Arc::new(InMemoryTokenStore::with_tokens("token-abc", "refresh")),
    );

    manager.connect().await.expect("connect");

    let status = manager.current_status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert!(status.last_connected.is_some());
    assert!(manager.is_healthy().await);

    let token = fixture
        .next_token(Duration::from_secs(1))
        .await
        .expect("client connected");
    assert_eq!(token.as_deref(), Some("token-abc"));
}

#[tokio::test]
async fn connect_when_already_open_is_a_noop() {
    let mut fixture = WsFixture::spawn().await;
    let manager = manager_with(
        &fixture.ws_url,
        Arc::new(InMemoryTokenStore::with_tokens("token", "refresh")),
    );

    manager.connect().await.expect("connect");
    manager.connect().await.expect("second connect resolves");

    assert!(fixture.next_token(Duration::from_millis(300)).await.is_some());
    assert!(
        fixture.next_token(Duration::from_millis(300)).await.is_none(),
        "no second socket may be opened"
    );
}

#[tokio::test]
async fn disconnect_twice_emits_a_single_transition() {
    let mut fixture = WsFixture::spawn().await;
    let manager = manager_with(
        &fixture.ws_url,
        Arc::new(InMemoryTokenStore::with_tokens("token", "refresh")),
    );
    let (statuses, _sub) = collect_statuses(&manager);

    manager.connect().await.expect("connect");
    fixture.next_token(Duration::from_secs(1)).await.expect("connected");

    manager.disconnect().await;
    manager.disconnect().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let statuses = statuses.lock().expect("lock");
    let disconnects_after_connect = statuses
        .iter()
        .skip_while(|status| status.state != ConnectionState::Connected)
        .filter(|status| status.state == ConnectionState::Disconnected)
        .count();
    assert_eq!(disconnects_after_connect, 1);
    assert!(statuses.last().expect("status").error.is_none());
}

#[tokio::test]
async fn manual_disconnect_disables_automatic_reconnection() {
    let mut fixture = WsFixture::spawn().await;
    let manager = manager_with(
        &fixture.ws_url,
        Arc::new(InMemoryTokenStore::with_tokens("token", "refresh")),
    );

    manager.connect().await.expect("connect");
    fixture.next_token(Duration::from_secs(1)).await.expect("connected");

    manager.disconnect().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(
        fixture.next_token(Duration::from_millis(200)).await.is_none(),
        "manual disconnect must not trigger retries"
    );
    let status = manager.current_status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!manager.is_healthy().await);
}

#[tokio::test]
async fn abnormal_close_schedules_reconnect_and_recovers() {
    let mut fixture = WsFixture::spawn().await;
    let manager = manager_with(
        &fixture.ws_url,
        Arc::new(InMemoryTokenStore::with_tokens("token", "refresh")),
    );
    let (statuses, _sub) = collect_statuses(&manager);

    manager.connect().await.expect("connect");
    fixture.next_token(Duration::from_secs(1)).await.expect("connected");

    fixture.drop_client().await;

    assert!(
        fixture.next_token(Duration::from_secs(3)).await.is_some(),
        "a reconnect attempt must reach the server"
    );
    let manager_for_wait = Arc::clone(&manager);
    assert!(
        wait_until(
            move || manager_for_wait.current_status().state == ConnectionState::Connected,
            Duration::from_secs(3),
        )
        .await
    );

    let statuses = statuses.lock().expect("lock");
    assert!(statuses
        .iter()
        .any(|status| status.state == ConnectionState::Reconnecting
            && status.reconnect_attempts == 1));
    assert!(statuses
        .iter()
        .any(|status| status.state == ConnectionState::Disconnected
            && status.error.is_some()));
}

#[tokio::test]
async fn reconnect_stops_after_attempt_cap() {
    // nothing listens on this port, so every attempt fails fast
    let manager = ConnectionManager::new(
        ClientConfig {
            ws_base_url: "ws://127.0.0.1:9".to_string(),
            reconnect_base_delay: Duration::from_millis(10),
            ..ClientConfig::default()
        },
        Arc::new(InMemoryTokenStore::with_tokens("token", "refresh")),
        Arc::new(NullEvents),
    );
    let (statuses, _sub) = collect_statuses(&manager);

    manager
        .connect()
        .await
        .expect("handshake failures are not returned to the caller");

    let statuses_for_wait = Arc::clone(&statuses);
    assert!(
        wait_until(
            move || statuses_for_wait
                .lock()
                .expect("lock")
                .iter()
                .any(|status| status.reconnect_attempts == 5),
            Duration::from_secs(5),
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let statuses = statuses.lock().expect("lock");
    let max_attempt = statuses
        .iter()
        .map(|status| status.reconnect_attempts)
        .max();
    assert_eq!(max_attempt, Some(5));
    assert_eq!(manager.current_status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn force_reconnect_recovers_after_manual_disconnect() {
    let mut fixture = WsFixture::spawn().await;
    let manager = manager_with(
        &fixture.ws_url,
        Arc::new(InMemoryTokenStore::with_tokens("token", "refresh")),
    );

    manager.connect().await.expect("connect");
    fixture.next_token(Duration::from_secs(1)).await.expect("connected");

    manager.disconnect().await;
    manager.force_reconnect().await;

    assert!(
        fixture.next_token(Duration::from_secs(3)).await.is_some(),
        "manual retry must open a fresh socket"
    );
    let manager_for_wait = Arc::clone(&manager);
    assert!(
        wait_until(
            move || manager_for_wait.current_status().state == ConnectionState::Connected,
            Duration::from_secs(3),
        )
        .await
    );
}
