use std::sync::Mutex as StdMutex;

use super::*;

fn collect_messages(
    channel: &MessageChannel,
) -> (std::sync::Arc<StdMutex<Vec<ChatMessage>>>, Subscription) {
    let seen = std::sync::Arc::new(StdMutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    let subscription = channel.on_message(move |message| {
        sink.lock().expect("lock").push(message.clone());
    });
    (seen, subscription)
}

#[test]
fn malformed_frames_never_reach_subscribers() {
    let channel = MessageChannel::new();
    let (seen, _sub) = collect_messages(&channel);

    channel.handle_incoming_frame("not json at all");
    channel.handle_incoming_frame(r#"{"receiver_id":"b","message":"x"}"#);
    channel.handle_incoming_frame(r#"{"sender_id":"a","message":"x"}"#);
    channel.handle_incoming_frame(r#"{"sender_id":"a","receiver_id":"b"}"#);
    channel.handle_incoming_frame(r#"{"sender_id":"a","receiver_id":"b","message":""}"#);

    assert!(seen.lock().expect("lock").is_empty());
}

#[test]
fn control_frames_are_dropped_silently() {
    let channel = MessageChannel::new();
    let (seen, _sub) = collect_messages(&channel);

    channel.handle_incoming_frame(r#"{"type":"ping","timestamp":"2024-01-01T10:00:00Z"}"#);
    channel.handle_incoming_frame(r#"{"type":"pong"}"#);

    assert!(seen.lock().expect("lock").is_empty());
}

#[test]
fn valid_frame_becomes_delivered_message() {
    let channel = MessageChannel::new();
    let (seen, _sub) = collect_messages(&channel);

    channel.handle_incoming_frame(
        r#"{"id":"m7","sender_id":"777","receiver_id":"555","message":"hello","created_at":"2024-01-01T10:00:01Z"}"#,
    );

    let seen = seen.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    let message = &seen[0];
    assert_eq!(message.id, "m7");
    assert_eq!(message.sender, "777");
    assert_eq!(message.receiver, "555");
    assert_eq!(message.content, "hello");
    assert_eq!(message.status, DeliveryStatus::Delivered);
    assert_eq!(message.timestamp.to_rfc3339(), "2024-01-01T10:00:01+00:00");
}

#[test]
fn message_id_prefers_server_id_then_document_id() {
    let channel = MessageChannel::new();
    let (seen, _sub) = collect_messages(&channel);

    channel.handle_incoming_frame(
        r#"{"id":"server-1","_id":{"$oid":"doc-1"},"sender_id":"a","receiver_id":"b","message":"x"}"#,
    );
    channel.handle_incoming_frame(
        r#"{"_id":{"$oid":"doc-2"},"sender_id":"a","receiver_id":"b","message":"y"}"#,
    );
    channel.handle_incoming_frame(r#"{"sender_id":"a","receiver_id":"b","message":"z"}"#);

    let seen = seen.lock().expect("lock");
    assert_eq!(seen[0].id, "server-1");
    assert_eq!(seen[1].id, "doc-2");
    assert!(seen[2].id.starts_with("ws_"), "generated fallback id");
}

#[test]
fn unparsable_timestamp_falls_back_to_now() {
    let channel = MessageChannel::new();
    let (seen, _sub) = collect_messages(&channel);

    channel.handle_incoming_frame(
        r#"{"sender_id":"a","receiver_id":"b","message":"x","created_at":"definitely not a date"}"#,
    );

    let seen = seen.lock().expect("lock");
    let age = (Utc::now() - seen[0].timestamp).num_seconds().abs();
    assert!(age < 5, "fallback timestamp must be close to now");
}

#[test]
fn subscriber_panic_does_not_block_siblings() {
    let channel = MessageChannel::new();
    let _panicking = channel.on_message(|_| panic!("render failure"));
    let (seen, _sub) = collect_messages(&channel);

    channel.handle_incoming_frame(r#"{"sender_id":"a","receiver_id":"b","message":"x"}"#);

    assert_eq!(seen.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn send_without_socket_queues_and_fails() {
    let channel = MessageChannel::new();

    let err = channel
        .send_message(None, "+15551234", "hello")
        .await
        .expect_err("must fail");
    assert!(matches!(err, SendError::NotConnected));

    assert_eq!(channel.pending_count(), 1);
    let entry = channel.lock_pending()[0].clone();
    assert_eq!(entry.receiver_number, "+15551234");
    assert_eq!(entry.content, "hello");

    channel.clear_pending();
    assert_eq!(channel.pending_count(), 0);
}

#[tokio::test]
async fn queued_sends_accumulate_in_order() {
    let channel = MessageChannel::new();

    let _ = channel.send_message(None, "777", "first").await;
    let _ = channel.send_message(None, "888", "second").await;

    assert_eq!(channel.pending_count(), 2);
    let pending = channel.lock_pending();
    assert_eq!(pending[0].content, "first");
    assert_eq!(pending[1].content, "second");
    assert!(pending[0].queued_at <= pending[1].queued_at);
}

#[tokio::test]
async fn sent_subscribers_are_not_notified_for_queued_messages() {
    let channel = MessageChannel::new();
    let confirmations = std::sync::Arc::new(StdMutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&confirmations);
    let _sub = channel.on_message_sent(move |message| {
        sink.lock().expect("lock").push(message.clone());
    });

    let _ = channel.send_message(None, "777", "offline").await;

    assert!(confirmations.lock().expect("lock").is_empty());
}
