// Integration tests for multi-path message delivery
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use roshlingua::backend::{DeliveryError, DeliveryPath, MessageQueue, Outbox, SendOutcome, TransportError};
use roshlingua::models::OutgoingMessage;
use roshlingua::storage::MemoryStorage;

mod common;
use common::{rejected, unauthorized, Behaviour, FakeSession, FakeTransport, Paths};

fn message() -> OutgoingMessage {
    OutgoingMessage::text("conv-1", "user-1", "Hola, ¿qué tal?")
}

#[tokio::test]
async fn test_primary_success_skips_fallbacks() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Succeed);
    let sender = paths.sender(FakeSession::with_token("token-a"));

    let msg = message();
    let delivered = sender.deliver(&msg).await?;

    assert_eq!(delivered.path, DeliveryPath::Primary);
    assert!(!delivered.duplicate);
    assert_eq!(delivered.row.id, msg.id);
    assert_eq!(paths.primary.call_count(), 1);
    assert_eq!(paths.rest.call_count(), 0, "Fallbacks must not run after a success");
    assert_eq!(paths.function.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_paths_are_tried_in_order() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(
        Behaviour::Fail(TransportError::Network("connection reset".into())),
        Behaviour::Fail(common::unavailable()),
        Behaviour::Succeed,
    );
    let sender = paths.sender(FakeSession::with_token("token-a"));

    let delivered = sender.deliver(&message()).await?;

    assert_eq!(delivered.path, DeliveryPath::Function);
    assert_eq!(paths.primary.call_count(), 1);
    assert_eq!(paths.rest.call_count(), 1);
    assert_eq!(paths.function.call_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hanging_primary_is_cancelled_after_timeout() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(Behaviour::Hang, Behaviour::Succeed, Behaviour::Succeed);
    let sender = paths.sender(FakeSession::with_token("token-a"));

    let started = tokio::time::Instant::now();
    let delivered = sender.deliver(&message()).await?;

    assert_eq!(delivered.path, DeliveryPath::RestFallback);
    assert!(started.elapsed() >= Duration::from_secs(10), "Primary gets its full 10s");
    assert!(started.elapsed() < Duration::from_secs(11));
    assert!(paths.primary.was_cancelled(), "The timed-out request must be dropped, not left running");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hanging_function_times_out_after_thirty_seconds() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(
        Behaviour::Fail(common::unavailable()),
        Behaviour::Fail(common::unavailable()),
        Behaviour::Hang,
    );
    let sender = paths.sender(FakeSession::with_token("token-a"));

    let started = tokio::time::Instant::now();
    let err = sender.deliver(&message()).await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(30));
    let last = err.failures().last().expect("function failure recorded");
    assert_eq!(last.path, DeliveryPath::Function);
    assert_eq!(last.error, TransportError::Timeout(Duration::from_secs(30)));
    assert!(paths.function.was_cancelled());
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_expired_token_falls_through_to_function() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(
        Behaviour::Fail(unauthorized()),
        Behaviour::Fail(unauthorized()),
        Behaviour::Succeed,
    );
    let session = FakeSession::with_token("expired-token");
    let queue = MessageQueue::open(Arc::new(MemoryStorage::new()));
    let outbox = Outbox::new(paths.sender(session.clone()), queue);

    let outcome = outbox.send(message()).await?;

    match outcome {
        SendOutcome::Delivered(delivered) => assert_eq!(delivered.path, DeliveryPath::Function),
        other => panic!("Expected delivery via function, got {:?}", other),
    }
    assert_eq!(outbox.pending_count().await, 0, "A delivered message is never queued");
    assert_eq!(paths.primary.seen_tokens(), vec!["expired-token".to_string()]);
    assert_eq!(paths.rest.seen_tokens(), vec!["expired-token".to_string()], "Fallback reuses the session token");
    assert_eq!(session.fetches.load(std::sync::atomic::Ordering::SeqCst), 1, "Token read once per attempt");
    Ok(())
}

#[tokio::test]
async fn test_duplicate_counts_as_delivered() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(
        Behaviour::Fail(TransportError::Network("reset".into())),
        Behaviour::Fail(TransportError::Duplicate),
        Behaviour::Succeed,
    );
    let sender = paths.sender(FakeSession::with_token("token-a"));

    let msg = message();
    let delivered = sender.deliver(&msg).await?;

    assert!(delivered.duplicate);
    assert_eq!(delivered.path, DeliveryPath::RestFallback);
    assert_eq!(delivered.row.client_id.as_deref(), Some(msg.client_id.as_str()));
    assert_eq!(paths.function.call_count(), 0, "No further insert after a duplicate");
    Ok(())
}

#[tokio::test]
async fn test_missing_session_sends_nothing() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(Behaviour::Succeed, Behaviour::Succeed, Behaviour::Succeed);
    let queue = MessageQueue::open(Arc::new(MemoryStorage::new()));
    let outbox = Outbox::new(paths.sender(FakeSession::signed_out()), queue);

    let err = outbox.send(message()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Unauthenticated(_)));
    assert_eq!(paths.total_calls(), 0, "No path is attempted without a session");
    assert_eq!(outbox.pending_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_rejected_message_is_not_queued() -> Result<()> {
    common::setup_logging();
    let paths = Paths::new(
        Behaviour::Fail(rejected()),
        Behaviour::Fail(rejected()),
        Behaviour::Fail(rejected()),
    );
    let queue = MessageQueue::open(Arc::new(MemoryStorage::new()));
    let outbox = Outbox::new(paths.sender(FakeSession::with_token("token-a")), queue);

    let err = outbox.send(message()).await.unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(err.failures().len(), 3);
    assert_eq!(outbox.pending_count().await, 0, "A payload the backend refuses stays out of the queue");
    Ok(())
}

#[tokio::test]
async fn test_scripted_primary_recovers_on_next_send() -> Result<()> {
    common::setup_logging();
    let primary = FakeTransport::scripted(
        DeliveryPath::Primary,
        vec![Behaviour::Fail(common::unavailable())],
        Behaviour::Succeed,
    );
    let paths = Paths {
        primary,
        rest: FakeTransport::new(DeliveryPath::RestFallback, Behaviour::Succeed),
        function: FakeTransport::new(DeliveryPath::Function, Behaviour::Succeed),
    };
    let sender = paths.sender(FakeSession::with_token("token-a"));

    assert_eq!(sender.deliver(&message()).await?.path, DeliveryPath::RestFallback);
    assert_eq!(sender.deliver(&message()).await?.path, DeliveryPath::Primary);
    Ok(())
}
