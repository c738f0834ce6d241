//! Integration tests for sending with optimistic placeholders.
//!
//! A sent message must be visible as pending before the server answers,
//! be replaced by exactly one confirmed entry on success, and stay visible
//! as failed on error without affecting the rest of the conversation.

use marketchat::chat::snapshot::Phase;
use marketchat::chat::{ConversationEngine, EngineConfig, EngineError, SendOutcome, Session};
use marketchat::gateway::memory::MemoryGateway;
use marketchat_proto::message::{Contact, ConversationId, DeliveryStatus, MessageId, Role, UserId};

const FARMER: UserId = UserId::new(7);
const BUYER: UserId = UserId::new(8);

fn buyer() -> Contact {
    Contact::new(BUYER, "bert", Role::Buyer, None)
}

/// Engine for the farmer, with the conversation to the buyer open.
async fn open_engine(history: usize) -> ConversationEngine<MemoryGateway> {
    let gateway = MemoryGateway::new(FARMER, 20).with_user(buyer());
    for i in 1..=history {
        gateway.receive_from(BUYER, &format!("question {i}"));
    }
    let session = Session {
        user_id: FARMER,
        role: Role::Farmer,
    };
    let engine = ConversationEngine::new(gateway, session, &EngineConfig::default());
    engine.select_conversation(&buyer()).await.unwrap();
    engine
}

fn statuses(engine: &ConversationEngine<MemoryGateway>) -> Vec<(String, DeliveryStatus)> {
    engine
        .snapshot()
        .active
        .as_ref()
        .unwrap()
        .messages
        .iter()
        .map(|m| (m.message.body.clone(), m.status.clone()))
        .collect()
}

#[tokio::test]
async fn hello_is_pending_before_the_gateway_resolves() {
    let engine = open_engine(0).await;
    engine.gateway().hold_sends();

    let (outcome, ()) = tokio::join!(engine.send("hello"), async {
        tokio::task::yield_now().await;
        assert_eq!(
            statuses(&engine),
            vec![("hello".to_string(), DeliveryStatus::Pending)]
        );
        assert_eq!(engine.gateway().calls().sends.len(), 1);
        engine.gateway().release_sends();
    });

    assert!(matches!(outcome.unwrap(), SendOutcome::Confirmed(MessageId::Server(_))));
    assert_eq!(
        statuses(&engine),
        vec![("hello".to_string(), DeliveryStatus::Confirmed)]
    );
}

#[tokio::test]
async fn confirmed_message_appears_exactly_once() {
    let engine = open_engine(2).await;
    engine.send("we have tomatoes").await.unwrap();

    let sends = statuses(&engine)
        .into_iter()
        .filter(|(body, _)| body == "we have tomatoes")
        .count();
    assert_eq!(sends, 1);
    assert_eq!(statuses(&engine).len(), 3);

    // Re-selecting fetches the server copy; it must not duplicate.
    engine.select_conversation(&buyer()).await.unwrap();
    assert_eq!(statuses(&engine).len(), 3);
}

#[tokio::test]
async fn blank_text_is_ignored_entirely() {
    let engine = open_engine(1).await;
    let version = engine.snapshot().version;

    for text in ["", "   ", "\n\t "] {
        assert_eq!(engine.send(text).await.unwrap(), SendOutcome::Ignored);
    }

    assert_eq!(engine.snapshot().version, version);
    assert!(engine.gateway().calls().sends.is_empty());
    assert_eq!(statuses(&engine).len(), 1);
}

#[tokio::test]
async fn identical_concurrent_sends_each_confirm_their_own_placeholder() {
    let engine = open_engine(0).await;
    engine.gateway().hold_sends();

    let (a, b, ()) = tokio::join!(engine.send("ok"), engine.send("ok"), async {
        tokio::task::yield_now().await;
        assert_eq!(engine.snapshot().active.as_ref().unwrap().pending_sends(), 2);
        engine.gateway().release_sends();
    });

    let (SendOutcome::Confirmed(a), SendOutcome::Confirmed(b)) = (a.unwrap(), b.unwrap()) else {
        panic!("both sends should confirm");
    };
    assert_ne!(a, b);
    assert_eq!(
        statuses(&engine),
        vec![
            ("ok".to_string(), DeliveryStatus::Confirmed),
            ("ok".to_string(), DeliveryStatus::Confirmed),
        ]
    );
}

#[tokio::test]
async fn failure_marks_only_the_offending_message() {
    let engine = open_engine(1).await;
    engine.send("first").await.unwrap();
    engine.gateway().fail_sends(true);

    let err = engine.send("second").await.unwrap_err();
    assert!(matches!(err, EngineError::Send(_)));

    let list = statuses(&engine);
    assert_eq!(list.len(), 3);
    assert_eq!(list[1], ("first".to_string(), DeliveryStatus::Confirmed));
    assert_eq!(list[2].0, "second");
    assert!(matches!(list[2].1, DeliveryStatus::Failed(_)));

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.phase, Phase::Ready);
    assert!(matches!(view.last_error, Some(EngineError::Send(_))));
}

#[tokio::test]
async fn failed_message_is_resent_from_its_body() {
    let engine = open_engine(0).await;
    engine.gateway().fail_sends(true);
    let _ = engine.send("pickup at 5?").await;
    let local = engine.snapshot().active.as_ref().unwrap().messages[0]
        .message
        .id
        .as_local()
        .unwrap();

    engine.gateway().fail_sends(false);
    engine.retry_send(local).await.unwrap();

    assert_eq!(
        statuses(&engine),
        vec![("pickup at 5?".to_string(), DeliveryStatus::Confirmed)]
    );
    let sends = engine.gateway().calls().sends;
    let conv = ConversationId::with(BUYER);
    assert_eq!(
        sends,
        vec![
            (conv, "pickup at 5?".to_string()),
            (conv, "pickup at 5?".to_string())
        ]
    );
}

#[tokio::test]
async fn send_without_open_conversation_is_rejected() {
    let gateway = MemoryGateway::new(FARMER, 20);
    let session = Session {
        user_id: FARMER,
        role: Role::Farmer,
    };
    let engine = ConversationEngine::new(gateway, session, &EngineConfig::default());

    assert_eq!(
        engine.send("anyone?").await,
        Err(EngineError::NoActiveConversation)
    );
    assert!(engine.gateway().calls().sends.is_empty());
}
