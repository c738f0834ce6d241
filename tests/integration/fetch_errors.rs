//! Integration tests for history and directory fetch failures.
//!
//! A failed fetch must leave previously loaded messages in place, expose
//! the error in the snapshot, and be recoverable with a retry.

use marketchat::chat::snapshot::Phase;
use marketchat::chat::{ConversationEngine, EngineConfig, EngineError, LoadOlderOutcome, Session};
use marketchat::gateway::GatewayError;
use marketchat::gateway::memory::MemoryGateway;
use marketchat_proto::message::{Contact, Role, UserId};

const ME: UserId = UserId::new(1);
const FARMER: UserId = UserId::new(2);

fn farmer() -> Contact {
    Contact::new(FARMER, "fern", Role::Farmer, Some("Fern Hollow"))
}

fn engine(history: usize) -> ConversationEngine<MemoryGateway> {
    let gateway = MemoryGateway::new(ME, 20).with_user(farmer());
    for i in 1..=history {
        gateway.receive_from(FARMER, &format!("m{i}"));
    }
    let session = Session {
        user_id: ME,
        role: Role::Buyer,
    };
    ConversationEngine::new(gateway, session, &EngineConfig::default())
}

#[tokio::test]
async fn first_page_failure_is_errored_not_loading() {
    let engine = engine(5);
    engine.gateway().fail_pages(true);

    let err = engine.select_conversation(&farmer()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Fetch(GatewayError::Status { code: 503, .. })
    ));

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.phase, Phase::Errored);
    assert!(!view.loading_first_page());
    assert!(view.messages.is_empty());
    assert!(matches!(view.last_error, Some(EngineError::Fetch(_))));
}

#[tokio::test]
async fn refetch_failure_keeps_last_known_good_messages() {
    let engine = engine(5);
    engine.select_conversation(&farmer()).await.unwrap();
    engine.gateway().fail_pages(true);

    let _ = engine.select_conversation(&farmer()).await;

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.phase, Phase::Errored);
    assert_eq!(view.messages.len(), 5);
}

#[tokio::test]
async fn older_page_failure_keeps_loaded_pages_and_cursor() {
    let engine = engine(30);
    engine.select_conversation(&farmer()).await.unwrap();
    engine.gateway().fail_pages(true);

    assert!(matches!(
        engine.load_older().await,
        Err(EngineError::Fetch(_))
    ));
    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.messages.len(), 20);
    assert!(view.has_more);

    engine.gateway().fail_pages(false);
    assert!(engine.retry().await.unwrap());
    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.messages.len(), 30);
    assert_eq!(view.phase, Phase::Ready);
    assert_eq!(
        engine.load_older().await.unwrap(),
        LoadOlderOutcome::AlreadyComplete
    );
}

#[tokio::test]
async fn asking_for_older_again_retries_the_failed_page() {
    let engine = engine(25);
    engine.select_conversation(&farmer()).await.unwrap();
    engine.gateway().fail_pages(true);
    assert!(engine.load_older().await.is_err());

    engine.gateway().fail_pages(false);
    assert_eq!(
        engine.load_older().await.unwrap(),
        LoadOlderOutcome::Loaded { inserted: 5 }
    );
    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.phase, Phase::Ready);
    assert_eq!(view.messages.len(), 25);
    assert!(view.last_error.is_none());
}

#[tokio::test]
async fn engine_stays_usable_after_failures() {
    let engine = engine(3);
    engine.gateway().fail_pages(true);
    engine.gateway().fail_sends(true);
    let _ = engine.select_conversation(&farmer()).await;
    let _ = engine.send("lost").await;

    engine.gateway().fail_pages(false);
    engine.gateway().fail_sends(false);
    engine.retry().await.unwrap();
    engine.send("found").await.unwrap();

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.phase, Phase::Ready);
    let bodies: Vec<&str> = view.messages.iter().map(|m| m.message.body.as_str()).collect();
    assert!(bodies.contains(&"lost"));
    assert!(bodies.contains(&"found"));
    assert!(bodies.contains(&"m3"));
}

#[tokio::test]
async fn mark_read_failure_is_not_a_user_facing_error() {
    let engine = engine(2);
    engine.gateway().fail_mark_read(true);
    engine.select_conversation(&farmer()).await.unwrap();

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert!(view.last_error.is_none());
    assert!(view.messages.iter().all(|m| m.message.read));
    assert_eq!(engine.gateway().calls().mark_reads.len(), 1);
}

#[tokio::test]
async fn contacts_failure_is_shown_and_retryable() {
    let engine = engine(0);
    engine.gateway().fail_contacts(true);
    assert!(engine.load_contacts().await.is_err());
    assert!(engine.snapshot().contacts_error.is_some());
    assert_eq!(
        engine.select_contact_by_id(FARMER).await,
        Err(EngineError::UnknownContact(FARMER))
    );

    engine.gateway().fail_contacts(false);
    assert_eq!(engine.load_contacts().await.unwrap(), 1);
    engine.select_contact_by_id(FARMER).await.unwrap();
    assert_eq!(
        engine.snapshot().active.as_ref().unwrap().counterpart.label,
        "Fern Hollow"
    );
}
