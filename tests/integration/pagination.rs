//! Integration tests for paging through conversation history.
//!
//! Verifies that pages fetched newest first end up as one ascending,
//! duplicate-free sequence, and that the cursor reports completion.

use marketchat::chat::snapshot::{Phase, Viewport};
use marketchat::chat::{ConversationEngine, EngineConfig, LoadOlderOutcome, Session};
use marketchat::gateway::memory::MemoryGateway;
use marketchat_proto::message::{Contact, ConversationId, MessageId, Role, UserId};

const BUYER: UserId = UserId::new(100);
const FARMER: UserId = UserId::new(200);

fn farmer() -> Contact {
    Contact::new(FARMER, "alice", Role::Farmer, Some("Sunny Farm"))
}

/// Engine for the buyer with `n` messages from the farmer stored
/// server-side, paginated 20 per page.
fn engine_with_history(n: usize) -> ConversationEngine<MemoryGateway> {
    let gateway = MemoryGateway::new(BUYER, 20).with_user(farmer());
    for i in 1..=n {
        gateway.receive_from(FARMER, &format!("m{i}"));
    }
    let session = Session {
        user_id: BUYER,
        role: Role::Buyer,
    };
    ConversationEngine::new(gateway, session, &EngineConfig::default())
}

fn bodies(engine: &ConversationEngine<MemoryGateway>) -> Vec<String> {
    engine
        .snapshot()
        .active
        .as_ref()
        .map(|v| v.messages.iter().map(|m| m.message.body.clone()).collect())
        .unwrap_or_default()
}

fn expected(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| format!("m{i}")).collect()
}

#[tokio::test]
async fn twenty_five_messages_over_two_pages() {
    let engine = engine_with_history(25);

    engine.select_conversation(&farmer()).await.unwrap();
    assert_eq!(bodies(&engine), expected(6..=25));
    assert!(engine.snapshot().active.as_ref().unwrap().has_more);

    let outcome = engine.load_older().await.unwrap();
    assert_eq!(outcome, LoadOlderOutcome::Loaded { inserted: 5 });
    assert_eq!(bodies(&engine), expected(1..=25));

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert!(!view.has_more);
    assert_eq!(view.phase, Phase::Ready);

    assert_eq!(
        engine.load_older().await.unwrap(),
        LoadOlderOutcome::AlreadyComplete
    );
    let conv = ConversationId::with(FARMER);
    assert_eq!(engine.gateway().calls().pages, vec![(conv, 1), (conv, 2)]);
}

#[tokio::test]
async fn sequence_stays_strictly_ascending_across_pages() {
    let engine = engine_with_history(61);
    engine.select_conversation(&farmer()).await.unwrap();
    while let LoadOlderOutcome::Loaded { .. } = engine.load_older().await.unwrap() {}

    let snapshot = engine.snapshot();
    let messages = &snapshot.active.as_ref().unwrap().messages;
    assert_eq!(messages.len(), 61);
    assert!(
        messages
            .windows(2)
            .all(|w| w[0].message.ordering_key() < w[1].message.ordering_key())
    );
}

#[tokio::test]
async fn new_messages_shifting_pages_are_not_duplicated() {
    let engine = engine_with_history(25);
    engine.select_conversation(&farmer()).await.unwrap();

    // Three new messages push m6..m8 onto page 2 on the server.
    for i in 26..=28 {
        engine.gateway().receive_from(FARMER, &format!("m{i}"));
    }
    let outcome = engine.load_older().await.unwrap();
    assert_eq!(outcome, LoadOlderOutcome::Loaded { inserted: 5 });

    assert_eq!(bodies(&engine), expected(1..=25));
}

#[tokio::test]
async fn prepended_history_keeps_the_previous_head_anchored() {
    let engine = engine_with_history(25);
    engine.select_conversation(&farmer()).await.unwrap();
    let head = engine.snapshot().message_ids()[0];

    engine.load_older().await.unwrap();
    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(
        view.viewport,
        Viewport::KeepAnchor {
            anchor: head,
            inserted_before: 5
        }
    );
    assert_eq!(snapshot.message_ids()[5], head);
}

#[tokio::test]
async fn empty_conversation_is_complete_after_first_page() {
    let engine = engine_with_history(0);
    engine.select_conversation(&farmer()).await.unwrap();

    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert!(view.messages.is_empty());
    assert!(!view.has_more);
    assert_eq!(
        engine.load_older().await.unwrap(),
        LoadOlderOutcome::AlreadyComplete
    );
}

#[tokio::test]
async fn exactly_one_full_page_has_no_more() {
    let engine = engine_with_history(20);
    engine.select_conversation(&farmer()).await.unwrap();
    assert!(!engine.snapshot().active.as_ref().unwrap().has_more);
    assert_eq!(
        engine.snapshot().message_ids().first(),
        Some(&MessageId::Server(1))
    );
}

#[tokio::test]
async fn load_older_while_loading_is_not_ready() {
    let engine = engine_with_history(45);
    engine.select_conversation(&farmer()).await.unwrap();
    engine.gateway().hold_pages();

    let (first, second) = tokio::join!(engine.load_older(), async {
        let second = engine.load_older().await;
        engine.gateway().release_pages();
        second
    });

    assert_eq!(first.unwrap(), LoadOlderOutcome::Loaded { inserted: 20 });
    assert_eq!(second.unwrap(), LoadOlderOutcome::NotReady);
    let conv = ConversationId::with(FARMER);
    assert_eq!(engine.gateway().calls().pages, vec![(conv, 1), (conv, 2)]);
}
