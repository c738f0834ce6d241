//! Integration tests for switching between conversations.
//!
//! Only the active conversation is shown; others stay cached, and fetches
//! that complete after a switch land in their own conversation.

use marketchat::chat::snapshot::Phase;
use marketchat::chat::{ConversationEngine, EngineConfig, Session};
use marketchat::gateway::memory::MemoryGateway;
use marketchat_proto::message::{Contact, Role, UserId};

const ME: UserId = UserId::new(1);
const ALICE: UserId = UserId::new(2);
const BOB: UserId = UserId::new(3);

fn alice() -> Contact {
    Contact::new(ALICE, "alice", Role::Farmer, Some("Apple Orchard"))
}

fn bob() -> Contact {
    Contact::new(BOB, "bob", Role::Farmer, None)
}

fn engine() -> ConversationEngine<MemoryGateway> {
    let gateway = MemoryGateway::new(ME, 20).with_user(alice()).with_user(bob());
    for i in 1..=3 {
        gateway.receive_from(ALICE, &format!("alice {i}"));
    }
    gateway.receive_from(BOB, "bob 1");
    let session = Session {
        user_id: ME,
        role: Role::Buyer,
    };
    ConversationEngine::new(gateway, session, &EngineConfig::default())
}

fn active_bodies(engine: &ConversationEngine<MemoryGateway>) -> Vec<String> {
    engine
        .snapshot()
        .active
        .as_ref()
        .map(|v| v.messages.iter().map(|m| m.message.body.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn only_the_active_conversation_is_shown() {
    let engine = engine();
    engine.select_conversation(&alice()).await.unwrap();
    engine.select_conversation(&bob()).await.unwrap();

    assert_eq!(active_bodies(&engine), vec!["bob 1"]);
    assert_eq!(
        engine.snapshot().active.as_ref().unwrap().counterpart.id,
        BOB
    );
}

#[tokio::test]
async fn late_page_for_previous_conversation_does_not_leak() {
    let engine = engine();
    engine.gateway().hold_pages();

    let alice_contact = alice();
    let (to_alice, (), to_bob) = tokio::join!(
        engine.select_conversation(&alice_contact),
        async {
            tokio::task::yield_now().await;
            engine.gateway().release_pages();
        },
        async {
            tokio::task::yield_now().await;
            engine.select_conversation(&bob()).await
        }
    );
    to_alice.unwrap();
    to_bob.unwrap();

    assert_eq!(active_bodies(&engine), vec!["bob 1"]);

    // Alice's page was merged into her cached conversation meanwhile.
    engine.gateway().fail_pages(true);
    let _ = engine.select_conversation(&alice()).await;
    assert_eq!(active_bodies(&engine), vec!["alice 1", "alice 2", "alice 3"]);
}

#[tokio::test]
async fn unread_badges_cover_loaded_conversations() {
    let engine = engine();
    engine.load_contacts().await.unwrap();
    assert!(engine.snapshot().contacts.iter().all(|c| c.unread == 0));

    engine.select_conversation(&alice()).await.unwrap();
    // Opening a conversation reads its messages.
    let snapshot = engine.snapshot();
    let alice_entry = snapshot
        .contacts
        .iter()
        .find(|c| c.contact.id == ALICE)
        .unwrap();
    assert_eq!(alice_entry.unread, 0);
    assert_eq!(
        engine.gateway().calls().mark_reads,
        vec![alice().conversation()]
    );
}

#[tokio::test]
async fn reselecting_reloads_from_the_newest_page() {
    let engine = engine();
    engine.select_conversation(&alice()).await.unwrap();
    engine.gateway().receive_from(ALICE, "alice 4");

    engine.select_conversation(&alice()).await.unwrap();
    let snapshot = engine.snapshot();
    let view = snapshot.active.as_ref().unwrap();
    assert_eq!(view.phase, Phase::Ready);
    assert_eq!(
        active_bodies(&engine),
        vec!["alice 1", "alice 2", "alice 3", "alice 4"]
    );
}

#[tokio::test]
async fn reselecting_after_a_burst_leaves_no_hole_in_history() {
    let engine = engine();
    for i in 4..=25 {
        engine.gateway().receive_from(ALICE, &format!("alice {i}"));
    }
    engine.select_conversation(&alice()).await.unwrap();
    engine.gateway().fail_sends(true);
    let _ = engine.send("unsent").await;
    engine.gateway().fail_sends(false);

    // More than a page arrives while the conversation is cached.
    for i in 26..=50 {
        engine.gateway().receive_from(ALICE, &format!("alice {i}"));
    }
    engine.select_conversation(&alice()).await.unwrap();

    let expected: Vec<String> = (31..=50)
        .map(|i| format!("alice {i}"))
        .chain(std::iter::once("unsent".to_string()))
        .collect();
    assert_eq!(active_bodies(&engine), expected);
    assert!(engine.snapshot().active.as_ref().unwrap().has_more);

    while engine.snapshot().active.as_ref().unwrap().has_more {
        engine.load_older().await.unwrap();
    }
    let expected: Vec<String> = (1..=50)
        .map(|i| format!("alice {i}"))
        .chain(std::iter::once("unsent".to_string()))
        .collect();
    assert_eq!(active_bodies(&engine), expected);
}

#[tokio::test]
async fn deep_link_selects_by_id() {
    let engine = engine();
    engine.load_contacts().await.unwrap();
    engine.select_contact_by_id(BOB).await.unwrap();
    assert_eq!(active_bodies(&engine), vec!["bob 1"]);
}
