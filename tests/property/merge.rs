//! Property-based tests for history merging.
//!
//! Uses proptest to verify:
//! 1. Pages merged in cursor order give a strictly ascending, duplicate-free
//!    sequence containing every server message.
//! 2. Merging a page a second time changes nothing.
//! 3. Pages merged in any order still give a sorted sequence.
//! 4. A confirmation replacing its placeholder keeps the sequence length.

use std::collections::HashSet;

use proptest::prelude::*;

use marketchat::chat::store::MessageStore;
use marketchat_proto::message::{ConversationId, LocalId, Message, MessageId, Timestamp, UserId};

const ME: UserId = UserId::new(1);
const THEM: UserId = UserId::new(2);

fn conv() -> ConversationId {
    ConversationId::with(THEM)
}

/// Server history, oldest first. `gaps` are the millisecond steps between
/// messages; zero steps produce timestamp ties.
fn history(gaps: &[u64], senders: &[bool]) -> Vec<Message> {
    let mut at = 1_000_000;
    gaps.iter()
        .zip(senders)
        .enumerate()
        .map(|(i, (gap, mine))| {
            at += gap;
            let (sender, recipient) = if *mine { (ME, THEM) } else { (THEM, ME) };
            Message {
                id: MessageId::Server(i as u64 + 1),
                sender,
                recipient,
                body: format!("m{i}"),
                created_at: Timestamp::from_millis(at),
                read: false,
            }
        })
        .collect()
}

/// Page `n` (1-based) of `history`, newest first.
fn page(history: &[Message], size: usize, n: usize) -> Vec<Message> {
    history
        .iter()
        .rev()
        .skip((n - 1) * size)
        .take(size)
        .cloned()
        .collect()
}

fn arb_history() -> impl Strategy<Value = Vec<Message>> {
    (1usize..80).prop_flat_map(|len| {
        (
            prop::collection::vec(0u64..3, len),
            prop::collection::vec(any::<bool>(), len),
        )
            .prop_map(|(gaps, senders)| history(&gaps, &senders))
    })
}

fn assert_sorted_unique(store: &MessageStore) {
    let messages = store.messages(conv());
    let keys: Vec<_> = messages.iter().map(|m| m.message.ordering_key()).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "not strictly ascending");
    let ids: HashSet<_> = messages.iter().map(|m| m.message.id).collect();
    assert_eq!(ids.len(), messages.len(), "duplicate ids");
}

proptest! {
    #[test]
    fn cursor_order_merge_is_sorted_and_complete(
        history in arb_history(),
        size in 1usize..25,
    ) {
        let mut store = MessageStore::new();
        let pages = history.len().div_ceil(size);
        for n in 1..=pages {
            store.merge_older(conv(), page(&history, size, n));
            assert_sorted_unique(&store);
        }
        prop_assert_eq!(store.messages(conv()).len(), history.len());
    }

    #[test]
    fn merging_a_page_twice_equals_once(
        history in arb_history(),
        size in 1usize..25,
        pick in any::<prop::sample::Index>(),
    ) {
        let mut store = MessageStore::new();
        let pages = history.len().div_ceil(size);
        let n = pick.index(pages) + 1;

        store.merge_older(conv(), page(&history, size, n));
        let once = store.messages(conv()).to_vec();
        let report = store.merge_older(conv(), page(&history, size, n));

        prop_assert_eq!(store.messages(conv()), once.as_slice());
        prop_assert!(report.inserted.is_empty());
    }

    #[test]
    fn any_merge_order_is_sorted(
        history in arb_history(),
        size in 1usize..25,
        order in prop::collection::vec(any::<prop::sample::Index>(), 1..10),
    ) {
        let mut store = MessageStore::new();
        let pages = history.len().div_ceil(size);
        for index in &order {
            store.merge_older(conv(), page(&history, size, index.index(pages) + 1));
            assert_sorted_unique(&store);
        }
    }

    #[test]
    fn confirmation_keeps_length(
        history in arb_history(),
        body in "[a-z ]{1,40}",
    ) {
        let mut store = MessageStore::new();
        store.merge_older(conv(), page(&history, history.len(), 1));
        let before = store.messages(conv()).len();

        let last = history.last().map_or(0, |m| m.created_at.as_millis());
        let placeholder = Message {
            id: MessageId::Local(LocalId::new()),
            sender: ME,
            recipient: THEM,
            body: body.clone(),
            created_at: Timestamp::from_millis(last + 10),
            read: false,
        };
        let local = store.append_optimistic(conv(), placeholder).unwrap();
        prop_assert_eq!(store.messages(conv()).len(), before + 1);

        let confirmed = Message {
            id: MessageId::Server(10_000),
            sender: ME,
            recipient: THEM,
            body,
            created_at: Timestamp::from_millis(last + 20),
            read: false,
        };
        store.reconcile(conv(), local, confirmed);
        prop_assert_eq!(store.messages(conv()).len(), before + 1);
        assert_sorted_unique(&store);
    }
}
