//! In-memory message history, one ordered sequence per conversation.
//!
//! Sequences are kept ascending by [`Message::ordering_key`] and contain
//! each [`MessageId`] at most once. New entries are inserted at their
//! ordering position; existing entries never move relative to each other,
//! so a renderer can keep its scroll anchor across merges.
//!
//! # Placeholders
//!
//! An optimistic send is appended at the tail with a `Local` id and
//! [`DeliveryStatus::Pending`]. When the server confirms it, the entry is
//! replaced in place; when the request fails it is kept and marked
//! [`DeliveryStatus::Failed`] so the user can resubmit.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use marketchat_proto::message::{
    ConversationId, DeliveryStatus, LocalId, Message, MessageId, UserId,
};
use marketchat_proto::wire::MalformedEntry;

/// Default window within which a confirmed record may match a placeholder.
pub const DEFAULT_CONFIRM_TOLERANCE: Duration = Duration::from_secs(5 * 60);

/// A message together with its client-side delivery state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// The message.
    pub message: Message,
    /// Delivery state.
    pub status: DeliveryStatus,
}

impl StoredMessage {
    const fn confirmed(message: Message) -> Self {
        Self {
            message,
            status: DeliveryStatus::Confirmed,
        }
    }

    fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}

/// Result of merging one fetched page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Ids that were new, in ascending order of insertion.
    pub inserted: Vec<MessageId>,
    /// Entries skipped because their id was already stored.
    pub duplicates: usize,
    /// Entries dropped as malformed.
    pub dropped: usize,
    /// How many new entries landed before the previous first entry.
    pub inserted_before_head: usize,
    /// The first entry before the merge, if the sequence was non-empty.
    pub previous_head: Option<MessageId>,
}

/// Result of appending a server-confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Inserted as a new entry.
    Appended,
    /// Took the place of this placeholder.
    ReplacedPlaceholder(LocalId),
    /// Already stored; the placeholder, if any, was removed.
    Duplicate,
    /// Rejected as malformed.
    Dropped,
}

#[derive(Debug, Default)]
struct Thread {
    entries: Vec<StoredMessage>,
    ids: HashSet<MessageId>,
}

impl Thread {
    fn position(&self, id: MessageId) -> Option<usize> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.entries.iter().position(|e| e.message.id == id)
    }

    /// Inserts after every entry whose key is not greater than `message`'s.
    fn insert_ordered(&mut self, message: Message, status: DeliveryStatus) {
        let key = message.ordering_key();
        let pos = self
            .entries
            .partition_point(|e| e.message.ordering_key() <= key);
        self.ids.insert(message.id);
        self.entries.insert(pos, StoredMessage { message, status });
    }

    fn absorb_read_flag(&mut self, id: MessageId, read: bool) {
        if !read {
            return;
        }
        if let Some(pos) = self.position(id) {
            self.entries[pos].message.read = true;
        }
    }

    fn remove_at(&mut self, pos: usize) -> StoredMessage {
        let removed = self.entries.remove(pos);
        self.ids.remove(&removed.message.id);
        removed
    }
}

/// Per-conversation message sequences for one session.
#[derive(Debug)]
pub struct MessageStore {
    threads: HashMap<ConversationId, Thread>,
    confirm_tolerance_ms: u64,
}

impl MessageStore {
    /// Creates an empty store using [`DEFAULT_CONFIRM_TOLERANCE`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_confirm_tolerance(DEFAULT_CONFIRM_TOLERANCE)
    }

    /// Creates an empty store with a custom placeholder matching window.
    #[must_use]
    pub fn with_confirm_tolerance(tolerance: Duration) -> Self {
        Self {
            threads: HashMap::new(),
            confirm_tolerance_ms: u64::try_from(tolerance.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Merges a fetched history page, given newest first.
    ///
    /// New ids are inserted at their ordering position, known ids are
    /// skipped (absorbing a newly set read flag), and entries that cannot
    /// belong to this conversation are dropped with a warning. Never fails.
    pub fn merge_older(
        &mut self,
        conversation: ConversationId,
        fetched_descending: Vec<Message>,
    ) -> MergeReport {
        let counterpart = conversation.counterpart();
        let thread = self.threads.entry(conversation).or_default();
        let mut report = MergeReport {
            previous_head: thread.entries.first().map(|e| e.message.id),
            ..MergeReport::default()
        };

        for message in fetched_descending.into_iter().rev() {
            if let Err(reason) = check_page_entry(conversation, counterpart, &message) {
                tracing::warn!(
                    conversation = %conversation,
                    error = %reason,
                    "dropping malformed history entry"
                );
                report.dropped += 1;
                continue;
            }

            if thread.ids.contains(&message.id) {
                thread.absorb_read_flag(message.id, message.read);
                report.duplicates += 1;
                continue;
            }

            report.inserted.push(message.id);
            thread.insert_ordered(message, DeliveryStatus::Confirmed);
        }

        if let Some(head) = report.previous_head {
            report.inserted_before_head = thread.position(head).unwrap_or(0);
        }

        tracing::debug!(
            conversation = %conversation,
            inserted = report.inserted.len(),
            duplicates = report.duplicates,
            dropped = report.dropped,
            "merged history page"
        );
        report
    }

    /// Adds a server-confirmed message.
    ///
    /// A pending placeholder with the same sender and body, created within
    /// the confirmation tolerance, is replaced in place. Otherwise the
    /// message is inserted at its ordering position, which is the tail
    /// unless it is older than the newest stored entry.
    pub fn append_confirmed(
        &mut self,
        conversation: ConversationId,
        message: Message,
    ) -> AppendOutcome {
        if !message.id.is_server() {
            tracing::warn!(
                conversation = %conversation,
                message_id = %message.id,
                "confirmed message carries a placeholder id, dropping"
            );
            return AppendOutcome::Dropped;
        }

        let tolerance = self.confirm_tolerance_ms;
        let thread = self.threads.entry(conversation).or_default();
        if thread.ids.contains(&message.id) {
            thread.absorb_read_flag(message.id, message.read);
            return AppendOutcome::Duplicate;
        }

        let matching = thread.entries.iter().position(|e| {
            e.is_pending()
                && e.message.sender == message.sender
                && e.message.body == message.body
                && e.message.created_at.abs_diff(message.created_at) <= tolerance
        });

        match matching.and_then(|pos| {
            thread.entries[pos]
                .message
                .id
                .as_local()
                .map(|local| (pos, local))
        }) {
            Some((pos, local)) => {
                replace_at(thread, pos, message);
                AppendOutcome::ReplacedPlaceholder(local)
            }
            None => {
                thread.insert_ordered(message, DeliveryStatus::Confirmed);
                AppendOutcome::Appended
            }
        }
    }

    /// Replaces the placeholder `local` with its confirmed record.
    ///
    /// If the confirmed id is already stored (a page fetch delivered it
    /// first) the placeholder is removed instead. If the placeholder is
    /// gone, falls back to [`append_confirmed`](Self::append_confirmed).
    pub fn reconcile(
        &mut self,
        conversation: ConversationId,
        local: LocalId,
        message: Message,
    ) -> AppendOutcome {
        let thread = self.threads.entry(conversation).or_default();
        let Some(pos) = thread.position(MessageId::Local(local)) else {
            return self.append_confirmed(conversation, message);
        };

        if !message.id.is_server() {
            tracing::warn!(
                conversation = %conversation,
                message_id = %message.id,
                "confirmation carries a placeholder id, keeping placeholder"
            );
            return AppendOutcome::Dropped;
        }

        if thread.ids.contains(&message.id) {
            thread.remove_at(pos);
            thread.absorb_read_flag(message.id, message.read);
            return AppendOutcome::Duplicate;
        }

        replace_at(thread, pos, message);
        AppendOutcome::ReplacedPlaceholder(local)
    }

    /// Appends an optimistic message at the tail with `Pending` status.
    ///
    /// Returns `None` (and stores nothing) if the message has a server id.
    pub fn append_optimistic(
        &mut self,
        conversation: ConversationId,
        local_message: Message,
    ) -> Option<LocalId> {
        let local = local_message.id.as_local()?;
        let thread = self.threads.entry(conversation).or_default();
        if thread.ids.insert(local_message.id) {
            thread.entries.push(StoredMessage {
                message: local_message,
                status: DeliveryStatus::Pending,
            });
        }
        Some(local)
    }

    /// Marks a placeholder as failed. Returns `false` if it is not stored.
    pub fn mark_failed(
        &mut self,
        conversation: ConversationId,
        local: LocalId,
        reason: impl Into<String>,
    ) -> bool {
        let Some(thread) = self.threads.get_mut(&conversation) else {
            return false;
        };
        match thread.position(MessageId::Local(local)) {
            Some(pos) => {
                thread.entries[pos].status = DeliveryStatus::Failed(reason.into());
                true
            }
            None => false,
        }
    }

    /// Removes a placeholder, returning it.
    pub fn remove_local(
        &mut self,
        conversation: ConversationId,
        local: LocalId,
    ) -> Option<StoredMessage> {
        let thread = self.threads.get_mut(&conversation)?;
        let pos = thread.position(MessageId::Local(local))?;
        Some(thread.remove_at(pos))
    }

    /// Looks up a stored entry by id.
    #[must_use]
    pub fn get(&self, conversation: ConversationId, id: MessageId) -> Option<&StoredMessage> {
        let thread = self.threads.get(&conversation)?;
        thread.position(id).map(|pos| &thread.entries[pos])
    }

    /// Sets the read flag on the given stored messages.
    pub fn set_read(&mut self, conversation: ConversationId, ids: &[MessageId]) {
        if let Some(thread) = self.threads.get_mut(&conversation) {
            for id in ids {
                thread.absorb_read_flag(*id, true);
            }
        }
    }

    /// Whether `page` joins the server history already stored for a
    /// conversation without leaving unseen messages between them.
    ///
    /// A page connects if it shares an id with the stored history or
    /// reaches back to its newest entry. An empty page, or a conversation
    /// with no server history, trivially connects.
    #[must_use]
    pub fn connects(&self, conversation: ConversationId, page: &[Message]) -> bool {
        let Some(oldest) = page.iter().map(Message::ordering_key).min() else {
            return true;
        };
        let Some(thread) = self.threads.get(&conversation) else {
            return true;
        };
        let Some(newest) = thread
            .entries
            .iter()
            .filter(|e| e.message.id.is_server())
            .map(|e| e.message.ordering_key())
            .max()
        else {
            return true;
        };
        oldest <= newest || page.iter().any(|m| thread.ids.contains(&m.id))
    }

    /// Drops the server history of a conversation, keeping pending and
    /// failed placeholders. Returns how many entries were removed.
    pub fn retain_placeholders(&mut self, conversation: ConversationId) -> usize {
        let Some(thread) = self.threads.get_mut(&conversation) else {
            return 0;
        };
        let before = thread.entries.len();
        thread.entries.retain(|e| !e.message.id.is_server());
        thread.ids = thread.entries.iter().map(|e| e.message.id).collect();
        before - thread.entries.len()
    }

    /// Empties the sequence of a conversation.
    pub fn clear(&mut self, conversation: ConversationId) {
        self.threads.remove(&conversation);
    }

    /// The ordered sequence of a conversation (empty if never loaded).
    #[must_use]
    pub fn messages(&self, conversation: ConversationId) -> &[StoredMessage] {
        self.threads
            .get(&conversation)
            .map_or(&[], |t| t.entries.as_slice())
    }

    /// Number of loaded messages from `counterpart` that are still unread.
    #[must_use]
    pub fn unread_from(&self, conversation: ConversationId, counterpart: UserId) -> usize {
        self.messages(conversation)
            .iter()
            .filter(|e| e.message.sender == counterpart && !e.message.read)
            .count()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

fn replace_at(thread: &mut Thread, pos: usize, message: Message) {
    let old = thread.entries[pos].message.id;
    thread.ids.remove(&old);
    thread.ids.insert(message.id);
    thread.entries[pos] = StoredMessage::confirmed(message);
}

fn check_page_entry(
    conversation: ConversationId,
    counterpart: UserId,
    message: &Message,
) -> Result<(), MalformedEntry> {
    if !message.id.is_server() {
        return Err(MalformedEntry::LocalId(message.id));
    }
    if !message.involves(counterpart) {
        return Err(MalformedEntry::Unrelated {
            id: message.id,
            conversation,
        });
    }
    Ok(())
}
