//! Read/unread tracking for fetched history.
//!
//! After each merged batch the engine asks which of the newly stored
//! messages were sent by the counterpart and are still unread, flags them
//! read locally, and tells the server once. The server call is best effort:
//! a failure is logged and the local flags stay set.

use std::collections::HashSet;

use marketchat_proto::message::{ConversationId, Message, UserId};

use crate::gateway::Gateway;

/// Remembers which conversations already had mark-read issued for the
/// current batch.
#[derive(Debug, Default)]
pub struct ReadStateTracker {
    requested: HashSet<ConversationId>,
}

impl ReadStateTracker {
    /// Creates a tracker with no outstanding markers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages from `counterpart` that are not yet read.
    pub fn compute_unread<'a>(
        &self,
        conversation: ConversationId,
        counterpart: UserId,
        messages: impl IntoIterator<Item = &'a Message>,
    ) -> Vec<&'a Message> {
        let unread: Vec<&Message> = messages
            .into_iter()
            .filter(|m| m.sender == counterpart && !m.read)
            .collect();
        tracing::trace!(conversation = %conversation, unread = unread.len(), "computed unread");
        unread
    }

    /// Starts a new batch: mark-read may be requested again.
    pub fn begin_batch(&mut self, conversation: ConversationId) {
        self.requested.remove(&conversation);
    }

    /// Records that mark-read was issued for the current batch.
    ///
    /// Returns `true` the first time per batch and `false` afterwards.
    pub fn mark_requested(&mut self, conversation: ConversationId) -> bool {
        self.requested.insert(conversation)
    }

    /// Whether mark-read has been issued for the current batch.
    #[must_use]
    pub fn is_requested(&self, conversation: ConversationId) -> bool {
        self.requested.contains(&conversation)
    }
}

/// Tells the server the counterpart's messages were read.
///
/// Fire-and-forget: the outcome is only logged.
pub async fn notify_read<G: Gateway>(gateway: &G, conversation: ConversationId) {
    match gateway.mark_read(conversation).await {
        Ok(()) => tracing::debug!(conversation = %conversation, "marked conversation read"),
        Err(e) => tracing::warn!(
            conversation = %conversation,
            error = %e,
            "mark-read failed, keeping local read state"
        ),
    }
}
