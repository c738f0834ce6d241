//! Read-only views of engine state for the presentation layer.
//!
//! A new [`Snapshot`] is published after every state transition. Snapshots
//! are immutable values; the renderer never mutates engine state directly.

use marketchat_proto::message::{Contact, DeliveryStatus, MessageId};

use super::EngineError;
use super::store::StoredMessage;
use crate::gateway::GatewayError;

/// Lifecycle of one conversation's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Never selected.
    #[default]
    Idle,
    /// Fetching page 1 after selection or retry.
    LoadingFirstPage,
    /// Loaded, no fetch in flight.
    Ready,
    /// Fetching an older page.
    LoadingOlderPage,
    /// The last fetch failed; loaded messages remain visible.
    Errored,
}

/// Scroll hint for the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Viewport {
    /// Keep the newest message in view.
    #[default]
    FollowTail,
    /// Older history was prepended: keep `anchor` where it was on screen.
    KeepAnchor {
        /// The message that was first before the merge.
        anchor: MessageId,
        /// How many messages now precede it.
        inserted_before: usize,
    },
}

/// A contact with its badge count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEntry {
    /// The counterpart.
    pub contact: Contact,
    /// Loaded messages from them that are still unread.
    pub unread: usize,
}

/// State of the active conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    /// Who the conversation is with.
    pub counterpart: Contact,
    /// Current lifecycle phase.
    pub phase: Phase,
    /// Ascending by creation time.
    pub messages: Vec<StoredMessage>,
    /// Whether older pages remain on the server.
    pub has_more: bool,
    /// Most recent error, until dismissed or superseded by a success.
    pub last_error: Option<EngineError>,
    /// Scroll hint for the latest change.
    pub viewport: Viewport,
}

impl ConversationView {
    /// Whether the first page is being fetched.
    #[must_use]
    pub fn loading_first_page(&self) -> bool {
        self.phase == Phase::LoadingFirstPage
    }

    /// Whether an older page is being fetched.
    #[must_use]
    pub fn loading_older(&self) -> bool {
        self.phase == Phase::LoadingOlderPage
    }

    /// Number of sends awaiting confirmation.
    #[must_use]
    pub fn pending_sends(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.status == DeliveryStatus::Pending)
            .count()
    }
}

/// Everything the presentation layer needs to draw one frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Increases by one with every published snapshot.
    pub version: u64,
    /// Counterparts the session user can message.
    pub contacts: Vec<ContactEntry>,
    /// Whether the directory is being fetched.
    pub contacts_loading: bool,
    /// Error from the last directory fetch.
    pub contacts_error: Option<GatewayError>,
    /// The selected conversation.
    pub active: Option<ConversationView>,
}

impl Snapshot {
    /// Ids of the active conversation's messages in display order.
    #[must_use]
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.active
            .as_ref()
            .map(|view| view.messages.iter().map(|m| m.message.id).collect())
            .unwrap_or_default()
    }
}
