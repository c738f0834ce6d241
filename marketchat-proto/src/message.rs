//! Domain types for marketplace direct messaging.
//!
//! Identifiers are server-assigned integers, except for messages that are
//! still waiting for server confirmation: those carry a [`LocalId`] until
//! the send request returns the stored record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned identifier of a marketplace user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(u64);

impl UserId {
    /// Creates a user identifier from its server value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw server value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a direct conversation by the counterpart's user id.
///
/// A conversation always has exactly two participants: the session user
/// and the counterpart, so the counterpart alone is a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(UserId);

impl ConversationId {
    /// Creates the conversation identifier for talking to `counterpart`.
    #[must_use]
    pub const fn with(counterpart: UserId) -> Self {
        Self(counterpart)
    }

    /// Returns the counterpart user of this conversation.
    #[must_use]
    pub const fn counterpart(&self) -> UserId {
        self.0
    }
}

impl From<UserId> for ConversationId {
    fn from(counterpart: UserId) -> Self {
        Self(counterpart)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dm:{}", self.0)
    }
}

/// Placeholder identity of an optimistic message (UUID v7, time-ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Creates a fresh placeholder identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `LocalId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LocalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a message in a conversation.
///
/// Orders every server id before every local id, so placeholders with a
/// timestamp equal to a confirmed message sort after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageId {
    /// Assigned by the server; the message is immutable apart from `read`.
    Server(u64),
    /// Temporary identity of an optimistic send.
    Local(LocalId),
}

impl MessageId {
    /// Returns `true` when the id was assigned by the server.
    #[must_use]
    pub const fn is_server(&self) -> bool {
        matches!(self, Self::Server(_))
    }

    /// Returns the placeholder identity, if this is a local id.
    #[must_use]
    pub const fn as_local(&self) -> Option<LocalId> {
        match self {
            Self::Local(id) => Some(*id),
            Self::Server(_) => None,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{id}"),
            Self::Local(id) => write!(f, "local:{id}"),
        }
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A direct message between the session user and a counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server id, or a local placeholder until confirmed.
    pub id: MessageId,
    /// Who wrote the message.
    pub sender: UserId,
    /// Who the message was addressed to.
    pub recipient: UserId,
    /// Message text.
    pub body: String,
    /// Creation time (server clock for confirmed messages).
    pub created_at: Timestamp,
    /// Whether the recipient has read the message.
    pub read: bool,
}

impl Message {
    /// Sort key within a conversation: creation time, then id.
    #[must_use]
    pub const fn ordering_key(&self) -> (Timestamp, MessageId) {
        (self.created_at, self.id)
    }

    /// Returns `true` if `user` is the sender or the recipient.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.sender == user || self.recipient == user
    }
}

/// Client-side delivery state of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Shown optimistically, send request still in flight.
    Pending,
    /// Stored by the server.
    Confirmed,
    /// The send request failed with a reason.
    Failed(String),
}

/// Marketplace role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sells produce.
    Farmer,
    /// Buys produce.
    Buyer,
}

impl Role {
    /// The role users of this role trade with.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Farmer => Self::Buyer,
            Self::Buyer => Self::Farmer,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Farmer => write!(f, "farmer"),
            Self::Buyer => write!(f, "buyer"),
        }
    }
}

/// Error returned when parsing an unknown role string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role {0:?}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "farmer" => Ok(Self::Farmer),
            "buyer" => Ok(Self::Buyer),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// A user the session user may open a conversation with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// The contact's user id.
    pub id: UserId,
    /// Username shown in the contact list.
    pub display_name: String,
    /// Marketplace role of the contact.
    pub role: Role,
    /// Role-specific subtitle: the farm name for farmers, else the role.
    pub label: String,
}

impl Contact {
    /// Builds a contact, deriving the label from the role and farm name.
    pub fn new(
        id: UserId,
        display_name: impl Into<String>,
        role: Role,
        farm_name: Option<&str>,
    ) -> Self {
        let label = match (role, farm_name) {
            (Role::Farmer, Some(farm)) if !farm.trim().is_empty() => farm.to_string(),
            (Role::Farmer, _) => "Farmer".to_string(),
            (Role::Buyer, _) => "Buyer".to_string(),
        };
        Self {
            id,
            display_name: display_name.into(),
            role,
            label,
        }
    }

    /// The conversation with this contact.
    #[must_use]
    pub const fn conversation(&self) -> ConversationId {
        ConversationId::with(self.id)
    }
}

/// One page of conversation history as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Messages newest first.
    pub messages: Vec<Message>,
    /// 1-based number of this page.
    pub page_number: u32,
    /// Total number of pages the server currently holds.
    pub total_pages: u32,
}
