//! JSON shapes of the marketplace REST API.
//!
//! Pages and user lists are decoded entry by entry: a single entry with a
//! missing field or a bad timestamp is reported as a [`MalformedEntry`] and
//! skipped, the rest of the response is still usable.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Contact, ConversationId, Message, MessageId, Page, Role, Timestamp, UserId};

/// Why a single response entry was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedEntry {
    /// The entry is missing fields or has fields of the wrong type.
    #[error("entry has an unexpected shape: {0}")]
    Shape(String),

    /// The timestamp is not ISO-8601.
    #[error("unparseable timestamp {0:?}")]
    Timestamp(String),

    /// The user type is neither farmer nor buyer.
    #[error("unknown user type {0:?}")]
    Role(String),

    /// A history page contained a client placeholder id.
    #[error("placeholder id {0} in a server page")]
    LocalId(MessageId),

    /// The message is not between the session user and the counterpart.
    #[error("message {id} does not belong to {conversation}")]
    Unrelated {
        /// The offending message.
        id: MessageId,
        /// The conversation it was merged into.
        conversation: ConversationId,
    },
}

/// A chat message as serialized by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server id.
    pub id: u64,
    /// Author's user id.
    pub sender_id: u64,
    /// Addressee's user id.
    pub receiver_id: u64,
    /// Message text.
    pub message: String,
    /// ISO-8601 creation time; naive values are UTC.
    pub timestamp: String,
    /// Read flag, absent on some older records.
    #[serde(default)]
    pub read: bool,
}

impl TryFrom<WireMessage> for Message {
    type Error = MalformedEntry;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: MessageId::Server(wire.id),
            sender: UserId::new(wire.sender_id),
            recipient: UserId::new(wire.receiver_id),
            body: wire.message,
            created_at: parse_timestamp(&wire.timestamp)?,
            read: wire.read,
        })
    }
}

/// Decodes one message entry from an arbitrary JSON value.
///
/// # Errors
///
/// Returns [`MalformedEntry`] if the value does not have the message shape
/// or carries an unparseable timestamp.
pub fn decode_message(value: Value) -> Result<Message, MalformedEntry> {
    let wire: WireMessage =
        serde_json::from_value(value).map_err(|e| MalformedEntry::Shape(e.to_string()))?;
    Message::try_from(wire)
}

/// Parses the server's timestamp format.
///
/// Accepts RFC 3339 with an offset as well as the offset-less
/// `YYYY-MM-DDTHH:MM:SS[.ffffff]` form, which is interpreted as UTC.
///
/// # Errors
///
/// Returns [`MalformedEntry::Timestamp`] for anything else, including
/// instants before the UNIX epoch.
pub fn parse_timestamp(raw: &str) -> Result<Timestamp, MalformedEntry> {
    let raw = raw.trim();
    let millis = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc().timestamp_millis())
        })
        .map_err(|_| MalformedEntry::Timestamp(raw.to_string()))?;

    u64::try_from(millis)
        .map(Timestamp::from_millis)
        .map_err(|_| MalformedEntry::Timestamp(raw.to_string()))
}

/// A history page as serialized by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct WirePage {
    /// Raw entries, newest first.
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Total number of messages in the conversation.
    #[serde(default)]
    pub total: u64,
    /// Total number of pages.
    pub pages: u32,
    /// Page number echoed by the server.
    #[serde(default)]
    pub current_page: Option<u32>,
}

impl WirePage {
    /// Converts into a [`Page`], returning the entries that were dropped.
    ///
    /// `requested` is used as the page number if the server did not echo one.
    #[must_use]
    pub fn into_page(self, requested: u32) -> (Page, Vec<MalformedEntry>) {
        let mut dropped = Vec::new();
        let messages = self
            .messages
            .into_iter()
            .filter_map(|value| decode_message(value).map_err(|e| dropped.push(e)).ok())
            .collect();

        let page = Page {
            messages,
            page_number: self.current_page.unwrap_or(requested),
            total_pages: self.pages,
        };
        (page, dropped)
    }
}

/// A user entry from the user directory endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WireUser {
    /// User id.
    pub id: u64,
    /// Login name, shown as the display name.
    pub username: String,
    /// `"farmer"` or `"buyer"`.
    #[serde(default)]
    pub user_type: Option<String>,
    /// Farm name, only set for farmers.
    #[serde(default)]
    pub farm_name: Option<String>,
}

impl TryFrom<WireUser> for Contact {
    type Error = MalformedEntry;

    fn try_from(wire: WireUser) -> Result<Self, Self::Error> {
        let raw_role = wire.user_type.unwrap_or_default();
        let role: Role = raw_role
            .parse()
            .map_err(|_| MalformedEntry::Role(raw_role.clone()))?;
        Ok(Self::new(
            UserId::new(wire.id),
            wire.username,
            role,
            wire.farm_name.as_deref(),
        ))
    }
}

/// Decodes a user list, returning the contacts and the dropped entries.
#[must_use]
pub fn decode_users(values: Vec<Value>) -> (Vec<Contact>, Vec<MalformedEntry>) {
    let mut dropped = Vec::new();
    let contacts = values
        .into_iter()
        .filter_map(|value| {
            serde_json::from_value::<WireUser>(value)
                .map_err(|e| MalformedEntry::Shape(e.to_string()))
                .and_then(Contact::try_from)
                .map_err(|e| dropped.push(e))
                .ok()
        })
        .collect();
    (contacts, dropped)
}

/// Body of `POST /api/chat/{receiver_id}`.
#[derive(Debug, Serialize)]
pub struct SendRequest<'a> {
    /// Message text.
    pub message: &'a str,
}

/// Body of `POST /api/chat/mark-read`.
#[derive(Debug, Serialize)]
pub struct MarkReadRequest {
    /// Mark every unread message from this sender as read.
    pub sender_id: u64,
}

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    /// Human readable reason.
    pub message: String,
}
