//! Line-oriented frontend: command parsing and snapshot rendering.
//!
//! Input lines starting with `/` are commands; anything else is sent as a
//! message to the open conversation.

use chrono::{Local, TimeZone};

use marketchat_proto::message::{DeliveryStatus, LocalId, Timestamp, UserId};

use crate::chat::snapshot::{ConversationView, Phase, Snapshot, Viewport};
use crate::chat::store::StoredMessage;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reload the contact list.
    Contacts,
    /// Open the conversation with a user.
    Open(UserId),
    /// Load the next older page.
    Older,
    /// Retry the failed fetch.
    Retry,
    /// Resend the n-th failed message (1-based, as listed).
    Resend(usize),
    /// Drop the n-th failed message.
    Discard(usize),
    /// Hide the current error.
    Dismiss,
    /// Print the command list.
    Help,
    /// Exit.
    Quit,
    /// Send this text.
    Send(String),
}

/// Reasons an input line is not a valid command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Unrecognized `/command`.
    #[error("unknown command /{0}, try /help")]
    Unknown(String),

    /// The command needs an argument that was missing or malformed.
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Help text shown for `/help`.
pub const HELP: &[&str] = &[
    "/contacts        reload contacts",
    "/open <user-id>  open a conversation",
    "/older           load older messages",
    "/retry           retry the failed load",
    "/resend <n>      resend failed message n",
    "/discard <n>     drop failed message n",
    "/dismiss         hide the current error",
    "/quit            exit",
];

/// Parses one input line.
///
/// # Errors
///
/// Returns [`CommandError`] for unknown commands and bad arguments.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();

    match name {
        "contacts" => Ok(Command::Contacts),
        "open" => arg
            .and_then(|a| a.parse().ok())
            .map(|id| Command::Open(UserId::new(id)))
            .ok_or(CommandError::Usage("/open <user-id>")),
        "older" => Ok(Command::Older),
        "retry" => Ok(Command::Retry),
        "resend" => index_arg(arg, "/resend <n>").map(Command::Resend),
        "discard" => index_arg(arg, "/discard <n>").map(Command::Discard),
        "dismiss" => Ok(Command::Dismiss),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn index_arg(arg: Option<&str>, usage: &'static str) -> Result<usize, CommandError> {
    arg.and_then(|a| a.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .ok_or(CommandError::Usage(usage))
}

/// Placeholder ids of the failed messages in the active conversation, in
/// the order they are listed.
#[must_use]
pub fn failed_messages(snapshot: &Snapshot) -> Vec<LocalId> {
    snapshot
        .active
        .iter()
        .flat_map(|view| &view.messages)
        .filter(|m| matches!(m.status, DeliveryStatus::Failed(_)))
        .filter_map(|m| m.message.id.as_local())
        .collect()
}

/// Turns snapshots into printable lines.
#[derive(Debug, Clone)]
pub struct Renderer {
    me: UserId,
    timestamp_format: String,
}

impl Renderer {
    /// Renders messages of `me` as "you", with the given chrono format.
    #[must_use]
    pub fn new(me: UserId, timestamp_format: impl Into<String>) -> Self {
        Self {
            me,
            timestamp_format: timestamp_format.into(),
        }
    }

    /// The contact list with unread badges.
    #[must_use]
    pub fn contacts(&self, snapshot: &Snapshot) -> Vec<String> {
        if snapshot.contacts_loading {
            return vec!["loading contacts...".to_string()];
        }
        let mut lines = Vec::with_capacity(snapshot.contacts.len() + 1);
        if let Some(e) = &snapshot.contacts_error {
            lines.push(format!("! could not load contacts: {e}"));
        }
        for entry in &snapshot.contacts {
            let badge = if entry.unread > 0 {
                format!(" ({})", entry.unread)
            } else {
                String::new()
            };
            lines.push(format!(
                "{:>6}  {} [{}]{badge}",
                entry.contact.id.as_u64(),
                entry.contact.display_name,
                entry.contact.label
            ));
        }
        if lines.is_empty() {
            lines.push("no contacts".to_string());
        }
        lines
    }

    /// The open conversation, oldest message first.
    #[must_use]
    pub fn conversation(&self, snapshot: &Snapshot) -> Vec<String> {
        let Some(view) = &snapshot.active else {
            return vec!["no conversation open, use /open <user-id>".to_string()];
        };

        let mut lines = vec![format!(
            "-- {} [{}] --",
            view.counterpart.display_name, view.counterpart.label
        )];
        match view.phase {
            Phase::LoadingFirstPage => lines.push("loading...".to_string()),
            Phase::LoadingOlderPage => lines.push("loading older messages...".to_string()),
            Phase::Ready if view.has_more => {
                lines.push("older messages available, /older".to_string());
            }
            Phase::Errored => lines.push("load failed, /retry".to_string()),
            Phase::Idle | Phase::Ready => {}
        }
        if let Viewport::KeepAnchor { inserted_before, .. } = view.viewport
            && inserted_before > 0
        {
            lines.push(format!("({inserted_before} older messages loaded)"));
        }

        let mut failed = 0;
        for entry in &view.messages {
            let marker = if matches!(entry.status, DeliveryStatus::Failed(_)) {
                failed += 1;
                format!(" [{failed}]")
            } else {
                String::new()
            };
            lines.push(format!("{}{marker}", self.message_line(view, entry)));
        }
        if view.messages.is_empty() && view.phase == Phase::Ready {
            lines.push("no messages yet".to_string());
        }
        if let Some(e) = &view.last_error {
            lines.push(format!("! {e}"));
        }
        lines
    }

    fn message_line(&self, view: &ConversationView, entry: &StoredMessage) -> String {
        let message = &entry.message;
        let who = if message.sender == self.me {
            "you"
        } else {
            view.counterpart.display_name.as_str()
        };
        let time = format_timestamp(&Local, message.created_at, &self.timestamp_format);
        let status = if message.sender == self.me {
            format!(" {}", status_symbol(entry))
        } else {
            String::new()
        };
        format!("{time} {who}: {}{status}", message.body)
    }
}

/// Status glyph for an own message.
#[must_use]
pub fn status_symbol(entry: &StoredMessage) -> &'static str {
    match entry.status {
        DeliveryStatus::Pending => "\u{22ef}",
        DeliveryStatus::Failed(_) => "\u{2717}",
        DeliveryStatus::Confirmed if entry.message.read => "\u{2713}\u{2713}",
        DeliveryStatus::Confirmed => "\u{2713}",
    }
}

/// Formats an epoch-millisecond timestamp in `tz`.
pub fn format_timestamp<Tz>(tz: &Tz, at: Timestamp, format: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let millis = i64::try_from(at.as_millis()).unwrap_or(i64::MAX);
    match tz.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => dt.format(format).to_string(),
        _ => "??:??".to_string(),
    }
}
