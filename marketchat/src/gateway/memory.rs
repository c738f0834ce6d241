//! In-memory gateway for testing.
//!
//! [`MemoryGateway`] plays the marketplace server for one session user:
//! it keeps every conversation's history, paginates it newest first like
//! the real API, and records each request it receives. Seeded messages are
//! stamped from a clock that starts an hour in the past; sends are stamped
//! no earlier than the wall clock. Requests can be made to fail, and sends
//! or page fetches can be held until released so tests can observe the
//! engine while a request is in flight.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use marketchat_proto::message::{
    Contact, ConversationId, Message, MessageId, Page, Timestamp, UserId,
};

use super::{Gateway, GatewayError};

/// How far before creation the fake server's clock starts, so seeded
/// history predates anything the client sends.
const CLOCK_HEAD_START_MS: u64 = 60 * 60 * 1000;

/// Minimum milliseconds between consecutive server timestamps.
const CLOCK_STEP_MS: u64 = 1;

/// Requests received by a [`MemoryGateway`], in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    /// Number of directory fetches.
    pub contacts: usize,
    /// Page fetches as `(conversation, page)`.
    pub pages: Vec<(ConversationId, u32)>,
    /// Sends as `(conversation, text)`.
    pub sends: Vec<(ConversationId, String)>,
    /// Mark-read calls.
    pub mark_reads: Vec<ConversationId>,
}

#[derive(Debug, Default)]
struct Failures {
    contacts: bool,
    pages: bool,
    sends: bool,
    mark_read: bool,
}

#[derive(Debug)]
struct ServerState {
    directory: Vec<Contact>,
    /// Ascending by creation time.
    histories: HashMap<ConversationId, Vec<Message>>,
    next_id: u64,
    clock_ms: u64,
    calls: CallLog,
    failures: Failures,
}

impl ServerState {
    /// Stores a message no earlier than `not_before` (epoch ms).
    fn store(&mut self, sender: UserId, recipient: UserId, body: &str, not_before: u64) -> Message {
        let at = self.clock_ms.max(not_before);
        let message = Message {
            id: MessageId::Server(self.next_id),
            sender,
            recipient,
            body: body.to_string(),
            created_at: Timestamp::from_millis(at),
            read: false,
        };
        self.next_id += 1;
        self.clock_ms = at + CLOCK_STEP_MS;
        message
    }
}

/// A gate that requests wait on while it is closed.
#[derive(Debug)]
struct Gate(watch::Sender<bool>);

impl Gate {
    fn open() -> Self {
        Self(watch::Sender::new(true))
    }

    fn set(&self, open: bool) {
        self.0.send_replace(open);
    }

    async fn pass(&self) {
        let mut rx = self.0.subscribe();
        // The sender lives as long as the gate, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Fake marketplace server backed by in-process state.
#[derive(Debug)]
pub struct MemoryGateway {
    me: UserId,
    page_size: usize,
    state: Mutex<ServerState>,
    page_gate: Gate,
    send_gate: Gate,
}

impl MemoryGateway {
    /// Creates a server for session user `me` paginating `page_size`
    /// messages per page.
    #[must_use]
    pub fn new(me: UserId, page_size: usize) -> Self {
        Self {
            me,
            page_size: page_size.max(1),
            state: Mutex::new(ServerState {
                directory: Vec::new(),
                histories: HashMap::new(),
                next_id: 1,
                clock_ms: Timestamp::now().as_millis().saturating_sub(CLOCK_HEAD_START_MS),
                calls: CallLog::default(),
                failures: Failures::default(),
            }),
            page_gate: Gate::open(),
            send_gate: Gate::open(),
        }
    }

    /// Adds a user to the directory.
    #[must_use]
    pub fn with_user(self, contact: Contact) -> Self {
        self.state.lock().directory.push(contact);
        self
    }

    /// Stores a message from `counterpart` to the session user.
    pub fn receive_from(&self, counterpart: UserId, body: &str) -> Message {
        self.store_in(counterpart, counterpart, self.me, body, 0)
    }

    /// Stores a message from the session user to `counterpart`, as if sent
    /// from another client.
    pub fn sent_to(&self, counterpart: UserId, body: &str) -> Message {
        self.store_in(counterpart, self.me, counterpart, body, 0)
    }

    fn store_in(
        &self,
        counterpart: UserId,
        sender: UserId,
        recipient: UserId,
        body: &str,
        not_before: u64,
    ) -> Message {
        let mut state = self.state.lock();
        let message = state.store(sender, recipient, body, not_before);
        state
            .histories
            .entry(ConversationId::with(counterpart))
            .or_default()
            .push(message.clone());
        message
    }

    /// The server's copy of a conversation, oldest first.
    #[must_use]
    pub fn history(&self, conversation: ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .histories
            .get(&conversation)
            .cloned()
            .unwrap_or_default()
    }

    /// All requests received so far.
    #[must_use]
    pub fn calls(&self) -> CallLog {
        self.state.lock().calls.clone()
    }

    /// Makes directory fetches fail (or succeed again).
    pub fn fail_contacts(&self, fail: bool) {
        self.state.lock().failures.contacts = fail;
    }

    /// Makes page fetches fail (or succeed again).
    pub fn fail_pages(&self, fail: bool) {
        self.state.lock().failures.pages = fail;
    }

    /// Makes sends fail (or succeed again).
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().failures.sends = fail;
    }

    /// Makes mark-read calls fail (or succeed again).
    pub fn fail_mark_read(&self, fail: bool) {
        self.state.lock().failures.mark_read = fail;
    }

    /// Holds page fetches until [`release_pages`](Self::release_pages).
    pub fn hold_pages(&self) {
        self.page_gate.set(false);
    }

    /// Lets held and future page fetches complete.
    pub fn release_pages(&self) {
        self.page_gate.set(true);
    }

    /// Holds sends until [`release_sends`](Self::release_sends).
    pub fn hold_sends(&self) {
        self.send_gate.set(false);
    }

    /// Lets held and future sends complete.
    pub fn release_sends(&self) {
        self.send_gate.set(true);
    }

    fn unavailable(what: &str) -> GatewayError {
        GatewayError::Status {
            code: 503,
            message: format!("{what} unavailable"),
        }
    }
}

impl Gateway for MemoryGateway {
    async fn fetch_contacts(&self) -> Result<Vec<Contact>, GatewayError> {
        let mut state = self.state.lock();
        state.calls.contacts += 1;
        if state.failures.contacts {
            return Err(Self::unavailable("directory"));
        }
        Ok(state.directory.clone())
    }

    async fn fetch_page(
        &self,
        conversation: ConversationId,
        page: u32,
    ) -> Result<Page, GatewayError> {
        self.state.lock().calls.pages.push((conversation, page));
        self.page_gate.pass().await;

        let state = self.state.lock();
        if state.failures.pages {
            return Err(Self::unavailable("history"));
        }

        let history = state
            .histories
            .get(&conversation)
            .map_or(&[][..], Vec::as_slice);
        let total_pages = u32::try_from(history.len().div_ceil(self.page_size)).unwrap_or(u32::MAX);
        let skip = usize::try_from(page.saturating_sub(1))
            .unwrap_or(usize::MAX)
            .saturating_mul(self.page_size);
        let messages = history
            .iter()
            .rev()
            .skip(skip)
            .take(self.page_size)
            .cloned()
            .collect();

        Ok(Page {
            messages,
            page_number: page,
            total_pages,
        })
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message, GatewayError> {
        self.state
            .lock()
            .calls
            .sends
            .push((conversation, text.to_string()));
        self.send_gate.pass().await;

        if self.state.lock().failures.sends {
            return Err(Self::unavailable("messaging"));
        }
        let counterpart = conversation.counterpart();
        Ok(self.store_in(
            counterpart,
            self.me,
            counterpart,
            text,
            Timestamp::now().as_millis(),
        ))
    }

    async fn mark_read(&self, conversation: ConversationId) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.calls.mark_reads.push(conversation);
        if state.failures.mark_read {
            return Err(Self::unavailable("read receipts"));
        }
        let me = self.me;
        let counterpart = conversation.counterpart();
        if let Some(history) = state.histories.get_mut(&conversation) {
            history
                .iter_mut()
                .filter(|m| m.sender == counterpart && m.recipient == me)
                .for_each(|m| m.read = true);
        }
        Ok(())
    }
}
