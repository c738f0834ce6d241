//! Conversation layer for `MarketChat`.
//!
//! Contains the [`ConversationEngine`], which owns the message store and
//! per-conversation pagination state, drives history fetches and sends
//! through a [`Gateway`], and publishes a [`Snapshot`] after each
//! transition.
//!
//! Engine methods take `&self` and may be awaited concurrently on one task
//! (for example a send while an older page is loading). State sits behind
//! a synchronous mutex that is only held between awaits.

pub mod cursor;
pub mod read_state;
pub mod snapshot;
pub mod store;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use marketchat_proto::message::{
    Contact, ConversationId, DeliveryStatus, LocalId, Message, MessageId, Page, Role, Timestamp,
    UserId,
};

use crate::gateway::{Gateway, GatewayError};

use cursor::PageCursor;
use read_state::ReadStateTracker;
use snapshot::{ContactEntry, ConversationView, Phase, Snapshot, Viewport};
use store::{AppendOutcome, DEFAULT_CONFIRM_TOLERANCE, MessageStore, MergeReport};

/// Errors returned by engine operations.
///
/// Fetch and send failures are also recorded on the affected conversation
/// and shown in its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A directory or history fetch failed. Retryable.
    #[error("could not load: {0}")]
    Fetch(GatewayError),

    /// A send failed; only its placeholder is marked failed.
    #[error("could not send: {0}")]
    Send(GatewayError),

    /// The operation needs a selected conversation.
    #[error("no conversation selected")]
    NoActiveConversation,

    /// The user is not among the loaded contacts.
    #[error("user {0} is not a known contact")]
    UnknownContact(UserId),

    /// No failed message with that id in the active conversation.
    #[error("no failed message with that id")]
    UnknownPlaceholder,
}

/// Identity of the logged-in user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// The session user.
    pub user_id: UserId,
    /// Their marketplace role; contacts have the opposite role.
    pub role: Role,
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window within which a confirmed record may match a placeholder.
    pub confirm_tolerance: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirm_tolerance: DEFAULT_CONFIRM_TOLERANCE,
        }
    }
}

/// Result of [`ConversationEngine::load_older`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOlderOutcome {
    /// A page was fetched and merged.
    Loaded {
        /// Number of messages that were new.
        inserted: usize,
    },
    /// Every page is already loaded.
    AlreadyComplete,
    /// The conversation is loading, or errored on its first page; nothing
    /// was requested.
    NotReady,
}

/// Result of a successful [`ConversationEngine::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The text was blank; nothing happened.
    Ignored,
    /// The server stored the message under this id.
    Confirmed(MessageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    FirstPage,
    OlderPage,
}

#[derive(Debug)]
struct Conversation {
    contact: Contact,
    phase: Phase,
    cursor: PageCursor,
    /// Bumped on every selection; completions from older generations
    /// merge messages but leave cursor and phase alone.
    generation: u64,
    last_error: Option<EngineError>,
    failed_fetch: Option<FetchKind>,
    viewport: Viewport,
}

impl Conversation {
    fn new(contact: Contact) -> Self {
        Self {
            contact,
            phase: Phase::Idle,
            cursor: PageCursor::new(),
            generation: 0,
            last_error: None,
            failed_fetch: None,
            viewport: Viewport::FollowTail,
        }
    }
}

#[derive(Debug)]
struct EngineState {
    contacts: Vec<Contact>,
    contacts_loading: bool,
    contacts_error: Option<GatewayError>,
    conversations: HashMap<ConversationId, Conversation>,
    active: Option<ConversationId>,
    store: MessageStore,
    read_state: ReadStateTracker,
    version: u64,
}

impl EngineState {
    fn active_mut(&mut self) -> Result<(ConversationId, &mut Conversation), EngineError> {
        let id = self.active.ok_or(EngineError::NoActiveConversation)?;
        self.conversations
            .get_mut(&id)
            .map(|c| (id, c))
            .ok_or(EngineError::NoActiveConversation)
    }

    fn snapshot(&self) -> Snapshot {
        let contacts = self
            .contacts
            .iter()
            .map(|contact| ContactEntry {
                unread: self.store.unread_from(contact.conversation(), contact.id),
                contact: contact.clone(),
            })
            .collect();

        let active = self.active.and_then(|id| {
            let conversation = self.conversations.get(&id)?;
            Some(ConversationView {
                counterpart: conversation.contact.clone(),
                phase: conversation.phase,
                messages: self.store.messages(id).to_vec(),
                has_more: conversation.cursor.has_more(),
                last_error: conversation.last_error.clone(),
                viewport: conversation.viewport,
            })
        });

        Snapshot {
            version: self.version,
            contacts,
            contacts_loading: self.contacts_loading,
            contacts_error: self.contacts_error.clone(),
            active,
        }
    }

    fn publish(&mut self, tx: &watch::Sender<Arc<Snapshot>>) {
        self.version += 1;
        tx.send_replace(Arc::new(self.snapshot()));
    }

    /// Merges a fetched page and returns how many messages were new and
    /// whether mark-read should be sent.
    ///
    /// A newest page that leaves a gap after the cached history replaces
    /// it, keeping placeholders. A page from a superseded selection that
    /// would leave a gap is discarded.
    fn apply_page(
        &mut self,
        conversation: ConversationId,
        generation: u64,
        kind: FetchKind,
        requested: u32,
        page: Page,
    ) -> (usize, bool) {
        let total_pages = page.total_pages;
        let current = self
            .conversations
            .get(&conversation)
            .is_some_and(|state| state.generation == generation);
        if !self.store.connects(conversation, &page.messages) {
            if !current {
                tracing::debug!(
                    conversation = %conversation,
                    page = requested,
                    "superseded page does not join cached history, discarded"
                );
                return (0, false);
            }
            if kind == FetchKind::FirstPage {
                let dropped = self.store.retain_placeholders(conversation);
                tracing::info!(
                    conversation = %conversation,
                    dropped,
                    "newest page does not join cached history, reloading from it"
                );
            }
        }
        let report = self.store.merge_older(conversation, page.messages);
        let notify = self.absorb_unread(conversation, &report);

        let Some(state) = self.conversations.get_mut(&conversation) else {
            return (report.inserted.len(), notify);
        };
        if state.generation != generation {
            tracing::debug!(
                conversation = %conversation,
                page = requested,
                "page from a superseded selection merged, cursor unchanged"
            );
            return (report.inserted.len(), notify);
        }

        state.cursor.record_page(requested, total_pages);
        state.phase = Phase::Ready;
        state.last_error = None;
        state.failed_fetch = None;
        state.viewport = match (kind, report.previous_head) {
            (FetchKind::OlderPage, Some(anchor)) => Viewport::KeepAnchor {
                anchor,
                inserted_before: report.inserted_before_head,
            },
            _ => Viewport::FollowTail,
        };
        tracing::debug!(
            conversation = %conversation,
            page = requested,
            total_pages,
            has_more = state.cursor.has_more(),
            "conversation ready"
        );
        (report.inserted.len(), notify)
    }

    /// Flags newly inserted counterpart messages read. Returns `true` if
    /// the server should be told.
    fn absorb_unread(&mut self, conversation: ConversationId, report: &MergeReport) -> bool {
        if report.inserted.is_empty() {
            return false;
        }
        let inserted: HashSet<MessageId> = report.inserted.iter().copied().collect();
        let fresh = self
            .store
            .messages(conversation)
            .iter()
            .filter(|e| inserted.contains(&e.message.id))
            .map(|e| &e.message);
        let unread: Vec<MessageId> = self
            .read_state
            .compute_unread(conversation, conversation.counterpart(), fresh)
            .into_iter()
            .map(|m| m.id)
            .collect();

        if unread.is_empty() {
            return false;
        }
        self.store.set_read(conversation, &unread);
        self.read_state.mark_requested(conversation)
    }

    fn fail_fetch(
        &mut self,
        conversation: ConversationId,
        generation: u64,
        kind: FetchKind,
        error: &GatewayError,
    ) {
        let Some(state) = self.conversations.get_mut(&conversation) else {
            return;
        };
        if state.generation != generation {
            return;
        }
        state.phase = Phase::Errored;
        state.failed_fetch = Some(kind);
        state.last_error = Some(EngineError::Fetch(error.clone()));
    }
}

/// Drives the conversations of one session.
///
/// Generic over the [`Gateway`] so tests can use
/// [`MemoryGateway`](crate::gateway::memory::MemoryGateway).
#[derive(Debug)]
pub struct ConversationEngine<G: Gateway> {
    gateway: G,
    session: Session,
    state: Mutex<EngineState>,
    snapshots: watch::Sender<Arc<Snapshot>>,
}

impl<G: Gateway> ConversationEngine<G> {
    /// Creates an engine with nothing loaded.
    pub fn new(gateway: G, session: Session, config: &EngineConfig) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            gateway,
            session,
            state: Mutex::new(EngineState {
                contacts: Vec::new(),
                contacts_loading: false,
                contacts_error: None,
                conversations: HashMap::new(),
                active: None,
                store: MessageStore::with_confirm_tolerance(config.confirm_tolerance),
                read_state: ReadStateTracker::new(),
                version: 0,
            }),
            snapshots,
        }
    }

    /// The gateway this engine talks to.
    pub const fn gateway(&self) -> &G {
        &self.gateway
    }

    /// The session identity.
    pub const fn session(&self) -> Session {
        self.session
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Receives every snapshot published from now on.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.subscribe()
    }

    /// Fetches the directory and keeps users of the opposite role.
    ///
    /// Returns the number of contacts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fetch`] if the directory request fails; the
    /// error is also shown in the snapshot.
    pub async fn load_contacts(&self) -> Result<usize, EngineError> {
        {
            let mut state = self.state.lock();
            state.contacts_loading = true;
            state.publish(&self.snapshots);
        }

        let result = self.gateway.fetch_contacts().await;

        let mut state = self.state.lock();
        state.contacts_loading = false;
        match result {
            Ok(directory) => {
                let wanted = self.session.role.opposite();
                let me = self.session.user_id;
                state.contacts = directory
                    .into_iter()
                    .filter(|c| c.role == wanted && c.id != me)
                    .collect();
                state.contacts_error = None;
                for contact in &state.contacts {
                    tracing::trace!(user = %contact.id, name = %contact.display_name, "contact");
                }
                let count = state.contacts.len();
                tracing::info!(count, "contacts loaded");
                state.publish(&self.snapshots);
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load contacts");
                state.contacts_error = Some(e.clone());
                state.publish(&self.snapshots);
                Err(EngineError::Fetch(e))
            }
        }
    }

    /// Selects a loaded contact by id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownContact`] if no loaded contact has
    /// that id, otherwise as [`select_conversation`](Self::select_conversation).
    pub async fn select_contact_by_id(&self, user: UserId) -> Result<(), EngineError> {
        let contact = self
            .state
            .lock()
            .contacts
            .iter()
            .find(|c| c.id == user)
            .cloned()
            .ok_or(EngineError::UnknownContact(user))?;
        self.select_conversation(&contact).await
    }

    /// Makes `contact`'s conversation active and fetches its newest page.
    ///
    /// The previously active conversation keeps its loaded messages.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fetch`] if the first page cannot be fetched;
    /// the conversation is then `Errored` and can be retried.
    pub async fn select_conversation(&self, contact: &Contact) -> Result<(), EngineError> {
        let id = contact.conversation();
        let generation = {
            let mut state = self.state.lock();
            state.active = Some(id);
            let conversation = state
                .conversations
                .entry(id)
                .or_insert_with(|| Conversation::new(contact.clone()));
            conversation.contact = contact.clone();
            conversation.generation += 1;
            conversation.cursor.reset();
            conversation.phase = Phase::LoadingFirstPage;
            conversation.last_error = None;
            conversation.failed_fetch = None;
            conversation.viewport = Viewport::FollowTail;
            let generation = conversation.generation;
            tracing::info!(conversation = %id, user = %contact.display_name, "conversation selected");
            state.publish(&self.snapshots);
            generation
        };

        self.fetch(id, generation, FetchKind::FirstPage, 1)
            .await
            .map(|_| ())
    }

    /// Fetches the next older page of the active conversation.
    ///
    /// After a failed older page, calling this again retries that page.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveConversation`] without a selection and
    /// [`EngineError::Fetch`] if the page request fails.
    pub async fn load_older(&self) -> Result<LoadOlderOutcome, EngineError> {
        let (id, generation, page) = {
            let mut state = self.state.lock();
            let (id, conversation) = state.active_mut()?;
            let retrying = conversation.phase == Phase::Errored
                && conversation.failed_fetch == Some(FetchKind::OlderPage);
            if conversation.phase != Phase::Ready && !retrying {
                tracing::debug!(conversation = %id, phase = ?conversation.phase, "load_older ignored");
                return Ok(LoadOlderOutcome::NotReady);
            }
            let Ok(page) = conversation.cursor.advance() else {
                tracing::debug!(conversation = %id, "history already complete");
                if retrying {
                    conversation.phase = Phase::Ready;
                    conversation.failed_fetch = None;
                    conversation.last_error = None;
                    state.publish(&self.snapshots);
                }
                return Ok(LoadOlderOutcome::AlreadyComplete);
            };
            if retrying {
                tracing::info!(conversation = %id, page, "retrying older page");
                conversation.last_error = None;
            }
            conversation.phase = Phase::LoadingOlderPage;
            let generation = conversation.generation;
            state.publish(&self.snapshots);
            (id, generation, page)
        };

        let inserted = self.fetch(id, generation, FetchKind::OlderPage, page).await?;
        Ok(LoadOlderOutcome::Loaded { inserted })
    }

    /// Re-issues the failed fetch of the active conversation.
    ///
    /// Returns `false` if the conversation is not `Errored`.
    ///
    /// # Errors
    ///
    /// As [`select_conversation`](Self::select_conversation) or
    /// [`load_older`](Self::load_older), depending on what failed.
    pub async fn retry(&self) -> Result<bool, EngineError> {
        let (id, generation, kind, page) = {
            let mut state = self.state.lock();
            let (id, conversation) = state.active_mut()?;
            if conversation.phase != Phase::Errored {
                return Ok(false);
            }
            let kind = conversation.failed_fetch.unwrap_or(FetchKind::FirstPage);
            let page = match kind {
                FetchKind::FirstPage => {
                    conversation.cursor.reset();
                    conversation.phase = Phase::LoadingFirstPage;
                    1
                }
                FetchKind::OlderPage => {
                    let Ok(page) = conversation.cursor.advance() else {
                        conversation.phase = Phase::Ready;
                        conversation.failed_fetch = None;
                        state.publish(&self.snapshots);
                        return Ok(false);
                    };
                    conversation.phase = Phase::LoadingOlderPage;
                    page
                }
            };
            conversation.last_error = None;
            let generation = conversation.generation;
            tracing::info!(conversation = %id, page, "retrying fetch");
            state.publish(&self.snapshots);
            (id, generation, kind, page)
        };

        self.fetch(id, generation, kind, page).await.map(|_| true)
    }

    /// Sends `text` to the active conversation.
    ///
    /// A pending placeholder is visible in the snapshot until the gateway
    /// answers. Blank text is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoActiveConversation`] without a selection and
    /// [`EngineError::Send`] if the request fails; the placeholder is then
    /// kept as failed.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, EngineError> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        let (id, local) = self.place_optimistic(text, None)?;
        self.submit(id, local, text).await
    }

    /// Resubmits a failed message under a new placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownPlaceholder`] unless `local` names a
    /// failed message of the active conversation, otherwise as
    /// [`send`](Self::send).
    pub async fn retry_send(&self, local: LocalId) -> Result<SendOutcome, EngineError> {
        let body = {
            let mut state = self.state.lock();
            let (id, _) = state.active_mut()?;
            take_failed(&mut state.store, id, local)?
        };
        let (id, fresh) = self.place_optimistic(&body, Some(local))?;
        self.submit(id, fresh, &body).await
    }

    /// Drops a failed message.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownPlaceholder`] unless `local` names a
    /// failed message of the active conversation.
    pub fn discard_failed(&self, local: LocalId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let (id, _) = state.active_mut()?;
        take_failed(&mut state.store, id, local)?;
        tracing::debug!(conversation = %id, local_id = %local, "discarded failed message");
        state.publish(&self.snapshots);
        Ok(())
    }

    /// Clears the active conversation's last error.
    ///
    /// After a failed older page the conversation returns to `Ready`, since
    /// the loaded history is still valid.
    pub fn dismiss_error(&self) {
        let mut state = self.state.lock();
        let cleared = state.active_mut().is_ok_and(|(_, conversation)| {
            if conversation.phase == Phase::Errored
                && conversation.failed_fetch == Some(FetchKind::OlderPage)
            {
                conversation.phase = Phase::Ready;
                conversation.failed_fetch = None;
            }
            conversation.last_error.take().is_some()
        });
        if cleared {
            state.publish(&self.snapshots);
        }
    }

    async fn fetch(
        &self,
        id: ConversationId,
        generation: u64,
        kind: FetchKind,
        page: u32,
    ) -> Result<usize, EngineError> {
        tracing::debug!(conversation = %id, page, ?kind, "fetching page");
        // Mark-read goes out at most once until the next fetch is issued.
        self.state.lock().read_state.begin_batch(id);
        let result = self.gateway.fetch_page(id, page).await;

        let applied = {
            let mut state = self.state.lock();
            let applied = match result {
                Ok(fetched) => Ok(state.apply_page(id, generation, kind, page, fetched)),
                Err(e) => {
                    tracing::warn!(conversation = %id, page, error = %e, "page fetch failed");
                    state.fail_fetch(id, generation, kind, &e);
                    Err(EngineError::Fetch(e))
                }
            };
            state.publish(&self.snapshots);
            applied
        };

        let (inserted, notify) = applied?;
        if notify {
            read_state::notify_read(&self.gateway, id).await;
        }
        Ok(inserted)
    }

    fn place_optimistic(
        &self,
        body: &str,
        replacing: Option<LocalId>,
    ) -> Result<(ConversationId, LocalId), EngineError> {
        let mut state = self.state.lock();
        let (id, conversation) = state.active_mut()?;
        conversation.viewport = Viewport::FollowTail;
        if replacing.is_some()
            && matches!(conversation.last_error, Some(EngineError::Send(_)))
        {
            conversation.last_error = None;
        }

        let message = Message {
            id: MessageId::Local(LocalId::new()),
            sender: self.session.user_id,
            recipient: id.counterpart(),
            body: body.to_string(),
            created_at: Timestamp::now(),
            read: false,
        };
        let local = state
            .store
            .append_optimistic(id, message)
            .ok_or(EngineError::UnknownPlaceholder)?;
        tracing::debug!(conversation = %id, local_id = %local, ?replacing, "message pending");
        state.publish(&self.snapshots);
        Ok((id, local))
    }

    async fn submit(
        &self,
        id: ConversationId,
        local: LocalId,
        body: &str,
    ) -> Result<SendOutcome, EngineError> {
        let result = self.gateway.send_message(id, body).await;

        let mut state = self.state.lock();
        let outcome = match result {
            Ok(confirmed) => {
                let server_id = confirmed.id;
                match state.store.reconcile(id, local, confirmed) {
                    AppendOutcome::Dropped => {
                        tracing::warn!(conversation = %id, local_id = %local, "confirmation rejected");
                    }
                    other => {
                        tracing::debug!(conversation = %id, message_id = %server_id, ?other, "message confirmed");
                    }
                }
                Ok(SendOutcome::Confirmed(server_id))
            }
            Err(e) => {
                tracing::warn!(conversation = %id, local_id = %local, error = %e, "send failed");
                state.store.mark_failed(id, local, e.to_string());
                if let Some(conversation) = state.conversations.get_mut(&id) {
                    conversation.last_error = Some(EngineError::Send(e.clone()));
                }
                Err(EngineError::Send(e))
            }
        };
        state.publish(&self.snapshots);
        outcome
    }
}

/// Removes a failed placeholder and returns its body.
fn take_failed(
    store: &mut MessageStore,
    conversation: ConversationId,
    local: LocalId,
) -> Result<String, EngineError> {
    let failed = store
        .get(conversation, MessageId::Local(local))
        .is_some_and(|e| matches!(e.status, DeliveryStatus::Failed(_)));
    if !failed {
        return Err(EngineError::UnknownPlaceholder);
    }
    store
        .remove_local(conversation, local)
        .map(|e| e.message.body)
        .ok_or(EngineError::UnknownPlaceholder)
}
