//! Transport gateway abstraction for `MarketChat`.
//!
//! Defines the [`Gateway`] trait through which the conversation engine
//! talks to the marketplace server. Implementations:
//! - [`memory::MemoryGateway`]: in-process fake server for tests
//! - [`rest::RestGateway`]: HTTP client for the marketplace REST API
//!
//! The gateway owns timeout policy; the engine never times out a request
//! itself and relies on the gateway reporting failure.

pub mod memory;
pub mod rest;

use marketchat_proto::message::{Contact, ConversationId, Message, Page};

/// Errors reported by a gateway request.
///
/// `Clone` so that the last error of a conversation can be kept in
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The request could not be sent or the connection broke.
    #[error("request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("server replied {code}: {message}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Reason from the error body, or the status text.
        message: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The gateway is not able to serve requests (e.g. misconfigured).
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

/// Async request interface to the marketplace server.
///
/// All futures are `Send` so a gateway can be shared with spawned tasks,
/// although the engine itself drives them on a single task.
pub trait Gateway: Send + Sync {
    /// Fetch the user directory.
    fn fetch_contacts(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Contact>, GatewayError>> + Send;

    /// Fetch one history page of a conversation, newest messages first.
    ///
    /// `page` is 1-based.
    fn fetch_page(
        &self,
        conversation: ConversationId,
        page: u32,
    ) -> impl std::future::Future<Output = Result<Page, GatewayError>> + Send;

    /// Send a message and return the record the server stored.
    fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<Message, GatewayError>> + Send;

    /// Mark every message from the counterpart as read.
    fn mark_read(
        &self,
        conversation: ConversationId,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send;
}
