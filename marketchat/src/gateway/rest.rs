//! HTTP gateway for the marketplace REST API.
//!
//! Endpoints used (all require `Authorization: Bearer <token>`):
//!
//! | Operation       | Request                                   |
//! |-----------------|-------------------------------------------|
//! | contacts        | `GET /api/users`, fallback `GET /api/chat/users` |
//! | history page    | `GET /api/chat/{user_id}?page=N[&per_page=M]`   |
//! | send            | `POST /api/chat/{user_id}` `{"message": ...}`    |
//! | mark read       | `POST /api/chat/mark-read` `{"sender_id": ...}`  |
//!
//! Entries that fail to decode are dropped with a warning; the rest of the
//! response is returned.

use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use marketchat_proto::message::{Contact, ConversationId, Message, Page};
use marketchat_proto::wire::{
    self, ErrorBody, MalformedEntry, MarkReadRequest, SendRequest, WirePage,
};

use super::{Gateway, GatewayError};

/// Settings for [`RestGateway`].
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Server root, e.g. `http://127.0.0.1:5000/`.
    pub api_url: Url,
    /// Bearer token of the session user.
    pub token: Option<String>,
    /// Timeout applied to every request.
    pub request_timeout: Duration,
    /// Page size to request; the server default is used when `None`.
    pub page_size: Option<u32>,
}

/// [`Gateway`] implementation over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct RestGateway {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    page_size: Option<u32>,
}

impl RestGateway {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] if the base URL cannot carry
    /// paths or the TLS backend fails to initialize.
    pub fn new(config: RestConfig) -> Result<Self, GatewayError> {
        if config.api_url.cannot_be_a_base() {
            return Err(GatewayError::Unavailable(format!(
                "{} is not a usable base URL",
                config.api_url
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self {
            http,
            base: with_trailing_slash(config.api_url),
            token: config.token,
            page_size: config.page_size,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base
            .join(path)
            .map_err(|e| GatewayError::Unavailable(format!("bad endpoint {path}: {e}")))
    }

    fn page_url(&self, conversation: ConversationId, page: u32) -> Result<Url, GatewayError> {
        let mut url = self.endpoint(&format!("api/chat/{}", conversation.counterpart()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page", &page.to_string());
            if let Some(size) = self.page_size {
                query.append_pair("per_page", &size.to_string());
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, GatewayError> {
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        decode(check_status(response).await?).await
    }

    async fn post_json<B: serde::Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, GatewayError> {
        let response = self
            .authorize(self.http.post(url).json(body))
            .send()
            .await
            .map_err(|e| GatewayError::Http(e.to_string()))?;
        decode(check_status(response).await?).await
    }

    async fn directory(&self, path: &str) -> Result<Vec<Contact>, GatewayError> {
        let values: Vec<Value> = self.get_json(self.endpoint(path)?).await?;
        let (contacts, dropped) = wire::decode_users(values);
        log_dropped(path, &dropped);
        Ok(contacts)
    }
}

impl Gateway for RestGateway {
    async fn fetch_contacts(&self) -> Result<Vec<Contact>, GatewayError> {
        match self.directory("api/users").await {
            Ok(contacts) => Ok(contacts),
            Err(e) => {
                tracing::warn!(error = %e, "user directory failed, trying chat users");
                self.directory("api/chat/users").await
            }
        }
    }

    async fn fetch_page(
        &self,
        conversation: ConversationId,
        page: u32,
    ) -> Result<Page, GatewayError> {
        let wire: WirePage = self.get_json(self.page_url(conversation, page)?).await?;
        tracing::debug!(
            conversation = %conversation,
            page,
            entries = wire.messages.len(),
            total_messages = wire.total,
            total_pages = wire.pages,
            "history page received"
        );
        let (page, dropped) = wire.into_page(page);
        log_dropped("api/chat", &dropped);
        Ok(page)
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message, GatewayError> {
        let url = self.endpoint(&format!("api/chat/{}", conversation.counterpart()))?;
        let value: Value = self.post_json(url, &SendRequest { message: text }).await?;
        wire::decode_message(value).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn mark_read(&self, conversation: ConversationId) -> Result<(), GatewayError> {
        let url = self.endpoint("api/chat/mark-read")?;
        let body = MarkReadRequest {
            sender_id: conversation.counterpart().as_u64(),
        };
        let _: Value = self.post_json(url, &body).await?;
        Ok(())
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

async fn check_status(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        code: status.as_u16(),
        message: error_message(&text, status.canonical_reason()),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Extracts the server's reason from an error body.
fn error_message(body: &str, fallback: Option<&str>) -> String {
    serde_json::from_str::<ErrorBody>(body).map_or_else(
        |_| fallback.unwrap_or("unknown error").to_string(),
        |b| b.message,
    )
}

fn log_dropped(endpoint: &str, dropped: &[MalformedEntry]) {
    for entry in dropped {
        tracing::warn!(endpoint, error = %entry, "dropping malformed entry");
    }
}
