//! JSON-over-HTTP implementation of [`RemoteApi`].
//!
//! Endpoints (relative to the configured base URL):
//!
//! | Call | Method | Path |
//! |------|--------|------|
//! | `list_folders` | GET | `accounts/{account}/folders` |
//! | `fetch_messages` | GET | `accounts/{account}/folders/{path}/messages?limit=&cursor=` |
//! | `fetch_body` | GET | `accounts/{account}/messages/{id}/body` |
//! | `mutate` | POST | `accounts/{account}/messages/{id}/mutations` |
//! | `delete` | DELETE | `accounts/{account}/messages/{id}` |
//! | `send` | POST | `accounts/{account}/outbox` |

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::RemoteApi;
use crate::error::{Error, Result};
use crate::types::{
    AccountId, Cursor, MessageId, MessagePage, OutgoingMessage, RawBody, RemoteFolder,
    RemoteMutation, SendReceipt,
};

/// HTTP client for the mailbox service.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRemote {
    /// Creates a client for the given base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed or the HTTP client cannot
    /// be built.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| Error::InvalidEndpoint(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidEndpoint(format!("{base_url} cannot be a base URL")));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    /// Builds an endpoint URL from path segments. Each segment is percent-encoded,
    /// so folder paths containing `/` stay a single segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidEndpoint(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        debug!("Remote call failed with status {status}: {message}");
        Err(Error::from_status(status.as_u16(), message))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = Self::check(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(Into::into)
    }
}

impl RemoteApi for HttpRemote {
    async fn list_folders(&self, account: AccountId) -> Result<Vec<RemoteFolder>> {
        let url = self.endpoint(&["accounts", &account.to_string(), "folders"])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        Self::decode(response).await
    }

    async fn fetch_messages(
        &self,
        account: AccountId,
        folder: &str,
        cursor: Option<&Cursor>,
        page_size: u32,
    ) -> Result<MessagePage> {
        let mut url = self.endpoint(&[
            "accounts",
            &account.to_string(),
            "folders",
            folder,
            "messages",
        ])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor.as_str());
            }
        }

        let response = self.authorize(self.client.get(url)).send().await?;
        Self::decode(response).await
    }

    async fn fetch_body(&self, account: AccountId, id: &MessageId) -> Result<RawBody> {
        let url = self.endpoint(&["accounts", &account.to_string(), "messages", id.as_str(), "body"])?;
        let response = self.authorize(self.client.get(url)).send().await?;
        Self::decode(response).await
    }

    async fn mutate(
        &self,
        account: AccountId,
        id: &MessageId,
        mutation: &RemoteMutation,
    ) -> Result<()> {
        let url = self.endpoint(&[
            "accounts",
            &account.to_string(),
            "messages",
            id.as_str(),
            "mutations",
        ])?;
        let response = self
            .authorize(self.client.post(url))
            .json(mutation)
            .send()
            .await?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete(&self, account: AccountId, id: &MessageId) -> Result<()> {
        let url = self.endpoint(&["accounts", &account.to_string(), "messages", id.as_str()])?;
        let response = self.authorize(self.client.delete(url)).send().await?;
        Self::check(response).await.map(|_| ())
    }

    async fn send(&self, account: AccountId, message: &OutgoingMessage) -> Result<SendReceipt> {
        let url = self.endpoint(&["accounts", &account.to_string(), "outbox"])?;
        let response = self
            .authorize(self.client.post(url))
            .json(message)
            .send()
            .await?;
        Self::decode(response).await
    }
}
