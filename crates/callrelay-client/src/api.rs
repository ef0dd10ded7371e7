//! HTTP client for the user and message API
//!
//! Talks to the endpoints served next to the relay when the signal server
//! runs with a database.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use callrelay_signal::{StoredMessage, StoredUser};

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("user already exists")]
    UserExists,

    #[error("server has no storage configured")]
    StorageDisabled,

    #[error("request rejected with status {status}: {message}")]
    Status { status: u16, message: String },
}

#[derive(Serialize)]
struct RegisterUser<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct SaveMessage<'a> {
    from: &'a str,
    to: &'a str,
    message: &'a str,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for `/api/users` and `/api/messages`
#[derive(Clone, Debug)]
pub struct ApiClient {
    base: Url,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("callrelay/{}", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            base: Url::parse(base_url)?,
            client,
        })
    }

    /// POST /api/users/register
    pub async fn register_user(&self, email: &str, name: &str) -> Result<StoredUser, ApiError> {
        let url = self.endpoint(&["api", "users", "register"])?;
        let response = self
            .client
            .post(url)
            .json(&RegisterUser { email, name })
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(ApiError::UserExists);
        }
        parse(response).await
    }

    /// GET /api/users/{email}. None if no such user.
    pub async fn get_user(&self, email: &str) -> Result<Option<StoredUser>, ApiError> {
        let url = self.endpoint(&["api", "users", email])?;
        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse(response).await.map(Some)
    }

    /// POST /api/messages
    pub async fn save_message(
        &self,
        from: &str,
        to: &str,
        message: &str,
    ) -> Result<StoredMessage, ApiError> {
        let url = self.endpoint(&["api", "messages"])?;
        let response = self
            .client
            .post(url)
            .json(&SaveMessage { from, to, message })
            .send()
            .await?;
        parse(response).await
    }

    /// GET /api/messages?from=..&to=.., both directions, oldest first
    pub async fn messages_between(&self, from: &str, to: &str) -> Result<Vec<StoredMessage>, ApiError> {
        let mut url = self.endpoint(&["api", "messages"])?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("to", to);
        let response = self.client.get(url).send().await?;
        parse(response).await
    }

    /// Base URL with `segments` appended, each one percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    debug!("API response {}", status);

    if status.is_success() {
        return Ok(response.json().await?);
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(ApiError::StorageDisabled);
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
    };
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}
