//! Authenticated JSON request helper
//!
//! Thin builder over `reqwest` used by the identity-provider adapters.
//! Centralizes header discipline (`Accept`, `Content-Type`,
//! `Authorization` normalization), the status-to-error mapping, and the
//! retryable-vs-fatal classification of transport failures.

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Error, Result};

/// A JSON request against a provider API.
pub struct ApiRequest {
    method: Method,
    url: String,
    token: Option<String>,
    body: Option<Value>,
    /// Log tag naming the operation, not the target
    description: String,
}

impl ApiRequest {
    /// Start building a request.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            token: None,
            body: None,
            description: "api request".to_string(),
        }
    }

    /// Shorthand for a GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Shorthand for a POST request.
    #[must_use]
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    /// Shorthand for a PATCH request.
    #[must_use]
    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    /// Attach a bearer token. A `Bearer ` prefix is added when absent.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the log tag for this request.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Send the request and decode the JSON response body into `T`.
    pub async fn fetch<T: DeserializeOwned>(self, client: &Client) -> Result<T> {
        let description = self.description.clone();
        let body = self.send(client).await?;
        if body.is_empty() {
            return Err(Error::Unexpected(format!("{description}: empty response body")));
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Unexpected(format!("{description}: decode response: {e}")))
    }

    /// Send the request, discarding any response body.
    pub async fn execute(self, client: &Client) -> Result<()> {
        self.send(client).await.map(|_| ())
    }

    async fn send(self, client: &Client) -> Result<String> {
        debug!(request = %self.description, method = %self.method, "calling provider api");

        let mut builder = client
            .request(self.method, &self.url)
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(token) = &self.token {
            builder = builder.header(reqwest::header::AUTHORIZATION, bearer(token));
        }
        if let Some(body) = &self.body {
            // reqwest sets Content-Type: application/json alongside
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Unexpected(format!("{}: read response: {e}", self.description)))?;

        if status.is_success() {
            Ok(body)
        } else {
            warn!(request = %self.description, status = %status, "provider api returned an error");
            Err(map_status(status, &self.description, &body))
        }
    }
}

/// Normalize an authorization value to `Bearer <token>`.
fn bearer(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed
        .get(..7)
        .is_some_and(|p| p.eq_ignore_ascii_case("bearer "))
    {
        trimmed.to_string()
    } else {
        format!("Bearer {trimmed}")
    }
}

/// Map a non-2xx status to the error taxonomy.
///
/// Only `Unexpected` carries the raw body; the classified variants stay
/// terse because their text can end up in a reply.
fn map_status(status: StatusCode, description: &str, body: &str) -> Error {
    match status {
        StatusCode::BAD_REQUEST => Error::Validation(format!("{description}: bad request")),
        StatusCode::UNAUTHORIZED => Error::Unauthorized(format!("{description}: unauthorized")),
        StatusCode::FORBIDDEN => Error::Forbidden(format!("{description}: forbidden")),
        StatusCode::NOT_FOUND => Error::NotFound(format!("{description}: not found")),
        _ => Error::Unexpected(format!("{description}: status {status}: {body}")),
    }
}
