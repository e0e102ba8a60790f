//! Domain orchestrator
//!
//! One method per bus operation: decode the payload, sanitize every string
//! field, validate what the operation requires, dispatch to the adapter
//! bound at startup, and shape the reply value. Errors pass through
//! untouched - the dispatcher owns their rendering.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::{User, user};
use crate::providers::IdentityProvider;
use crate::token::{self, ParseOptions};
use crate::{Error, Result, redact};

/// Orchestrates bus operations over the selected identity provider.
pub struct UserService {
    provider: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
struct EmailRequest {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct MetadataReadRequest {
    #[serde(default)]
    input: String,
}

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    otp: String,
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    #[serde(default)]
    user_token: String,
    #[serde(default)]
    link_with: String,
}

impl UserService {
    /// Bind the orchestrator to the adapter selected at startup.
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// `email_to_username`: resolve a primary address to the login handle.
    pub async fn email_to_username(&self, payload: &[u8]) -> Result<Value> {
        let email = decode_email(payload)?;
        let user = self.provider.user_by_email(&email).await?;

        let username = user
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::NotFound("user has no username".to_string()))?;
        Ok(json!({"username": username}))
    }

    /// `email_to_sub`: resolve a primary address to the canonical subject.
    pub async fn email_to_sub(&self, payload: &[u8]) -> Result<Value> {
        let email = decode_email(payload)?;
        let user = self.provider.user_by_email(&email).await?;

        let sub = user
            .user_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::NotFound("user has no subject".to_string()))?;
        Ok(json!({"sub": sub}))
    }

    /// `user_metadata.read`: the single opaque input is a token, a
    /// canonical id, or a username - in that order of recognition.
    pub async fn metadata_read(&self, payload: &[u8]) -> Result<Value> {
        let request: MetadataReadRequest = decode(payload)?;
        let input = request.input.trim();
        if input.is_empty() {
            return Err(Error::Validation("input is required".to_string()));
        }

        let user = if token::looks_like_jwt(input) {
            let claims = token::parse(input, &ParseOptions::unverified())?;
            let sub = claims.sub.unwrap_or_default();
            debug!("metadata read via token subject");
            self.provider.user_by_id(&sub).await?
        } else if user::is_canonical_id(input) {
            self.provider.user_by_id(input).await?
        } else {
            self.provider.user_by_username(input).await?
        };

        serde_json::to_value(user)
            .map_err(|e| Error::Unexpected(format!("encode user projection: {e}")))
    }

    /// `user_metadata.update`: requires a token and a metadata document;
    /// replies with the provider's echo only.
    pub async fn metadata_update(&self, payload: &[u8]) -> Result<Value> {
        let mut user: User = decode(payload)?;
        user.sanitize();

        let token = user
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Validation("token is required".to_string()))?;
        let metadata = user
            .user_metadata
            .as_ref()
            .ok_or_else(|| Error::Validation("user_metadata is required".to_string()))?;

        let echoed = self.provider.update_metadata(token, metadata).await?;
        Ok(json!({"user_metadata": echoed}))
    }

    /// `email_linking.send_verification`: step 1 of the linking flow.
    pub async fn send_verification(&self, payload: &[u8]) -> Result<Value> {
        let email = decode_email(payload)?;
        self.provider.send_verification(&email).await?;

        debug!(email = %redact::email(&email), "verification requested");
        Ok(json!({"success": true, "message": "verification code sent"}))
    }

    /// `email_linking.verify`: step 2, exchanging the code for the linking
    /// token.
    pub async fn verify(&self, payload: &[u8]) -> Result<Value> {
        let request: VerifyRequest = decode(payload)?;
        let email = request.email.trim();
        let otp = request.otp.trim();
        if email.is_empty() || otp.is_empty() {
            return Err(Error::Validation("email and otp are required".to_string()));
        }

        let tokens = self.provider.verify_code(email, otp).await?;
        Ok(json!({"success": true, "data": {"token": tokens.id_token}}))
    }

    /// `user_identity.link`: step 3, attaching the verified identity.
    pub async fn link(&self, payload: &[u8]) -> Result<Value> {
        let request: LinkRequest = decode(payload)?;
        let user_token = request.user_token.trim();
        let link_with = request.link_with.trim();
        if user_token.is_empty() {
            return Err(Error::Validation("user_token is required".to_string()));
        }
        if link_with.is_empty() {
            return Err(Error::Validation("link_with is required".to_string()));
        }

        self.provider.link_identity(user_token, link_with).await?;
        Ok(json!({"success": true, "message": "identity linked"}))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Validation(format!("invalid request: {e}")))
}

fn decode_email(payload: &[u8]) -> Result<String> {
    let request: EmailRequest = decode(payload)?;
    let email = request.email.trim();
    if email.is_empty() {
        return Err(Error::Validation("email is required".to_string()));
    }
    Ok(email.to_string())
}
