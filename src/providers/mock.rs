//! In-memory identity provider
//!
//! The default adapter (`USER_REPOSITORY_TYPE=mock`). Backs local
//! development and tests with the same capability surface as the real
//! providers, including the scope and conflict checks, so handler behavior
//! matches production shapes.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use rand::RngExt;
use tracing::info;

use super::{EmailLinker, IdentityLinker, UserReader, UserWriter};
use crate::domain::{AlternateEmail, TokenSet, User, UserMetadata, user};
use crate::token::{self, ParseOptions};
use crate::{Error, Result, redact};

/// Scope a metadata update token must carry.
const UPDATE_METADATA_SCOPE: &str = "update:current_user_metadata";

/// In-memory provider state: users keyed by canonical id, plus pending
/// one-time codes keyed by lowercased email.
#[derive(Default)]
pub struct MockProvider {
    users: RwLock<HashMap<String, User>>,
    pending_codes: RwLock<HashMap<String, String>>,
}

impl MockProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider pre-populated with a development user.
    #[must_use]
    pub fn seeded() -> Self {
        let provider = Self::new();
        provider.insert(User {
            user_id: Some("mock|0001".to_string()),
            username: Some("mockuser".to_string()),
            primary_email: Some("mockuser@example.org".to_string()),
            user_metadata: Some(UserMetadata {
                name: Some("Mock User".to_string()),
                ..UserMetadata::default()
            }),
            ..User::default()
        });
        provider
    }

    /// Insert or replace a user record.
    pub fn insert(&self, user: User) {
        if let Some(user_id) = user.user_id.clone() {
            self.users.write().insert(user_id, user);
        }
    }

    /// The pending one-time code for `email`, if step 1 has run.
    #[must_use]
    pub fn pending_code(&self, email: &str) -> Option<String> {
        self.pending_codes.read().get(&email.to_lowercase()).cloned()
    }

    fn find<F: Fn(&User) -> bool>(&self, pred: F, what: &str) -> Result<User> {
        self.users
            .read()
            .values()
            .find(|u| pred(u))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user not found by {what}")))
    }

    fn email_taken(&self, email: &str) -> bool {
        self.users.read().values().any(|u| u.has_email(email))
    }
}

#[async_trait]
impl UserReader for MockProvider {
    async fn user_by_id(&self, user_id: &str) -> Result<User> {
        self.users
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| Error::NotFound("user not found".to_string()))
    }

    async fn user_by_username(&self, username: &str) -> Result<User> {
        let wanted = username.to_lowercase();
        self.find(
            |u| u.username.as_deref().is_some_and(|n| n.to_lowercase() == wanted),
            "username",
        )
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let wanted = email.to_lowercase();
        self.find(
            |u| {
                u.primary_email
                    .as_deref()
                    .is_some_and(|p| p.to_lowercase() == wanted)
            },
            "email",
        )
    }

    async fn user_by_alternate_email(&self, email: &str) -> Result<User> {
        let wanted = email.to_lowercase();
        self.find(
            |u| {
                u.alternate_emails
                    .iter()
                    .any(|alt| alt.email.to_lowercase() == wanted)
            },
            "alternate email",
        )
    }
}

#[async_trait]
impl UserWriter for MockProvider {
    async fn update_metadata(&self, token: &str, metadata: &UserMetadata) -> Result<UserMetadata> {
        let options = ParseOptions {
            required_scopes: [UPDATE_METADATA_SCOPE.to_string()].into(),
            ..ParseOptions::unverified()
        };
        let claims = token::parse(token, &options)?;
        let user_id = claims.sub.unwrap_or_default();

        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| Error::NotFound("user not found".to_string()))?;

        let mut merged = user.user_metadata.clone().unwrap_or_default();
        metadata.apply_to(&mut merged);
        user.user_metadata = Some(merged.clone());

        Ok(merged)
    }
}

#[async_trait]
impl EmailLinker for MockProvider {
    async fn send_verification(&self, email: &str) -> Result<()> {
        user::validate_email(email)?;
        if self.email_taken(email) {
            return Err(Error::Conflict("email already in use".to_string()));
        }

        let code = format!("{:06}", rand::rng().random_range(0..1_000_000));
        self.pending_codes
            .write()
            .insert(email.to_lowercase(), code);
        info!(email = %redact::email(email), "issued mock verification code");
        Ok(())
    }

    async fn verify_code(&self, email: &str, otp: &str) -> Result<TokenSet> {
        // Re-check for a conflict that appeared between steps 1 and 2
        if self.email_taken(email) {
            return Err(Error::Conflict("email already in use".to_string()));
        }

        let expected = self.pending_codes.write().remove(&email.to_lowercase());
        if expected.as_deref() != Some(otp) {
            return Err(Error::Unauthorized("invalid verification code".to_string()));
        }

        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"email":"{email}","email_verified":true}}"#));
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);

        Ok(TokenSet {
            access_token: crate::password::generate_secret(),
            id_token: format!("{header}.{payload}.c2ln"),
            token_type: "Bearer".to_string(),
            expires_in: 86400,
            refresh_token: None,
            scope: Some("openid email".to_string()),
        })
    }
}

#[async_trait]
impl IdentityLinker for MockProvider {
    async fn link_identity(&self, user_token: &str, link_with: &str) -> Result<()> {
        if link_with.trim().is_empty() {
            return Err(Error::Validation("link_with is required".to_string()));
        }

        let claims = token::parse(user_token, &ParseOptions::unverified())?;
        let user_id = claims.sub.unwrap_or_default();

        let mut users = self.users.write();
        let user = users
            .get_mut(&user_id)
            .ok_or_else(|| Error::NotFound("user not found".to_string()))?;

        // When the linking payload is an OTP id token, surface the linked
        // address as a verified alternate like the hosted provider would
        if token::looks_like_jwt(link_with) {
            if let Ok(link_claims) = token::parse(link_with, &ParseOptions::default()) {
                if let Some(email) = link_claims.extra.get("email").and_then(|v| v.as_str()) {
                    user.alternate_emails.push(AlternateEmail {
                        email: email.to_string(),
                        verified: true,
                    });
                }
            }
        }

        Ok(())
    }
}
