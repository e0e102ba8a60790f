//! Identity-provider capability set and adapter selection
//!
//! The service is a facade: everything it knows about users comes through
//! the four capability traits below. Exactly one adapter is constructed at
//! startup from configuration; after that the selection is immutable.

pub mod hosted;
pub mod local;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::bus::BusClient;
use crate::config::{Config, ProviderKind};
use crate::domain::{TokenSet, User, UserMetadata};

/// Read-side user lookups.
#[async_trait]
pub trait UserReader: Send + Sync {
    /// Canonical lookup by `provider|local` identifier.
    async fn user_by_id(&self, user_id: &str) -> Result<User>;

    /// Search lookup by login handle (case-insensitive).
    async fn user_by_username(&self, username: &str) -> Result<User>;

    /// Lookup by primary email address.
    async fn user_by_email(&self, email: &str) -> Result<User>;

    /// Lookup by alternate (linked) email address.
    async fn user_by_alternate_email(&self, email: &str) -> Result<User>;
}

/// Write-side user mutation.
#[async_trait]
pub trait UserWriter: Send + Sync {
    /// Update profile metadata for the user identified by `token`.
    ///
    /// Returns the provider-echoed metadata only, never the full user, so
    /// callers cannot treat the response as authoritative state for other
    /// fields.
    async fn update_metadata(&self, token: &str, metadata: &UserMetadata) -> Result<UserMetadata>;
}

/// Two-step email verification flow.
#[async_trait]
pub trait EmailLinker: Send + Sync {
    /// Step 1: send a one-time code to `email`.
    async fn send_verification(&self, email: &str) -> Result<()>;

    /// Step 2: exchange `{email, otp}` for a token set.
    async fn verify_code(&self, email: &str, otp: &str) -> Result<TokenSet>;
}

/// Final step of email linking: attach a verified identity to a user.
#[async_trait]
pub trait IdentityLinker: Send + Sync {
    /// Link the identity described by `link_with` (an id token or a
    /// connection descriptor) to the user authenticated by `user_token`.
    async fn link_identity(&self, user_token: &str, link_with: &str) -> Result<()>;
}

/// The full capability set an adapter must provide.
pub trait IdentityProvider: UserReader + UserWriter + EmailLinker + IdentityLinker {}

impl<T: UserReader + UserWriter + EmailLinker + IdentityLinker> IdentityProvider for T {}

/// Construct the adapter selected by configuration.
///
/// Called once at startup; the returned handle is shared by every handler.
pub async fn build(config: &Config, bus: &BusClient) -> Result<Arc<dyn IdentityProvider>> {
    match config.provider {
        ProviderKind::Mock => Ok(Arc::new(mock::MockProvider::seeded())),
        ProviderKind::Hosted => Ok(Arc::new(
            hosted::HostedProvider::new(config.hosted.clone()).await?,
        )),
        ProviderKind::Local => Ok(Arc::new(
            local::LocalProvider::new(config.local.clone(), bus).await?,
        )),
    }
}
