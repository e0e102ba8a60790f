//! Hosted identity provider adapter
//!
//! Talks to the tenant's management API. Lookups are authenticated with a
//! cached machine-to-machine token; metadata updates and identity links are
//! authorized by the end user's own token. Inbound user tokens are verified
//! against the tenant's JWKS before any identifier is trusted.

mod linking;
pub mod m2m;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use self::m2m::TokenManager;
use super::{UserReader, UserWriter};
use crate::config::HostedConfig;
use crate::domain::{AlternateEmail, User, UserMetadata};
use crate::http::ApiRequest;
use crate::token::{self, ParseOptions, jwks::JwksResolver};
use crate::{Error, Result, redact};

/// Scope a metadata update token must carry.
const UPDATE_METADATA_SCOPE: &str = "update:current_user_metadata";

/// Connection backing primary username/password identities.
const PRIMARY_CONNECTION: &str = "Username-Password-Authentication";

/// Connection backing passwordless email identities.
const EMAIL_CONNECTION: &str = "email";

/// Adapter for the hosted identity provider.
pub struct HostedProvider {
    http: Client,
    base_url: String,
    client_id: String,
    m2m: TokenManager,
    verify_options: ParseOptions,
}

/// User document as the management API returns it.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProviderUser {
    user_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
    #[serde(default)]
    identities: Vec<ProviderIdentity>,
}

/// Identity embedded in a provider user. Identities are value objects of
/// the user projection, never separately referenced.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProviderIdentity {
    #[serde(default)]
    connection: String,
    #[serde(default)]
    user_id: String,
    #[serde(default, rename = "profileData")]
    profile_data: Option<ProfileData>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ProfileData {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

impl ProviderUser {
    fn primary_identity(&self) -> Option<&ProviderIdentity> {
        self.identities
            .iter()
            .find(|i| i.connection == PRIMARY_CONNECTION)
    }

    fn into_user(self) -> User {
        let username = self.primary_identity().map(|i| i.user_id.clone());
        let alternate_emails = self
            .identities
            .iter()
            .filter(|i| i.connection == EMAIL_CONNECTION)
            .filter_map(|i| {
                let profile = i.profile_data.as_ref()?;
                Some(AlternateEmail {
                    email: profile.email.clone()?,
                    verified: profile.email_verified,
                })
            })
            .collect();

        User {
            user_id: Some(self.user_id),
            username,
            primary_email: self.email,
            alternate_emails,
            user_metadata: self.user_metadata,
            token: None,
            sub: None,
        }
    }
}

impl HostedProvider {
    /// Build the adapter: resolve the tenant's JWKS and prepare the M2M
    /// credentials.
    pub async fn new(config: HostedConfig) -> Result<Self> {
        config.validate()?;
        let domain = config.resolved_domain();
        let verify_options = JwksResolver::new().options_for_domain(&domain).await?;
        Self::with_endpoints(&config, format!("https://{domain}"), verify_options)
    }

    /// Build against explicit endpoints. The production path goes through
    /// [`Self::new`]; tests point this at a local server and relax the
    /// verification options.
    pub fn with_endpoints(
        config: &HostedConfig,
        base_url: String,
        verify_options: ParseOptions,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Unexpected(format!("build http client: {e}")))?;

        let m2m = TokenManager::new(
            http.clone(),
            format!("{base_url}/oauth/token"),
            config.client_id.clone(),
            config.resolved_audience(),
            &config.private_base64_key,
        )?;

        Ok(Self {
            http,
            base_url,
            client_id: config.client_id.clone(),
            m2m,
            verify_options,
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn m2m(&self) -> &TokenManager {
        &self.m2m
    }

    /// Verification options for inbound user tokens, extended with
    /// `extra_scopes`.
    pub(crate) fn user_token_options(&self, extra_scopes: &[&str]) -> ParseOptions {
        let mut options = self.verify_options.clone();
        options
            .required_scopes
            .extend(extra_scopes.iter().map(ToString::to_string));
        options
    }

    /// Canonical user URL: `/api/v2/users/{user_id}` with the identifier
    /// percent-encoded as a path segment.
    fn user_url(&self, user_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Unexpected(format!("base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Unexpected("base url cannot carry paths".to_string()))?
            .extend(["api", "v2", "users", user_id]);
        Ok(url)
    }

    fn search_url(&self, query: &str) -> Result<Url> {
        let mut url = self.user_url("")?;
        url.path_segments_mut()
            .map_err(|()| Error::Unexpected("base url cannot carry paths".to_string()))?
            .pop();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("search_engine", "v3");
        Ok(url)
    }

    async fn search(&self, query: &str, description: &str) -> Result<Vec<ProviderUser>> {
        let token = self.m2m.access_token().await?;
        ApiRequest::get(self.search_url(query)?)
            .token(token)
            .describe(description)
            .fetch(&self.http)
            .await
    }
}

#[async_trait]
impl UserReader for HostedProvider {
    async fn user_by_id(&self, user_id: &str) -> Result<User> {
        let token = self.m2m.access_token().await?;
        let user: ProviderUser = ApiRequest::get(self.user_url(user_id)?)
            .token(token)
            .describe("user lookup by id")
            .fetch(&self.http)
            .await?;
        Ok(user.into_user())
    }

    async fn user_by_username(&self, username: &str) -> Result<User> {
        let query = format!(r#"identities.user_id:"{username}""#);
        let candidates = self.search(&query, "user lookup by username").await?;

        // Take the first candidate carrying the primary connection; if its
        // identity does not match the requested username, the lookup fails.
        // Never fall back to a different identity.
        let candidate = candidates
            .into_iter()
            .find(|u| u.primary_identity().is_some())
            .ok_or_else(|| Error::NotFound("user not found".to_string()))?;

        let matches = candidate
            .primary_identity()
            .is_some_and(|i| i.user_id.eq_ignore_ascii_case(username));
        if !matches {
            debug!("username search returned a non-matching identity");
            return Err(Error::NotFound("user not found".to_string()));
        }

        Ok(candidate.into_user())
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let token = self.m2m.access_token().await?;
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Unexpected(format!("base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Unexpected("base url cannot carry paths".to_string()))?
            .extend(["api", "v2", "users-by-email"]);
        url.query_pairs_mut()
            .append_pair("email", &email.to_lowercase());

        let candidates: Vec<ProviderUser> = ApiRequest::get(url)
            .token(token)
            .describe("user lookup by email")
            .fetch(&self.http)
            .await?;

        candidates
            .into_iter()
            .find(|u| u.primary_identity().is_some())
            .map(ProviderUser::into_user)
            .ok_or_else(|| {
                debug!(email = %redact::email(email), "no user with a primary identity for address");
                Error::NotFound("user not found".to_string())
            })
    }

    async fn user_by_alternate_email(&self, email: &str) -> Result<User> {
        let query = format!(r#"identities.profileData.email:"{email}""#);
        let candidates = self
            .search(&query, "user lookup by alternate email")
            .await?;

        candidates
            .into_iter()
            .find(|u| {
                u.identities.iter().any(|i| {
                    i.connection == EMAIL_CONNECTION
                        && i.profile_data
                            .as_ref()
                            .and_then(|p| p.email.as_deref())
                            .is_some_and(|e| e.eq_ignore_ascii_case(email))
                })
            })
            .map(ProviderUser::into_user)
            .ok_or_else(|| {
                debug!(email = %redact::email(email), "no linked identity for address");
                Error::NotFound("user not found".to_string())
            })
    }
}

#[async_trait]
impl UserWriter for HostedProvider {
    async fn update_metadata(&self, token: &str, metadata: &UserMetadata) -> Result<UserMetadata> {
        let options = self.user_token_options(&[UPDATE_METADATA_SCOPE]);
        let claims = token::parse(token, &options)?;
        let user_id = claims.sub.unwrap_or_default();

        let body = serde_json::json!({
            "user_metadata": serde_json::to_value(metadata)
                .map_err(|e| Error::Unexpected(format!("encode metadata: {e}")))?,
        });

        // The user's own token authorizes the patch; the echoed metadata is
        // all the caller gets back
        let updated: ProviderUser = ApiRequest::patch(self.user_url(&user_id)?)
            .token(token.trim())
            .json(body)
            .describe("metadata update")
            .fetch(&self.http)
            .await?;

        Ok(updated.user_metadata.unwrap_or_default())
    }
}
