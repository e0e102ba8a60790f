//! Local identity provider adapter
//!
//! Users live in a KV bucket on the bus; every write re-projects the
//! bucket into the IdP's users file and asks the orchestrator to roll the
//! IdP pods. Inbound bearer tokens are resolved through the IdP's own
//! userinfo endpoint - the local IdP owns token verification.
//!
//! Passwordless email linking has no counterpart here; those operations
//! fail with a validation error.

pub mod kubernetes;
pub mod projection;
pub mod rollout;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use self::kubernetes::{ClusterClient, InClusterClient};
use self::projection::Projector;
use self::rollout::RolloutCoalescer;
use self::store::{StoredUser, UserStore};
use super::{EmailLinker, IdentityLinker, UserReader, UserWriter};
use crate::bus::{BusClient, KeyValue};
use crate::config::LocalConfig;
use crate::domain::{TokenSet, User, UserMetadata};
use crate::{Error, Result, password, redact};

/// Reply text for the flows the local IdP does not offer.
const NOT_SUPPORTED: &str = "not supported by the local identity provider";

/// Claims returned by the IdP's userinfo endpoint.
#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

/// Result of a user write. The plaintext password is only present when
/// the write created the record; it is never stored.
#[derive(Debug)]
pub struct UserCredentials {
    /// The stored projection
    pub user: User,
    /// Generated secret, first write only
    pub password: Option<String>,
}

/// Adapter for the local identity provider.
pub struct LocalProvider {
    store: UserStore,
    projector: Projector,
    rollout: RolloutCoalescer,
    http: Client,
    userinfo_url: String,
}

impl LocalProvider {
    /// Build the adapter against the bus's KV bucket and the in-cluster
    /// orchestrator API.
    pub async fn new(config: LocalConfig, bus: &BusClient) -> Result<Self> {
        let kv = bus.key_value(store::BUCKET).await?;
        let cluster: Arc<dyn ClusterClient> = Arc::new(InClusterClient::from_cluster_env()?);
        Self::assemble(config, Arc::new(kv), cluster, rollout::DEFAULT_WINDOW)
    }

    /// Assemble from explicit collaborators. Test seam.
    pub fn assemble(
        config: LocalConfig,
        kv: Arc<dyn KeyValue>,
        cluster: Arc<dyn ClusterClient>,
        rollout_window: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Unexpected(format!("build http client: {e}")))?;

        let rollout = RolloutCoalescer::spawn(
            Arc::clone(&cluster),
            config.configmap_namespace.clone(),
            config.daemonset_name.clone(),
            rollout_window,
        );

        Ok(Self {
            store: UserStore::new(kv),
            projector: Projector::new(cluster, config.clone()),
            rollout,
            http,
            userinfo_url: config.oidc_userinfo_url,
        })
    }

    /// Create or update a user record.
    ///
    /// A freshly created user gets a generated password (returned once,
    /// hashed at rest); an existing user keeps its hash. The write is
    /// followed by a projection and a coalesced rollout request.
    pub async fn upsert_user(&self, mut user: User, groups: Vec<String>) -> Result<UserCredentials> {
        user.sanitize();

        let username = user
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Validation("username is required".to_string()))?;

        if user.user_id.as_deref().is_none_or(str::is_empty) {
            user.user_id = Some(format!("local|{}", username.to_lowercase()));
        }
        let user_id = user.user_id.clone().unwrap_or_default();

        let existing = self.store.get(&user_id).await?;
        let (password_hash, password) = match &existing {
            Some(record) => (record.password_hash.clone(), None),
            None => {
                let secret = password::generate_secret();
                (password::hash_secret(&secret)?, Some(secret))
            }
        };

        let record = StoredUser {
            user: user.clone(),
            password_hash,
            groups,
            disabled: existing.as_ref().is_some_and(|r| r.disabled),
        };
        self.store.put(&record).await?;
        info!(username = %username, created = password.is_some(), "stored local user");

        self.after_write().await;
        Ok(UserCredentials { user, password })
    }

    /// Projection and rollout after a successful primary write.
    ///
    /// A failed projection is logged, not propagated: the bucket already
    /// holds the truth and the next successful write re-projects it all.
    async fn after_write(&self) {
        if let Err(e) = self.projector.project(&self.store).await {
            warn!(error = %e, "projection failed; will converge on next write");
        }
        self.rollout.request();
    }

    async fn userinfo(&self, token: &str) -> Result<UserInfo> {
        crate::http::ApiRequest::get(&self.userinfo_url)
            .token(token)
            .describe("oidc userinfo")
            .fetch(&self.http)
            .await
    }

    /// Find the record a userinfo response refers to: by subject first,
    /// then by preferred username, then by email.
    async fn record_for(&self, info: &UserInfo) -> Result<StoredUser> {
        if let Some(record) = self.store.get(&info.sub).await? {
            return Ok(record);
        }

        for value in [info.preferred_username.as_deref(), info.email.as_deref()]
            .into_iter()
            .flatten()
        {
            if let Some(user_id) = self.store.resolve(value).await? {
                if let Some(record) = self.store.get(&user_id).await? {
                    return Ok(record);
                }
            }
        }

        Err(Error::NotFound("user not found".to_string()))
    }

    async fn load(&self, user_id: &str) -> Result<StoredUser> {
        self.store
            .get(user_id)
            .await?
            .ok_or_else(|| Error::NotFound("user not found".to_string()))
    }
}

#[async_trait]
impl UserReader for LocalProvider {
    async fn user_by_id(&self, user_id: &str) -> Result<User> {
        Ok(self.load(user_id).await?.user)
    }

    async fn user_by_username(&self, username: &str) -> Result<User> {
        let user_id = self
            .store
            .resolve(username)
            .await?
            .ok_or_else(|| Error::NotFound("user not found".to_string()))?;
        let record = self.load(&user_id).await?;

        // The index also maps emails; a username lookup must not succeed
        // through one of those entries
        let matches = record
            .user
            .username
            .as_deref()
            .is_some_and(|u| u.eq_ignore_ascii_case(username));
        if !matches {
            return Err(Error::NotFound("user not found".to_string()));
        }
        Ok(record.user)
    }

    async fn user_by_email(&self, email: &str) -> Result<User> {
        let user_id = self
            .store
            .resolve(email)
            .await?
            .ok_or_else(|| Error::NotFound("user not found".to_string()))?;
        let record = self.load(&user_id).await?;

        let matches = record
            .user
            .primary_email
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(email));
        if !matches {
            warn!(email = %redact::email(email), "index entry is not a primary address");
            return Err(Error::NotFound("user not found".to_string()));
        }
        Ok(record.user)
    }

    async fn user_by_alternate_email(&self, email: &str) -> Result<User> {
        let user_id = self
            .store
            .resolve(email)
            .await?
            .ok_or_else(|| Error::NotFound("user not found".to_string()))?;
        let record = self.load(&user_id).await?;

        let matches = record
            .user
            .alternate_emails
            .iter()
            .any(|alt| alt.email.eq_ignore_ascii_case(email));
        if !matches {
            return Err(Error::NotFound("user not found".to_string()));
        }
        Ok(record.user)
    }
}

#[async_trait]
impl UserWriter for LocalProvider {
    async fn update_metadata(&self, token: &str, metadata: &UserMetadata) -> Result<UserMetadata> {
        let info = self.userinfo(token).await?;
        let mut record = self.record_for(&info).await?;

        let mut merged = record.user.user_metadata.clone().unwrap_or_default();
        metadata.apply_to(&mut merged);
        record.user.user_metadata = Some(merged.clone());

        self.store.put(&record).await?;
        self.after_write().await;

        Ok(merged)
    }
}

#[async_trait]
impl EmailLinker for LocalProvider {
    async fn send_verification(&self, _email: &str) -> Result<()> {
        Err(Error::Validation(format!("email linking is {NOT_SUPPORTED}")))
    }

    async fn verify_code(&self, _email: &str, _otp: &str) -> Result<TokenSet> {
        Err(Error::Validation(format!("email linking is {NOT_SUPPORTED}")))
    }
}

#[async_trait]
impl IdentityLinker for LocalProvider {
    async fn link_identity(&self, _user_token: &str, _link_with: &str) -> Result<()> {
        Err(Error::Validation(format!("identity linking is {NOT_SUPPORTED}")))
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::test_support::FakeCluster;
    use super::*;
    use crate::bus::memory::MemoryKv;

    const WINDOW: Duration = Duration::from_millis(40);

    fn provider_with(cluster: Arc<FakeCluster>, userinfo_url: String) -> LocalProvider {
        let config = LocalConfig {
            oidc_userinfo_url: userinfo_url,
            ..LocalConfig::default()
        };
        LocalProvider::assemble(config, Arc::new(MemoryKv::default()), cluster, WINDOW).unwrap()
    }

    fn bob() -> User {
        User {
            username: Some("bob".to_string()),
            primary_email: Some("bob@example.org".to_string()),
            ..User::default()
        }
    }

    #[tokio::test]
    async fn create_write_projects_and_rolls_out_once() {
        let cluster = Arc::new(FakeCluster::default());
        let provider = provider_with(cluster.clone(), String::new());

        // GIVEN: several writes in one window
        let created = provider.upsert_user(bob(), vec!["users".to_string()]).await.unwrap();
        let mut alice = bob();
        alice.username = Some("alice".to_string());
        alice.primary_email = Some("alice@example.org".to_string());
        provider.upsert_user(alice, Vec::new()).await.unwrap();

        // THEN: the generated password is 20 alphanumeric chars, once
        let password = created.password.expect("password on first write");
        assert_eq!(password.len(), 20);

        // AND: the bucket answers by id, username, and email
        assert_eq!(
            provider.user_by_id("local|bob").await.unwrap().username.as_deref(),
            Some("bob")
        );
        assert!(provider.user_by_username("BOB").await.is_ok());
        assert!(provider.user_by_email("bob@example.org").await.is_ok());

        // AND: the projected users file contains the username
        let secret = cluster.secret_data().expect("projection ran");
        assert!(secret.get(projection::USERS_FILE_KEY).unwrap().contains("bob:"));

        // AND: the rollout burst coalesced into one restart
        tokio::time::sleep(WINDOW * 4).await;
        assert_eq!(cluster.restart_count(), 1);
    }

    #[tokio::test]
    async fn rewrite_keeps_the_password() {
        let cluster = Arc::new(FakeCluster::default());
        let provider = provider_with(cluster, String::new());

        let first = provider.upsert_user(bob(), Vec::new()).await.unwrap();
        assert!(first.password.is_some());

        let second = provider.upsert_user(bob(), Vec::new()).await.unwrap();
        assert!(second.password.is_none());
    }

    #[tokio::test]
    async fn failed_projection_does_not_fail_the_write() {
        let cluster = Arc::new(FakeCluster::failing());
        let provider = provider_with(cluster, String::new());

        // The write succeeds even though the cluster is down
        provider.upsert_user(bob(), Vec::new()).await.unwrap();
        assert!(provider.user_by_id("local|bob").await.is_ok());
    }

    #[tokio::test]
    async fn username_lookup_must_not_match_email_entries() {
        let cluster = Arc::new(FakeCluster::default());
        let provider = provider_with(cluster, String::new());
        provider.upsert_user(bob(), Vec::new()).await.unwrap();

        // The index resolves the address, but it is not a username
        let err = provider.user_by_username("bob@example.org").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn metadata_update_resolves_token_through_userinfo() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/oidc/userinfo"))
            .and(header("authorization", "Bearer local-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": "local|bob",
                "email": "bob@example.org",
                "preferred_username": "bob",
            })))
            .mount(&server)
            .await;

        let cluster = Arc::new(FakeCluster::default());
        let provider =
            provider_with(cluster, format!("{}/api/oidc/userinfo", server.uri()));
        provider.upsert_user(bob(), Vec::new()).await.unwrap();

        let echoed = provider
            .update_metadata(
                "local-token",
                &UserMetadata {
                    name: Some("Robert".to_string()),
                    ..UserMetadata::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(echoed.name.as_deref(), Some("Robert"));

        let user = provider.user_by_id("local|bob").await.unwrap();
        assert_eq!(user.user_metadata.unwrap().name.as_deref(), Some("Robert"));
    }

    #[tokio::test]
    async fn rejected_token_maps_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/oidc/userinfo"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let cluster = Arc::new(FakeCluster::default());
        let provider =
            provider_with(cluster, format!("{}/api/oidc/userinfo", server.uri()));

        let err = provider
            .update_metadata("bad-token", &UserMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn linking_flows_are_not_supported() {
        let cluster = Arc::new(FakeCluster::default());
        let provider = provider_with(cluster, String::new());

        assert!(matches!(
            provider.send_verification("a@example.org").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            provider.verify_code("a@example.org", "123456").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            provider.link_identity("tok", "x|y").await,
            Err(Error::Validation(_))
        ));
    }
}
