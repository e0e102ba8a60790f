//! Projection of the user bucket into the local IdP's users file
//!
//! The bucket is authoritative; this module renders it into the YAML
//! document the IdP process reads. The full document (with password
//! hashes) goes to the Secret; the ConfigMap gets a hash-free index so
//! operators can inspect membership without reading the Secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::kubernetes::ClusterClient;
use super::store::{StoredUser, UserStore};
use crate::config::LocalConfig;
use crate::{Error, Result};

/// Data key of the projected artifacts.
pub const USERS_FILE_KEY: &str = "users.yml";

/// The users document consumed by the IdP.
#[derive(Debug, Serialize)]
struct UsersFile {
    users: BTreeMap<String, IdpUser>,
}

/// One IdP user entry.
#[derive(Debug, Serialize)]
struct IdpUser {
    disabled: bool,
    displayname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    email: String,
    groups: Vec<String>,
}

impl IdpUser {
    fn from_record(record: &StoredUser, with_password: bool) -> Self {
        let displayname = record
            .user
            .user_metadata
            .as_ref()
            .and_then(|m| m.name.clone())
            .or_else(|| record.user.username.clone())
            .unwrap_or_default();

        Self {
            disabled: record.disabled,
            displayname,
            password: with_password.then(|| record.password_hash.clone()),
            email: record.user.primary_email.clone().unwrap_or_default(),
            groups: record.groups.clone(),
        }
    }
}

/// Renders the bucket contents and replaces the projected artifacts.
pub struct Projector {
    cluster: Arc<dyn ClusterClient>,
    config: LocalConfig,
}

impl Projector {
    /// Create a projector writing into the configured namespace.
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterClient>, config: LocalConfig) -> Self {
        Self { cluster, config }
    }

    /// Project the full bucket: Secret first (the document the IdP reads),
    /// then the operator-facing ConfigMap.
    pub async fn project(&self, store: &UserStore) -> Result<()> {
        let records = store.all().await?;
        let namespace = &self.config.configmap_namespace;

        let secret_yaml = render(&records, true)?;
        self.cluster
            .apply_secret(
                namespace,
                &self.config.secret_name,
                BTreeMap::from([(USERS_FILE_KEY.to_string(), secret_yaml)]),
            )
            .await?;

        let index_yaml = render(&records, false)?;
        self.cluster
            .apply_config_map(
                namespace,
                &self.config.configmap_name,
                BTreeMap::from([(USERS_FILE_KEY.to_string(), index_yaml)]),
            )
            .await?;

        info!(users = records.len(), "projected users file");
        Ok(())
    }
}

/// Render records into the users YAML. Records without a username cannot
/// appear in the file and are skipped.
fn render(records: &[StoredUser], with_password: bool) -> Result<String> {
    let users = records
        .iter()
        .filter_map(|record| {
            let username = record.user.username.clone()?;
            Some((username, IdpUser::from_record(record, with_password)))
        })
        .collect();

    serde_yaml::to_string(&UsersFile { users })
        .map_err(|e| Error::Unexpected(format!("render users file: {e}")))
}
