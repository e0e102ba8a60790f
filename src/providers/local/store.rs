//! Authoritative user storage for the local identity provider
//!
//! Primary records live in the `authelia-users` bucket keyed by user id; a
//! secondary index under `lookup/authelia-users/` maps every normalized
//! username and email to the owning user id. Identifiers are base64url
//! encoded because addresses carry characters outside the KV key charset.
//!
//! The bucket is the source of truth; the projected users file is a
//! derived view that converges on the next successful write.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::KeyValue;
use crate::domain::User;
use crate::{Error, Result};

/// Bucket holding primary records and the lookup index.
pub const BUCKET: &str = "authelia-users";

/// Prefix of secondary-index keys.
const LOOKUP_PREFIX: &str = "lookup/authelia-users/";

/// A user record as persisted in the bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUser {
    /// The user projection
    pub user: User,
    /// Bcrypt digest consumed by the local IdP; plaintext never persists
    pub password_hash: String,
    /// Group memberships projected into the users file
    #[serde(default)]
    pub groups: Vec<String>,
    /// Whether the account is disabled in the IdP
    #[serde(default)]
    pub disabled: bool,
}

impl StoredUser {
    /// Normalized values this record must be findable by.
    fn index_values(&self) -> BTreeSet<String> {
        let mut values = BTreeSet::new();
        if let Some(username) = &self.user.username {
            values.insert(username.to_lowercase());
        }
        if let Some(email) = &self.user.primary_email {
            values.insert(email.to_lowercase());
        }
        for alt in &self.user.alternate_emails {
            values.insert(alt.email.to_lowercase());
        }
        values.remove("");
        values
    }
}

/// Store facade over the KV bucket.
pub struct UserStore {
    kv: Arc<dyn KeyValue>,
}

impl UserStore {
    /// Wrap an open bucket.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    fn user_key(user_id: &str) -> String {
        URL_SAFE_NO_PAD.encode(user_id)
    }

    fn index_key(value: &str) -> String {
        format!(
            "{LOOKUP_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(value.to_lowercase())
        )
    }

    /// Read a primary record.
    pub async fn get(&self, user_id: &str) -> Result<Option<StoredUser>> {
        match self.kv.get(&Self::user_key(user_id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Unexpected(format!("decode user record: {e}"))),
            None => Ok(None),
        }
    }

    /// Resolve a username or email to the owning user id.
    pub async fn resolve(&self, value: &str) -> Result<Option<String>> {
        match self.kv.get(&Self::index_key(value)).await? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| Error::Unexpected(format!("decode index entry: {e}"))),
            None => Ok(None),
        }
    }

    /// Write a record: primary first, then upsert the index entries for
    /// the new revision and drop the ones the previous revision no longer
    /// claims.
    pub async fn put(&self, record: &StoredUser) -> Result<()> {
        let user_id = record
            .user
            .user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Validation("user_id is required".to_string()))?;

        let previous = self.get(user_id).await?;

        let payload = serde_json::to_vec(record)
            .map_err(|e| Error::Unexpected(format!("encode user record: {e}")))?;
        self.kv
            .put(&Self::user_key(user_id), Bytes::from(payload))
            .await?;

        let current = record.index_values();
        for value in &current {
            self.kv
                .put(
                    &Self::index_key(value),
                    Bytes::from(user_id.as_bytes().to_vec()),
                )
                .await?;
        }

        if let Some(previous) = previous {
            for stale in previous.index_values().difference(&current) {
                debug!("dropping stale index entry");
                self.kv.delete(&Self::index_key(stale)).await?;
            }
        }

        Ok(())
    }

    /// All primary records in the bucket.
    pub async fn all(&self) -> Result<Vec<StoredUser>> {
        let mut records = Vec::new();
        for key in self.kv.keys().await? {
            if key.starts_with(LOOKUP_PREFIX) {
                continue;
            }
            if let Some(bytes) = self.kv.get(&key).await? {
                let record = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Unexpected(format!("decode user record: {e}")))?;
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryKv;
    use crate::domain::AlternateEmail;
    use pretty_assertions::assert_eq;

    fn bob() -> StoredUser {
        StoredUser {
            user: User {
                user_id: Some("local|bob".to_string()),
                username: Some("bob".to_string()),
                primary_email: Some("Bob@Example.org".to_string()),
                alternate_emails: vec![AlternateEmail {
                    email: "bobby@example.org".to_string(),
                    verified: true,
                }],
                ..User::default()
            },
            password_hash: "$2b$10$fixture".to_string(),
            groups: vec!["admins".to_string()],
            disabled: false,
        }
    }

    #[tokio::test]
    async fn write_then_read_by_id_and_every_index() {
        let store = UserStore::new(Arc::new(MemoryKv::default()));
        store.put(&bob()).await.unwrap();

        // Read by id returns the record
        let read = store.get("local|bob").await.unwrap().unwrap();
        assert_eq!(read, bob());

        // Every index value resolves to the id, case-insensitively
        for value in ["bob", "BOB", "bob@example.org", "BOBBY@example.org"] {
            assert_eq!(
                store.resolve(value).await.unwrap().as_deref(),
                Some("local|bob"),
                "index miss for {value}"
            );
        }

        assert_eq!(store.resolve("nobody@example.org").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rewrite_drops_stale_index_entries() {
        let store = UserStore::new(Arc::new(MemoryKv::default()));
        store.put(&bob()).await.unwrap();

        // The alternate is replaced in a new revision
        let mut updated = bob();
        updated.user.alternate_emails = vec![AlternateEmail {
            email: "robert@example.org".to_string(),
            verified: true,
        }];
        store.put(&updated).await.unwrap();

        assert_eq!(store.resolve("bobby@example.org").await.unwrap(), None);
        assert_eq!(
            store.resolve("robert@example.org").await.unwrap().as_deref(),
            Some("local|bob")
        );
        // Unchanged entries survive
        assert_eq!(
            store.resolve("bob@example.org").await.unwrap().as_deref(),
            Some("local|bob")
        );
    }

    #[tokio::test]
    async fn all_skips_index_keys() {
        let store = UserStore::new(Arc::new(MemoryKv::default()));
        store.put(&bob()).await.unwrap();

        let mut alice = bob();
        alice.user.user_id = Some("local|alice".to_string());
        alice.user.username = Some("alice".to_string());
        alice.user.primary_email = Some("alice@example.org".to_string());
        alice.user.alternate_emails.clear();
        store.put(&alice).await.unwrap();

        let mut usernames: Vec<_> = store
            .all()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.user.username)
            .collect();
        usernames.sort();
        assert_eq!(usernames, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn put_requires_a_user_id() {
        let store = UserStore::new(Arc::new(MemoryKv::default()));
        let mut record = bob();
        record.user.user_id = None;

        assert!(matches!(
            store.put(&record).await,
            Err(Error::Validation(_))
        ));
    }
}
