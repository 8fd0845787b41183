//! Key directory: maps a user to their current public key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tether_crypto::PublicKey;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::UserId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("stale key record for {user}: published {offered}, stored {stored}")]
    StaleKeyRecord {
        user: UserId,
        offered: i64,
        stored: i64,
    },
    #[error("malformed public key for {0}")]
    InvalidPublicKey(UserId),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    pub user_id: UserId,
    /// Base64 public key.
    pub public_key: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    /// Unix millis when this key was published.
    pub published_at: i64,
    pub last_seen: i64,
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn lookup(&self, user: &UserId) -> Result<Option<PublicKeyRecord>, DirectoryError>;

    /// Store a record. A record older than the stored one is rejected.
    async fn publish(&self, record: PublicKeyRecord) -> Result<(), DirectoryError>;

    /// Case-insensitive match on display name or id.
    async fn search(&self, term: &str) -> Result<Vec<PublicKeyRecord>, DirectoryError>;
}

#[derive(Clone, Default)]
pub struct InMemoryKeyDirectory {
    records: Arc<RwLock<HashMap<UserId, PublicKeyRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DirectoryError::Unavailable("directory offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn lookup(&self, user: &UserId) -> Result<Option<PublicKeyRecord>, DirectoryError> {
        self.check()?;
        Ok(self.records.read().await.get(user).cloned())
    }

    async fn publish(&self, record: PublicKeyRecord) -> Result<(), DirectoryError> {
        self.check()?;
        if PublicKey::from_base64(&record.public_key).is_err() {
            return Err(DirectoryError::InvalidPublicKey(record.user_id));
        }

        let mut records = self.records.write().await;
        if let Some(stored) = records.get(&record.user_id) {
            if record.published_at < stored.published_at {
                return Err(DirectoryError::StaleKeyRecord {
                    user: record.user_id,
                    offered: record.published_at,
                    stored: stored.published_at,
                });
            }
        }
        debug!(user = %record.user_id, "public key published");
        records.insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn search(&self, term: &str) -> Result<Vec<PublicKeyRecord>, DirectoryError> {
        self.check()?;
        let needle = term.to_lowercase();
        let records = self.records.read().await;
        let mut found: Vec<PublicKeyRecord> = records
            .values()
            .filter(|r| {
                r.display_name.to_lowercase().contains(&needle)
                    || r.user_id.as_str().to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_crypto::KeyPair;

    fn record(user: &str, name: &str, published_at: i64) -> PublicKeyRecord {
        PublicKeyRecord {
            user_id: user.into(),
            public_key: KeyPair::generate().public().to_base64(),
            display_name: name.into(),
            photo_url: None,
            published_at,
            last_seen: published_at,
        }
    }

    #[tokio::test]
    async fn test_publish_and_lookup() {
        let dir = InMemoryKeyDirectory::new();
        let rec = record("alice", "Alice", 10);
        dir.publish(rec.clone()).await.unwrap();
        assert_eq!(dir.lookup(&"alice".into()).await.unwrap(), Some(rec));
        assert_eq!(dir.lookup(&"bob".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_record_rejected() {
        let dir = InMemoryKeyDirectory::new();
        let fresh = record("alice", "Alice", 20);
        dir.publish(fresh.clone()).await.unwrap();

        let err = dir.publish(record("alice", "Alice", 10)).await.unwrap_err();
        assert!(matches!(err, DirectoryError::StaleKeyRecord { stored: 20, .. }));
        assert_eq!(dir.lookup(&"alice".into()).await.unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_newer_record_replaces_key() {
        let dir = InMemoryKeyDirectory::new();
        dir.publish(record("alice", "Alice", 10)).await.unwrap();
        let newer = record("alice", "Alice", 30);
        dir.publish(newer.clone()).await.unwrap();
        assert_eq!(dir.lookup(&"alice".into()).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_malformed_key_rejected() {
        let dir = InMemoryKeyDirectory::new();
        let mut bad = record("alice", "Alice", 10);
        bad.public_key = "not-a-key".into();
        assert!(matches!(
            dir.publish(bad).await,
            Err(DirectoryError::InvalidPublicKey(_))
        ));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive() {
        let dir = InMemoryKeyDirectory::new();
        dir.publish(record("u1", "Alice Liddell", 1)).await.unwrap();
        dir.publish(record("u2", "Bob", 1)).await.unwrap();
        dir.publish(record("alicia", "Carol", 1)).await.unwrap();

        let names: Vec<String> = dir
            .search("ALI")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.display_name)
            .collect();
        assert_eq!(names, vec!["Alice Liddell", "Carol"]);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let dir = InMemoryKeyDirectory::new();
        dir.set_available(false);
        assert!(matches!(
            dir.lookup(&"alice".into()).await,
            Err(DirectoryError::Unavailable(_))
        ));
    }
}
