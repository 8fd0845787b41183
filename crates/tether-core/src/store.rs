//! Durable message store used for store-and-forward delivery.
//!
//! The store only ever sees [`EncryptedEnvelope`]s; decryption happens in
//! the reader's process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::envelope::EncryptedEnvelope;
use crate::types::{now_millis, MessageId, UserId};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("message not found: {0}")]
    NotFound(MessageId),
}

// ============================================================================
// Data Models
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub recipient: UserId,
    pub envelope: EncryptedEnvelope,
    /// Unix millis assigned on append.
    pub timestamp: i64,
    pub read: bool,
}

impl StoredMessage {
    /// True when the message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (&self.sender == a && &self.recipient == b) || (&self.sender == b && &self.recipient == a)
    }
}

/// Live feed of messages appended to one conversation.
pub struct StoreSubscription {
    user: UserId,
    peer: UserId,
    feed: broadcast::Receiver<StoredMessage>,
}

impl StoreSubscription {
    pub fn new(user: UserId, peer: UserId, feed: broadcast::Receiver<StoredMessage>) -> Self {
        Self { user, peer, feed }
    }

    /// Next message in the conversation, or `None` when the store goes away.
    pub async fn recv(&mut self) -> Option<StoredMessage> {
        loop {
            match self.feed.recv().await {
                Ok(msg) if msg.is_between(&self.user, &self.peer) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "store subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(
        &self,
        sender: &UserId,
        recipient: &UserId,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageId, StoreError>;

    /// Append under a caller-chosen id, so the same message can also travel
    /// over a live channel.
    async fn append_with_id(
        &self,
        id: MessageId,
        sender: &UserId,
        recipient: &UserId,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageId, StoreError>;

    /// The most recent `limit` messages between `user` and `peer`, oldest first.
    async fn query(
        &self,
        user: &UserId,
        peer: &UserId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    async fn subscribe(&self, user: &UserId, peer: &UserId)
        -> Result<StoreSubscription, StoreError>;

    async fn mark_read(&self, id: &MessageId) -> Result<(), StoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

const FEED_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct InMemoryMessageStore {
    messages: Arc<RwLock<Vec<StoredMessage>>>,
    feed: broadcast::Sender<StoredMessage>,
    unavailable: Arc<AtomicBool>,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            feed,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(
        &self,
        sender: &UserId,
        recipient: &UserId,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageId, StoreError> {
        self.append_with_id(MessageId::generate(), sender, recipient, envelope)
            .await
    }

    async fn append_with_id(
        &self,
        id: MessageId,
        sender: &UserId,
        recipient: &UserId,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageId, StoreError> {
        self.check()?;
        let message = StoredMessage {
            id: id.clone(),
            sender: sender.clone(),
            recipient: recipient.clone(),
            envelope,
            timestamp: now_millis(),
            read: false,
        };
        self.messages.write().await.push(message.clone());
        debug!(message = %id, "message stored");
        let _ = self.feed.send(message);
        Ok(id)
    }

    async fn query(
        &self,
        user: &UserId,
        peer: &UserId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.check()?;
        let messages = self.messages.read().await;
        let mut conversation: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| m.is_between(user, peer))
            .cloned()
            .collect();
        // Stable, so equal timestamps keep append order.
        conversation.sort_by_key(|m| m.timestamp);
        let skip = conversation.len().saturating_sub(limit);
        Ok(conversation.split_off(skip))
    }

    async fn subscribe(
        &self,
        user: &UserId,
        peer: &UserId,
    ) -> Result<StoreSubscription, StoreError> {
        self.check()?;
        Ok(StoreSubscription::new(
            user.clone(),
            peer.clone(),
            self.feed.subscribe(),
        ))
    }

    async fn mark_read(&self, id: &MessageId) -> Result<(), StoreError> {
        self.check()?;
        let mut messages = self.messages.write().await;
        let message = messages
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        message.read = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(text: &str) -> EncryptedEnvelope {
        EncryptedEnvelope::legacy_plaintext(text)
    }

    #[tokio::test]
    async fn test_query_returns_conversation_only() {
        let store = InMemoryMessageStore::new();
        let (a, b, c) = (UserId::from("a"), UserId::from("b"), UserId::from("c"));
        store.append(&a, &b, env("1")).await.unwrap();
        store.append(&b, &a, env("2")).await.unwrap();
        store.append(&a, &c, env("3")).await.unwrap();

        let msgs = store.query(&a, &b, 100).await.unwrap();
        let bodies: Vec<&str> = msgs.iter().map(|m| m.envelope.ciphertext.as_str()).collect();
        assert_eq!(bodies, vec!["1", "2"]);
        assert!(msgs.iter().all(|m| !m.read));
    }

    #[tokio::test]
    async fn test_query_limit_keeps_newest() {
        let store = InMemoryMessageStore::new();
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        for i in 0..5 {
            store.append(&a, &b, env(&i.to_string())).await.unwrap();
        }
        let msgs = store.query(&b, &a, 2).await.unwrap();
        let bodies: Vec<&str> = msgs.iter().map(|m| m.envelope.ciphertext.as_str()).collect();
        assert_eq!(bodies, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn test_subscribe_filters_conversation() {
        let store = InMemoryMessageStore::new();
        let (a, b, c) = (UserId::from("a"), UserId::from("b"), UserId::from("c"));
        let mut sub = store.subscribe(&b, &a).await.unwrap();

        store.append(&c, &b, env("other")).await.unwrap();
        let id = store.append(&a, &b, env("mine")).await.unwrap();

        let got = sub.recv().await.unwrap();
        assert_eq!(got.id, id);
    }

    #[tokio::test]
    async fn test_mark_read() {
        let store = InMemoryMessageStore::new();
        let (a, b) = (UserId::from("a"), UserId::from("b"));
        let id = store.append(&a, &b, env("x")).await.unwrap();

        store.mark_read(&id).await.unwrap();
        assert!(store.query(&a, &b, 10).await.unwrap()[0].read);

        let missing = MessageId::from("nope");
        assert_eq!(
            store.mark_read(&missing).await,
            Err(StoreError::NotFound(missing))
        );
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryMessageStore::new();
        store.set_available(false);
        let res = store.append(&"a".into(), &"b".into(), env("x")).await;
        assert!(matches!(res, Err(StoreError::Unavailable(_))));
    }
}
