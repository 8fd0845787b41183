//! Encrypted message exchange over live channels and the durable store.
//!
//! Every body is sealed for the recipient before it leaves this process,
//! whichever path it takes. Messages on one live channel arrive in the
//! order they were sent. There is no ordering guarantee between the live
//! path and the store path; readers merge by timestamp if they need to.
//! Live messages that arrive before anyone reads them wait in the
//! coordinator's inbound queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_crypto::PublicKey;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, DeliveryPolicy};
use crate::coordinator::{ConnectionCoordinator, InboundFrames};
use crate::directory::{KeyDirectory, PublicKeyRecord};
use crate::envelope::{EncryptedEnvelope, MessageContent, WireMessage};
use crate::errors::CoreError;
use crate::keys::LocalIdentity;
use crate::session::SessionHandle;
use crate::store::{MessageStore, StoreSubscription, StoredMessage};
use crate::types::{now_millis, MessageId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryPath {
    Live,
    Store,
}

/// A message as presented to the local user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub recipient: UserId,
    pub timestamp: i64,
    pub content: MessageContent,
    pub read: bool,
    pub path: DeliveryPath,
}

pub struct MessageExchange {
    identity: Arc<LocalIdentity>,
    directory: Arc<dyn KeyDirectory>,
    coordinator: Arc<ConnectionCoordinator>,
    store: Option<Arc<dyn MessageStore>>,
    policy: DeliveryPolicy,
    history_limit: usize,
    seen: Arc<Mutex<SeenWindow>>,
}

impl MessageExchange {
    pub fn new(
        identity: Arc<LocalIdentity>,
        directory: Arc<dyn KeyDirectory>,
        coordinator: Arc<ConnectionCoordinator>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            identity,
            directory,
            coordinator,
            store: None,
            policy: config.delivery_policy,
            history_limit: config.history_limit,
            seen: Arc::new(Mutex::new(SeenWindow::new(config.dedup_window))),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn local(&self) -> &UserId {
        self.identity.user_id()
    }

    /// Advertise the local public key so others can send to us.
    pub async fn publish_identity(
        &self,
        display_name: &str,
        photo_url: Option<String>,
    ) -> Result<PublicKeyRecord, CoreError> {
        let record = self.identity.public_record(display_name, photo_url);
        self.directory.publish(record.clone()).await?;
        info!(user = %record.user_id, fingerprint = %self.identity.public_key().fingerprint(), "identity published");
        Ok(record)
    }

    /// Encrypt `plaintext` for `recipient` and deliver it per the delivery
    /// policy.
    pub async fn send(&self, recipient: &UserId, plaintext: &str) -> Result<MessageId, CoreError> {
        let record = self
            .directory
            .lookup(recipient)
            .await?
            .ok_or_else(|| CoreError::UnknownRecipient(recipient.clone()))?;
        let key = PublicKey::from_base64(&record.public_key)?;
        let envelope = EncryptedEnvelope::seal(plaintext, &key)?;
        let live = self.coordinator.connected(recipient);

        match self.policy {
            DeliveryPolicy::PreferLive => match live {
                Some(session) => {
                    let id = MessageId::generate();
                    match self.send_live(&session, id.clone(), envelope.clone()).await {
                        Ok(()) => Ok(id),
                        Err(CoreError::ChannelNotOpen) if self.store.is_some() => {
                            debug!(peer = %recipient, "channel closed during send, storing instead");
                            self.store_message(None, recipient, envelope).await
                        }
                        Err(e) => Err(e),
                    }
                }
                None => self.store_message(None, recipient, envelope).await,
            },
            DeliveryPolicy::StoreOnly => self.store_message(None, recipient, envelope).await,
            DeliveryPolicy::LiveAndStore => {
                let id = MessageId::generate();
                match (&self.store, live) {
                    (Some(_), live) => {
                        self.store_message(Some(id.clone()), recipient, envelope.clone())
                            .await?;
                        if let Some(session) = live {
                            if let Err(e) = self.send_live(&session, id.clone(), envelope).await {
                                warn!(peer = %recipient, error = %e, "live copy not sent");
                            }
                        }
                        Ok(id)
                    }
                    (None, Some(session)) => {
                        self.send_live(&session, id.clone(), envelope).await?;
                        Ok(id)
                    }
                    (None, None) => Err(CoreError::ChannelNotOpen),
                }
            }
        }
    }

    async fn send_live(
        &self,
        session: &SessionHandle,
        id: MessageId,
        envelope: EncryptedEnvelope,
    ) -> Result<(), CoreError> {
        let wire = WireMessage {
            id,
            sender: self.identity.user_id().clone(),
            sent_at: now_millis(),
            envelope,
        };
        session.send(Bytes::from(wire.encode()?)).await?;
        debug!(peer = %session.peer(), message = %wire.id, "message sent live");
        Ok(())
    }

    async fn store_message(
        &self,
        id: Option<MessageId>,
        recipient: &UserId,
        envelope: EncryptedEnvelope,
    ) -> Result<MessageId, CoreError> {
        let store = self.store.as_ref().ok_or(CoreError::ChannelNotOpen)?;
        let sender = self.identity.user_id();
        let id = match id {
            Some(id) => store.append_with_id(id, sender, recipient, envelope).await?,
            None => store.append(sender, recipient, envelope).await?,
        };
        debug!(peer = %recipient, message = %id, "message stored");
        Ok(id)
    }

    /// Conversation with `peer` from the store, oldest first, decrypted.
    pub async fn history(&self, peer: &UserId) -> Result<Vec<InboundMessage>, CoreError> {
        let store = self.store.as_ref().ok_or(CoreError::ChannelNotOpen)?;
        let messages = store
            .query(self.identity.user_id(), peer, self.history_limit)
            .await?;
        Ok(messages
            .into_iter()
            .map(|m| present_stored(&self.identity, m))
            .collect())
    }

    pub async fn mark_read(&self, id: &MessageId) -> Result<(), CoreError> {
        let store = self.store.as_ref().ok_or(CoreError::ChannelNotOpen)?;
        Ok(store.mark_read(id).await?)
    }

    /// Decrypted stream of messages appended to the conversation with `peer`.
    pub async fn watch_history(&self, peer: &UserId) -> Result<HistoryWatch, CoreError> {
        let store = self.store.as_ref().ok_or(CoreError::ChannelNotOpen)?;
        let subscription = store.subscribe(self.identity.user_id(), peer).await?;
        Ok(HistoryWatch {
            identity: self.identity.clone(),
            subscription,
        })
    }

    /// Decrypted stream of live-channel messages from every peer. Messages
    /// received before this is called are not lost. Streams taken from one
    /// exchange share its queue and duplicate window.
    pub fn incoming(&self) -> IncomingMessages {
        IncomingMessages {
            identity: self.identity.clone(),
            frames: self.coordinator.inbound(),
            seen: self.seen.clone(),
        }
    }
}

fn decrypt_content(identity: &LocalIdentity, sender: &UserId, envelope: &EncryptedEnvelope) -> MessageContent {
    if sender == identity.user_id() && envelope.encrypted {
        return MessageContent::Sealed;
    }
    match envelope.open(identity.private_key()) {
        Ok(text) => MessageContent::Text(text),
        Err(e) => {
            warn!(sender = %sender, error = %e, "message could not be decrypted");
            MessageContent::Unreadable
        }
    }
}

fn present_stored(identity: &LocalIdentity, message: StoredMessage) -> InboundMessage {
    let content = decrypt_content(identity, &message.sender, &message.envelope);
    InboundMessage {
        id: message.id,
        sender: message.sender,
        recipient: message.recipient,
        timestamp: message.timestamp,
        content,
        read: message.read,
        path: DeliveryPath::Store,
    }
}

pub struct HistoryWatch {
    identity: Arc<LocalIdentity>,
    subscription: StoreSubscription,
}

impl HistoryWatch {
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        let message = self.subscription.recv().await?;
        Some(present_stored(&self.identity, message))
    }
}

pub struct IncomingMessages {
    identity: Arc<LocalIdentity>,
    frames: InboundFrames,
    seen: Arc<Mutex<SeenWindow>>,
}

impl IncomingMessages {
    /// Next live message, skipping malformed frames and repeated ids.
    /// Returns `None` once the coordinator is gone.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        loop {
            let frame = self.frames.recv().await?;
            let peer = frame.peer;

            let wire = match WireMessage::decode(&frame.data) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "skipping malformed frame");
                    continue;
                }
            };
            if wire.sender != peer {
                warn!(peer = %peer, "skipping frame with mismatched sender");
                continue;
            }
            if !self.seen.lock().remember(&wire.id) {
                debug!(peer = %peer, message = %wire.id, "duplicate message suppressed");
                continue;
            }

            let content = decrypt_content(&self.identity, &peer, &wire.envelope);
            return Some(InboundMessage {
                id: wire.id,
                sender: peer,
                recipient: self.identity.user_id().clone(),
                timestamp: wire.sent_at,
                content,
                read: false,
                path: DeliveryPath::Live,
            });
        }
    }
}

/// Most recent message ids, oldest evicted first.
struct SeenWindow {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    capacity: usize,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// False if `id` is already in the window.
    fn remember(&mut self, id: &MessageId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_messages_are_sealed() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");
        let env = EncryptedEnvelope::seal("hi", bob.public_key()).unwrap();
        assert_eq!(
            decrypt_content(&alice, alice.user_id(), &env),
            MessageContent::Sealed
        );
        assert_eq!(
            decrypt_content(&bob, alice.user_id(), &env),
            MessageContent::Text("hi".into())
        );
    }

    #[test]
    fn test_wrong_key_yields_unreadable() {
        let alice = LocalIdentity::generate("alice");
        let bob = LocalIdentity::generate("bob");
        let carol = LocalIdentity::generate("carol");
        let env = EncryptedEnvelope::seal("hi", bob.public_key()).unwrap();
        assert_eq!(
            decrypt_content(&carol, alice.user_id(), &env),
            MessageContent::Unreadable
        );
    }

    #[test]
    fn test_dedup_window_evicts_oldest() {
        let mut seen = SeenWindow::new(2);
        let (a, b, c) = (MessageId::from("a"), MessageId::from("b"), MessageId::from("c"));
        assert!(seen.remember(&a));
        assert!(!seen.remember(&a));
        assert!(seen.remember(&b));
        assert!(seen.remember(&c));
        // "a" fell out of the window.
        assert!(seen.remember(&a));
    }
}
