//! Signal relay contract and the in-memory adapter.
//!
//! A relay holds one mailbox per (recipient, sender) pair. Signals stay in
//! the mailbox until the recipient acknowledges them, so delivery is
//! at-least-once and consumers must tolerate duplicates.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::signal::{SignalId, SignalMessage};
use crate::types::UserId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("signal not found: {0}")]
    NotFound(SignalId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("http error: {0}")]
    Http(String),
}

/// A signal as handed to a subscriber, with the id needed to acknowledge it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDelivery {
    pub id: SignalId,
    pub message: SignalMessage,
}

/// Response body for a publish over HTTP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub id: SignalId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Stream of deliveries for one mailbox. Entries already present when the
/// subscription was made arrive first, in relay order.
pub struct SignalSubscription {
    id: SubscriptionId,
    recipient: UserId,
    sender: UserId,
    deliveries: mpsc::UnboundedReceiver<RelayDelivery>,
}

impl SignalSubscription {
    pub fn new(
        id: SubscriptionId,
        recipient: UserId,
        sender: UserId,
        deliveries: mpsc::UnboundedReceiver<RelayDelivery>,
    ) -> Self {
        Self {
            id,
            recipient,
            sender,
            deliveries,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn recipient(&self) -> &UserId {
        &self.recipient
    }

    pub fn sender(&self) -> &UserId {
        &self.sender
    }

    /// Next delivery, or `None` once the relay drops the subscription.
    pub async fn recv(&mut self) -> Option<RelayDelivery> {
        self.deliveries.recv().await
    }
}

/// Message board used to exchange connection-setup metadata between two
/// users who have no direct channel yet.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Append a signal to the `(message.to, message.from)` mailbox.
    async fn publish(&self, message: SignalMessage) -> Result<SignalId, RelayError>;

    async fn subscribe(
        &self,
        recipient: &UserId,
        sender: &UserId,
    ) -> Result<SignalSubscription, RelayError>;

    /// Delete one consumed signal.
    async fn acknowledge(
        &self,
        recipient: &UserId,
        sender: &UserId,
        id: &SignalId,
    ) -> Result<(), RelayError>;

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), RelayError>;

    /// Delete every signal in one mailbox.
    async fn purge(&self, recipient: &UserId, sender: &UserId) -> Result<(), RelayError>;
}

type MailboxKey = (UserId, UserId);

struct Subscriber {
    mailbox: MailboxKey,
    tx: mpsc::UnboundedSender<RelayDelivery>,
}

#[derive(Default)]
struct RelayState {
    mailboxes: HashMap<MailboxKey, BTreeMap<SignalId, SignalMessage>>,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    next_signal: u64,
    next_subscription: u64,
    unavailable: bool,
    fail_acknowledge: bool,
}

impl RelayState {
    fn check_available(&self) -> Result<(), RelayError> {
        if self.unavailable {
            Err(RelayError::Unavailable("relay offline".into()))
        } else {
            Ok(())
        }
    }

    fn fan_out(&mut self, mailbox: &MailboxKey, delivery: &RelayDelivery) {
        self.subscribers.retain(|_, sub| {
            if &sub.mailbox != mailbox {
                return true;
            }
            sub.tx.send(delivery.clone()).is_ok()
        });
    }
}

/// Process-local relay. Clones share state, so one instance can back every
/// peer in a test.
#[derive(Clone, Default)]
pub struct InMemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability; while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Make `acknowledge` fail while leaving other operations working.
    pub fn set_fail_acknowledge(&self, fail: bool) {
        self.state.lock().fail_acknowledge = fail;
    }

    /// Signals still waiting in one mailbox, oldest first.
    pub fn pending(&self, recipient: &UserId, sender: &UserId) -> Vec<SignalMessage> {
        let state = self.state.lock();
        state
            .mailboxes
            .get(&(recipient.clone(), sender.clone()))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Signals waiting in either direction between two users.
    pub fn pending_between(&self, a: &UserId, b: &UserId) -> usize {
        self.pending(a, b).len() + self.pending(b, a).len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Push every pending signal of a mailbox to its subscribers again.
    pub fn redeliver(&self, recipient: &UserId, sender: &UserId) {
        let mut state = self.state.lock();
        let key = (recipient.clone(), sender.clone());
        let deliveries: Vec<RelayDelivery> = state
            .mailboxes
            .get(&key)
            .map(|m| {
                m.iter()
                    .map(|(id, message)| RelayDelivery {
                        id: id.clone(),
                        message: message.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        for delivery in &deliveries {
            state.fan_out(&key, delivery);
        }
    }
}

#[async_trait]
impl SignalRelay for InMemoryRelay {
    async fn publish(&self, message: SignalMessage) -> Result<SignalId, RelayError> {
        let mut state = self.state.lock();
        state.check_available()?;

        state.next_signal += 1;
        let id = SignalId::from_sequence(state.next_signal);
        let key = (message.to.clone(), message.from.clone());
        debug!(kind = %message.kind, signal = %id, "signal published");

        state
            .mailboxes
            .entry(key.clone())
            .or_default()
            .insert(id.clone(), message.clone());

        let delivery = RelayDelivery {
            id: id.clone(),
            message,
        };
        state.fan_out(&key, &delivery);
        Ok(id)
    }

    async fn subscribe(
        &self,
        recipient: &UserId,
        sender: &UserId,
    ) -> Result<SignalSubscription, RelayError> {
        let mut state = self.state.lock();
        state.check_available()?;

        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        let key = (recipient.clone(), sender.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(existing) = state.mailboxes.get(&key) {
            for (signal_id, message) in existing {
                let _ = tx.send(RelayDelivery {
                    id: signal_id.clone(),
                    message: message.clone(),
                });
            }
        }

        state.subscribers.insert(id, Subscriber { mailbox: key, tx });
        Ok(SignalSubscription::new(
            id,
            recipient.clone(),
            sender.clone(),
            rx,
        ))
    }

    async fn acknowledge(
        &self,
        recipient: &UserId,
        sender: &UserId,
        id: &SignalId,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.fail_acknowledge {
            return Err(RelayError::Unavailable("delete rejected".into()));
        }

        let key = (recipient.clone(), sender.clone());
        let removed = state
            .mailboxes
            .get_mut(&key)
            .and_then(|m| m.remove(id))
            .is_some();
        if state.mailboxes.get(&key).is_some_and(|m| m.is_empty()) {
            state.mailboxes.remove(&key);
        }

        if removed {
            Ok(())
        } else {
            Err(RelayError::NotFound(id.clone()))
        }
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), RelayError> {
        self.state.lock().subscribers.remove(&subscription);
        Ok(())
    }

    async fn purge(&self, recipient: &UserId, sender: &UserId) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.mailboxes.remove(&(recipient.clone(), sender.clone()));
        Ok(())
    }
}
