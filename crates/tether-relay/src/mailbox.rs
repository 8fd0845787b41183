use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tether_core::relay::RelayDelivery;
use tether_core::signal::{SignalId, SignalMessage};
use tether_core::types::UserId;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct StoredSignal {
    pub message: SignalMessage,
    pub received: Instant,
}

/// Signals from one sender to one recipient, ordered by id.
#[derive(Debug)]
pub struct SignalMailbox {
    pub signals: BTreeMap<SignalId, StoredSignal>,
    pub last_activity: Instant,
    pub notify: Arc<Notify>,
}

impl Default for SignalMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalMailbox {
    pub fn new() -> Self {
        Self {
            signals: BTreeMap::new(),
            last_activity: Instant::now(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn post(&mut self, id: SignalId, message: SignalMessage, max_len: usize) -> Result<(), MailboxError> {
        if self.signals.len() >= max_len {
            return Err(MailboxError::QueueFull);
        }
        self.signals.insert(
            id,
            StoredSignal {
                message,
                received: Instant::now(),
            },
        );
        self.last_activity = Instant::now();
        self.notify.notify_waiters();
        Ok(())
    }

    /// Signals with an id greater than `after`, oldest first.
    pub fn after(&mut self, after: Option<&SignalId>) -> Vec<RelayDelivery> {
        self.last_activity = Instant::now();
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Unbounded,
        };
        self.signals
            .range((lower, Bound::Unbounded))
            .map(|(id, s)| RelayDelivery {
                id: id.clone(),
                message: s.message.clone(),
            })
            .collect()
    }

    pub fn remove(&mut self, id: &SignalId) -> bool {
        self.last_activity = Instant::now();
        self.signals.remove(id).is_some()
    }

    pub fn clear(&mut self) -> usize {
        self.last_activity = Instant::now();
        let n = self.signals.len();
        self.signals.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn evict_expired(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.signals.len();
        self.signals
            .retain(|_, s| now.duration_since(s.received) <= ttl);
        before - self.signals.len()
    }

    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.signals.is_empty() && Instant::now().duration_since(self.last_activity) > idle_timeout
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox full")]
    QueueFull,
}

pub type MailboxKey = (UserId, UserId);

/// All mailboxes on the server, keyed by (recipient, sender).
#[derive(Debug, Default)]
pub struct SignalBoard {
    mailboxes: DashMap<MailboxKey, SignalMailbox>,
    next_id: AtomicU64,
}

impl SignalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, message: SignalMessage, max_len: usize) -> Result<SignalId, MailboxError> {
        let key = (message.to.clone(), message.from.clone());
        let id = SignalId::from_sequence(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.mailboxes
            .entry(key)
            .or_default()
            .post(id.clone(), message, max_len)?;
        Ok(id)
    }

    pub fn read(&self, recipient: &UserId, sender: &UserId, after: Option<&SignalId>) -> Vec<RelayDelivery> {
        self.mailboxes
            .get_mut(&(recipient.clone(), sender.clone()))
            .map(|mut m| m.after(after))
            .unwrap_or_default()
    }

    /// Wakeup handle for long polls on one mailbox, creating it if needed.
    pub fn notifier(&self, recipient: &UserId, sender: &UserId) -> Arc<Notify> {
        self.mailboxes
            .entry((recipient.clone(), sender.clone()))
            .or_default()
            .notify
            .clone()
    }

    pub fn delete(&self, recipient: &UserId, sender: &UserId, id: &SignalId) -> bool {
        self.mailboxes
            .get_mut(&(recipient.clone(), sender.clone()))
            .map(|mut m| m.remove(id))
            .unwrap_or(false)
    }

    pub fn purge(&self, recipient: &UserId, sender: &UserId) -> usize {
        self.mailboxes
            .get_mut(&(recipient.clone(), sender.clone()))
            .map(|mut m| m.clear())
            .unwrap_or(0)
    }

    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn pending_count(&self) -> usize {
        self.mailboxes.iter().map(|e| e.value().len()).sum()
    }

    /// Drop expired signals and idle mailboxes. Returns (evicted, removed).
    pub fn evict(&self, ttl: Duration, idle_timeout: Duration) -> (usize, usize) {
        let mut evicted = 0;
        let mut idle = Vec::new();

        for mut entry in self.mailboxes.iter_mut() {
            evicted += entry.value_mut().evict_expired(ttl);
            if entry.value().is_idle(idle_timeout) {
                idle.push(entry.key().clone());
            }
        }

        // Only drop mailboxes that nobody is waiting on.
        let removed = idle
            .into_iter()
            .filter(|key| {
                self.mailboxes
                    .remove_if(key, |_, m| m.is_empty() && Arc::strong_count(&m.notify) == 1)
                    .is_some()
            })
            .count();

        (evicted, removed)
    }
}
