//! [`SignalRelay`] backed by a `tether-relay` server.
//!
//! Subscriptions are long-poll loops running on their own task. The poll
//! carries the last id seen, so entries left behind by a failed delete are
//! not handed out again to the same subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{StatusCode, Url};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::relay::{
    PublishResponse, RelayDelivery, RelayError, SignalRelay, SignalSubscription, SubscriptionId,
};
use crate::signal::{SignalId, SignalMessage};
use crate::types::UserId;

const DEFAULT_WAIT_MS: u64 = 25_000;
const RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpSignalRelay {
    base_url: Url,
    client: reqwest::Client,
    wait_ms: u64,
    request_timeout: Duration,
    next_subscription: Arc<AtomicU64>,
    pollers: Arc<Mutex<HashMap<SubscriptionId, JoinHandle<()>>>>,
}

fn http_err(e: reqwest::Error) -> RelayError {
    if e.is_connect() || e.is_timeout() {
        RelayError::Unavailable(e.to_string())
    } else {
        RelayError::Http(e.to_string())
    }
}

async fn bad_status(resp: reqwest::Response) -> RelayError {
    let status = resp.status();
    let body = resp.text().await.ok();
    if status.is_server_error() {
        RelayError::Unavailable(format!("status={} body={:?}", status, body))
    } else {
        RelayError::Http(format!("status={} body={:?}", status, body))
    }
}

impl HttpSignalRelay {
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Http(e.to_string()))?;
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| RelayError::Http(format!("invalid base url: {}", e)))?;
        Ok(Self {
            base_url,
            client,
            wait_ms: DEFAULT_WAIT_MS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            next_subscription: Arc::new(AtomicU64::new(0)),
            pollers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Server-side wait for each long poll.
    pub fn with_wait_ms(mut self, wait_ms: u64) -> Self {
        self.wait_ms = wait_ms;
        self
    }

    /// Upper bound on each request. Long polls get this on top of their
    /// server-side wait.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn mailbox_url(&self, recipient: &UserId, sender: &UserId, id: Option<&SignalId>) -> Result<Url, RelayError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RelayError::Http("base url cannot carry a path".into()))?;
            segments
                .pop_if_empty()
                .extend(["v1", "signals", recipient.as_str(), sender.as_str()]);
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        Ok(url)
    }

    /// One long poll. Returns entries newer than `after`.
    async fn poll(
        &self,
        recipient: &UserId,
        sender: &UserId,
        after: Option<&SignalId>,
    ) -> Result<Vec<RelayDelivery>, RelayError> {
        let mut url = self.mailbox_url(recipient, sender, None)?;
        url.query_pairs_mut()
            .append_pair("wait_ms", &self.wait_ms.to_string());
        if let Some(after) = after {
            url.query_pairs_mut().append_pair("after", after.as_str());
        }

        let resp = self
            .client
            .get(url)
            .timeout(Duration::from_millis(self.wait_ms) + self.request_timeout)
            .send()
            .await
            .map_err(http_err)?;
        match resp.status() {
            StatusCode::OK => resp
                .json::<Vec<RelayDelivery>>()
                .await
                .map_err(|e| RelayError::Serialization(e.to_string())),
            _ => Err(bad_status(resp).await),
        }
    }

    async fn delete(&self, url: Url) -> Result<StatusCode, RelayError> {
        let resp = self
            .client
            .delete(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(http_err)?;
        match resp.status() {
            s @ (StatusCode::NO_CONTENT | StatusCode::NOT_FOUND) => Ok(s),
            _ => Err(bad_status(resp).await),
        }
    }
}

#[async_trait]
impl SignalRelay for HttpSignalRelay {
    async fn publish(&self, message: SignalMessage) -> Result<SignalId, RelayError> {
        let url = self.mailbox_url(&message.to, &message.from, None)?;
        let resp = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&message)
            .send()
            .await
            .map_err(http_err)?;

        if resp.status() == StatusCode::CREATED {
            let body: PublishResponse = resp
                .json()
                .await
                .map_err(|e| RelayError::Serialization(e.to_string()))?;
            Ok(body.id)
        } else {
            Err(bad_status(resp).await)
        }
    }

    async fn subscribe(
        &self,
        recipient: &UserId,
        sender: &UserId,
    ) -> Result<SignalSubscription, RelayError> {
        // First poll inline so an unreachable relay fails the caller.
        let initial = {
            let once = self.clone().with_wait_ms(0);
            once.poll(recipient, sender, None).await?
        };

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cursor = initial.last().map(|d| d.id.clone());
        for delivery in initial {
            let _ = tx.send(delivery);
        }

        let relay = self.clone();
        let (r, s) = (recipient.clone(), sender.clone());
        let poller = tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    break;
                }
                match relay.poll(&r, &s, cursor.as_ref()).await {
                    Ok(deliveries) => {
                        if let Some(last) = deliveries.last() {
                            cursor = Some(last.id.clone());
                        }
                        for delivery in deliveries {
                            if tx.send(delivery).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(recipient = %r, sender = %s, error = %e, "signal poll failed");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
            debug!(recipient = %r, sender = %s, "signal poller stopped");
        });
        self.pollers.lock().insert(id, poller);

        Ok(SignalSubscription::new(id, recipient.clone(), sender.clone(), rx))
    }

    async fn acknowledge(
        &self,
        recipient: &UserId,
        sender: &UserId,
        id: &SignalId,
    ) -> Result<(), RelayError> {
        let url = self.mailbox_url(recipient, sender, Some(id))?;
        match self.delete(url).await? {
            StatusCode::NOT_FOUND => Err(RelayError::NotFound(id.clone())),
            _ => Ok(()),
        }
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), RelayError> {
        if let Some(poller) = self.pollers.lock().remove(&subscription) {
            poller.abort();
        }
        Ok(())
    }

    async fn purge(&self, recipient: &UserId, sender: &UserId) -> Result<(), RelayError> {
        let url = self.mailbox_url(recipient, sender, None)?;
        self.delete(url).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_urls_escape_ids() {
        let relay = HttpSignalRelay::new("http://relay.local:8080/").unwrap();
        let url = relay
            .mailbox_url(&"bob smith".into(), &"a/b".into(), Some(&SignalId::from_sequence(3)))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://relay.local:8080/v1/signals/bob%20smith/a%2Fb/00000000000000000003"
        );
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(HttpSignalRelay::new("not a url").is_err());
    }
}
