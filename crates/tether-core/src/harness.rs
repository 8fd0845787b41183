//! Test harness for Tether core functionality.
//!
//! Builds peers that share one in-memory relay, key directory, message
//! store and loopback network, so connection and messaging flows can run
//! end to end inside a single process.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{CoreConfig, DeliveryPolicy};
use crate::coordinator::ConnectionCoordinator;
use crate::directory::{InMemoryKeyDirectory, KeyDirectory};
use crate::errors::CoreError;
use crate::exchange::MessageExchange;
use crate::keys::LocalIdentity;
use crate::loopback::LoopbackNetwork;
use crate::relay::InMemoryRelay;
use crate::session::{ConnectionState, Role, SessionHandle};
use crate::store::InMemoryMessageStore;
use crate::types::UserId;

/// Shared infrastructure for a group of test peers.
#[derive(Clone)]
pub struct TestNetwork {
    pub relay: InMemoryRelay,
    pub directory: InMemoryKeyDirectory,
    pub store: InMemoryMessageStore,
    pub transports: LoopbackNetwork,
    pub config: CoreConfig,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        Self {
            relay: InMemoryRelay::new(),
            directory: InMemoryKeyDirectory::new(),
            store: InMemoryMessageStore::new(),
            transports: LoopbackNetwork::new(),
            config,
        }
    }

    /// Build a peer with a fresh identity. The public key is not published.
    pub fn unpublished_peer(&self, name: &str) -> TestPeer {
        let identity = Arc::new(LocalIdentity::generate(name));
        let coordinator = Arc::new(ConnectionCoordinator::new(
            identity.user_id().clone(),
            Arc::new(self.relay.clone()),
            Arc::new(self.transports.clone()),
            self.config.clone(),
        ));
        let exchange = MessageExchange::new(
            identity.clone(),
            Arc::new(self.directory.clone()),
            coordinator.clone(),
            &self.config,
        )
        .with_store(Arc::new(self.store.clone()));

        TestPeer {
            identity,
            coordinator,
            exchange,
        }
    }

    /// Build a peer and publish its public key to the shared directory.
    pub async fn peer(&self, name: &str) -> TestPeer {
        let peer = self.unpublished_peer(name);
        self.directory
            .publish(peer.identity.public_record(name, None))
            .await
            .expect("publish test identity");
        peer
    }

    /// Peer whose exchange uses `policy` instead of the configured one.
    pub async fn peer_with_policy(&self, name: &str, policy: DeliveryPolicy) -> TestPeer {
        let mut peer = self.peer(name).await;
        peer.exchange = peer.exchange.with_policy(policy);
        peer
    }
}

pub struct TestPeer {
    pub identity: Arc<LocalIdentity>,
    pub coordinator: Arc<ConnectionCoordinator>,
    pub exchange: MessageExchange,
}

impl TestPeer {
    pub fn id(&self) -> UserId {
        self.identity.user_id().clone()
    }
}

/// Wait up to `within` for `handle` to satisfy `f` or end. `None` on timeout.
pub async fn wait_for_state<F>(
    handle: &SessionHandle,
    within: Duration,
    f: F,
) -> Option<ConnectionState>
where
    F: Fn(&ConnectionState) -> bool,
{
    tokio::time::timeout(within, handle.wait_for(f)).await.ok()
}

/// Open `a` as initiator and `b` as responder and wait until both are
/// connected.
pub async fn connect_pair(
    a: &TestPeer,
    b: &TestPeer,
    within: Duration,
) -> Result<(SessionHandle, SessionHandle), CoreError> {
    let ha = a.coordinator.open(b.id(), Role::Initiator, None).await?;
    let hb = b.coordinator.open(a.id(), Role::Responder, None).await?;

    for handle in [&ha, &hb] {
        match tokio::time::timeout(within, handle.wait_settled()).await {
            Ok(ConnectionState::Connected) => {}
            Ok(ConnectionState::Failed(reason)) => return Err(reason.to_error()),
            Ok(_) => return Err(CoreError::ChannelNotOpen),
            Err(_) => return Err(CoreError::ConnectionTimedOut),
        }
    }
    Ok((ha, hb))
}
