//! Connection coordinator: at most one session per remote peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::errors::CoreError;
use crate::relay::SignalRelay;
use crate::session::{
    ConnectionState, FailureReason, InboundFrame, Role, SessionActor, SessionEvent,
    SessionHandle, SessionParts,
};
use crate::transport::{TransportFactory, TransportParts};
use crate::types::UserId;

pub struct ConnectionCoordinator {
    local: UserId,
    relay: Arc<dyn SignalRelay>,
    transports: Arc<dyn TransportFactory>,
    config: CoreConfig,
    sessions: Mutex<HashMap<UserId, SessionHandle>>,
    events: broadcast::Sender<SessionEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    inbound: InboundFrames,
    generation: AtomicU64,
}

/// Reader over every frame received by a coordinator's sessions.
///
/// Frames queue without bound until read. Clones share one queue, so each
/// frame is handed to exactly one reader.
#[derive(Clone)]
pub struct InboundFrames {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundFrame>>>,
}

impl InboundFrames {
    /// Next frame in arrival order. Cancel safe.
    pub async fn recv(&self) -> Option<InboundFrame> {
        self.rx.lock().await.recv().await
    }
}

/// Holds a reserved session slot while `open` sets the session up. Dropping
/// it armed (an error return or a cancelled `open`) releases the slot and
/// purges whatever the attempt left on the relay.
struct SlotGuard<'a> {
    coordinator: &'a ConnectionCoordinator,
    remote: UserId,
    generation: u64,
    armed: bool,
}

impl SlotGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.coordinator.forget(&self.remote, self.generation);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let relay = self.coordinator.relay.clone();
        let local = self.coordinator.local.clone();
        let remote = self.remote.clone();
        runtime.spawn(async move {
            for (recipient, sender) in [(&local, &remote), (&remote, &local)] {
                if let Err(e) = relay.purge(recipient, sender).await {
                    debug!(peer = %remote, error = %e, "purge after abandoned open failed");
                }
            }
        });
    }
}

impl ConnectionCoordinator {
    pub fn new(
        local: UserId,
        relay: Arc<dyn SignalRelay>,
        transports: Arc<dyn TransportFactory>,
        config: CoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            local,
            relay,
            transports,
            config,
            sessions: Mutex::new(HashMap::new()),
            events,
            inbound_tx,
            inbound: InboundFrames {
                rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            },
            generation: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    /// State changes of every session of this coordinator.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Bytes received on any live channel, buffered until read.
    pub fn inbound(&self) -> InboundFrames {
        self.inbound.clone()
    }

    /// Open a session with `remote` in the given role.
    ///
    /// Fails with `AlreadyConnecting`/`AlreadyConnected` while a live session
    /// exists for the pair. A terminal session is replaced. `timeout` falls
    /// back to the configured open timeout and bounds the whole attempt,
    /// including publishing the offer.
    pub async fn open(
        &self,
        remote: UserId,
        role: Role,
        timeout: Option<Duration>,
    ) -> Result<SessionHandle, CoreError> {
        if remote == self.local {
            return Err(CoreError::TransportFailure(
                "cannot open a session with self".into(),
            ));
        }

        let timeout = timeout.unwrap_or_else(|| self.config.open_timeout());
        let deadline = Instant::now() + timeout;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(remote.clone(), role, generation, state_rx, command_tx);

        {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(&remote) {
                match existing.state() {
                    ConnectionState::Idle | ConnectionState::Connecting => {
                        return Err(CoreError::AlreadyConnecting(remote));
                    }
                    ConnectionState::Connected => {
                        return Err(CoreError::AlreadyConnected(remote));
                    }
                    _ => {}
                }
            }
            sessions.insert(remote.clone(), handle.clone());
        }
        let slot = SlotGuard {
            coordinator: self,
            remote: remote.clone(),
            generation,
            armed: true,
        };

        info!(peer = %remote, role = ?role, timeout_ms = timeout.as_millis() as u64, "opening session");

        let setup = async {
            let TransportParts { transport, events } =
                self.transports.create(&self.config.transport_config()).await?;
            let subscription = self.relay.subscribe(&self.local, &remote).await?;
            Ok::<_, CoreError>((transport, events, subscription))
        };
        let (transport, events, subscription) = tokio::time::timeout_at(deadline, setup)
            .await
            .map_err(|_| CoreError::ConnectionTimedOut)??;

        let mut actor = SessionActor::new(SessionParts {
            local: self.local.clone(),
            remote: remote.clone(),
            role,
            channel_label: self.config.data_channel_label.clone(),
            relay: self.relay.clone(),
            transport,
            transport_events: events,
            subscription,
            commands: command_rx,
            state: state_tx,
            events: self.events.clone(),
            inbound: self.inbound_tx.clone(),
            deadline,
        });

        let started = tokio::time::timeout_at(deadline, actor.start()).await;
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(peer = %remote, "connection attempt timed out during setup");
                tokio::spawn(actor.abandon(FailureReason::TimedOut));
                return Err(CoreError::ConnectionTimedOut);
            }
        }

        slot.disarm();
        tokio::spawn(actor.run());
        Ok(handle)
    }

    /// Open with the role chosen by [`Role::for_pair`], so two peers opening
    /// toward each other at once agree on who initiates.
    pub async fn open_auto(
        &self,
        remote: UserId,
        timeout: Option<Duration>,
    ) -> Result<SessionHandle, CoreError> {
        let role = Role::for_pair(&self.local, &remote);
        self.open(remote, role, timeout).await
    }

    pub fn session(&self, remote: &UserId) -> Option<SessionHandle> {
        self.sessions.lock().get(remote).cloned()
    }

    /// The session with `remote` if its channel is open.
    pub fn connected(&self, remote: &UserId) -> Option<SessionHandle> {
        self.session(remote)
            .filter(|s| s.state() == ConnectionState::Connected)
    }

    pub fn peers(&self) -> Vec<UserId> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Close and forget the session with `remote`. Idempotent.
    pub async fn close(&self, remote: &UserId) {
        let handle = self.sessions.lock().remove(remote);
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.close().await;
        }
    }

    fn forget(&self, remote: &UserId, generation: u64) {
        let mut sessions = self.sessions.lock();
        if sessions.get(remote).map(|h| h.generation()) == Some(generation) {
            sessions.remove(remote);
            debug!(peer = %remote, "session slot released");
        }
    }
}
