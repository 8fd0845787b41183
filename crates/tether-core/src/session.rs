//! Per-peer connection session.
//!
//! Each session is driven by one actor task that owns the transport, the
//! relay subscription and both buffers. Callers talk to it through a
//! cloneable [`SessionHandle`]; state is published on a watch channel and
//! on the coordinator-wide event stream. Received bytes go to the
//! coordinator's inbound queue, which buffers them until read.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::CoreError;
use crate::relay::{RelayDelivery, RelayError, SignalRelay, SignalSubscription};
use crate::signal::{SignalKind, SignalMessage};
use crate::transport::{DescriptionKind, PeerTransport, TransportError, TransportEvent};
use crate::types::UserId;

// ============================================================================
// State
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Glare tie-break: the lexicographically smaller id initiates.
    pub fn for_pair(local: &UserId, remote: &UserId) -> Role {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureReason {
    TimedOut,
    Transport(String),
    Relay(String),
}

impl FailureReason {
    pub fn to_error(&self) -> CoreError {
        match self {
            FailureReason::TimedOut => CoreError::ConnectionTimedOut,
            FailureReason::Transport(msg) => CoreError::TransportFailure(msg.clone()),
            FailureReason::Relay(msg) => CoreError::RelayUnavailable(msg.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed(FailureReason),
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Closed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed(_) => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "failed ({:?})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Coordinator-wide session event.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    StateChanged { peer: UserId, state: ConnectionState },
}

/// Application bytes received from a peer over its data channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    pub peer: UserId,
    pub data: Bytes,
}

// ============================================================================
// Handle
// ============================================================================

pub(crate) enum SessionCommand {
    Send {
        data: Bytes,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    peer: UserId,
    role: Role,
    generation: u64,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(
        peer: UserId,
        role: Role,
        generation: u64,
        state: watch::Receiver<ConnectionState>,
        commands: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            peer,
            role,
            generation,
            state,
            commands,
        }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Send application bytes. While connecting they are buffered and
    /// flushed once the channel opens.
    pub async fn send(&self, data: Bytes) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send { data, reply })
            .map_err(|_| CoreError::ChannelNotOpen)?;
        rx.await.unwrap_or(Err(CoreError::ChannelNotOpen))
    }

    /// Close the session. A no-op once the session is terminal.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until the state satisfies `f` and return it. Returns the last
    /// known state if the session ends without ever satisfying it.
    pub async fn wait_for<F>(&self, f: F) -> ConnectionState
    where
        F: Fn(&ConnectionState) -> bool,
    {
        let mut rx = self.state.clone();
        let result = rx.wait_for(|s| f(s) || s.is_terminal()).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Wait for the session to connect or end.
    pub async fn wait_settled(&self) -> ConnectionState {
        self.wait_for(|s| *s == ConnectionState::Connected).await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Error)]
enum ApplyError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ApplyError {
    /// Errors after which the session cannot make progress.
    fn failure(&self) -> Option<FailureReason> {
        match self {
            ApplyError::Relay(e) => Some(FailureReason::Relay(e.to_string())),
            ApplyError::Transport(e @ (TransportError::Failed(_) | TransportError::Closed)) => {
                Some(FailureReason::Transport(e.to_string()))
            }
            ApplyError::Transport(_) => None,
        }
    }
}

pub(crate) struct SessionActor {
    local: UserId,
    remote: UserId,
    role: Role,
    channel_label: String,
    relay: Arc<dyn SignalRelay>,
    transport: Box<dyn PeerTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    subscription: SignalSubscription,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    pending_candidates: VecDeque<String>,
    outbound: VecDeque<Bytes>,
    applied_remote: Option<String>,
    deadline: Instant,
}

pub(crate) struct SessionParts {
    pub local: UserId,
    pub remote: UserId,
    pub role: Role,
    pub channel_label: String,
    pub relay: Arc<dyn SignalRelay>,
    pub transport: Box<dyn PeerTransport>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub subscription: SignalSubscription,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub state: watch::Sender<ConnectionState>,
    pub events: broadcast::Sender<SessionEvent>,
    pub inbound: mpsc::UnboundedSender<InboundFrame>,
    pub deadline: Instant,
}

impl SessionActor {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            local: parts.local,
            remote: parts.remote,
            role: parts.role,
            channel_label: parts.channel_label,
            relay: parts.relay,
            transport: parts.transport,
            transport_events: parts.transport_events,
            subscription: parts.subscription,
            commands: parts.commands,
            state: parts.state,
            events: parts.events,
            inbound: parts.inbound,
            pending_candidates: VecDeque::new(),
            outbound: VecDeque::new(),
            applied_remote: None,
            deadline: parts.deadline,
        }
    }

    fn current(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous == next {
            return;
        }
        info!(peer = %self.remote, from = %previous, to = %next, "session state changed");
        let _ = self.events.send(SessionEvent::StateChanged {
            peer: self.remote.clone(),
            state: next,
        });
    }

    /// Enter `Connecting` and, as initiator, publish the offer.
    pub(crate) async fn start(&mut self) -> Result<(), CoreError> {
        self.set_state(ConnectionState::Connecting);
        if self.role == Role::Responder {
            return Ok(());
        }

        let result = self.initiate().await;
        if let Err(e) = &result {
            let reason = match e {
                CoreError::RelayUnavailable(msg) => FailureReason::Relay(msg.clone()),
                other => FailureReason::Transport(other.to_string()),
            };
            self.teardown(ConnectionState::Failed(reason)).await;
        }
        result
    }

    async fn initiate(&mut self) -> Result<(), CoreError> {
        self.transport.create_data_channel(&self.channel_label).await?;
        let offer = self.transport.create_offer().await?;
        self.publish(SignalKind::Offer, offer).await?;
        Ok(())
    }

    async fn publish(&mut self, kind: SignalKind, payload: String) -> Result<(), RelayError> {
        let message = SignalMessage::new(kind, payload, self.local.clone(), self.remote.clone());
        let id = self.relay.publish(message).await?;
        debug!(peer = %self.remote, kind = %kind, signal = %id, "signal sent");
        Ok(())
    }

    /// Tear down a session whose setup never finished.
    pub(crate) async fn abandon(mut self, reason: FailureReason) {
        self.teardown(ConnectionState::Failed(reason)).await;
    }

    pub(crate) async fn run(mut self) {
        let timeout = tokio::time::sleep_until(self.deadline);
        tokio::pin!(timeout);

        while !self.current().is_terminal() {
            let connecting = self.current() == ConnectionState::Connecting;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Send { data, reply }) => {
                        let result = self.handle_send(data).await;
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Close { reply }) => {
                        self.teardown(ConnectionState::Closed).await;
                        let _ = reply.send(());
                    }
                    None => self.teardown(ConnectionState::Closed).await,
                },
                delivery = self.subscription.recv() => match delivery {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => {
                        let reason = FailureReason::Relay("subscription ended".into());
                        self.teardown(ConnectionState::Failed(reason)).await;
                    }
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        let reason = FailureReason::Transport("event stream ended".into());
                        self.teardown(ConnectionState::Failed(reason)).await;
                    }
                },
                () = &mut timeout, if connecting => {
                    warn!(peer = %self.remote, "connection attempt timed out");
                    self.teardown(ConnectionState::Failed(FailureReason::TimedOut)).await;
                }
            }
        }
        debug!(peer = %self.remote, "session actor finished");
    }

    async fn handle_send(&mut self, data: Bytes) -> Result<(), CoreError> {
        match self.current() {
            ConnectionState::Connected => Ok(self.transport.send(data).await?),
            ConnectionState::Idle | ConnectionState::Connecting => {
                self.outbound.push_back(data);
                Ok(())
            }
            _ => Err(CoreError::ChannelNotOpen),
        }
    }

    async fn handle_delivery(&mut self, delivery: RelayDelivery) {
        let RelayDelivery { id, message } = delivery;
        debug!(peer = %self.remote, kind = %message.kind, signal = %id, "signal received");

        if let Err(e) = self.apply_signal(message).await {
            warn!(peer = %self.remote, signal = %id, error = %e, "failed to apply signal");
            if let Some(reason) = e.failure() {
                self.teardown(ConnectionState::Failed(reason)).await;
                return;
            }
        }

        if let Err(e) = self.relay.acknowledge(&self.local, &self.remote, &id).await {
            warn!(peer = %self.remote, signal = %id, error = %e, "failed to delete consumed signal");
        }
    }

    async fn apply_signal(&mut self, message: SignalMessage) -> Result<(), ApplyError> {
        if message.from != self.remote || message.to != self.local {
            warn!(peer = %self.remote, "dropping misaddressed signal");
            return Ok(());
        }

        match message.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let (expected, kind) = match message.kind {
                    SignalKind::Offer => (Role::Responder, DescriptionKind::Offer),
                    _ => (Role::Initiator, DescriptionKind::Answer),
                };
                if self.role != expected {
                    warn!(peer = %self.remote, kind = %message.kind, role = ?self.role, "ignoring description for the other role");
                    return Ok(());
                }
                match self.applied_remote.as_deref() {
                    Some(applied) if applied == message.payload => {
                        debug!(peer = %self.remote, kind = %message.kind, "duplicate description ignored");
                        return Ok(());
                    }
                    Some(_) => {
                        warn!(peer = %self.remote, kind = %message.kind, "conflicting description ignored");
                        return Ok(());
                    }
                    None => {}
                }

                self.transport
                    .set_remote_description(kind, &message.payload)
                    .await?;
                self.applied_remote = Some(message.payload);
                self.drain_candidates().await;

                if kind == DescriptionKind::Offer {
                    let answer = self.transport.create_answer().await?;
                    self.publish(SignalKind::Answer, answer).await?;
                }
            }
            SignalKind::IceCandidate => {
                if self.applied_remote.is_some() {
                    self.transport.add_ice_candidate(&message.payload).await?;
                } else {
                    debug!(peer = %self.remote, buffered = self.pending_candidates.len() + 1, "candidate buffered");
                    self.pending_candidates.push_back(message.payload);
                }
            }
        }
        Ok(())
    }

    async fn drain_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!(peer = %self.remote, error = %e, "buffered candidate rejected");
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.publish(SignalKind::IceCandidate, candidate).await {
                    warn!(peer = %self.remote, error = %e, "failed to publish candidate");
                }
            }
            TransportEvent::ChannelOpen => {
                if self.current() != ConnectionState::Connecting {
                    return;
                }
                self.set_state(ConnectionState::Connected);
                while let Some(data) = self.outbound.pop_front() {
                    if let Err(e) = self.transport.send(data).await {
                        warn!(peer = %self.remote, error = %e, "failed to flush buffered message");
                    }
                }
            }
            TransportEvent::ChannelClosed => {
                info!(peer = %self.remote, "data channel closed by peer");
                self.teardown(ConnectionState::Closed).await;
            }
            TransportEvent::Data(data) => {
                let frame = InboundFrame {
                    peer: self.remote.clone(),
                    data,
                };
                if self.inbound.send(frame).is_err() {
                    warn!(peer = %self.remote, "inbound queue closed, frame dropped");
                }
            }
            TransportEvent::Failed(reason) => {
                warn!(peer = %self.remote, reason = %reason, "transport failed");
                self.teardown(ConnectionState::Failed(FailureReason::Transport(reason)))
                    .await;
            }
        }
    }

    /// Release the transport and subscription and purge relay artifacts in
    /// both directions. Runs at most once.
    async fn teardown(&mut self, terminal: ConnectionState) {
        if self.current().is_terminal() {
            return;
        }

        self.transport.close().await;
        if let Err(e) = self.relay.unsubscribe(self.subscription.id()).await {
            debug!(peer = %self.remote, error = %e, "unsubscribe failed");
        }
        for (recipient, sender) in [(&self.local, &self.remote), (&self.remote, &self.local)] {
            if let Err(e) = self.relay.purge(recipient, sender).await {
                warn!(peer = %self.remote, error = %e, "failed to purge signals");
            }
        }

        if !self.outbound.is_empty() {
            warn!(peer = %self.remote, dropped = self.outbound.len(), "discarding unsent messages");
        }
        self.outbound.clear();
        self.pending_candidates.clear();
        self.set_state(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_for_pair_is_antisymmetric() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        assert_eq!(Role::for_pair(&alice, &bob), Role::Initiator);
        assert_eq!(Role::for_pair(&bob, &alice), Role::Responder);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionState::Idle.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed(FailureReason::TimedOut).is_terminal());
    }

    #[test]
    fn test_failure_reason_maps_to_error() {
        assert_eq!(FailureReason::TimedOut.to_error(), CoreError::ConnectionTimedOut);
        assert!(matches!(
            FailureReason::Relay("x".into()).to_error(),
            CoreError::RelayUnavailable(_)
        ));
    }

    fn assert_send<T: Send>(_: &T) {}

    // Actor futures are handed to tokio::spawn.
    fn actor_futures_are_send(actor: SessionActor, other: SessionActor) {
        let run = actor.run();
        assert_send(&run);
        let abandon = other.abandon(FailureReason::TimedOut);
        assert_send(&abandon);
    }

    #[test]
    fn test_actor_futures_are_send() {
        let _check: fn(SessionActor, SessionActor) = actor_futures_are_send;
    }

    #[test]
    fn test_fatal_apply_errors() {
        assert!(ApplyError::Relay(RelayError::Unavailable("x".into())).failure().is_some());
        assert!(ApplyError::Transport(TransportError::Failed("x".into())).failure().is_some());
        assert!(ApplyError::Transport(TransportError::InvalidDescription("x".into()))
            .failure()
            .is_none());
    }
}
