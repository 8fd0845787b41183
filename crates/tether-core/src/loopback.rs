//! In-process transport simulation.
//!
//! Every endpoint created by a [`LoopbackNetwork`] gets a numeric id that is
//! embedded in its descriptions and candidates. Two endpoints connect once
//! each has applied the other's description and at least one of the other's
//! candidates; at that point the data channel opens on both sides. Like a
//! real ICE agent, a candidate is rejected until a remote description exists.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::transport::{
    DescriptionKind, PeerTransport, TransportConfig, TransportError, TransportEvent,
    TransportFactory, TransportParts,
};

const DEFAULT_CANDIDATES: usize = 2;

/// One candidate applied by an endpoint, in application order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedCandidate {
    pub endpoint: u64,
    pub candidate: String,
}

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    remote: Option<u64>,
    checked: bool,
    has_channel: bool,
    open: bool,
}

struct NetworkState {
    endpoints: HashMap<u64, Endpoint>,
    next_endpoint: u64,
    candidates_per_endpoint: usize,
    applied: Vec<AppliedCandidate>,
    fail_creation: bool,
}

impl NetworkState {
    fn try_open(&mut self, a: u64) {
        let Some(b) = self.endpoints.get(&a).and_then(|e| e.remote) else {
            return;
        };
        let ready = match (self.endpoints.get(&a), self.endpoints.get(&b)) {
            (Some(ea), Some(eb)) => {
                ea.checked
                    && eb.checked
                    && eb.remote == Some(a)
                    && (ea.has_channel || eb.has_channel)
                    && !ea.open
                    && !eb.open
            }
            _ => false,
        };
        if !ready {
            return;
        }
        for id in [a, b] {
            if let Some(endpoint) = self.endpoints.get_mut(&id) {
                endpoint.open = true;
                let _ = endpoint.events.send(TransportEvent::ChannelOpen);
            }
        }
        trace!(a, b, "loopback channel open");
    }
}

/// Shared simulated network. Clones refer to the same network.
#[derive(Clone)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_candidates(DEFAULT_CANDIDATES)
    }

    /// Network whose endpoints each gather `count` local candidates.
    pub fn with_candidates(count: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                endpoints: HashMap::new(),
                next_endpoint: 0,
                candidates_per_endpoint: count.max(1),
                applied: Vec::new(),
                fail_creation: false,
            })),
        }
    }

    /// Candidates applied so far, in the order endpoints applied them.
    pub fn applied_candidates(&self) -> Vec<AppliedCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().endpoints.values().filter(|e| e.open).count() / 2
    }

    /// Report an unrecoverable failure on every live endpoint.
    pub fn fail_all(&self, reason: &str) {
        let state = self.state.lock();
        for endpoint in state.endpoints.values() {
            let _ = endpoint.events.send(TransportEvent::Failed(reason.to_string()));
        }
    }

    /// Make the factory refuse to create transports.
    pub fn set_fail_creation(&self, fail: bool) {
        self.state.lock().fail_creation = fail;
    }

    fn register(&self) -> Result<(u64, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let mut state = self.state.lock();
        if state.fail_creation {
            return Err(TransportError::Failed("no network interfaces".into()));
        }
        state.next_endpoint += 1;
        let id = state.next_endpoint;
        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.insert(
            id,
            Endpoint {
                events: tx,
                remote: None,
                checked: false,
                has_channel: false,
                open: false,
            },
        );
        Ok((id, rx))
    }

    fn gather(&self, id: u64) {
        let state = self.state.lock();
        if let Some(endpoint) = state.endpoints.get(&id) {
            for n in 0..state.candidates_per_endpoint {
                let _ = endpoint
                    .events
                    .send(TransportEvent::LocalCandidate(candidate_line(id, n)));
            }
        }
    }

    fn with_endpoint<R>(&self, id: u64, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
        self.state.lock().endpoints.get_mut(&id).map(f)
    }

    fn apply_candidate(&self, id: u64, candidate: &str) {
        let mut state = self.state.lock();
        state.applied.push(AppliedCandidate {
            endpoint: id,
            candidate: candidate.to_string(),
        });
        if let Some(endpoint) = state.endpoints.get_mut(&id) {
            endpoint.checked = true;
        }
        state.try_open(id);
    }

    fn deliver(&self, id: u64, data: Bytes) -> Result<(), TransportError> {
        let state = self.state.lock();
        let endpoint = state.endpoints.get(&id).ok_or(TransportError::Closed)?;
        if !endpoint.open {
            return Err(TransportError::ChannelNotOpen);
        }
        let peer = endpoint
            .remote
            .and_then(|r| state.endpoints.get(&r))
            .ok_or(TransportError::ChannelNotOpen)?;
        peer.events
            .send(TransportEvent::Data(data))
            .map_err(|_| TransportError::ChannelNotOpen)
    }

    fn disconnect(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(endpoint) = state.endpoints.remove(&id) else {
            return;
        };
        if !endpoint.open {
            return;
        }
        if let Some(peer) = endpoint.remote.and_then(|r| state.endpoints.get_mut(&r)) {
            if peer.open {
                peer.open = false;
                let _ = peer.events.send(TransportEvent::ChannelClosed);
            }
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(&self, _config: &TransportConfig) -> Result<TransportParts, TransportError> {
        let (id, events) = self.register()?;
        Ok(TransportParts {
            transport: Box::new(LoopbackTransport {
                id,
                network: self.clone(),
                local: None,
                remote: None,
                gathered: false,
                closed: false,
            }),
            events,
        })
    }
}

fn description_line(kind: DescriptionKind, id: u64) -> String {
    let kind = match kind {
        DescriptionKind::Offer => "offer",
        DescriptionKind::Answer => "answer",
    };
    format!("loopback {} {}", kind, id)
}

fn parse_description(text: &str) -> Result<(DescriptionKind, u64), TransportError> {
    let invalid = || TransportError::InvalidDescription(text.chars().take(32).collect());
    let mut parts = text.split_whitespace();
    if parts.next() != Some("loopback") {
        return Err(invalid());
    }
    let kind = match parts.next() {
        Some("offer") => DescriptionKind::Offer,
        Some("answer") => DescriptionKind::Answer,
        _ => return Err(invalid()),
    };
    let id = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)?;
    Ok((kind, id))
}

fn candidate_line(id: u64, n: usize) -> String {
    format!("candidate {} {} typ host", id, n)
}

fn parse_candidate(text: &str) -> Result<u64, TransportError> {
    let mut parts = text.split_whitespace();
    if parts.next() != Some("candidate") {
        return Err(TransportError::InvalidCandidate(text.chars().take(32).collect()));
    }
    parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::InvalidCandidate(text.chars().take(32).collect()))
}

pub struct LoopbackTransport {
    id: u64,
    network: LoopbackNetwork,
    local: Option<DescriptionKind>,
    remote: Option<(DescriptionKind, u64)>,
    gathered: bool,
    closed: bool,
}

impl LoopbackTransport {
    pub fn endpoint_id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn install_local(&mut self, kind: DescriptionKind) -> String {
        self.local = Some(kind);
        if !self.gathered {
            self.gathered = true;
            self.network.gather(self.id);
        }
        description_line(kind, self.id)
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_data_channel(&mut self, _label: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.network
            .with_endpoint(self.id, |e| e.has_channel = true)
            .ok_or(TransportError::Closed)
    }

    async fn create_offer(&mut self) -> Result<String, TransportError> {
        self.ensure_open()?;
        Ok(self.install_local(DescriptionKind::Offer))
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        self.ensure_open()?;
        match self.remote {
            Some((DescriptionKind::Offer, _)) => Ok(self.install_local(DescriptionKind::Answer)),
            Some((DescriptionKind::Answer, _)) => Err(TransportError::InvalidDescription(
                "cannot answer an answer".into(),
            )),
            None => Err(TransportError::NoRemoteDescription),
        }
    }

    async fn set_remote_description(
        &mut self,
        kind: DescriptionKind,
        description: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (parsed, peer) = parse_description(description)?;
        if parsed != kind || peer == self.id {
            return Err(TransportError::InvalidDescription(format!(
                "unexpected {:?} description",
                parsed
            )));
        }
        self.remote = Some((kind, peer));
        self.network
            .with_endpoint(self.id, |e| e.remote = Some(peer))
            .ok_or(TransportError::Closed)
    }

    async fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Some((_, peer)) = self.remote else {
            return Err(TransportError::NoRemoteDescription);
        };
        if parse_candidate(candidate)? != peer {
            return Err(TransportError::InvalidCandidate("foreign candidate".into()));
        }
        self.network.apply_candidate(self.id, candidate);
        Ok(())
    }

    async fn send(&mut self, data: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.network.deliver(self.id, data)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.network.disconnect(self.id);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.network.disconnect(self.id);
        }
    }
}
