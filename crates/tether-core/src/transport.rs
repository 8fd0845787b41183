//! Peer transport contract.
//!
//! Mirrors the shape of an ICE-capable peer connection: local/remote
//! session descriptions, trickled candidates and one reliable ordered data
//! channel. Implementations report asynchronous happenings on the event
//! receiver returned by the factory.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote description not set")]
    NoRemoteDescription,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    #[error("data channel not open")]
    ChannelNotOpen,
    #[error("transport closed")]
    Closed,
    #[error("transport failed: {0}")]
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate to trickle to the peer.
    LocalCandidate(String),
    ChannelOpen,
    ChannelClosed,
    Data(Bytes),
    /// Unrecoverable failure of the connection.
    Failed(String),
}

/// Settings handed to the factory for each new connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub ice_servers: Vec<String>,
    pub channel_label: String,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError>;

    /// Generate an offer and install it as the local description.
    async fn create_offer(&mut self) -> Result<String, TransportError>;

    /// Generate an answer to the applied remote offer and install it.
    async fn create_answer(&mut self) -> Result<String, TransportError>;

    async fn set_remote_description(
        &mut self,
        kind: DescriptionKind,
        description: &str,
    ) -> Result<(), TransportError>;

    /// Fails with `NoRemoteDescription` when called too early.
    async fn add_ice_candidate(&mut self, candidate: &str) -> Result<(), TransportError>;

    async fn send(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Idempotent.
    async fn close(&mut self);
}

pub struct TransportParts {
    pub transport: Box<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &TransportConfig) -> Result<TransportParts, TransportError>;
}
