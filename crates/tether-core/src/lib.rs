//! Tether Core - connection signaling and encrypted message exchange.
//!
//! This crate implements:
//! - The per-peer connection state machine (offer/answer/candidate exchange)
//! - The signal relay contract with in-memory and HTTP adapters
//! - Key directory and durable message store contracts
//! - The transport contract for ICE-style peer connections, with a
//!   WebRTC implementation behind the `webrtc` feature
//! - Message exchange over live channels and store-and-forward
//! - Configuration, error types and a test harness

#![forbid(unsafe_code)]

// State machines
pub mod coordinator;
pub mod session;

// Services
pub mod exchange;

// Collaborator contracts and adapters
pub mod directory;
pub mod relay;
pub mod store;
pub mod transport;
pub mod loopback;

// Supporting modules
pub mod config;
pub mod envelope;
pub mod errors;
pub mod keys;
pub mod signal;
pub mod types;
pub mod harness;

// Optional relay implementations
#[cfg(feature = "http-relay")]
pub mod http_relay;

// Optional transport implementations
#[cfg(feature = "webrtc")]
pub mod rtc_transport;

#[cfg(test)]
mod proptests;

pub use coordinator::{ConnectionCoordinator, InboundFrames};
pub use errors::CoreError;
pub use exchange::MessageExchange;
pub use session::{ConnectionState, InboundFrame, Role, SessionEvent, SessionHandle};
pub use types::{MessageId, UserId};
