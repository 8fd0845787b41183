//! Signal relay server.
//!
//! Holds offers, answers and ICE candidates in per-pair mailboxes until the
//! recipient polls and deletes them.

pub mod api;
pub mod config;
pub mod mailbox;
pub mod metrics;
pub mod server;

#[cfg(test)]
mod mailbox_props;

pub use server::RelayServer;
