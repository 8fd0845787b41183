//! Connection-setup signals carried by the relay.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{now_millis, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        };
        f.write_str(s)
    }
}

/// A single piece of connection-setup metadata.
///
/// `payload` is an opaque session description or candidate blob produced by
/// the transport; the relay never interprets it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub payload: String,
    pub from: UserId,
    pub to: UserId,
    /// Unix milliseconds at creation.
    pub sent_at: i64,
}

impl SignalMessage {
    pub fn new(kind: SignalKind, payload: impl Into<String>, from: UserId, to: UserId) -> Self {
        Self {
            kind,
            payload: payload.into(),
            from,
            to,
            sent_at: now_millis(),
        }
    }
}

/// Relay-assigned identifier, ordered within one mailbox.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(String);

impl SignalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Zero-padded so lexical order matches numeric order.
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("{:020}", seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_json_shape() {
        let msg = SignalMessage {
            kind: SignalKind::IceCandidate,
            payload: "candidate:1".into(),
            from: "alice".into(),
            to: "bob".into(),
            sent_at: 42,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "ice-candidate");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["sentAt"], 42);

        let back: SignalMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_sequence_ids_sort_numerically() {
        let a = SignalId::from_sequence(9);
        let b = SignalId::from_sequence(10);
        assert!(a < b);
    }
}
