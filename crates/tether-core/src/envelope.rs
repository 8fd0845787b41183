//! Encrypted payloads and the live-channel frame.

use serde::{Deserialize, Serialize};
use tether_crypto::{decrypt_text_with, encrypt_text_for, CryptoError, PrivateKey, PublicKey};

use crate::errors::CoreError;
use crate::types::{MessageId, UserId};

/// Shown in place of a message body that could not be decrypted.
pub const UNREADABLE_PLACEHOLDER: &str = "[Encrypted message]";

/// A message body as it travels or rests outside the sender's process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Base64 sealed box, or the raw text when `encrypted` is false.
    pub ciphertext: String,
    pub encrypted: bool,
}

impl EncryptedEnvelope {
    pub fn seal(plaintext: &str, recipient: &PublicKey) -> Result<Self, CryptoError> {
        Ok(Self {
            ciphertext: encrypt_text_for(plaintext, recipient)?,
            encrypted: true,
        })
    }

    /// Unencrypted body as written by legacy clients. Never produced by
    /// this crate's send path.
    pub fn legacy_plaintext(text: impl Into<String>) -> Self {
        Self {
            ciphertext: text.into(),
            encrypted: false,
        }
    }

    pub fn open(&self, private: &PrivateKey) -> Result<String, CryptoError> {
        if !self.encrypted {
            return Ok(self.ciphertext.clone());
        }
        decrypt_text_with(&self.ciphertext, private)
    }
}

/// Body of a received or stored message as the local user sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    /// Decryption failed; the message is kept rather than dropped.
    Unreadable,
    /// Sent by the local user and sealed for the peer.
    Sealed,
}

impl MessageContent {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn display(&self) -> &str {
        match self {
            MessageContent::Text(t) => t,
            MessageContent::Unreadable | MessageContent::Sealed => UNREADABLE_PLACEHOLDER,
        }
    }
}

/// Frame sent over an open data channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub sent_at: i64,
    pub envelope: EncryptedEnvelope,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_crypto::KeyPair;

    #[test]
    fn test_seal_and_open() {
        let pair = KeyPair::generate();
        let env = EncryptedEnvelope::seal("hi there", pair.public()).unwrap();
        assert!(env.encrypted);
        assert_ne!(env.ciphertext, "hi there");
        assert_eq!(env.open(pair.private()).unwrap(), "hi there");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let pair = KeyPair::generate();
        let other = KeyPair::generate();
        let env = EncryptedEnvelope::seal("secret", pair.public()).unwrap();
        assert_eq!(env.open(other.private()).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_legacy_plaintext_passes_through() {
        let pair = KeyPair::generate();
        let env = EncryptedEnvelope::legacy_plaintext("old");
        assert_eq!(env.open(pair.private()).unwrap(), "old");
    }

    #[test]
    fn test_wire_message_json() {
        let pair = KeyPair::generate();
        let wire = WireMessage {
            id: MessageId::from("m1"),
            sender: UserId::from("alice"),
            sent_at: 7,
            envelope: EncryptedEnvelope::seal("x", pair.public()).unwrap(),
        };
        let bytes = wire.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["sentAt"], 7);
        assert_eq!(value["envelope"]["encrypted"], true);
        assert_eq!(WireMessage::decode(&bytes).unwrap(), wire);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            WireMessage::decode(b"not json"),
            Err(CoreError::Encoding(_))
        ));
    }

    #[test]
    fn test_placeholder_display() {
        assert_eq!(MessageContent::Unreadable.display(), UNREADABLE_PLACEHOLDER);
        assert_eq!(MessageContent::Text("a".into()).display(), "a");
    }
}
