use tether_crypto::{CryptoError, KeyPair, PrivateKey, PublicKey};

use crate::directory::PublicKeyRecord;
use crate::types::{now_millis, UserId};

/// The local user's identity and encryption keys. Generated once and reused
/// for every session and message.
pub struct LocalIdentity {
    user_id: UserId,
    keys: KeyPair,
}

impl LocalIdentity {
    /// Fresh identity keys.
    pub fn generate(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            keys: KeyPair::generate(),
        }
    }

    /// Restore from previously exported base64 key halves.
    pub fn from_exported(
        user_id: impl Into<UserId>,
        public_key: &str,
        private_key: &str,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            user_id: user_id.into(),
            keys: KeyPair::from_base64(public_key, private_key)?,
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keys.public()
    }

    pub fn private_key(&self) -> &PrivateKey {
        self.keys.private()
    }

    /// Directory record advertising this identity's public key.
    pub fn public_record(&self, display_name: &str, photo_url: Option<String>) -> PublicKeyRecord {
        let now = now_millis();
        PublicKeyRecord {
            user_id: self.user_id.clone(),
            public_key: self.keys.public().to_base64(),
            display_name: display_name.to_string(),
            photo_url,
            published_at: now,
            last_seen: now,
        }
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("user_id", &self.user_id)
            .field("public_key", self.keys.public())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_round_trip() {
        let identity = LocalIdentity::generate("alice");
        let public = identity.public_key().to_base64();
        let private = identity.private_key().to_base64();

        let restored = LocalIdentity::from_exported("alice", &public, &private).unwrap();
        assert_eq!(restored.public_key(), identity.public_key());
    }

    #[test]
    fn test_public_record_carries_key() {
        let identity = LocalIdentity::generate("alice");
        let record = identity.public_record("Alice", None);
        assert_eq!(record.user_id, UserId::from("alice"));
        assert_eq!(
            PublicKey::from_base64(&record.public_key).unwrap(),
            *identity.public_key()
        );
    }

    #[test]
    fn test_debug_hides_private_key() {
        let identity = LocalIdentity::generate("alice");
        let private = identity.private_key().to_base64();
        let debug = format!("{:?}", identity);
        assert!(!debug.contains(private.as_str()));
    }
}
