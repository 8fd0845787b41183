//! X25519 keypairs for sealing payloads to a recipient.
//!
//! Keys are encryption-only; nothing here signs. Both halves export to
//! base64 so callers can persist them and publish the public half to a
//! key directory. The private half is zeroized on drop.

use std::fmt;

use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::encoding;
use crate::error::CryptoError;
use crate::hash::fingerprint;

/// Length of both X25519 key halves in bytes.
pub const KEY_LEN: usize = 32;

/// A recipient's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Build a public key from raw bytes, rejecting anything but 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self(arr))
    }

    /// Parse a base64-exported public key.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = encoding::decode(text).map_err(|_| CryptoError::InvalidKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        encoding::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Log-safe identifier for this key.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

/// The private half of a keypair. Never printed.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        let secret = StaticSecret::from(arr);
        arr.zeroize();
        Ok(Self(secret))
    }

    /// Parse a base64-exported private key.
    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(encoding::decode(text).map_err(|_| CryptoError::InvalidKey)?);
        Self::from_bytes(&bytes)
    }

    /// Export for local persistence. The returned string is wiped on drop.
    pub fn to_base64(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.0.to_bytes());
        Zeroizing::new(encoding::encode(bytes.as_ref()))
    }

    /// Derive the matching public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(*X25519PublicKey::from(&self.0).as_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// An encryption keypair, generated once per identity.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Self {
        let private = PrivateKey(StaticSecret::random_from_rng(OsRng));
        Self::from_private(private)
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { public, private }
    }

    /// Restore a persisted keypair. Fails with `InvalidKey` if the halves do
    /// not belong together.
    pub fn from_base64(public_key: &str, private_key: &str) -> Result<Self, CryptoError> {
        let public = PublicKey::from_base64(public_key)?;
        let pair = Self::from_private(PrivateKey::from_base64(private_key)?);
        if pair.public != public {
            return Err(CryptoError::InvalidKey);
        }
        Ok(pair)
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn test_public_key_base64_round_trip() {
        let pair = KeyPair::generate();
        let text = pair.public().to_base64();
        assert_eq!(PublicKey::from_base64(&text).unwrap(), *pair.public());
    }

    #[test]
    fn test_keypair_restore_from_export() {
        let pair = KeyPair::generate();
        let public = pair.public().to_base64();
        let private = pair.private().to_base64();

        let restored = KeyPair::from_base64(&public, &private).unwrap();
        assert_eq!(restored.public(), pair.public());
    }

    #[test]
    fn test_keypair_restore_rejects_mismatched_halves() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let result = KeyPair::from_base64(&a.public().to_base64(), &b.private().to_base64());
        assert_eq!(result.unwrap_err(), CryptoError::InvalidKey);
    }

    #[test]
    fn test_wrong_length_is_invalid_key() {
        assert_eq!(PublicKey::from_bytes(&[0u8; 31]).unwrap_err(), CryptoError::InvalidKey);
        assert_eq!(PrivateKey::from_bytes(&[0u8; 33]).unwrap_err(), CryptoError::InvalidKey);
    }

    #[test]
    fn test_bad_base64_is_invalid_key() {
        assert_eq!(PublicKey::from_base64("%%%").unwrap_err(), CryptoError::InvalidKey);
    }

    #[test]
    fn test_debug_does_not_leak_private_key() {
        let pair = KeyPair::generate();
        let rendered = format!("{:?}", pair);
        assert!(!rendered.contains(pair.private().to_base64().as_str()));
        assert!(rendered.contains("PrivateKey(..)"));
    }
}
