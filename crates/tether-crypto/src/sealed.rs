//! Sealed-box encryption to a recipient public key.
//! Implements HPKE-style sealing using X25519 + HKDF + ChaCha20Poly1305.
//!
//! Layout: `version(1) || ephemeral_pub(32) || salt(16) || aead_ciphertext`.
//! A fresh ephemeral key and salt are drawn per message.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keys::{PrivateKey, PublicKey, KEY_LEN};

const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + KEY_LEN + SALT_LEN;

/// Smallest possible sealed box (empty plaintext).
pub const MIN_SEALED_LEN: usize = HEADER_LEN + TAG_LEN;

fn kdf_key_nonce(
    shared_secret: &[u8; 32],
    salt: &[u8],
) -> Result<(Zeroizing<[u8; 32]>, [u8; 12]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(b"tether_seal_v1_key", key.as_mut())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut nonce = [0u8; 12];
    hk.expand(b"tether_seal_v1_nonce", &mut nonce)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok((key, nonce))
}

/// AAD binds the version byte and both public keys to the ciphertext.
fn seal_aad(ephemeral_pub: &[u8], recipient_pub: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 1 + 2 * KEY_LEN);
    aad.extend_from_slice(b"tether_seal_v1");
    aad.push(VERSION);
    aad.extend_from_slice(ephemeral_pub);
    aad.extend_from_slice(recipient_pub);
    aad
}

/// Seal `plaintext` so that only the holder of `recipient`'s private key can open it.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|_| CryptoError::EncryptionFailed)?;

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&eph);

    let shared = eph.diffie_hellman(&recipient.to_x25519());
    if !shared.was_contributory() {
        // Low-order recipient point: every sender would derive the same key.
        return Err(CryptoError::InvalidKey);
    }
    let shared_bytes = Zeroizing::new(shared.to_bytes());

    let (key32, nonce12) = kdf_key_nonce(&shared_bytes, &salt)?;
    let aad = seal_aad(eph_pub.as_bytes(), recipient.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key32.as_ref()));
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce12),
            Payload { msg: plaintext, aad: &aad },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ct.len());
    out.push(VERSION);
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a sealed box with the recipient's private key.
pub fn open(sealed: &[u8], recipient: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < MIN_SEALED_LEN || sealed[0] != VERSION {
        return Err(CryptoError::DecryptionFailed);
    }

    let eph_bytes: [u8; KEY_LEN] = sealed[1..1 + KEY_LEN]
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed)?;
    let salt = &sealed[1 + KEY_LEN..HEADER_LEN];
    let ct = &sealed[HEADER_LEN..];

    let shared = recipient
        .secret()
        .diffie_hellman(&X25519PublicKey::from(eph_bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed);
    }
    let shared_bytes = Zeroizing::new(shared.to_bytes());

    let (key32, nonce12) =
        kdf_key_nonce(&shared_bytes, salt).map_err(|_| CryptoError::DecryptionFailed)?;
    let recipient_pub = recipient.public_key();
    let aad = seal_aad(&eph_bytes, recipient_pub.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key32.as_ref()));
    cipher
        .decrypt(Nonce::from_slice(&nonce12), Payload { msg: ct, aad: &aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn test_seal_open_round_trip() {
        let recipient = KeyPair::generate();
        let sealed = seal(b"Hello, secure world!", recipient.public()).unwrap();
        let opened = open(&sealed, recipient.private()).unwrap();
        assert_eq!(opened, b"Hello, secure world!");
    }

    #[test]
    fn test_sealed_layout() {
        let recipient = KeyPair::generate();
        let sealed = seal(b"abc", recipient.public()).unwrap();
        assert_eq!(sealed[0], VERSION);
        assert_eq!(sealed.len(), MIN_SEALED_LEN + 3);
    }

    #[test]
    fn test_same_plaintext_seals_differently() {
        let recipient = KeyPair::generate();
        let a = seal(b"same", recipient.public()).unwrap();
        let b = seal(b"same", recipient.public()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let recipient = KeyPair::generate();
        let mut sealed = seal(b"payload", recipient.public()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(open(&sealed, recipient.private()).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_tampered_ephemeral_key_fails() {
        let recipient = KeyPair::generate();
        let mut sealed = seal(b"payload", recipient.public()).unwrap();
        sealed[5] ^= 0x80;
        assert!(open(&sealed, recipient.private()).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let recipient = KeyPair::generate();
        assert_eq!(open(&[VERSION; 10], recipient.private()).unwrap_err(), CryptoError::DecryptionFailed);
        assert_eq!(open(&[], recipient.private()).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_unknown_version_fails() {
        let recipient = KeyPair::generate();
        let mut sealed = seal(b"payload", recipient.public()).unwrap();
        sealed[0] = 9;
        assert_eq!(open(&sealed, recipient.private()).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn test_low_order_recipient_rejected() {
        let zero = PublicKey::from_bytes(&[0u8; 32]).unwrap();
        assert_eq!(seal(b"x", &zero).unwrap_err(), CryptoError::InvalidKey);
    }
}
