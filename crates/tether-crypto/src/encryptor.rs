//! Stateless encrypt/decrypt entry points.
//!
//! The byte-level functions take parsed keys. The `_text` variants take and
//! return base64 blobs, which is the form keys and ciphertexts have once
//! they leave the process.

use crate::encoding;
use crate::error::CryptoError;
use crate::keys::{KeyPair, PrivateKey, PublicKey};
use crate::sealed;

/// Generate a fresh encryption keypair. Callers persist it and reuse it for
/// the lifetime of the identity.
pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>, CryptoError> {
    sealed::seal(plaintext, recipient)
}

pub fn decrypt(ciphertext: &[u8], own_private_key: &PrivateKey) -> Result<Vec<u8>, CryptoError> {
    sealed::open(ciphertext, own_private_key)
}

/// Encrypt a UTF-8 message for a base64-encoded recipient public key.
///
/// Fails with `InvalidKey` before touching the plaintext if the key does not parse.
pub fn encrypt_text(plaintext: &str, recipient_public_key: &str) -> Result<String, CryptoError> {
    let recipient = PublicKey::from_base64(recipient_public_key)?;
    encrypt_text_for(plaintext, &recipient)
}

/// [`encrypt_text`] with an already parsed recipient key.
pub fn encrypt_text_for(plaintext: &str, recipient: &PublicKey) -> Result<String, CryptoError> {
    let ct = encrypt(plaintext.as_bytes(), recipient)?;
    Ok(encoding::encode(&ct))
}

/// Decrypt a base64 ciphertext produced by [`encrypt_text`].
pub fn decrypt_text(ciphertext: &str, own_private_key: &str) -> Result<String, CryptoError> {
    let private = PrivateKey::from_base64(own_private_key)?;
    decrypt_text_with(ciphertext, &private)
}

/// [`decrypt_text`] with an already parsed private key.
pub fn decrypt_text_with(ciphertext: &str, own_private_key: &PrivateKey) -> Result<String, CryptoError> {
    let ct = encoding::decode(ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;
    let pt = decrypt(&ct, own_private_key)?;
    String::from_utf8(pt).map_err(|_| CryptoError::DecryptionFailed)
}
