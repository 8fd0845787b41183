//! Tether Crypto - end-to-end payload encryption for Tether peers.
//!
//! This crate implements:
//! - X25519 keypairs with base64 export/import
//! - Sealed-box encryption (ephemeral X25519 + HKDF-SHA256 + ChaCha20Poly1305)
//! - Text helpers operating on base64 blobs for wire and storage boundaries

#![forbid(unsafe_code)]

pub mod encoding;
pub mod encryptor;
pub mod error;
pub mod hash;
pub mod keys;
pub mod sealed;

pub use encryptor::{
    decrypt, decrypt_text, decrypt_text_with, encrypt, encrypt_text, encrypt_text_for,
    generate_keypair,
};
pub use error::CryptoError;
pub use keys::{KeyPair, PrivateKey, PublicKey};

#[cfg(test)]
mod proptests;
