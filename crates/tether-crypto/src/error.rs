/// Errors produced by key handling and sealed-box operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Key bytes are malformed: bad base64, wrong length, or a low-order point.
    #[error("invalid key")]
    InvalidKey,
    /// Ciphertext was not sealed for this key pair, or has been corrupted.
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}
