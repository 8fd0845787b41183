use thiserror::Error;

use tether_crypto::CryptoError;

use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::relay::RelayError;
use crate::store::StoreError;
use crate::transport::TransportError;
use crate::types::UserId;

/// Errors surfaced by the coordinator and the message exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid key")]
    InvalidKey,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("unknown recipient: {0}")]
    UnknownRecipient(UserId),
    #[error("signal relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("already connecting to {0}")]
    AlreadyConnecting(UserId),
    #[error("already connected to {0}")]
    AlreadyConnected(UserId),
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("channel not open")]
    ChannelNotOpen,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKey => CoreError::InvalidKey,
            CryptoError::DecryptionFailed => CoreError::DecryptionFailed,
            CryptoError::EncryptionFailed => CoreError::Encoding("encryption failed".into()),
        }
    }
}

impl From<RelayError> for CoreError {
    fn from(e: RelayError) -> Self {
        CoreError::RelayUnavailable(e.to_string())
    }
}

impl From<TransportError> for CoreError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ChannelNotOpen => CoreError::ChannelNotOpen,
            other => CoreError::TransportFailure(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Encoding(e.to_string())
    }
}
