//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid hex encoding of a key
    #[error("invalid key encoding: {0}")]
    InvalidEncoding(String),

    /// The peer's public key yields a low-order shared secret
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Envelope references an agreement this node does not share with the sender
    #[error("unknown agreement id")]
    UnknownAgreement,
}
