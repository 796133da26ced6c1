//! Error types for key handling and encryption.

use thiserror::Error;

/// Errors that can occur while using TON key material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The provided key bytes do not describe a valid key.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The signature bytes are malformed or do not match.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Key agreement produced the all-zero shared secret.
    #[error("Weak key detected (low-order point)")]
    WeakKey,

    /// The ciphertext is shorter than its fixed-size header.
    #[error("Ciphertext too short: {len} bytes (min: {min})")]
    Truncated { len: usize, min: usize },

    /// The decrypted payload does not hash to the transmitted checksum.
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}
