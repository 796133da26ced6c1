//! Error types for ADNL operations.

use std::io;

use thiserror::Error;
use ton_crypto::CryptoError;

/// Errors that can occur during ADNL operations.
///
/// Only a few of these ever reach application code: [`AdnlError::MessageTooLarge`],
/// [`AdnlError::QueryTimeout`], [`AdnlError::ChannelClosed`] and socket errors.
/// Everything else describes a datagram that the receive path drops.
#[derive(Debug, Error)]
pub enum AdnlError {
    /// I/O error from the UDP socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid packet format received.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// TL serialization/deserialization error.
    #[error("TL error: {0}")]
    TlError(String),

    /// Unknown constructor id where a boxed type was expected.
    #[error("Unexpected constructor: 0x{0:08x}")]
    UnexpectedConstructor(u32),

    /// Encryption, decryption or signature failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Message does not fit into a single packet.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Query timed out waiting for an answer.
    #[error("Query timeout")]
    QueryTimeout,

    /// The peer pair was shut down while the operation was in flight.
    #[error("Channel closed")]
    ChannelClosed,

    /// An id is already registered in the dispatcher table.
    #[error("Id already registered: {0}")]
    IdCollision(String),

    /// Address cannot be represented on the wire.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type alias for ADNL operations.
pub type Result<T> = std::result::Result<T, AdnlError>;
