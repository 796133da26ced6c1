//! Messages carried inside ADNL packets.

use crate::error::{AdnlError, Result};
use crate::tl::{
    ADNL_MESSAGE_ANSWER, ADNL_MESSAGE_CONFIRM_CHANNEL, ADNL_MESSAGE_CREATE_CHANNEL,
    ADNL_MESSAGE_CUSTOM, ADNL_MESSAGE_NOP, ADNL_MESSAGE_PART, ADNL_MESSAGE_QUERY,
    ADNL_MESSAGE_REINIT, TlReader, TlWriter, bytes_len,
};

/// ADNL message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdnlMessage {
    /// Announces the sender's channel key.
    CreateChannel {
        /// The sender's channel public key.
        key: [u8; 32],
        date: i32,
    },
    /// Acknowledges a `CreateChannel`.
    ConfirmChannel {
        /// The confirmer's channel public key.
        key: [u8; 32],
        /// The channel key being confirmed, i.e. the receiver's own.
        peer_key: [u8; 32],
        date: i32,
    },
    /// Opaque application payload, no answer expected.
    Custom { data: Vec<u8> },
    Nop,
    /// The sender restarted at `date`.
    Reinit { date: i32 },
    /// A query expecting an [`AdnlMessage::Answer`] with the same id.
    Query { query_id: [u8; 32], query: Vec<u8> },
    Answer { query_id: [u8; 32], answer: Vec<u8> },
    /// A fragment of a larger boxed message whose SHA-256 is `hash`.
    Part {
        hash: [u8; 32],
        total_size: i32,
        offset: i32,
        data: Vec<u8>,
    },
}

impl AdnlMessage {
    /// Returns the TL constructor id for this message type.
    pub fn constructor(&self) -> u32 {
        match self {
            Self::CreateChannel { .. } => ADNL_MESSAGE_CREATE_CHANNEL,
            Self::ConfirmChannel { .. } => ADNL_MESSAGE_CONFIRM_CHANNEL,
            Self::Custom { .. } => ADNL_MESSAGE_CUSTOM,
            Self::Nop => ADNL_MESSAGE_NOP,
            Self::Reinit { .. } => ADNL_MESSAGE_REINIT,
            Self::Query { .. } => ADNL_MESSAGE_QUERY,
            Self::Answer { .. } => ADNL_MESSAGE_ANSWER,
            Self::Part { .. } => ADNL_MESSAGE_PART,
        }
    }

    /// Size of the boxed encoding, used for MTU accounting.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Self::CreateChannel { .. } => 32 + 4,
            Self::ConfirmChannel { .. } => 32 + 32 + 4,
            Self::Custom { data } => bytes_len(data.len()),
            Self::Nop => 0,
            Self::Reinit { .. } => 4,
            Self::Query { query: data, .. } | Self::Answer { answer: data, .. } => {
                32 + bytes_len(data.len())
            }
            Self::Part { data, .. } => 32 + 4 + 4 + bytes_len(data.len()),
        }
    }

    /// Serializes the message as a boxed TL object.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TlWriter::with_capacity(self.encoded_len());
        self.write_tl(&mut writer);
        writer.finish()
    }

    /// Parses a boxed message, rejecting trailing bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = TlReader::new(data);
        let message = Self::read_tl(&mut reader)?;
        reader.expect_end()?;
        Ok(message)
    }

    pub(crate) fn write_tl(&self, writer: &mut TlWriter) {
        writer.write_u32(self.constructor());
        match self {
            Self::CreateChannel { key, date } => {
                writer.write_int256(key).write_i32(*date);
            }
            Self::ConfirmChannel { key, peer_key, date } => {
                writer.write_int256(key).write_int256(peer_key).write_i32(*date);
            }
            Self::Custom { data } => {
                writer.write_bytes(data);
            }
            Self::Nop => {}
            Self::Reinit { date } => {
                writer.write_i32(*date);
            }
            Self::Query { query_id, query } => {
                writer.write_int256(query_id).write_bytes(query);
            }
            Self::Answer { query_id, answer } => {
                writer.write_int256(query_id).write_bytes(answer);
            }
            Self::Part {
                hash,
                total_size,
                offset,
                data,
            } => {
                writer
                    .write_int256(hash)
                    .write_i32(*total_size)
                    .write_i32(*offset)
                    .write_bytes(data);
            }
        }
    }

    pub(crate) fn read_tl(reader: &mut TlReader<'_>) -> Result<Self> {
        let message = match reader.read_u32()? {
            ADNL_MESSAGE_CREATE_CHANNEL => Self::CreateChannel {
                key: reader.read_int256()?,
                date: reader.read_i32()?,
            },
            ADNL_MESSAGE_CONFIRM_CHANNEL => Self::ConfirmChannel {
                key: reader.read_int256()?,
                peer_key: reader.read_int256()?,
                date: reader.read_i32()?,
            },
            ADNL_MESSAGE_CUSTOM => Self::Custom {
                data: reader.read_bytes()?,
            },
            ADNL_MESSAGE_NOP => Self::Nop,
            ADNL_MESSAGE_REINIT => Self::Reinit {
                date: reader.read_i32()?,
            },
            ADNL_MESSAGE_QUERY => Self::Query {
                query_id: reader.read_int256()?,
                query: reader.read_bytes()?,
            },
            ADNL_MESSAGE_ANSWER => Self::Answer {
                query_id: reader.read_int256()?,
                answer: reader.read_bytes()?,
            },
            ADNL_MESSAGE_PART => Self::Part {
                hash: reader.read_int256()?,
                total_size: reader.read_i32()?,
                offset: reader.read_i32()?,
                data: reader.read_bytes()?,
            },
            other => return Err(AdnlError::UnexpectedConstructor(other)),
        };
        Ok(message)
    }
}
