//! TL (Type Language) encoding/decoding utilities for ADNL.
//!
//! Only the primitives the packet format needs: little-endian integers,
//! `int256`, and the padded `bytes` encoding. Constructor ids are written as
//! little-endian `u32`.

use crate::error::{AdnlError, Result};

// ============================================================================
// TL Schema IDs
// ============================================================================

/// adnl.packetContents rand1:bytes flags:# ... rand2:bytes = adnl.PacketContents
pub const ADNL_PACKET_CONTENTS: u32 = 0xd142cd89;

/// pub.ed25519 key:int256 = PublicKey
pub const PUB_ED25519: u32 = 0x4813b4c6;

/// adnl.address.udp ip:int port:int = adnl.Address
pub const ADNL_ADDRESS_UDP: u32 = 0x670da6e7;

/// adnl.address.udp6 ip:int128 port:int = adnl.Address
pub const ADNL_ADDRESS_UDP6: u32 = 0xe31d63fa;

/// adnl.message.createChannel key:int256 date:int = adnl.Message
pub const ADNL_MESSAGE_CREATE_CHANNEL: u32 = 0xe673c3bb;

/// adnl.message.confirmChannel key:int256 peer_key:int256 date:int = adnl.Message
pub const ADNL_MESSAGE_CONFIRM_CHANNEL: u32 = 0x60dd1d69;

/// adnl.message.custom data:bytes = adnl.Message
pub const ADNL_MESSAGE_CUSTOM: u32 = 0x204818f5;

/// adnl.message.nop = adnl.Message
pub const ADNL_MESSAGE_NOP: u32 = 0x17f8dfda;

/// adnl.message.reinit date:int = adnl.Message
pub const ADNL_MESSAGE_REINIT: u32 = 0x10c20520;

/// adnl.message.query query_id:int256 query:bytes = adnl.Message
pub const ADNL_MESSAGE_QUERY: u32 = 0xb48bf97a;

/// adnl.message.answer query_id:int256 answer:bytes = adnl.Message
pub const ADNL_MESSAGE_ANSWER: u32 = 0x0fac8416;

/// adnl.message.part hash:int256 total_size:int offset:int data:bytes = adnl.Message
pub const ADNL_MESSAGE_PART: u32 = 0xfd452d39;

/// Upper bound for vector lengths read from the network.
const MAX_VECTOR_LEN: usize = 1024;

/// Returns the encoded size of a TL `bytes` value holding `len` bytes.
pub const fn bytes_len(len: usize) -> usize {
    let header = if len < 254 { 1 } else { 4 };
    (header + len).div_ceil(4) * 4
}

// ============================================================================
// TL Writer
// ============================================================================

/// A helper for building TL messages.
#[derive(Default)]
pub struct TlWriter {
    buffer: Vec<u8>,
}

impl TlWriter {
    /// Creates a new TL writer with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Writes a u32 value in little-endian.
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes an i32 value in little-endian.
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes a u64 value in little-endian.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes a 256-bit integer (32 bytes).
    pub fn write_int256(&mut self, value: &[u8; 32]) -> &mut Self {
        self.buffer.extend_from_slice(value);
        self
    }

    /// Writes a 128-bit integer (16 bytes).
    pub fn write_int128(&mut self, value: &[u8; 16]) -> &mut Self {
        self.buffer.extend_from_slice(value);
        self
    }

    /// Writes bytes with TL encoding.
    ///
    /// - If length < 254: 1 byte length prefix, then data, then padding to 4-byte boundary
    /// - Otherwise: 0xFE marker, 3 bytes length (LE), then data, then padding
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        let len = data.len();
        let header = if len < 254 {
            self.buffer.push(len as u8);
            1
        } else {
            self.buffer.push(0xFE);
            self.buffer.extend_from_slice(&(len as u32).to_le_bytes()[..3]);
            4
        };
        self.buffer.extend_from_slice(data);

        let padding = bytes_len(len) - header - len;
        self.buffer.extend(std::iter::repeat_n(0, padding));
        self
    }

    /// Consumes the writer and returns the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

// ============================================================================
// TL Reader
// ============================================================================

/// A helper for reading TL messages.
pub struct TlReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TlReader<'a> {
    /// Creates a new TL reader.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the number of bytes remaining.
    pub fn remaining_len(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns true if there's no more data to read.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Fails unless every byte has been consumed.
    pub fn expect_end(&self) -> Result<()> {
        match self.remaining_len() {
            0 => Ok(()),
            n => Err(AdnlError::TlError(format!("{n} trailing bytes"))),
        }
    }

    /// Reads raw bytes without decoding.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining_len() < len {
            return Err(AdnlError::TlError(format!(
                "need {} bytes, have {}",
                len,
                self.remaining_len()
            )));
        }
        let result = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(result)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut result = [0u8; N];
        result.copy_from_slice(self.read_raw(N)?);
        Ok(result)
    }

    /// Reads a u32 value.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads an i32 value.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    /// Reads a u64 value.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a 256-bit integer (32 bytes).
    pub fn read_int256(&mut self) -> Result<[u8; 32]> {
        self.read_array()
    }

    /// Reads a 128-bit integer (16 bytes).
    pub fn read_int128(&mut self) -> Result<[u8; 16]> {
        self.read_array()
    }

    /// Reads a constructor id and checks it against `expected`.
    pub fn expect_constructor(&mut self, expected: u32) -> Result<()> {
        match self.read_u32()? {
            id if id == expected => Ok(()),
            id => Err(AdnlError::UnexpectedConstructor(id)),
        }
    }

    /// Reads a vector length prefix, bounded to keep allocations sane.
    pub fn read_vector_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;
        if len > MAX_VECTOR_LEN {
            return Err(AdnlError::TlError(format!("vector of {len} elements")));
        }
        Ok(len)
    }

    /// Reads TL-encoded bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let first_byte = *self
            .data
            .get(self.offset)
            .ok_or_else(|| AdnlError::TlError("need at least 1 byte".into()))?;

        let (header, len) = match first_byte {
            0..=253 => (1, first_byte as usize),
            0xFE => {
                let prefix: [u8; 4] = self
                    .data
                    .get(self.offset..self.offset + 4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| {
                        AdnlError::TlError("need at least 4 bytes for long encoding".into())
                    })?;
                (4, (u32::from_le_bytes(prefix) >> 8) as usize)
            }
            _ => return Err(AdnlError::TlError("invalid bytes prefix 0xff".into())),
        };

        let consumed = bytes_len(len);
        if self.remaining_len() < consumed {
            return Err(AdnlError::TlError(format!(
                "need {} bytes, have {}",
                consumed,
                self.remaining_len()
            )));
        }

        let start = self.offset + header;
        let result = self.data[start..start + len].to_vec();
        self.offset += consumed;
        Ok(result)
    }
}
