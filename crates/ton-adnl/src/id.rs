//! ADNL identities.
//!
//! Peers are addressed by [`AdnlIdShort`], the SHA-256 of the TL-serialized
//! public key: `SHA256(0x4813b4c6 || public_key)`. [`AdnlIdFull`] carries the
//! public key itself, which is needed to verify signatures and to encrypt
//! first-contact packets.

use std::fmt;

use ton_crypto::PublicKey;

use crate::error::{AdnlError, Result};
use crate::tl::{PUB_ED25519, TlReader, TlWriter};

/// A 256-bit ADNL identity hash.
///
/// Ordered lexicographically, which matters for channel key derivation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AdnlIdShort([u8; 32]);

impl AdnlIdShort {
    /// Wraps an already computed identity hash.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Computes the identity hash of an Ed25519 public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(public_key.short_id())
    }

    /// Parses the first 32 bytes of a datagram.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        bytes
            .try_into()
            .map(Self)
            .map_err(|_| AdnlError::InvalidPacket(format!("id of {} bytes", bytes.len())))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }
}

impl From<[u8; 32]> for AdnlIdShort {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for AdnlIdShort {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for AdnlIdShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for AdnlIdShort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 bytes are enough to tell peers apart in logs
        write!(f, "AdnlIdShort({})", hex::encode(&self.0[..8]))
    }
}

/// A full ADNL identity: the public key plus its cached short id.
#[derive(Clone, Copy)]
pub struct AdnlIdFull {
    public_key: PublicKey,
    short_id: AdnlIdShort,
}

impl AdnlIdFull {
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            short_id: AdnlIdShort::from_public_key(&public_key),
            public_key,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn short_id(&self) -> AdnlIdShort {
        self.short_id
    }

    /// Writes the identity as a boxed `pub.ed25519`.
    pub(crate) fn write_tl(&self, writer: &mut TlWriter) {
        writer
            .write_u32(PUB_ED25519)
            .write_int256(self.public_key.as_bytes());
    }

    pub(crate) fn read_tl(reader: &mut TlReader<'_>) -> Result<Self> {
        reader.expect_constructor(PUB_ED25519)?;
        Ok(Self::new(PublicKey::from_bytes(reader.read_int256()?)))
    }
}

impl From<PublicKey> for AdnlIdFull {
    fn from(public_key: PublicKey) -> Self {
        Self::new(public_key)
    }
}

impl PartialEq for AdnlIdFull {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for AdnlIdFull {}

impl fmt::Debug for AdnlIdFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AdnlIdFull").field(&self.short_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ton_crypto::PrivateKey;

    #[test]
    fn test_short_id_from_public_key() {
        let key = PrivateKey::generate().public_key();
        let full = AdnlIdFull::new(key);

        assert_eq!(full.short_id(), AdnlIdShort::new(key.short_id()));
        assert_eq!(full.short_id(), AdnlIdShort::from_public_key(&key));
    }

    #[test]
    fn test_full_id_equality_by_key() {
        let key = PrivateKey::generate().public_key();
        assert_eq!(AdnlIdFull::new(key), AdnlIdFull::from(key));
        assert_ne!(
            AdnlIdFull::new(key),
            AdnlIdFull::new(PrivateKey::generate().public_key())
        );
    }

    #[test]
    fn test_short_id_ordering_is_lexicographic() {
        let mut low = [0xFFu8; 32];
        low[0] = 0x01;
        let mut high = [0u8; 32];
        high[0] = 0x02;

        assert!(AdnlIdShort::new(low) < AdnlIdShort::new(high));
    }

    #[test]
    fn test_from_slice_length() {
        assert!(AdnlIdShort::from_slice(&[0u8; 32]).is_ok());
        assert!(AdnlIdShort::from_slice(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_display_is_full_hex() {
        let id = AdnlIdShort::new([0xAB; 32]);
        assert_eq!(id.to_string(), "ab".repeat(32));
    }

    #[test]
    fn test_full_id_tl() {
        let full = AdnlIdFull::new(PrivateKey::generate().public_key());
        let mut writer = TlWriter::default();
        full.write_tl(&mut writer);
        let bytes = writer.finish();

        assert_eq!(&bytes[..4], &[0xC6, 0xB4, 0x13, 0x48]);
        let decoded = AdnlIdFull::read_tl(&mut TlReader::new(&bytes)).unwrap();
        assert_eq!(decoded, full);
    }
}
