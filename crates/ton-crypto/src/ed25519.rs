//! Ed25519 identity keys.
//!
//! An ADNL identity is an Ed25519 key. The same key signs plaintext packets and,
//! after conversion to its Montgomery form, takes part in X25519 key agreement.

use std::fmt;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::sha256_multi;

/// TL prefix of `pub.ed25519 key:int256 = PublicKey` (0x4813b4c6, little-endian).
pub const PUB_ED25519_PREFIX: [u8; 4] = [0xC6, 0xB4, 0x13, 0x48];

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// An Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wraps raw public key bytes. Validity is checked lazily on use.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Computes the key id: `SHA256(pub.ed25519 prefix || key)`.
    ///
    /// This is the 256-bit ADNL address of the key's owner.
    pub fn short_id(&self) -> [u8; 32] {
        sha256_multi(&[&PUB_ED25519_PREFIX, &self.0])
    }

    /// Verifies a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        key.verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Maps the Edwards point onto the Montgomery curve for X25519.
    fn to_montgomery(self) -> Result<[u8; 32], CryptoError> {
        let point = CompressedEdwardsY(self.0)
            .decompress()
            .ok_or_else(|| CryptoError::InvalidKey("not a curve point".into()))?;
        Ok(point.to_montgomery().to_bytes())
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// An Ed25519 private key (the 32-byte seed) with its cached public half.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    seed: [u8; 32],
    #[zeroize(skip)]
    signing_key: SigningKey,
    #[zeroize(skip)]
    public_key: PublicKey,
}

impl PrivateKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores a key from its 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey(signing_key.verifying_key().to_bytes());
        Self {
            seed: signing_key.to_bytes(),
            signing_key,
            public_key,
        }
    }

    /// Returns the seed bytes.
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Signs `message`, returning the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Computes the X25519 shared secret with another Ed25519 key.
    ///
    /// Both sides obtain the same 32 bytes:
    /// `a.shared_secret(B) == b.shared_secret(A)`.
    pub fn shared_secret(&self, other: &PublicKey) -> Result<[u8; 32], CryptoError> {
        let their_public = other.to_montgomery()?;
        let shared = x25519_dalek::x25519(self.x25519_scalar(), their_public);
        if shared.iter().all(|&b| b == 0) {
            return Err(CryptoError::WeakKey);
        }
        Ok(shared)
    }

    /// Clamped X25519 scalar derived from the seed (RFC 8032 expansion).
    fn x25519_scalar(&self) -> [u8; 32] {
        let hash = Sha512::digest(self.seed);
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;
        scalar
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sha256;

    #[test]
    fn test_seed_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_seed(*key.seed());
        assert_eq!(key.public_key(), restored.public_key());
    }

    #[test]
    fn test_short_id_is_hash_of_tl_key() {
        let key = PrivateKey::generate().public_key();

        let mut tl = PUB_ED25519_PREFIX.to_vec();
        tl.extend_from_slice(key.as_bytes());
        assert_eq!(key.short_id(), sha256(&tl));
    }

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate();
        let signature = key.sign(b"adnl");

        assert!(key.public_key().verify(b"adnl", &signature).is_ok());
        assert_eq!(
            key.public_key().verify(b"adnl!", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_rejects_short_signature() {
        let key = PrivateKey::generate();
        assert_eq!(
            key.public_key().verify(b"adnl", &[0u8; 10]),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();

        let ab = alice.shared_secret(&bob.public_key()).unwrap();
        let ba = bob.shared_secret(&alice.public_key()).unwrap();
        assert_eq!(ab, ba);

        let carol = PrivateKey::generate();
        assert_ne!(ab, alice.shared_secret(&carol.public_key()).unwrap());
    }

    #[test]
    fn test_debug_hides_seed() {
        let key = PrivateKey::from_seed([7u8; 32]);
        let debug = format!("{key:?}");
        assert!(!debug.contains(&hex::encode([7u8; 32])));
    }
}
