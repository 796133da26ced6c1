//! The two ADNL encryption envelopes.
//!
//! Sealed payloads are self-authenticating: the SHA-256 of the plaintext is sent
//! in the clear and also keys the cipher, so any modification of the ciphertext
//! fails the checksum on open.
//!
//! ```text
//! seal(secret, m)          = sha256(m) || AES-CTR(m)
//! encrypt_for(pub, m)      = ephemeral_pub || seal(ecdh(ephemeral, pub), m)
//! ```

use crate::aes::{apply_keystream, derive_aes_params};
use crate::ed25519::{PrivateKey, PublicKey};
use crate::error::CryptoError;
use crate::sha256;

/// Size of the checksum prefix of a sealed payload.
pub const CHECKSUM_LEN: usize = 32;

/// Size of the header added by [`encrypt_for`].
pub const ED25519_ENVELOPE_LEN: usize = 32 + CHECKSUM_LEN;

/// Encrypts `data` under a symmetric secret.
pub fn seal(secret: &[u8; 32], data: &[u8]) -> Vec<u8> {
    let checksum = sha256(data);
    let (key, iv) = derive_aes_params(secret, &checksum);

    let mut out = Vec::with_capacity(CHECKSUM_LEN + data.len());
    out.extend_from_slice(&checksum);
    out.extend_from_slice(data);
    apply_keystream(&key, &iv, &mut out[CHECKSUM_LEN..]);
    out
}

/// Decrypts a payload produced by [`seal`] and checks its integrity.
pub fn open(secret: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < CHECKSUM_LEN {
        return Err(CryptoError::Truncated {
            len: data.len(),
            min: CHECKSUM_LEN,
        });
    }

    let (checksum, ciphertext) = data.split_at(CHECKSUM_LEN);
    let checksum: [u8; 32] = checksum
        .try_into()
        .map_err(|_| CryptoError::ChecksumMismatch)?;
    let (key, iv) = derive_aes_params(secret, &checksum);

    let mut plain = ciphertext.to_vec();
    apply_keystream(&key, &iv, &mut plain);

    if sha256(&plain) != checksum {
        return Err(CryptoError::ChecksumMismatch);
    }
    Ok(plain)
}

/// Encrypts `data` so that only the owner of `recipient` can read it.
///
/// A one-time key pair is generated for every call.
pub fn encrypt_for(recipient: &PublicKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = PrivateKey::generate();
    let secret = ephemeral.shared_secret(recipient)?;

    let mut out = Vec::with_capacity(ED25519_ENVELOPE_LEN + data.len());
    out.extend_from_slice(ephemeral.public_key().as_bytes());
    out.extend_from_slice(&seal(&secret, data));
    Ok(out)
}

/// Decrypts a payload produced by [`encrypt_for`] with the recipient's key.
pub fn decrypt_with(key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < ED25519_ENVELOPE_LEN {
        return Err(CryptoError::Truncated {
            len: data.len(),
            min: ED25519_ENVELOPE_LEN,
        });
    }

    let (ephemeral, sealed) = data.split_at(32);
    let ephemeral: [u8; 32] = ephemeral
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("ephemeral key".into()))?;
    let secret = key.shared_secret(&PublicKey::from_bytes(ephemeral))?;
    open(&secret, sealed)
}
