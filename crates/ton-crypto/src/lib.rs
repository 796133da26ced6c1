//! TON key material for the ADNL transport.
//!
//! - **ed25519**: identity keys, signatures, key ids and X25519 key agreement
//! - **aes**: AES-256-CTR keystream, key/IV derivation and symmetric key ids
//! - **encryption**: the checksum-keyed envelopes used on the wire
//!
//! # Example
//!
//! ```
//! use ton_crypto::{PrivateKey, encryption};
//!
//! let alice = PrivateKey::generate();
//! let bob = PrivateKey::generate();
//!
//! // First contact: encrypt to the peer's identity key.
//! let datagram = encryption::encrypt_for(&bob.public_key(), b"hello").unwrap();
//! assert_eq!(encryption::decrypt_with(&bob, &datagram).unwrap(), b"hello");
//!
//! // Both sides agree on the same secret for channel keys.
//! let secret = alice.shared_secret(&bob.public_key()).unwrap();
//! assert_eq!(secret, bob.shared_secret(&alice.public_key()).unwrap());
//! ```

pub mod aes;
pub mod ed25519;
pub mod encryption;
pub mod error;

use sha2::{Digest, Sha256};

pub use aes::aes_key_id;
pub use ed25519::{PrivateKey, PublicKey, SIGNATURE_LEN};
pub use error::CryptoError;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Fills `dest` with cryptographically secure random bytes.
pub fn fill_random(dest: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(dest);
}

/// Generates a random 32-byte array.
pub fn random_bytes_32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    fill_random(&mut bytes);
    bytes
}
