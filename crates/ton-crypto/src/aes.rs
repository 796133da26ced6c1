//! AES-256-CTR as used by ADNL envelopes.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::sha256_multi;

/// TL prefix of `pub.aes key:int256 = PublicKey` (0xd76d282a, little-endian).
pub const PUB_AES_PREFIX: [u8; 4] = [0x2A, 0x28, 0x6D, 0xD7];

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Computes the key id of a symmetric key: `SHA256(pub.aes prefix || key)`.
///
/// ADNL uses it as the routing id of an encrypted channel.
pub fn aes_key_id(key: &[u8; 32]) -> [u8; 32] {
    sha256_multi(&[&PUB_AES_PREFIX, key])
}

/// Derives the per-message AES key and IV from a secret and the payload checksum.
///
/// `key = secret[0..16] || checksum[16..32]`, `iv = checksum[0..4] || secret[20..32]`.
pub fn derive_aes_params(secret: &[u8; 32], checksum: &[u8; 32]) -> ([u8; 32], [u8; 16]) {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(&secret[..16]);
    key[16..].copy_from_slice(&checksum[16..]);

    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&checksum[..4]);
    iv[4..].copy_from_slice(&secret[20..]);

    (key, iv)
}

/// XORs `data` in place with the AES-256-CTR keystream.
///
/// Encryption and decryption are the same operation.
pub fn apply_keystream(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes256Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}
