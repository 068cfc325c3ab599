//! Per-session chunk encryption.
//!
//! Sessions that opt into encrypted delivery get a random seed at metadata
//! time; the chunk key is derived from that seed and the client fingerprint,
//! so a captured ciphertext stream is useless without both.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit};
use aes_gcm::Aes256Gcm;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::protocol::error::DeliveryError;

/// Generate a fresh session encryption seed (32 random bytes, hex-encoded).
pub fn generate_seed() -> String {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    hex::encode(seed)
}

/// Derives the chunk key for a session.
///
/// # Arguments
/// * `seed_hex` - The session's encryption seed as issued with metadata
/// * `fingerprint` - The client fingerprint bound to the session
///
/// # Returns
/// 32-byte AES-256 key, deterministic for a given (seed, fingerprint) pair
pub fn derive_chunk_key(seed_hex: &str, fingerprint: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed_hex.as_bytes());
    hasher.update(fingerprint.as_bytes());
    hasher.finalize().into()
}

/// Encrypts one chunk with AES-256-GCM.
///
/// # Arguments
/// * `key` - Chunk key from [`derive_chunk_key`]
/// * `plaintext` - Chunk bytes from the origin
///
/// # Returns
/// Tuple of (iv, ciphertext) where the 16-byte authentication tag is
/// appended to the ciphertext and the IV is a fresh random 96-bit nonce
pub fn encrypt_chunk(key: &[u8; 32], plaintext: &[u8]) -> Result<([u8; 12], Vec<u8>), DeliveryError> {
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    let nonce = GenericArray::from_slice(&iv);

    let key = Key::<Aes256Gcm>::from(*key);
    let cipher = Aes256Gcm::new(&key);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| DeliveryError::Internal(format!("chunk encryption failed: {}", e)))?;

    Ok((iv, ciphertext))
}

/// Decrypts one chunk, verifying the authentication tag.
///
/// A tag failure means the ciphertext or key is wrong; callers treat it as
/// fatal for the session rather than retrying.
pub fn decrypt_chunk(key: &[u8; 32], iv: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>, DeliveryError> {
    let nonce = GenericArray::from_slice(iv);
    let key = Key::<Aes256Gcm>::from(*key);
    let cipher = Aes256Gcm::new(&key);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| DeliveryError::DecryptFailed)
}
