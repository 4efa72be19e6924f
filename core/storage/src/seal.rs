//! Chunked content sealing using XChaCha20-Poly1305.
//!
//! File content is split into [`CHUNK_SIZE`] chunks. Each chunk is sealed
//! independently under the file key with a random nonce; the chunk index is
//! bound as associated data so chunks cannot be reordered.
//!
//! Sealed chunk format: `nonce || ciphertext || tag`.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::provider::CHUNK_SIZE;
use vaultsync_common::{Error, Result};

/// Key length for XChaCha20-Poly1305 (32 bytes).
pub const KEY_LENGTH: usize = 32;

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Generate a fresh random file key, base64 encoded.
pub fn generate_key() -> String {
    let key = XChaCha20Poly1305::generate_key(&mut OsRng);
    STANDARD.encode(key)
}

fn cipher_for(key: &str) -> Result<XChaCha20Poly1305> {
    let raw = STANDARD
        .decode(key)
        .map_err(|e| Error::Crypto(format!("Invalid key encoding: {}", e)))?;
    if raw.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            raw.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(&raw)))
}

/// Seal `data` into encrypted chunks.
///
/// Empty input produces a single sealed empty chunk.
pub fn seal(key: &str, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let cipher = cipher_for(key)?;
    let plain_chunks: Vec<&[u8]> = if data.is_empty() {
        vec![data]
    } else {
        data.chunks(CHUNK_SIZE as usize).collect()
    };

    let mut sealed = Vec::with_capacity(plain_chunks.len());
    for (index, chunk) in plain_chunks.into_iter().enumerate() {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = (index as u64).to_le_bytes();
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: chunk, aad: &aad })
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        sealed.push(out);
    }
    Ok(sealed)
}

/// Open sealed chunks back into the original content.
///
/// # Errors
/// - Wrong key, truncated chunk, tampered or reordered chunks
pub fn open(key: &str, chunks: &[Vec<u8>]) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let mut data = Vec::new();

    for (index, chunk) in chunks.iter().enumerate() {
        if chunk.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto(format!("Chunk {} is truncated", index)));
        }
        let (nonce, ciphertext) = chunk.split_at(NONCE_SIZE);
        let aad = (index as u64).to_le_bytes();
        let plain = cipher
            .decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Crypto(format!("Chunk {} failed authentication", index)))?;
        data.extend_from_slice(&plain);
    }
    Ok(data)
}
