use anyhow::{anyhow, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoUnavailableError;

/// 256-bit symmetric key used for both at-rest and wire encryption.
pub type Key = [u8; 32];

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct KdfParams {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl KdfParams {
    pub fn default_interactive() -> Self {
        Self {
            m_cost_kib: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }

    pub fn for_test() -> Self {
        Self {
            m_cost_kib: 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }
}

/// Derives the sync key from a user passphrase. The salt is stable per
/// sync scope so every device of one user derives the same key.
pub fn derive_sync_key(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<Key> {
    let argon_params = Params::new(params.m_cost_kib, params.t_cost, params.p_cost, Some(32))
        .map_err(|_| anyhow!("argon2 params"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|_| anyhow!("argon2 hash"))?;
    Ok(output)
}

pub fn random_key() -> Key {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Short stable identifier for a key, safe to persist next to config.
pub fn key_fingerprint(key: &Key) -> String {
    let digest = Sha256::digest(key);
    B64_URL.encode(&digest[..12])
}

pub fn encrypt_bytes(key: &Key, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| anyhow!("invalid key"))?;

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| anyhow!("encrypt failed"))?;

    let mut blob = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn decrypt_bytes(key: &Key, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < 24 {
        return Err(anyhow!("ciphertext too short"));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(24);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| anyhow!("invalid key"))?;
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| anyhow!("decrypt failed"))
}

/// AEAD round-trip probe. Must pass before any destructive remote step
/// (delete-all-data for the encryption-enable flow); a stack that cannot
/// encrypt must never be allowed to wipe data it cannot replace.
pub fn self_test() -> Result<()> {
    let key = random_key();
    let probe = b"taskloop.crypto.self_test";
    let blob = encrypt_bytes(&key, probe, b"self_test").map_err(|_| CryptoUnavailableError)?;
    let back = decrypt_bytes(&key, &blob, b"self_test").map_err(|_| CryptoUnavailableError)?;
    if back != probe {
        return Err(CryptoUnavailableError.into());
    }
    Ok(())
}
