//! AES-256-GCM encryption for saved connection passwords.
//!
//! Ciphertext is stored as base64(nonce || ciphertext) so it fits in a YAML
//! string field.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

pub const PLACEHOLDER_KEY: &str = "CHANGE_ME_32_BYTE_HEX_KEY";

const NONCE_LEN: usize = 12;

pub struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    pub fn new(key_hex: &str) -> anyhow::Result<Self> {
        let key = parse_key(key_hex)?;
        Ok(Self { key })
    }

    /// Key derived from a placeholder; only acceptable outside production.
    pub fn insecure_default() -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&sha2_digest(PLACEHOLDER_KEY.as_bytes()));
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid key length: {:?}", e))?;
        let nonce_bytes = generate_nonce();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> anyhow::Result<String> {
        let blob = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        if blob.len() <= NONCE_LEN {
            anyhow::bail!("ciphertext too short");
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid key length: {:?}", e))?;
        let mut plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {}", e))?;

        let text = String::from_utf8(plaintext.clone());
        plaintext.zeroize();
        Ok(text?)
    }
}

impl Drop for SecretCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn sha2_digest(input: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(input).into()
}

pub fn parse_key(hex: &str) -> anyhow::Result<[u8; 32]> {
    if hex.len() != 64 {
        anyhow::bail!(
            "PGMCP_SECRET_KEY must be 64 hex chars (32 bytes), got {} chars",
            hex.len()
        );
    }
    let mut bytes = hex::decode(hex)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}
