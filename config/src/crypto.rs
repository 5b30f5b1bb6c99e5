//! Encryption of the backend access token at rest.
//!
//! The token is sealed with AES-256-GCM under a key derived from the
//! hostname and username, so a copied `settings.toml` is useless elsewhere.
//! Sealed form: base64(nonce || ciphertext).

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"docchat-access-token-v1";

fn machine_cipher() -> Result<Aes256Gcm, String> {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
    let user = whoami::username();

    let digest = Sha256::new()
        .chain_update(KEY_CONTEXT)
        .chain_update(host.as_bytes())
        .chain_update(b"/")
        .chain_update(user.as_bytes())
        .finalize();

    Aes256Gcm::new_from_slice(&digest).map_err(|e| format!("Failed to create cipher: {}", e))
}

/// Seal a token for storage.
pub fn seal_token(token: &str) -> Result<String, String> {
    let cipher = machine_cipher()?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), token.as_bytes())
        .map_err(|e| format!("Encryption failed: {}", e))?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(BASE64.encode(out))
}

/// Recover a token sealed by [`seal_token`] on this machine.
pub fn open_token(sealed: &str) -> Result<String, String> {
    let raw = BASE64
        .decode(sealed)
        .map_err(|e| format!("Failed to decode base64: {}", e))?;
    if raw.len() <= NONCE_LEN {
        return Err("Sealed token too short".to_string());
    }

    let (nonce, body) = raw.split_at(NONCE_LEN);
    let plain = machine_cipher()?
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|e| format!("Decryption failed: {}", e))?;

    String::from_utf8(plain).map_err(|e| format!("Invalid UTF-8 in token: {}", e))
}
