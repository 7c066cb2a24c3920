//! Credential field encryption.
//!
//! Each credential field is sealed with AES-256-GCM under its own key,
//! derived from the master secret plus the record's identity, so leaking one
//! field's key exposes nothing else. Ciphertext is stored as
//! `base64(nonce || ciphertext || tag)`.

use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};

use crate::EngineError;

/// Derive the per-field key for one credential record.
pub fn derive_key(master: &str, org_id: &str, created: i64, auth_id: &str, field: &str) -> [u8; 32] {
    let material = format!("{master}_{org_id}_{created}_{auth_id}_{field}");
    let hashed = digest(&SHA256, material.as_bytes());

    let mut key = [0u8; 32];
    key.copy_from_slice(hashed.as_ref());
    key
}

fn sealing_key(key: &[u8; 32]) -> Result<LessSafeKey, EngineError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| EngineError::Credential("invalid key material".into()))?;
    Ok(LessSafeKey::new(unbound))
}

pub fn encrypt_field(key: &[u8; 32], plaintext: &str) -> Result<String, EngineError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| EngineError::Credential("nonce generation failed".into()))?;

    let mut in_out = plaintext.as_bytes().to_vec();
    sealing_key(key)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
        .map_err(|_| EngineError::Credential("encryption failed".into()))?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend_from_slice(&in_out);
    Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
}

pub fn decrypt_field(key: &[u8; 32], encoded: &str) -> Result<String, EngineError> {
    let sealed = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| EngineError::Credential(format!("base64 decode failed: {e}")))?;

    if sealed.len() < NONCE_LEN {
        return Err(EngineError::Credential("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| EngineError::Credential("invalid nonce".into()))?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = sealing_key(key)?
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| EngineError::Credential("decryption failed".into()))?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|e| EngineError::Credential(format!("utf-8 decode failed: {e}")))
}
