// Reality key derivation
//
// The Reality inbound stores an X25519 private key; clients need the matching
// public key in their connection URI. Derivation sits behind a trait so the
// config reader stays decoupled from the curve implementation.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

pub trait KeyDerivation: Send + Sync {
    /// Derive the URL-safe base64 public key from a stored private key.
    fn derive_public_key(&self, private_key: &str) -> Result<String>;
}

/// X25519 derivation matching `xray x25519`. Accepts base64 (standard or
/// URL-safe alphabet, padded or not) or hex private keys and emits the
/// public key as unpadded URL-safe base64.
pub struct X25519KeyDerivation;

impl X25519KeyDerivation {
    fn decode_private(private_key: &str) -> Result<[u8; 32]> {
        let s = private_key.trim().trim_end_matches('=');
        if s.is_empty() {
            return Err(Error::InvalidKeyMaterial("empty private key".to_string()));
        }
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        if let Ok(bytes) = URL_SAFE_NO_PAD.decode(s) {
            candidates.push(bytes);
        }
        if let Ok(bytes) = STANDARD_NO_PAD.decode(s) {
            candidates.push(bytes);
        }
        if let Some(bytes) = decode_hex(s) {
            candidates.push(bytes);
        }
        for bytes in candidates {
            if bytes.len() == 32 {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&bytes);
                return Ok(raw);
            }
        }
        Err(Error::InvalidKeyMaterial(
            "expected a 32-byte x25519 private key in base64 or hex".to_string(),
        ))
    }
}

impl KeyDerivation for X25519KeyDerivation {
    fn derive_public_key(&self, private_key: &str) -> Result<String> {
        let raw = Self::decode_private(private_key)?;
        let secret = StaticSecret::from(raw);
        let public = PublicKey::from(&secret);
        Ok(URL_SAFE_NO_PAD.encode(public.as_bytes()))
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
