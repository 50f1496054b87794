//! Symmetric vault for credential material at rest.
//!
//! Refresh tokens, access tokens and per-credential OAuth client secrets are
//! stored as XChaCha20-Poly1305 ciphertexts with a random 24-byte nonce,
//! base64-encoded as `nonce || ciphertext`. The key is derived from
//! `basic.secret_key` with SHA-256.
//!
//! The AEAD is intentionally non-deterministic, so ciphertexts are useless
//! for equality checks; upload deduplication relies on
//! [`CryptoVault::fingerprint`], a SHA-256 hex digest of the plaintext kept
//! in its own indexed column.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 24;

pub struct CryptoVault {
    cipher: XChaCha20Poly1305,
}

impl CryptoVault {
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::from_slice(digest.as_slice());
        Self {
            cipher: XChaCha20Poly1305::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("XChaCha20-Poly1305 encryption is infallible for in-memory data");

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        BASE64.encode(out)
    }

    /// `None` on any malformed or tampered input.
    pub fn decrypt(&self, encoded: &str) -> Option<String> {
        let raw = BASE64.decode(encoded).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }

    /// Stable plaintext digest used for dedup lookups.
    pub fn fingerprint(plaintext: &str) -> String {
        hex::encode(Sha256::digest(plaintext.as_bytes()))
    }
}
