//! Token-at-rest encryption and constant-time comparisons (§10).
//!
//! Bot tokens are never stored in plaintext; `token_ciphertext` is the
//! output of XChaCha20-Poly1305 sealed with the process-wide `encryption_key`.
//! The webhook secret-token header is the one piece of attacker-controlled
//! input this service compares for equality, so that comparison alone runs
//! in constant time.

use crate::error::{CoreError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, XChaCha20Poly1305, XNonce};
use subtle::ConstantTimeEq;

const NONCE_LEN: usize = 24;

pub struct TokenCipher {
    cipher: XChaCha20Poly1305,
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Seals a bot token, returning `nonce || ciphertext` for storage in
    /// `token_ciphertext`.
    pub fn encrypt(&self, token: &str) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, token.as_bytes())
            .map_err(|e| CoreError::Fatal(format!("token encryption failed: {e}")))?;
        let mut out = nonce.to_vec();
        out.append(&mut sealed);
        Ok(out)
    }

    /// Opens a `token_ciphertext` blob produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, blob: &[u8]) -> Result<String> {
        if blob.len() < NONCE_LEN {
            return Err(CoreError::Fatal("token ciphertext truncated".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CoreError::Fatal(format!("token decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| CoreError::Fatal(format!("decrypted token is not valid UTF-8: {e}")))
    }
}

/// Constant-time comparison of a webhook's `X-Telegram-Bot-Api-Secret-Token`
/// header against the per-bot configured secret.
pub fn webhook_secret_matches(received: &str, expected: &str) -> bool {
    received.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = TokenCipher::new(&test_key());
        let token = "123456:ABC-DEF1234ghIkl-zyx57W2v1u123ew11";
        let blob = cipher.encrypt(token).unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), token);
    }

    #[test]
    fn different_nonces_each_call() {
        let cipher = TokenCipher::new(&test_key());
        let a = cipher.encrypt("same-token").unwrap();
        let b = cipher.encrypt("same-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher = TokenCipher::new(&test_key());
        let blob = cipher.encrypt("secret-token").unwrap();
        let other = TokenCipher::new(&[9u8; 32]);
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let cipher = TokenCipher::new(&test_key());
        assert!(cipher.decrypt(&[1, 2, 3]).is_err());
    }

    #[test]
    fn webhook_secret_matches_equal_and_rejects_unequal() {
        assert!(webhook_secret_matches("shh-secret", "shh-secret"));
        assert!(!webhook_secret_matches("shh-secret", "different"));
        assert!(!webhook_secret_matches("short", "much-longer-secret"));
    }
}
