//! Token obfuscation for browser-side storage.
//!
//! The key is derived from the user agent and origin, neither of which is
//! secret, so this keeps the token out of plain sight on disk and nothing
//! more. Any failure degrades to plaintext rather than erroring.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

const PBKDF2_ROUNDS: u32 = 5000;
const IV_LEN: usize = 12;
const SEPARATOR: char = '.';

/// AES-256-GCM key derived with PBKDF2-HMAC-SHA256.
pub struct TokenCipher {
  cipher: Aes256Gcm,
}

impl TokenCipher {
  /// Derive the key from the user agent (password) and origin (salt).
  pub fn derive(user_agent: &str, origin: &str) -> Self {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(user_agent.as_bytes(), origin.as_bytes(), PBKDF2_ROUNDS, &mut key);
    Self {
      cipher: Aes256Gcm::new(&key.into()),
    }
  }

  /// Encrypt to `base64(iv).base64(ciphertext)` with a fresh IV. Returns
  /// the token unchanged if encryption fails.
  pub fn encrypt(&self, token: &str) -> String {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    match self.cipher.encrypt(Nonce::from_slice(&iv), token.as_bytes()) {
      Ok(ciphertext) => format!("{}{}{}", STANDARD.encode(iv), SEPARATOR, STANDARD.encode(ciphertext)),
      Err(e) => {
        warn!("Token encryption failed, storing plaintext: {}", e);
        token.to_string()
      }
    }
  }

  /// Decrypt a stored value. Missing or empty values yield `None`; anything
  /// that does not decrypt is returned as stored.
  pub fn decrypt(&self, stored: Option<&str>) -> Option<String> {
    let stored = stored.filter(|value| !value.is_empty())?;

    let Some((iv, ciphertext)) = stored.split_once(SEPARATOR) else {
      return Some(stored.to_string());
    };
    if iv.is_empty() || ciphertext.is_empty() {
      return Some(stored.to_string());
    }

    match self.try_decrypt(iv, ciphertext) {
      Some(token) => Some(token),
      None => {
        debug!("Stored token did not decrypt, returning it as stored");
        Some(stored.to_string())
      }
    }
  }

  fn try_decrypt(&self, iv: &str, ciphertext: &str) -> Option<String> {
    let iv = STANDARD.decode(iv).ok()?;
    if iv.len() != IV_LEN {
      return None;
    }
    let ciphertext = STANDARD.decode(ciphertext).ok()?;
    let plain = self
      .cipher
      .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
      .ok()?;
    String::from_utf8(plain).ok()
  }
}
