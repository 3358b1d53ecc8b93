use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::config::SecuritySection;

use super::{AccountError, AccountResult};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for stored credentials. Ciphertexts are
/// `base64(nonce || ciphertext)` with a fresh 12-byte nonce per value.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
    fingerprint: String,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl SecretBox {
    pub fn new(key: &[u8]) -> AccountResult<Self> {
        if key.len() != KEY_LEN {
            return Err(AccountError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let digest = Sha256::digest(key);
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            fingerprint: hex::encode(&digest[..4]),
        })
    }

    pub fn from_base64(encoded: &str) -> AccountResult<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|err| AccountError::InvalidKey(err.to_string()))?;
        Self::new(&key)
    }

    /// Key from `security.encryption_key`, else from the environment
    /// variable named by `security.encryption_key_env`.
    pub fn from_config(security: &SecuritySection) -> AccountResult<Self> {
        let configured = security
            .encryption_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let encoded = match configured {
            Some(value) => value,
            None => std::env::var(&security.encryption_key_env)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| AccountError::MissingKey {
                    env: security.encryption_key_env.clone(),
                })?,
        };
        Self::from_base64(&encoded)
    }

    /// Short hex digest of the key, safe to log.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn seal(&self, plaintext: &str) -> AccountResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| AccountError::Crypto("encryption failed".into()))?;
        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(packed))
    }

    pub fn open(&self, sealed: &str) -> AccountResult<String> {
        let packed = STANDARD
            .decode(sealed.trim())
            .map_err(|err| AccountError::Crypto(format!("invalid ciphertext encoding: {err}")))?;
        if packed.len() <= NONCE_LEN {
            return Err(AccountError::Crypto("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AccountError::Crypto("decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|err| AccountError::Crypto(format!("plaintext is not utf-8: {err}")))
    }
}
