//! Text encryption used for secrets kept on disk.
//!
//! AES-256-GCM with a key stretched by PBKDF2-HMAC-SHA256 from material that
//! identifies this machine, so a copied session file is useless elsewhere.
//! Output is base64 text of `nonce (12 bytes) || ciphertext+tag`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::Sha256;

const KEY_SALT: &[u8] = b"tether-agent/session-store/v1";
const KEY_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),
    #[error("decrypted text is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Opaque encrypt/decrypt capability over text.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Derive the AES key from arbitrary secret material.
    pub fn from_material(material: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(material, KEY_SALT, KEY_ITERATIONS, &mut key);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    /// Key bound to this machine: `/etc/machine-id` plus the hostname.
    pub fn for_machine(hostname: &str) -> Self {
        let machine_id = ["/etc/machine-id", "/var/lib/dbus/machine-id"]
            .iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if machine_id.is_empty() {
            tracing::warn!("No machine-id found, session key derived from hostname only");
        }
        Self::from_material(format!("{machine_id}:{hostname}").as_bytes())
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let blob = BASE64.decode(ciphertext.trim())?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::TooShort(blob.len()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(String::from_utf8(plain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let cipher = AesGcmCipher::from_material(b"machine-a:host");
        let sealed = cipher.encrypt(r#"{"sid":"abc"}"#).unwrap();
        assert!(!sealed.contains("abc"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), r#"{"sid":"abc"}"#);
    }

    #[test]
    fn nonce_differs_per_call() {
        let cipher = AesGcmCipher::from_material(b"k");
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn other_key_cannot_decrypt() {
        let sealed = AesGcmCipher::from_material(b"machine-a").encrypt("secret").unwrap();
        let err = AesGcmCipher::from_material(b"machine-b")
            .decrypt(&sealed)
            .unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn rejects_garbage() {
        let cipher = AesGcmCipher::from_material(b"k");
        assert!(matches!(cipher.decrypt("!!!"), Err(CryptoError::Encoding(_))));
        assert!(matches!(
            cipher.decrypt(&BASE64.encode([0u8; 4])),
            Err(CryptoError::TooShort(4))
        ));
    }
}
