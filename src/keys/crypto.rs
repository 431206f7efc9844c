//! Key material and at-rest encryption
//!
//! The process master key signs key hashes and encrypts stored API keys.
//! Resolution order: `MASTER_KEY` env (urlsafe base64, hex, or raw utf-8,
//! decoded length >= 32), then the `MASTER_KEY_PATH` file, then a freshly
//! generated 64-byte secret persisted with owner-only permissions.
//!
//! Stored ciphertexts are `enc-v1:` + base64(nonce || AES-256-GCM ct) under
//! `sha256(master_key)`. Rows written by the previous generation used a
//! repeating-XOR scheme; those decrypt once and are re-encrypted on load.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE as BASE64_URL_SAFE};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use std::env;
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Version prefix on AEAD ciphertexts; kept verbatim for row interop
pub const ENCRYPTION_PREFIX: &str = "enc-v1:";

const NONCE_LENGTH: usize = 12;
const MIN_MASTER_KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("MASTER_KEY must decode to at least 32 bytes (base64, hex, or raw)")]
    MasterKeyTooShort,
    #[error("failed to read master key file: {0}")]
    MasterKeyRead(#[from] std::io::Error),
    #[error("encryption failure")]
    EncryptFailure,
    #[error("decryption failure")]
    DecryptFailure,
}

/// Process-wide master key
#[derive(Clone)]
pub struct MasterKey(Zeroizing<Vec<u8>>);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"***redacted***")
            .finish()
    }
}

impl MasterKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() < MIN_MASTER_KEY_BYTES {
            return Err(CryptoError::MasterKeyTooShort);
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the MASTER_KEY env value: urlsafe base64, then hex, then raw.
    fn from_env_value(raw: &str) -> Result<Self, CryptoError> {
        let raw = raw.trim();

        let padded = format!("{}{}", raw, "=".repeat((4 - raw.len() % 4) % 4));
        if let Ok(decoded) = BASE64_URL_SAFE.decode(padded.as_bytes()) {
            if decoded.len() >= MIN_MASTER_KEY_BYTES {
                return Self::from_bytes(decoded);
            }
        }

        if let Ok(decoded) = hex::decode(raw) {
            if decoded.len() >= MIN_MASTER_KEY_BYTES {
                return Self::from_bytes(decoded);
            }
        }

        Self::from_bytes(raw.as_bytes().to_vec())
    }

    /// Resolve the master key: env, then file, then fresh random.
    pub fn resolve() -> Result<Self, CryptoError> {
        if let Ok(raw) = env::var("MASTER_KEY") {
            if !raw.trim().is_empty() {
                let key = Self::from_env_value(&raw)?;
                tracing::info!("Master key loaded from MASTER_KEY");
                return Ok(key);
            }
        }

        let key_path =
            PathBuf::from(env::var("MASTER_KEY_PATH").unwrap_or_else(|_| "master.key".into()));
        if key_path.exists() {
            let bytes = std::fs::read(&key_path)?;
            return Self::from_bytes(bytes);
        }

        let mut bytes = vec![0u8; 64];
        OsRng.fill_bytes(&mut bytes);
        let key = Self::from_bytes(bytes.clone())?;

        match std::fs::write(&key_path, &bytes) {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(
                        &key_path,
                        std::fs::Permissions::from_mode(0o600),
                    );
                }
                tracing::warn!(
                    "MASTER_KEY not set; generated a development key at {}. Use the environment variable in production.",
                    key_path.display()
                );
            }
            Err(e) => {
                tracing::warn!("Failed to persist master key (using in-memory key): {}", e);
            }
        }

        Ok(key)
    }
}

/// AEAD + MAC operations derived from the master key
pub struct KeyCipher {
    cipher: Aes256Gcm,
    master: MasterKey,
}

impl KeyCipher {
    pub fn new(master: MasterKey) -> Self {
        let digest = Sha256::digest(master.bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest).expect("sha256 digest is a valid key");
        Self { cipher, master }
    }

    /// Encrypt an API key for storage.
    pub fn encrypt_key(&self, api_key: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut ciphertext = self
            .cipher
            .encrypt(nonce, api_key.as_bytes())
            .map_err(|_| CryptoError::EncryptFailure)?;

        let mut blob = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.append(&mut ciphertext);
        Ok(format!("{}{}", ENCRYPTION_PREFIX, BASE64_STANDARD.encode(blob)))
    }

    /// Decrypt a stored blob. Returns the plaintext and whether the row used
    /// the legacy scheme and should be rewritten.
    pub fn decrypt_key_with_metadata(&self, encrypted: &str) -> (Option<String>, bool) {
        if let Some(token) = encrypted.strip_prefix(ENCRYPTION_PREFIX) {
            let plaintext = BASE64_STANDARD
                .decode(token.as_bytes())
                .ok()
                .filter(|blob| blob.len() > NONCE_LENGTH)
                .and_then(|blob| {
                    let (nonce_bytes, ct) = blob.split_at(NONCE_LENGTH);
                    self.cipher.decrypt(Nonce::from_slice(nonce_bytes), ct).ok()
                })
                .and_then(|p| String::from_utf8(p).ok());
            if plaintext.is_none() {
                tracing::error!("Failed to decrypt stored key (corrupted blob)");
            }
            return (plaintext, false);
        }

        match self.legacy_decrypt_key(encrypted) {
            Some(plain) => {
                tracing::warn!("Legacy-encrypted key detected; upgrading to AEAD on load");
                (Some(plain), true)
            }
            None => (None, false),
        }
    }

    pub fn decrypt_key(&self, encrypted: &str) -> Option<String> {
        self.decrypt_key_with_metadata(encrypted).0
    }

    /// Legacy format: base64(16-byte header || plaintext XOR repeating
    /// master_key[..32]). Weak by construction; read-only migration path.
    fn legacy_decrypt_key(&self, encrypted: &str) -> Option<String> {
        let data = BASE64_STANDARD.decode(encrypted.as_bytes()).ok()?;
        if data.len() <= 16 {
            return None;
        }
        let body = &data[16..];
        let pad = &self.master.bytes()[..MIN_MASTER_KEY_BYTES];
        let decrypted: Vec<u8> = body
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ pad[i % pad.len()])
            .collect();
        String::from_utf8(decrypted).ok()
    }

    /// Storage hash: sha512(key || salt) hex, then HMAC-SHA512 under the
    /// master key, hex.
    pub fn hash_key(&self, api_key: &str, salt: &str) -> String {
        let first = hex::encode(Sha512::digest(format!("{}{}", api_key, salt).as_bytes()));
        let mut mac = <HmacSha512 as Mac>::new_from_slice(self.master.bytes())
            .expect("hmac accepts any key length");
        mac.update(first.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// O(1) lookup index: HMAC-SHA256 of the plaintext, hex.
    pub fn lookup_hash(&self, api_key: &str) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.master.bytes())
            .expect("hmac accepts any key length");
        mac.update(api_key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> KeyCipher {
        KeyCipher::new(MasterKey::from_bytes(vec![7u8; 64]).unwrap())
    }

    #[test]
    fn test_master_key_too_short_rejected() {
        assert!(matches!(
            MasterKey::from_bytes(vec![1u8; 16]),
            Err(CryptoError::MasterKeyTooShort)
        ));
        assert!(MasterKey::from_bytes(vec![1u8; 32]).is_ok());
    }

    #[test]
    fn test_env_value_forms() {
        let raw32 = "a".repeat(32);
        assert!(MasterKey::from_env_value(&raw32).is_ok());

        let hex_value = hex::encode([5u8; 32]);
        assert!(MasterKey::from_env_value(&hex_value).is_ok());

        let b64_value = BASE64_URL_SAFE.encode([9u8; 48]);
        assert!(MasterKey::from_env_value(&b64_value).is_ok());

        assert!(MasterKey::from_env_value("short").is_err());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let c = cipher();
        let key = "sk-abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUV";
        let blob = c.encrypt_key(key).unwrap();
        assert!(blob.starts_with(ENCRYPTION_PREFIX));

        let (plain, needs_upgrade) = c.decrypt_key_with_metadata(&blob);
        assert_eq!(plain.as_deref(), Some(key));
        assert!(!needs_upgrade);
    }

    #[test]
    fn test_legacy_xor_decrypts_and_flags_upgrade() {
        let c = cipher();
        let plaintext = "sk-legacykey0000";

        // Build a legacy blob: 16-byte header + XOR body
        let pad = [7u8; 32];
        let body: Vec<u8> = plaintext
            .as_bytes()
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ pad[i % 32])
            .collect();
        let mut data = vec![0u8; 16];
        data.extend(body);
        let legacy = BASE64_STANDARD.encode(data);

        let (plain, needs_upgrade) = c.decrypt_key_with_metadata(&legacy);
        assert_eq!(plain.as_deref(), Some(plaintext));
        assert!(needs_upgrade);
    }

    #[test]
    fn test_hash_key_depends_on_salt() {
        let c = cipher();
        let h1 = c.hash_key("sk-k", "salt-a");
        let h2 = c.hash_key("sk-k", "salt-b");
        let h3 = c.hash_key("sk-k", "salt-a");
        assert_ne!(h1, h2);
        assert_eq!(h1, h3);
        assert_eq!(h1.len(), 128); // hmac-sha512 hex
    }

    #[test]
    fn test_lookup_hash_is_stable() {
        let c = cipher();
        assert_eq!(c.lookup_hash("sk-x"), c.lookup_hash("sk-x"));
        assert_ne!(c.lookup_hash("sk-x"), c.lookup_hash("sk-y"));
        assert_eq!(c.lookup_hash("sk-x").len(), 64); // hmac-sha256 hex
    }

    #[test]
    fn test_corrupted_blob_fails_closed() {
        let c = cipher();
        let blob = c.encrypt_key("sk-k").unwrap();
        let mut corrupted = blob.clone();
        corrupted.truncate(blob.len() - 4);
        corrupted.push_str("AAAA");
        assert!(c.decrypt_key(&corrupted).is_none());
    }
}
