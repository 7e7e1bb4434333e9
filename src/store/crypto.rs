// =============================================================================
// Credential encryption at rest
// =============================================================================
//
// Exchange API secrets are never stored in plaintext. The symmetric key used
// to encrypt/decrypt them is resolved in three tiers, checked in order:
//
//   1. `GRIDBOT_MASTER_KEY` env var — any passphrase, stretched to a 256-bit
//      key via PBKDF2-HMAC-SHA256.
//   2. A key file at `<data_dir>/.encryption_key` — 32 raw bytes, read
//      verbatim if present.
//   3. Neither present — generate 32 random bytes, persist them to the key
//      file with owner-only permissions, and use that.
//
// This mirrors the original bot's Fernet key hierarchy (env var / key file /
// generate-and-persist) with an AES-256-GCM AEAD in place of Fernet.
// =============================================================================

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use tracing::{info, warn};

const KEY_FILE_NAME: &str = ".encryption_key";
const PBKDF2_ROUNDS: u32 = 100_000;
/// Fixed salt for the env-var stretching path — the key material itself
/// (the passphrase) is the real secret; the salt only needs to be constant
/// across process restarts so the derived key is stable.
const PBKDF2_SALT: &[u8] = b"gridbot-credential-key-v1";

pub struct EncryptionKey(Key<Aes256Gcm>);

impl EncryptionKey {
    /// Resolve the key per the three-tier policy above.
    pub fn load_or_generate(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();

        if let Ok(passphrase) = std::env::var("GRIDBOT_MASTER_KEY") {
            if !passphrase.is_empty() {
                info!("encryption key resolved from GRIDBOT_MASTER_KEY env var");
                return Ok(Self(derive_from_passphrase(&passphrase)));
            }
        }

        let key_path = data_dir.join(KEY_FILE_NAME);
        if key_path.exists() {
            let bytes = std::fs::read(&key_path)
                .with_context(|| format!("failed to read key file {}", key_path.display()))?;
            if bytes.len() == 32 {
                info!(path = %key_path.display(), "encryption key loaded from key file");
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                return Ok(Self(*Key::<Aes256Gcm>::from_slice(&arr)));
            }
            warn!(path = %key_path.display(), "key file has unexpected length, regenerating");
        }

        Self::generate_and_persist(&key_path)
    }

    fn generate_and_persist(key_path: &PathBuf) -> Result<Self> {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);

        std::fs::create_dir_all(key_path.parent().unwrap_or(Path::new(".")))
            .context("failed to create data directory for encryption key")?;
        std::fs::write(key_path, raw)
            .with_context(|| format!("failed to persist key file {}", key_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(key_path, perms) {
                warn!(error = %e, "could not restrict encryption key file permissions");
            }
        }

        info!(path = %key_path.display(), "generated new encryption key");
        Ok(Self(*Key::<Aes256Gcm>::from_slice(&raw)))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.0);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&payload))
    }

    /// Decrypt `encoded`. Returns `None` (never the ciphertext) on any
    /// failure — matching the store's policy of never exposing bad data.
    pub fn decrypt(&self, encoded: &str) -> Option<String> {
        let payload = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
        if payload.len() < 12 {
            return None;
        }
        let (nonce_bytes, ciphertext) = payload.split_at(12);
        let cipher = Aes256Gcm::new(&self.0);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

fn derive_from_passphrase(passphrase: &str) -> Key<Aes256Gcm> {
    let mut key_bytes = [0u8; 32];
    pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        PBKDF2_SALT,
        PBKDF2_ROUNDS,
        &mut key_bytes,
    );
    *Key::<Aes256Gcm>::from_slice(&key_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_encrypt_decrypt() {
        let key = derive_from_passphrase("a test passphrase");
        let enc = EncryptionKey(key);
        let ciphertext = enc.encrypt("super-secret-api-key").unwrap();
        assert_ne!(ciphertext, "super-secret-api-key");
        let decrypted = enc.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, "super-secret-api-key");
    }

    #[test]
    fn decrypt_garbage_returns_none() {
        let key = derive_from_passphrase("another passphrase");
        let enc = EncryptionKey(key);
        assert!(enc.decrypt("not-valid-base64-or-ciphertext").is_none());
    }

    #[test]
    fn different_passphrases_yield_different_ciphertexts() {
        let key_a = derive_from_passphrase("alpha");
        let key_b = derive_from_passphrase("beta");
        let enc_a = EncryptionKey(key_a);
        let enc_b = EncryptionKey(key_b);
        let ct_a = enc_a.encrypt("same plaintext").unwrap();
        assert!(enc_b.decrypt(&ct_a).is_none());
    }
}
