//! Credential encryption at rest.
//!
//! Passwords and tokens stored in the `ups_opt_*` tables are Fernet
//! ciphertext. The key is derived from the process secret with
//! PBKDF2-HMAC-SHA256 over a fixed salt; the derivation parameters are part
//! of the on-disk format and must not change without a data migration.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use fernet::Fernet;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;

const KDF_SALT: &[u8] = b"fixed-salt";
const KDF_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum SecretError {
    /// Ciphertext did not authenticate under the current process secret.
    #[error("Stored ciphertext does not match the current encryption key")]
    KeyMismatch,

    /// Ciphertext is not valid Fernet data at all.
    #[error("Stored ciphertext is corrupt")]
    Corrupt,

    /// No process secret was configured.
    #[error("No encryption key configured; secret-dependent features are disabled")]
    MissingKey,
}

/// Encrypts and decrypts credential fields with a key derived from the
/// process secret.
pub struct SecretStore {
    fernet: Fernet,
}

impl SecretStore {
    /// Derive the Fernet key from the process secret.
    pub fn new(process_secret: &str) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(
            process_secret.as_bytes(),
            KDF_SALT,
            KDF_ITERATIONS,
            &mut key,
        );
        let encoded = URL_SAFE.encode(key);
        let fernet =
            Fernet::new(&encoded).expect("32-byte urlsafe base64 is always a valid fernet key");
        Self { fernet }
    }

    /// Build a store from an optional process secret; `None` fails closed.
    pub fn from_env_value(secret: Option<&str>) -> Option<Self> {
        secret.filter(|s| !s.is_empty()).map(Self::new)
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        self.fernet.encrypt(plaintext.as_bytes())
    }

    pub fn encrypt_bytes(&self, plaintext: &[u8]) -> String {
        self.fernet.encrypt(plaintext)
    }

    /// Decrypt a stored ciphertext.
    ///
    /// A well-formed token that fails authentication means the field was
    /// written under a different process secret and is reported as
    /// [SecretError::KeyMismatch]; malformed tokens are [SecretError::Corrupt].
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        let plaintext = self.decrypt_bytes(ciphertext)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Corrupt)
    }

    pub fn decrypt_bytes(&self, ciphertext: &str) -> Result<Vec<u8>, SecretError> {
        if !looks_like_fernet(ciphertext) {
            return Err(SecretError::Corrupt);
        }
        self.fernet
            .decrypt(ciphertext)
            .map_err(|_| SecretError::KeyMismatch)
    }
}

/// Quick shape check so garbage rows surface as corruption rather than a
/// key mismatch: a Fernet token is urlsafe base64 of at least the 57-byte
/// fixed part and starts with the 0x80 version byte.
fn looks_like_fernet(token: &str) -> bool {
    let Ok(raw) = URL_SAFE.decode(token) else {
        return false;
    };
    raw.len() >= 57 && raw[0] == 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let store = SecretStore::new("a-process-secret");
        for plaintext in ["", "hunter2", "påsswörd ☃", &"x".repeat(4096)] {
            let token = store.encrypt(plaintext);
            assert_eq!(store.decrypt(&token).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let store = SecretStore::new("a-process-secret");
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let token = store.encrypt_bytes(&payload);
        assert_eq!(store.decrypt_bytes(&token).unwrap(), payload);
    }

    #[test]
    fn test_key_mismatch_is_distinct() {
        let store_a = SecretStore::new("secret-a");
        let store_b = SecretStore::new("secret-b");
        let token = store_a.encrypt("hunter2");
        match store_b.decrypt(&token) {
            Err(SecretError::KeyMismatch) => {}
            other => panic!("expected KeyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_ciphertext() {
        let store = SecretStore::new("secret-a");
        match store.decrypt("not fernet at all") {
            Err(SecretError::Corrupt) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_same_secret_same_key() {
        let a = SecretStore::new("shared");
        let b = SecretStore::new("shared");
        let token = a.encrypt("payload");
        assert_eq!(b.decrypt(&token).unwrap(), "payload");
    }

    #[test]
    fn test_from_env_value_fails_closed() {
        assert!(SecretStore::from_env_value(None).is_none());
        assert!(SecretStore::from_env_value(Some("")).is_none());
        assert!(SecretStore::from_env_value(Some("k")).is_some());
    }
}
