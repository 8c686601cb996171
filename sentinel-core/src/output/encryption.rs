//! Artifact encryption: AES-GCM-256 under an Argon2id-derived key.
//!
//! An encrypted artifact is the JSON serialization of [`EncryptedData`],
//! which carries the nonce, tag, and KDF parameters needed to decrypt it with
//! the passphrase alone.

use crate::{Result, SentinelError};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, rand_core::RngCore},
};
use argon2::{
    Argon2, Params, Version,
    password_hash::{PasswordHasher, SaltString},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Algorithm tag stored in every envelope.
pub const ALGORITHM: &str = "AES-GCM-256";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const SALT_SIZE: usize = 16;

// Argon2id: 64 MiB, 3 passes, 4 lanes (RFC 9106 second recommended option).
const MEMORY_COST_KIB: u32 = 65536;
const TIME_COST: u32 = 3;
const PARALLELISM: u32 = 4;

/// Argon2id parameters and salt used to derive the artifact key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub salt: Vec<u8>,
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub version: String,
}

impl KdfParams {
    /// Fresh parameters with a random salt.
    pub fn generate() -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        Self {
            salt,
            memory_cost: MEMORY_COST_KIB,
            time_cost: TIME_COST,
            parallelism: PARALLELISM,
            version: "1.3".to_string(),
        }
    }

    /// Rejects parameters weaker than the ones this crate writes.
    ///
    /// # Errors
    /// Returns an encryption error naming the weak parameter.
    pub fn validate(&self) -> Result<()> {
        if self.salt.len() < SALT_SIZE {
            return Err(encryption_error(format!(
                "Salt must be at least {SALT_SIZE} bytes"
            )));
        }
        if self.memory_cost < MEMORY_COST_KIB {
            return Err(encryption_error(format!(
                "Memory cost must be at least {MEMORY_COST_KIB} KiB"
            )));
        }
        if self.time_cost < TIME_COST {
            return Err(encryption_error(format!(
                "Time cost must be at least {TIME_COST} iterations"
            )));
        }
        if self.parallelism < 1 {
            return Err(encryption_error("Parallelism must be at least 1"));
        }
        Ok(())
    }
}

/// Self-describing encrypted artifact envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    pub algorithm: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub kdf_params: KdfParams,
}

fn encryption_error(context: impl Into<String>) -> SentinelError {
    SentinelError::Encryption {
        context: context.into(),
    }
}

fn derive_key(passphrase: &str, params: &KdfParams) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    params.validate()?;

    let argon_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| encryption_error(format!("Invalid Argon2 parameters: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon_params);

    let salt = SaltString::encode_b64(&params.salt)
        .map_err(|e| encryption_error(format!("Invalid salt: {e}")))?;
    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| encryption_error(format!("Key derivation failed: {e}")))?;
    let output = hash
        .hash
        .ok_or_else(|| encryption_error("Key derivation produced no output"))?;
    if output.as_bytes().len() != KEY_SIZE {
        return Err(encryption_error("Key derivation produced a key of the wrong size"));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(output.as_bytes());
    Ok(key)
}

/// Encrypts `data` under a key derived from `passphrase`.
///
/// # Example
/// ```rust
/// use sentinel_core::output::encryption::{decrypt_data, encrypt_data};
///
/// let sealed = encrypt_data(b"masked rows", "passphrase")?;
/// assert_eq!(sealed.nonce.len(), 12);
/// assert_eq!(decrypt_data(&sealed, "passphrase")?, b"masked rows");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// # Errors
/// Returns an encryption error if key derivation or sealing fails.
pub fn encrypt_data(data: &[u8], passphrase: &str) -> Result<EncryptedData> {
    let kdf_params = KdfParams::generate();
    let key = derive_key(passphrase, &kdf_params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, data)
        .map_err(|e| encryption_error(format!("Encryption failed: {e}")))?;
    // AES-GCM appends the tag to the ciphertext.
    let split = sealed
        .len()
        .checked_sub(TAG_SIZE)
        .ok_or_else(|| encryption_error("Sealed output shorter than the tag"))?;
    let (ciphertext, auth_tag) = sealed.split_at(split);

    Ok(EncryptedData {
        algorithm: ALGORITHM.to_string(),
        nonce: nonce.to_vec(),
        ciphertext: ciphertext.to_vec(),
        auth_tag: auth_tag.to_vec(),
        kdf_params,
    })
}

/// Decrypts an envelope produced by [`encrypt_data`].
///
/// # Errors
/// Returns an encryption error for malformed envelopes, a wrong passphrase,
/// or tampered ciphertext.
pub fn decrypt_data(encrypted: &EncryptedData, passphrase: &str) -> Result<Vec<u8>> {
    if encrypted.algorithm != ALGORITHM {
        return Err(encryption_error(format!(
            "Unsupported encryption algorithm: {}",
            encrypted.algorithm
        )));
    }
    if encrypted.nonce.len() != NONCE_SIZE {
        return Err(encryption_error("Invalid nonce length"));
    }
    if encrypted.auth_tag.len() != TAG_SIZE {
        return Err(encryption_error("Invalid authentication tag length"));
    }

    let key = derive_key(passphrase, &encrypted.kdf_params)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*key));
    let nonce = Nonce::from_slice(&encrypted.nonce);

    let mut sealed = Vec::with_capacity(encrypted.ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(&encrypted.ciphertext);
    sealed.extend_from_slice(&encrypted.auth_tag);

    cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| encryption_error("Decryption failed: wrong passphrase or corrupted artifact"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_round_trip() -> Result<()> {
        let sealed = encrypt_data(b"{\"kind\":\"header\"}", "correct horse")?;
        assert_eq!(sealed.algorithm, ALGORITHM);
        assert_eq!(sealed.auth_tag.len(), TAG_SIZE);
        assert_eq!(decrypt_data(&sealed, "correct horse")?, b"{\"kind\":\"header\"}");
        Ok(())
    }

    #[test]
    fn test_encryption_wrong_passphrase_fails() -> Result<()> {
        let sealed = encrypt_data(b"rows", "right")?;
        assert!(decrypt_data(&sealed, "wrong").is_err());
        Ok(())
    }

    #[test]
    fn test_encryption_tamper_detected() -> Result<()> {
        let mut sealed = encrypt_data(b"rows and more rows", "pw")?;
        sealed.ciphertext[0] ^= 0xff;
        assert!(decrypt_data(&sealed, "pw").is_err());
        Ok(())
    }

    #[test]
    fn test_encryption_rejects_weak_kdf() -> Result<()> {
        let mut sealed = encrypt_data(b"rows", "pw")?;
        sealed.kdf_params.memory_cost = 1024;
        assert!(decrypt_data(&sealed, "pw").is_err());
        Ok(())
    }

    #[test]
    fn test_encryption_nonces_differ() -> Result<()> {
        let a = encrypt_data(b"same", "pw")?;
        let b = encrypt_data(b"same", "pw")?;
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.kdf_params.salt, b.kdf_params.salt);
        Ok(())
    }
}
