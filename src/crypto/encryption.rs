//! AES-256-GCM Encryption Implementation
//!
//! A [`CipherOperation`] is initialized with a key and an IV before any
//! biometric prompt is shown, and is consumed by value when it finally runs.
//! GCM's tag means a wrong key, wrong IV or tampered ciphertext fails the
//! operation instead of yielding garbage.

use crate::crypto::{KeyMaterial, IV_SIZE, KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Ciphertext and the IV it was sealed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Ciphertext with appended authentication tag
    pub ciphertext: Vec<u8>,
    /// IV used for encryption (unique per encryption)
    pub iv: Vec<u8>,
}

impl Envelope {
    /// Build an envelope from the two base64 transport fields.
    ///
    /// Embedded whitespace is ignored, since some platform encoders wrap lines.
    pub fn from_base64(ciphertext: &str, iv: &str) -> Result<Self> {
        Ok(Envelope {
            ciphertext: decode_field(ciphertext)?,
            iv: decode_field(iv)?,
        })
    }

    /// Ciphertext as standard base64
    pub fn ciphertext_base64(&self) -> String {
        STANDARD.encode(&self.ciphertext)
    }

    /// IV as standard base64
    pub fn iv_base64(&self) -> String {
        STANDARD.encode(&self.iv)
    }

    /// Serialize to bytes for storage (IV first)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.iv.len() + self.ciphertext.len());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IV_SIZE + TAG_SIZE {
            return Err(Error::Cipher("Data too short".to_string()));
        }

        Ok(Envelope {
            iv: bytes[..IV_SIZE].to_vec(),
            ciphertext: bytes[IV_SIZE..].to_vec(),
        })
    }
}

fn decode_field(field: &str) -> Result<Vec<u8>> {
    let compact: String = field.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| Error::Cipher(format!("Invalid base64: {}", e)))
}

/// Source of fresh IVs for encryption
pub trait IvSource: Send + Sync {
    fn next_iv(&self) -> [u8; IV_SIZE];
}

/// Random 96-bit IVs from the thread RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIv;

impl IvSource for RandomIv {
    fn next_iv(&self) -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }
}

/// Direction of a cipher operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherMode::Encrypt => f.write_str("encrypt"),
            CipherMode::Decrypt => f.write_str("decrypt"),
        }
    }
}

/// An initialized, not yet executed cipher operation
pub struct CipherOperation {
    mode: CipherMode,
    key: Arc<KeyMaterial>,
    iv: [u8; IV_SIZE],
}

impl CipherOperation {
    /// Prepare an encryption with a fresh IV
    pub fn for_encryption(key: Arc<KeyMaterial>, ivs: &dyn IvSource) -> Self {
        CipherOperation {
            mode: CipherMode::Encrypt,
            key,
            iv: ivs.next_iv(),
        }
    }

    /// Prepare a decryption with the IV stored next to the ciphertext
    pub fn for_decryption(key: Arc<KeyMaterial>, iv: &[u8]) -> Result<Self> {
        if iv.len() != IV_SIZE {
            return Err(Error::Cipher(format!("Invalid IV length: {}", iv.len())));
        }

        let mut iv_bytes = [0u8; IV_SIZE];
        iv_bytes.copy_from_slice(iv);

        Ok(CipherOperation {
            mode: CipherMode::Decrypt,
            key,
            iv: iv_bytes,
        })
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Run an encryption
    pub fn seal(self, plaintext: &[u8]) -> Result<Envelope> {
        if self.mode != CipherMode::Encrypt {
            return Err(Error::Cipher("Operation was initialized for decryption".to_string()));
        }
        seal_with_iv(self.key.bytes(), self.iv, plaintext, &[])
    }

    /// Run a decryption
    pub fn open(self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.mode != CipherMode::Decrypt {
            return Err(Error::Cipher("Operation was initialized for encryption".to_string()));
        }
        open_with_iv(self.key.bytes(), self.iv, ciphertext, &[])
    }
}

impl fmt::Debug for CipherOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherOperation")
            .field("mode", &self.mode)
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

fn seal_with_iv(
    key: &[u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Envelope> {
    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Cipher("Failed to create encryption key".to_string()))?;
    let sealing_key = LessSafeKey::new(unbound_key);
    let nonce = Nonce::assume_unique_for_key(iv);

    let mut in_out = plaintext.to_vec();
    in_out.reserve(TAG_SIZE);

    sealing_key
        .seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Cipher("Encryption failed".to_string()))?;

    Ok(Envelope {
        ciphertext: in_out,
        iv: iv.to_vec(),
    })
}

fn open_with_iv(
    key: &[u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Cipher("Ciphertext too short".to_string()));
    }

    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Cipher("Failed to create decryption key".to_string()))?;
    let opening_key = LessSafeKey::new(unbound_key);
    let nonce = Nonce::assume_unique_for_key(iv);

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| {
            Error::Cipher("Decryption failed - data corrupted, wrong key or wrong IV".to_string())
        })?;

    Ok(plaintext.to_vec())
}

/// Encrypt with a raw key and a random IV.
///
/// Used for vault-internal records, which are not biometric-gated.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Envelope> {
    seal_with_iv(key, RandomIv.next_iv(), plaintext, aad)
}

/// Decrypt a record sealed by [`encrypt`]
pub fn decrypt(key: &[u8; KEY_SIZE], envelope: &Envelope, aad: &[u8]) -> Result<Vec<u8>> {
    if envelope.iv.len() != IV_SIZE {
        return Err(Error::Cipher(format!(
            "Invalid IV length: {}",
            envelope.iv.len()
        )));
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&envelope.iv);
    open_with_iv(key, iv, &envelope.ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Arc<KeyMaterial> {
        Arc::new(KeyMaterial::generate())
    }

    #[test]
    fn test_seal_open() {
        let key = test_key();
        let plaintext = b"Hello, biocrypt!";

        let envelope = CipherOperation::for_encryption(key.clone(), &RandomIv)
            .seal(plaintext)
            .unwrap();
        assert_eq!(envelope.iv.len(), IV_SIZE);
        assert_eq!(envelope.ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = CipherOperation::for_decryption(key, &envelope.iv)
            .unwrap()
            .open(&envelope.ciphertext)
            .unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_iv_fails() {
        let key = test_key();
        let envelope = CipherOperation::for_encryption(key.clone(), &RandomIv)
            .seal(b"Secret data")
            .unwrap();

        let mut wrong_iv = envelope.iv.clone();
        wrong_iv[0] ^= 0x01;

        let result = CipherOperation::for_decryption(key, &wrong_iv)
            .unwrap()
            .open(&envelope.ciphertext);
        assert!(matches!(result, Err(Error::Cipher(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = CipherOperation::for_encryption(test_key(), &RandomIv)
            .seal(b"Secret data")
            .unwrap();

        let result = CipherOperation::for_decryption(test_key(), &envelope.iv)
            .unwrap()
            .open(&envelope.ciphertext);
        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut envelope = CipherOperation::for_encryption(key.clone(), &RandomIv)
            .seal(b"Secret data")
            .unwrap();
        envelope.ciphertext[0] ^= 0xFF;

        let result = CipherOperation::for_decryption(key, &envelope.iv)
            .unwrap()
            .open(&envelope.ciphertext);
        assert!(result.is_err());
    }

    #[test]
    fn test_short_iv_rejected_at_init() {
        let result = CipherOperation::for_decryption(test_key(), &[0u8; 8]);
        assert!(matches!(result, Err(Error::Cipher(_))));
    }

    #[test]
    fn test_mode_mismatch_rejected() {
        let key = test_key();
        let op = CipherOperation::for_decryption(key.clone(), &[0u8; IV_SIZE]).unwrap();
        assert!(op.seal(b"x").is_err());

        let op = CipherOperation::for_encryption(key, &RandomIv);
        assert!(op.open(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let envelope = CipherOperation::for_encryption(key.clone(), &RandomIv)
            .seal(b"")
            .unwrap();
        let decrypted = CipherOperation::for_decryption(key, &envelope.iv)
            .unwrap()
            .open(&envelope.ciphertext)
            .unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_base64_fields_tolerate_line_wrapping() {
        let envelope = Envelope {
            ciphertext: vec![0x5Au8; 90],
            iv: vec![7u8; IV_SIZE],
        };

        let encoded = envelope.ciphertext_base64();
        let wrapped = format!("{}\n{}\n", &encoded[..76], &encoded[76..]);

        let restored = Envelope::from_base64(&wrapped, &envelope.iv_base64()).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_invalid_base64_is_cipher_error() {
        let result = Envelope::from_base64("not*base64", "AAAA");
        assert!(matches!(result, Err(Error::Cipher(_))));
    }

    #[test]
    fn test_record_encrypt_with_aad() {
        let key = KeyMaterial::generate();
        let sealed = encrypt(key.bytes(), b"record", b"keys:alpha").unwrap();

        let bytes = sealed.to_bytes();
        let restored = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(decrypt(key.bytes(), &restored, b"keys:alpha").unwrap(), b"record");
        assert!(decrypt(key.bytes(), &restored, b"keys:beta").is_err());
    }
}
