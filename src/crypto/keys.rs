//! Vault key material and handles
//!
//! A [`KeyHandle`] names one symmetric key held by a vault. The raw bytes are
//! reachable only inside the crate, where cipher operations are initialized.

use crate::crypto::KEY_SIZE;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Raw AES-256 key bytes, zeroized on drop
pub struct KeyMaterial {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl KeyMaterial {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        KeyMaterial { key }
    }

    /// Restore key material read back from a vault
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(KeyMaterial { key })
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Short blake3 fingerprint, safe to log
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.key[..]);
        hex::encode(&hash.as_bytes()[..8])
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({})", self.fingerprint())
    }
}

/// Generation parameters for a vault key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    /// Every use needs a fresh biometric approval
    pub auth_required: bool,
    /// The vault drops the key when biometric enrollment changes
    pub invalidated_by_enrollment: bool,
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec {
            auth_required: true,
            invalidated_by_enrollment: true,
        }
    }
}

/// Handle to a named key living in a vault
#[derive(Clone)]
pub struct KeyHandle {
    name: String,
    spec: KeySpec,
    created_at: DateTime<Utc>,
    material: Arc<KeyMaterial>,
}

impl KeyHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        spec: KeySpec,
        created_at: DateTime<Utc>,
        material: KeyMaterial,
    ) -> Self {
        KeyHandle {
            name: name.into(),
            spec,
            created_at,
            material: Arc::new(material),
        }
    }

    /// Key name chosen by the caller
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> KeySpec {
        self.spec
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn fingerprint(&self) -> String {
        self.material.fingerprint()
    }

    /// Whether two handles refer to the same key bytes
    pub fn same_key(&self, other: &KeyHandle) -> bool {
        Arc::ptr_eq(&self.material, &other.material)
            || ring::constant_time::verify_slices_are_equal(
                self.material.bytes(),
                other.material.bytes(),
            )
            .is_ok()
    }

    pub(crate) fn material(&self) -> &Arc<KeyMaterial> {
        &self.material
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("created_at", &self.created_at)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
