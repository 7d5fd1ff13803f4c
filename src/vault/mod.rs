//! Key vault capability
//!
//! A vault persists named symmetric keys and keychain items. Platform
//! keystores implement these traits; the crate ships an in-memory vault
//! and a sled-backed software vault.

mod memory;
mod store;

pub use memory::MemoryKeyVault;
pub use store::SledKeyVault;

use crate::crypto::{KeyHandle, KeySpec, IV_SIZE};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Named symmetric key storage
pub trait KeyVault: Send + Sync {
    /// Look up a key without creating it
    fn get_key(&self, name: &str) -> Result<Option<KeyHandle>>;

    /// Return the existing key or create one.
    ///
    /// Concurrent callers for the same name must all observe the same key.
    fn ensure_key(&self, name: &str, spec: KeySpec) -> Result<KeyHandle>;

    /// Remove a key and its IV ledger. Absent keys are not an error.
    fn delete_key(&self, name: &str) -> Result<()>;

    /// Record an IV issued under `name`. Returns false if it was issued before.
    fn record_iv(&self, name: &str, iv: &[u8; IV_SIZE]) -> Result<bool>;

    /// Biometric enrollment changed: drop every enrollment-bound key and item.
    ///
    /// Returns how many entries were dropped.
    fn invalidate_enrollment(&self) -> Result<usize>;

    /// Push pending writes to durable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Keychain-style secret storage, one item per service
pub trait SecretStore: Send + Sync {
    fn put_item(&self, service: &str, item: SecretItem) -> Result<()>;

    fn get_item(&self, service: &str) -> Result<Option<SecretItem>>;

    /// Returns whether an item was present
    fn remove_item(&self, service: &str) -> Result<bool>;
}

/// A backend that holds both keys and keychain items
pub trait Vault: KeyVault + SecretStore {}

impl<T: KeyVault + SecretStore + ?Sized> Vault for T {}

/// Which biometric enrollments may unlock a keychain item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessControl {
    /// Any enrolled biometric, including ones added later
    BiometryAny,
    /// Only the enrollment set at store time
    BiometryCurrentSet,
}

impl AccessControl {
    /// Parse the wire flag. Anything but `biometryAny` is the stricter policy.
    pub fn from_flag(flag: &str) -> Self {
        if flag == "biometryAny" {
            AccessControl::BiometryAny
        } else {
            AccessControl::BiometryCurrentSet
        }
    }

    pub fn invalidated_by_enrollment(&self) -> bool {
        matches!(self, AccessControl::BiometryCurrentSet)
    }
}

/// A stored keychain secret
#[derive(Clone)]
pub struct SecretItem {
    pub secret: Zeroizing<Vec<u8>>,
    pub access_control: AccessControl,
    pub created_at: DateTime<Utc>,
}

impl SecretItem {
    pub fn new(secret: impl Into<Vec<u8>>, access_control: AccessControl) -> Self {
        SecretItem {
            secret: Zeroizing::new(secret.into()),
            access_control,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for SecretItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretItem")
            .field("secret", &format_args!("<{} bytes>", self.secret.len()))
            .field("access_control", &self.access_control)
            .field("created_at", &self.created_at)
            .finish()
    }
}
