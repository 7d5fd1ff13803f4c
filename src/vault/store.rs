//! Sled-based key vault
//!
//! Keys and keychain items are sealed with a wrapping key before they touch
//! the database, so the files on disk hold only encrypted records. This is a
//! software stand-in for a hardware keystore, not a replacement for one.

use crate::crypto::{decrypt, encrypt, Envelope, KeyHandle, KeyMaterial, KeySpec, IV_SIZE, KEY_SIZE};
use crate::error::{Error, Result};
use crate::vault::{AccessControl, KeyVault, SecretItem, SecretStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

const KEYS_TREE: &str = "keys";
const IVS_TREE: &str = "ivs";
const ITEMS_TREE: &str = "items";

/// On-disk form of a key, sealed before storage
#[derive(Serialize, Deserialize)]
struct StoredKey {
    auth_required: bool,
    invalidated_by_enrollment: bool,
    created_at: DateTime<Utc>,
    key: Vec<u8>,
}

/// On-disk form of a keychain item, sealed before storage
#[derive(Serialize, Deserialize)]
struct StoredItem {
    secret: Vec<u8>,
    access_control: AccessControl,
    created_at: DateTime<Utc>,
}

/// Persistent vault using sled
pub struct SledKeyVault {
    db: Db,
    keys: Tree,
    ivs: Tree,
    items: Tree,
    /// Seals every record written to disk
    wrap_key: Zeroizing<[u8; KEY_SIZE]>,
    generated: AtomicUsize,
}

impl SledKeyVault {
    /// Open or create a vault at `path`
    pub fn open<P: AsRef<Path>>(path: P, wrap_key: [u8; KEY_SIZE]) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let vault = Self::from_db(db, wrap_key)?;
        info!(
            "Key vault opened at {:?}, {} keys",
            path.as_ref(),
            vault.keys.len()
        );
        Ok(vault)
    }

    /// Create a throwaway vault (for testing)
    pub fn temporary(wrap_key: [u8; KEY_SIZE]) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, wrap_key)
    }

    fn from_db(db: Db, wrap_key: [u8; KEY_SIZE]) -> Result<Self> {
        let keys = db.open_tree(KEYS_TREE)?;
        let ivs = db.open_tree(IVS_TREE)?;
        let items = db.open_tree(ITEMS_TREE)?;

        Ok(SledKeyVault {
            db,
            keys,
            ivs,
            items,
            wrap_key: Zeroizing::new(wrap_key),
            generated: AtomicUsize::new(0),
        })
    }

    /// Number of keys generated by this handle
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    fn key_aad(name: &str) -> Vec<u8> {
        [b"keys:".as_slice(), name.as_bytes()].concat()
    }

    fn item_aad(service: &str) -> Vec<u8> {
        [b"items:".as_slice(), service.as_bytes()].concat()
    }

    /// Length-prefixed so one name is never a prefix of another's entries
    fn iv_prefix(name: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(4 + name.len());
        prefix.extend_from_slice(&(name.len() as u32).to_be_bytes());
        prefix.extend_from_slice(name.as_bytes());
        prefix
    }

    fn seal_record<T: Serialize>(&self, record: &T, aad: &[u8]) -> Result<Vec<u8>> {
        let data = Zeroizing::new(bincode::serialize(record)?);
        let sealed = encrypt(&self.wrap_key, &data, aad)?;
        Ok(sealed.to_bytes())
    }

    fn open_record<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8], aad: &[u8]) -> Result<T> {
        let envelope = Envelope::from_bytes(bytes)?;
        let data = decrypt(&self.wrap_key, &envelope, aad)
            .map(Zeroizing::new)
            .map_err(|_| Error::Vault("Record could not be unsealed (wrong wrapping key?)".to_string()))?;
        Ok(bincode::deserialize(&data)?)
    }

    fn decode_key(&self, name: &str, bytes: &[u8]) -> Result<KeyHandle> {
        let stored: StoredKey = self.open_record(bytes, &Self::key_aad(name))?;
        let material = KeyMaterial::from_slice(&stored.key)?;
        let _wipe = Zeroizing::new(stored.key);

        Ok(KeyHandle::new(
            name,
            KeySpec {
                auth_required: stored.auth_required,
                invalidated_by_enrollment: stored.invalidated_by_enrollment,
            },
            stored.created_at,
            material,
        ))
    }

    fn encode_key(&self, handle: &KeyHandle) -> Result<Vec<u8>> {
        let spec = handle.spec();
        let stored = StoredKey {
            auth_required: spec.auth_required,
            invalidated_by_enrollment: spec.invalidated_by_enrollment,
            created_at: handle.created_at(),
            key: handle.material().bytes().to_vec(),
        };
        let sealed = self.seal_record(&stored, &Self::key_aad(handle.name()));
        let _wipe = Zeroizing::new(stored.key);
        sealed
    }

    fn clear_ivs(&self, name: &str) -> Result<()> {
        for entry in self.ivs.scan_prefix(Self::iv_prefix(name)) {
            let (key, _) = entry?;
            self.ivs.remove(key)?;
        }
        Ok(())
    }
}

impl KeyVault for SledKeyVault {
    fn get_key(&self, name: &str) -> Result<Option<KeyHandle>> {
        match self.keys.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(self.decode_key(name, &bytes)?)),
            None => Ok(None),
        }
    }

    fn ensure_key(&self, name: &str, spec: KeySpec) -> Result<KeyHandle> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("Key name cannot be empty".to_string()));
        }

        if let Some(existing) = self.get_key(name)? {
            return Ok(existing);
        }

        let handle = KeyHandle::new(name, spec, Utc::now(), KeyMaterial::generate());
        let sealed = self.encode_key(&handle)?;

        // Only the first writer wins; a loser reads back the winner's key.
        match self
            .keys
            .compare_and_swap(name.as_bytes(), None::<&[u8]>, Some(sealed))?
        {
            Ok(()) => {
                self.generated.fetch_add(1, Ordering::SeqCst);
                self.db.flush()?;
                info!("Generated key '{}' ({})", name, handle.fingerprint());
                Ok(handle)
            }
            Err(_) => {
                debug!("Lost creation race for key '{}', using existing key", name);
                self.get_key(name)?.ok_or_else(|| {
                    Error::Vault(format!("Key '{}' vanished during creation", name))
                })
            }
        }
    }

    fn delete_key(&self, name: &str) -> Result<()> {
        if self.keys.remove(name.as_bytes())?.is_some() {
            debug!("Deleted key '{}'", name);
        }
        self.clear_ivs(name)?;
        self.db.flush()?;
        Ok(())
    }

    fn record_iv(&self, name: &str, iv: &[u8; IV_SIZE]) -> Result<bool> {
        let mut entry = Self::iv_prefix(name);
        entry.extend_from_slice(iv);
        let previous = self.ivs.insert(entry, Vec::<u8>::new())?;
        Ok(previous.is_none())
    }

    fn invalidate_enrollment(&self) -> Result<usize> {
        let mut dropped = 0;

        for entry in self.keys.iter() {
            let (raw_name, bytes) = entry?;
            let name = String::from_utf8_lossy(&raw_name).into_owned();
            let bound = match self.decode_key(&name, &bytes) {
                Ok(handle) => handle.spec().invalidated_by_enrollment,
                Err(e) => {
                    warn!("Dropping unreadable key '{}': {}", name, e);
                    true
                }
            };
            if bound {
                self.keys.remove(&raw_name)?;
                self.clear_ivs(&name)?;
                dropped += 1;
            }
        }

        for entry in self.items.iter() {
            let (raw_service, bytes) = entry?;
            let service = String::from_utf8_lossy(&raw_service).into_owned();
            let bound = match self.open_record::<StoredItem>(&bytes, &Self::item_aad(&service)) {
                Ok(item) => item.access_control.invalidated_by_enrollment(),
                Err(e) => {
                    warn!("Dropping unreadable keychain item '{}': {}", service, e);
                    true
                }
            };
            if bound {
                self.items.remove(&raw_service)?;
                dropped += 1;
            }
        }

        self.db.flush()?;
        info!("Enrollment changed: dropped {} vault entries", dropped);
        Ok(dropped)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SecretStore for SledKeyVault {
    fn put_item(&self, service: &str, item: SecretItem) -> Result<()> {
        let stored = StoredItem {
            secret: item.secret.to_vec(),
            access_control: item.access_control,
            created_at: item.created_at,
        };
        let sealed = self.seal_record(&stored, &Self::item_aad(service));
        let _wipe = Zeroizing::new(stored.secret);

        self.items.insert(service.as_bytes(), sealed?)?;
        self.db.flush()?;
        Ok(())
    }

    fn get_item(&self, service: &str) -> Result<Option<SecretItem>> {
        match self.items.get(service.as_bytes())? {
            Some(bytes) => {
                let stored: StoredItem = self.open_record(&bytes, &Self::item_aad(service))?;
                Ok(Some(SecretItem {
                    secret: Zeroizing::new(stored.secret),
                    access_control: stored.access_control,
                    created_at: stored.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn remove_item(&self, service: &str) -> Result<bool> {
        let removed = self.items.remove(service.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const WRAP: [u8; KEY_SIZE] = [0x11; KEY_SIZE];

    #[test]
    fn test_keys_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vault");

        let created = {
            let vault = SledKeyVault::open(&path, WRAP).unwrap();
            vault.ensure_key("biometric_key", KeySpec::default()).unwrap()
        };

        let vault = SledKeyVault::open(&path, WRAP).unwrap();
        let reopened = vault.get_key("biometric_key").unwrap().unwrap();
        assert!(created.same_key(&reopened));
        assert_eq!(reopened.spec(), KeySpec::default());
        assert_eq!(vault.generated_count(), 0);
    }

    #[test]
    fn test_wrong_wrap_key_cannot_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vault");

        {
            let vault = SledKeyVault::open(&path, WRAP).unwrap();
            vault.ensure_key("k", KeySpec::default()).unwrap();
        }

        let vault = SledKeyVault::open(&path, [0x22; KEY_SIZE]).unwrap();
        assert!(matches!(vault.get_key("k"), Err(Error::Vault(_))));
    }

    #[test]
    fn test_records_are_not_stored_in_clear() {
        let vault = SledKeyVault::temporary(WRAP).unwrap();
        let handle = vault.ensure_key("k", KeySpec::default()).unwrap();

        let raw = vault.keys.get("k").unwrap().unwrap();
        let key_bytes = handle.material().bytes();
        assert!(!raw.windows(KEY_SIZE).any(|w| w == key_bytes));
    }

    #[test]
    fn test_concurrent_first_use_creates_one_key() {
        let vault = Arc::new(SledKeyVault::temporary(WRAP).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let vault = Arc::clone(&vault);
                std::thread::spawn(move || vault.ensure_key("shared", KeySpec::default()).unwrap())
            })
            .collect();
        let keys: Vec<KeyHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(vault.generated_count(), 1);
        assert!(keys.iter().all(|k| k.same_key(&keys[0])));
    }

    #[test]
    fn test_iv_ledger_scoped_per_name() {
        let vault = SledKeyVault::temporary(WRAP).unwrap();
        let iv = [3u8; IV_SIZE];

        assert!(vault.record_iv("a", &iv).unwrap());
        assert!(!vault.record_iv("a", &iv).unwrap());
        assert!(vault.record_iv("ab", &iv).unwrap());

        vault.delete_key("a").unwrap();
        assert!(vault.record_iv("a", &iv).unwrap());
        assert!(!vault.record_iv("ab", &iv).unwrap());
    }

    #[test]
    fn test_delete_missing_key_is_ok() {
        let vault = SledKeyVault::temporary(WRAP).unwrap();
        vault.delete_key("nothing").unwrap();
    }

    #[test]
    fn test_items_roundtrip_and_enrollment() {
        let vault = SledKeyVault::temporary(WRAP).unwrap();
        vault
            .put_item("any", SecretItem::new(b"one".to_vec(), AccessControl::BiometryAny))
            .unwrap();
        vault
            .put_item(
                "current",
                SecretItem::new(b"two".to_vec(), AccessControl::BiometryCurrentSet),
            )
            .unwrap();
        vault.ensure_key("k", KeySpec::default()).unwrap();

        let item = vault.get_item("current").unwrap().unwrap();
        assert_eq!(item.secret.as_slice(), b"two");

        assert_eq!(vault.invalidate_enrollment().unwrap(), 2);
        assert!(vault.get_item("any").unwrap().is_some());
        assert!(vault.get_item("current").unwrap().is_none());
        assert!(vault.get_key("k").unwrap().is_none());

        assert!(vault.remove_item("any").unwrap());
        assert!(!vault.remove_item("any").unwrap());
    }
}
