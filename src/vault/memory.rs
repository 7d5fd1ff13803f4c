//! In-memory key vault
//!
//! Keys live only as long as the process. Used by tests and by the CLI's
//! `--ephemeral` mode.

use crate::crypto::{KeyHandle, KeyMaterial, KeySpec, IV_SIZE};
use crate::error::{Error, Result};
use crate::vault::{KeyVault, SecretItem, SecretStore};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Volatile vault backed by concurrent maps
#[derive(Debug, Default)]
pub struct MemoryKeyVault {
    keys: DashMap<String, KeyHandle>,
    ivs: DashMap<String, HashSet<[u8; IV_SIZE]>>,
    items: DashMap<String, SecretItem>,
    /// Number of keys ever generated
    generated: AtomicUsize,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of keys generated since the vault was created
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    /// Number of IVs recorded under `name`
    pub fn issued_iv_count(&self, name: &str) -> usize {
        self.ivs.get(name).map(|set| set.len()).unwrap_or(0)
    }
}

impl KeyVault for MemoryKeyVault {
    fn get_key(&self, name: &str) -> Result<Option<KeyHandle>> {
        Ok(self.keys.get(name).map(|entry| entry.value().clone()))
    }

    fn ensure_key(&self, name: &str, spec: KeySpec) -> Result<KeyHandle> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("Key name cannot be empty".to_string()));
        }

        // The entry guard holds the shard lock, so only one caller generates.
        match self.keys.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let handle = KeyHandle::new(name, spec, Utc::now(), KeyMaterial::generate());
                self.generated.fetch_add(1, Ordering::SeqCst);
                info!("Generated key '{}' ({})", name, handle.fingerprint());
                entry.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    fn delete_key(&self, name: &str) -> Result<()> {
        if self.keys.remove(name).is_some() {
            debug!("Deleted key '{}'", name);
        }
        self.ivs.remove(name);
        Ok(())
    }

    fn record_iv(&self, name: &str, iv: &[u8; IV_SIZE]) -> Result<bool> {
        Ok(self.ivs.entry(name.to_string()).or_default().insert(*iv))
    }

    fn invalidate_enrollment(&self) -> Result<usize> {
        let mut dropped = Vec::new();
        self.keys.retain(|name, handle| {
            let keep = !handle.spec().invalidated_by_enrollment;
            if !keep {
                dropped.push(name.clone());
            }
            keep
        });
        for name in &dropped {
            self.ivs.remove(name);
        }

        let mut items_dropped = 0;
        self.items.retain(|_, item| {
            let keep = !item.access_control.invalidated_by_enrollment();
            if !keep {
                items_dropped += 1;
            }
            keep
        });

        info!(
            "Enrollment changed: dropped {} keys, {} keychain items",
            dropped.len(),
            items_dropped
        );
        Ok(dropped.len() + items_dropped)
    }
}

impl SecretStore for MemoryKeyVault {
    fn put_item(&self, service: &str, item: SecretItem) -> Result<()> {
        self.items.insert(service.to_string(), item);
        Ok(())
    }

    fn get_item(&self, service: &str) -> Result<Option<SecretItem>> {
        Ok(self.items.get(service).map(|entry| entry.value().clone()))
    }

    fn remove_item(&self, service: &str) -> Result<bool> {
        Ok(self.items.remove(service).is_some())
    }
}
