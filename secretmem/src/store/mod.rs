//! The key→secret store layered on an attach-counted region.
//!
//! Every operation opens the region, takes the appropriate lock, works
//! on the buffer, then unlocks and detaches — including on error paths,
//! so no exit leaves units drawn or segments attached. Updates rewrite
//! the full buffer under one write-lock hold, which is what makes them
//! atomic to readers: a read lock cannot overlap a held write lock.

mod codec;

use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::StoreError;
use crate::keys::{FileTokenSource, KeySource};
use crate::region::Region;

/// Mode bits used when an operation without a caller-supplied mode has
/// to create the store (the read path).
pub const DEFAULT_PERMS: u32 = 0o600;

/// Settings consumed by the harness binaries and the runtime binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Existing filesystem path seeding key derivation.
    pub key_file: String,
    /// Mode bits for segments created on first open.
    pub perms: u32,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            key_file: String::new(),
            perms: DEFAULT_PERMS,
        }
    }
}

/// The secret store: three operations over a named shared region, plus
/// explicit teardown. Generic over key derivation so embedders and tests
/// can swap the filesystem-seeded source for an anonymous one.
pub struct SecretStore<K: KeySource = FileTokenSource> {
    keys: K,
}

impl SecretStore<FileTokenSource> {
    pub fn new() -> SecretStore<FileTokenSource> {
        SecretStore {
            keys: FileTokenSource,
        }
    }
}

impl Default for SecretStore<FileTokenSource> {
    fn default() -> SecretStore<FileTokenSource> {
        SecretStore::new()
    }
}

impl<K: KeySource> SecretStore<K> {
    pub fn with_keys(keys: K) -> SecretStore<K> {
        SecretStore { keys }
    }

    /// Looks one secret up. `Ok(None)` when the id is absent — that is a
    /// normal outcome, not an error.
    pub fn read(&self, name: &str, id: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut region = Region::open(&self.keys, name, DEFAULT_PERMS)?;
        let outcome = Self::read_locked(&mut region, id);
        let detached = region.detach();
        let secret = outcome?;
        detached?;
        Ok(secret)
    }

    fn read_locked(region: &mut Region, id: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        region.read_lock()?;
        let outcome = Self::scan(region, id);
        let released = region.unlock();
        let secret = outcome?;
        released?;
        Ok(secret)
    }

    fn scan(region: &mut Region, id: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let buf = region.copy_out()?;
        Ok(codec::lookup(&buf, id)?.map(|secret| secret.to_vec()))
    }

    /// Stores `secret` under `id`, replacing any existing record for the
    /// id. An absent or empty secret deletes the id instead.
    pub fn write(
        &self,
        name: &str,
        id: &[u8],
        secret: Option<&[u8]>,
        perms: u32,
    ) -> Result<(), StoreError> {
        let mut region = Region::open(&self.keys, name, perms)?;
        let outcome = Self::write_locked(&mut region, id, secret);
        let detached = region.detach();
        outcome?;
        detached
    }

    fn write_locked(
        region: &mut Region,
        id: &[u8],
        secret: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        region.write_lock()?;
        let outcome = Self::replace(region, id, secret);
        let released = region.unlock();
        outcome?;
        released
    }

    fn replace(region: &mut Region, id: &[u8], secret: Option<&[u8]>) -> Result<(), StoreError> {
        let current = region.copy_out()?;
        let next = codec::rewrite(&current, id, secret)?;
        // Swap the rebuilt buffer in before the write lock goes back, so
        // no reader can ever observe a half-applied update.
        region.resize(next.len())?;
        region.copy_in(&next)
    }

    /// Drops every record, leaving an empty store behind.
    pub fn clear(&self, name: &str, perms: u32) -> Result<(), StoreError> {
        let mut region = Region::open(&self.keys, name, perms)?;
        let outcome = Self::clear_locked(&mut region);
        let detached = region.detach();
        outcome?;
        detached
    }

    fn clear_locked(region: &mut Region) -> Result<(), StoreError> {
        region.write_lock()?;
        let outcome = region.resize(0);
        let released = region.unlock();
        outcome?;
        released
    }

    /// Tears the store's shared resources down entirely. Store contents
    /// otherwise outlive every process and persist until reboot; this is
    /// for decommissioning, not routine operation.
    pub fn destroy(&self, name: &str) -> Result<(), StoreError> {
        debug!(name, "destroying secret store");
        Region::open(&self.keys, name, DEFAULT_PERMS)?.close()
    }
}
