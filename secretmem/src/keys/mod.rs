//! Deterministic derivation of System V IPC keys from a caller-supplied
//! path-like name. Two processes deriving from the same name must land on
//! the same kernel identifiers, so everything here is a pure function of
//! the name plus a fixed per-subsystem tag.

use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::io;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::errors::StoreError;

/// Project tags separating the IPC namespaces derived from one seed name.
/// Unrelated subsystems sharing a name must not collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTag {
    /// The region's semaphore set (rw and attach counters).
    RwLock,
    /// The region's descriptor segment.
    Descriptor,
    /// The standalone lock without attachment tracking.
    LegacyLock,
}

impl KeyTag {
    fn proj_id(self) -> libc::c_int {
        match self {
            KeyTag::RwLock => b'L' as libc::c_int,
            KeyTag::Descriptor => b'D' as libc::c_int,
            KeyTag::LegacyLock => b'P' as libc::c_int,
        }
    }

    fn index(self) -> i32 {
        match self {
            KeyTag::RwLock => 0,
            KeyTag::Descriptor => 1,
            KeyTag::LegacyLock => 2,
        }
    }
}

/// Injectable key-derivation seam. The production impl goes through the
/// filesystem; tests and embedders that want anonymous stores substitute
/// [`EphemeralKeys`] and never touch real paths.
pub trait KeySource {
    fn derive(&self, name: &str, tag: KeyTag) -> Result<libc::key_t, StoreError>;
}

impl<K: KeySource + ?Sized> KeySource for &K {
    fn derive(&self, name: &str, tag: KeyTag) -> Result<libc::key_t, StoreError> {
        (**self).derive(name, tag)
    }
}

/// Derives keys with `ftok(3)`. The name must be an existing filesystem
/// path; no file I/O beyond the stat `ftok` itself performs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileTokenSource;

impl KeySource for FileTokenSource {
    fn derive(&self, name: &str, tag: KeyTag) -> Result<libc::key_t, StoreError> {
        let path = CString::new(name).map_err(|_| {
            StoreError::KeyDerivation(io::Error::from(io::ErrorKind::InvalidInput))
        })?;
        let key = unsafe { libc::ftok(path.as_ptr(), tag.proj_id()) };
        if key == -1 {
            return Err(StoreError::KeyDerivation(io::Error::last_os_error()));
        }
        Ok(key)
    }
}

static EPHEMERAL_BASE: Lazy<i32> = Lazy::new(|| {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    ((process::id() as i32) << 16) ^ (nanos as i32)
});

static EPHEMERAL_SEQ: AtomicI32 = AtomicI32::new(1);

/// Hands out machine-unique keys without touching the filesystem. Every
/// instance owns a disjoint key block, so handles sharing one instance
/// (and one name) meet on the same kernel objects while separate
/// instances never collide.
#[derive(Debug)]
pub struct EphemeralKeys {
    base: i32,
}

impl EphemeralKeys {
    pub fn new() -> EphemeralKeys {
        EphemeralKeys {
            base: *EPHEMERAL_BASE ^ EPHEMERAL_SEQ.fetch_add(1, Ordering::Relaxed).wrapping_shl(8),
        }
    }
}

impl Default for EphemeralKeys {
    fn default() -> EphemeralKeys {
        EphemeralKeys::new()
    }
}

impl KeySource for EphemeralKeys {
    fn derive(&self, name: &str, tag: KeyTag) -> Result<libc::key_t, StoreError> {
        let mut hasher = DefaultHasher::new();
        self.base.hash(&mut hasher);
        name.hash(&mut hasher);
        // Four consecutive keys per (instance, name); tag picks one.
        // Keys stay positive and clear of IPC_PRIVATE (0).
        let block = (hasher.finish() % 0x1fff_fffd) as i32 + 1;
        Ok(block * 4 + tag.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_token_is_deterministic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"seed").unwrap();
        let path = file.path().to_str().unwrap();

        let source = FileTokenSource;
        let first = source.derive(path, KeyTag::RwLock).unwrap();
        let second = source.derive(path, KeyTag::RwLock).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn file_token_tags_do_not_collide() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let source = FileTokenSource;
        let lock = source.derive(path, KeyTag::RwLock).unwrap();
        let descriptor = source.derive(path, KeyTag::Descriptor).unwrap();
        let legacy = source.derive(path, KeyTag::LegacyLock).unwrap();
        assert_ne!(lock, descriptor);
        assert_ne!(lock, legacy);
        assert_ne!(descriptor, legacy);
    }

    #[test]
    fn missing_path_fails_derivation() {
        let source = FileTokenSource;
        match source.derive("/no/such/path/secretmem", KeyTag::RwLock) {
            Err(StoreError::KeyDerivation(_)) => {}
            other => panic!("expected KeyDerivation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ephemeral_instances_are_disjoint() {
        let a = EphemeralKeys::new();
        let b = EphemeralKeys::new();
        let key_a = a.derive("secrets", KeyTag::RwLock).unwrap();
        let key_b = b.derive("secrets", KeyTag::RwLock).unwrap();
        assert_ne!(key_a, key_b);

        // Same instance, same name: stable.
        assert_eq!(key_a, a.derive("secrets", KeyTag::RwLock).unwrap());
        assert_ne!(key_a, a.derive("secrets", KeyTag::Descriptor).unwrap());
    }
}
