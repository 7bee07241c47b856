use std::{fmt, io};

/// Discriminated outcome for every lock, region, and store operation.
///
/// Callers can always tell "secret not found" (`Ok(None)` on the read
/// path, not an error) apart from "store unusable".
#[derive(Debug)]
pub enum StoreError {
    /// No System V IPC key could be derived from the supplied name.
    KeyDerivation(io::Error),
    /// The underlying semaphore or memory segment could not be created,
    /// opened, or attached.
    Resource(io::Error),
    /// A read lock was requested while this handle holds the write lock.
    WriteLockHeld,
    /// A write lock was requested while this handle holds a read lock.
    ReadLockHeld,
    /// Unlock was requested but this handle holds no lock.
    LockNotHeld,
    /// A non-blocking acquisition could not proceed without waiting.
    WouldBlock,
    /// The operation needs a lock or attachment this handle does not have.
    InvalidState,
    /// The data segment could not be created or replaced.
    Resize(io::Error),
    /// A local working or result buffer could not be allocated.
    Allocation,
    /// The record buffer's declared lengths disagree with its actual size.
    Corrupted(String),
    /// Exclusive access for teardown could not be obtained, most likely
    /// because another process destroyed the region concurrently.
    Destroy(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::KeyDerivation(e) => write!(f, "key derivation failed: {}", e),
            StoreError::Resource(e) => write!(f, "shared resource unavailable: {}", e),
            StoreError::WriteLockHeld => write!(f, "write lock held by this handle"),
            StoreError::ReadLockHeld => write!(f, "read lock held by this handle"),
            StoreError::LockNotHeld => write!(f, "no lock held by this handle"),
            StoreError::WouldBlock => write!(f, "lock unavailable without blocking"),
            StoreError::InvalidState => write!(f, "operation invalid in current handle state"),
            StoreError::Resize(e) => write!(f, "data segment replacement failed: {}", e),
            StoreError::Allocation => write!(f, "local buffer allocation failed"),
            StoreError::Corrupted(what) => write!(f, "corrupted record buffer: {}", what),
            StoreError::Destroy(e) => write!(f, "region teardown failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::KeyDerivation(e)
            | StoreError::Resource(e)
            | StoreError::Resize(e)
            | StoreError::Destroy(e) => Some(e),
            _ => None,
        }
    }
}
