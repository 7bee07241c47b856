//! Host-local, multi-process secret store.
//!
//! Independent processes on one machine share small secrets through
//! volatile System V shared memory instead of disk. A recursive
//! semaphore-backed reader-writer lock guards an attach-counted,
//! resizable region; a length-prefixed record codec turns that region
//! into a key/secret store. Crash recovery relies entirely on the
//! kernel's `SEM_UNDO` adjustment reversal, so a holder that dies never
//! locks anyone out permanently.

pub mod errors;
pub mod keys;
pub mod lock;
pub mod region;
pub mod store;

pub use errors::StoreError;
pub use keys::{EphemeralKeys, FileTokenSource, KeySource, KeyTag};
pub use lock::{RwSem, SemLock, LOCK_UNITS};
pub use region::Region;
pub use store::{SecretStore, StoreConfig, DEFAULT_PERMS};
