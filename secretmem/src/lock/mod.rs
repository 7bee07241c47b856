//! Recursive reader-writer locking over one System V counting semaphore.
//!
//! The semaphore starts at [`LOCK_UNITS`]. A reader draws one unit, a
//! writer draws all of them, so a writer excludes every reader and every
//! other writer. Every kernel operation carries `SEM_UNDO`: if a holder
//! terminates abnormally the kernel reverses exactly the units that
//! process drew. That is the whole crash-recovery story; there is no
//! separate detection logic.
//!
//! The same core ([`RwSem`]) backs two lifecycle policies: [`SemLock`]
//! with caller-managed teardown, and the attach-counted region in
//! [`crate::region`] which destroys itself when the last attachment
//! closes.

use std::io;
use std::mem::MaybeUninit;
use std::thread;
use std::time::Duration;

use crate::errors::StoreError;

/// Addressable lock units per semaphore.
pub const LOCK_UNITS: libc::c_short = 10_000;

/// Index of the reader-writer counter in every semaphore set we create.
pub(crate) const SEM_RW: libc::c_ushort = 0;

const INIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[repr(C)]
#[derive(Clone, Copy)]
union Semun {
    val: libc::c_int,
    buf: *mut libc::semid_ds,
    array: *mut libc::c_ushort,
}

/// semop(2), transparently retrying waits interrupted by signal delivery.
pub(crate) fn semop_retry(semid: libc::c_int, ops: &mut [libc::sembuf]) -> io::Result<()> {
    loop {
        let rc = unsafe { libc::semop(semid, ops.as_mut_ptr(), ops.len()) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// Single-counter adjustment, `SEM_UNDO` and friends via `flags`.
pub(crate) fn sem_adjust(
    semid: libc::c_int,
    num: libc::c_ushort,
    delta: libc::c_short,
    flags: libc::c_short,
) -> io::Result<()> {
    let mut ops = [libc::sembuf {
        sem_num: num,
        sem_op: delta,
        sem_flg: flags,
    }];
    semop_retry(semid, &mut ops)
}

/// Blocks until the creating process has stamped `sem_otime` with its
/// first semop. Closes the race where a second opener could use a
/// semaphore the creator has not finished initializing. Unbounded wait,
/// by design.
pub(crate) fn wait_until_initialized(semid: libc::c_int) -> io::Result<()> {
    loop {
        let mut state = MaybeUninit::<libc::semid_ds>::zeroed();
        let arg = Semun {
            buf: state.as_mut_ptr(),
        };
        if unsafe { libc::semctl(semid, 0, libc::IPC_STAT, arg) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let state = unsafe { state.assume_init() };
        if state.sem_otime != 0 {
            return Ok(());
        }
        thread::sleep(INIT_POLL_INTERVAL);
    }
}

pub(crate) fn sem_set_all(semid: libc::c_int, values: &mut [libc::c_ushort]) -> io::Result<()> {
    let arg = Semun {
        array: values.as_mut_ptr(),
    };
    if unsafe { libc::semctl(semid, 0, libc::SETALL, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn sem_value(semid: libc::c_int, num: libc::c_int) -> io::Result<libc::c_int> {
    let value = unsafe { libc::semctl(semid, num, libc::GETVAL) };
    if value < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

pub(crate) fn sem_remove(semid: libc::c_int) -> io::Result<()> {
    if unsafe { libc::semctl(semid, 0, libc::IPC_RMID) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sem_set_group(semid: libc::c_int, gid: libc::gid_t) -> io::Result<()> {
    let mut state = MaybeUninit::<libc::semid_ds>::zeroed();
    let arg = Semun {
        buf: state.as_mut_ptr(),
    };
    if unsafe { libc::semctl(semid, 0, libc::IPC_STAT, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut state = unsafe { state.assume_init() };
    state.sem_perm.gid = gid;
    let arg = Semun { buf: &mut state };
    if unsafe { libc::semctl(semid, 0, libc::IPC_SET, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn undo() -> libc::c_short {
    libc::SEM_UNDO as libc::c_short
}

fn map_acquire_err(err: io::Error) -> StoreError {
    if err.raw_os_error() == Some(libc::EAGAIN) {
        StoreError::WouldBlock
    } else {
        StoreError::Resource(err)
    }
}

/// The recursive rwlock core. Reentrancy counters are handle-local and a
/// handle is owned by one logical caller at a time; sharing one handle
/// across threads is the caller's bug, not ours.
///
/// Invariant: at most one of `read_count`, `write_count` is positive.
#[derive(Debug)]
pub struct RwSem {
    semid: libc::c_int,
    read_count: u32,
    write_count: u32,
}

impl RwSem {
    pub(crate) fn from_raw(semid: libc::c_int) -> RwSem {
        RwSem {
            semid,
            read_count: 0,
            write_count: 0,
        }
    }

    pub(crate) fn semid(&self) -> libc::c_int {
        self.semid
    }

    pub fn read_held(&self) -> bool {
        self.read_count > 0
    }

    pub fn write_held(&self) -> bool {
        self.write_count > 0
    }

    /// Blocking shared acquisition. Reentrant within this handle.
    pub fn read_lock(&mut self) -> Result<(), StoreError> {
        self.acquire_read(0)
    }

    /// Non-blocking variant; `WouldBlock` instead of waiting. Callers
    /// needing bounded waits build retry loops on top of this.
    pub fn try_read_lock(&mut self) -> Result<(), StoreError> {
        self.acquire_read(libc::IPC_NOWAIT as libc::c_short)
    }

    fn acquire_read(&mut self, extra_flags: libc::c_short) -> Result<(), StoreError> {
        if self.write_count > 0 {
            return Err(StoreError::WriteLockHeld);
        }
        if self.read_count > 0 {
            self.read_count += 1;
            return Ok(());
        }
        sem_adjust(self.semid, SEM_RW, -1, undo() | extra_flags).map_err(map_acquire_err)?;
        self.read_count = 1;
        Ok(())
    }

    /// Blocking exclusive acquisition: draws all [`LOCK_UNITS`] at once,
    /// which only completes once no reader or other writer holds any.
    pub fn write_lock(&mut self) -> Result<(), StoreError> {
        self.acquire_write(0)
    }

    pub fn try_write_lock(&mut self) -> Result<(), StoreError> {
        self.acquire_write(libc::IPC_NOWAIT as libc::c_short)
    }

    fn acquire_write(&mut self, extra_flags: libc::c_short) -> Result<(), StoreError> {
        if self.read_count > 0 {
            return Err(StoreError::ReadLockHeld);
        }
        if self.write_count > 0 {
            self.write_count += 1;
            return Ok(());
        }
        sem_adjust(self.semid, SEM_RW, -LOCK_UNITS, undo() | extra_flags)
            .map_err(map_acquire_err)?;
        self.write_count = 1;
        Ok(())
    }

    /// Releases one level of reentrancy; the kernel units go back only
    /// when the last level is released.
    pub fn unlock(&mut self) -> Result<(), StoreError> {
        if self.read_count > 1 {
            self.read_count -= 1;
            return Ok(());
        }
        if self.write_count > 1 {
            self.write_count -= 1;
            return Ok(());
        }
        if self.read_count == 1 {
            sem_adjust(self.semid, SEM_RW, 1, undo()).map_err(StoreError::Resource)?;
            self.read_count = 0;
            return Ok(());
        }
        if self.write_count == 1 {
            sem_adjust(self.semid, SEM_RW, LOCK_UNITS, undo()).map_err(StoreError::Resource)?;
            self.write_count = 0;
            return Ok(());
        }
        Err(StoreError::LockNotHeld)
    }

    /// Collapses any reentrancy depth into a single release. No-op when
    /// nothing is held.
    pub fn unlock_all(&mut self) -> Result<(), StoreError> {
        let delta = self.held_units();
        if delta == 0 {
            return Ok(());
        }
        sem_adjust(self.semid, SEM_RW, delta, undo()).map_err(StoreError::Resource)?;
        self.read_count = 0;
        self.write_count = 0;
        Ok(())
    }

    /// Units this handle has actually drawn from the kernel. Reentrancy
    /// is local, so this is 0, 1, or all of them.
    pub(crate) fn held_units(&self) -> libc::c_short {
        if self.write_count > 0 {
            LOCK_UNITS
        } else if self.read_count > 0 {
            1
        } else {
            0
        }
    }

    /// Zeroes the counters after the kernel units were returned through a
    /// combined semop elsewhere (region detach/close).
    pub(crate) fn forget_held(&mut self) {
        self.read_count = 0;
        self.write_count = 0;
    }
}

/// Standalone recursive rwlock with explicit, caller-managed teardown:
/// created by whichever process wins the exclusive-create race, shared by
/// every later opener, destroyed only by [`SemLock::free`].
#[derive(Debug)]
pub struct SemLock {
    sem: RwSem,
}

impl SemLock {
    /// Opens (creating if necessary) the lock behind `key`. The creator
    /// optionally hands ownership to `group` and initializes the counter;
    /// losers of the creation race poll until that initialization is
    /// visible. Permissions only apply on the creation path.
    pub fn open(
        key: libc::key_t,
        group: Option<libc::gid_t>,
        perms: u32,
    ) -> Result<SemLock, StoreError> {
        let mode = perms as libc::c_int | libc::SHM_R | libc::SHM_W;
        let semid = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | mode) };
        if semid >= 0 {
            if let Err(err) = Self::initialize(semid, group) {
                let _ = sem_remove(semid);
                return Err(StoreError::Resource(err));
            }
            return Ok(SemLock {
                sem: RwSem::from_raw(semid),
            });
        }

        let semid = unsafe { libc::semget(key, 0, 0) };
        if semid < 0 {
            return Err(StoreError::Resource(io::Error::last_os_error()));
        }
        wait_until_initialized(semid).map_err(StoreError::Resource)?;
        Ok(SemLock {
            sem: RwSem::from_raw(semid),
        })
    }

    fn initialize(semid: libc::c_int, group: Option<libc::gid_t>) -> io::Result<()> {
        if let Some(gid) = group {
            sem_set_group(semid, gid)?;
        }
        let arg = Semun {
            val: LOCK_UNITS as libc::c_int,
        };
        if unsafe { libc::semctl(semid, SEM_RW as libc::c_int, libc::SETVAL, arg) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // Value-neutral pair whose only effect is the kernel stamping
        // sem_otime, the readiness signal concurrent openers poll for.
        let mut ops = [
            libc::sembuf {
                sem_num: SEM_RW,
                sem_op: -1,
                sem_flg: 0,
            },
            libc::sembuf {
                sem_num: SEM_RW,
                sem_op: 1,
                sem_flg: 0,
            },
        ];
        semop_retry(semid, &mut ops)
    }

    /// Destroys the underlying semaphore. No attach counting in this
    /// variant; the caller decides when everyone is done.
    pub fn free(self) -> Result<(), StoreError> {
        sem_remove(self.sem.semid()).map_err(StoreError::Destroy)
    }
}

impl std::ops::Deref for SemLock {
    type Target = RwSem;

    fn deref(&self) -> &RwSem {
        &self.sem
    }
}

impl std::ops::DerefMut for SemLock {
    fn deref_mut(&mut self) -> &mut RwSem {
        &mut self.sem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{EphemeralKeys, KeySource, KeyTag};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn fresh_key() -> libc::key_t {
        EphemeralKeys::new()
            .derive("lock-tests", KeyTag::LegacyLock)
            .unwrap()
    }

    #[test]
    fn reentrant_read_needs_matching_unlocks() {
        let key = fresh_key();
        let mut lock = SemLock::open(key, None, 0o600).unwrap();

        lock.read_lock().unwrap();
        lock.read_lock().unwrap();
        assert_eq!(sem_value(lock.semid(), 0).unwrap(), (LOCK_UNITS - 1).into());

        lock.unlock().unwrap();
        assert_eq!(sem_value(lock.semid(), 0).unwrap(), (LOCK_UNITS - 1).into());
        lock.unlock().unwrap();
        assert_eq!(sem_value(lock.semid(), 0).unwrap(), LOCK_UNITS.into());

        match lock.unlock() {
            Err(StoreError::LockNotHeld) => {}
            other => panic!("expected LockNotHeld, got {:?}", other),
        }
        lock.free().unwrap();
    }

    #[test]
    fn read_and_write_are_mutually_exclusive_within_a_handle() {
        let key = fresh_key();
        let mut lock = SemLock::open(key, None, 0o600).unwrap();

        lock.write_lock().unwrap();
        match lock.read_lock() {
            Err(StoreError::WriteLockHeld) => {}
            other => panic!("expected WriteLockHeld, got {:?}", other),
        }
        lock.unlock().unwrap();

        lock.read_lock().unwrap();
        match lock.write_lock() {
            Err(StoreError::ReadLockHeld) => {}
            other => panic!("expected ReadLockHeld, got {:?}", other),
        }
        lock.unlock().unwrap();
        lock.free().unwrap();
    }

    #[test]
    fn writer_blocks_other_handles() {
        let key = fresh_key();
        let mut writer = SemLock::open(key, None, 0o600).unwrap();
        let mut reader = SemLock::open(key, None, 0o600).unwrap();

        writer.write_lock().unwrap();
        match reader.try_read_lock() {
            Err(StoreError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }
        match reader.try_write_lock() {
            Err(StoreError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }

        writer.unlock().unwrap();
        reader.try_read_lock().unwrap();
        reader.unlock().unwrap();
        writer.free().unwrap();
    }

    #[test]
    fn blocking_reader_completes_after_writer_unlocks() {
        let key = fresh_key();
        let mut writer = SemLock::open(key, None, 0o600).unwrap();
        writer.write_lock().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired_in_thread = acquired.clone();
        let waiter = std::thread::spawn(move || {
            let mut reader = SemLock::open(key, None, 0o600).unwrap();
            reader.read_lock().unwrap();
            acquired_in_thread.store(true, Ordering::SeqCst);
            reader.unlock().unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        assert!(!acquired.load(Ordering::SeqCst));

        writer.unlock().unwrap();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        writer.free().unwrap();
    }

    #[test]
    fn unlock_all_collapses_reentrancy() {
        let key = fresh_key();
        let mut holder = SemLock::open(key, None, 0o600).unwrap();
        let mut other = SemLock::open(key, None, 0o600).unwrap();

        holder.write_lock().unwrap();
        holder.write_lock().unwrap();
        holder.unlock_all().unwrap();

        other.try_write_lock().unwrap();
        other.unlock().unwrap();
        holder.free().unwrap();
    }

    #[test]
    fn join_sees_initialized_semaphore() {
        let key = fresh_key();
        let creator = SemLock::open(key, None, 0o600).unwrap();
        let mut joiner = SemLock::open(key, None, 0o600).unwrap();
        joiner.read_lock().unwrap();
        joiner.unlock().unwrap();
        creator.free().unwrap();
    }
}
