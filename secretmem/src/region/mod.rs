//! Attach-counted, dynamically resizable shared memory region.
//!
//! A region is one semaphore set (rw counter plus attach counter), one
//! fixed-size descriptor segment, and at most one data segment. The
//! descriptor is the single source of truth for the data segment's
//! identity; any id a handle has cached is a hint that must be
//! re-validated on every access, because a writer may have destroyed and
//! recreated the segment at a different size in between. That level of
//! indirection is what lets the region grow and shrink without ever
//! relocating its name or its lock.
//!
//! Attachments are counted by drawing units from the second semaphore.
//! `detach` hands the unit back and leaves everything alive; `close`
//! destroys the whole region iff the closer proves it is the last live
//! attachment. Both the registration and the rw units carry `SEM_UNDO`,
//! so a crashed process is unregistered by the kernel.

use std::io;
use std::mem;
use std::ptr;

use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::keys::{KeySource, KeyTag};
use crate::lock::{self, RwSem, LOCK_UNITS, SEM_RW};

/// Index of the live-attachment counter in the region's semaphore set.
const SEM_ATTACH: libc::c_ushort = 1;

const NO_SEGMENT: libc::c_int = -1;

/// Fixed-size segment holding only the identity and length of the
/// current data segment.
#[repr(C)]
struct Descriptor {
    data_id: libc::c_int,
    data_len: usize,
}

fn shm_mode(perms: libc::c_int) -> libc::c_int {
    perms | libc::SHM_R | libc::SHM_W
}

fn shm_attach(shmid: libc::c_int) -> io::Result<*mut u8> {
    let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as *mut u8)
}

fn shm_detach(addr: *mut u8) {
    if !addr.is_null() {
        unsafe {
            libc::shmdt(addr as *const libc::c_void);
        }
    }
}

fn shm_remove(shmid: libc::c_int) {
    unsafe {
        libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut());
    }
}

/// Best-effort pin against swapping; secrets should not hit swap. Needs
/// CAP_IPC_LOCK or a generous RLIMIT_MEMLOCK, so failure is survivable.
fn shm_pin(shmid: libc::c_int) {
    if unsafe { libc::shmctl(shmid, libc::SHM_LOCK, ptr::null_mut()) } != 0 {
        warn!(
            shmid,
            error = %io::Error::last_os_error(),
            "could not pin shared segment into memory"
        );
    }
}

fn undo() -> libc::c_short {
    libc::SEM_UNDO as libc::c_short
}

/// One process's handle on a shared region. Single-owner by design; the
/// raw-pointer fields keep it `!Send`, which is exactly the contract.
#[derive(Debug)]
pub struct Region {
    rw: RwSem,
    desc_id: libc::c_int,
    desc_ptr: *mut Descriptor,
    data_id: libc::c_int,
    data_ptr: *mut u8,
    perms: libc::c_int,
}

impl Region {
    /// Opens the region named by `name`, creating it if this process wins
    /// the exclusive-create race. `perms` applies only on creation.
    pub fn open<K: KeySource>(keys: &K, name: &str, perms: u32) -> Result<Region, StoreError> {
        let key_sem = keys.derive(name, KeyTag::RwLock)?;
        let key_desc = keys.derive(name, KeyTag::Descriptor)?;
        let perms = perms as libc::c_int;

        let semid = unsafe {
            libc::semget(key_sem, 2, libc::IPC_CREAT | libc::IPC_EXCL | shm_mode(perms))
        };
        if semid >= 0 {
            return Self::create(semid, key_desc, perms);
        }

        let semid = unsafe { libc::semget(key_sem, 0, 0) };
        if semid < 0 {
            return Err(StoreError::Resource(io::Error::last_os_error()));
        }
        Self::join(semid, key_desc, perms)
    }

    /// Creation path: this process owns initialization, and must destroy
    /// everything it managed to create if any later step fails, so that a
    /// losing opener never joins a half-built region.
    fn create(
        semid: libc::c_int,
        key_desc: libc::key_t,
        perms: libc::c_int,
    ) -> Result<Region, StoreError> {
        let desc_size = mem::size_of::<Descriptor>();
        // The descriptor segment may survive from an earlier incarnation
        // whose semaphore set was removed; adopt it in that case.
        let mut desc_id = unsafe {
            libc::shmget(
                key_desc,
                desc_size,
                libc::IPC_CREAT | libc::IPC_EXCL | shm_mode(perms),
            )
        };
        if desc_id < 0 {
            desc_id = unsafe { libc::shmget(key_desc, 0, 0) };
        }
        if desc_id < 0 {
            let err = io::Error::last_os_error();
            let _ = lock::sem_remove(semid);
            return Err(StoreError::Resource(err));
        }
        shm_pin(desc_id);

        let desc_ptr = match shm_attach(desc_id) {
            Ok(addr) => addr as *mut Descriptor,
            Err(err) => {
                shm_remove(desc_id);
                let _ = lock::sem_remove(semid);
                return Err(StoreError::Resource(err));
            }
        };
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*desc_ptr).data_id), NO_SEGMENT);
            ptr::write_volatile(ptr::addr_of_mut!((*desc_ptr).data_len), 0);
        }

        let mut counters = [LOCK_UNITS as libc::c_ushort, LOCK_UNITS as libc::c_ushort];
        let initialized = lock::sem_set_all(semid, &mut counters).and_then(|()| {
            // Registering the creator doubles as the readiness handshake:
            // this semop stamps sem_otime, which joiners poll for.
            lock::sem_adjust(semid, SEM_ATTACH, -1, undo())
        });
        if let Err(err) = initialized {
            shm_detach(desc_ptr as *mut u8);
            shm_remove(desc_id);
            let _ = lock::sem_remove(semid);
            return Err(StoreError::Resource(err));
        }

        debug!(semid, desc_id, "created shared region");
        Ok(Region {
            rw: RwSem::from_raw(semid),
            desc_id,
            desc_ptr,
            data_id: NO_SEGMENT,
            data_ptr: ptr::null_mut(),
            perms,
        })
    }

    /// Join path: wait out the creator's initialization, then attach and
    /// register under the write lock. The lock is required because the
    /// attachment count must not race another join or a concurrent close
    /// deciding whether it is the last one out.
    fn join(
        semid: libc::c_int,
        key_desc: libc::key_t,
        perms: libc::c_int,
    ) -> Result<Region, StoreError> {
        lock::wait_until_initialized(semid).map_err(StoreError::Resource)?;

        let mut rw = RwSem::from_raw(semid);
        rw.write_lock()?;
        let attached = (|| -> io::Result<(libc::c_int, *mut Descriptor)> {
            let desc_id = unsafe { libc::shmget(key_desc, 0, 0) };
            if desc_id < 0 {
                return Err(io::Error::last_os_error());
            }
            let desc_ptr = shm_attach(desc_id)? as *mut Descriptor;
            if let Err(err) = lock::sem_adjust(semid, SEM_ATTACH, -1, undo()) {
                shm_detach(desc_ptr as *mut u8);
                return Err(err);
            }
            Ok((desc_id, desc_ptr))
        })();
        let released = rw.unlock();

        let (desc_id, desc_ptr) = attached.map_err(StoreError::Resource)?;
        if let Err(err) = released {
            shm_detach(desc_ptr as *mut u8);
            return Err(err);
        }

        debug!(semid, desc_id, "joined shared region");
        Ok(Region {
            rw,
            desc_id,
            desc_ptr,
            data_id: NO_SEGMENT,
            data_ptr: ptr::null_mut(),
            perms,
        })
    }

    pub fn read_lock(&mut self) -> Result<(), StoreError> {
        self.rw.read_lock()
    }

    pub fn try_read_lock(&mut self) -> Result<(), StoreError> {
        self.rw.try_read_lock()
    }

    pub fn write_lock(&mut self) -> Result<(), StoreError> {
        self.rw.write_lock()
    }

    pub fn try_write_lock(&mut self) -> Result<(), StoreError> {
        self.rw.try_write_lock()
    }

    pub fn unlock(&mut self) -> Result<(), StoreError> {
        self.rw.unlock()
    }

    pub fn unlock_all(&mut self) -> Result<(), StoreError> {
        self.rw.unlock_all()
    }

    pub fn read_held(&self) -> bool {
        self.rw.read_held()
    }

    pub fn write_held(&self) -> bool {
        self.rw.write_held()
    }

    fn locked(&self) -> bool {
        self.rw.read_held() || self.rw.write_held()
    }

    fn descriptor_len(&self) -> usize {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.desc_ptr).data_len)) }
    }

    fn descriptor_id(&self) -> libc::c_int {
        unsafe { ptr::read_volatile(ptr::addr_of!((*self.desc_ptr).data_id)) }
    }

    fn set_descriptor(&mut self, data_id: libc::c_int, data_len: usize) {
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*self.desc_ptr).data_id), data_id);
            ptr::write_volatile(ptr::addr_of_mut!((*self.desc_ptr).data_len), data_len);
        }
    }

    /// Replaces the data segment with a fresh one of `new_len` bytes.
    /// Content is not preserved. Requires the write lock.
    ///
    /// The descriptor reference is nulled before the old segment is
    /// destroyed and before the new one is created; a crash in that
    /// window leaves an empty store rather than a dangling id. The window
    /// itself (a logically incomplete write surviving as "no data") is a
    /// known, inherited property of this sequence.
    pub fn resize(&mut self, new_len: usize) -> Result<(), StoreError> {
        if !self.rw.write_held() || self.desc_ptr.is_null() {
            return Err(StoreError::InvalidState);
        }
        if new_len == self.descriptor_len() {
            return Ok(());
        }

        let old_id = self.descriptor_id();
        self.set_descriptor(NO_SEGMENT, 0);
        if old_id != NO_SEGMENT {
            shm_remove(old_id);
        }
        if new_len == 0 {
            return Ok(());
        }

        let new_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                new_len,
                libc::IPC_CREAT | libc::IPC_EXCL | shm_mode(self.perms),
            )
        };
        if new_id < 0 {
            return Err(StoreError::Resize(io::Error::last_os_error()));
        }
        self.set_descriptor(new_id, new_len);
        shm_pin(new_id);
        Ok(())
    }

    /// Like [`Region::resize`] but preserves content up to
    /// `min(old, new)` bytes, attaching the outgoing segment one extra
    /// time purely to copy out of it before it is destroyed. The copy is
    /// best-effort, as is destroying the old segment afterwards.
    pub fn resize_and_copy(&mut self, new_len: usize) -> Result<(), StoreError> {
        if !self.rw.write_held() || self.desc_ptr.is_null() {
            return Err(StoreError::InvalidState);
        }
        let old_len = self.descriptor_len();
        if new_len == old_len {
            return Ok(());
        }

        let old_id = self.descriptor_id();
        self.set_descriptor(NO_SEGMENT, 0);

        let mut outcome = Ok(());
        if new_len > 0 {
            let new_id = unsafe {
                libc::shmget(
                    libc::IPC_PRIVATE,
                    new_len,
                    libc::IPC_CREAT | libc::IPC_EXCL | shm_mode(self.perms),
                )
            };
            if new_id < 0 {
                outcome = Err(StoreError::Resize(io::Error::last_os_error()));
            } else {
                self.set_descriptor(new_id, new_len);
                shm_pin(new_id);
            }
        }

        if old_id != NO_SEGMENT {
            if let Ok(old_ptr) = shm_attach(old_id) {
                if old_len > 0 && outcome.is_ok() && new_len > 0 {
                    if let Ok(new_ptr) = self.current_ptr() {
                        if !new_ptr.is_null() {
                            unsafe {
                                ptr::copy_nonoverlapping(
                                    old_ptr,
                                    new_ptr,
                                    old_len.min(new_len),
                                );
                            }
                        }
                    }
                }
                shm_detach(old_ptr);
            }
            shm_remove(old_id);
        }
        outcome
    }

    /// Length of the current data buffer. Valid only under a lock.
    pub fn current_len(&mut self) -> Result<usize, StoreError> {
        if !self.locked() || self.desc_ptr.is_null() {
            return Err(StoreError::InvalidState);
        }
        Ok(self.descriptor_len())
    }

    /// Resolves the current data segment, re-attaching if a writer
    /// swapped it since this handle last looked. Null when the region
    /// holds no data. Valid only under a lock, and never to be cached
    /// across a lock release.
    pub fn current_ptr(&mut self) -> Result<*mut u8, StoreError> {
        if !self.locked() || self.desc_ptr.is_null() {
            return Err(StoreError::InvalidState);
        }
        let current_id = self.descriptor_id();
        if current_id == self.data_id {
            return Ok(self.data_ptr);
        }

        shm_detach(self.data_ptr);
        self.data_ptr = ptr::null_mut();
        self.data_id = NO_SEGMENT;

        if current_id == NO_SEGMENT {
            return Ok(ptr::null_mut());
        }
        let addr = shm_attach(current_id).map_err(StoreError::Resource)?;
        self.data_id = current_id;
        self.data_ptr = addr;
        Ok(addr)
    }

    /// Copies the whole current buffer out. Empty region yields an empty
    /// vector.
    pub fn copy_out(&mut self) -> Result<Vec<u8>, StoreError> {
        let len = self.current_len()?;
        let src = self.current_ptr()?;
        if len > 0 && src.is_null() {
            return Err(StoreError::Corrupted(
                "descriptor declares data but names no segment".into(),
            ));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| StoreError::Allocation)?;
        if len > 0 {
            unsafe {
                ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len);
                buf.set_len(len);
            }
        }
        Ok(buf)
    }

    /// Copies `bytes` over the whole current buffer; the region must
    /// already be sized to match (see [`Region::resize`]). Requires the
    /// write lock.
    pub fn copy_in(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if !self.rw.write_held() {
            return Err(StoreError::InvalidState);
        }
        if self.current_len()? != bytes.len() {
            return Err(StoreError::InvalidState);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let dst = self.current_ptr()?;
        if dst.is_null() {
            return Err(StoreError::Corrupted(
                "descriptor declares data but names no segment".into(),
            ));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    fn release_mappings(&mut self) {
        shm_detach(self.desc_ptr as *mut u8);
        self.desc_ptr = ptr::null_mut();
        shm_detach(self.data_ptr);
        self.data_ptr = ptr::null_mut();
        self.data_id = NO_SEGMENT;
    }

    /// Unregisters this handle, returning any lock units it still holds
    /// in the same atomic semop, then drops its mappings. The region
    /// itself stays alive for the other attachments.
    pub fn detach(mut self) -> Result<(), StoreError> {
        let held = self.rw.held_units();
        let mut ops = [
            libc::sembuf {
                sem_num: SEM_ATTACH,
                sem_op: 1,
                sem_flg: undo(),
            },
            libc::sembuf {
                sem_num: SEM_RW,
                sem_op: held,
                sem_flg: undo(),
            },
        ];
        let op_count = if held == 0 { 1 } else { 2 };
        let result = lock::semop_retry(self.rw.semid(), &mut ops[..op_count])
            .map_err(StoreError::Resource);
        self.rw.forget_held();
        self.release_mappings();
        result
    }

    /// Detaches and, when this handle is the last live attachment,
    /// destroys the data segment, the descriptor segment, and the
    /// semaphore set. The check runs under a full exclusive hold so it
    /// cannot race a concurrent join or close.
    pub fn close(mut self) -> Result<(), StoreError> {
        // Callers may close while still holding a lock: top the hold up
        // to a full write acquisition instead of acquiring from zero.
        if !self.rw.write_held() {
            let needed = LOCK_UNITS - libc::c_short::from(self.rw.read_held());
            if let Err(err) = lock::sem_adjust(self.rw.semid(), SEM_RW, -needed, undo()) {
                // Most likely EIDRM: whoever removed the set was obliged
                // to remove the segments with it.
                self.rw.forget_held();
                self.release_mappings();
                return Err(StoreError::Destroy(err));
            }
        }

        let semid = self.rw.semid();
        let result = match lock::sem_value(semid, SEM_ATTACH as libc::c_int) {
            Ok(live) if live == libc::c_int::from(LOCK_UNITS) - 1 => {
                // Sole live attachment: tear the whole region down.
                let data_id = self.descriptor_id();
                if data_id != NO_SEGMENT {
                    shm_remove(data_id);
                }
                shm_remove(self.desc_id);
                let removed = lock::sem_remove(semid).map_err(StoreError::Destroy);
                debug!(semid, desc_id = self.desc_id, "destroyed shared region");
                removed
            }
            Ok(_) => {
                let mut ops = [
                    libc::sembuf {
                        sem_num: SEM_ATTACH,
                        sem_op: 1,
                        sem_flg: undo(),
                    },
                    libc::sembuf {
                        sem_num: SEM_RW,
                        sem_op: LOCK_UNITS,
                        sem_flg: undo(),
                    },
                ];
                lock::semop_retry(semid, &mut ops).map_err(StoreError::Resource)
            }
            Err(err) => Err(StoreError::Destroy(err)),
        };
        self.rw.forget_held();
        self.release_mappings();
        result
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // Mapping hygiene only. Semaphore bookkeeping belongs to detach
        // and close; for a handle leaked past both, the kernel's undo
        // squares the counters at process exit.
        self.release_mappings();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::EphemeralKeys;

    const NAME: &str = "region-tests";
    const PERMS: u32 = 0o600;

    fn semaphore_exists(keys: &EphemeralKeys) -> bool {
        let key = keys.derive(NAME, KeyTag::RwLock).unwrap();
        unsafe { libc::semget(key, 0, 0) >= 0 }
    }

    #[test]
    fn resize_requires_write_lock() {
        let keys = EphemeralKeys::new();
        let mut region = Region::open(&keys, NAME, PERMS).unwrap();

        match region.resize(16) {
            Err(StoreError::InvalidState) => {}
            other => panic!("expected InvalidState, got {:?}", other),
        }
        region.read_lock().unwrap();
        match region.resize(16) {
            Err(StoreError::InvalidState) => {}
            other => panic!("expected InvalidState, got {:?}", other),
        }
        region.unlock().unwrap();
        region.close().unwrap();
    }

    #[test]
    fn buffer_round_trips_through_the_region() {
        let keys = EphemeralKeys::new();
        let mut region = Region::open(&keys, NAME, PERMS).unwrap();

        region.write_lock().unwrap();
        assert_eq!(region.current_len().unwrap(), 0);
        region.resize(5).unwrap();
        region.copy_in(b"hello").unwrap();
        assert_eq!(region.copy_out().unwrap(), b"hello");
        region.unlock().unwrap();

        region.read_lock().unwrap();
        assert_eq!(region.copy_out().unwrap(), b"hello");
        region.unlock().unwrap();
        region.close().unwrap();
    }

    #[test]
    fn resize_discards_but_resize_and_copy_preserves() {
        let keys = EphemeralKeys::new();
        let mut region = Region::open(&keys, NAME, PERMS).unwrap();

        region.write_lock().unwrap();
        region.resize(4).unwrap();
        region.copy_in(b"data").unwrap();

        region.resize_and_copy(16).unwrap();
        assert_eq!(region.current_len().unwrap(), 16);
        let grown = region.copy_out().unwrap();
        assert_eq!(&grown[..4], b"data");

        region.resize_and_copy(2).unwrap();
        assert_eq!(region.copy_out().unwrap(), b"da");

        region.resize(8).unwrap();
        let fresh_len = region.current_len().unwrap();
        assert_eq!(fresh_len, 8);
        region.unlock().unwrap();
        region.close().unwrap();
    }

    #[test]
    fn second_handle_reattaches_after_resize() {
        let keys = EphemeralKeys::new();
        let mut writer = Region::open(&keys, NAME, PERMS).unwrap();
        let mut reader = Region::open(&keys, NAME, PERMS).unwrap();

        writer.write_lock().unwrap();
        writer.resize(3).unwrap();
        writer.copy_in(b"one").unwrap();
        writer.unlock().unwrap();

        reader.read_lock().unwrap();
        assert_eq!(reader.copy_out().unwrap(), b"one");
        reader.unlock().unwrap();

        // Writer replaces the segment entirely; the reader's cached
        // attachment is now stale and must be re-resolved under the next
        // lock acquisition.
        writer.write_lock().unwrap();
        writer.resize(5).unwrap();
        writer.copy_in(b"two!!").unwrap();
        writer.unlock().unwrap();

        reader.read_lock().unwrap();
        assert_eq!(reader.copy_out().unwrap(), b"two!!");
        reader.unlock().unwrap();

        reader.detach().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn non_blocking_acquisition_reports_would_block() {
        let keys = EphemeralKeys::new();
        let mut writer = Region::open(&keys, NAME, PERMS).unwrap();
        let mut reader = Region::open(&keys, NAME, PERMS).unwrap();

        writer.write_lock().unwrap();
        match reader.try_read_lock() {
            Err(StoreError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }
        writer.unlock().unwrap();

        reader.try_read_lock().unwrap();
        match writer.try_write_lock() {
            Err(StoreError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }
        reader.unlock().unwrap();

        reader.detach().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn last_close_destroys_earlier_closes_do_not() {
        let keys = EphemeralKeys::new();
        let mut first = Region::open(&keys, NAME, PERMS).unwrap();
        let second = Region::open(&keys, NAME, PERMS).unwrap();
        let third = Region::open(&keys, NAME, PERMS).unwrap();

        first.write_lock().unwrap();
        first.resize(4).unwrap();
        first.copy_in(b"live").unwrap();
        first.unlock().unwrap();

        second.close().unwrap();
        assert!(semaphore_exists(&keys));

        // A fresh open joins the still-live region instead of recreating
        // it: the content written above is still there.
        let mut late = Region::open(&keys, NAME, PERMS).unwrap();
        late.read_lock().unwrap();
        assert_eq!(late.copy_out().unwrap(), b"live");
        late.unlock().unwrap();
        late.detach().unwrap();

        third.close().unwrap();
        assert!(semaphore_exists(&keys));

        first.close().unwrap();
        assert!(!semaphore_exists(&keys));
    }

    #[test]
    fn close_while_holding_a_lock_still_works() {
        let keys = EphemeralKeys::new();
        let mut only = Region::open(&keys, NAME, PERMS).unwrap();
        only.write_lock().unwrap();
        only.close().unwrap();
        assert!(!semaphore_exists(&keys));

        let mut again = Region::open(&keys, NAME, PERMS).unwrap();
        again.read_lock().unwrap();
        again.close().unwrap();
        assert!(!semaphore_exists(&keys));
    }
}
