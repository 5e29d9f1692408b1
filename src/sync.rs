use crate::error::VidmemResult;
use std::cell::UnsafeCell;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A process-shared mutex (`PTHREAD_PROCESS_SHARED`).
///
/// The mutex lives in its own heap allocation so its address never changes after
/// `pthread_mutex_init`. Acquisition and release are explicit; scoping is done by
/// the manager guard that owns the critical section.
pub struct SharedLock {
    mutex: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

impl std::fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLock").finish_non_exhaustive()
    }
}

impl SharedLock {
    /// Initializes a new process-shared mutex.
    ///
    /// # Errors
    /// Returns the OS error if the attribute or mutex initialization fails.
    pub fn new() -> VidmemResult<Self> {
        // pthread_mutex_t is a plain C struct; all-zero is a valid pre-init state.
        let mutex = Box::new(UnsafeCell::new(unsafe {
            std::mem::zeroed::<libc::pthread_mutex_t>()
        }));

        unsafe {
            let mut attr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

            let ret = libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            if ret != 0 {
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                return Err(io::Error::from_raw_os_error(ret).into());
            }

            let ret = libc::pthread_mutex_init(mutex.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            check(ret)?;
        }

        Ok(Self { mutex })
    }

    /// Blocks until the mutex is held by the caller.
    pub(crate) fn acquire(&self) -> VidmemResult<()> {
        check(unsafe { libc::pthread_mutex_lock(self.mutex.get()) })
    }

    /// Releases a mutex previously taken with [`SharedLock::acquire`].
    pub(crate) fn release(&self) {
        let ret = unsafe { libc::pthread_mutex_unlock(self.mutex.get()) };
        if ret != 0 {
            log::error!(
                "SharedLock: unlock failed: {}",
                io::Error::from_raw_os_error(ret)
            );
        }
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.mutex.get());
        }
    }
}

fn check(ret: libc::c_int) -> VidmemResult<()> {
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret).into());
    }
    Ok(())
}

/// Software lock count of a buffer's video placement.
///
/// Clients hold a clone and take locks through it without going through the
/// manager lock; `deallocate` waits (bounded) for the count to drop to zero and
/// the eviction scan skips locked buffers.
#[derive(Debug, Clone, Default)]
pub struct SoftwareLock(Arc<AtomicU32>);

impl SoftwareLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one software lock; it is released when the guard drops.
    #[must_use]
    pub fn acquire(&self) -> SoftwareLockGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        SoftwareLockGuard(self.0.clone())
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.count() != 0
    }
}

/// One held software lock.
#[derive(Debug)]
pub struct SoftwareLockGuard(Arc<AtomicU32>);

impl Drop for SoftwareLockGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
