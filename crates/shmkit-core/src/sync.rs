//! Process-shared mutual exclusion
//!
//! [`RawSharedMutex`] is a single atomic word placed inside a shared header.
//! Every process that maps the header contends on the same word. Waiters
//! spin briefly, then park on the word with a futex (non-private, so wakes
//! cross process boundaries).
//!
//! The lock is not robust: if a process dies while holding it the word stays
//! locked and every other attached process blocks forever on that structure.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Locked, and at least one waiter may be parked.
const CONTENDED: u32 = 2;

/// Spins before parking.
const SPIN_LIMIT: u32 = 64;

/// Lock word stored in shared memory. Zeroed memory is a valid unlocked mutex.
#[repr(C)]
pub struct RawSharedMutex {
    state: AtomicU32,
}

impl RawSharedMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Reset to unlocked. Only valid while no other process can see the word.
    pub fn init(&mut self) {
        self.state = AtomicU32::new(UNLOCKED);
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> SharedMutexGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        SharedMutexGuard { mutex: self }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins = 0;
        while spins < SPIN_LIMIT {
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            spins += 1;
            spin_loop();
        }

        // From here on we may sleep, so the holder must know to wake us.
        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            futex_wait(&self.state, CONTENDED);
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<SharedMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SharedMutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake_one(&self.state);
        }
    }
}

impl Default for RawSharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard releasing a [`RawSharedMutex`] on drop.
pub struct SharedMutexGuard<'a> {
    mutex: &'a RawSharedMutex,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Sleep while `*word == expected`. Spurious returns are fine; callers loop.
#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32) {
    // No FUTEX_PRIVATE_FLAG: the word lives in memory shared across processes.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_one(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            1u32,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32) {
    if word.load(Ordering::Relaxed) == expected {
        std::thread::yield_now();
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_one(_word: &AtomicU32) {}
