//! SMP-supported spinlock.
//!
//! On a single core, preventing preemption while a lock is held would be
//! enough; with multiple cores that no longer suffices, as other cores keep
//! running regardless. The lock state is therefore an atomic flag that a
//! core acquires with an atomic read-modify-write, spinning until the
//! transition from unlocked to locked succeeds.
//!
//! Acquisition also disables interrupts on the executing core for the
//! lifetime of the guard. That makes the lock safe to take from interrupt
//! and trap context: an interrupt handler on the same core can never run
//! while the lock is held, so it can never deadlock against its own core.
//! The flip side is that critical sections must stay short and must never
//! block; suspending with a spinlock held is a bug the rank checker's
//! cousin, the wait queue, is built to avoid.

use super::rank::{self, LockRank};
use bedrock::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// Each spinlock has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`], which guarantees that the data is only
/// ever accessed when the spinlock is held. The guard releases the lock and
/// restores the saved interrupt state when it goes out of scope, on every
/// exit path.
///
/// A lock constructed with [`ranked`] participates in deadlock detection:
/// in debug builds, acquiring it while holding a lock of equal or lower
/// [`LockRank`] halts the kernel with a diagnostic.
///
/// [`new`]: Self::new
/// [`ranked`]: Self::ranked
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use ksync::sync::{LockRank, SpinLock};
///
/// let stats = SpinLock::ranked(LockRank::Device, 0u64);
/// {
///     let mut guard = stats.lock();
///     *guard += 1;
///     // The lock is released when `guard` goes out of scope.
/// }
/// assert_eq!(*stats.lock(), 1);
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    rank: LockRank,
    _pad: [u8; 14],
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    ///
    /// The lock is excluded from rank tracking; use [`ranked`](Self::ranked)
    /// for locks whose ordering can be stated statically.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        Self::ranked(LockRank::None, t)
    }

    /// Creates a new spinlock carrying `rank` for deadlock detection.
    #[inline]
    pub const fn ranked(rank: LockRank, t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            rank,
            _pad: [0u8; 14],
            locked: AtomicBool::new(false),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, spinning until it is able to do so.
    ///
    /// Interrupts are disabled on the executing core before each
    /// acquisition attempt and stay disabled until the returned guard is
    /// dropped; between failed attempts the prior interrupt state is
    /// restored so pending interrupts can be serviced while the core backs
    /// off on a relaxed poll of the lock state.
    ///
    /// The behavior of locking a spinlock the executing core already holds
    /// is a deadlock by construction; for ranked locks the rank checker
    /// reports it in debug builds.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        let interrupts = loop {
            let interrupts = InterruptGuard::new();
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break interrupts;
            }
            drop(interrupts);

            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        };
        rank::track_acquire(self.rank);

        SpinLockGuard {
            lock: self,
            _interrupts: interrupts,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    ///
    /// If the spinlock is already held, returns [`WouldBlock`] and leaves
    /// the lock untouched.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let interrupts = InterruptGuard::new();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            rank::track_acquire(self.rank);
            Ok(SpinLockGuard {
                lock: self,
                _interrupts: interrupts,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Whether the lock is currently held by some core.
    ///
    /// Inherently racy: the answer can be stale by the time the caller
    /// looks at it. Diagnostics only, never correctness logic.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinLock<T> {
    /// Creates a `SpinLock<T>`, with the `Default` value for T.
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// A scoped acquisition of a [`SpinLock`].
///
/// The protected data is reached through this guard. Dropping the guard
/// releases the lock and then restores the interrupt state saved at
/// acquisition, so the unlock runs on every exit path from the critical
/// section, including early returns and propagated failures.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`SpinLock`].
///
/// [`lock`]: SpinLock::lock
/// [`try_lock`]: SpinLock::try_lock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    // Dropped after `Drop::drop` releases the lock; the saved interrupt
    // state is restored only once the lock is visibly free.
    _interrupts: InterruptGuard,
    _not_send: PhantomData<*mut ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        rank::track_release(self.lock.rank);
        self.lock.locked.store(false, Ordering::Release);
    }
}
