//! Lock ranks and the per-core held-rank stack.
//!
//! Every [`SpinLock`](super::SpinLock) carries a [`LockRank`] assigned at
//! construction. A core holding a lock of some rank may only acquire
//! further locks of strictly lower rank; acquiring upward is the shape
//! every lock-order deadlock has, so it is treated as a fatal programming
//! error, not a recoverable condition. The check runs in debug builds and
//! compiles out of release builds.
//!
//! Ranks order the kernel's subsystems from outermost to innermost:
//! a device driver (rank [`Device`](LockRank::Device)) may take memory
//! manager locks, which may take process locks, and so on down to the wait
//! queue's internal list lock, which is always the last lock taken.
//! [`LockRank::None`] opts a lock out of tracking entirely, for locks whose
//! usage cannot be ordered statically.

#[cfg(debug_assertions)]
use arrayvec::ArrayVec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Deadlock-avoidance rank of a [`SpinLock`](super::SpinLock).
///
/// Ordered totally; locks must be acquired in strictly decreasing rank
/// order on each core.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum LockRank {
    /// Excluded from rank tracking.
    None = 0,
    /// A wait queue's internal waiter list; the innermost lock in the
    /// kernel, taken while the waited-on state's lock is still held.
    WaitQueue = 1,
    /// Per-thread state.
    Thread = 2,
    /// Per-process state.
    Process = 3,
    /// Memory-manager state.
    MemoryManager = 4,
    /// Device and driver state; the outermost rank.
    Device = 5,
}

/// Depth of the held-rank stack; deeper nesting than this is a bug in its
/// own right.
#[cfg(debug_assertions)]
const MAX_HELD: usize = 16;

#[cfg(all(debug_assertions, target_os = "none"))]
mod storage {
    use super::{ArrayVec, MAX_HELD};
    use bedrock::MAX_CPU;
    use core::cell::UnsafeCell;
    use crossbeam_utils::CachePadded;

    struct HeldRanks(UnsafeCell<ArrayVec<u8, MAX_HELD>>);

    // Each slot is only touched by its own core, with interrupts disabled
    // (rank tracking runs inside the spinlock's interrupt guard).
    unsafe impl Sync for HeldRanks {}

    static HELD: [CachePadded<HeldRanks>; MAX_CPU] =
        [const { CachePadded::new(HeldRanks(UnsafeCell::new(ArrayVec::new_const()))) }; MAX_CPU];

    pub(super) fn with_held<R>(f: impl FnOnce(&mut ArrayVec<u8, MAX_HELD>) -> R) -> R {
        let slot = &HELD[bedrock::cpu::id()];
        f(unsafe { &mut *slot.0.get() })
    }
}

#[cfg(all(debug_assertions, not(target_os = "none")))]
mod storage {
    use super::{ArrayVec, MAX_HELD};
    use core::cell::RefCell;

    std::thread_local! {
        static HELD: RefCell<ArrayVec<u8, MAX_HELD>> =
            const { RefCell::new(ArrayVec::new_const()) };
    }

    pub(super) fn with_held<R>(f: impl FnOnce(&mut ArrayVec<u8, MAX_HELD>) -> R) -> R {
        HELD.with(|held| f(&mut held.borrow_mut()))
    }
}

/// Records `rank` as held by the executing core, after validating it
/// against every rank already held.
#[cfg(debug_assertions)]
pub(super) fn track_acquire(rank: LockRank) {
    if rank == LockRank::None {
        return;
    }
    storage::with_held(|held| {
        if let Some(&top) = held.last() {
            let top = LockRank::try_from(top).expect("corrupt held-rank stack");
            if rank >= top {
                panic!("lock rank violation: acquiring {rank:?} while holding {top:?}");
            }
        }
        held.try_push(rank.into())
            .expect("held-rank stack overflow");
    });
}

/// Pops `rank` off the executing core's held-rank stack; releases must be
/// in reverse acquisition order.
#[cfg(debug_assertions)]
pub(super) fn track_release(rank: LockRank) {
    if rank == LockRank::None {
        return;
    }
    storage::with_held(|held| {
        let top = held.pop().expect("released a rank that was never acquired");
        let top = LockRank::try_from(top).expect("corrupt held-rank stack");
        assert!(
            top == rank,
            "out-of-order rank release: releasing {rank:?} but {top:?} is on top"
        );
    });
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub(super) fn track_acquire(_rank: LockRank) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub(super) fn track_release(_rank: LockRank) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decreasing_order_is_accepted() {
        track_acquire(LockRank::Device);
        track_acquire(LockRank::Process);
        track_acquire(LockRank::WaitQueue);
        track_release(LockRank::WaitQueue);
        track_release(LockRank::Process);
        track_release(LockRank::Device);
    }

    #[test]
    fn untracked_rank_is_ignored() {
        track_acquire(LockRank::Thread);
        // A None acquisition between tracked ones never trips the check.
        track_acquire(LockRank::None);
        track_acquire(LockRank::WaitQueue);
        track_release(LockRank::WaitQueue);
        track_release(LockRank::None);
        track_release(LockRank::Thread);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock rank violation")]
    fn increasing_order_is_fatal() {
        track_acquire(LockRank::Process);
        track_acquire(LockRank::MemoryManager);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "lock rank violation")]
    fn equal_rank_is_fatal() {
        track_acquire(LockRank::Process);
        track_acquire(LockRank::Process);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "out-of-order rank release")]
    fn lifo_release_is_enforced() {
        track_acquire(LockRank::Device);
        track_acquire(LockRank::Thread);
        track_release(LockRank::Device);
    }
}
