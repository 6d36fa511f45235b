//! Synchronization primitives.
//!
//! Two primitives cover the kernel's needs. The [`SpinLock`] protects short
//! critical sections (register pokes, list manipulation) and is the only
//! primitive safe to take from interrupt context; it busy-waits with
//! interrupts disabled on the executing core. The [`WaitQueue`] covers
//! longer waits such as I/O completion by suspending the thread
//! until a lock-protected predicate becomes true.
//!
//! The two compose: a wait queue is always paired with the spinlock that
//! protects the awaited state, and the notify side mutates that state under
//! the same lock before notifying. That shared lock is what makes "check
//! predicate, then sleep" atomic against "mutate, then notify", which is
//! the invariant that rules out lost wakeups.
//!
//! Deadlocks across different locks are caught in debug builds by the rank
//! order in [`LockRank`]: each lock is tagged at construction, and a core
//! may only acquire locks in strictly decreasing rank order.

mod rank;
mod spinlock;
mod waitqueue;

pub use rank::LockRank;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
pub use waitqueue::{Interrupted, ParkHandle, ThreadOps, WaitQueue};
