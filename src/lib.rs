//! # ksync: the kernel's concurrency and fault-tolerant memory core.
//!
//! Every driver and manager in the kernel is built from the same small set
//! of primitives, and this crate is where they live:
//!
//! - [`sync::SpinLock`]: interrupt-safe busy-wait mutual exclusion for
//!   short critical sections, validated against the lock-rank order in
//!   debug builds.
//! - [`sync::WaitQueue`]: the blocking primitive that suspends a thread
//!   until a lock-protected predicate becomes true, with `notify_one` /
//!   `notify_all` wakeups and an interrupted-failure unwind path.
//! - [`safemem`]: copies, fills, string scans, and atomics over memory
//!   whose validity the kernel cannot prove, turning faults into
//!   recoverable results instead of panics.
//! - [`time::TimePage`]: a lock-free, single-writer published time payload
//!   readable from any number of cores (and from a read-only user mapping)
//!   without taking a lock.
//!
//! The scheduler, memory manager, and trap table are collaborators, not
//! residents: the wait queue reaches the scheduler through the
//! [`sync::ThreadOps`] trait it is given at construction, and the platform's
//! trap dispatcher reaches the fault-recovery machinery through
//! [`safemem::handle_safe_access_fault`].
//!
//! ## Locking discipline
//!
//! A spinlock disables interrupts on the executing core for as long as it
//! is held, so critical sections must stay short and must never block; the
//! one suspension point in this crate is [`sync::WaitQueue::wait_until`],
//! which always releases the associated lock before yielding and reacquires
//! it before re-checking the predicate. Cross-lock deadlocks are caught in
//! debug builds by the rank order described in [`sync::LockRank`].

#![cfg_attr(target_os = "none", no_std)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

extern crate alloc;

pub mod safemem;
pub mod sync;
pub mod time;

#[cfg(not(target_os = "none"))]
pub mod hosted;

pub use bedrock::interrupt::{InterruptGuard, InterruptState, PageFaultCode, TrapState};
pub use bedrock::{MAX_CPU, debug, info, print, println, warning};

/// Enum representing errors this core can hand back to a caller.
///
/// Only recoverable conditions are represented as values: a bad address
/// discovered by a fault-tolerant access, an interrupted wait, and a lock
/// that could not be taken without blocking. Everything else (rank
/// violations, faults on direct accesses) is a programming error and stops
/// the kernel instead of becoming a value.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// Bad address. (EFAULT)
    BadAddress,
    /// Interrupted call. (EINTR)
    Interrupted,
    /// Device or resource busy. (EBUSY)
    Busy,
}

impl KernelError {
    /// Converts the [`KernelError`] into its errno value, cast to `usize`
    /// for use as a system-call return value.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::Interrupted => -4isize,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
        }) as usize
    }
}

/// The given `isize` does not indicate a [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -4 => Ok(Self::Interrupted),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            e => Err(TryFromError { e }),
        }
    }
}

impl From<safemem::Fault> for KernelError {
    fn from(_: safemem::Fault) -> Self {
        KernelError::BadAddress
    }
}

impl From<sync::Interrupted> for KernelError {
    fn from(_: sync::Interrupted) -> Self {
        KernelError::Interrupted
    }
}

impl From<sync::WouldBlock> for KernelError {
    fn from(_: sync::WouldBlock) -> Self {
        KernelError::Busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        for e in [
            KernelError::BadAddress,
            KernelError::Interrupted,
            KernelError::Busy,
        ] {
            let raw = e.into_usize() as isize;
            assert_eq!(KernelError::try_from(raw), Ok(e));
        }
        assert!(KernelError::try_from(-1).is_err());
    }

    #[test]
    fn component_errors_convert() {
        assert_eq!(
            KernelError::from(safemem::Fault { address: 0x1000 }),
            KernelError::BadAddress
        );
        assert_eq!(
            KernelError::from(sync::Interrupted),
            KernelError::Interrupted
        );
    }
}
