//! Hosted backends for the platform seams.
//!
//! On bare metal the wait queue is driven by the kernel scheduler and the
//! fault-tolerant accesses by the trap dispatcher. On hosted targets those
//! collaborators do not exist, so this module provides stand-ins backed by
//! `std`: [`HostThreads`] maps park/unpark onto OS threads, and
//! [`AddressSpace`] gives a thread a synthetic memory map so fault paths
//! can be exercised without taking real faults.
//!
//! This is what the crate's own tests run on, and what host-side tooling
//! (simulators, fuzz drivers) links against.

use crate::sync::{ParkHandle, ThreadOps};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread, ThreadId};

pub use bedrock::mem::AddressSpace;

/// [`ThreadOps`] over `std` threads.
///
/// `park_current` registers the calling thread under a fresh token and
/// parks it; `unpark` spends the token. The park-token semantics of
/// [`std::thread::park`] give the contract the wait queue needs: an unpark
/// delivered between registration and suspension is not lost.
pub struct HostThreads {
    parked: Mutex<HashMap<u64, Thread>>,
    interrupted: Mutex<HashMap<ThreadId, Arc<AtomicBool>>>,
    next_token: AtomicU64,
}

impl HostThreads {
    /// Creates a fresh registry.
    pub fn new() -> Self {
        Self {
            parked: Mutex::new(HashMap::new()),
            interrupted: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
        }
    }

    /// Creates a registry with the `'static` lifetime a
    /// [`WaitQueue`](crate::sync::WaitQueue) requires.
    pub fn leaked() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    fn flag_for(&self, id: ThreadId) -> Arc<AtomicBool> {
        self.interrupted
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Marks the thread `target` as interrupted and wakes it if it is
    /// parked.
    ///
    /// The mark is observed by the thread's next
    /// [`take_interrupted`](ThreadOps::take_interrupted) and unwinds a
    /// pending `wait_until` with an interrupted failure.
    pub fn interrupt(&self, target: ThreadId) {
        self.flag_for(target).store(true, Ordering::SeqCst);
        let parked = self.parked.lock().unwrap();
        for thread in parked.values() {
            if thread.id() == target {
                thread.unpark();
            }
        }
    }
}

impl Default for HostThreads {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadOps for HostThreads {
    fn park_current(&self, register: &mut dyn FnMut(ParkHandle)) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.parked
            .lock()
            .unwrap()
            .insert(token, thread::current());
        register(ParkHandle::new(token));
        debug_assert!(
            !bedrock::interrupt::InterruptGuard::is_guarded(),
            "suspending with a spinlock held"
        );
        // A racing unpark has already set this thread's park token, in
        // which case park() returns immediately. Stale tokens from earlier
        // rounds surface as spurious wakeups, which wait_until absorbs.
        thread::park();
    }

    fn unpark(&self, handle: ParkHandle) {
        let thread = self.parked.lock().unwrap().remove(&handle.token());
        if let Some(thread) = thread {
            thread.unpark();
        }
    }

    fn retire(&self, handle: ParkHandle) {
        self.parked.lock().unwrap().remove(&handle.token());
    }

    fn take_interrupted(&self) -> bool {
        self.flag_for(thread::current().id())
            .swap(false, Ordering::SeqCst)
    }
}
