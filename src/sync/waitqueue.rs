//! # Wait queue.
//!
//! A **wait queue** lets a thread block until a condition over
//! lock-protected state becomes true, without consuming CPU cycles. It is
//! always used together with the [`SpinLock`] that guards the awaited
//! state: the waiter checks the predicate under the lock, and the notifier
//! mutates the state under the same lock before notifying. Because the
//! waiter registers itself in the queue *before* releasing that lock, a
//! notification can never slip between "predicate checked false" and
//! "waiter visible in the queue", the ordering that would otherwise lose
//! the wakeup.
//!
//! Notification only makes woken threads runnable; it does not evaluate or
//! transfer the predicate. A woken waiter reacquires the lock and re-checks
//! the predicate in a loop, so spurious wakeups and overtaken predicates
//! are handled by construction.
//!
//! The scheduler stays opaque to this module. It is reached through the
//! [`ThreadOps`] trait handed to [`WaitQueue::new`]: "take the current
//! thread off the run queue", "put this thread back", and "has the current
//! thread been interrupted". An interrupted waiter unwinds with
//! [`Interrupted`] instead of blocking indefinitely.

use super::spinlock::SpinLock;
use super::rank::LockRank;
use alloc::collections::vec_deque::VecDeque;

/// A token for a thread the scheduler has taken off the run queue.
///
/// Minted by [`ThreadOps::park_current`] and spent by
/// [`ThreadOps::unpark`]; the queue stores it but never interprets it.
#[derive(Debug, PartialEq, Eq)]
pub struct ParkHandle(u64);

impl ParkHandle {
    /// Wraps a scheduler-chosen token.
    pub fn new(token: u64) -> Self {
        Self(token)
    }

    /// The scheduler-chosen token behind this handle.
    pub fn token(&self) -> u64 {
        self.0
    }
}

/// The scheduler operations the wait queue is built on.
///
/// Implementations live with the scheduler; the queue receives one at
/// construction and never reaches for a global.
pub trait ThreadOps: Send + Sync {
    /// Takes the current thread off the run queue and suspends it.
    ///
    /// `register` is called exactly once with the wake handle for the
    /// current thread *before* the suspension takes effect; the queue uses
    /// the callback to publish the handle while still holding the lock that
    /// guards the awaited state. An [`unpark`](Self::unpark) that lands
    /// between registration and suspension must win: the thread resumes
    /// immediately instead of sleeping through its wakeup.
    ///
    /// Must only be called from thread context with no spinlock held at the
    /// point of suspension; the registration callback itself runs before
    /// that point and may hold locks.
    fn park_current(&self, register: &mut dyn FnMut(ParkHandle));

    /// Puts the thread behind `handle` back on the run queue.
    fn unpark(&self, handle: ParkHandle);

    /// Discards a registration that will never be woken.
    ///
    /// Called when a waiter withdraws its own handle (on re-check, wake, or
    /// interruption); the default just drops the token.
    fn retire(&self, handle: ParkHandle) {
        let _ = handle;
    }

    /// Takes and clears the current thread's interruption flag.
    fn take_interrupted(&self) -> bool;
}

/// The calling thread was asynchronously interrupted before the awaited
/// condition became true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

struct Waiter {
    ticket: u64,
    handle: ParkHandle,
}

#[derive(Default)]
struct Waiters {
    list: VecDeque<Waiter>,
    next_ticket: u64,
}

/// A queue of threads blocked on a lock-protected condition.
///
/// Long-lived: embedded in whatever resource threads block on (a device,
/// a teletype, a channel). The queue owns its list of registered waiters
/// behind an internal spinlock of rank [`LockRank::WaitQueue`], the lowest
/// rank, so the list can be locked while the resource's own lock is held.
///
/// # Examples
///
/// ```
/// use ksync::hosted::HostThreads;
/// use ksync::sync::{LockRank, SpinLock, WaitQueue};
///
/// let threads = HostThreads::leaked();
/// let ready = SpinLock::ranked(LockRank::Device, false);
/// let queue = WaitQueue::new(threads);
///
/// std::thread::scope(|s| {
///     s.spawn(|| {
///         queue.wait_until(&ready, |ready| *ready).unwrap();
///     });
///     let mut guard = ready.lock();
///     *guard = true;
///     queue.notify_one();
/// });
/// ```
pub struct WaitQueue {
    threads: &'static dyn ThreadOps,
    waiters: SpinLock<Waiters>,
}

impl WaitQueue {
    /// Creates an empty wait queue driven by the given scheduler hooks.
    pub fn new(threads: &'static dyn ThreadOps) -> Self {
        Self {
            threads,
            waiters: SpinLock::ranked(LockRank::WaitQueue, Waiters::default()),
        }
    }

    /// Blocks the current thread until `predicate` returns true over the
    /// state guarded by `lock`.
    ///
    /// The predicate is first checked under the lock; if it already holds,
    /// the call returns without ever registering a waiter. Otherwise the
    /// calling thread registers itself, releases the lock, and suspends.
    /// Each wakeup, notified or spurious, reacquires the lock and
    /// re-checks the predicate, so a `true` result always reflects the
    /// state as seen under the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupted`] if the thread was asynchronously interrupted
    /// before the predicate became true. The interruption flag is consumed.
    pub fn wait_until<T: ?Sized>(
        &self,
        lock: &SpinLock<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> Result<(), Interrupted> {
        // Set when this waiter's registration was consumed by a notifier
        // rather than withdrawn; an interrupted exit must pass such a
        // wakeup along so it is not lost on the queue's other waiters.
        let mut took_notification = false;
        loop {
            let mut guard = lock.lock();
            if predicate(&mut guard) {
                return Ok(());
            }
            if self.threads.take_interrupted() {
                drop(guard);
                if took_notification {
                    self.notify_one();
                }
                return Err(Interrupted);
            }

            let mut held = Some(guard);
            let mut ticket = None;
            self.threads.park_current(&mut |handle| {
                let mut waiters = self.waiters.lock();
                let t = waiters.next_ticket;
                waiters.next_ticket += 1;
                waiters.list.push_back(Waiter { ticket: t, handle });
                ticket = Some(t);
                drop(waiters);
                // Release the predicate lock only after the registration
                // is visible to notifiers.
                held.take();
            });

            if let Some(ticket) = ticket {
                took_notification = !self.withdraw(ticket);
            }
        }
    }

    /// Withdraws `ticket` from the list; returns false if a notifier
    /// already consumed it.
    fn withdraw(&self, ticket: u64) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.list.iter().position(|w| w.ticket == ticket) {
            Some(idx) => {
                let waiter = waiters.list.remove(idx).expect("position was just found");
                drop(waiters);
                self.threads.retire(waiter.handle);
                true
            }
            None => false,
        }
    }

    /// Wakes the oldest registered waiter, if any.
    ///
    /// At least one waiter is woken when the queue is non-empty; no
    /// ordering guarantee beyond liveness is made. Only meaningful while
    /// holding the lock that guards the awaited state, after mutating it.
    pub fn notify_one(&self) {
        let waiter = {
            let mut waiters = self.waiters.lock();
            waiters.list.pop_front()
        };
        if let Some(waiter) = waiter {
            self.threads.unpark(waiter.handle);
        }
    }

    /// Wakes every currently registered waiter.
    pub fn notify_all(&self) {
        let drained = {
            let mut waiters = self.waiters.lock();
            core::mem::take(&mut waiters.list)
        };
        for waiter in drained {
            self.threads.unpark(waiter.handle);
        }
    }

    /// Whether any waiter is currently registered.
    ///
    /// Racy by nature; diagnostics only.
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().list.is_empty()
    }
}
