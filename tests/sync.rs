//! Cross-thread exercises of the spinlock and wait queue.

use ksync::hosted::HostThreads;
use ksync::sync::{Interrupted, LockRank, SpinLock, WaitQueue};
use std::sync::mpsc;
use std::thread;

#[test]
fn increments_under_the_lock_are_exclusive() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 1_000;

    let counter = SpinLock::ranked(LockRank::Device, 0u64);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    // Non-atomic increment; only mutual exclusion keeps it
                    // from losing updates.
                    let mut guard = counter.lock();
                    let v = *guard;
                    *guard = v + 1;
                }
            });
        }
    });
    assert_eq!(counter.into_inner(), (THREADS * ROUNDS) as u64);
}

#[test]
fn a_wakeup_is_never_lost() {
    // Whatever the interleaving, the waiter either sees the predicate
    // already true or is registered before the notifier looks: both end in
    // a successful return.
    for _ in 0..200 {
        let threads = HostThreads::leaked();
        let ready = SpinLock::ranked(LockRank::Device, false);
        let queue = WaitQueue::new(threads);

        thread::scope(|s| {
            let waiter = s.spawn(|| queue.wait_until(&ready, |ready| *ready));
            let mut guard = ready.lock();
            *guard = true;
            queue.notify_one();
            drop(guard);
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
    }
}

#[test]
fn notify_all_releases_every_waiter() {
    const WAITERS: usize = 4;

    let threads = HostThreads::leaked();
    let gate = SpinLock::ranked(LockRank::Process, false);
    let queue = WaitQueue::new(threads);

    thread::scope(|s| {
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| s.spawn(|| queue.wait_until(&gate, |open| *open)))
            .collect();

        let mut guard = gate.lock();
        *guard = true;
        queue.notify_all();
        drop(guard);

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    });
    assert!(queue.is_empty());
}

#[test]
fn items_flow_through_a_blocking_channel() {
    const ITEMS: u32 = 200;

    let threads = HostThreads::leaked();
    let channel = SpinLock::ranked(LockRank::Device, std::collections::VecDeque::new());
    let queue = WaitQueue::new(threads);

    thread::scope(|s| {
        let consumer = s.spawn(|| {
            for expected in 0..ITEMS {
                queue.wait_until(&channel, |items| !items.is_empty()).unwrap();
                let mut guard = channel.lock();
                assert_eq!(guard.pop_front(), Some(expected));
            }
        });

        for item in 0..ITEMS {
            let mut guard = channel.lock();
            guard.push_back(item);
            queue.notify_one();
            drop(guard);
        }
        consumer.join().unwrap();
    });
}

#[test]
fn interruption_unwinds_a_blocked_waiter() {
    let threads = HostThreads::leaked();
    let never = SpinLock::ranked(LockRank::Thread, ());
    let queue = WaitQueue::new(threads);
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        let waiter = s.spawn(|| {
            tx.send(thread::current().id()).unwrap();
            queue.wait_until(&never, |_| false)
        });

        let target = rx.recv().unwrap();
        threads.interrupt(target);
        assert_eq!(waiter.join().unwrap(), Err(Interrupted));
    });
    // The interrupted waiter withdrew its registration on the way out.
    assert!(queue.is_empty());
}

#[test]
fn a_true_predicate_never_blocks() {
    let threads = HostThreads::leaked();
    let value = SpinLock::new(99u32);
    let queue = WaitQueue::new(threads);
    assert_eq!(queue.wait_until(&value, |v| *v == 99), Ok(()));
}
