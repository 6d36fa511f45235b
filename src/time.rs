//! The published time page.
//!
//! Wall-clock queries are far too hot to funnel through a lock: every
//! `gettimeofday`-shaped call in every process lands here. The kernel's
//! timekeeper instead *publishes* the current time into a dedicated page,
//! and any number of readers (other cores, or user space through a
//! read-only mapping of the same page) snapshot it without ever blocking
//! the writer or each other.
//!
//! Consistency comes from a pair of update counters around the payload.
//! The writer bumps the second counter before touching the payload and
//! stores the matching value into the first counter only after the payload
//! is fully written. A reader loads the first counter, the payload, then
//! the second counter; equal counters prove the snapshot did not overlap a
//! write, and unequal counters send the reader back around. A torn read is
//! therefore never observed, only retried; this primitive cannot fail.
//!
//! There is exactly one writer system-wide. The page enforces that by
//! handing out a single [`TimeWriter`]; whoever owns the timer interrupt
//! claims it at boot.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

/// One self-consistent sample of the published clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TimePayload {
    /// Wall-clock seconds since the epoch.
    pub epoch_seconds: u64,
    /// Seconds since boot, monotonic.
    pub boot_seconds: u64,
    /// Sub-second component of both clocks, in microseconds.
    pub microseconds: u32,
}

/// Seconds and microseconds, `gettimeofday` shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TimeVal {
    /// Whole seconds.
    pub seconds: u64,
    /// Microseconds within the second.
    pub microseconds: u32,
}

/// Seconds and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TimeSpec {
    /// Whole seconds.
    pub seconds: u64,
    /// Nanoseconds within the second.
    pub nanoseconds: u32,
}

/// The page the kernel publishes time through.
///
/// Page-aligned and laid out `repr(C)` so the very same memory can be
/// mapped read-only into user address spaces; user-side readers run the
/// identical counter protocol against their mapping.
#[repr(C, align(4096))]
pub struct TimePage {
    // Stored last by the writer, with release ordering: a reader that
    // observes value `n` here observes the whole payload of write `n`.
    update1: AtomicU32,
    // Bumped first by the writer: a reader that observes value `n` here
    // knows write `n + 1` has not started.
    update2: AtomicU32,
    epoch_seconds: AtomicU64,
    boot_seconds: AtomicU64,
    microseconds: AtomicU32,
    writer_claimed: AtomicBool,
}

impl TimePage {
    /// Creates a zeroed time page.
    pub const fn new() -> Self {
        Self {
            update1: AtomicU32::new(0),
            update2: AtomicU32::new(0),
            epoch_seconds: AtomicU64::new(0),
            boot_seconds: AtomicU64::new(0),
            microseconds: AtomicU32::new(0),
            writer_claimed: AtomicBool::new(false),
        }
    }

    /// Claims the page's single writer capability.
    ///
    /// Succeeds exactly once per page; every later call returns `None`.
    pub fn claim_writer(&self) -> Option<TimeWriter<'_>> {
        self.writer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TimeWriter { page: self })
    }

    /// Snapshots the published payload, retrying while a write is in
    /// flight.
    pub fn read(&self) -> TimePayload {
        loop {
            let begin = self.update1.load(Ordering::Acquire);
            let payload = TimePayload {
                epoch_seconds: self.epoch_seconds.load(Ordering::Relaxed),
                boot_seconds: self.boot_seconds.load(Ordering::Relaxed),
                microseconds: self.microseconds.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            let end = self.update2.load(Ordering::Relaxed);
            if begin == end {
                return payload;
            }
            core::hint::spin_loop();
        }
    }

    /// Wall-clock time, `gettimeofday` shaped.
    pub fn read_timeofday(&self) -> TimeVal {
        let payload = self.read();
        TimeVal {
            seconds: payload.epoch_seconds,
            microseconds: payload.microseconds,
        }
    }

    /// Monotonic time since boot.
    pub fn read_monotonic(&self) -> TimeSpec {
        let payload = self.read();
        TimeSpec {
            seconds: payload.boot_seconds,
            nanoseconds: payload.microseconds * 1_000,
        }
    }

    /// Wall-clock time with nanosecond resolution.
    pub fn read_realtime(&self) -> TimeSpec {
        let payload = self.read();
        TimeSpec {
            seconds: payload.epoch_seconds,
            nanoseconds: payload.microseconds * 1_000,
        }
    }
}

impl Default for TimePage {
    fn default() -> Self {
        Self::new()
    }
}

/// The page's single writer capability.
///
/// Constructible only through [`TimePage::claim_writer`]; holding one is
/// the proof of being the system's timekeeper.
pub struct TimeWriter<'a> {
    page: &'a TimePage,
}

impl TimeWriter<'_> {
    /// Publishes a new payload.
    pub fn write_time(&mut self, payload: TimePayload) {
        let page = self.page;
        let sequence = page.update2.load(Ordering::Relaxed).wrapping_add(1);
        page.update2.store(sequence, Ordering::Relaxed);
        // The bump must reach readers before any payload store.
        fence(Ordering::Release);
        page.epoch_seconds
            .store(payload.epoch_seconds, Ordering::Relaxed);
        page.boot_seconds
            .store(payload.boot_seconds, Ordering::Relaxed);
        page.microseconds
            .store(payload.microseconds, Ordering::Relaxed);
        page.update1.store(sequence, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let page = TimePage::new();
        let mut writer = page.claim_writer().unwrap();
        let payload = TimePayload {
            epoch_seconds: 1000,
            boot_seconds: 50,
            microseconds: 0,
        };
        writer.write_time(payload);
        assert_eq!(page.read(), payload);
        assert_eq!(
            page.read_timeofday(),
            TimeVal {
                seconds: 1000,
                microseconds: 0
            }
        );
        assert_eq!(
            page.read_monotonic(),
            TimeSpec {
                seconds: 50,
                nanoseconds: 0
            }
        );
        assert_eq!(
            page.read_realtime(),
            TimeSpec {
                seconds: 1000,
                nanoseconds: 0
            }
        );
    }

    #[test]
    fn the_writer_capability_is_single_issue() {
        let page = TimePage::new();
        let writer = page.claim_writer();
        assert!(writer.is_some());
        assert!(page.claim_writer().is_none());
    }

    #[test]
    fn page_layout_is_page_sized_for_mapping() {
        assert_eq!(core::mem::align_of::<TimePage>(), 4096);
        assert_eq!(core::mem::size_of::<TimePage>(), 4096);
    }

    #[test]
    fn reads_before_any_write_are_zero() {
        let page = TimePage::new();
        assert_eq!(page.read(), TimePayload::default());
    }
}
