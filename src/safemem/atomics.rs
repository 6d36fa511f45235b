//! Fault-tolerant atomic operations.
//!
//! The same opt-in recovery contract as the byte operations, applied to
//! 32-bit atomics: each operation arms the executing context's access
//! record, performs the hardware atomic, and reports an absent result
//! instead of escalating if the location turns out not to be mapped.
//! Futex words and device doorbells are the typical operands.
//!
//! The composite operations (`fetch_and`, `fetch_or`, `fetch_xor`,
//! `fetch_and_not`) are built generically on the primitive
//! compare-exchange: load, modify, attempt the exchange, and on contention
//! re-derive the expected value from a fresh load, with a full fence
//! between retries so contended loops do not saturate the interconnect.

use super::RecoveryWindow;
#[cfg(not(target_os = "none"))]
use bedrock::interrupt::PageFaultCode;
use core::sync::atomic::{AtomicU32, Ordering, fence};

fn aligned(addr: usize) -> bool {
    addr % core::mem::align_of::<AtomicU32>() == 0
}

/// Atomically loads the `u32` at `addr`, or reports `None` if the access
/// faulted.
///
/// # Safety
/// `addr` must be 4-byte aligned; if mapped, it must be memory the caller
/// is entitled to read.
pub unsafe fn safe_atomic_load(addr: *const u32) -> Option<u32> {
    debug_assert!(aligned(addr as usize));
    let window = RecoveryWindow::arm();
    #[cfg(not(target_os = "none"))]
    if !bedrock::mem::probe(addr as usize, false) {
        window.simulate_fault(addr as usize, PageFaultCode::empty());
        return None;
    }
    let value = unsafe { (*(addr as *const AtomicU32)).load(Ordering::SeqCst) };
    match window.take_fault() {
        Some(_) => None,
        None => Some(value),
    }
}

/// Atomically stores `value` to `addr`; returns whether the store landed.
///
/// # Safety
/// As [`safe_atomic_load`], for a writable mapping.
pub unsafe fn safe_atomic_store(addr: *mut u32, value: u32) -> bool {
    debug_assert!(aligned(addr as usize));
    let window = RecoveryWindow::arm();
    #[cfg(not(target_os = "none"))]
    if !bedrock::mem::probe(addr as usize, true) {
        window.simulate_fault(addr as usize, PageFaultCode::WRITE);
        return false;
    }
    unsafe { (*(addr as *const AtomicU32)).store(value, Ordering::SeqCst) };
    window.take_fault().is_none()
}

/// Atomically replaces the value at `addr` with `value`, returning the
/// previous value, or `None` if the access faulted.
///
/// # Safety
/// As [`safe_atomic_store`].
pub unsafe fn safe_atomic_exchange(addr: *mut u32, value: u32) -> Option<u32> {
    debug_assert!(aligned(addr as usize));
    let window = RecoveryWindow::arm();
    #[cfg(not(target_os = "none"))]
    if !bedrock::mem::probe(addr as usize, true) {
        window.simulate_fault(addr as usize, PageFaultCode::WRITE);
        return None;
    }
    let previous = unsafe { (*(addr as *const AtomicU32)).swap(value, Ordering::SeqCst) };
    match window.take_fault() {
        Some(_) => None,
        None => Some(previous),
    }
}

/// Atomically stores `new` at `addr` if the current value equals
/// `current`.
///
/// Returns `None` if the access faulted; in that case no memory write is
/// observable. Otherwise returns the inner compare-exchange result:
/// `Ok(previous)` on success, `Err(previous)` on a value mismatch.
///
/// # Safety
/// As [`safe_atomic_store`].
pub unsafe fn safe_atomic_compare_exchange(
    addr: *mut u32,
    current: u32,
    new: u32,
) -> Option<Result<u32, u32>> {
    debug_assert!(aligned(addr as usize));
    let window = RecoveryWindow::arm();
    #[cfg(not(target_os = "none"))]
    if !bedrock::mem::probe(addr as usize, true) {
        window.simulate_fault(addr as usize, PageFaultCode::WRITE);
        return None;
    }
    let result = unsafe {
        (*(addr as *const AtomicU32)).compare_exchange(
            current,
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
    };
    match window.take_fault() {
        Some(_) => None,
        None => Some(result),
    }
}

fn fetch_update_with(addr: *mut u32, apply: impl Fn(u32) -> u32) -> Option<u32> {
    loop {
        let current = unsafe { safe_atomic_load(addr)? };
        match unsafe { safe_atomic_compare_exchange(addr, current, apply(current))? } {
            Ok(previous) => return Some(previous),
            // Re-derive the expected value from a fresh load; the fence
            // keeps the retry loop off the interconnect's back.
            Err(_) => fence(Ordering::SeqCst),
        }
    }
}

/// Atomically ANDs `value` into the `u32` at `addr`, returning the
/// previous value, or `None` if the access faulted.
///
/// # Safety
/// As [`safe_atomic_store`].
pub unsafe fn safe_atomic_fetch_and(addr: *mut u32, value: u32) -> Option<u32> {
    fetch_update_with(addr, |v| v & value)
}

/// Atomically ORs `value` into the `u32` at `addr`, returning the previous
/// value, or `None` if the access faulted.
///
/// # Safety
/// As [`safe_atomic_store`].
pub unsafe fn safe_atomic_fetch_or(addr: *mut u32, value: u32) -> Option<u32> {
    fetch_update_with(addr, |v| v | value)
}

/// Atomically XORs `value` into the `u32` at `addr`, returning the
/// previous value, or `None` if the access faulted.
///
/// # Safety
/// As [`safe_atomic_store`].
pub unsafe fn safe_atomic_fetch_xor(addr: *mut u32, value: u32) -> Option<u32> {
    fetch_update_with(addr, |v| v ^ value)
}

/// Atomically clears the bits of `value` in the `u32` at `addr`, returning
/// the previous value, or `None` if the access faulted.
///
/// # Safety
/// As [`safe_atomic_store`].
pub unsafe fn safe_atomic_fetch_and_not(addr: *mut u32, value: u32) -> Option<u32> {
    fetch_update_with(addr, |v| v & !value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrock::mem::AddressSpace;

    #[test]
    fn mapped_word_round_trips() {
        let mut word: u32 = 0x1234_5678;
        let addr = &mut word as *mut u32;
        assert_eq!(unsafe { safe_atomic_load(addr) }, Some(0x1234_5678));
        assert_eq!(unsafe { safe_atomic_exchange(addr, 1) }, Some(0x1234_5678));
        assert_eq!(
            unsafe { safe_atomic_compare_exchange(addr, 1, 2) },
            Some(Ok(1))
        );
        assert_eq!(
            unsafe { safe_atomic_compare_exchange(addr, 1, 3) },
            Some(Err(2))
        );
    }

    #[test]
    fn composites_build_on_compare_exchange() {
        let mut word: u32 = 0b1100;
        let addr = &mut word as *mut u32;
        assert_eq!(unsafe { safe_atomic_fetch_or(addr, 0b0011) }, Some(0b1100));
        assert_eq!(unsafe { safe_atomic_fetch_and(addr, 0b1010) }, Some(0b1111));
        assert_eq!(unsafe { safe_atomic_fetch_xor(addr, 0b0110) }, Some(0b1010));
        assert_eq!(
            unsafe { safe_atomic_fetch_and_not(addr, 0b1000) },
            Some(0b1100)
        );
        assert_eq!(unsafe { safe_atomic_load(addr) }, Some(0b0100));
    }

    #[test]
    fn unmapped_word_yields_absent_results() {
        let mut word: u32 = 7;
        let addr = &mut word as *mut u32;
        let _space = AddressSpace::install();
        assert_eq!(unsafe { safe_atomic_load(addr) }, None);
        assert_eq!(unsafe { safe_atomic_compare_exchange(addr, 7, 9) }, None);
        assert_eq!(unsafe { safe_atomic_fetch_or(addr, 1) }, None);
        assert!(!unsafe { safe_atomic_store(addr, 9) });
        drop(_space);
        // No write became observable through the faulted operations.
        assert_eq!(unsafe { safe_atomic_load(addr) }, Some(7));
    }

    #[test]
    fn read_only_word_refuses_stores_but_loads() {
        let mut word: u32 = 5;
        let addr = &mut word as *mut u32;
        let base = addr as usize;
        let mut space = AddressSpace::install();
        space.map(base..base + 4, false);
        assert_eq!(unsafe { safe_atomic_load(addr) }, Some(5));
        assert!(!unsafe { safe_atomic_store(addr, 9) });
        assert_eq!(unsafe { safe_atomic_exchange(addr, 9) }, None);
    }
}
