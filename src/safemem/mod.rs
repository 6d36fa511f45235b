//! Fault-tolerant memory accesses.
//!
//! The kernel routinely has to touch memory it does not control: a buffer
//! address handed in by a user process, a device window that may not be
//! backed. A direct dereference of such an address turns a bad pointer into
//! a kernel panic; the operations in this module turn it into an error
//! value carrying the faulting address instead.
//!
//! The mechanism is a per-context **access record**. Each operation arms
//! the record for its duration; when the platform's trap dispatcher sees a
//! kernel-mode fault it calls [`handle_safe_access_fault`] *before* its
//! fatal path, and if the record is armed the hook stores the faulting
//! address, rewrites the trap's resume point to the registered recovery
//! address, and reports the fault handled. The interrupted operation then
//! unwinds with [`Fault`] rather than escalating. The record is cleared
//! when the operation ends, whatever the outcome. Fault tolerance is
//! opt-in per call site, never ambient, so a fault on a direct access
//! remains fatal by design.
//!
//! On hosted targets there is no trap dispatcher to cooperate with; a probe
//! of the thread's synthetic address space stands in for the hardware
//! walk, and a miss is fed through the same [`handle_safe_access_fault`]
//! entry the dispatcher would use. One recovery path serves both worlds.

mod atomics;

pub use atomics::{
    safe_atomic_compare_exchange, safe_atomic_exchange, safe_atomic_fetch_and,
    safe_atomic_fetch_and_not, safe_atomic_fetch_or, safe_atomic_fetch_xor, safe_atomic_load,
    safe_atomic_store,
};

use bedrock::interrupt::{InterruptGuard, PageFaultCode, TrapState};
use bedrock::mem;
use core::marker::PhantomData;

/// A fault taken while touching memory of unknown validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// The address whose access faulted.
    pub address: usize,
}

#[derive(Clone, Copy)]
struct AccessRecord {
    armed: bool,
    recovery: usize,
    fault: Option<usize>,
}

impl AccessRecord {
    const IDLE: AccessRecord = AccessRecord {
        armed: false,
        recovery: 0,
        fault: None,
    };
}

#[cfg(target_os = "none")]
mod storage {
    use super::AccessRecord;
    use bedrock::MAX_CPU;
    use core::cell::UnsafeCell;
    use crossbeam_utils::CachePadded;

    struct RecordCell(UnsafeCell<AccessRecord>);

    // Each slot is only touched by its own core: windows hold an interrupt
    // guard, and the fault handler runs on the faulting core.
    unsafe impl Sync for RecordCell {}

    static RECORDS: [CachePadded<RecordCell>; MAX_CPU] =
        [const { CachePadded::new(RecordCell(UnsafeCell::new(AccessRecord::IDLE))) }; MAX_CPU];

    pub(super) fn with_record<R>(f: impl FnOnce(&mut AccessRecord) -> R) -> R {
        let slot = &RECORDS[bedrock::cpu::id()];
        f(unsafe { &mut *slot.0.get() })
    }
}

#[cfg(not(target_os = "none"))]
mod storage {
    use super::AccessRecord;
    use core::cell::RefCell;

    std::thread_local! {
        static RECORD: RefCell<AccessRecord> = const { RefCell::new(AccessRecord::IDLE) };
    }

    pub(super) fn with_record<R>(f: impl FnOnce(&mut AccessRecord) -> R) -> R {
        RECORD.with(|record| f(&mut record.borrow_mut()))
    }
}

use storage::with_record;

/// Consulted by the platform's trap dispatcher before it treats a
/// kernel-mode fault as fatal.
///
/// If the executing context has a fault-tolerant access in flight, the
/// faulting address is recorded, `trap`'s resume point is rewritten to the
/// recovery address registered when the access was armed, and `true` is
/// returned: the dispatcher must resume the trapped context instead of
/// escalating. Otherwise returns `false` and the normal fault path (fatal,
/// for kernel-mode faults) proceeds.
///
/// User-mode faults are never taken over; those belong to the task's own
/// fault handling.
pub fn handle_safe_access_fault(trap: &mut TrapState, fault_address: usize) -> bool {
    if trap.code.contains(PageFaultCode::USER) {
        return false;
    }
    with_record(|record| {
        if !record.armed {
            return false;
        }
        record.fault = Some(fault_address);
        trap.ip = record.recovery;
        true
    })
}

// The landing site this module's own loops register. A bare-metal port
// arms windows with the address of its actual recovery stub; what matters
// to the contract is that the dispatcher resumes wherever the armed record
// says.
fn recovery_landing() {}

/// Arms the executing context's access record for the duration of one
/// fault-tolerant operation; disarmed on drop, whatever the outcome.
///
/// Holds an interrupt guard so the per-core record cannot be re-armed by a
/// preempting thread mid-operation; faults still dispatch, as exceptions
/// are not maskable.
pub(crate) struct RecoveryWindow {
    _interrupts: InterruptGuard,
    _not_send: PhantomData<*mut ()>,
}

impl RecoveryWindow {
    pub(crate) fn arm() -> Self {
        let interrupts = InterruptGuard::new();
        with_record(|record| {
            debug_assert!(!record.armed, "nested fault-tolerant operations");
            *record = AccessRecord {
                armed: true,
                recovery: recovery_landing as usize,
                fault: None,
            };
        });
        Self {
            _interrupts: interrupts,
            _not_send: PhantomData,
        }
    }

    /// Takes the fault recorded since arming, if any.
    pub(crate) fn take_fault(&self) -> Option<Fault> {
        with_record(|record| record.fault.take().map(|address| Fault { address }))
    }

    /// Feeds a probe miss through the same entry the trap dispatcher uses.
    #[cfg(not(target_os = "none"))]
    pub(crate) fn simulate_fault(&self, address: usize, code: PageFaultCode) -> Fault {
        let mut trap = TrapState::new(recovery_landing as usize, code);
        let handled = handle_safe_access_fault(&mut trap, address);
        debug_assert!(handled, "armed window must take the fault");
        debug_assert_eq!(trap.ip, recovery_landing as usize);
        self.take_fault().expect("handler recorded the fault")
    }
}

impl Drop for RecoveryWindow {
    fn drop(&mut self) {
        with_record(|record| *record = AccessRecord::IDLE);
    }
}

pub(crate) fn try_read_byte(window: &RecoveryWindow, addr: usize) -> Result<u8, Fault> {
    #[cfg(not(target_os = "none"))]
    if !mem::probe(addr, false) {
        return Err(window.simulate_fault(addr, PageFaultCode::empty()));
    }
    let value = unsafe { mem::read_byte(addr as *const u8) };
    // A faulting access resumes here with the record marked.
    match window.take_fault() {
        Some(fault) => Err(fault),
        None => Ok(value),
    }
}

pub(crate) fn try_write_byte(window: &RecoveryWindow, addr: usize, value: u8) -> Result<(), Fault> {
    #[cfg(not(target_os = "none"))]
    if !mem::probe(addr, true) {
        return Err(window.simulate_fault(addr, PageFaultCode::WRITE));
    }
    unsafe { mem::write_byte(addr as *mut u8, value) };
    match window.take_fault() {
        Some(fault) => Err(fault),
        None => Ok(()),
    }
}

/// Copies `len` bytes from `src` to `dest`, tolerating faults on either
/// side.
///
/// On a fault partway through, the prefix already copied remains valid,
/// and the returned [`Fault`] reports the first address whose access
/// failed.
///
/// # Safety
/// Mapped portions of both ranges must be memory the caller is entitled to
/// touch with these access kinds; only the *validity* of the mappings is
/// allowed to be unknown. The ranges must not overlap.
pub unsafe fn safe_copy(dest: *mut u8, src: *const u8, len: usize) -> Result<(), Fault> {
    let window = RecoveryWindow::arm();
    let (dest, src) = (dest as usize, src as usize);
    for i in 0..len {
        let byte = try_read_byte(&window, src + i)?;
        try_write_byte(&window, dest + i, byte)?;
    }
    Ok(())
}

/// Writes `len` copies of `value` starting at `dest`, tolerating faults.
///
/// On a fault partway through, the prefix already written remains valid.
///
/// # Safety
/// As [`safe_copy`], for the destination range.
pub unsafe fn safe_fill(dest: *mut u8, value: u8, len: usize) -> Result<(), Fault> {
    let window = RecoveryWindow::arm();
    let dest = dest as usize;
    for i in 0..len {
        try_write_byte(&window, dest + i, value)?;
    }
    Ok(())
}

/// Scans for the NUL terminator of the string at `str`, reading at most
/// `max_len` bytes.
///
/// Returns the string length if a terminator was found, or `max_len` if
/// the scan exhausted its budget first.
///
/// # Safety
/// As [`safe_copy`], for the scanned range.
pub unsafe fn safe_strnlen(str: *const u8, max_len: usize) -> Result<usize, Fault> {
    let window = RecoveryWindow::arm();
    let base = str as usize;
    for i in 0..max_len {
        if try_read_byte(&window, base + i)? == 0 {
            return Ok(i);
        }
    }
    Ok(max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrock::mem::AddressSpace;

    #[test]
    fn copy_without_a_space_is_plain() {
        let src = [0xabu8; 32];
        let mut dst = [0u8; 32];
        unsafe { safe_copy(dst.as_mut_ptr(), src.as_ptr(), 32) }.unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn copy_stops_at_the_unmapped_tail() {
        let src: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);
        let mut dst = [0u8; 16];
        let (s, d) = (src.as_ptr() as usize, dst.as_mut_ptr() as usize);

        let mut space = AddressSpace::install();
        space.map(s..s + 10, false);
        space.map(d..d + 16, true);

        let err = unsafe { safe_copy(dst.as_mut_ptr(), src.as_ptr(), 16) }.unwrap_err();
        assert_eq!(err, Fault { address: s + 10 });
        drop(space);

        // The copied prefix is intact, the rest untouched.
        assert_eq!(&dst[..10], &src[..10]);
        assert_eq!(&dst[10..], &[0u8; 6]);
    }

    #[test]
    fn fill_faults_on_a_read_only_destination() {
        let mut dst = [0u8; 8];
        let d = dst.as_mut_ptr() as usize;

        let mut space = AddressSpace::install();
        space.map(d..d + 8, false);

        let err = unsafe { safe_fill(dst.as_mut_ptr(), 0x5a, 8) }.unwrap_err();
        assert_eq!(err, Fault { address: d });
        drop(space);
        assert_eq!(dst, [0u8; 8]);
    }

    #[test]
    fn strnlen_finds_the_terminator() {
        let s = b"serial0\0garbage";
        assert_eq!(unsafe { safe_strnlen(s.as_ptr(), s.len()) }, Ok(7));
        // Budget exhausted before the terminator.
        assert_eq!(unsafe { safe_strnlen(s.as_ptr(), 4) }, Ok(4));
    }

    #[test]
    fn strnlen_reports_a_fault_mid_scan() {
        let s = *b"no-terminator-he";
        let base = s.as_ptr() as usize;
        let mut space = AddressSpace::install();
        space.map(base..base + 4, false);
        assert_eq!(
            unsafe { safe_strnlen(s.as_ptr(), 16) },
            Err(Fault { address: base + 4 })
        );
    }

    #[test]
    fn dispatcher_hook_ignores_unarmed_contexts() {
        let mut trap = TrapState::new(0xffff_8000_0000_1234, PageFaultCode::empty());
        assert!(!handle_safe_access_fault(&mut trap, 0xdead_0000));
        assert_eq!(trap.ip, 0xffff_8000_0000_1234);
    }

    #[test]
    fn dispatcher_hook_never_takes_user_faults() {
        let window = RecoveryWindow::arm();
        let mut trap = TrapState::new(0x40_0000, PageFaultCode::USER | PageFaultCode::WRITE);
        assert!(!handle_safe_access_fault(&mut trap, 0x40_2000));
        assert_eq!(trap.ip, 0x40_0000);
        assert_eq!(window.take_fault(), None);
    }

    #[test]
    fn dispatcher_hook_rewrites_the_resume_point() {
        let window = RecoveryWindow::arm();
        let mut trap = TrapState::new(0xffff_8000_0000_1234, PageFaultCode::WRITE);
        assert!(handle_safe_access_fault(&mut trap, 0xdead_0000));
        assert_eq!(trap.ip, recovery_landing as usize);
        assert_eq!(window.take_fault(), Some(Fault { address: 0xdead_0000 }));
        // Cleared after the first take.
        assert_eq!(window.take_fault(), None);
    }

    #[test]
    fn record_is_cleared_when_the_window_closes() {
        {
            let _window = RecoveryWindow::arm();
        }
        let mut trap = TrapState::new(0x1000, PageFaultCode::empty());
        assert!(!handle_safe_access_fault(&mut trap, 0x2000));
    }
}
