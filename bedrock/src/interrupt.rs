//! Interrupt control and the trap-state hand-off.
//!
//! Every critical section in the concurrency core starts by disabling
//! interrupts on the executing core, so that an interrupt handler cannot
//! re-enter the section and deadlock against its own core. The
//! [`InterruptGuard`] type makes that discipline scoped: creating the guard
//! saves the current interrupt state and disables interrupts, dropping it
//! restores the saved state, on every exit path.
//!
//! Guards nest. Only the outermost guard on a core re-enables interrupts,
//! and only if they were enabled when it was created.

#[cfg(not(target_os = "none"))]
use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

/// Enumeration representing the interrupt state of the executing core.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
impl InterruptState {
    /// Reads the current interrupt state from RFLAGS.
    pub fn current() -> Self {
        let flags: u64;
        unsafe {
            core::arch::asm!("pushfq", "pop {}", out(reg) flags, options(nomem));
        }
        if flags & (1 << 9) != 0 { Self::On } else { Self::Off }
    }

    /// Enables interrupts on the executing core.
    ///
    /// # Safety
    /// The caller must not be inside a critical section that relies on
    /// interrupts staying disabled.
    pub unsafe fn enable() {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }

    /// Disables interrupts on the executing core.
    ///
    /// # Safety
    /// The caller is responsible for restoring the previous state; prefer
    /// [`InterruptGuard`].
    pub unsafe fn disable() {
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
    }
}

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static SIMULATED_IF: Cell<bool> = const { Cell::new(true) };
}

#[cfg(not(target_os = "none"))]
impl InterruptState {
    /// Reads the simulated per-thread interrupt flag.
    pub fn current() -> Self {
        if SIMULATED_IF.with(|f| f.get()) { Self::On } else { Self::Off }
    }

    /// Sets the simulated per-thread interrupt flag.
    ///
    /// # Safety
    /// Mirrors the bare-metal contract; see the other definition.
    pub unsafe fn enable() {
        SIMULATED_IF.with(|f| f.set(true));
    }

    /// Clears the simulated per-thread interrupt flag.
    ///
    /// # Safety
    /// Mirrors the bare-metal contract; see the other definition.
    pub unsafe fn disable() {
        SIMULATED_IF.with(|f| f.set(false));
    }
}

struct NestState {
    outermost_enabled: AtomicBool,
    depth: AtomicIsize,
}

impl NestState {
    const fn new() -> Self {
        Self {
            outermost_enabled: AtomicBool::new(true),
            depth: AtomicIsize::new(0),
        }
    }

    fn enter(&self, state: InterruptState) {
        if self.depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.outermost_enabled
                .store(state == InterruptState::On, Ordering::SeqCst);
        }
    }

    fn leave(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "mismatched InterruptGuard drops: {prev}");
        if prev == 1 && self.outermost_enabled.load(Ordering::SeqCst) {
            unsafe { InterruptState::enable() };
        }
    }
}

#[cfg(target_os = "none")]
static PER_CORE_NEST: [NestState; crate::MAX_CPU] =
    [const { NestState::new() }; crate::MAX_CPU];

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static THREAD_NEST: NestState = const { NestState::new() };
}

fn with_nest<R>(f: impl FnOnce(&NestState) -> R) -> R {
    #[cfg(target_os = "none")]
    {
        f(&PER_CORE_NEST[crate::cpu::id()])
    }
    #[cfg(not(target_os = "none"))]
    {
        THREAD_NEST.with(f)
    }
}

/// An RAII guard for a region with interrupts disabled.
///
/// Creating the guard saves the current interrupt state and disables
/// interrupts on the executing core; dropping it restores the saved state.
/// Guards must be dropped in reverse order of creation, which Rust's scoping
/// upholds unless a guard is stored in a long-lived structure.
pub struct InterruptGuard {
    #[cfg(target_os = "none")]
    core_id: usize,
    _not_send: PhantomData<*mut ()>,
}

impl InterruptGuard {
    /// Disables interrupts on the executing core, remembering the prior state.
    pub fn new() -> Self {
        let state = InterruptState::current();
        unsafe { InterruptState::disable() };
        core::sync::atomic::fence(Ordering::SeqCst);

        with_nest(|nest| nest.enter(state));

        Self {
            #[cfg(target_os = "none")]
            core_id: crate::cpu::id(),
            _not_send: PhantomData,
        }
    }

    /// Whether the executing core currently holds at least one guard.
    pub fn is_guarded() -> bool {
        with_nest(|nest| nest.depth.load(Ordering::SeqCst) > 0)
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "none")]
        assert_eq!(
            self.core_id,
            crate::cpu::id(),
            "InterruptGuard dropped on a different core"
        );

        with_nest(|nest| nest.leave());
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

bitflags::bitflags! {
    /// Page-fault error code bits as delivered by the fault hardware.
    pub struct PageFaultCode: u64 {
        /// The fault was a protection violation on a present mapping; clear
        /// for a non-present mapping.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The faulting access originated in user mode.
        const USER = 1 << 2;
        /// A reserved bit was set in a paging structure.
        const RESERVED = 1 << 3;
        /// The fault was taken on an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// The slice of trap state the fault-recovery hook is allowed to inspect and
/// rewrite.
///
/// The platform's trap dispatcher builds one of these from its full register
/// frame before consulting the recovery hook; if the hook reports the fault
/// handled, the dispatcher must resume the trapped context at the rewritten
/// [`ip`](Self::ip) instead of escalating.
#[derive(Debug, Clone, Copy)]
pub struct TrapState {
    /// Instruction pointer at which the trap was taken; rewritten to the
    /// recovery address when a fault-tolerant access is unwound.
    pub ip: usize,
    /// Page-fault error code bits for the trap.
    pub code: PageFaultCode,
}

impl TrapState {
    /// Builds a trap state from the faulting instruction pointer and the
    /// fault's error code.
    pub fn new(ip: usize, code: PageFaultCode) -> Self {
        Self { ip, code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_nesting_restores_outer_state() {
        assert_eq!(InterruptState::current(), InterruptState::On);
        {
            let _outer = InterruptGuard::new();
            assert_eq!(InterruptState::current(), InterruptState::Off);
            {
                let _inner = InterruptGuard::new();
                assert_eq!(InterruptState::current(), InterruptState::Off);
            }
            // Inner drop must not re-enable while the outer guard lives.
            assert_eq!(InterruptState::current(), InterruptState::Off);
            assert!(InterruptGuard::is_guarded());
        }
        assert_eq!(InterruptState::current(), InterruptState::On);
        assert!(!InterruptGuard::is_guarded());
    }

    #[test]
    fn trap_state_carries_code() {
        let trap = TrapState::new(0x1000, PageFaultCode::WRITE | PageFaultCode::USER);
        assert!(trap.code.contains(PageFaultCode::USER));
        assert!(!trap.code.contains(PageFaultCode::PRESENT));
    }
}
