//! Identity of the executing core.
//!
//! The concurrency layer needs to know which core it runs on for per-core
//! bookkeeping (interrupt nesting, held-lock ranks, fault records). How that
//! identity is obtained is the platform's business: the bootstrap code
//! registers a source once during bring-up, before secondary cores are
//! started.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of cores the per-core bookkeeping can track.
pub const MAX_CPU: usize = 16;

fn unregistered() -> usize {
    0
}

static CPU_ID_SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Registers the platform's core-identity source.
///
/// Must be called before any secondary core starts executing kernel code;
/// until then every caller is reported as core 0. The source must return a
/// value below [`MAX_CPU`].
pub fn register_cpu_id_source(source: fn() -> usize) {
    CPU_ID_SOURCE.store(source as usize, Ordering::SeqCst);
}

/// Returns the index of the executing core.
#[inline]
pub fn id() -> usize {
    let raw = CPU_ID_SOURCE.load(Ordering::SeqCst);
    let source: fn() -> usize = if raw == 0 {
        unregistered
    } else {
        // Registered from a `fn() -> usize`, so the round-trip is sound.
        unsafe { core::mem::transmute::<usize, fn() -> usize>(raw) }
    };
    let id = source();
    debug_assert!(id < MAX_CPU, "cpu id {id} out of range");
    id
}
