//! Kernel print utilities.
//!
//! The console sink is registered once at boot; until then, output on bare
//! metal is dropped and output on hosted targets goes to standard error.
//! All output serializes on an internal lock so interleaved lines stay
//! whole; the lock is deliberately outside the rank discipline because
//! diagnostics must be printable from any context, including the rank
//! checker itself.

use crate::interrupt::InterruptGuard;
use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

/// Quiet flag consulted by the leveled macros.
#[doc(hidden)]
pub static QUIET: AtomicBool = AtomicBool::new(false);

/// A console sink: one fragment of formatted output per call.
pub type SinkFn = fn(&str);

struct Console {
    locked: AtomicBool,
    sink: UnsafeCell<Option<SinkFn>>,
}

// The sink cell is only touched while `locked` is held with interrupts off.
unsafe impl Sync for Console {}

static CONSOLE: Console = Console {
    locked: AtomicBool::new(false),
    sink: UnsafeCell::new(None),
};

impl Console {
    fn with<R>(&self, f: impl FnOnce(&mut Option<SinkFn>) -> R) -> R {
        let _guard = InterruptGuard::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        let result = f(unsafe { &mut *self.sink.get() });
        self.locked.store(false, Ordering::Release);
        result
    }
}

/// Registers the console sink the print macros write through.
pub fn register_console(sink: SinkFn) {
    CONSOLE.with(|slot| *slot = Some(sink));
}

struct SinkAdapter(SinkFn);

impl Write for SinkAdapter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    CONSOLE.with(|slot| match slot {
        Some(sink) => {
            let _ = write!(SinkAdapter(*sink), "{args}");
        }
        None => {
            #[cfg(not(target_os = "none"))]
            {
                use std::io::Write as _;
                let _ = std::io::stderr().write_fmt(args);
            }
        }
    });
}

/// Prints out the message.
///
/// Uses the `format!` syntax. Output holds the console lock for the duration
/// of the write.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    () => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[INFO] {}\n", format_args!($($arg)*)) });
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    () => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[WARN] {}\n", format_args!($($arg)*)) });
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    () => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG]\n") });
    ($($arg:tt)*) => (if !$crate::kprint::QUIET.load(core::sync::atomic::Ordering::SeqCst) { $crate::print!("[DEBUG] {}\n", format_args!($($arg)*))} );
}
