//! Raw unit accesses to memory whose validity is unknown.
//!
//! The fault-tolerant access layer above performs its work one unit at a
//! time through these helpers. On bare metal the helpers are plain volatile
//! accesses: an unmapped address faults, the trap dispatcher consults the
//! recovery hook, and execution resumes on the recovery path. On hosted
//! targets a real fault would kill the process, so a thread can install a
//! synthetic address space instead: [`probe`] then reports which addresses
//! are "mapped", and the layer above turns a probe miss into the same
//! recovery sequence the dispatcher would drive on metal.
//!
//! When no synthetic address space is installed, every address probes as
//! mapped, so ordinary host code is unaffected.

#[cfg(not(target_os = "none"))]
use core::cell::RefCell;
#[cfg(not(target_os = "none"))]
use core::ops::Range;

#[cfg(not(target_os = "none"))]
struct MappedRange {
    range: Range<usize>,
    writable: bool,
}

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static ADDRESS_SPACE: RefCell<Option<Vec<MappedRange>>> = const { RefCell::new(None) };
}

/// A synthetic address space for the calling thread.
///
/// While installed, only addresses covered by [`map`](Self::map) probe as
/// mapped; everything else behaves like an unmapped page. The space is torn
/// down when the value drops. Hosted targets only.
#[cfg(not(target_os = "none"))]
pub struct AddressSpace {
    _not_send: core::marker::PhantomData<*mut ()>,
}

#[cfg(not(target_os = "none"))]
impl AddressSpace {
    /// Installs an empty synthetic address space for the calling thread.
    ///
    /// # Panics
    /// Panics if the thread already has one installed.
    pub fn install() -> Self {
        ADDRESS_SPACE.with(|space| {
            let mut space = space.borrow_mut();
            assert!(space.is_none(), "synthetic address space already installed");
            *space = Some(Vec::new());
        });
        Self {
            _not_send: core::marker::PhantomData,
        }
    }

    /// Marks `range` as mapped, writable or read-only.
    pub fn map(&mut self, range: Range<usize>, writable: bool) {
        ADDRESS_SPACE.with(|space| {
            space
                .borrow_mut()
                .as_mut()
                .expect("synthetic address space torn down while handle lives")
                .push(MappedRange { range, writable });
        });
    }
}

#[cfg(not(target_os = "none"))]
impl Drop for AddressSpace {
    fn drop(&mut self) {
        ADDRESS_SPACE.with(|space| *space.borrow_mut() = None);
    }
}

/// Whether `addr` may be touched with the given access kind.
///
/// Consults the calling thread's synthetic address space; with none
/// installed, every address is considered mapped.
#[cfg(not(target_os = "none"))]
pub fn probe(addr: usize, write: bool) -> bool {
    ADDRESS_SPACE.with(|space| match space.borrow().as_ref() {
        None => true,
        Some(ranges) => ranges
            .iter()
            .any(|m| m.range.contains(&addr) && (!write || m.writable)),
    })
}

/// Reads one byte from `addr`.
///
/// # Safety
/// `addr` must either be mapped readable, or the caller must be prepared to
/// recover from the resulting fault (on hosted targets, the caller must have
/// probed first).
#[inline]
pub unsafe fn read_byte(addr: *const u8) -> u8 {
    unsafe { core::ptr::read_volatile(addr) }
}

/// Writes one byte to `addr`.
///
/// # Safety
/// As [`read_byte`], for a writable mapping.
#[inline]
pub unsafe fn write_byte(addr: *mut u8, value: u8) {
    unsafe { core::ptr::write_volatile(addr, value) }
}
