//! End-to-end exercises of the fault-tolerant access layer, driven through
//! a synthetic address space the way the trap dispatcher drives it on real
//! hardware.

use ksync::KernelError;
use ksync::hosted::AddressSpace;
use ksync::safemem::{
    Fault, safe_atomic_compare_exchange, safe_atomic_fetch_or, safe_copy, safe_strnlen,
};

#[test]
fn a_hole_in_the_source_stops_the_copy_at_its_edge() {
    let src: [u8; 16] = core::array::from_fn(|i| 0x40 + i as u8);
    let mut dst = [0u8; 16];
    let (s, d) = (src.as_ptr() as usize, dst.as_mut_ptr() as usize);

    let mut space = AddressSpace::install();
    space.map(s..s + 4, false);
    space.map(s + 8..s + 16, false);
    space.map(d..d + 16, true);

    let err = unsafe { safe_copy(dst.as_mut_ptr(), src.as_ptr(), 16) }.unwrap_err();
    assert_eq!(err, Fault { address: s + 4 });
    drop(space);

    assert_eq!(&dst[..4], &src[..4]);
    assert_eq!(&dst[4..], &[0u8; 12]);
}

#[test]
fn a_syscall_shaped_string_import() {
    // The usual two-step import of a user pathname: bound the length, then
    // copy exactly that much.
    let user = b"/dev/ttyS0\0";
    let mut kernel_buf = [0u8; 32];

    let len = unsafe { safe_strnlen(user.as_ptr(), 32) }.unwrap();
    assert_eq!(len, 10);
    unsafe { safe_copy(kernel_buf.as_mut_ptr(), user.as_ptr(), len) }.unwrap();
    assert_eq!(&kernel_buf[..len], b"/dev/ttyS0");
}

#[test]
fn fault_results_map_onto_errno() {
    let page = [0u8; 8];
    let base = page.as_ptr() as usize;

    let space = AddressSpace::install();
    let result: Result<(), KernelError> =
        unsafe { safe_strnlen(page.as_ptr(), 8) }.map(|_| ()).map_err(KernelError::from);
    assert_eq!(result, Err(KernelError::BadAddress));
    assert_eq!(
        result.unwrap_err().into_usize(),
        -14isize as usize,
        "a faulted import surfaces as EFAULT"
    );
    drop(space);
    let _ = base;
}

#[test]
fn futex_words_survive_fault_probing() {
    let mut word: u32 = 0;
    let addr = &mut word as *mut u32;

    // Mapped: a contended-bit protocol works end to end.
    assert_eq!(unsafe { safe_atomic_compare_exchange(addr, 0, 1) }, Some(Ok(0)));
    assert_eq!(unsafe { safe_atomic_fetch_or(addr, 0b10) }, Some(1));
    assert_eq!(unsafe { safe_atomic_compare_exchange(addr, 0b11, 0) }, Some(Ok(0b11)));

    // Unmapped: the same calls degrade to absent results, not crashes.
    let _space = AddressSpace::install();
    assert_eq!(unsafe { safe_atomic_compare_exchange(addr, 0, 1) }, None);
    assert_eq!(unsafe { safe_atomic_fetch_or(addr, 1) }, None);
}
