//! The bedrock of the kernel: the thin layer that talks to the machine.
//!
//! This crate carries the pieces of the concurrency core that depend on the
//! platform rather than on each other: interrupt enable/disable with per-core
//! nesting, the identity of the executing core, raw unit accesses to memory
//! whose validity is unknown, and the console print macros.
//!
//! On bare metal (`target_os = "none"`) the crate is `no_std` and the
//! interrupt primitives compile to the x86_64 flag instructions. On hosted
//! targets the same surface is backed by per-thread state so the layers above
//! can be exercised with ordinary threads.

#![cfg_attr(target_os = "none", no_std)]

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod cpu;
pub mod interrupt;
pub mod mem;

pub use cpu::MAX_CPU;
