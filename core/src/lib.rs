//! Guest-side kernel emulator for the PlayStation 2 Emotion Engine.
//!
//! This crate is the "BIOS" that unmodified PS2 executables run on top of:
//! it loads ELF images into guest RAM, keeps the thread/semaphore/handler
//! tables at their well-known physical offsets, emits the MIPS trampolines
//! games jump through on exceptions, and services the ~60 kernel syscalls.
//! The R5900 core, the GS, the SIF and the I/O processor are collaborators
//! reached through the traits in [`cpu`] and [`devices`]; the kernel itself
//! is entirely reactive and never drives control flow of its own.

pub mod cpu;
pub mod dbg;
pub mod devices;
pub mod os;

use std::sync::Arc;

use parking_lot::RwLock;

pub use crate::os::Kernel;

/// Size of EE main RAM.
pub const EE_RAM_SIZE: u32 = 0x0200_0000;
/// Guest physical base of the BIOS region.
pub const BIOS_BASE: u32 = 0x1FC0_0000;
/// Size of the BIOS image the kernel writes its trampolines into.
pub const BIOS_SIZE: u32 = 0x0040_0000;

/// A byte-addressable guest memory image shared between the kernel and the
/// rest of the emulator.
pub type SharedMem = Arc<RwLock<Box<[u8]>>>;

/// Allocate a zeroed shared memory image of `size` bytes.
pub fn shared_mem(size: usize) -> SharedMem {
    Arc::new(RwLock::new(vec![0u8; size].into_boxed_slice()))
}
