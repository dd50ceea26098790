//! Contracts of the non-CPU collaborators: the Graphics Synthesizer, the
//! SIF bridge, the I/O processor filesystem, and the embedder's event sink.

use std::io::Read;

/// GS privileged registers the kernel touches.
pub const GS_CSR: u32 = 0x1200_1000;
pub const GS_IMR: u32 = 0x1200_1010;

/// Read-only open flag understood by the I/O processor's ioman.
pub const OPEN_FLAG_RDONLY: u32 = 1;

/// Graphics Synthesizer handler. The kernel tolerates running without one;
/// GS syscalls then degrade to no-ops or zero reads.
pub trait GsHandler {
    fn set_crt(&mut self, interlaced: bool, mode: u32, frame_mode: bool);
    fn read_priv_register(&mut self, reg: u32) -> u32;
    fn write_priv_register(&mut self, reg: u32, value: u32);
}

/// The EE-side view of the Sub-processor InterFace register file.
pub trait SifBridge {
    fn get_register(&mut self, id: u32) -> u32;
    fn set_register(&mut self, id: u32, value: u32);
}

/// The I/O processor's file manager, used to read SYSTEM.CNF and game
/// executables from the disc image and to sink DECI2 console output.
pub trait Ioman {
    /// Open a path; a negative handle means failure.
    fn open(&mut self, flags: u32, path: &str) -> i32;
    /// Borrow a stream over an open handle.
    fn file_stream(&mut self, handle: u32) -> anyhow::Result<Box<dyn Read + '_>>;
    fn close(&mut self, handle: u32);
    /// Write bytes to an open descriptor (fd 1 is the console).
    fn write(&mut self, fd: u32, data: &[u8]) -> u32;
}

/// Callbacks the kernel raises toward the embedder. All default to no-ops.
pub trait OsEvents {
    /// A new executable finished loading.
    fn executable_change(&mut self) {}
    /// The current executable is about to be dropped.
    fn executable_unloading(&mut self) {}
    /// The guest invoked LoadExecPS2; the embedder decides how to reboot.
    fn request_load_executable(&mut self, _path: &str, _args: &[String]) {}
    /// The guest flushed the instruction cache; a JIT must discard blocks.
    fn request_instruction_cache_flush(&mut self) {}
}

/// Event sink that ignores everything.
#[derive(Debug, Default)]
pub struct NullEvents;

impl OsEvents for NullEvents {}
