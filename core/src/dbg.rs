//! Introspection types and the channel proxy an out-of-process debugger
//! talks through. The kernel side drains requests whenever the embedder
//! polls [`crate::Kernel::service_debug_requests`].

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytes(pub u32);

/// One loaded executable, as the debugger sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub begin: u32,
    pub end: u32,
}

/// One ready-queue member, as the debugger sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: u32,
    pub priority: u32,
    pub pc: u32,
    pub ra: u32,
    pub sp: u32,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugCommands {
    /// List ready-queue threads
    Threads(Vec<ThreadInfo>),
    /// List loaded modules
    Modules(Vec<ModuleInfo>),
    /// Human readable kernel status
    Status(String),
    /// Query the busy-wait heuristic
    IsIdle(bool),
    /// Read bytes of guest RAM
    Peek(u32, Bytes),
    /// Move data
    Data(Box<[u8]>),
    /// Acknowledgement
    Ack,
    /// Failure
    Fail,
}

/// Paired channels between the emulator thread and a debugger frontend.
/// The emulator owns the `emu_*` halves, the frontend the `dbg_*` halves;
/// both sides clone freely.
#[derive(Debug, Clone)]
pub struct DebugProxy {
    pub emu_tx: Sender<DebugCommands>,
    pub emu_rx: Receiver<DebugCommands>,
    pub dbg_tx: Sender<DebugCommands>,
    pub dbg_rx: Receiver<DebugCommands>,
}

impl DebugProxy {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let (tx2, rx2) = unbounded();
        Self {
            emu_tx: tx,
            emu_rx: rx2,
            dbg_tx: tx2,
            dbg_rx: rx,
        }
    }
}

impl Default for DebugProxy {
    fn default() -> Self {
        Self::new()
    }
}
