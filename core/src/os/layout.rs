//! The in-RAM data plane.
//!
//! Every kernel object lives in guest memory at a fixed physical offset so
//! that save-states capture it and the debugger can inspect it. The byte
//! layouts below are a public contract; the DMAC/INTC trampolines walk the
//! handler tables from guest code using the same strides.
//!
//! Memory map:
//!
//! | Offset      | Contents                              |
//! |-------------|---------------------------------------|
//! | 0x0000_0000 | current thread id (1 word)            |
//! | 0x0000_8000 | DECI2 handlers                        |
//! | 0x0000_A000 | INTC handlers                         |
//! | 0x0000_C000 | DMAC handlers                         |
//! | 0x0000_E000 | semaphores                            |
//! | 0x0001_0000 | custom syscall table (0x200 words)    |
//! | 0x0001_1000 | threads                               |
//! | 0x0002_0000 | kernel stack                          |
//! | 0x0003_0000 | ready queue (round ribbon)            |

use crate::EE_RAM_SIZE;

pub const CURRENT_THREAD_ID_ADDR: u32 = 0x0000_0000;
pub const DECI2_HANDLER_BASE: u32 = 0x0000_8000;
pub const INTC_HANDLER_BASE: u32 = 0x0000_A000;
pub const DMAC_HANDLER_BASE: u32 = 0x0000_C000;
pub const SEMAPHORE_BASE: u32 = 0x0000_E000;
pub const CUSTOM_SYSCALL_BASE: u32 = 0x0001_0000;
pub const CUSTOM_SYSCALL_COUNT: u32 = 0x200;
pub const THREAD_BASE: u32 = 0x0001_1000;
pub const KERNEL_STACK_TOP: u32 = 0x0003_0000;
pub const SCHEDULE_BASE: u32 = 0x0003_0000;
pub const SCHEDULE_SIZE: u32 = 0x2000;

pub const MAX_THREAD: u32 = 256;
pub const MAX_SEMAPHORE: u32 = 256;
pub const MAX_INTCHANDLER: u32 = 128;
pub const MAX_DMACHANDLER: u32 = 128;
pub const MAX_DECI2HANDLER: u32 = 32;

pub const THREAD_SIZE: u32 = 0x34;
pub const SEMAPHORE_SIZE: u32 = 0x10;
pub const INTC_HANDLER_SIZE: u32 = 0x14;
pub const DMAC_HANDLER_SIZE: u32 = 0x14;
pub const DECI2_HANDLER_SIZE: u32 = 0x0C;

/// Bytes reserved at the top of a thread's stack for its saved context.
pub const STACK_RES: u32 = 0x2A0;

/// Fresh quota handed to a thread when it becomes runnable.
pub const THREAD_INIT_QUOTA: u32 = 15;

/// Mask a guest pointer into the flat RAM image.
pub fn ram_mask(addr: u32) -> u32 {
    addr & (EE_RAM_SIZE - 1)
}

pub fn read_u32(mem: &[u8], addr: u32) -> u32 {
    let a = addr as usize;
    match mem.get(a..a + 4) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

pub fn write_u32(mem: &mut [u8], addr: u32, value: u32) {
    let a = addr as usize;
    if let Some(b) = mem.get_mut(a..a + 4) {
        b.copy_from_slice(&value.to_le_bytes());
    }
}

/// Read a NUL-terminated guest string, masking the pointer.
pub fn read_cstring(mem: &[u8], addr: u32) -> String {
    let mut out = Vec::new();
    let mut a = ram_mask(addr) as usize;
    while let Some(&c) = mem.get(a) {
        if c == 0 {
            break;
        }
        out.push(c);
        a += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn current_thread_id(ram: &[u8]) -> u32 {
    read_u32(ram, CURRENT_THREAD_ID_ADDR)
}

pub fn set_current_thread_id(ram: &mut [u8], id: u32) {
    write_u32(ram, CURRENT_THREAD_ID_ADDR, id);
}

pub fn custom_syscall(ram: &[u8], number: u32) -> u32 {
    if number >= CUSTOM_SYSCALL_COUNT {
        return 0;
    }
    read_u32(ram, CUSTOM_SYSCALL_BASE + number * 4)
}

pub fn set_custom_syscall(ram: &mut [u8], number: u32, addr: u32) {
    if number < CUSTOM_SYSCALL_COUNT {
        write_u32(ram, CUSTOM_SYSCALL_BASE + number * 4, addr);
    }
}

/// Thread run states. The discriminants are the on-wire values; zeroed
/// memory never aliases a live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadStatus {
    Running = 1,
    Sleeping = 2,
    Waiting = 3,
    Suspended = 4,
    SuspendedSleeping = 5,
    SuspendedWaiting = 6,
    Zombie = 7,
}

impl ThreadStatus {
    pub fn from_u32(raw: u32) -> Option<ThreadStatus> {
        Some(match raw {
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Sleeping,
            3 => ThreadStatus::Waiting,
            4 => ThreadStatus::Suspended,
            5 => ThreadStatus::SuspendedSleeping,
            6 => ThreadStatus::SuspendedWaiting,
            7 => ThreadStatus::Zombie,
            _ => return None,
        })
    }

    /// True for plain WAITING and its suspended variant.
    pub fn is_waiting(self) -> bool {
        matches!(self, ThreadStatus::Waiting | ThreadStatus::SuspendedWaiting)
    }
}

/// One thread control block. Field offsets, in order, each 4 bytes:
/// valid, status, context_ptr, stack_base, stack_size, heap_base, entry_pc,
/// saved_pc, priority, sema_wait, wakeup_count, quota, schedule_id.
#[derive(Debug, Clone, Copy)]
pub struct Thread {
    pub valid: u32,
    pub status: ThreadStatus,
    pub context_ptr: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    pub heap_base: u32,
    pub entry_pc: u32,
    pub saved_pc: u32,
    pub priority: u32,
    pub sema_wait: u32,
    pub wakeup_count: u32,
    pub quota: u32,
    pub schedule_id: u32,
}

impl Default for Thread {
    fn default() -> Self {
        Thread {
            valid: 0,
            status: ThreadStatus::Zombie,
            context_ptr: 0,
            stack_base: 0,
            stack_size: 0,
            heap_base: 0,
            entry_pc: 0,
            saved_pc: 0,
            priority: 0,
            sema_wait: 0,
            wakeup_count: 0,
            quota: 0,
            schedule_id: 0,
        }
    }
}

impl Thread {
    pub fn addr(id: u32) -> u32 {
        THREAD_BASE + id * THREAD_SIZE
    }

    pub fn load(ram: &[u8], id: u32) -> Thread {
        if id >= MAX_THREAD {
            return Thread::default();
        }
        let a = Self::addr(id);
        Thread {
            valid: read_u32(ram, a),
            status: ThreadStatus::from_u32(read_u32(ram, a + 0x04))
                .unwrap_or(ThreadStatus::Zombie),
            context_ptr: read_u32(ram, a + 0x08),
            stack_base: read_u32(ram, a + 0x0C),
            stack_size: read_u32(ram, a + 0x10),
            heap_base: read_u32(ram, a + 0x14),
            entry_pc: read_u32(ram, a + 0x18),
            saved_pc: read_u32(ram, a + 0x1C),
            priority: read_u32(ram, a + 0x20),
            sema_wait: read_u32(ram, a + 0x24),
            wakeup_count: read_u32(ram, a + 0x28),
            quota: read_u32(ram, a + 0x2C),
            schedule_id: read_u32(ram, a + 0x30),
        }
    }

    pub fn store(&self, ram: &mut [u8], id: u32) {
        if id >= MAX_THREAD {
            return;
        }
        let a = Self::addr(id);
        write_u32(ram, a, self.valid);
        write_u32(ram, a + 0x04, self.status as u32);
        write_u32(ram, a + 0x08, self.context_ptr);
        write_u32(ram, a + 0x0C, self.stack_base);
        write_u32(ram, a + 0x10, self.stack_size);
        write_u32(ram, a + 0x14, self.heap_base);
        write_u32(ram, a + 0x18, self.entry_pc);
        write_u32(ram, a + 0x1C, self.saved_pc);
        write_u32(ram, a + 0x20, self.priority);
        write_u32(ram, a + 0x24, self.sema_wait);
        write_u32(ram, a + 0x28, self.wakeup_count);
        write_u32(ram, a + 0x2C, self.quota);
        write_u32(ram, a + 0x30, self.schedule_id);
    }

    /// First id whose slot is free, scanning from 0.
    pub fn next_available_id(ram: &[u8]) -> Option<u32> {
        (0..MAX_THREAD).find(|&id| Thread::load(ram, id).valid != 1)
    }
}

/// One semaphore record: valid, count, max_count, wait_count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Semaphore {
    pub valid: u32,
    pub count: u32,
    pub max_count: u32,
    pub wait_count: u32,
}

impl Semaphore {
    /// Semaphore ids are 1-based; id 0 never resolves.
    pub fn addr(id: u32) -> Option<u32> {
        if id == 0 || id > MAX_SEMAPHORE {
            return None;
        }
        Some(SEMAPHORE_BASE + (id - 1) * SEMAPHORE_SIZE)
    }

    pub fn load(ram: &[u8], id: u32) -> Semaphore {
        let Some(a) = Self::addr(id) else {
            return Semaphore::default();
        };
        Semaphore {
            valid: read_u32(ram, a),
            count: read_u32(ram, a + 0x04),
            max_count: read_u32(ram, a + 0x08),
            wait_count: read_u32(ram, a + 0x0C),
        }
    }

    pub fn store(&self, ram: &mut [u8], id: u32) {
        let Some(a) = Self::addr(id) else {
            return;
        };
        write_u32(ram, a, self.valid);
        write_u32(ram, a + 0x04, self.count);
        write_u32(ram, a + 0x08, self.max_count);
        write_u32(ram, a + 0x0C, self.wait_count);
    }

    pub fn next_available_id(ram: &[u8]) -> Option<u32> {
        (1..MAX_SEMAPHORE).find(|&id| Semaphore::load(ram, id).valid != 1)
    }
}

/// One INTC or DMAC handler registration: valid, cause/channel selector,
/// handler address, callback argument, and the GP snapshot taken at
/// registration time. The 0x14 stride is hardcoded in the trampolines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Handler {
    pub valid: u32,
    pub selector: u32,
    pub address: u32,
    pub arg: u32,
    pub gp: u32,
}

impl Handler {
    // INTC and DMAC records share one stride
    const RECORD_SIZE: u32 = INTC_HANDLER_SIZE;

    fn addr(base: u32, count: u32, id: u32) -> Option<u32> {
        if id == 0 || id > count {
            return None;
        }
        Some(base + (id - 1) * Self::RECORD_SIZE)
    }

    fn load(ram: &[u8], base: u32, count: u32, id: u32) -> Handler {
        let Some(a) = Self::addr(base, count, id) else {
            return Handler::default();
        };
        Handler {
            valid: read_u32(ram, a),
            selector: read_u32(ram, a + 0x04),
            address: read_u32(ram, a + 0x08),
            arg: read_u32(ram, a + 0x0C),
            gp: read_u32(ram, a + 0x10),
        }
    }

    fn store(&self, ram: &mut [u8], base: u32, count: u32, id: u32) {
        let Some(a) = Self::addr(base, count, id) else {
            return;
        };
        write_u32(ram, a, self.valid);
        write_u32(ram, a + 0x04, self.selector);
        write_u32(ram, a + 0x08, self.address);
        write_u32(ram, a + 0x0C, self.arg);
        write_u32(ram, a + 0x10, self.gp);
    }

    pub fn load_intc(ram: &[u8], id: u32) -> Handler {
        Self::load(ram, INTC_HANDLER_BASE, MAX_INTCHANDLER, id)
    }

    pub fn store_intc(&self, ram: &mut [u8], id: u32) {
        self.store(ram, INTC_HANDLER_BASE, MAX_INTCHANDLER, id)
    }

    pub fn next_available_intc_id(ram: &[u8]) -> Option<u32> {
        (1..MAX_INTCHANDLER).find(|&id| Handler::load_intc(ram, id).valid != 1)
    }

    pub fn load_dmac(ram: &[u8], id: u32) -> Handler {
        Self::load(ram, DMAC_HANDLER_BASE, MAX_DMACHANDLER, id)
    }

    pub fn store_dmac(&self, ram: &mut [u8], id: u32) {
        self.store(ram, DMAC_HANDLER_BASE, MAX_DMACHANDLER, id)
    }

    pub fn next_available_dmac_id(ram: &[u8]) -> Option<u32> {
        (1..MAX_DMACHANDLER).find(|&id| Handler::load_dmac(ram, id).valid != 1)
    }
}

/// One DECI2 registration: valid, device, buffer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deci2Handler {
    pub valid: u32,
    pub device: u32,
    pub buffer_addr: u32,
}

impl Deci2Handler {
    pub fn addr(id: u32) -> Option<u32> {
        if id == 0 || id > MAX_DECI2HANDLER {
            return None;
        }
        Some(DECI2_HANDLER_BASE + (id - 1) * DECI2_HANDLER_SIZE)
    }

    pub fn load(ram: &[u8], id: u32) -> Deci2Handler {
        let Some(a) = Self::addr(id) else {
            return Deci2Handler::default();
        };
        Deci2Handler {
            valid: read_u32(ram, a),
            device: read_u32(ram, a + 0x04),
            buffer_addr: read_u32(ram, a + 0x08),
        }
    }

    pub fn store(&self, ram: &mut [u8], id: u32) {
        let Some(a) = Self::addr(id) else {
            return;
        };
        write_u32(ram, a, self.valid);
        write_u32(ram, a + 0x04, self.device);
        write_u32(ram, a + 0x08, self.buffer_addr);
    }

    pub fn next_available_id(ram: &[u8]) -> Option<u32> {
        (1..MAX_DECI2HANDLER).find(|&id| Deci2Handler::load(ram, id).valid != 1)
    }
}

/// The saved register file at the top of a thread's stack: 32 x 128-bit
/// GPR slots, with the remainder of [`STACK_RES`] reserved.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub gpr: [[u32; 4]; 32],
}

impl Default for ThreadContext {
    fn default() -> Self {
        ThreadContext { gpr: [[0; 4]; 32] }
    }
}

impl ThreadContext {
    /// Zero the full reserved area at `ptr`.
    pub fn clear(ram: &mut [u8], ptr: u32) {
        let a = ptr as usize;
        if let Some(region) = ram.get_mut(a..a + STACK_RES as usize) {
            region.fill(0);
        }
    }

    pub fn load(ram: &[u8], ptr: u32) -> ThreadContext {
        let mut ctx = ThreadContext::default();
        for (i, gpr) in ctx.gpr.iter_mut().enumerate() {
            for (lane, word) in gpr.iter_mut().enumerate() {
                *word = read_u32(ram, ptr + (i as u32) * 0x10 + (lane as u32) * 4);
            }
        }
        ctx
    }

    pub fn store(&self, ram: &mut [u8], ptr: u32) {
        for (i, gpr) in self.gpr.iter().enumerate() {
            for (lane, word) in gpr.iter().enumerate() {
                write_u32(ram, ptr + (i as u32) * 0x10 + (lane as u32) * 4, *word);
            }
        }
    }
}

/// Guest ABI view of the CreateThread/ReferThreadStatus parameter block.
/// Offsets: status, func, stack_base, stack_size, gp, priority,
/// current_priority.
pub mod thread_param {
    pub const STATUS: u32 = 0x00;
    pub const FUNC: u32 = 0x04;
    pub const STACK_BASE: u32 = 0x08;
    pub const STACK_SIZE: u32 = 0x0C;
    pub const GP: u32 = 0x10;
    pub const PRIORITY: u32 = 0x14;
    pub const CURRENT_PRIORITY: u32 = 0x18;
}

/// Guest ABI view of the CreateSema/ReferSemaStatus parameter block.
/// Offsets: count, max_count, init_count, wait_threads.
pub mod sema_param {
    pub const COUNT: u32 = 0x00;
    pub const MAX_COUNT: u32 = 0x04;
    pub const INIT_COUNT: u32 = 0x08;
    pub const WAIT_THREADS: u32 = 0x0C;
}
