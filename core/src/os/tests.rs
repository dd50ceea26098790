//! Kernel tests: boot, scheduling, semaphores, syscall dispatch and the
//! debugger surface, driven through mock collaborators.

use std::io::Read;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::cpu::{cop0, hw, reg, EeCpu, EeState, STATUS_INT};
use crate::dbg::{DebugCommands, DebugProxy};
use crate::devices::{GsHandler, Ioman, OsEvents, SifBridge, GS_CSR, GS_IMR};
use crate::os::bios;
use crate::os::layout::{
    current_thread_id, read_u32, sema_param, thread_param, write_u32, Semaphore, Thread,
    ThreadStatus, MAX_THREAD, SEMAPHORE_BASE, STACK_RES,
};
use crate::os::{parse_system_cnf, Kernel, Patch};
use crate::{shared_mem, SharedMem, EE_RAM_SIZE};

// --- Mock collaborators ------------------------------------------------

/// CPU stand-in: a register file plus a device-register map with the EE's
/// write semantics (INTC_MASK and the mask half of D_STAT toggle,
/// INTC_STAT and the pending half of D_STAT are write-1-to-clear).
struct TestCpu {
    state: EeState,
    devices: FxHashMap<u32, u32>,
    raised_exceptions: Vec<u32>,
    raised_interrupts: Vec<u32>,
}

impl TestCpu {
    fn new() -> TestCpu {
        let mut state = EeState::new();
        state.cop0[cop0::STATUS] = STATUS_INT;
        TestCpu {
            state,
            devices: FxHashMap::default(),
            raised_exceptions: Vec::new(),
            raised_interrupts: Vec::new(),
        }
    }
}

impl EeCpu for TestCpu {
    fn state(&mut self) -> &mut EeState {
        &mut self.state
    }

    fn state_ref(&self) -> &EeState {
        &self.state
    }

    fn read_device_word(&mut self, addr: u32) -> u32 {
        self.devices.get(&addr).copied().unwrap_or(0)
    }

    fn write_device_word(&mut self, addr: u32, value: u32) {
        let slot = self.devices.entry(addr).or_insert(0);
        match addr {
            hw::INTC_MASK => *slot ^= value,
            hw::INTC_STAT => *slot &= !value,
            hw::D_STAT => {
                *slot &= !(value & 0xFFFF);
                *slot ^= value & 0xFFFF_0000;
            }
            _ => *slot = value,
        }
    }

    fn fetch_instruction(&mut self, _addr: u32) -> u32 {
        0x0000_000C
    }

    fn raise_exception(&mut self, vector: u32) {
        self.raised_exceptions.push(vector);
    }

    fn raise_interrupt(&mut self, vector: u32) {
        self.raised_interrupts.push(vector);
    }
}

#[derive(Clone, Default)]
struct MockGs {
    regs: Arc<Mutex<FxHashMap<u32, u32>>>,
    crt: Arc<Mutex<Option<(bool, u32, bool)>>>,
}

impl GsHandler for MockGs {
    fn set_crt(&mut self, interlaced: bool, mode: u32, frame_mode: bool) {
        *self.crt.lock() = Some((interlaced, mode, frame_mode));
    }

    fn read_priv_register(&mut self, reg: u32) -> u32 {
        self.regs.lock().get(&reg).copied().unwrap_or(0)
    }

    fn write_priv_register(&mut self, reg: u32, value: u32) {
        self.regs.lock().insert(reg, value);
    }
}

#[derive(Clone, Default)]
struct MockSif {
    regs: Arc<Mutex<FxHashMap<u32, u32>>>,
}

impl SifBridge for MockSif {
    fn get_register(&mut self, id: u32) -> u32 {
        self.regs.lock().get(&id).copied().unwrap_or(0)
    }

    fn set_register(&mut self, id: u32, value: u32) {
        self.regs.lock().insert(id, value);
    }
}

#[derive(Clone, Default)]
struct MockIoman {
    files: Arc<Mutex<FxHashMap<String, Vec<u8>>>>,
    handles: Arc<Mutex<FxHashMap<u32, Vec<u8>>>>,
    console: Arc<Mutex<Vec<u8>>>,
    next_handle: Arc<Mutex<u32>>,
}

impl MockIoman {
    fn add_file(&self, path: &str, data: Vec<u8>) {
        self.files.lock().insert(path.to_owned(), data);
    }

    fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.console.lock()).into_owned()
    }
}

impl Ioman for MockIoman {
    fn open(&mut self, _flags: u32, path: &str) -> i32 {
        let Some(data) = self.files.lock().get(path).cloned() else {
            return -1;
        };
        let mut next = self.next_handle.lock();
        *next += 1;
        self.handles.lock().insert(*next, data);
        *next as i32
    }

    fn file_stream(&mut self, handle: u32) -> anyhow::Result<Box<dyn Read + '_>> {
        let data = self
            .handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("bad handle {handle}"))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn close(&mut self, handle: u32) {
        self.handles.lock().remove(&handle);
    }

    fn write(&mut self, fd: u32, data: &[u8]) -> u32 {
        if fd == 1 {
            self.console.lock().extend_from_slice(data);
        }
        data.len() as u32
    }
}

#[derive(Clone, Default)]
struct MockEvents {
    changes: Arc<Mutex<u32>>,
    unloads: Arc<Mutex<u32>>,
    cache_flushes: Arc<Mutex<u32>>,
    load_requests: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl OsEvents for MockEvents {
    fn executable_change(&mut self) {
        *self.changes.lock() += 1;
    }

    fn executable_unloading(&mut self) {
        *self.unloads.lock() += 1;
    }

    fn request_load_executable(&mut self, path: &str, args: &[String]) {
        self.load_requests.lock().push((path.to_owned(), args.to_vec()));
    }

    fn request_instruction_cache_flush(&mut self) {
        *self.cache_flushes.lock() += 1;
    }
}

// --- Fixture -----------------------------------------------------------

const ENTRY: u32 = 0x0010_0000;
const FIXTURE_CODE: [u8; 16] = [
    0x3C, 0x01, 0x80, 0x01, 0x34, 0x21, 0x10, 0x00, 0x00, 0x20, 0x08, 0x08, 0x00, 0x00, 0x00,
    0x00,
];

/// Minimal MIPS EXEC ELF with one LOAD segment at `ENTRY`.
fn fixture_elf() -> Vec<u8> {
    build_elf(8, 2)
}

fn build_elf(machine: u16, elf_type: u16) -> Vec<u8> {
    let mut image = vec![0u8; 0x90];
    // e_ident
    image[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    image[4] = 1; // 32-bit
    image[5] = 1; // little endian
    image[6] = 1; // current version
    let half = |image: &mut Vec<u8>, off: usize, v: u16| {
        image[off..off + 2].copy_from_slice(&v.to_le_bytes())
    };
    let word = |image: &mut Vec<u8>, off: usize, v: u32| {
        image[off..off + 4].copy_from_slice(&v.to_le_bytes())
    };
    half(&mut image, 0x10, elf_type);
    half(&mut image, 0x12, machine);
    word(&mut image, 0x14, 1); // e_version
    word(&mut image, 0x18, ENTRY); // e_entry
    word(&mut image, 0x1C, 0x34); // e_phoff
    half(&mut image, 0x28, 0x34); // e_ehsize
    half(&mut image, 0x2A, 0x20); // e_phentsize
    half(&mut image, 0x2C, 1); // e_phnum
    // Program header
    word(&mut image, 0x34, 1); // PT_LOAD
    word(&mut image, 0x38, 0x80); // p_offset
    word(&mut image, 0x3C, ENTRY); // p_vaddr
    word(&mut image, 0x40, ENTRY); // p_paddr
    word(&mut image, 0x44, 0x10); // p_filesz
    word(&mut image, 0x48, 0x10); // p_memsz
    image[0x80..0x90].copy_from_slice(&FIXTURE_CODE);
    image
}

struct Fixture {
    kernel: Kernel,
    cpu: TestCpu,
    ram: SharedMem,
    bios: SharedMem,
    gs: MockGs,
    sif: MockSif,
    ioman: MockIoman,
    events: MockEvents,
}

impl Fixture {
    fn new() -> Fixture {
        let ram = shared_mem(EE_RAM_SIZE as usize);
        let bios = shared_mem(0x4000);
        let gs = MockGs::default();
        let sif = MockSif::default();
        let ioman = MockIoman::default();
        let events = MockEvents::default();
        let kernel = Kernel::new(
            ram.clone(),
            bios.clone(),
            Some(Box::new(gs.clone())),
            Box::new(sif.clone()),
            Box::new(ioman.clone()),
            Box::new(events.clone()),
        );
        Fixture {
            kernel,
            cpu: TestCpu::new(),
            ram,
            bios,
            gs,
            sif,
            ioman,
            events,
        }
    }

    /// Boot the fixture ELF and set up the main thread the way crt0 would.
    fn booted() -> Fixture {
        let mut f = Fixture::new();
        f.kernel
            .load_elf(&mut f.cpu, &fixture_elf(), "FIXTURE.ELF", Vec::new())
            .unwrap();
        f.setup_main_thread();
        f
    }

    fn setup_main_thread(&mut self) {
        // SetupThread(gp, stack, stack_size, args, root_func)
        self.syscall(0x3C, &[0, 0x0100_0000, 0x0001_0000, 0x0004_0000, 0]);
    }

    fn syscall(&mut self, number: u32, args: &[u32]) {
        self.cpu.state.gpr[reg::V1].set_w0(number);
        for (i, &arg) in args.iter().enumerate() {
            self.cpu.state.gpr[reg::A0 + i].set_w0(arg);
        }
        self.cpu.state.cop0[cop0::EPC] = 0x0000_1000;
        self.kernel.handle_syscall(&mut self.cpu).unwrap();
    }

    fn v0(&self) -> u32 {
        self.cpu.state.gpr[reg::V0].v[0]
    }

    fn v0_is_error(&self) -> bool {
        self.cpu.state.gpr[reg::V0].v[0] == 0xFFFF_FFFF
            && self.cpu.state.gpr[reg::V0].v[1] == 0xFFFF_FFFF
    }

    fn current_thread(&self) -> u32 {
        current_thread_id(&self.ram.read()[..])
    }

    fn thread(&self, id: u32) -> Thread {
        Thread::load(&self.ram.read()[..], id)
    }

    fn sema(&self, id: u32) -> Semaphore {
        Semaphore::load(&self.ram.read()[..], id)
    }

    /// Write a CreateThread parameter block and issue the syscall.
    fn create_thread(&mut self, func: u32, stack_base: u32, priority: u32) -> u32 {
        let block = 0x0005_0000;
        {
            let mut ram = self.ram.write();
            write_u32(&mut ram[..], block + thread_param::FUNC, func);
            write_u32(&mut ram[..], block + thread_param::STACK_BASE, stack_base);
            write_u32(&mut ram[..], block + thread_param::STACK_SIZE, 0x1000);
            write_u32(&mut ram[..], block + thread_param::GP, 0x0040_0000);
            write_u32(&mut ram[..], block + thread_param::PRIORITY, priority);
        }
        self.syscall(0x20, &[block]);
        self.v0()
    }

    fn create_sema(&mut self, init: u32, max: u32) -> u32 {
        let block = 0x0005_1000;
        {
            let mut ram = self.ram.write();
            write_u32(&mut ram[..], block + sema_param::INIT_COUNT, init);
            write_u32(&mut ram[..], block + sema_param::MAX_COUNT, max);
        }
        self.syscall(0x40, &[block]);
        self.v0()
    }

    fn reschedule(&mut self) -> u32 {
        self.syscall(0x666, &[]);
        self.current_thread()
    }

    /// Structural invariants checked on demand. Thread 0 is the permanently
    /// allocated idle thread and lives outside the queue.
    fn check_invariants(&self) {
        let ram = self.ram.read();
        let ram = &ram[..];

        let queued: Vec<(u32, u32)> = self
            .kernel
            .schedule
            .iter(ram)
            .map(|e| (e.value, e.weight))
            .collect();

        for id in 1..MAX_THREAD {
            let thread = Thread::load(ram, id);
            let nodes: Vec<_> = queued.iter().filter(|(v, _)| *v == id).collect();
            if thread.valid == 1 {
                assert_eq!(nodes.len(), 1, "thread {id} should have one queue node");
                assert_eq!(nodes[0].1, thread.priority, "queue weight matches priority");
            } else {
                assert!(nodes.is_empty(), "freed thread {id} still queued");
            }
        }

        let waiting: u32 = (0..MAX_THREAD)
            .map(|id| {
                let t = Thread::load(ram, id);
                (t.valid == 1 && t.status.is_waiting()) as u32
            })
            .sum();
        let wait_counts: u32 = (1..crate::os::layout::MAX_SEMAPHORE)
            .map(|id| Semaphore::load(ram, id).wait_count)
            .sum();
        assert_eq!(waiting, wait_counts, "waiters must match semaphore wait counts");

        let current = current_thread_id(ram);
        if current != 0 {
            let thread = Thread::load(ram, current);
            assert_eq!(thread.status, ThreadStatus::Running);
        }
    }
}

// --- Boot and executable lifecycle -------------------------------------

#[test]
fn boot_fixture_loads_segments_and_entry() {
    let mut f = Fixture::new();
    f.kernel
        .load_elf(&mut f.cpu, &fixture_elf(), "FIXTURE.ELF", Vec::new())
        .unwrap();

    let ram = f.ram.read();
    assert_eq!(&ram[ENTRY as usize..ENTRY as usize + 16], &FIXTURE_CODE);
    drop(ram);

    assert_eq!(f.cpu.state.pc, ENTRY);
    assert_eq!(f.cpu.state.gpr[reg::K0].v[0], 0x8003_0000);

    let bios = f.bios.read();
    assert_eq!(read_u32(&bios[..], 0x0004), 0x0000_001D);
    drop(bios);

    assert_eq!(f.kernel.executable_name(), Some("FIXTURE.ELF"));
    assert_eq!(f.kernel.executable_range(), Some((ENTRY, ENTRY + 0x10)));
    assert_eq!(f.kernel.executable_entry_point(), Some(ENTRY));
    assert_eq!(*f.events.changes.lock(), 1);

    // The idle thread is armed on the wait trampoline.
    let idle = f.thread(0);
    assert_eq!(idle.valid, 1);
    assert_eq!(idle.status, ThreadStatus::Zombie);
    assert_eq!(idle.saved_pc, bios::WAIT_THREAD_ADDR);
}

#[test]
fn load_elf_rejects_foreign_images() {
    let mut f = Fixture::new();

    let err = f
        .kernel
        .load_elf(&mut f.cpu, &build_elf(0x3E, 2), "X.ELF", Vec::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid target CPU. Must be MIPS.");

    let err = f
        .kernel
        .load_elf(&mut f.cpu, &build_elf(8, 3), "X.ELF", Vec::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "Not an executable ELF file.");

    assert!(f.kernel.executable_name().is_none());
}

#[test]
fn bios_region_is_identical_across_boots() {
    let mut f = Fixture::new();
    f.kernel
        .load_elf(&mut f.cpu, &fixture_elf(), "FIXTURE.ELF", Vec::new())
        .unwrap();
    let first = f.bios.read().to_vec();
    f.kernel
        .load_elf(&mut f.cpu, &fixture_elf(), "FIXTURE.ELF", Vec::new())
        .unwrap();
    assert_eq!(first, f.bios.read().to_vec());
    assert_eq!(*f.events.unloads.lock(), 1);
}

#[test]
fn patches_apply_to_the_matching_executable() {
    let mut f = Fixture::new();
    f.kernel.set_patches(
        "FIXTURE.ELF",
        vec![Patch {
            address: ENTRY,
            value: 0xDEAD_BEEF,
        }],
    );
    f.kernel.set_patches(
        "OTHER.ELF",
        vec![Patch {
            address: ENTRY + 4,
            value: 0x1111_1111,
        }],
    );
    f.kernel
        .load_elf(&mut f.cpu, &fixture_elf(), "FIXTURE.ELF", Vec::new())
        .unwrap();

    let ram = f.ram.read();
    assert_eq!(read_u32(&ram[..], ENTRY), 0xDEAD_BEEF);
    // The other executable's patch must not leak in.
    assert_eq!(
        read_u32(&ram[..], ENTRY + 4),
        u32::from_le_bytes([0x34, 0x21, 0x10, 0x00])
    );
}

#[test]
fn boot_from_cdrom_follows_boot2() {
    let mut f = Fixture::new();
    f.ioman.add_file(
        "cdrom0:SYSTEM.CNF",
        b"BOOT2 = cdrom0:\\SLUS_012.34;1\r\nVER=1.00\r\n".to_vec(),
    );
    f.ioman.add_file("cdrom0:\\SLUS_012.34;1", fixture_elf());

    f.kernel
        .boot_from_cdrom(&mut f.cpu, vec!["-debug".to_owned()])
        .unwrap();
    assert_eq!(f.kernel.executable_name(), Some("SLUS_012.34;1"));
    assert_eq!(f.cpu.state.pc, ENTRY);
}

#[test]
fn boot_from_cdrom_error_paths() {
    let mut f = Fixture::new();
    let err = f.kernel.boot_from_cdrom(&mut f.cpu, Vec::new()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "No 'SYSTEM.CNF' file found on the cdrom0 device."
    );

    f.ioman.add_file("cdrom0:SYSTEM.CNF", b"VER=1.00\r\n".to_vec());
    let err = f.kernel.boot_from_cdrom(&mut f.cpu, Vec::new()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Error parsing 'SYSTEM.CNF' for a BOOT2 value."
    );

    f.ioman.add_file(
        "cdrom0:SYSTEM.CNF",
        b"BOOT2 = cdrom0:\\MISSING.ELF;1\r\n".to_vec(),
    );
    let err = f.kernel.boot_from_cdrom(&mut f.cpu, Vec::new()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Couldn't open executable specified in SYSTEM.CNF."
    );
}

#[test]
fn system_cnf_parsing() {
    let path = parse_system_cnf("BOOT2 = cdrom0:\\SLUS_012.34;1\r\nVER=1.00\r\n").unwrap();
    assert_eq!(path, "cdrom0:\\SLUS_012.34;1");

    // No space after the separator is also legal.
    let path = parse_system_cnf("BOOT2=cdrom0:\\A.ELF\n").unwrap();
    assert_eq!(path, "cdrom0:\\A.ELF");

    assert!(parse_system_cnf("VER=1.00\r\n").is_none());
}

#[test]
fn load_executable_sections_returns_entry_and_flushes() {
    let mut f = Fixture::booted();
    f.ioman.add_file("cdrom0:\\NEXT.ELF", fixture_elf());
    let entry = f.kernel.load_executable_sections("cdrom0:\\NEXT.ELF").unwrap();
    assert_eq!(entry, ENTRY);
    assert_eq!(*f.events.cache_flushes.lock(), 1);
}

// --- Threads and scheduling --------------------------------------------

#[test]
fn setup_thread_builds_argv_and_main_thread() {
    let mut f = Fixture::new();
    f.kernel
        .load_elf(
            &mut f.cpu,
            &fixture_elf(),
            "FIXTURE.ELF",
            vec!["-level=2".to_owned()],
        )
        .unwrap();
    f.syscall(0x3C, &[0, 0x0100_0000, 0x0001_0000, 0x0004_0000, 0]);

    let top = 0x0101_0000 - STACK_RES;
    assert_eq!(f.v0(), top);
    assert_eq!(f.current_thread(), 1);

    let main = f.thread(1);
    assert_eq!(main.valid, 1);
    assert_eq!(main.status, ThreadStatus::Running);
    assert_eq!(main.priority, 0);
    assert_eq!(main.context_ptr, top);
    assert_eq!(main.stack_base, 0x0100_0000);

    // argv block: argc, pointer table, packed strings.
    let ram = f.ram.read();
    assert_eq!(read_u32(&ram[..], 0x0004_0000), 2);
    let arg0 = read_u32(&ram[..], 0x0004_0004);
    let arg1 = read_u32(&ram[..], 0x0004_0008);
    assert_eq!(arg0, 0x0004_000C);
    assert_eq!(
        &ram[arg0 as usize..arg0 as usize + 12],
        b"FIXTURE.ELF\0"
    );
    assert_eq!(arg1, arg0 + 12);
    assert_eq!(&ram[arg1 as usize..arg1 as usize + 9], b"-level=2\0");
}

#[test]
fn thread_table_full_then_reusable() {
    let mut f = Fixture::booted();

    // Ids 0 (idle) and 1 (main) are taken; fill the rest.
    let mut created = Vec::new();
    for _ in 0..(MAX_THREAD - 2) {
        let id = f.create_thread(ENTRY, 0x0060_0000, 100);
        assert!(!f.v0_is_error());
        created.push(id);
    }
    f.create_thread(ENTRY, 0x0060_0000, 100);
    assert!(f.v0_is_error());

    // Deleting any thread frees its id for the next create.
    let victim = created[40];
    f.syscall(0x21, &[victim]);
    assert_eq!(f.v0(), 0);
    let id = f.create_thread(ENTRY, 0x0060_0000, 100);
    assert_eq!(id, victim);
    f.check_invariants();
}

#[test]
fn create_thread_arms_context_and_epilog() {
    let mut f = Fixture::booted();
    let id = f.create_thread(ENTRY, 0x0060_0000, 20);
    let thread = f.thread(id);
    assert_eq!(thread.status, ThreadStatus::Zombie);
    assert_eq!(thread.entry_pc, ENTRY);
    assert_eq!(thread.context_ptr, 0x0060_1000 - STACK_RES);

    let ram = f.ram.read();
    let ctx = thread.context_ptr;
    // SP, FP point at the context base; RA at the exit trampoline.
    assert_eq!(read_u32(&ram[..], ctx + (reg::SP as u32) * 0x10), ctx);
    assert_eq!(read_u32(&ram[..], ctx + (reg::FP as u32) * 0x10), ctx);
    assert_eq!(
        read_u32(&ram[..], ctx + (reg::RA as u32) * 0x10),
        bios::THREAD_EPILOG_ADDR
    );
    drop(ram);

    // StartThread re-arms A0 and the entry point.
    f.syscall(0x22, &[id, 0x1234_5678]);
    let ram = f.ram.read();
    assert_eq!(
        read_u32(&ram[..], f.thread(id).context_ptr + (reg::A0 as u32) * 0x10),
        0x1234_5678
    );
    drop(ram);
    assert_eq!(f.thread(id).status, ThreadStatus::Running);
}

#[test]
fn start_exit_cycle_can_repeat() {
    let mut f = Fixture::booted();
    let id = f.create_thread(ENTRY, 0x0060_0000, 5);

    f.syscall(0x22, &[id, 1]);
    assert_eq!(f.thread(id).status, ThreadStatus::Running);

    // Switch into it, then exit from it.
    f.syscall(0x23, &[]); // main exits
    assert_eq!(f.current_thread(), id);
    f.syscall(0x23, &[]);
    assert_eq!(f.thread(id).status, ThreadStatus::Zombie);
    assert_eq!(f.current_thread(), 0);

    // A second StartThread is legal and re-arms A0.
    f.syscall(0x22, &[id, 2]);
    assert_eq!(f.thread(id).status, ThreadStatus::Running);
    assert_eq!(f.thread(id).saved_pc, ENTRY);
    let ram = f.ram.read();
    assert_eq!(
        read_u32(&ram[..], f.thread(id).context_ptr + (reg::A0 as u32) * 0x10),
        2
    );
}

#[test]
fn priority_bands_run_in_fifo_order() {
    let mut f = Fixture::booted();

    let t10a = f.create_thread(ENTRY, 0x0060_0000, 10);
    let t5a = f.create_thread(ENTRY, 0x0061_0000, 5);
    let t5b = f.create_thread(ENTRY, 0x0062_0000, 5);
    let t10b = f.create_thread(ENTRY, 0x0063_0000, 10);
    for id in [t10a, t5a, t5b, t10b] {
        f.syscall(0x22, &[id, 0]);
    }
    f.check_invariants();

    // Retire each elected thread in turn; the scheduler should hand us the
    // 5-band in insertion order, then the 10-band.
    let mut order = Vec::new();
    f.syscall(0x23, &[]); // main thread exits
    for _ in 0..4 {
        order.push(f.current_thread());
        f.syscall(0x23, &[]);
    }
    assert_eq!(order, vec![t5a, t5b, t10a, t10b]);
    assert_eq!(f.current_thread(), 0);
}

#[test]
fn scheduler_quota_drains_by_band() {
    let mut f = Fixture::booted();

    let t5a = f.create_thread(ENTRY, 0x0060_0000, 5);
    let t5b = f.create_thread(ENTRY, 0x0061_0000, 5);
    let t3 = f.create_thread(ENTRY, 0x0062_0000, 3);
    for id in [t5a, t5b, t3] {
        f.syscall(0x22, &[id, 0]);
    }

    let mut chosen = Vec::new();
    for _ in 0..30 {
        chosen.push(f.reschedule());
    }

    // Thread 1 (priority 0) runs until its quota is spent, then the head
    // of band 3, then band 5 only once the higher bands have drained.
    let mut expected = vec![1u32; 14];
    expected.extend(vec![t3; 15]);
    expected.push(t5a);
    assert_eq!(chosen, expected);

    // Keep going: band 5 round-robins once everything above is spent.
    for _ in 0..30 {
        chosen.push(f.reschedule());
    }
    assert!(chosen.contains(&t5b));
    f.check_invariants();
}

#[test]
fn change_priority_requeues_and_reports_previous() {
    let mut f = Fixture::booted();
    let a = f.create_thread(ENTRY, 0x0060_0000, 20);
    f.syscall(0x22, &[a, 0]);

    f.syscall(0x29, &[a, 8]);
    assert_eq!(f.v0(), 20);
    assert_eq!(f.thread(a).priority, 8);
    f.check_invariants();

    f.syscall(0x29, &[999, 8]);
    assert!(f.v0_is_error());
}

#[test]
fn rotate_ready_queue_moves_band_head() {
    let mut f = Fixture::booted();
    let a = f.create_thread(ENTRY, 0x0060_0000, 9);
    let b = f.create_thread(ENTRY, 0x0061_0000, 9);
    f.syscall(0x22, &[a, 0]);
    f.syscall(0x22, &[b, 0]);

    f.syscall(0x2B, &[9]);
    assert_eq!(f.v0(), 9);

    let ram = f.ram.read();
    let band: Vec<u32> = f
        .kernel
        .schedule
        .iter(&ram[..])
        .filter(|e| e.weight == 9)
        .map(|e| e.value)
        .collect();
    assert_eq!(band, vec![b, a]);
}

#[test]
fn sleep_wakeup_balance() {
    let mut f = Fixture::booted();

    // A wakeup before sleeping banks a count; the next sleep consumes it.
    f.syscall(0x33, &[1]);
    assert_eq!(f.thread(1).wakeup_count, 1);
    f.syscall(0x32, &[]);
    assert_eq!(f.thread(1).status, ThreadStatus::Running);
    assert_eq!(f.thread(1).wakeup_count, 0);

    // Without a banked count the thread actually sleeps.
    f.syscall(0x32, &[]);
    assert_eq!(f.thread(1).status, ThreadStatus::Sleeping);
    assert_eq!(f.current_thread(), 0);

    f.syscall(0x33, &[1]);
    assert_eq!(f.thread(1).status, ThreadStatus::Running);
    f.check_invariants();
}

#[test]
fn suspend_resume_layers_over_sleep_and_wait() {
    let mut f = Fixture::booted();
    let a = f.create_thread(ENTRY, 0x0060_0000, 10);
    f.syscall(0x22, &[a, 0]);

    f.syscall(0x37, &[a]);
    assert_eq!(f.thread(a).status, ThreadStatus::Suspended);
    f.syscall(0x39, &[a]);
    assert_eq!(f.thread(a).status, ThreadStatus::Running);

    // Suspending a waiting thread keeps its semaphore linkage.
    let sema = f.create_sema(0, 1);
    f.syscall(0x23, &[]); // main exits, a runs
    assert_eq!(f.current_thread(), a);
    f.syscall(0x44, &[sema]);
    assert_eq!(f.thread(a).status, ThreadStatus::Waiting);
    f.syscall(0x37, &[a]);
    assert_eq!(f.thread(a).status, ThreadStatus::SuspendedWaiting);

    // A signal can only lift it back to plain suspended.
    f.syscall(0x43, &[sema]);
    assert_eq!(f.thread(a).status, ThreadStatus::Suspended);
    assert_eq!(f.sema(sema).wait_count, 0);
    f.check_invariants();
}

#[test]
fn refer_thread_status_reports_state_codes() {
    let mut f = Fixture::booted();
    let a = f.create_thread(ENTRY, 0x0060_0000, 30);

    let block = 0x0005_4000;
    f.syscall(0x30, &[a, block]);
    assert_eq!(f.v0(), 0x10); // dormant

    f.syscall(0x22, &[a, 0]);
    f.syscall(0x30, &[a, block]);
    assert_eq!(f.v0(), 0x01); // running

    let ram = f.ram.read();
    assert_eq!(read_u32(&ram[..], block + thread_param::STATUS), 0x01);
    assert_eq!(read_u32(&ram[..], block + thread_param::PRIORITY), 30);
    assert_eq!(
        read_u32(&ram[..], block + thread_param::STACK_BASE),
        0x0060_0000
    );
    drop(ram);

    f.syscall(0x30, &[200, block]);
    assert!(f.v0_is_error());
}

#[test]
fn get_thread_id_and_heap() {
    let mut f = Fixture::booted();
    f.syscall(0x2F, &[]);
    assert_eq!(f.v0(), 1);

    f.syscall(0x3D, &[0x0070_0000, 0x0008_0000]);
    assert_eq!(f.v0(), 0x0078_0000);
    f.syscall(0x3E, &[]);
    assert_eq!(f.v0(), 0x0078_0000);

    // Size -1 inherits the stack base as the heap end.
    f.syscall(0x3D, &[0x0070_0000, 0xFFFF_FFFF]);
    assert_eq!(f.v0(), f.thread(1).stack_base);

    // A thread created now inherits the creator's heap.
    let id = f.create_thread(ENTRY, 0x0060_0000, 10);
    assert_eq!(f.thread(id).heap_base, f.thread(1).heap_base);
}

// --- Semaphores --------------------------------------------------------

#[test]
fn sema_create_delete_round_trip() {
    let mut f = Fixture::booted();
    let id = f.create_sema(2, 4);
    assert_eq!(id, 1);
    let s = f.sema(id);
    assert_eq!((s.count, s.max_count, s.wait_count), (2, 4, 0));

    f.syscall(0x41, &[id]);
    assert_eq!(f.v0(), id);
    assert_eq!(f.sema(id).valid, 0);

    // The slot is immediately reusable.
    let again = f.create_sema(0, 1);
    assert_eq!(again, id);

    f.syscall(0x41, &[99]);
    assert!(f.v0_is_error());
}

#[test]
fn wait_decrements_then_blocks() {
    let mut f = Fixture::booted();
    let id = f.create_sema(1, 1);

    f.cpu.state.gpr[reg::RA].set_w0(0x0020_0000);
    f.syscall(0x44, &[id]);
    assert_eq!(f.v0(), id);
    assert_eq!(f.sema(id).count, 0);
    assert_eq!(f.current_thread(), 1);

    // Second wait has nothing to take: the caller blocks and the idle
    // thread takes over.
    f.syscall(0x44, &[id]);
    assert_eq!(f.thread(1).status, ThreadStatus::Waiting);
    assert_eq!(f.thread(1).sema_wait, id);
    assert_eq!(f.sema(id).wait_count, 1);
    assert_eq!(f.current_thread(), 0);
    f.check_invariants();
}

#[test]
fn semaphore_handoff_wakes_the_waiter() {
    let mut f = Fixture::booted();
    let sema = f.create_sema(0, 1);

    let a = f.create_thread(ENTRY, 0x0060_0000, 10);
    let b = f.create_thread(ENTRY, 0x0061_0000, 10);
    f.syscall(0x22, &[a, 0]);

    // Main retires; A runs and waits.
    f.syscall(0x23, &[]);
    assert_eq!(f.current_thread(), a);
    f.syscall(0x44, &[sema]);
    assert_eq!(f.thread(a).status, ThreadStatus::Waiting);
    assert_eq!(f.current_thread(), 0);

    // B starts and signals.
    f.syscall(0x22, &[b, 0]);
    f.reschedule();
    assert_eq!(f.current_thread(), b);
    f.syscall(0x42, &[sema]);

    let woken = f.thread(a);
    assert_eq!(woken.status, ThreadStatus::Running);
    assert_eq!(woken.quota, 15);
    assert_eq!(f.sema(sema).count, 0);
    assert_eq!(f.sema(sema).wait_count, 0);
    f.check_invariants();
}

#[test]
fn signal_without_waiters_can_exceed_max_count() {
    let mut f = Fixture::booted();
    let id = f.create_sema(1, 1);

    // The kernel does not clamp the count at max_count; a stray signal
    // pushes it past the ceiling and stays there.
    f.syscall(0x42, &[id]);
    assert_eq!(f.sema(id).count, 2);
    assert!(f.sema(id).count > f.sema(id).max_count);
}

#[test]
fn poll_sema_never_blocks() {
    let mut f = Fixture::booted();
    let id = f.create_sema(1, 1);

    f.syscall(0x45, &[id]);
    assert_eq!(f.v0(), id);
    f.syscall(0x45, &[id]);
    assert!(f.v0_is_error());
    assert_eq!(f.thread(1).status, ThreadStatus::Running);
    assert_eq!(f.current_thread(), 1);
}

#[test]
fn refer_sema_status_writes_the_param_block() {
    let mut f = Fixture::booted();
    let id = f.create_sema(3, 5);
    let block = 0x0005_2000;

    f.syscall(0x47, &[id, block]);
    assert_eq!(f.v0(), id);
    let ram = f.ram.read();
    assert_eq!(read_u32(&ram[..], block + sema_param::COUNT), 3);
    assert_eq!(read_u32(&ram[..], block + sema_param::MAX_COUNT), 5);
    assert_eq!(read_u32(&ram[..], block + sema_param::WAIT_THREADS), 0);
}

// --- Dispatch, idle detection, devices ---------------------------------

#[test]
fn custom_syscall_routes_through_the_bios_gate() {
    let mut f = Fixture::booted();

    f.syscall(0x74, &[0x20, 0x0012_3456]);
    assert_eq!(f.v0(), 0);

    let threads_before: Vec<u32> = (0..MAX_THREAD).map(|id| f.thread(id).valid).collect();
    f.syscall(0x20, &[0x0005_0000]);
    assert_eq!(f.cpu.raised_exceptions, vec![bios::SYSCALL_GATE_ADDR]);
    // The builtin CreateThread must not have run.
    let threads_after: Vec<u32> = (0..MAX_THREAD).map(|id| f.thread(id).valid).collect();
    assert_eq!(threads_before, threads_after);
}

#[test]
fn negative_syscall_numbers_are_normalized() {
    let mut f = Fixture::booted();
    // iWakeupThread invoked with the two's complement encoding.
    f.syscall(0x34u32.wrapping_neg(), &[1]);
    assert_eq!(f.cpu.state.gpr[reg::V1].v[0], 0x34);
    assert_eq!(f.thread(1).wakeup_count, 1);
}

#[test]
fn unknown_syscalls_are_ignored() {
    let mut f = Fixture::booted();
    let before = f.current_thread();
    f.syscall(0x5A, &[1, 2, 3]);
    f.syscall(0x7B, &[]);
    assert_eq!(f.current_thread(), before);
    assert!(f.cpu.raised_exceptions.is_empty());
}

#[test]
fn idle_detection_trips_after_101_spins() {
    let mut f = Fixture::booted();
    let sema = f.create_sema(0, 1);

    // Spin: wait (blocks), a signal from interrupt context wakes us, and
    // the next reschedule puts us back; the return address never moves.
    let spin = |f: &mut Fixture| {
        f.cpu.state.gpr[reg::RA].set_w0(0x0020_0000);
        f.syscall(0x44, &[sema]);
        f.syscall(0x43, &[sema]);
        f.reschedule();
    };

    for _ in 0..100 {
        spin(&mut f);
        assert!(!f.kernel.is_idle());
    }
    spin(&mut f);
    assert!(f.kernel.is_idle());
    assert_eq!(f.sema(sema).count, 0);
}

#[test]
fn exception_entry_resets_the_idle_counter() {
    let mut f = Fixture::booted();
    let sema = f.create_sema(0, 1);

    let spin = |f: &mut Fixture| {
        f.cpu.state.gpr[reg::RA].set_w0(0x0020_0000);
        f.syscall(0x44, &[sema]);
        f.syscall(0x43, &[sema]);
        f.reschedule();
    };

    for _ in 0..60 {
        spin(&mut f);
    }
    f.kernel.handle_exception(&mut f.cpu);
    assert_eq!(f.cpu.raised_interrupts, vec![bios::EXCEPTION_VECTOR_ADDR]);

    for _ in 0..41 {
        spin(&mut f);
    }
    assert!(!f.kernel.is_idle());

    for _ in 0..101 {
        spin(&mut f);
    }
    assert!(f.kernel.is_idle());
}

#[test]
fn intc_enable_disable_toggle_exactly_one_bit() {
    let mut f = Fixture::booted();

    f.syscall(0x14, &[3]);
    assert_eq!(f.v0(), 1);
    assert_eq!(f.cpu.devices[&hw::INTC_MASK], 1 << 3);

    // Enabling again must not toggle the bit back off.
    f.syscall(0x14, &[3]);
    assert_eq!(f.cpu.devices[&hw::INTC_MASK], 1 << 3);

    f.syscall(0x15, &[3]);
    assert_eq!(f.cpu.devices[&hw::INTC_MASK], 0);
    f.syscall(0x15, &[3]);
    assert_eq!(f.cpu.devices[&hw::INTC_MASK], 0);
}

#[test]
fn dmac_enable_also_unmasks_int1() {
    let mut f = Fixture::booted();

    f.syscall(0x16, &[2]);
    assert_eq!(f.v0(), 1);
    assert_eq!(f.cpu.devices[&hw::D_STAT], 0x10000 << 2);
    assert_eq!(f.cpu.devices[&hw::INTC_MASK], 0x02);

    f.syscall(0x17, &[2]);
    assert_eq!(f.cpu.state.gpr[reg::V0].d0(), 1);
    assert_eq!(f.cpu.devices[&hw::D_STAT], 0);

    // Disabling a channel that is not enabled reports 0.
    f.syscall(0x17, &[2]);
    assert_eq!(f.cpu.state.gpr[reg::V0].d0(), 0);
}

#[test]
fn intc_and_dmac_handler_tables() {
    let mut f = Fixture::booted();

    f.cpu.state.gpr[reg::GP].set_w0(0x0040_0000);
    f.syscall(0x10, &[2, 0x0030_0000, 0, 0x11]);
    let intc_id = f.v0();
    assert_eq!(intc_id, 1);
    let ram = f.ram.read();
    let h = crate::os::layout::Handler::load_intc(&ram[..], intc_id);
    assert_eq!((h.valid, h.selector, h.address, h.arg, h.gp), (1, 2, 0x0030_0000, 0x11, 0x0040_0000));
    drop(ram);

    f.syscall(0x11, &[2, intc_id]);
    assert_eq!(f.v0(), 0);
    let ram = f.ram.read();
    assert_eq!(crate::os::layout::Handler::load_intc(&ram[..], intc_id).valid, 0);
    drop(ram);

    f.syscall(0x11, &[2, intc_id]);
    assert!(f.v0_is_error());

    f.syscall(0x12, &[5, 0x0031_0000, 0, 0x22]);
    let dmac_id = f.v0();
    assert_eq!(dmac_id, 1);
    f.syscall(0x13, &[5, dmac_id]);
    let ram = f.ram.read();
    assert_eq!(crate::os::layout::Handler::load_dmac(&ram[..], dmac_id).valid, 0);
}

#[test]
fn gs_syscalls_pass_through() {
    let mut f = Fixture::booted();

    f.syscall(0x02, &[1, 3, 0]);
    assert_eq!(*f.gs.crt.lock(), Some((true, 3, false)));

    f.syscall(0x71, &[0x0000_FF00]);
    assert_eq!(f.gs.regs.lock()[&GS_IMR], 0x0000_FF00);
    f.syscall(0x70, &[]);
    assert_eq!(f.v0(), 0x0000_FF00);

    f.gs.regs.lock().insert(GS_CSR, 0x2008);
    f.syscall(0x73, &[0x0005_8000, 0x0005_8010]);
    let ram = f.ram.read();
    assert_eq!(read_u32(&ram[..], 0x0005_8000), 1);
    assert_eq!(read_u32(&ram[..], 0x0005_8010), 0x2000);
}

#[test]
fn sif_syscalls_touch_bridge_and_dma_registers() {
    let mut f = Fixture::booted();

    f.syscall(0x79, &[0x8000_0002, 0xCAFE]);
    assert_eq!(f.sif.regs.lock()[&0x8000_0002], 0xCAFE);
    f.syscall(0x7A, &[0x8000_0002]);
    assert_eq!(f.v0(), 0xCAFE);

    // One transfer descriptor: 0x28 bytes round up to 3 quadwords.
    {
        let mut ram = f.ram.write();
        write_u32(&mut ram[..], 0x0005_6000, 0x0020_0000);
        write_u32(&mut ram[..], 0x0005_6004, 0x0000_9000);
        write_u32(&mut ram[..], 0x0005_6008, 0x28);
        write_u32(&mut ram[..], 0x0005_600C, 0);
    }
    f.syscall(0x77, &[0x0005_6000, 1]);
    assert_eq!(f.v0(), 1);
    assert_eq!(f.cpu.devices[&hw::D6_MADR], 0x0020_0000);
    assert_eq!(f.cpu.devices[&hw::D6_TADR], 0x0000_9000);
    assert_eq!(f.cpu.devices[&hw::D6_QWC], 3);
    assert_eq!(f.cpu.devices[&hw::D6_CHCR], 0x100);

    f.syscall(0x76, &[]);
    assert!(f.v0_is_error());
}

#[test]
fn deci2_console_reaches_the_iop() {
    let mut f = Fixture::booted();

    {
        let mut ram = f.ram.write();
        ram[0x0005_9000..0x0005_9007].copy_from_slice(b"hello\n\0");
        write_u32(&mut ram[..], 0x0005_9100, 0x0005_9000);
    }
    f.syscall(0x7C, &[0x10, 0x0005_9100]);
    assert_eq!(f.ioman.console_text(), "hello\n");
}

#[test]
fn deci2_open_and_send() {
    let mut f = Fixture::booted();

    // Open: device id + buffer pointer live behind the parameter block.
    {
        let mut ram = f.ram.write();
        write_u32(&mut ram[..], 0x0005_9200, 0x0100); // device
        write_u32(&mut ram[..], 0x0005_9204, 0x0005_9300); // buffer
    }
    f.syscall(0x7C, &[0x01, 0x0005_9200]);
    let id = f.v0();
    assert_eq!(id, 1);

    // Send: buffer+0x10 points at a length-prefixed record.
    {
        let mut ram = f.ram.write();
        write_u32(&mut ram[..], 0x0005_9310, 0x0005_9400);
        ram[0x0005_9400] = 0x0C + 3;
        ram[0x0005_940C..0x0005_940F].copy_from_slice(b"ok\n");
        write_u32(&mut ram[..], 0x0005_9500, id);
    }
    f.syscall(0x7C, &[0x03, 0x0005_9500]);
    assert_eq!(f.v0(), 1);
    assert_eq!(f.ioman.console_text(), "ok\n");
}

#[test]
fn flush_cache_and_memory_size() {
    let mut f = Fixture::booted();

    f.syscall(0x64, &[0]);
    assert_eq!(*f.events.cache_flushes.lock(), 0);
    f.syscall(0x64, &[2]);
    assert_eq!(*f.events.cache_flushes.lock(), 1);

    f.syscall(0x7F, &[]);
    assert_eq!(f.v0(), EE_RAM_SIZE);
}

#[test]
fn load_exec_requests_reach_the_embedder() {
    let mut f = Fixture::booted();

    {
        let mut ram = f.ram.write();
        ram[0x0005_A000..0x0005_A00E].copy_from_slice(b"cdrom0:\\B.ELF\0");
        ram[0x0005_A100..0x0005_A103].copy_from_slice(b"-x\0");
        write_u32(&mut ram[..], 0x0005_A200, 0x0005_A100);
    }
    f.syscall(0x06, &[0x0005_A000, 1, 0x0005_A200]);

    let requests = f.events.load_requests.lock();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "cdrom0:\\B.ELF");
    assert_eq!(requests[0].1, vec!["-x".to_owned()]);
}

// --- Introspection -----------------------------------------------------

#[test]
fn thread_infos_follow_queue_order() {
    let mut f = Fixture::booted();
    let a = f.create_thread(ENTRY, 0x0060_0000, 10);
    let sema = f.create_sema(0, 1);
    f.syscall(0x22, &[a, 0]);

    let infos = f.kernel.thread_infos(&f.cpu);
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].id, 1);
    assert_eq!(infos[0].state, "Running");
    // The current thread reports the live PC.
    assert_eq!(infos[0].pc, f.cpu.state.pc);
    assert_eq!(infos[1].id, a);

    // Block A on the semaphore and check the description.
    f.syscall(0x23, &[]);
    f.syscall(0x44, &[sema]);
    let infos = f.kernel.thread_infos(&f.cpu);
    let waiting = infos.iter().find(|i| i.id == a).unwrap();
    assert_eq!(waiting.state, format!("Waiting (Semaphore: {sema})"));
}

#[test]
fn module_infos_cover_the_loaded_executable() {
    let f = Fixture::booted();
    let modules = f.kernel.module_infos();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].name, "FIXTURE.ELF");
    assert_eq!(modules[0].begin, ENTRY);
    assert_eq!(modules[0].end, ENTRY + 0x10);
}

#[test]
fn debug_proxy_round_trip() {
    let mut f = Fixture::booted();
    let proxy = DebugProxy::new();
    f.kernel.attach_debug_proxy(proxy.clone());

    proxy.dbg_tx.send(DebugCommands::Threads(Vec::new())).unwrap();
    proxy.dbg_tx.send(DebugCommands::IsIdle(false)).unwrap();
    proxy
        .dbg_tx
        .send(DebugCommands::Peek(SEMAPHORE_BASE, crate::dbg::Bytes(4)))
        .unwrap();
    f.kernel.service_debug_requests(&f.cpu);

    match proxy.dbg_rx.recv().unwrap() {
        DebugCommands::Threads(infos) => assert_eq!(infos[0].id, 1),
        other => panic!("unexpected reply {other:?}"),
    }
    match proxy.dbg_rx.recv().unwrap() {
        DebugCommands::IsIdle(idle) => assert!(!idle),
        other => panic!("unexpected reply {other:?}"),
    }
    match proxy.dbg_rx.recv().unwrap() {
        DebugCommands::Data(data) => assert_eq!(data.len(), 4),
        other => panic!("unexpected reply {other:?}"),
    }
}
