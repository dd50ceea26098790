//! The kernel proper: boot and executable lifecycle, the cooperative
//! scheduler, the syscall dispatcher, and the debugger-facing exports.

pub mod asm;
pub mod bios;
pub mod layout;
pub mod ribbon;
mod syscalls;

#[cfg(test)]
mod tests;

use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use fxhash::FxHashMap;
use log::{debug, info, warn};

use crate::cpu::{cop0, reg, EeCpu, STATUS_EXL, STATUS_INT};
use crate::dbg::{Bytes, DebugCommands, DebugProxy, ModuleInfo, ThreadInfo};
use crate::devices::{GsHandler, Ioman, OsEvents, SifBridge, OPEN_FLAG_RDONLY};
use crate::os::layout::{
    current_thread_id, ram_mask, read_u32, set_current_thread_id, write_u32, Thread,
    ThreadContext, ThreadStatus, KERNEL_STACK_TOP, SCHEDULE_BASE, SCHEDULE_SIZE,
    THREAD_INIT_QUOTA,
};
use crate::os::ribbon::RoundRibbon;
use crate::{SharedMem, EE_RAM_SIZE};

/// Number of consecutive same-site WaitSema calls after which the caller is
/// declared to be spinning.
const IDLE_WAIT_THRESHOLD: u32 = 100;

/// One word override applied to guest RAM after an executable loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Patch {
    pub address: u32,
    pub value: u32,
}

#[derive(Debug)]
struct LoadedExecutable {
    name: String,
    entry: u32,
    range: (u32, u32),
}

/// Busy-wait-on-semaphore heuristic state. Any exception entry resets the
/// run of consecutive calls.
#[derive(Debug)]
struct IdleDetector {
    sema: u32,
    caller: u32,
    count: u32,
    idle_thread: u32,
}

impl IdleDetector {
    fn new() -> IdleDetector {
        IdleDetector {
            sema: u32::MAX,
            caller: 0,
            count: 0,
            idle_thread: u32::MAX,
        }
    }

    /// Record one WaitSema call; marks `current` idle once the same
    /// (semaphore, return address) pair repeats past the threshold.
    fn observe_wait(&mut self, sema: u32, caller: u32, current: u32) {
        if self.sema == sema && self.caller == caller {
            self.count += 1;
            if self.count > IDLE_WAIT_THRESHOLD {
                self.idle_thread = current;
            }
        } else {
            self.sema = sema;
            self.caller = caller;
            self.count = 1;
        }
    }
}

/// The guest-side kernel. One instance per emulated machine; RAM and the
/// BIOS image are shared with the rest of the emulator, the CPU is borrowed
/// per entry point, and the remaining collaborators are owned trait objects.
pub struct Kernel {
    ram: SharedMem,
    bios: SharedMem,
    gs: Option<Box<dyn GsHandler + Send>>,
    sif: Box<dyn SifBridge + Send>,
    ioman: Box<dyn Ioman + Send>,
    events: Box<dyn OsEvents + Send>,
    schedule: RoundRibbon,
    executable: Option<LoadedExecutable>,
    boot_arguments: Vec<String>,
    patches: FxHashMap<String, Vec<Patch>>,
    idle: IdleDetector,
    debug: Option<DebugProxy>,
}

impl Kernel {
    pub fn new(
        ram: SharedMem,
        bios: SharedMem,
        gs: Option<Box<dyn GsHandler + Send>>,
        sif: Box<dyn SifBridge + Send>,
        ioman: Box<dyn Ioman + Send>,
        events: Box<dyn OsEvents + Send>,
    ) -> Kernel {
        let schedule = RoundRibbon::new(SCHEDULE_BASE, SCHEDULE_SIZE);
        schedule.initialize(&mut ram.write()[..]);
        Kernel {
            ram,
            bios,
            gs,
            sif,
            ioman,
            events,
            schedule,
            executable: None,
            boot_arguments: Vec::new(),
            patches: FxHashMap::default(),
            idle: IdleDetector::new(),
            debug: None,
        }
    }

    /// True while the busy-wait heuristic believes the guest is spinning.
    pub fn is_idle(&self) -> bool {
        current_thread_id(&self.ram.read()[..]) == self.idle.idle_thread
    }

    pub fn executable_name(&self) -> Option<&str> {
        self.executable.as_ref().map(|e| e.name.as_str())
    }

    /// Guest address range covered by the loaded executable's segments.
    pub fn executable_range(&self) -> Option<(u32, u32)> {
        self.executable.as_ref().map(|e| e.range)
    }

    pub fn executable_entry_point(&self) -> Option<u32> {
        self.executable.as_ref().map(|e| e.entry)
    }

    /// Register the patch set to apply whenever `name` is loaded.
    pub fn set_patches(&mut self, name: impl Into<String>, patches: Vec<Patch>) {
        self.patches.insert(name.into(), patches);
    }

    pub fn attach_debug_proxy(&mut self, proxy: DebugProxy) {
        self.debug = Some(proxy);
    }

    // --- Boot / executable lifecycle -----------------------------------

    /// Boot an ELF straight from a host file.
    pub fn boot_from_file(&mut self, cpu: &mut dyn EeCpu, path: &Path) -> Result<()> {
        let data = std::fs::read(path)
            .map_err(|err| anyhow!("Error opening executable file: {}. Got error: {err}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.load_elf(cpu, &data, &name, Vec::new())
    }

    /// Boot whatever SYSTEM.CNF on the disc points at.
    pub fn boot_from_cdrom(&mut self, cpu: &mut dyn EeCpu, arguments: Vec<String>) -> Result<()> {
        let cnf = match self.read_ioman_file("cdrom0:SYSTEM.CNF") {
            Ok(data) => data,
            Err(_) => bail!("No 'SYSTEM.CNF' file found on the cdrom0 device."),
        };

        let executable_path = parse_system_cnf(&String::from_utf8_lossy(&cnf))
            .ok_or_else(|| anyhow!("Error parsing 'SYSTEM.CNF' for a BOOT2 value."))?;

        let data = self
            .read_ioman_file(&executable_path)
            .map_err(|_| anyhow!("Couldn't open executable specified in SYSTEM.CNF."))?;

        let name = executable_display_name(&executable_path).to_owned();
        self.load_elf(cpu, &data, &name, arguments)
    }

    /// Drop the loaded executable, telling the embedder first.
    pub fn unload_executable(&mut self) {
        if self.executable.is_none() {
            return;
        }
        self.events.executable_unloading();
        self.executable = None;
    }

    /// Copy all loadable segments of another executable into RAM and return
    /// its entry point. Used when the guest chains into a new program.
    pub fn load_executable_sections(&mut self, path: &str) -> Result<u32> {
        let data = self.read_ioman_file(path)?;
        let file = elf::ElfBytes::<elf::endian::AnyEndian>::minimal_parse(&data)?;
        let entry = file.ehdr.e_entry as u32;
        {
            let mut guard = self.ram.write();
            copy_load_segments(&file, &data, &mut guard[..]);
        }
        self.events.request_instruction_cache_flush();
        Ok(entry)
    }

    /// Validate and load an ELF image, rebuild the BIOS trampolines and the
    /// idle thread, then apply any registered patches.
    pub fn load_elf(
        &mut self,
        cpu: &mut dyn EeCpu,
        data: &[u8],
        name: &str,
        arguments: Vec<String>,
    ) -> Result<()> {
        let file = elf::ElfBytes::<elf::endian::AnyEndian>::minimal_parse(data)?;
        if file.ehdr.e_machine != elf::abi::EM_MIPS {
            bail!("Invalid target CPU. Must be MIPS.");
        }
        if file.ehdr.e_type != elf::abi::ET_EXEC {
            bail!("Not an executable ELF file.");
        }

        self.unload_executable();

        let entry = file.ehdr.e_entry as u32;
        let range;
        {
            let ram_handle = self.ram.clone();
            let mut ram = ram_handle.write();
            copy_load_segments(&file, data, &mut ram[..]);
            range = executable_range(&file);

            self.schedule.initialize(&mut ram[..]);
            set_current_thread_id(&mut ram[..], 0);
            create_wait_thread(&mut ram[..]);
        }
        {
            let mut bios = self.bios.write();
            bios::install_all(&mut bios[..]);
        }

        let state = cpu.state();
        state.pc = entry;
        state.gpr[reg::K0].v[0] = 0x8000_0000 | KERNEL_STACK_TOP;
        state.gpr[reg::K0].v[1] = 0xFFFF_FFFF;

        self.executable = Some(LoadedExecutable {
            name: name.to_owned(),
            entry,
            range,
        });
        self.boot_arguments = arguments;
        self.idle = IdleDetector::new();

        self.apply_patches();
        self.events.executable_change();

        info!(target: "os", "Loaded '{name}' executable file.");
        Ok(())
    }

    fn apply_patches(&mut self) {
        let Some(executable) = &self.executable else {
            return;
        };
        let Some(patches) = self.patches.get(&executable.name) else {
            return;
        };
        let mut ram = self.ram.write();
        for patch in patches {
            write_u32(&mut ram[..], ram_mask(patch.address), patch.value);
        }
        info!(target: "os", "Applied {} patch(es).", patches.len());
    }

    /// Read an entire file through the I/O processor's filesystem.
    fn read_ioman_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let handle = self.ioman.open(OPEN_FLAG_RDONLY, path);
        if handle < 0 {
            bail!("ioman failed to open '{path}'");
        }
        let handle = handle as u32;
        let mut data = Vec::new();
        let read_result = self
            .ioman
            .file_stream(handle)
            .and_then(|mut stream| {
                stream.read_to_end(&mut data)?;
                Ok(())
            });
        self.ioman.close(handle);
        read_result?;
        Ok(data)
    }

    // --- Scheduler -----------------------------------------------------

    /// Re-elect a thread. No-op while the CPU is in exception mode or has
    /// interrupts masked; otherwise charges the current thread's quota,
    /// refills the pool once every runnable quota is spent, and switches to
    /// the first RUNNING thread with quota left, or the idle thread.
    fn shake_and_bake(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let status = cpu.state_ref().cop0[cop0::STATUS];
        if status & STATUS_EXL != 0 {
            return;
        }
        if status & STATUS_INT == 0 {
            return;
        }

        // Revoke the current thread's right to keep running. The idle
        // thread has no quota to charge.
        let current = current_thread_id(ram);
        if current != 0 {
            let mut thread = Thread::load(ram, current);
            thread.quota = thread.quota.saturating_sub(1);
            thread.store(ram, current);
        }

        if self.has_all_quotas_expired(ram) {
            let members: Vec<u32> = self.schedule.iter(ram).map(|e| e.value).collect();
            for id in members {
                let mut thread = Thread::load(ram, id);
                if thread.status != ThreadStatus::Running {
                    continue;
                }
                thread.quota = THREAD_INIT_QUOTA;
                thread.store(ram, id);
            }
        }

        // Elect the first runnable thread in priority order.
        let mut elected = None;
        for entry in self.schedule.iter(ram) {
            let thread = Thread::load(ram, entry.value);
            if thread.status != ThreadStatus::Running {
                continue;
            }
            if thread.quota == 0 {
                continue;
            }
            elected = Some(entry.value);
            break;
        }

        let next = match elected {
            None => 0,
            Some(id) => {
                // Requeue at the tail of its band for round-robin.
                let mut thread = Thread::load(ram, id);
                self.schedule.remove(ram, thread.schedule_id);
                thread.schedule_id = self
                    .schedule
                    .insert(ram, id, thread.priority)
                    .unwrap_or(0);
                thread.store(ram, id);
                id
            }
        };

        self.switch_context(cpu, ram, next);
    }

    fn has_all_quotas_expired(&self, ram: &[u8]) -> bool {
        for entry in self.schedule.iter(ram) {
            let thread = Thread::load(ram, entry.value);
            if thread.status != ThreadStatus::Running {
                continue;
            }
            if thread.quota == 0 {
                continue;
            }
            return false;
        }
        true
    }

    /// Save the outgoing register file into the current thread's context
    /// record and load the elected thread's. R0, K0 and K1 stay with the
    /// CPU. No-op when the election did not change anything.
    fn switch_context(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8], id: u32) {
        let current = current_thread_id(ram);
        if id == current {
            return;
        }

        {
            let mut thread = Thread::load(ram, current);
            let ctx_ptr = ram_mask(thread.context_ptr);
            let mut ctx = ThreadContext::load(ram, ctx_ptr);
            let state = cpu.state_ref();
            for (i, gpr) in state.gpr.iter().enumerate() {
                if i == reg::R0 || i == reg::K0 || i == reg::K1 {
                    continue;
                }
                ctx.gpr[i] = gpr.v;
            }
            ctx.store(ram, ctx_ptr);
            thread.saved_pc = state.pc;
            thread.store(ram, current);
        }

        set_current_thread_id(ram, id);

        {
            let thread = Thread::load(ram, id);
            let ctx = ThreadContext::load(ram, ram_mask(thread.context_ptr));
            let state = cpu.state();
            state.pc = thread.saved_pc;
            for (i, gpr) in state.gpr.iter_mut().enumerate() {
                if i == reg::R0 || i == reg::K0 || i == reg::K1 {
                    continue;
                }
                gpr.v = ctx.gpr[i];
            }
        }

        debug!(target: "os", "New thread elected (id = {id}).");
    }

    // --- CPU entry points ----------------------------------------------

    /// External interrupt entry. Gives a just-woken thread a chance to run,
    /// then vectors the CPU through the BIOS exception handler.
    pub fn handle_exception(&mut self, cpu: &mut dyn EeCpu) {
        self.idle.count = 0;
        {
            let ram_handle = self.ram.clone();
            let mut ram = ram_handle.write();
            self.shake_and_bake(cpu, &mut ram[..]);
        }
        cpu.raise_interrupt(bios::EXCEPTION_VECTOR_ADDR);
    }

    /// SYSCALL opcode entry. Decodes V1 and runs the builtin handler,
    /// forwards to the guest's own handler through the BIOS gate, or
    /// reschedules for the idle syscall.
    pub fn handle_syscall(&mut self, cpu: &mut dyn EeCpu) -> Result<()> {
        let epc = cpu.state_ref().cop0[cop0::EPC];
        let opcode = cpu.fetch_instruction(epc);
        if opcode != 0x0000_000C {
            bail!("not a SYSCALL opcode at 0x{epc:08X}");
        }

        let ram_handle = self.ram.clone();
        let mut guard = ram_handle.write();
        let ram = &mut guard[..];

        let raw = cpu.state_ref().gpr[reg::V1].v[0];
        if raw == 0x666 {
            self.shake_and_bake(cpu, ram);
        } else {
            // Negative numbers mark the interrupt-context variants.
            let func = if raw & 0x8000_0000 != 0 {
                raw.wrapping_neg()
            } else {
                raw
            };
            cpu.state().gpr[reg::V1].v[0] = func;

            if layout::custom_syscall(ram, func) != 0 {
                cpu.raise_exception(bios::SYSCALL_GATE_ADDR);
            } else if func < 0x80 {
                self.log_syscall(cpu, ram, func);
                syscalls::TABLE[func as usize](self, cpu, ram);
            } else {
                warn!(
                    target: "syscall",
                    "Unknown system call (0x{func:X}) called from 0x{:08X}.",
                    cpu.state_ref().pc
                );
            }
        }

        cpu.state().has_exception = false;
        Ok(())
    }

    fn log_syscall(&self, cpu: &dyn EeCpu, ram: &[u8], func: u32) {
        if let Some(name) = syscalls::name(func) {
            let state = cpu.state_ref();
            debug!(
                target: "syscall",
                "{}: {name}(a0 = 0x{:08X}, a1 = 0x{:08X}, a2 = 0x{:08X}, a3 = 0x{:08X})",
                current_thread_id(ram),
                state.gpr[reg::A0].v[0],
                state.gpr[reg::A1].v[0],
                state.gpr[reg::A2].v[0],
                state.gpr[reg::A3].v[0],
            );
        }
    }

    // --- Introspection -------------------------------------------------

    pub fn module_infos(&self) -> Vec<ModuleInfo> {
        match &self.executable {
            Some(executable) => vec![ModuleInfo {
                name: executable.name.clone(),
                begin: executable.range.0,
                end: executable.range.1,
            }],
            None => Vec::new(),
        }
    }

    /// Snapshot of every ready-queue member. The current thread reports
    /// live CPU registers; the rest report their saved context.
    pub fn thread_infos(&self, cpu: &dyn EeCpu) -> Vec<ThreadInfo> {
        let ram = self.ram.read();
        let ram = &ram[..];
        let current = current_thread_id(ram);

        let mut infos = Vec::new();
        for entry in self.schedule.iter(ram) {
            let thread = Thread::load(ram, entry.value);
            let ctx = ThreadContext::load(ram, ram_mask(thread.context_ptr));

            let (pc, ra, sp) = if entry.value == current {
                let state = cpu.state_ref();
                (state.pc, state.gpr[reg::RA].v[0], state.gpr[reg::SP].v[0])
            } else {
                (thread.saved_pc, ctx.gpr[reg::RA][0], ctx.gpr[reg::SP][0])
            };

            let state = match thread.status {
                ThreadStatus::Running => "Running".to_owned(),
                ThreadStatus::Sleeping => "Sleeping".to_owned(),
                ThreadStatus::Waiting => {
                    format!("Waiting (Semaphore: {})", thread.sema_wait)
                }
                ThreadStatus::Suspended => "Suspended".to_owned(),
                ThreadStatus::SuspendedSleeping => "Suspended+Sleeping".to_owned(),
                ThreadStatus::SuspendedWaiting => {
                    format!("Suspended+Waiting (Semaphore: {})", thread.sema_wait)
                }
                ThreadStatus::Zombie => "Zombie".to_owned(),
            };

            infos.push(ThreadInfo {
                id: entry.value,
                priority: thread.priority,
                pc,
                ra,
                sp,
                state,
            });
        }

        infos
    }

    fn status_line(&self) -> String {
        let name = self.executable_name().unwrap_or("<none>").to_owned();
        let current = current_thread_id(&self.ram.read()[..]);
        format!(
            "Executable: {name}\nCurrent Thread: {current}\nIdle: {}",
            self.is_idle()
        )
    }

    /// Drain pending debugger commands from the attached proxy.
    pub fn service_debug_requests(&mut self, cpu: &dyn EeCpu) {
        let Some(proxy) = self.debug.clone() else {
            return;
        };
        while let Ok(command) = proxy.emu_rx.try_recv() {
            let reply = match command {
                DebugCommands::Threads(_) => DebugCommands::Threads(self.thread_infos(cpu)),
                DebugCommands::Modules(_) => DebugCommands::Modules(self.module_infos()),
                DebugCommands::Status(_) => DebugCommands::Status(self.status_line()),
                DebugCommands::IsIdle(_) => DebugCommands::IsIdle(self.is_idle()),
                DebugCommands::Peek(addr, Bytes(size)) => {
                    let ram = self.ram.read();
                    let start = ram_mask(addr) as usize;
                    let end = start.saturating_add(size as usize).min(ram.len());
                    let data = ram.get(start..end).unwrap_or(&[]).to_vec();
                    DebugCommands::Data(data.into_boxed_slice())
                }
                _ => DebugCommands::Fail,
            };
            if proxy.emu_tx.send(reply).is_err() {
                break;
            }
        }
    }
}

/// Install the permanent idle thread: id 0, ZOMBIE, body at the wait-thread
/// trampoline.
fn create_wait_thread(ram: &mut [u8]) {
    let mut thread = Thread::load(ram, 0);
    thread.valid = 1;
    thread.status = ThreadStatus::Zombie;
    thread.entry_pc = bios::WAIT_THREAD_ADDR;
    thread.saved_pc = bios::WAIT_THREAD_ADDR;
    thread.store(ram, 0);
}

fn copy_load_segments(
    file: &elf::ElfBytes<elf::endian::AnyEndian>,
    data: &[u8],
    ram: &mut [u8],
) {
    let Some(segments) = file.segments() else {
        return;
    };
    for segment in segments.iter() {
        if segment.p_type != elf::abi::PT_LOAD || segment.p_filesz == 0 {
            continue;
        }
        let offset = segment.p_offset as usize;
        let size = segment.p_filesz as usize;
        let vaddr = ram_mask(segment.p_vaddr as u32) as usize;
        let (Some(src), Some(dst)) = (
            data.get(offset..offset + size),
            ram.get_mut(vaddr..vaddr + size),
        ) else {
            warn!(
                target: "os",
                "Skipping out-of-range segment (vaddr 0x{:08X}, size 0x{size:X})",
                segment.p_vaddr
            );
            continue;
        };
        dst.copy_from_slice(src);
    }
}

/// Union of the loadable segments that end inside EE RAM.
fn executable_range(file: &elf::ElfBytes<elf::endian::AnyEndian>) -> (u32, u32) {
    let mut min_addr = 0xFFFF_FFF0u32;
    let mut max_addr = 0u32;
    if let Some(segments) = file.segments() {
        for segment in segments.iter() {
            if segment.p_type != elf::abi::PT_LOAD || segment.p_filesz == 0 {
                continue;
            }
            let vaddr = segment.p_vaddr as u32;
            let end = vaddr.wrapping_add(segment.p_filesz as u32);
            if end >= EE_RAM_SIZE {
                continue;
            }
            min_addr = min_addr.min(vaddr);
            max_addr = max_addr.max(end);
        }
    }
    (min_addr, max_addr)
}

/// Pull the BOOT2 executable path out of SYSTEM.CNF.
fn parse_system_cnf(content: &str) -> Option<String> {
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if !line.starts_with("BOOT2") {
            continue;
        }
        let (_, value) = line.split_once('=')?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        if value.is_empty() {
            return None;
        }
        return Some(value.to_owned());
    }
    None
}

/// Displayed name of a `device:path` executable: everything after the
/// device prefix, with a single leading path separator trimmed.
fn executable_display_name(path: &str) -> &str {
    let name = match path.split_once(':') {
        Some((_, rest)) => rest,
        None => path,
    };
    name.strip_prefix(['/', '\\']).unwrap_or(name)
}

fn read_u32_masked(ram: &[u8], addr: u32) -> u32 {
    read_u32(ram, ram_mask(addr))
}

fn write_u32_masked(ram: &mut [u8], addr: u32, value: u32) {
    write_u32(ram, ram_mask(addr), value)
}
