//! The builtin syscall handlers and their dispatch table.
//!
//! Handlers read their arguments from A0..T0 and report through V0; a
//! request that cannot be satisfied returns -1 in both halves of V0 and
//! leaves the tables untouched. Guest contract violations (the conditions
//! the real kernel would assert on) are `debug_assert!`s and otherwise
//! proceed.

use log::warn;

use crate::cpu::{hw, reg, EeCpu};
use crate::devices::{GS_CSR, GS_IMR};
use crate::os::bios;
use crate::os::layout::{
    current_thread_id, ram_mask, read_cstring, sema_param, set_current_thread_id,
    set_custom_syscall, thread_param, Deci2Handler, Handler, Semaphore, Thread, ThreadContext,
    ThreadStatus, MAX_THREAD, STACK_RES, THREAD_INIT_QUOTA,
};
use crate::os::{read_u32_masked, write_u32_masked, Kernel};
use crate::EE_RAM_SIZE;

pub(super) type SyscallFn = fn(&mut Kernel, &mut dyn EeCpu, &mut [u8]);

fn param(cpu: &dyn EeCpu, n: usize) -> u32 {
    cpu.state_ref().gpr[reg::A0 + n].v[0]
}

fn set_result(cpu: &mut dyn EeCpu, value: u32) {
    cpu.state().gpr[reg::V0].set_w0(value);
}

fn set_result64(cpu: &mut dyn EeCpu, value: i64) {
    cpu.state().gpr[reg::V0].set_d0(value as u64);
}

fn set_error(cpu: &mut dyn EeCpu) {
    cpu.state().gpr[reg::V0].v[0] = 0xFFFF_FFFF;
    cpu.state().gpr[reg::V0].v[1] = 0xFFFF_FFFF;
}

/// Copy `bytes` plus a terminating NUL to a (masked) guest address.
fn write_bytes_masked(ram: &mut [u8], addr: u32, bytes: &[u8]) {
    let start = ram_mask(addr) as usize;
    if let Some(dst) = ram.get_mut(start..start + bytes.len() + 1) {
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
    }
}

impl Kernel {
    fn sc_unhandled(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let state = cpu.state_ref();
        warn!(
            target: "syscall",
            "Unknown system call (0x{:X}) called from 0x{:08X}.",
            state.gpr[reg::V1].v[0],
            state.pc
        );
    }

    // 0x02
    fn sc_gs_set_crt(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let interlaced = param(cpu, 0) != 0;
        let mode = param(cpu, 1);
        let frame_mode = param(cpu, 2) != 0;
        if let Some(gs) = &mut self.gs {
            gs.set_crt(interlaced, mode, frame_mode);
        }
    }

    // 0x06
    fn sc_load_exec_ps2(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let file_name_ptr = param(cpu, 0);
        let arg_count = param(cpu, 1);
        let arg_values_ptr = param(cpu, 2);

        let mut arguments = Vec::new();
        // Guard against a runaway argc from a corrupted caller
        for i in 0..arg_count.min(64) {
            let arg_ptr = read_u32_masked(ram, arg_values_ptr + i * 4);
            arguments.push(read_cstring(ram, arg_ptr));
        }

        let file_name = read_cstring(ram, file_name_ptr);
        self.events.request_load_executable(&file_name, &arguments);
    }

    // 0x10
    fn sc_add_intc_handler(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let cause = param(cpu, 0);
        let address = param(cpu, 1);
        let _next = param(cpu, 2);
        let arg = param(cpu, 3);

        let Some(id) = Handler::next_available_intc_id(ram) else {
            set_error(cpu);
            return;
        };

        let handler = Handler {
            valid: 1,
            selector: cause,
            address,
            arg,
            gp: cpu.state_ref().gpr[reg::GP].v[0],
        };
        handler.store_intc(ram, id);
        set_result(cpu, id);
    }

    // 0x11
    fn sc_remove_intc_handler(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let _cause = param(cpu, 0);
        let id = param(cpu, 1);

        let mut handler = Handler::load_intc(ram, id);
        if handler.valid != 1 {
            set_error(cpu);
            return;
        }
        handler.valid = 0;
        handler.store_intc(ram, id);
        set_result(cpu, 0);
    }

    // 0x12
    fn sc_add_dmac_handler(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let channel = param(cpu, 0);
        let address = param(cpu, 1);
        let next = param(cpu, 2);
        let arg = param(cpu, 3);

        // Next selects where in the chain the handler goes (-1 end, 0
        // start, n after handler n). Only insertion at the start exists.
        debug_assert!(next == 0, "AddDmacHandler with next != 0");

        let Some(id) = Handler::next_available_dmac_id(ram) else {
            set_error(cpu);
            return;
        };

        let handler = Handler {
            valid: 1,
            selector: channel,
            address,
            arg,
            gp: cpu.state_ref().gpr[reg::GP].v[0],
        };
        handler.store_dmac(ram, id);
        set_result(cpu, id);
    }

    // 0x13
    fn sc_remove_dmac_handler(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let _channel = param(cpu, 0);
        let id = param(cpu, 1);

        let mut handler = Handler::load_dmac(ram, id);
        handler.valid = 0;
        handler.store_dmac(ram, id);
        set_result(cpu, 0);
    }

    // 0x14
    fn sc_enable_intc(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let mask = 1u32 << param(cpu, 0);
        if cpu.read_device_word(hw::INTC_MASK) & mask == 0 {
            cpu.write_device_word(hw::INTC_MASK, mask);
        }
        set_result(cpu, 1);
    }

    // 0x15
    fn sc_disable_intc(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let mask = 1u32 << param(cpu, 0);
        if cpu.read_device_word(hw::INTC_MASK) & mask != 0 {
            cpu.write_device_word(hw::INTC_MASK, mask);
        }
        set_result(cpu, 1);
    }

    // 0x16
    fn sc_enable_dmac(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let channel_mask = 0x10000u32 << param(cpu, 0);
        if cpu.read_device_word(hw::D_STAT) & channel_mask == 0 {
            cpu.write_device_word(hw::D_STAT, channel_mask);
        }

        // DMAC interrupts arrive through INT1
        if cpu.read_device_word(hw::INTC_MASK) & 0x02 == 0 {
            cpu.write_device_word(hw::INTC_MASK, 0x02);
        }

        set_result(cpu, 1);
    }

    // 0x17
    fn sc_disable_dmac(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let channel_mask = 0x10000u32 << param(cpu, 0);
        if cpu.read_device_word(hw::D_STAT) & channel_mask != 0 {
            cpu.write_device_word(hw::D_STAT, channel_mask);
            set_result64(cpu, 1);
        } else {
            set_result64(cpu, 0);
        }
    }

    // 0x20
    fn sc_create_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let param_ptr = param(cpu, 0);
        let func = read_u32_masked(ram, param_ptr + thread_param::FUNC);
        let stack_base = read_u32_masked(ram, param_ptr + thread_param::STACK_BASE);
        let stack_size = read_u32_masked(ram, param_ptr + thread_param::STACK_SIZE);
        let gp = read_u32_masked(ram, param_ptr + thread_param::GP);
        let priority = read_u32_masked(ram, param_ptr + thread_param::PRIORITY);

        let Some(id) = Thread::next_available_id(ram) else {
            set_error(cpu);
            return;
        };

        debug_assert!(priority < 128);

        // The new thread inherits the creator's heap.
        let heap_base = Thread::load(ram, current_thread_id(ram)).heap_base;

        let stack_addr = stack_base.wrapping_add(stack_size).wrapping_sub(STACK_RES);

        let thread = Thread {
            valid: 1,
            status: ThreadStatus::Zombie,
            context_ptr: stack_addr,
            stack_base,
            stack_size,
            heap_base,
            entry_pc: func,
            saved_pc: func,
            priority,
            sema_wait: 0,
            wakeup_count: 0,
            quota: THREAD_INIT_QUOTA,
            schedule_id: self.schedule.insert(ram, id, priority).unwrap_or(0),
        };
        thread.store(ram, id);

        let ctx_ptr = ram_mask(stack_addr);
        ThreadContext::clear(ram, ctx_ptr);
        let mut ctx = ThreadContext::default();
        ctx.gpr[reg::SP][0] = stack_addr;
        ctx.gpr[reg::FP][0] = stack_addr;
        ctx.gpr[reg::GP][0] = gp;
        ctx.gpr[reg::RA][0] = bios::THREAD_EPILOG_ADDR;
        ctx.store(ram, ctx_ptr);

        set_result(cpu, id);
    }

    // 0x21
    fn sc_delete_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut thread = Thread::load(ram, id);
        if thread.valid != 1 {
            set_error(cpu);
            return;
        }

        self.schedule.remove(ram, thread.schedule_id);
        thread.valid = 0;
        thread.store(ram, id);
        set_result(cpu, 0);
    }

    // 0x22
    fn sc_start_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);
        let arg = param(cpu, 1);

        let mut thread = Thread::load(ram, id);
        if thread.valid != 1 {
            set_error(cpu);
            return;
        }

        debug_assert!(thread.status == ThreadStatus::Zombie);
        thread.status = ThreadStatus::Running;
        thread.saved_pc = thread.entry_pc;
        thread.store(ram, id);

        let ctx_ptr = ram_mask(thread.context_ptr);
        let mut ctx = ThreadContext::load(ram, ctx_ptr);
        ctx.gpr[reg::A0][0] = arg;
        ctx.store(ram, ctx_ptr);

        set_result(cpu, id);
    }

    // 0x23
    fn sc_exit_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let current = current_thread_id(ram);
        let mut thread = Thread::load(ram, current);
        thread.status = ThreadStatus::Zombie;
        thread.store(ram, current);

        self.shake_and_bake(cpu, ram);
    }

    // 0x25
    fn sc_terminate_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut thread = Thread::load(ram, id);
        if thread.valid != 1 {
            set_error(cpu);
            return;
        }

        thread.status = ThreadStatus::Zombie;
        thread.store(ram, id);
        set_result(cpu, 0);
    }

    // 0x29 / 0x2A
    fn sc_change_thread_priority(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let in_interrupt = cpu.state_ref().gpr[reg::V1].v[0] == 0x2A;
        let id = param(cpu, 0);
        let priority = param(cpu, 1);

        let mut thread = Thread::load(ram, id);
        if thread.valid != 1 {
            set_error(cpu);
            return;
        }

        let previous = thread.priority;
        thread.priority = priority;
        set_result(cpu, previous);

        self.schedule.remove(ram, thread.schedule_id);
        thread.schedule_id = self.schedule.insert(ram, id, priority).unwrap_or(0);
        thread.store(ram, id);

        if !in_interrupt {
            self.shake_and_bake(cpu, ram);
        }
    }

    // 0x2B
    fn sc_rotate_thread_ready_queue(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let priority = param(cpu, 0);
        let current = current_thread_id(ram);

        // Requeue the band head, but never the thread that is running: the
        // election loop already rotates it when it gets picked.
        let mut band_found = false;
        let mut rotate = None;
        for entry in self.schedule.iter(ram) {
            if entry.weight == priority {
                band_found = true;
                if entry.value != current {
                    rotate = Some((entry.index, entry.value));
                }
                break;
            }
        }

        if let Some((index, id)) = rotate {
            let mut thread = Thread::load(ram, id);
            self.schedule.remove(ram, index);
            thread.schedule_id = self.schedule.insert(ram, id, priority).unwrap_or(0);
            thread.store(ram, id);
        }

        set_result(cpu, priority);

        if band_found {
            self.shake_and_bake(cpu, ram);
        }
    }

    // 0x2F
    fn sc_get_thread_id(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        set_result(cpu, current_thread_id(ram));
    }

    // 0x30 / 0x31
    fn sc_refer_thread_status(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);
        let status_ptr = param(cpu, 1) & (EE_RAM_SIZE - 1);

        let thread = Thread::load(ram, id);
        if thread.valid != 1 {
            set_error(cpu);
            return;
        }

        // THS_RUN = 0x01, THS_WAIT = 0x04, THS_SUSPEND = 0x08,
        // THS_DORMANT = 0x10
        let status = match thread.status {
            ThreadStatus::Running => 0x01,
            ThreadStatus::Waiting | ThreadStatus::Sleeping => 0x04,
            ThreadStatus::Suspended => 0x08,
            ThreadStatus::SuspendedWaiting | ThreadStatus::SuspendedSleeping => 0x0C,
            ThreadStatus::Zombie => 0x10,
        };

        if status_ptr != 0 {
            write_u32_masked(ram, status_ptr + thread_param::STATUS, status);
            write_u32_masked(ram, status_ptr + thread_param::STACK_BASE, thread.stack_base);
            write_u32_masked(ram, status_ptr + thread_param::STACK_SIZE, thread.stack_size);
            write_u32_masked(ram, status_ptr + thread_param::PRIORITY, thread.priority);
            write_u32_masked(
                ram,
                status_ptr + thread_param::CURRENT_PRIORITY,
                thread.priority,
            );
        }

        set_result(cpu, status);
    }

    // 0x32
    fn sc_sleep_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let current = current_thread_id(ram);
        let mut thread = Thread::load(ram, current);
        if thread.wakeup_count == 0 {
            debug_assert!(thread.status == ThreadStatus::Running);
            thread.status = ThreadStatus::Sleeping;
            thread.store(ram, current);
            self.shake_and_bake(cpu, ram);
            return;
        }

        thread.wakeup_count -= 1;
        thread.store(ram, current);
    }

    // 0x33 / 0x34
    fn sc_wakeup_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut thread = Thread::load(ram, id);
        match thread.status {
            ThreadStatus::Sleeping => {
                thread.status = ThreadStatus::Running;
                thread.store(ram, id);
                self.shake_and_bake(cpu, ram);
            }
            ThreadStatus::SuspendedSleeping => {
                thread.status = ThreadStatus::Suspended;
                thread.store(ram, id);
                self.shake_and_bake(cpu, ram);
            }
            _ => {
                thread.wakeup_count += 1;
                thread.store(ram, id);
            }
        }
    }

    // 0x37
    fn sc_suspend_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut thread = Thread::load(ram, id);
        if thread.valid != 1 {
            return;
        }

        match thread.status {
            ThreadStatus::Running => thread.status = ThreadStatus::Suspended,
            ThreadStatus::Waiting => thread.status = ThreadStatus::SuspendedWaiting,
            ThreadStatus::Sleeping => thread.status = ThreadStatus::SuspendedSleeping,
            other => debug_assert!(false, "SuspendThread on a thread in state {other:?}"),
        }
        thread.store(ram, id);

        self.shake_and_bake(cpu, ram);
    }

    // 0x39
    fn sc_resume_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut thread = Thread::load(ram, id);
        if thread.valid != 1 {
            return;
        }

        match thread.status {
            ThreadStatus::Suspended => thread.status = ThreadStatus::Running,
            ThreadStatus::SuspendedWaiting => thread.status = ThreadStatus::Waiting,
            ThreadStatus::SuspendedSleeping => thread.status = ThreadStatus::Sleeping,
            other => debug_assert!(false, "ResumeThread on a thread in state {other:?}"),
        }
        thread.store(ram, id);

        self.shake_and_bake(cpu, ram);
    }

    // 0x3C
    fn sc_setup_thread(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let stack_base = param(cpu, 1);
        let stack_size = param(cpu, 2);

        let mut stack_addr = if stack_base == 0xFFFF_FFFF {
            0x0200_0000
        } else {
            stack_base.wrapping_add(stack_size)
        };

        // Lay the argv block out at the caller-provided base:
        // argc word, argc pointers, then the packed strings.
        let args_base = param(cpu, 3);
        {
            let mut arguments = Vec::with_capacity(1 + self.boot_arguments.len());
            arguments.push(self.executable_name().unwrap_or("").to_owned());
            arguments.extend(self.boot_arguments.iter().cloned());

            write_u32_masked(ram, args_base, arguments.len() as u32);
            let pointers = args_base + 4;
            let mut payload = pointers + arguments.len() as u32 * 4;
            for (i, argument) in arguments.iter().enumerate() {
                write_u32_masked(ram, pointers + i as u32 * 4, payload);
                write_bytes_masked(ram, payload, argument.as_bytes());
                payload += argument.len() as u32 + 1;
            }
        }

        let mut thread = Thread::load(ram, 1);
        thread.valid = 1;
        thread.status = ThreadStatus::Running;
        thread.stack_base = stack_addr.wrapping_sub(stack_size);
        thread.stack_size = stack_size;
        thread.priority = 0;
        thread.quota = THREAD_INIT_QUOTA;
        thread.schedule_id = self.schedule.insert(ram, 1, 0).unwrap_or(0);

        stack_addr = stack_addr.wrapping_sub(STACK_RES);
        thread.context_ptr = stack_addr;
        thread.store(ram, 1);

        set_current_thread_id(ram, 1);

        set_result(cpu, stack_addr);
    }

    // 0x3D
    fn sc_setup_heap(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let current = current_thread_id(ram);
        let mut thread = Thread::load(ram, current);

        let heap_base = param(cpu, 0);
        let heap_size = param(cpu, 1);

        thread.heap_base = if heap_size == 0xFFFF_FFFF {
            thread.stack_base
        } else {
            heap_base.wrapping_add(heap_size)
        };
        thread.store(ram, current);

        set_result(cpu, thread.heap_base);
    }

    // 0x3E
    fn sc_end_of_heap(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let thread = Thread::load(ram, current_thread_id(ram));
        set_result(cpu, thread.heap_base);
    }

    // 0x40
    fn sc_create_sema(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let param_ptr = param(cpu, 0);

        let Some(id) = Semaphore::next_available_id(ram) else {
            set_error(cpu);
            return;
        };

        let sema = Semaphore {
            valid: 1,
            count: read_u32_masked(ram, param_ptr + sema_param::INIT_COUNT),
            max_count: read_u32_masked(ram, param_ptr + sema_param::MAX_COUNT),
            wait_count: 0,
        };
        debug_assert!(sema.count <= sema.max_count);
        sema.store(ram, id);

        set_result(cpu, id);
    }

    // 0x41
    fn sc_delete_sema(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut sema = Semaphore::load(ram, id);
        if sema.valid != 1 {
            set_error(cpu);
            return;
        }

        debug_assert!(sema.wait_count == 0, "DeleteSema with waiting threads");

        sema.valid = 0;
        sema.store(ram, id);
        set_result(cpu, id);
    }

    // 0x42 / 0x43
    fn sc_signal_sema(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let in_interrupt = cpu.state_ref().gpr[reg::V1].v[0] == 0x43;
        let id = param(cpu, 0);

        let mut sema = Semaphore::load(ram, id);
        if sema.valid != 1 {
            set_error(cpu);
            return;
        }

        if sema.wait_count != 0 {
            // Hand the signal to the first waiter; one signal, one wake.
            for thread_id in 0..MAX_THREAD {
                let mut thread = Thread::load(ram, thread_id);
                if thread.valid != 1 {
                    continue;
                }
                if !thread.status.is_waiting() {
                    continue;
                }
                if thread.sema_wait != id {
                    continue;
                }

                thread.status = match thread.status {
                    ThreadStatus::Waiting => ThreadStatus::Running,
                    _ => ThreadStatus::Suspended,
                };
                thread.quota = THREAD_INIT_QUOTA;
                thread.store(ram, thread_id);

                sema.wait_count -= 1;
                break;
            }
            sema.store(ram, id);

            set_result(cpu, id);
            if !in_interrupt {
                self.shake_and_bake(cpu, ram);
            }
        } else {
            // No clamp to max_count; overflow matches the hardware kernel.
            sema.count += 1;
            sema.store(ram, id);
            set_result(cpu, id);
        }
    }

    // 0x44
    fn sc_wait_sema(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut sema = Semaphore::load(ram, id);
        if sema.valid != 1 {
            set_error(cpu);
            return;
        }

        let current = current_thread_id(ram);
        let caller = cpu.state_ref().gpr[reg::RA].v[0];
        self.idle.observe_wait(id, caller, current);

        if sema.count == 0 {
            sema.wait_count += 1;
            sema.store(ram, id);

            let mut thread = Thread::load(ram, current);
            debug_assert!(thread.status == ThreadStatus::Running);
            thread.status = ThreadStatus::Waiting;
            thread.sema_wait = id;
            thread.store(ram, current);

            self.shake_and_bake(cpu, ram);
            return;
        }

        sema.count -= 1;
        sema.store(ram, id);
        set_result(cpu, id);
    }

    // 0x45 / 0x46
    fn sc_poll_sema(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);

        let mut sema = Semaphore::load(ram, id);
        if sema.valid != 1 {
            set_error(cpu);
            return;
        }

        if sema.count == 0 {
            set_error(cpu);
            return;
        }

        sema.count -= 1;
        sema.store(ram, id);
        set_result(cpu, id);
    }

    // 0x47 / 0x48
    fn sc_refer_sema_status(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let id = param(cpu, 0);
        let status_ptr = param(cpu, 1) & 0x1FFF_FFFF;

        let sema = Semaphore::load(ram, id);
        if sema.valid != 1 {
            set_error(cpu);
            return;
        }

        write_u32_masked(ram, status_ptr + sema_param::COUNT, sema.count);
        write_u32_masked(ram, status_ptr + sema_param::MAX_COUNT, sema.max_count);
        write_u32_masked(ram, status_ptr + sema_param::WAIT_THREADS, sema.wait_count);

        set_result(cpu, id);
    }

    // 0x64 / 0x68
    fn sc_flush_cache(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let operation_type = param(cpu, 0);
        if operation_type == 2 {
            self.events.request_instruction_cache_flush();
        }
    }

    // 0x70
    fn sc_gs_get_imr(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let result = match &mut self.gs {
            Some(gs) => gs.read_priv_register(GS_IMR),
            None => 0,
        };
        set_result64(cpu, result as i32 as i64);
    }

    // 0x71
    fn sc_gs_put_imr(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let imr = param(cpu, 0);
        if let Some(gs) = &mut self.gs {
            gs.write_priv_register(GS_IMR, imr);
        }
    }

    // 0x73
    fn sc_set_vsync_flag(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let ptr1 = param(cpu, 0);
        let ptr2 = param(cpu, 1);

        write_u32_masked(ram, ptr1, 0x01);

        let csr = match &mut self.gs {
            Some(gs) => gs.read_priv_register(GS_CSR) & 0x2000,
            None => 0,
        };
        write_u32_masked(ram, ptr2, csr);

        set_result(cpu, 0);
    }

    // 0x74
    fn sc_set_syscall(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let number = param(cpu, 0) & 0xFF;
        let address = param(cpu, 1);
        set_custom_syscall(ram, number, address);
        set_result(cpu, 0);
    }

    // 0x76
    fn sc_sif_dma_stat(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        set_error(cpu);
    }

    // 0x77
    fn sc_sif_set_dma(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let transfer_ptr = param(cpu, 0) & (EE_RAM_SIZE - 1);
        let count = param(cpu, 1);

        // Returns the transfer count; the DMA completion may later raise an
        // interrupt through the usual channels.
        set_result64(cpu, count as i32 as i64);

        for i in 0..count {
            let base = transfer_ptr + i * 0x10;
            let src_addr = read_u32_masked(ram, base);
            let dst_addr = read_u32_masked(ram, base + 0x04);
            let size = read_u32_masked(ram, base + 0x08);
            let quadwords = (size + 0x0F) / 0x10;

            cpu.write_device_word(hw::D6_MADR, src_addr);
            cpu.write_device_word(hw::D6_TADR, dst_addr);
            cpu.write_device_word(hw::D6_QWC, quadwords);
            cpu.write_device_word(hw::D6_CHCR, 0x0000_0100);
        }
    }

    // 0x78
    fn sc_sif_set_dchain(&mut self, _cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        // Sets the SIF0 channel to destination chain mode; nothing for the
        // kernel to track.
    }

    // 0x79
    fn sc_sif_set_reg(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let register = param(cpu, 0);
        let value = param(cpu, 1);
        self.sif.set_register(register, value);
        set_result64(cpu, 0);
    }

    // 0x7A
    fn sc_sif_get_reg(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        let register = param(cpu, 0);
        let value = self.sif.get_register(register);
        set_result64(cpu, value as i32 as i64);
    }

    // 0x7C
    fn sc_deci2_call(&mut self, cpu: &mut dyn EeCpu, ram: &mut [u8]) {
        let function = param(cpu, 0);
        let parameter = param(cpu, 1);

        match function {
            // Deci2Open
            0x01 => {
                let Some(id) = Deci2Handler::next_available_id(ram) else {
                    set_error(cpu);
                    return;
                };
                let handler = Deci2Handler {
                    valid: 1,
                    device: read_u32_masked(ram, parameter),
                    buffer_addr: read_u32_masked(ram, parameter + 0x04),
                };
                handler.store(ram, id);
                set_result(cpu, id);
            }
            // Deci2Send
            0x03 => {
                let id = read_u32_masked(ram, parameter);
                let handler = Deci2Handler::load(ram, id);
                if handler.valid != 0 {
                    let string_addr =
                        ram_mask(read_u32_masked(ram, handler.buffer_addr + 0x10));
                    let length = ram
                        .get(string_addr as usize)
                        .copied()
                        .unwrap_or(0)
                        .saturating_sub(0x0C) as usize;
                    let start = string_addr as usize + 0x0C;
                    let bytes = ram.get(start..start + length).unwrap_or(&[]).to_vec();
                    self.ioman.write(1, &bytes);
                }
                set_result(cpu, 1);
            }
            // Deci2Poll
            0x04 => {
                let id = read_u32_masked(ram, parameter);
                let handler = Deci2Handler::load(ram, id);
                if handler.valid != 0 {
                    write_u32_masked(ram, handler.buffer_addr + 0x0C, 0);
                }
                set_result(cpu, 1);
            }
            // kPuts
            0x10 => {
                let string_addr = read_u32_masked(ram, parameter);
                let text = read_cstring(ram, string_addr);
                self.ioman.write(1, text.as_bytes());
            }
            _ => {
                warn!(
                    target: "deci2",
                    "Unknown Deci2Call function (0x{function:08X}) called. PC: 0x{:08X}.",
                    cpu.state_ref().pc
                );
            }
        }
    }

    // 0x7F
    fn sc_get_memory_size(&mut self, cpu: &mut dyn EeCpu, _ram: &mut [u8]) {
        set_result(cpu, EE_RAM_SIZE);
    }
}

/// Name of a builtin syscall, for trace logging.
pub(super) fn name(func: u32) -> Option<&'static str> {
    Some(match func {
        0x02 => "GsSetCrt",
        0x06 => "LoadExecPS2",
        0x10 => "AddIntcHandler",
        0x11 => "RemoveIntcHandler",
        0x12 => "AddDmacHandler",
        0x13 => "RemoveDmacHandler",
        0x14 => "EnableIntc",
        0x15 => "DisableIntc",
        0x16 => "EnableDmac",
        0x17 => "DisableDmac",
        0x20 => "CreateThread",
        0x21 => "DeleteThread",
        0x22 => "StartThread",
        0x23 => "ExitThread",
        0x25 => "TerminateThread",
        0x29 => "ChangeThreadPriority",
        0x2A => "iChangeThreadPriority",
        0x2B => "RotateThreadReadyQueue",
        0x2F => "GetThreadId",
        0x30 => "ReferThreadStatus",
        0x31 => "iReferThreadStatus",
        0x32 => "SleepThread",
        0x33 => "WakeupThread",
        0x34 => "iWakeupThread",
        0x37 => "SuspendThread",
        0x39 => "ResumeThread",
        0x3C => "SetupThread",
        0x3D => "SetupHeap",
        0x3E => "EndOfHeap",
        0x40 => "CreateSema",
        0x41 => "DeleteSema",
        0x42 => "SignalSema",
        0x43 => "iSignalSema",
        0x44 => "WaitSema",
        0x45 => "PollSema",
        0x46 => "iPollSema",
        0x47 => "ReferSemaStatus",
        0x48 => "iReferSemaStatus",
        0x64 | 0x68 => "FlushCache",
        0x70 => "GsGetIMR",
        0x71 => "GsPutIMR",
        0x73 => "SetVSyncFlag",
        0x74 => "SetSyscall",
        0x76 => "SifDmaStat",
        0x77 => "SifSetDma",
        0x78 => "SifSetDChain",
        0x79 => "SifSetReg",
        0x7A => "SifGetReg",
        0x7C => "Deci2Call",
        0x7F => "GetMemorySize",
        _ => return None,
    })
}

const UNHANDLED: SyscallFn = Kernel::sc_unhandled;

#[rustfmt::skip]
pub(super) static TABLE: [SyscallFn; 0x80] = [
    // 0x00
    UNHANDLED, UNHANDLED, Kernel::sc_gs_set_crt, UNHANDLED,
    UNHANDLED, UNHANDLED, Kernel::sc_load_exec_ps2, UNHANDLED,
    // 0x08
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x10
    Kernel::sc_add_intc_handler, Kernel::sc_remove_intc_handler,
    Kernel::sc_add_dmac_handler, Kernel::sc_remove_dmac_handler,
    Kernel::sc_enable_intc, Kernel::sc_disable_intc,
    Kernel::sc_enable_dmac, Kernel::sc_disable_dmac,
    // 0x18
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x20
    Kernel::sc_create_thread, Kernel::sc_delete_thread,
    Kernel::sc_start_thread, Kernel::sc_exit_thread,
    UNHANDLED, Kernel::sc_terminate_thread, UNHANDLED, UNHANDLED,
    // 0x28
    UNHANDLED, Kernel::sc_change_thread_priority,
    Kernel::sc_change_thread_priority, Kernel::sc_rotate_thread_ready_queue,
    UNHANDLED, UNHANDLED, UNHANDLED, Kernel::sc_get_thread_id,
    // 0x30
    Kernel::sc_refer_thread_status, Kernel::sc_refer_thread_status,
    Kernel::sc_sleep_thread, Kernel::sc_wakeup_thread,
    Kernel::sc_wakeup_thread, UNHANDLED, UNHANDLED, Kernel::sc_suspend_thread,
    // 0x38
    UNHANDLED, Kernel::sc_resume_thread, UNHANDLED, UNHANDLED,
    Kernel::sc_setup_thread, Kernel::sc_setup_heap,
    Kernel::sc_end_of_heap, UNHANDLED,
    // 0x40
    Kernel::sc_create_sema, Kernel::sc_delete_sema,
    Kernel::sc_signal_sema, Kernel::sc_signal_sema,
    Kernel::sc_wait_sema, Kernel::sc_poll_sema,
    Kernel::sc_poll_sema, Kernel::sc_refer_sema_status,
    // 0x48
    Kernel::sc_refer_sema_status, UNHANDLED, UNHANDLED, UNHANDLED,
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x50
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x58
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x60
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    Kernel::sc_flush_cache, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x68
    Kernel::sc_flush_cache, UNHANDLED, UNHANDLED, UNHANDLED,
    UNHANDLED, UNHANDLED, UNHANDLED, UNHANDLED,
    // 0x70
    Kernel::sc_gs_get_imr, Kernel::sc_gs_put_imr, UNHANDLED,
    Kernel::sc_set_vsync_flag, Kernel::sc_set_syscall, UNHANDLED,
    Kernel::sc_sif_dma_stat, Kernel::sc_sif_set_dma,
    // 0x78
    Kernel::sc_sif_set_dchain, Kernel::sc_sif_set_reg,
    Kernel::sc_sif_get_reg, UNHANDLED,
    Kernel::sc_deci2_call, UNHANDLED, UNHANDLED, Kernel::sc_get_memory_size,
];
