//! Machine code the kernel plants in the BIOS region.
//!
//! The exception vectors of the CPU model are hard-coded, so these offsets
//! are an external contract:
//!
//! | Address     | Contents                                  |
//! |-------------|-------------------------------------------|
//! | 0x1FC0_0004 | exception-reentry placeholder word        |
//! | 0x1FC0_0100 | custom syscall gate                       |
//! | 0x1FC0_0200 | general interrupt handler                 |
//! | 0x1FC0_1000 | DMAC interrupt handler                    |
//! | 0x1FC0_2000 | INTC interrupt handler                    |
//! | 0x1FC0_3000 | thread epilog                             |
//! | 0x1FC0_3100 | wait (idle) thread body                   |

use crate::cpu::reg::*;
use crate::os::asm::MipsAssembler;
use crate::os::layout::{
    write_u32, CUSTOM_SYSCALL_BASE, DMAC_HANDLER_BASE, DMAC_HANDLER_SIZE, INTC_HANDLER_BASE,
    INTC_HANDLER_SIZE, MAX_DMACHANDLER, MAX_INTCHANDLER,
};

pub const SYSCALL_GATE_ADDR: u32 = 0x1FC0_0100;
pub const EXCEPTION_VECTOR_ADDR: u32 = 0x1FC0_0200;
pub const DMAC_HANDLER_ADDR: u32 = 0x1FC0_1000;
pub const INTC_HANDLER_ADDR: u32 = 0x1FC0_2000;
pub const THREAD_EPILOG_ADDR: u32 = 0x1FC0_3000;
pub const WAIT_THREAD_ADDR: u32 = 0x1FC0_3100;

const EPC: usize = 14;
const INTERRUPT_FRAME_SIZE: u16 = 0x210;

/// Write the reentry placeholder and all trampolines. Byte-identical on
/// every invocation for the same table-geometry constants.
pub fn install_all(bios: &mut [u8]) {
    write_u32(bios, 0x0004, 0x0000_001D);
    assemble_syscall_gate(&mut bios[0x0100..0x0200]);
    assemble_interrupt_handler(&mut bios[0x0200..0x1000]);
    assemble_dmac_handler(&mut bios[0x1000..0x2000]);
    assemble_intc_handler(&mut bios[0x2000..0x3000]);
    assemble_thread_epilog(&mut bios[0x3000..0x3100]);
    assemble_wait_thread(&mut bios[0x3100..0x3200]);
}

/// The gate custom syscalls are vectored through: saves RA, looks the
/// handler up in the guest-visible table at 0x8001_0000, masks the pointer
/// to a physical address, calls it, and ERETs back.
fn assemble_syscall_gate(mem: &mut [u8]) {
    let mut asm = MipsAssembler::new(mem);

    asm.addiu(SP, SP, 0xFFF0);
    asm.sd(RA, 0x0000, SP);

    // Index the table with the syscall number in V1
    asm.sll(T0, V1, 2);
    asm.lui(T1, (0x8000_0000u32 | CUSTOM_SYSCALL_BASE).wrapping_shr(16) as u16);
    asm.addu(T0, T0, T1);
    asm.lw(T0, 0x0000, T0);

    // Strip the segment bits off the handler address
    asm.lui(T1, 0x1FFF);
    asm.ori(T1, T1, 0xFFFF);
    asm.and(T0, T0, T1);

    asm.jalr(T0);
    asm.nop();

    asm.ld(RA, 0x0000, SP);
    asm.addiu(SP, SP, 0x0010);
    asm.eret();
}

/// The exception-vector body: spills all GPRs and EPC into a frame below
/// K0, AND-combines INTC_STAT with INTC_MASK, and dispatches INT1 to the
/// DMAC trampoline and the vblank/timer causes to the INTC trampoline.
fn assemble_interrupt_handler(mem: &mut [u8]) {
    let mut asm = MipsAssembler::new(mem);

    asm.addiu(K0, K0, 0u16.wrapping_sub(INTERRUPT_FRAME_SIZE));

    for i in 0..32 {
        asm.sq(i, (i as u16) * 0x10, K0);
    }

    asm.mfc0(T0, EPC);
    asm.sw(T0, 0x0200, K0);

    asm.addu(SP, K0, R0);

    // S0 = INTC_STAT & INTC_MASK
    asm.lui(T0, 0x1000);
    asm.ori(T0, T0, 0xF000);
    asm.lw(S0, 0x0000, T0);
    asm.lui(T1, 0x1000);
    asm.ori(T1, T1, 0xF010);
    asm.lw(S1, 0x0000, T1);
    asm.and(S0, S0, S1);

    // Cause clearing is left to the per-source trampolines
    asm.nop();

    // INT1 -> DMAC trampoline
    {
        let skip = asm.create_label();
        asm.andi(T0, S0, 0x0002);
        asm.beq(R0, T0, skip);
        asm.nop();
        asm.lui(T0, 0x1FC0);
        asm.ori(T0, T0, DMAC_HANDLER_ADDR as u16);
        asm.jalr(T0);
        asm.nop();
        asm.mark_label(skip);
    }

    // INT2/INT3 (vblank start/end), INT10/INT11 (timers) -> INTC trampoline
    for (mask, cause) in [(0x0004u16, 0x0002u16), (0x0008, 0x0003), (0x0400, 0x000A), (0x0800, 0x000B)] {
        let skip = asm.create_label();
        asm.andi(T0, S0, mask);
        asm.beq(R0, T0, skip);
        asm.nop();
        asm.lui(T0, 0x1FC0);
        asm.ori(T0, T0, INTC_HANDLER_ADDR as u16);
        asm.addiu(A0, R0, cause);
        asm.jalr(T0);
        asm.nop();
        asm.mark_label(skip);
    }

    asm.lw(T0, 0x0200, K0);
    asm.mtc0(T0, EPC);

    for i in 0..32 {
        asm.lq(i, (i as u16) * 0x10, K0);
    }

    asm.addiu(K0, K0, INTERRUPT_FRAME_SIZE);
    asm.eret();
}

/// Walks DMAC channels 9..0; for each pending channel, acknowledges it in
/// D_STAT and calls every valid matching entry of the DMAC handler table
/// with (A0 = channel, A1 = arg, GP = registered gp).
fn assemble_dmac_handler(mem: &mut [u8]) {
    let mut asm = MipsAssembler::new(mem);

    // S0 channel counter, S1 pending mask, S2 handler counter
    asm.addiu(SP, SP, 0xFFE0);
    asm.sd(RA, 0x0000, SP);
    asm.sd(S0, 0x0008, SP);
    asm.sd(S1, 0x0010, SP);
    asm.sd(S2, 0x0018, SP);

    // Acknowledge INT1 in INTC_STAT
    asm.lui(T1, 0x1000);
    asm.ori(T1, T1, 0xF000);
    asm.addiu(T0, R0, 0x0002);
    asm.sw(T0, 0x0000, T1);

    // Pending channels: D_STAT & (D_STAT >> 16)
    asm.lui(T0, 0x1000);
    asm.ori(T0, T0, 0xE010);
    asm.lw(T0, 0x0000, T0);
    asm.srl(T1, T0, 16);
    asm.and(S1, T0, T1);

    asm.addiu(S0, R0, 0x0009);

    let channel_loop = asm.create_label();
    let next_channel = asm.create_label();
    asm.mark_label(channel_loop);

    asm.ori(T0, R0, 0x0001);
    asm.sllv(T0, T0, S0);
    asm.and(T0, T0, S1);
    asm.beq(T0, R0, next_channel);
    asm.nop();

    // Acknowledge the channel in D_STAT
    asm.lui(T1, 0x1000);
    asm.ori(T1, T1, 0xE010);
    asm.sw(T0, 0x0000, T1);

    asm.addu(S2, R0, R0);

    let handler_loop = asm.create_label();
    let next_handler = asm.create_label();
    asm.mark_label(handler_loop);

    // Address of the handler record under the cursor
    asm.addiu(T0, R0, DMAC_HANDLER_SIZE as u16);
    asm.multu(T0, S2, T0);
    asm.lui(T1, (0x8000_0000u32 | DMAC_HANDLER_BASE).wrapping_shr(16) as u16);
    asm.ori(T1, T1, DMAC_HANDLER_BASE as u16);
    asm.addu(T0, T0, T1);

    asm.lw(T1, 0x0000, T0);
    asm.beq(T1, R0, next_handler);
    asm.nop();

    asm.lw(T1, 0x0004, T0);
    asm.bne(S0, T1, next_handler);
    asm.nop();

    asm.lw(T1, 0x0008, T0);
    asm.addu(A0, S0, R0);
    asm.lw(A1, 0x000C, T0);
    asm.lw(GP, 0x0010, T0);

    asm.jalr(T1);
    asm.nop();

    asm.mark_label(next_handler);
    asm.addiu(S2, S2, 0x0001);
    asm.addiu(T0, R0, (MAX_DMACHANDLER - 1) as u16);
    asm.bne(S2, T0, handler_loop);
    asm.nop();

    asm.mark_label(next_channel);
    asm.addiu(S0, S0, 0xFFFF);
    asm.bgez(S0, channel_loop);
    asm.nop();

    asm.ld(RA, 0x0000, SP);
    asm.ld(S0, 0x0008, SP);
    asm.ld(S1, 0x0010, SP);
    asm.ld(S2, 0x0018, SP);
    asm.addiu(SP, SP, 0x0020);
    asm.jr(RA);
    asm.nop();
}

/// Acknowledges the cause passed in A0 and calls every valid INTC handler
/// registered for it with (A0 = cause, A1 = arg, GP = registered gp).
fn assemble_intc_handler(mem: &mut [u8]) {
    let mut asm = MipsAssembler::new(mem);

    // S0 handler counter, S1 cause
    asm.addiu(SP, SP, 0xFFE0);
    asm.sd(RA, 0x0000, SP);
    asm.sd(S0, 0x0008, SP);
    asm.sd(S1, 0x0010, SP);

    // Acknowledge the cause in INTC_STAT
    asm.lui(T1, 0x1000);
    asm.ori(T1, T1, 0xF000);
    asm.addiu(T0, R0, 0x0001);
    asm.sllv(T0, T0, A0);
    asm.sw(T0, 0x0000, T1);

    asm.addu(S0, R0, R0);
    asm.addu(S1, A0, R0);

    let check_handler = asm.create_label();
    let next_handler = asm.create_label();
    asm.mark_label(check_handler);

    asm.addiu(T0, R0, INTC_HANDLER_SIZE as u16);
    asm.multu(T0, S0, T0);
    asm.lui(T1, (0x8000_0000u32 | INTC_HANDLER_BASE).wrapping_shr(16) as u16);
    asm.ori(T1, T1, INTC_HANDLER_BASE as u16);
    asm.addu(T0, T0, T1);

    asm.lw(T1, 0x0000, T0);
    asm.beq(T1, R0, next_handler);
    asm.nop();

    asm.lw(T1, 0x0004, T0);
    asm.bne(S1, T1, next_handler);
    asm.nop();

    asm.lw(T1, 0x0008, T0);
    asm.addu(A0, S1, R0);
    asm.lw(A1, 0x000C, T0);
    asm.lw(GP, 0x0010, T0);

    asm.jalr(T1);
    asm.nop();

    asm.mark_label(next_handler);
    asm.addiu(S0, S0, 0x0001);
    asm.addiu(T0, R0, (MAX_INTCHANDLER - 1) as u16);
    asm.bne(S0, T0, check_handler);
    asm.nop();

    asm.ld(RA, 0x0000, SP);
    asm.ld(S0, 0x0008, SP);
    asm.ld(S1, 0x0010, SP);
    asm.addiu(SP, SP, 0x0020);
    asm.jr(RA);
    asm.nop();
}

/// Installed as RA of every new thread: ExitThread.
fn assemble_thread_epilog(mem: &mut [u8]) {
    let mut asm = MipsAssembler::new(mem);
    asm.addiu(V1, R0, 0x0023);
    asm.syscall();
}

/// Thread 0's body: request a reschedule, loop forever.
fn assemble_wait_thread(mem: &mut [u8]) {
    let mut asm = MipsAssembler::new(mem);
    let top = asm.create_label();
    asm.mark_label(top);
    asm.addiu(V1, R0, 0x0666);
    asm.syscall();
    asm.beq(R0, R0, top);
    asm.nop();
}
