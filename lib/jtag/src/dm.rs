/*++

Licensed under the Apache-2.0 license.

File Name:

    dm.rs

Abstract:

    File contains the RISC-V Debug Module (v0.13.2). Abstract commands are
    satisfied by synthesising instructions into the debug memory and
    running them through the hart-side park loop.

--*/

use std::collections::HashSet;

use ot_emu_bus::{Bus, BusError};
use ot_emu_types::{RvAddr, RvData, RvSize};
use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

use crate::dtm::DebugDevice;

register_bitfields! [
    u32,

    /// Debug Module Control Register Fields
    DmControl [
        DMACTIVE OFFSET(0) NUMBITS(1) [],
        NDMRESET OFFSET(1) NUMBITS(1) [],
        HARTSELHI OFFSET(6) NUMBITS(10) [],
        HARTSELLO OFFSET(16) NUMBITS(10) [],
        HASEL OFFSET(26) NUMBITS(1) [],
        ACKHAVERESET OFFSET(28) NUMBITS(1) [],
        HARTRESET OFFSET(29) NUMBITS(1) [],
        RESUMEREQ OFFSET(30) NUMBITS(1) [],
        HALTREQ OFFSET(31) NUMBITS(1) [],
    ],

    /// Abstract Command Register Fields
    Command [
        REGNO OFFSET(0) NUMBITS(16) [],
        WRITE OFFSET(16) NUMBITS(1) [],
        TRANSFER OFFSET(17) NUMBITS(1) [],
        POSTEXEC OFFSET(18) NUMBITS(1) [],
        AARPOSTINCREMENT OFFSET(19) NUMBITS(1) [],
        AARSIZE OFFSET(20) NUMBITS(3) [],
        AAMVIRTUAL OFFSET(23) NUMBITS(1) [],
        CMDTYPE OFFSET(24) NUMBITS(8) [],
    ],

    /// System Bus Access Control and Status Register Fields
    Sbcs [
        SBACCESS8 OFFSET(0) NUMBITS(1) [],
        SBACCESS16 OFFSET(1) NUMBITS(1) [],
        SBACCESS32 OFFSET(2) NUMBITS(1) [],
        SBASIZE OFFSET(5) NUMBITS(7) [],
        SBERROR OFFSET(12) NUMBITS(3) [],
        SBREADONDATA OFFSET(15) NUMBITS(1) [],
        SBAUTOINCREMENT OFFSET(16) NUMBITS(1) [],
        SBACCESS OFFSET(17) NUMBITS(3) [],
        SBREADONADDR OFFSET(20) NUMBITS(1) [],
        SBBUSYERROR OFFSET(22) NUMBITS(1) [],
        SBVERSION OFFSET(29) NUMBITS(3) [],
    ],
];

// DMI register addresses, relative to the module base.
const DMI_DATA0: u32 = 0x04;
const DMI_DATA_END: u32 = DMI_DATA0 + DATA_COUNT as u32 - 1;
const DMI_DMCONTROL: u32 = 0x10;
const DMI_DMSTATUS: u32 = 0x11;
const DMI_HARTINFO: u32 = 0x12;
const DMI_ABSTRACTCS: u32 = 0x16;
const DMI_COMMAND: u32 = 0x17;
const DMI_ABSTRACTAUTO: u32 = 0x18;
const DMI_NEXTDM: u32 = 0x1d;
const DMI_PROGBUF0: u32 = 0x20;
const DMI_PROGBUF_END: u32 = DMI_PROGBUF0 + PROGBUF_SIZE as u32 - 1;
const DMI_SBCS: u32 = 0x38;
const DMI_SBADDRESS0: u32 = 0x39;
const DMI_SBADDRESS1: u32 = 0x3a;
const DMI_SBDATA0: u32 = 0x3c;
const DMI_SBDATA1: u32 = 0x3d;
const DMI_HALTSUM0: u32 = 0x40;
const DM_NUM_REGS: u32 = 0x41;

pub const DATA_COUNT: usize = 12;
pub const PROGBUF_SIZE: usize = 16;

/// Debug memory layout, as seen by a hart parked in the debug ROM.
pub const DEBUG_MEM_SIZE: usize = 0x800;
pub const DEBUG_HALTED: u32 = 0x100;
pub const DEBUG_GOING: u32 = 0x104;
pub const DEBUG_RESUMING: u32 = 0x108;
pub const DEBUG_EXCEPTION: u32 = 0x10c;
pub const DEBUG_WHERETO: u32 = 0x300;
pub const DEBUG_RESUME: u32 = 0x310;
pub const DEBUG_ABSTRACT: u32 = 0x318;
pub const DEBUG_PROGBUF: u32 = 0x340;
pub const DEBUG_DATA: u32 = 0x380;
pub const DEBUG_FLAGS: u32 = 0x400;

const FLAG_GO: u8 = 1 << 0;
const FLAG_RESUME: u8 = 1 << 1;

const CSR_DCSR: u16 = 0x7b0;
const CSR_DSCRATCH0: u16 = 0x7b2;
const CSR_DSCRATCH1: u16 = 0x7b3;

const DCSR_XDEBUGVER: u32 = 4 << 28;
const DCSR_CAUSE_SHIFT: u32 = 6;
const DCSR_CAUSE_MASK: u32 = 7 << DCSR_CAUSE_SHIFT;
const DCSR_CAUSE_HALTREQ: u32 = 3;
const DCSR_STEP: u32 = 1 << 2;

// Abstract register number spaces.
const REGNO_CSR_END: u32 = 0x0fff;
const REGNO_GPR_BASE: u32 = 0x1000;
const REGNO_FPR_BASE: u32 = 0x1020;
const REGNO_FPR_END: u32 = 0x103f;

const GPR_S0: u32 = 8;
const GPR_A0: u32 = 10;

/// Sticky abstract command error codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmdErr {
    None = 0,
    Busy = 1,
    NotSupported = 2,
    Exception = 3,
    HaltResume = 4,
    Bus = 5,
    Other = 7,
}

mod instr {
    pub const EBREAK: u32 = 0x0010_0073;
    pub const C_EBREAK: u32 = 0x9002;

    fn enc_i(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: u32) -> u32 {
        (imm << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn enc_s(opcode: u32, funct3: u32, rs2: u32, imm: u32) -> u32 {
        ((imm >> 5) << 25) | (rs2 << 20) | (funct3 << 12) | ((imm & 0x1f) << 7) | opcode
    }

    /// lw rd, imm(x0)
    pub fn lw(rd: u32, imm: u32) -> u32 {
        enc_i(0x03, 2, rd, 0, imm)
    }

    /// sw rs2, imm(x0)
    pub fn sw(rs2: u32, imm: u32) -> u32 {
        enc_s(0x23, 2, rs2, imm)
    }

    /// fld frd, imm(x0)
    pub fn fld(rd: u32, imm: u32) -> u32 {
        enc_i(0x07, 3, rd, 0, imm)
    }

    /// fsd frs2, imm(x0)
    pub fn fsd(rs2: u32, imm: u32) -> u32 {
        enc_s(0x27, 3, rs2, imm)
    }

    /// csrrw x0, csr, rs1
    pub fn csrw(csr: u16, rs1: u32) -> u32 {
        enc_i(0x73, 1, 0, rs1, u32::from(csr))
    }

    /// csrrs rd, csr, x0
    pub fn csrr(rd: u32, csr: u16) -> u32 {
        enc_i(0x73, 2, rd, 0, u32::from(csr))
    }

    /// jal x0, offset
    pub fn jal(offset: i32) -> u32 {
        let off = offset as u32;
        ((off >> 20 & 1) << 31)
            | ((off >> 1 & 0x3ff) << 21)
            | ((off >> 11 & 1) << 20)
            | ((off >> 12 & 0xff) << 12)
            | 0x6f
    }

    /// Branch target of a `jal x0` instruction located at `pc`.
    pub fn jal_target(insn: u32, pc: u32) -> Option<u32> {
        if insn & 0xfff != 0x06f {
            return None;
        }
        let imm = ((insn >> 31 & 1) << 20)
            | ((insn >> 12 & 0xff) << 12)
            | ((insn >> 20 & 1) << 11)
            | ((insn >> 21 & 0x3ff) << 1);
        // Sign-extend the 21-bit immediate.
        let imm = (imm as i32) << 11 >> 11;
        Some(pc.wrapping_add(imm as u32))
    }
}

/// Hart-side interface the Debug Module drives. A CPU implementation
/// exposes its register files and reset/debug-interrupt lines through this.
pub trait DebugHart {
    fn read_gpr(&mut self, reg: usize) -> u32;
    fn write_gpr(&mut self, reg: usize, value: u32);
    fn read_fpr(&mut self, reg: usize) -> u64;
    fn write_fpr(&mut self, reg: usize, value: u64);
    fn read_csr(&mut self, csr: u16) -> Result<u32, ()>;
    fn write_csr(&mut self, csr: u16, value: u32) -> Result<(), ()>;

    /// Debug interrupt request line; high asks the hart to enter the
    /// debug-ROM park loop.
    fn set_debug_irq(&mut self, level: bool);

    fn in_reset(&self) -> bool;
    fn set_reset(&mut self, level: bool);

    /// Instruction at the resume point, used to refuse single-stepping
    /// over an ebreak.
    fn next_instruction(&mut self) -> Option<u32>;
}

struct HartState {
    hart: Box<dyn DebugHart>,
    halted: bool,
    resumed: bool,
    havereset: bool,
    unavailable: bool,
    unlock_reset: bool,
    step_suppressed: bool,
    /// dscratch0/dscratch1 shadows; dscratch1 holds the hart's a0 while
    /// it sits in the park loop.
    dscratch: [u32; 2],
}

enum ExecFault {
    Exception,
}

/// RISC-V Debug Module
pub struct Dm {
    base_addr: u32,
    next_dm: u32,

    harts: Vec<HartState>,
    hartsel: usize,
    selected_nonexistent: bool,

    sysbus: Option<Box<dyn Bus>>,

    dmactive: bool,
    command: u32,
    cmderr: CmdErr,
    busy: bool,
    abstractauto: u32,
    ndmreset_requested: bool,

    sbcs: LocalRegisterCopy<u32, Sbcs::Register>,
    sberror: u32,
    sbaddress: u32,
    sbdata: u32,

    debug_mem: Vec<u8>,
    pending_go: HashSet<usize>,

    read_result: u32,
}

impl Dm {
    pub fn new(base_addr: u32, sysbus: Option<Box<dyn Bus>>) -> Dm {
        Dm {
            base_addr,
            next_dm: 0,
            harts: Vec::new(),
            hartsel: 0,
            selected_nonexistent: false,
            sysbus,
            dmactive: false,
            command: 0,
            cmderr: CmdErr::None,
            busy: false,
            abstractauto: 0,
            ndmreset_requested: false,
            sbcs: LocalRegisterCopy::new(0),
            sberror: 0,
            sbaddress: 0,
            sbdata: 0,
            debug_mem: vec![0; DEBUG_MEM_SIZE],
            pending_go: HashSet::new(),
            read_result: 0,
        }
    }

    /// Attach a hart. Harts are numbered in registration order.
    pub fn add_hart(&mut self, mut hart: Box<dyn DebugHart>, unlock_reset: bool) {
        let unavailable = hart.in_reset();
        let _ = hart.write_csr(CSR_DCSR, DCSR_XDEBUGVER);
        self.harts.push(HartState {
            hart,
            halted: false,
            resumed: false,
            havereset: false,
            unavailable,
            unlock_reset,
            step_suppressed: false,
            dscratch: [0; 2],
        });
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    pub fn hart_halted(&self, ix: usize) -> bool {
        self.harts.get(ix).map(|h| h.halted).unwrap_or(false)
    }

    pub fn cmderr(&self) -> CmdErr {
        self.cmderr
    }

    /// True once a debugger has requested a non-debug-module reset.
    pub fn take_ndmreset(&mut self) -> bool {
        std::mem::take(&mut self.ndmreset_requested)
    }

    fn mem_read_u32(&self, addr: u32) -> u32 {
        let ix = addr as usize;
        match self.debug_mem.get(ix..ix + 4) {
            Some(bytes) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            None => 0,
        }
    }

    fn mem_write_u32(&mut self, addr: u32, value: u32) {
        let ix = addr as usize;
        if let Some(bytes) = self.debug_mem.get_mut(ix..ix + 4) {
            bytes.copy_from_slice(&value.to_le_bytes());
        }
    }

    fn mem_read_u64(&self, addr: u32) -> u64 {
        u64::from(self.mem_read_u32(addr)) | (u64::from(self.mem_read_u32(addr + 4)) << 32)
    }

    fn mem_write_u64(&mut self, addr: u32, value: u64) {
        self.mem_write_u32(addr, value as u32);
        self.mem_write_u32(addr + 4, (value >> 32) as u32);
    }

    fn data_read(&self, ix: usize) -> u32 {
        self.mem_read_u32(DEBUG_DATA + 4 * ix as u32)
    }

    fn data_write(&mut self, ix: usize, value: u32) {
        self.mem_write_u32(DEBUG_DATA + 4 * ix as u32, value);
    }

    fn reg_read(&mut self, addr: u32) -> u32 {
        match addr {
            DMI_DATA0..=DMI_DATA_END => {
                let ix = (addr - DMI_DATA0) as usize;
                let value = self.data_read(ix);
                self.autoexec_data(ix);
                value
            }
            DMI_DMCONTROL => self.read_dmcontrol(),
            DMI_DMSTATUS => self.read_dmstatus(),
            DMI_HARTINFO => {
                // nscratch=2, memory-mapped data words at DEBUG_DATA
                (2 << 20) | (1 << 16) | ((DATA_COUNT as u32) << 12) | DEBUG_DATA
            }
            DMI_ABSTRACTCS => {
                ((PROGBUF_SIZE as u32) << 24)
                    | (u32::from(self.busy) << 12)
                    | ((self.cmderr as u32) << 8)
                    | DATA_COUNT as u32
            }
            DMI_COMMAND => 0,
            DMI_ABSTRACTAUTO => self.abstractauto,
            DMI_NEXTDM => self.next_dm,
            DMI_PROGBUF0..=DMI_PROGBUF_END => {
                let ix = (addr - DMI_PROGBUF0) as usize;
                let value = self.mem_read_u32(DEBUG_PROGBUF + 4 * ix as u32);
                self.autoexec_progbuf(ix);
                value
            }
            DMI_SBCS => self.read_sbcs(),
            DMI_SBADDRESS0 => self.sbaddress,
            DMI_SBADDRESS1 => 0,
            DMI_SBDATA0 => {
                let value = self.sbdata;
                if self.sbcs.is_set(Sbcs::SBREADONDATA) {
                    self.system_bus_access(false);
                }
                value
            }
            DMI_SBDATA1 => 0,
            DMI_HALTSUM0 => self
                .harts
                .iter()
                .enumerate()
                .filter(|(_, h)| h.halted)
                .fold(0, |sum, (ix, _)| sum | (1 << ix)),
            _ => {
                log::warn!("DM: guest error: read of invalid register {addr:#x}");
                0
            }
        }
    }

    fn reg_write(&mut self, addr: u32, value: u32) {
        match addr {
            DMI_DATA0..=DMI_DATA_END => {
                let ix = (addr - DMI_DATA0) as usize;
                self.data_write(ix, value);
                self.autoexec_data(ix);
            }
            DMI_DMCONTROL => self.write_dmcontrol(value),
            DMI_ABSTRACTCS => {
                // cmderr is W1C.
                if (value >> 8) & 7 != 0 {
                    self.cmderr = CmdErr::None;
                }
            }
            DMI_COMMAND => self.dispatch_command(value),
            DMI_ABSTRACTAUTO => {
                self.abstractauto = value & 0xffff_0fff;
            }
            DMI_PROGBUF0..=DMI_PROGBUF_END => {
                let ix = (addr - DMI_PROGBUF0) as usize;
                self.mem_write_u32(DEBUG_PROGBUF + 4 * ix as u32, value);
                self.autoexec_progbuf(ix);
            }
            DMI_SBCS => self.write_sbcs(value),
            DMI_SBADDRESS0 => {
                self.sbaddress = value;
                if self.sbcs.is_set(Sbcs::SBREADONADDR) {
                    self.system_bus_access(false);
                }
            }
            DMI_SBDATA0 => {
                self.sbdata = value;
                self.system_bus_access(true);
            }
            DMI_DMSTATUS | DMI_HARTINFO | DMI_NEXTDM | DMI_HALTSUM0 | DMI_SBADDRESS1
            | DMI_SBDATA1 => {
                log::warn!("DM: guest error: write to read-only register {addr:#x}");
            }
            _ => {
                log::warn!("DM: guest error: write to invalid register {addr:#x}");
            }
        }
    }

    fn read_dmcontrol(&self) -> u32 {
        let mut ctrl = LocalRegisterCopy::<u32, DmControl::Register>::new(0);
        ctrl.modify(DmControl::DMACTIVE.val(u32::from(self.dmactive)));
        ctrl.modify(DmControl::HARTSELLO.val(self.hartsel as u32 & 0x3ff));
        ctrl.modify(DmControl::HARTSELHI.val(self.hartsel as u32 >> 10));
        ctrl.get()
    }

    fn read_dmstatus(&self) -> u32 {
        // version=2 (v0.13), authenticated
        let mut status = 2 | (1 << 7);
        let mut set = |bit: u32, cond: bool| {
            if cond {
                status |= 1 << bit;
            }
        };
        if self.selected_nonexistent {
            set(14, true); // anynonexistent
            set(15, true); // allnonexistent
        } else if let Some(hart) = self.harts.get(self.hartsel) {
            let running = !hart.halted && !hart.unavailable;
            set(8, hart.halted);
            set(9, hart.halted);
            set(10, running);
            set(11, running);
            set(12, hart.unavailable);
            set(13, hart.unavailable);
            set(16, hart.resumed);
            set(17, hart.resumed);
            set(18, hart.havereset);
            set(19, hart.havereset);
        }
        status
    }

    fn write_dmcontrol(&mut self, value: u32) {
        let ctrl = LocalRegisterCopy::<u32, DmControl::Register>::new(value);
        if !ctrl.is_set(DmControl::DMACTIVE) {
            if self.dmactive {
                self.reset();
            }
            return;
        }
        self.dmactive = true;

        let raw_sel =
            (ctrl.read(DmControl::HARTSELLO) | (ctrl.read(DmControl::HARTSELHI) << 10)) as usize;
        // Nonexistence is judged on the raw index; only an in-range (or
        // hart-array) selection updates hartsel.
        self.selected_nonexistent =
            !ctrl.is_set(DmControl::HASEL) && raw_sel >= self.harts.len();
        if !self.selected_nonexistent {
            let mask = self.harts.len().next_power_of_two().max(1) - 1;
            self.hartsel = raw_sel & mask;
        }

        if !self.selected_nonexistent {
            let hart = &mut self.harts[self.hartsel];
            if ctrl.is_set(DmControl::HARTRESET) {
                if hart.unlock_reset {
                    hart.hart.set_reset(true);
                    hart.unavailable = true;
                }
            } else if hart.hart.in_reset() && hart.unlock_reset {
                hart.hart.set_reset(false);
                hart.unavailable = false;
                hart.havereset = true;
            }
        }

        if ctrl.is_set(DmControl::ACKHAVERESET) {
            for hart in &mut self.harts {
                hart.havereset = false;
            }
        }

        if ctrl.is_set(DmControl::NDMRESET) {
            self.ndmreset_requested = true;
        } else if ctrl.is_set(DmControl::HALTREQ) {
            self.halt_hart(self.hartsel);
        } else if ctrl.is_set(DmControl::RESUMEREQ) && !self.selected_nonexistent {
            if self.harts[self.hartsel].halted {
                self.resume_hart(self.hartsel);
            }
        }
    }

    fn reset(&mut self) {
        self.dmactive = false;
        self.hartsel = 0;
        self.selected_nonexistent = false;
        self.command = 0;
        self.cmderr = CmdErr::None;
        self.busy = false;
        self.abstractauto = 0;
        self.sbcs.set(0);
        self.sberror = 0;
        self.sbaddress = 0;
        self.sbdata = 0;
        self.pending_go.clear();
        self.debug_mem.iter_mut().for_each(|b| *b = 0);
    }

    /// Ask the selected hart to enter the park loop.
    fn halt_hart(&mut self, ix: usize) {
        let Some(hart) = self.harts.get_mut(ix) else {
            return;
        };
        if hart.halted || hart.unavailable {
            return;
        }
        hart.hart.set_debug_irq(true);
        // The hart takes the debug interrupt: DCSR records the cause, the
        // park loop stashes a0 in dscratch1 and announces itself.
        let dcsr = hart.hart.read_csr(CSR_DCSR).unwrap_or(0);
        let dcsr = (dcsr & !DCSR_CAUSE_MASK) | (DCSR_CAUSE_HALTREQ << DCSR_CAUSE_SHIFT);
        let _ = hart.hart.write_csr(CSR_DCSR, dcsr);
        hart.dscratch[1] = hart.hart.read_gpr(GPR_A0 as usize);
        hart.resumed = false;
        self.ack_halted(ix as u32);
    }

    fn resume_hart(&mut self, ix: usize) {
        self.mem_write_u32(
            DEBUG_WHERETO,
            instr::jal((DEBUG_RESUME as i32) - (DEBUG_WHERETO as i32)),
        );
        let hart = &mut self.harts[ix];
        let dcsr = hart.hart.read_csr(CSR_DCSR).unwrap_or(0);
        if dcsr & DCSR_STEP != 0 {
            // Cannot single-step past an ebreak; suppress step for this
            // resume and restore it on the resume acknowledgement.
            let next = hart.hart.next_instruction();
            let is_ebreak = matches!(next, Some(insn)
                if insn == instr::EBREAK || insn & 0xffff == instr::C_EBREAK);
            if is_ebreak {
                let _ = hart.hart.write_csr(CSR_DCSR, dcsr & !DCSR_STEP);
                hart.step_suppressed = true;
            }
        }
        let saved_a0 = hart.dscratch[1];
        hart.hart.write_gpr(GPR_A0 as usize, saved_a0);
        hart.hart.set_debug_irq(false);
        let flags_addr = (DEBUG_FLAGS + ix as u32) as usize;
        self.debug_mem[flags_addr] |= FLAG_RESUME;
        // The park loop observes the flag and acknowledges.
        self.ack_resuming(ix as u32);
    }

    fn ack_halted(&mut self, hartid: u32) {
        if let Some(hart) = self.harts.get_mut(hartid as usize) {
            hart.halted = true;
            hart.unavailable = false;
        }
        self.busy = false;
    }

    fn ack_going(&mut self) {
        for ix in std::mem::take(&mut self.pending_go) {
            let flags_addr = (DEBUG_FLAGS + ix as u32) as usize;
            match self.debug_mem.get_mut(flags_addr) {
                Some(flags) => *flags &= !FLAG_GO,
                None => log::warn!("DM: cannot clear go flag for hart {ix}"),
            }
        }
    }

    fn ack_resuming(&mut self, hartid: u32) {
        let flags_addr = (DEBUG_FLAGS + hartid) as usize;
        if let Some(flags) = self.debug_mem.get_mut(flags_addr) {
            *flags &= !FLAG_RESUME;
        }
        if let Some(hart) = self.harts.get_mut(hartid as usize) {
            hart.resumed = true;
            hart.halted = false;
            if hart.step_suppressed {
                hart.step_suppressed = false;
                if let Ok(dcsr) = hart.hart.read_csr(CSR_DCSR) {
                    let _ = hart.hart.write_csr(CSR_DCSR, dcsr | DCSR_STEP);
                }
            }
        }
    }

    fn ack_exception(&mut self) {
        if self.cmderr == CmdErr::None {
            self.cmderr = CmdErr::Exception;
        }
        self.busy = false;
    }

    fn autoexec_data(&mut self, ix: usize) {
        if self.abstractauto & (1 << ix) != 0 {
            let command = self.command;
            self.dispatch_command(command);
        }
    }

    fn autoexec_progbuf(&mut self, ix: usize) {
        if self.abstractauto & (1 << (16 + ix)) != 0 {
            let command = self.command;
            self.dispatch_command(command);
        }
    }

    fn dispatch_command(&mut self, value: u32) {
        // A pending sticky error suppresses new commands.
        if self.cmderr != CmdErr::None {
            return;
        }
        if self.busy {
            self.cmderr = CmdErr::Busy;
            return;
        }
        self.command = value;
        let cmd = LocalRegisterCopy::<u32, Command::Register>::new(value);
        match cmd.read(Command::CMDTYPE) {
            0 => self.access_register(cmd),
            2 => self.access_memory(cmd),
            other => {
                // Quick Access and anything above is unimplemented.
                log::warn!("DM: unsupported abstract command type {other}");
                self.cmderr = CmdErr::NotSupported;
            }
        }
    }

    /// Synthesise the Access Register program. `None` means the request
    /// cannot be satisfied and an ebreak was emitted instead.
    fn synthesize_access_register(
        &mut self,
        cmd: &LocalRegisterCopy<u32, Command::Register>,
    ) -> Option<Vec<u32>> {
        let regno = cmd.read(Command::REGNO);
        let write = cmd.is_set(Command::WRITE);
        let aarsize = cmd.read(Command::AARSIZE);
        let mut prog = Vec::new();
        match regno {
            0..=REGNO_CSR_END => {
                if aarsize != 2 {
                    return None;
                }
                let csr = regno as u16;
                prog.push(instr::csrw(CSR_DSCRATCH0, GPR_S0));
                if write {
                    prog.push(instr::lw(GPR_S0, DEBUG_DATA));
                    prog.push(instr::csrw(csr, GPR_S0));
                } else {
                    prog.push(instr::csrr(GPR_S0, csr));
                    prog.push(instr::sw(GPR_S0, DEBUG_DATA));
                }
                prog.push(instr::csrr(GPR_S0, CSR_DSCRATCH0));
            }
            REGNO_GPR_BASE..=0x101f => {
                if aarsize != 2 {
                    return None;
                }
                let reg = regno - REGNO_GPR_BASE;
                if reg == GPR_A0 {
                    // The park loop owns a0; the real value lives in
                    // dscratch1 while the hart is halted.
                    prog.push(instr::csrw(CSR_DSCRATCH0, GPR_S0));
                    if write {
                        prog.push(instr::lw(GPR_S0, DEBUG_DATA));
                        prog.push(instr::csrw(CSR_DSCRATCH1, GPR_S0));
                    } else {
                        prog.push(instr::csrr(GPR_S0, CSR_DSCRATCH1));
                        prog.push(instr::sw(GPR_S0, DEBUG_DATA));
                    }
                    prog.push(instr::csrr(GPR_S0, CSR_DSCRATCH0));
                } else if write {
                    prog.push(instr::lw(reg, DEBUG_DATA));
                } else {
                    prog.push(instr::sw(reg, DEBUG_DATA));
                }
            }
            REGNO_FPR_BASE..=REGNO_FPR_END => {
                if aarsize != 3 {
                    return None;
                }
                let reg = regno - REGNO_FPR_BASE;
                if write {
                    prog.push(instr::fld(reg, DEBUG_DATA));
                } else {
                    prog.push(instr::fsd(reg, DEBUG_DATA));
                }
            }
            _ => return None,
        }
        Some(prog)
    }

    fn access_register(&mut self, cmd: LocalRegisterCopy<u32, Command::Register>) {
        let halted = self
            .harts
            .get(self.hartsel)
            .map(|h| h.halted)
            .unwrap_or(false);
        if self.selected_nonexistent || !halted {
            self.cmderr = CmdErr::HaltResume;
            return;
        }
        let transfer = cmd.is_set(Command::TRANSFER);
        let postexec = cmd.is_set(Command::POSTEXEC);

        let target = if transfer {
            let Some(mut prog) = self.synthesize_access_register(&cmd) else {
                self.mem_write_u32(DEBUG_ABSTRACT, instr::EBREAK);
                self.cmderr = CmdErr::NotSupported;
                return;
            };
            if postexec {
                let from = DEBUG_ABSTRACT as i32 + 4 * prog.len() as i32;
                prog.push(instr::jal(DEBUG_PROGBUF as i32 - from));
            } else {
                prog.push(instr::EBREAK);
            }
            for (ix, insn) in prog.iter().enumerate() {
                self.mem_write_u32(DEBUG_ABSTRACT + 4 * ix as u32, *insn);
            }
            DEBUG_ABSTRACT
        } else if postexec {
            DEBUG_PROGBUF
        } else {
            // Nothing to run.
            return;
        };

        self.mem_write_u32(
            DEBUG_WHERETO,
            instr::jal(target as i32 - DEBUG_WHERETO as i32),
        );
        self.busy = true;
        let ix = self.hartsel;
        let flags_addr = (DEBUG_FLAGS + ix as u32) as usize;
        self.debug_mem[flags_addr] |= FLAG_GO;
        self.pending_go.insert(ix);
        self.run_park_loop(ix);

        if self.cmderr == CmdErr::None && cmd.is_set(Command::AARPOSTINCREMENT) {
            let next_regno = (cmd.read(Command::REGNO) + 1) & 0xffff;
            self.command = (self.command & !0xffff) | next_regno;
        }
    }

    fn access_memory(&mut self, cmd: LocalRegisterCopy<u32, Command::Register>) {
        if cmd.is_set(Command::AAMVIRTUAL) {
            self.cmderr = CmdErr::NotSupported;
            return;
        }
        let size = match cmd.read(Command::AARSIZE) {
            0 => RvSize::Byte,
            1 => RvSize::HalfWord,
            2 => RvSize::Word,
            _ => {
                self.cmderr = CmdErr::NotSupported;
                return;
            }
        };
        let write = cmd.is_set(Command::WRITE);
        let addr = self.data_read(1);
        let value = self.mem_read_u32(DEBUG_DATA);
        let Some(sysbus) = self.sysbus.as_mut() else {
            self.cmderr = CmdErr::Bus;
            return;
        };
        let result = if write {
            sysbus.write(size, addr, value).err()
        } else {
            match sysbus.read(size, addr) {
                Ok(value) => {
                    self.data_write(0, value);
                    None
                }
                Err(e) => Some(e),
            }
        };
        if result.is_some() {
            self.cmderr = CmdErr::Bus;
            return;
        }
        if cmd.is_set(Command::AARPOSTINCREMENT) {
            self.data_write(1, addr.wrapping_add(usize::from(size) as u32));
        }
    }

    /// Emulate the parked hart: acknowledge GOING, follow `whereto` and
    /// execute the synthesised program until its trailing ebreak.
    fn run_park_loop(&mut self, ix: usize) {
        self.ack_going();
        let whereto = self.mem_read_u32(DEBUG_WHERETO);
        let Some(mut pc) = instr::jal_target(whereto, DEBUG_WHERETO) else {
            log::error!("DM: whereto does not hold a jump: {whereto:#010x}");
            self.ack_exception();
            return;
        };
        let mut steps = 0;
        loop {
            steps += 1;
            if steps > 64 || pc as usize >= DEBUG_MEM_SIZE {
                self.ack_exception();
                return;
            }
            let insn = self.mem_read_u32(pc);
            match self.execute_debug_insn(ix, insn, pc) {
                Ok(None) => {
                    // ebreak: back to the park loop.
                    self.ack_halted(ix as u32);
                    return;
                }
                Ok(Some(next_pc)) => pc = next_pc,
                Err(ExecFault::Exception) => {
                    self.ack_exception();
                    return;
                }
            }
        }
    }

    /// One instruction of the synthesised debug program. Returns the next
    /// pc, or `None` for ebreak.
    fn execute_debug_insn(
        &mut self,
        ix: usize,
        insn: u32,
        pc: u32,
    ) -> Result<Option<u32>, ExecFault> {
        if insn == instr::EBREAK {
            return Ok(None);
        }
        if let Some(target) = instr::jal_target(insn, pc) {
            return Ok(Some(target));
        }
        let opcode = insn & 0x7f;
        let funct3 = (insn >> 12) & 7;
        let rd = (insn >> 7) & 0x1f;
        let rs2 = (insn >> 20) & 0x1f;
        let imm_i = insn >> 20;
        let imm_s = ((insn >> 25) << 5) | ((insn >> 7) & 0x1f);
        let hart = &mut self.harts[ix];
        match (opcode, funct3) {
            (0x03, 2) => {
                let value = self.mem_read_u32(imm_i);
                if rd != 0 {
                    self.harts[ix].hart.write_gpr(rd as usize, value);
                }
            }
            (0x23, 2) => {
                let value = self.harts[ix].hart.read_gpr(rs2 as usize);
                self.mem_write_u32(imm_s, value);
            }
            (0x07, 3) => {
                let value = self.mem_read_u64(imm_i);
                self.harts[ix].hart.write_fpr(rd as usize, value);
            }
            (0x27, 3) => {
                let value = self.harts[ix].hart.read_fpr(rs2 as usize);
                self.mem_write_u64(imm_s, value);
            }
            (0x73, 1) => {
                // csrrw x0, csr, rs1
                let rs1 = (insn >> 15) & 0x1f;
                let value = hart.hart.read_gpr(rs1 as usize);
                match imm_i as u16 {
                    CSR_DSCRATCH0 => hart.dscratch[0] = value,
                    CSR_DSCRATCH1 => hart.dscratch[1] = value,
                    csr => hart.hart.write_csr(csr, value).map_err(|_| ExecFault::Exception)?,
                }
            }
            (0x73, 2) => {
                // csrrs rd, csr, x0
                let value = match imm_i as u16 {
                    CSR_DSCRATCH0 => hart.dscratch[0],
                    CSR_DSCRATCH1 => hart.dscratch[1],
                    csr => hart.hart.read_csr(csr).map_err(|_| ExecFault::Exception)?,
                };
                if rd != 0 {
                    hart.hart.write_gpr(rd as usize, value);
                }
            }
            _ => {
                log::error!("DM: cannot execute debug instruction {insn:#010x} at {pc:#x}");
                return Err(ExecFault::Exception);
            }
        }
        Ok(Some(pc + 4))
    }

    fn read_sbcs(&self) -> u32 {
        let mut sbcs = LocalRegisterCopy::<u32, Sbcs::Register>::new(self.sbcs.get());
        sbcs.modify(Sbcs::SBVERSION.val(1));
        sbcs.modify(Sbcs::SBERROR.val(self.sberror));
        sbcs.modify(Sbcs::SBASIZE.val(32));
        sbcs.modify(Sbcs::SBACCESS32.val(1));
        sbcs.modify(Sbcs::SBACCESS16.val(1));
        sbcs.modify(Sbcs::SBACCESS8.val(1));
        sbcs.get()
    }

    fn write_sbcs(&mut self, value: u32) {
        let new = LocalRegisterCopy::<u32, Sbcs::Register>::new(value);
        // sberror is W1C.
        if new.read(Sbcs::SBERROR) != 0 {
            self.sberror = 0;
        }
        let mut stored = LocalRegisterCopy::<u32, Sbcs::Register>::new(0);
        stored.modify(Sbcs::SBREADONADDR.val(new.read(Sbcs::SBREADONADDR)));
        stored.modify(Sbcs::SBREADONDATA.val(new.read(Sbcs::SBREADONDATA)));
        stored.modify(Sbcs::SBAUTOINCREMENT.val(new.read(Sbcs::SBAUTOINCREMENT)));
        stored.modify(Sbcs::SBACCESS.val(new.read(Sbcs::SBACCESS)));
        self.sbcs = stored;
    }

    fn system_bus_access(&mut self, write: bool) {
        // Errors are sticky; no new accesses until cleared.
        if self.sberror != 0 {
            return;
        }
        let size = match self.sbcs.read(Sbcs::SBACCESS) {
            0 => RvSize::Byte,
            1 => RvSize::HalfWord,
            2 => RvSize::Word,
            _ => {
                self.sberror = 4;
                return;
            }
        };
        let Some(sysbus) = self.sysbus.as_mut() else {
            self.sberror = 7;
            return;
        };
        let result = if write {
            sysbus.write(size, self.sbaddress, self.sbdata).err()
        } else {
            match sysbus.read(size, self.sbaddress) {
                Ok(value) => {
                    self.sbdata = value;
                    None
                }
                Err(e) => Some(e),
            }
        };
        if result.is_some() {
            self.sberror = 2;
            return;
        }
        if self.sbcs.is_set(Sbcs::SBAUTOINCREMENT) {
            self.sbaddress = self.sbaddress.wrapping_add(usize::from(size) as u32);
        }
    }
}

impl DebugDevice for Dm {
    fn base_addr(&self) -> u32 {
        self.base_addr
    }

    fn num_regs(&self) -> u32 {
        DM_NUM_REGS
    }

    fn read_rq(&mut self, addr: u32) {
        self.read_result = self.reg_read(addr);
    }

    fn write_rq(&mut self, addr: u32, value: u32) {
        self.reg_write(addr, value);
    }

    fn read_value(&mut self) -> u32 {
        self.read_result
    }

    fn set_next_dm(&mut self, addr: u32) {
        self.next_dm = addr;
    }
}

/// Debug-memory view of the module; harts fetch the park loop and the
/// synthesised programs through this, and the acknowledgement slots double
/// as MMIO doorbells.
impl Bus for Dm {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        if size != RvSize::Word || addr as usize + 4 > DEBUG_MEM_SIZE {
            return Err(BusError::LoadAccessFault);
        }
        Ok(self.mem_read_u32(addr))
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word || addr as usize + 4 > DEBUG_MEM_SIZE {
            return Err(BusError::StoreAccessFault);
        }
        match addr {
            DEBUG_HALTED => self.ack_halted(val),
            DEBUG_GOING => self.ack_going(),
            DEBUG_RESUMING => self.ack_resuming(val),
            DEBUG_EXCEPTION => self.ack_exception(),
            _ => self.mem_write_u32(addr, val),
        }
        Ok(())
    }
}
