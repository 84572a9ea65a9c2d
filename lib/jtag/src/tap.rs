/*++

Licensed under the Apache-2.0 license.

File Name:

    tap.rs

Abstract:

    File contains the JTAG TAP controller state machine and its
    remote-bitbang front end.

--*/

use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};

/// Widest supported instruction register, in bits.
pub const MAX_IR_LENGTH: usize = 8;

/// The sixteen states of the JTAG TAP state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TapState {
    TestLogicReset,
    RunTestIdle,
    SelectDrScan,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIrScan,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    /// Next state for a TCK rising edge with the given TMS level.
    fn next(self, tms: bool) -> TapState {
        use TapState::*;
        match (self, tms) {
            (TestLogicReset, false) => RunTestIdle,
            (TestLogicReset, true) => TestLogicReset,
            (RunTestIdle, false) => RunTestIdle,
            (RunTestIdle, true) => SelectDrScan,
            (SelectDrScan, false) => CaptureDr,
            (SelectDrScan, true) => SelectIrScan,
            (CaptureDr, false) => ShiftDr,
            (CaptureDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (Exit1Dr, false) => PauseDr,
            (Exit1Dr, true) => UpdateDr,
            (PauseDr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (Exit2Dr, false) => ShiftDr,
            (Exit2Dr, true) => UpdateDr,
            (UpdateDr, false) => RunTestIdle,
            (UpdateDr, true) => SelectDrScan,
            (SelectIrScan, false) => CaptureIr,
            (SelectIrScan, true) => TestLogicReset,
            (CaptureIr, false) => ShiftIr,
            (CaptureIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (Exit1Ir, false) => PauseIr,
            (Exit1Ir, true) => UpdateIr,
            (PauseIr, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (Exit2Ir, false) => ShiftIr,
            (Exit2Ir, true) => UpdateIr,
            (UpdateIr, false) => RunTestIdle,
            (UpdateIr, true) => SelectDrScan,
        }
    }
}

/// A data register selected by an IR instruction code.
pub trait TapDataHandler {
    fn name(&self) -> &'static str;

    /// Width of the data register in bits (at most 64).
    fn len(&self) -> usize;

    /// Value loaded into the shift register on Capture-DR.
    fn capture(&mut self) -> u64;

    /// Shifted-in value committed on Update-DR.
    fn update(&mut self, value: u64);
}

/// Encode a 32-bit IDCODE from its fields. Bit 0 is always one.
pub fn idcode(version: u32, part: u32, mfg_id: u32) -> u32 {
    (version << 28) | (part << 12) | (mfg_id << 1) | 1
}

struct BypassHandler;

impl TapDataHandler for BypassHandler {
    fn name(&self) -> &'static str {
        "BYPASS"
    }

    fn len(&self) -> usize {
        1
    }

    fn capture(&mut self) -> u64 {
        0
    }

    fn update(&mut self, _value: u64) {}
}

struct IdcodeHandler {
    idcode: u32,
}

impl TapDataHandler for IdcodeHandler {
    fn name(&self) -> &'static str {
        "IDCODE"
    }

    fn len(&self) -> usize {
        32
    }

    fn capture(&mut self) -> u64 {
        u64::from(self.idcode)
    }

    fn update(&mut self, _value: u64) {}
}

/// JTAG TAP controller with a remote-bitbang front end.
pub struct JtagTap {
    state: TapState,
    tck: bool,
    tms: bool,
    tdi: bool,
    tdo: bool,

    ir_length: usize,
    idcode_inst: u8,
    /// IR shift register
    ir: u64,
    /// Committed instruction, selects the active data register
    ir_hold: u8,

    /// DR shift register and its current width
    dr: u64,
    dr_len: usize,

    handlers: HashMap<u8, Box<dyn TapDataHandler>>,

    allow_quit: bool,
    quit_requested: bool,
    srst_requested: bool,
}

impl JtagTap {
    pub fn new(ir_length: usize, idcode_inst: u8, idcode: u32) -> Result<JtagTap> {
        if ir_length == 0 || ir_length > MAX_IR_LENGTH {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported IR length {ir_length}"),
            ));
        }
        if idcode & 1 == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("IDCODE {idcode:#010x} has bit 0 clear"),
            ));
        }
        if usize::from(idcode_inst) >= (1 << ir_length) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("IDCODE instruction {idcode_inst:#x} exceeds the IR length"),
            ));
        }
        let mut tap = JtagTap {
            state: TapState::TestLogicReset,
            tck: false,
            tms: false,
            tdi: false,
            tdo: false,
            ir_length,
            idcode_inst,
            ir: 0,
            ir_hold: idcode_inst,
            dr: 0,
            dr_len: 1,
            handlers: HashMap::new(),
            allow_quit: false,
            quit_requested: false,
            srst_requested: false,
        };
        let all_ones = ((1u32 << ir_length) - 1) as u8;
        tap.register(0, Box::new(BypassHandler));
        tap.register(all_ones, Box::new(BypassHandler));
        tap.register(idcode_inst, Box::new(IdcodeHandler { idcode }));
        Ok(tap)
    }

    /// Bind a data register to an IR instruction code. Re-registering an
    /// occupied code overrides the existing handler.
    pub fn register(&mut self, ir_code: u8, handler: Box<dyn TapDataHandler>) {
        if usize::from(ir_code) >= (1 << self.ir_length) {
            log::error!(
                "JTAG: cannot register {} at IR {ir_code:#x}: exceeds the IR length",
                handler.name()
            );
            return;
        }
        if let Some(existing) = self.handlers.get(&ir_code) {
            log::warn!(
                "JTAG: IR {ir_code:#x} rebound from {} to {}",
                existing.name(),
                handler.name()
            );
        }
        self.handlers.insert(ir_code, handler);
    }

    pub fn set_allow_quit(&mut self, allow: bool) {
        self.allow_quit = allow;
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    pub fn tdo(&self) -> bool {
        self.tdo
    }

    /// True once the debugger has requested a guest shutdown via `Q`.
    pub fn take_quit_request(&mut self) -> bool {
        std::mem::take(&mut self.quit_requested)
    }

    /// True once the debugger has pulsed SRST.
    pub fn take_srst_request(&mut self) -> bool {
        std::mem::take(&mut self.srst_requested)
    }

    /// Execute one remote-bitbang command character. Returns the byte to
    /// send back to the debugger, if any.
    pub fn execute(&mut self, cmd: u8) -> Option<u8> {
        match cmd {
            b'0'..=b'7' => {
                let bits = cmd - b'0';
                self.set_pins(bits & 4 != 0, bits & 2 != 0, bits & 1 != 0);
                None
            }
            b'r' => None,
            b's' => {
                self.srst_requested = true;
                None
            }
            b't' => {
                self.reset();
                None
            }
            b'u' => {
                self.srst_requested = true;
                self.reset();
                None
            }
            b'R' => Some(if self.tdo { b'1' } else { b'0' }),
            b'B' | b'b' => None,
            b'Q' => {
                if self.allow_quit {
                    self.quit_requested = true;
                } else {
                    log::warn!("JTAG: ignoring quit request from debugger");
                }
                None
            }
            _ => {
                log::warn!("JTAG: unknown bitbang command {:?}", char::from(cmd));
                None
            }
        }
    }

    /// Drive the TCK/TMS/TDI pins to new levels.
    pub fn set_pins(&mut self, tck: bool, tms: bool, tdi: bool) {
        if tck && !self.tck {
            self.rising_edge(tms, tdi);
        } else if !tck && self.tck {
            self.falling_edge();
        }
        self.tck = tck;
        self.tms = tms;
        self.tdi = tdi;
    }

    /// Shift (in the two shift states), then transition on TMS.
    fn rising_edge(&mut self, tms: bool, tdi: bool) {
        match self.state {
            TapState::ShiftIr => {
                self.ir = (self.ir >> 1) | (u64::from(tdi) << (self.ir_length - 1));
            }
            TapState::ShiftDr => {
                self.dr = (self.dr >> 1) | (u64::from(tdi) << (self.dr_len - 1));
            }
            _ => (),
        }
        self.state = self.state.next(tms);
    }

    /// Perform the action of the state entered on the last rising edge.
    fn falling_edge(&mut self) {
        match self.state {
            TapState::TestLogicReset => self.reset(),
            TapState::CaptureDr => self.capture_dr(),
            TapState::UpdateDr => self.update_dr(),
            TapState::CaptureIr => self.ir = u64::from(self.idcode_inst),
            TapState::UpdateIr => {
                self.ir_hold = (self.ir & ((1 << self.ir_length) - 1)) as u8;
            }
            TapState::ShiftDr => self.tdo = self.dr & 1 != 0,
            TapState::ShiftIr => self.tdo = self.ir & 1 != 0,
            _ => (),
        }
    }

    fn reset(&mut self) {
        self.state = TapState::TestLogicReset;
        self.ir = 0;
        self.ir_hold = self.idcode_inst;
        self.dr = 0;
        self.dr_len = 1;
    }

    fn capture_dr(&mut self) {
        match self.handlers.get_mut(&self.ir_hold) {
            Some(handler) => {
                self.dr = handler.capture();
                self.dr_len = handler.len();
            }
            None => {
                log::warn!(
                    "JTAG: capture for unknown IR {:#x}; selecting BYPASS",
                    self.ir_hold
                );
                self.dr = 0;
                self.dr_len = 1;
            }
        }
    }

    fn update_dr(&mut self) {
        let value = self.dr;
        if let Some(handler) = self.handlers.get_mut(&self.ir_hold) {
            handler.update(value);
        }
    }
}
