/*++

Licensed under the Apache-2.0 license.

File Name:

    dtm.rs

Abstract:

    File contains the Debug Transport Module, bridging the JTAG TAP to one
    or more Debug Modules over the DMI protocol.

--*/

use std::cell::RefCell;
use std::io::{Error, ErrorKind, Result};
use std::rc::Rc;

use crate::tap::{JtagTap, TapDataHandler};

/// IR instruction codes for the two DTM data registers.
pub const IR_DTMCS: u8 = 0x10;
pub const IR_DMI: u8 = 0x11;

/// DTMCS field layout (RISC-V debug v0.13.2).
mod dtmcs {
    pub const VERSION: u32 = 1;
    pub const ABITS_SHIFT: u32 = 4;
    pub const DMISTAT_SHIFT: u32 = 10;
    pub const IDLE_SHIFT: u32 = 12;
    pub const DMIRESET: u32 = 1 << 16;
    pub const DMIHARDRESET: u32 = 1 << 17;
}

/// DMI operation codes (shared by requests and the captured result field).
mod dmi_op {
    pub const NOP: u64 = 0;
    pub const READ: u64 = 1;
    pub const WRITE: u64 = 2;
    pub const FAILED: u32 = 2;
}

/// A device reachable over the DMI address space.
pub trait DebugDevice {
    /// First DMI address owned by the device.
    fn base_addr(&self) -> u32;

    /// Number of 32-bit registers owned by the device.
    fn num_regs(&self) -> u32;

    /// Start a read of the register at `addr` (relative to the base).
    fn read_rq(&mut self, addr: u32);

    /// Write the register at `addr` (relative to the base).
    fn write_rq(&mut self, addr: u32, value: u32);

    /// Collect the result of the last `read_rq`.
    fn read_value(&mut self) -> u32;

    /// Record the base address of the next device in the discovery chain.
    fn set_next_dm(&mut self, addr: u32);
}

/// Debug Transport Module state, shared by the DTMCS and DMI TAP handlers.
pub struct Dtm {
    abits: u32,
    dmistat: u32,
    addr: u32,
    data: u32,
    pending_read: bool,
    /// Registered devices, ascending by base address
    dms: Vec<Rc<RefCell<dyn DebugDevice>>>,
    /// Index of the most recently addressed device
    last_ix: usize,
}

impl Dtm {
    pub fn new(abits: u32) -> Result<Rc<RefCell<Dtm>>> {
        if !(1..=30).contains(&abits) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("unsupported DMI address width {abits}"),
            ));
        }
        Ok(Rc::new(RefCell::new(Dtm {
            abits,
            dmistat: 0,
            addr: 0,
            data: 0,
            pending_read: false,
            dms: Vec::new(),
            last_ix: 0,
        })))
    }

    /// Register the DTMCS and DMI data registers on a TAP.
    pub fn register_handlers(dtm: &Rc<RefCell<Dtm>>, tap: &mut JtagTap) {
        tap.register(IR_DTMCS, Box::new(DtmcsHandler { dtm: dtm.clone() }));
        tap.register(IR_DMI, Box::new(DmiHandler { dtm: dtm.clone() }));
    }

    /// Add a device to the DMI address space. Exact duplicates are
    /// accepted; overlapping ranges are refused.
    pub fn register_dm(&mut self, dm: Rc<RefCell<dyn DebugDevice>>) -> Result<()> {
        let (base, num_regs) = {
            let dm = dm.borrow();
            (dm.base_addr(), dm.num_regs())
        };
        for existing in &self.dms {
            if Rc::ptr_eq(existing, &dm) {
                return Ok(());
            }
            let existing = existing.borrow();
            let (other_base, other_regs) = (existing.base_addr(), existing.num_regs());
            if base < other_base + other_regs && other_base < base + num_regs {
                return Err(Error::new(
                    ErrorKind::AddrInUse,
                    format!("debug module at {base:#x} overlaps one at {other_base:#x}"),
                ));
            }
        }
        let ix = self
            .dms
            .partition_point(|existing| existing.borrow().base_addr() < base);
        self.dms.insert(ix, dm);
        self.rechain();
        Ok(())
    }

    /// Refresh each device's `nextdm` pointer after an insertion.
    fn rechain(&mut self) {
        for ix in 0..self.dms.len() {
            let next = if ix + 1 < self.dms.len() {
                self.dms[ix + 1].borrow().base_addr()
            } else {
                0
            };
            self.dms[ix].borrow_mut().set_next_dm(next);
        }
    }

    fn find_dm(&mut self, addr: u32) -> Option<Rc<RefCell<dyn DebugDevice>>> {
        let contains = |dm: &Rc<RefCell<dyn DebugDevice>>| {
            let dm = dm.borrow();
            addr >= dm.base_addr() && addr < dm.base_addr() + dm.num_regs()
        };
        if let Some(dm) = self.dms.get(self.last_ix) {
            if contains(dm) {
                return Some(dm.clone());
            }
        }
        let ix = self.dms.iter().position(contains)?;
        self.last_ix = ix;
        Some(self.dms[ix].clone())
    }

    fn capture_dtmcs(&self) -> u64 {
        u64::from(
            dtmcs::VERSION
                | (self.abits << dtmcs::ABITS_SHIFT)
                | (self.dmistat << dtmcs::DMISTAT_SHIFT)
                | (1 << dtmcs::IDLE_SHIFT),
        )
    }

    fn update_dtmcs(&mut self, value: u64) {
        let value = value as u32;
        if value & dtmcs::DMIRESET != 0 {
            self.dmistat = 0;
        }
        if value & dtmcs::DMIHARDRESET != 0 {
            log::warn!("DTM: dmihardreset is not implemented");
        }
    }

    fn capture_dmi(&mut self) -> u64 {
        if self.pending_read && self.dmistat == 0 {
            self.pending_read = false;
            if let Some(dm) = self.find_dm(self.addr) {
                self.data = dm.borrow_mut().read_value();
            }
        }
        (u64::from(self.addr) << 34) | (u64::from(self.data) << 2) | u64::from(self.dmistat & 3)
    }

    fn update_dmi(&mut self, value: u64) {
        let op = value & 3;
        let data = (value >> 2) as u32;
        let addr = ((value >> 34) & ((1 << self.abits) - 1)) as u32;
        if op == dmi_op::NOP {
            return;
        }
        // A sticky error suppresses further operations until dmireset.
        if self.dmistat != 0 {
            return;
        }
        self.addr = addr;
        self.data = data;
        let Some(dm) = self.find_dm(addr) else {
            log::warn!("DTM: no debug module claims DMI address {addr:#x}");
            self.dmistat = dmi_op::FAILED;
            return;
        };
        let base = dm.borrow().base_addr();
        match op {
            dmi_op::READ => {
                dm.borrow_mut().read_rq(addr - base);
                self.pending_read = true;
            }
            dmi_op::WRITE => dm.borrow_mut().write_rq(addr - base, data),
            _ => {
                log::warn!("DTM: reserved DMI operation {op}");
                self.dmistat = dmi_op::FAILED;
            }
        }
    }
}

struct DtmcsHandler {
    dtm: Rc<RefCell<Dtm>>,
}

impl TapDataHandler for DtmcsHandler {
    fn name(&self) -> &'static str {
        "DTMCS"
    }

    fn len(&self) -> usize {
        32
    }

    fn capture(&mut self) -> u64 {
        self.dtm.borrow().capture_dtmcs()
    }

    fn update(&mut self, value: u64) {
        self.dtm.borrow_mut().update_dtmcs(value);
    }
}

struct DmiHandler {
    dtm: Rc<RefCell<Dtm>>,
}

impl TapDataHandler for DmiHandler {
    fn name(&self) -> &'static str {
        "DMI"
    }

    fn len(&self) -> usize {
        self.dtm.borrow().abits as usize + 34
    }

    fn capture(&mut self) -> u64 {
        self.dtm.borrow_mut().capture_dmi()
    }

    fn update(&mut self, value: u64) {
        self.dtm.borrow_mut().update_dmi(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDm {
        base: u32,
        regs: Vec<u32>,
        next_dm: u32,
        read_addr: Option<u32>,
    }

    impl FakeDm {
        fn new(base: u32, num_regs: usize) -> Rc<RefCell<FakeDm>> {
            Rc::new(RefCell::new(FakeDm {
                base,
                regs: vec![0; num_regs],
                next_dm: 0,
                read_addr: None,
            }))
        }
    }

    impl DebugDevice for FakeDm {
        fn base_addr(&self) -> u32 {
            self.base
        }
        fn num_regs(&self) -> u32 {
            self.regs.len() as u32
        }
        fn read_rq(&mut self, addr: u32) {
            self.read_addr = Some(addr);
        }
        fn write_rq(&mut self, addr: u32, value: u32) {
            self.regs[addr as usize] = value;
        }
        fn read_value(&mut self) -> u32 {
            let addr = self.read_addr.take().unwrap();
            self.regs[addr as usize]
        }
        fn set_next_dm(&mut self, addr: u32) {
            self.next_dm = addr;
        }
    }

    fn dmi_write(addr: u32, data: u32) -> u64 {
        (u64::from(addr) << 34) | (u64::from(data) << 2) | dmi_op::WRITE
    }

    fn dmi_read(addr: u32) -> u64 {
        (u64::from(addr) << 34) | dmi_op::READ
    }

    #[test]
    fn test_dmi_read_write() {
        let dtm = Dtm::new(7).unwrap();
        let dm = FakeDm::new(0x10, 0x20);
        dtm.borrow_mut().register_dm(dm.clone()).unwrap();

        let mut dtm = dtm.borrow_mut();
        dtm.update_dmi(dmi_write(0x14, 0xdead_beef));
        assert_eq!(dm.borrow().regs[4], 0xdead_beef);

        dtm.update_dmi(dmi_read(0x14));
        let captured = dtm.capture_dmi();
        assert_eq!(captured & 3, 0);
        assert_eq!((captured >> 2) as u32, 0xdead_beef);
        assert_eq!((captured >> 34) as u32, 0x14);
    }

    #[test]
    fn test_unclaimed_address_is_sticky() {
        let dtm = Dtm::new(7).unwrap();
        let dm = FakeDm::new(0x10, 0x20);
        dtm.borrow_mut().register_dm(dm.clone()).unwrap();

        let mut dtm = dtm.borrow_mut();
        dtm.update_dmi(dmi_read(0x40));
        assert_eq!(dtm.capture_dmi() & 3, u64::from(dmi_op::FAILED));

        // Further operations are suppressed until dmireset.
        dtm.update_dmi(dmi_write(0x14, 0x1234));
        assert_eq!(dm.borrow().regs[4], 0);
        assert_eq!(dtm.capture_dmi() & 3, u64::from(dmi_op::FAILED));

        dtm.update_dtmcs(u64::from(dtmcs::DMIRESET));
        dtm.update_dmi(dmi_write(0x14, 0x1234));
        assert_eq!(dm.borrow().regs[4], 0x1234);
    }

    #[test]
    fn test_dtmcs_fields() {
        let dtm = Dtm::new(7).unwrap();
        let value = dtm.borrow().capture_dtmcs() as u32;
        assert_eq!(value & 0xf, 1);
        assert_eq!((value >> 4) & 0x3f, 7);
        assert_eq!((value >> 10) & 3, 0);
    }

    #[test]
    fn test_register_dm_overlap() {
        let dtm = Dtm::new(7).unwrap();
        let mut dtm = dtm.borrow_mut();
        let dm = FakeDm::new(0x10, 0x20);
        dtm.register_dm(dm.clone()).unwrap();
        // Same handle twice is fine.
        dtm.register_dm(dm).unwrap();
        assert!(dtm.register_dm(FakeDm::new(0x2f, 4)).is_err());
        dtm.register_dm(FakeDm::new(0x30, 4)).unwrap();
    }

    #[test]
    fn test_next_dm_chain() {
        let dtm = Dtm::new(10).unwrap();
        let mut dtm = dtm.borrow_mut();
        let second = FakeDm::new(0x100, 0x40);
        let first = FakeDm::new(0x0, 0x40);
        dtm.register_dm(second.clone()).unwrap();
        dtm.register_dm(first.clone()).unwrap();
        assert_eq!(first.borrow().next_dm, 0x100);
        assert_eq!(second.borrow().next_dm, 0);
    }

    #[test]
    fn test_abits_validation() {
        assert!(Dtm::new(0).is_err());
        assert!(Dtm::new(31).is_err());
        assert!(Dtm::new(30).is_ok());
    }
}
