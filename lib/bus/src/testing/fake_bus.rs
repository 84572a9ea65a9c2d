/*++

Licensed under the Apache-2.0 license.

File Name:

    fake_bus.rs

Abstract:

    File contains code for a fake implementation of the Bus trait.

--*/
use ot_emu_types::{RvAddr, RvData, RvSize};

use crate::{testing::Log, Bus, BusError};
use std::fmt::Write;

/// A Bus that records every call in a [`Log`]. The result of read() and
/// write() can be overridden through the public fields.
///
/// # Example
///
/// ```
/// use ot_emu_bus::{Bus, testing::FakeBus};
/// use ot_emu_types::RvSize;
///
/// let mut fake_bus = FakeBus::new();
/// fake_bus.read_result = Ok(35);
/// assert_eq!(fake_bus.read(RvSize::HalfWord, 0xdeadcafe), Ok(35));
/// assert_eq!("read(RvSize::HalfWord, 0xdeadcafe)\n", fake_bus.log.take());
/// ```
pub struct FakeBus {
    pub log: Log,
    pub read_result: Result<RvData, BusError>,
    pub write_result: Result<(), BusError>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self {
            log: Log::new(),
            read_result: Ok(0),
            write_result: Ok(()),
        }
    }
}

impl Default for FakeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for FakeBus {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        writeln!(self.log.w(), "read(RvSize::{size:?}, {addr:#x})").unwrap();
        self.read_result
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        writeln!(self.log.w(), "write(RvSize::{size:?}, {addr:#x}, {val:#x})").unwrap();
        self.write_result
    }

    fn poll(&mut self) {
        writeln!(self.log.w(), "poll()").unwrap();
    }

    fn warm_reset(&mut self) {
        writeln!(self.log.w(), "warm_reset()").unwrap();
    }

    fn update_reset(&mut self) {
        writeln!(self.log.w(), "update_reset()").unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logs_calls() {
        let mut fake_bus = FakeBus::new();

        assert_eq!(fake_bus.read(RvSize::Word, 0x4000_0080), Ok(0));
        assert_eq!(fake_bus.write(RvSize::Byte, 0x4000_0084, 0x5a), Ok(()));
        fake_bus.warm_reset();
        assert_eq!(
            "read(RvSize::Word, 0x40000080)\n\
             write(RvSize::Byte, 0x40000084, 0x5a)\n\
             warm_reset()\n",
            fake_bus.log.take()
        );
    }

    #[test]
    fn test_overridden_results() {
        let mut fake_bus = FakeBus::new();
        fake_bus.read_result = Err(BusError::LoadAccessFault);
        fake_bus.write_result = Err(BusError::StoreAddrMisaligned);
        assert_eq!(
            fake_bus.read(RvSize::Byte, 0x20),
            Err(BusError::LoadAccessFault)
        );
        assert_eq!(
            fake_bus.write(RvSize::Word, 0x21, 0),
            Err(BusError::StoreAddrMisaligned)
        );
    }
}
