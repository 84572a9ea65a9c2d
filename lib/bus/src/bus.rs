/*++

Licensed under the Apache-2.0 license.

File Name:

    bus.rs

Abstract:

    File contains definition of the Bus trait.

--*/

use ot_emu_types::{RvAddr, RvData, RvSize};

/// Fault raised by a device when it cannot complete a bus access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BusError {
    /// Instruction access exception
    InstrAccessFault,

    /// Load address misaligned exception
    LoadAddrMisaligned,

    /// Load access fault exception
    LoadAccessFault,

    /// Store address misaligned exception
    StoreAddrMisaligned,

    /// Store access fault exception
    StoreAccessFault,
}

/// A memory-mapped device (or a tree of devices). Addresses are relative
/// to the device's base; a parent bus strips its own offset before
/// delegating.
pub trait Bus {
    /// Read `size` bytes from `addr`.
    ///
    /// # Error
    ///
    /// * `BusError::LoadAccessFault` or `BusError::LoadAddrMisaligned`
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError>;

    /// Write the low `size` bytes of `val` to `addr`.
    ///
    /// # Error
    ///
    /// * `BusError::StoreAccessFault` or `BusError::StoreAddrMisaligned`
    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError>;

    /// Gives the device a chance to act on elapsed time. Called by the
    /// owner of the bus whenever the clock fires a scheduled poll.
    fn poll(&mut self) {}

    /// Reset everything except sticky/persistent state.
    fn warm_reset(&mut self) {}

    /// Reset in preparation for a firmware update.
    fn update_reset(&mut self) {}
}

impl<T: Bus + ?Sized> Bus for Box<T> {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        T::read(self, size, addr)
    }

    fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), BusError> {
        T::write(self, size, addr, val)
    }

    fn poll(&mut self) {
        T::poll(self)
    }

    fn warm_reset(&mut self) {
        T::warm_reset(self)
    }

    fn update_reset(&mut self) {
        T::update_reset(self)
    }
}
