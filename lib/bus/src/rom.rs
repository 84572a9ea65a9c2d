/*++

Licensed under the Apache-2.0 license.

File Name:

    rom.rs

Abstract:

    File contains implementation of ROM

--*/

use crate::mem::Mem;
use crate::{Bus, BusError};
use ot_emu_types::{RvAddr, RvData, RvSize};

/// Read Only Memory Device
pub struct Rom {
    data: Mem,
}

impl Rom {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mem::new(data),
        }
    }

    pub fn mmap_size(&self) -> RvAddr {
        self.data.len() as RvAddr
    }

    pub fn data(&self) -> &[u8] {
        self.data.data()
    }
}

impl Bus for Rom {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        Ok(self.data.read(size, addr)?)
    }

    /// Writes are always rejected
    fn write(&mut self, _size: RvSize, _addr: RvAddr, _val: RvData) -> Result<(), BusError> {
        Err(BusError::StoreAccessFault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read() {
        let mut rom = Rom::new(vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(rom.mmap_size(), 4);
        assert_eq!(rom.read(RvSize::Word, 0), Ok(0x1234_5678));
        assert_eq!(rom.read(RvSize::Byte, 3), Ok(0x12));
        assert_eq!(rom.read(RvSize::Byte, 4), Err(BusError::LoadAccessFault));
    }

    #[test]
    fn test_write_rejected() {
        let mut rom = Rom::new(vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            rom.write(RvSize::Byte, 0, 0),
            Err(BusError::StoreAccessFault)
        );
        assert_eq!(rom.read(RvSize::Byte, 0), Ok(0x78));
    }
}
