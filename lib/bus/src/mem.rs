/*++

Licensed under the Apache-2.0 license.

File Name:

    mem.rs

Abstract:

    File contains the backing store shared by the ROM and RAM devices.

--*/

use crate::BusError;
use ot_emu_types::{RvAddr, RvData, RvSize};

/// Memory Exception
#[derive(Debug, PartialEq, Eq)]
pub enum MemError {
    /// Read Access fault
    ReadAccessFault,

    /// Write access fault
    WriteAccessFault,
}

impl From<MemError> for BusError {
    fn from(exception: MemError) -> BusError {
        match exception {
            MemError::ReadAccessFault => BusError::LoadAccessFault,
            MemError::WriteAccessFault => BusError::StoreAccessFault,
        }
    }
}

/// Little-endian byte-addressable memory
pub struct Mem {
    data: Vec<u8>,
}

impl Mem {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Size of the memory in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Little-endian read of `size` bytes starting at `addr`. The access
    /// must lie entirely within the memory, but may be unaligned.
    #[inline]
    pub fn read(&self, size: RvSize, addr: RvAddr) -> Result<RvData, MemError> {
        let start = addr as usize;
        let bytes = self
            .data
            .get(start..start + usize::from(size))
            .ok_or(MemError::ReadAccessFault)?;
        let mut word = [0u8; 4];
        word[..bytes.len()].copy_from_slice(bytes);
        Ok(RvData::from_le_bytes(word))
    }

    /// Little-endian write of the low `size` bytes of `val` starting at
    /// `addr`. The access must lie entirely within the memory, but may
    /// be unaligned.
    #[inline]
    pub fn write(&mut self, size: RvSize, addr: RvAddr, val: RvData) -> Result<(), MemError> {
        let start = addr as usize;
        let width = usize::from(size);
        let bytes = self
            .data
            .get_mut(start..start + width)
            .ok_or(MemError::WriteAccessFault)?;
        bytes.copy_from_slice(&val.to_le_bytes()[..width]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let mem = Mem::new(Vec::new());
        assert!(mem.is_empty());
        assert_eq!(mem.len(), 0);
        assert_eq!(mem.read(RvSize::Byte, 0), Err(MemError::ReadAccessFault));
    }

    #[test]
    fn test_read_little_endian() {
        let mem = Mem::new(vec![0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mem.read(RvSize::Byte, 3), Ok(0x44));
        assert_eq!(mem.read(RvSize::HalfWord, 2), Ok(0x4433));
        assert_eq!(mem.read(RvSize::Word, 0), Ok(0x4433_2211));
        // Unaligned reads are allowed.
        assert_eq!(mem.read(RvSize::Word, 1), Ok(0x5544_3322));
    }

    #[test]
    fn test_read_past_end() {
        let mem = Mem::new(vec![0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mem.read(RvSize::Byte, 5), Err(MemError::ReadAccessFault));
        assert_eq!(mem.read(RvSize::Word, 2), Err(MemError::ReadAccessFault));
        assert_eq!(
            mem.read(RvSize::Word, u32::MAX),
            Err(MemError::ReadAccessFault)
        );
    }

    #[test]
    fn test_write_little_endian() {
        let mut mem = Mem::new(vec![0; 5]);
        assert_eq!(mem.write(RvSize::Word, 0, 0x8765_4321), Ok(()));
        assert_eq!(mem.data(), &[0x21, 0x43, 0x65, 0x87, 0]);
        assert_eq!(mem.write(RvSize::HalfWord, 3, 0xaabb), Ok(()));
        assert_eq!(mem.data(), &[0x21, 0x43, 0x65, 0xbb, 0xaa]);
        assert_eq!(
            mem.write(RvSize::Word, 2, 0),
            Err(MemError::WriteAccessFault)
        );
        assert_eq!(
            mem.write(RvSize::Byte, 5, 0),
            Err(MemError::WriteAccessFault)
        );
    }

}
