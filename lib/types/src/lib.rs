/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the OpenTitan Emulator Types library.

--*/

mod signal;

pub use crate::signal::{ParseSignalError, Signal};

/// RISCV Data width
pub type RvData = u32;

/// RISCV Address width
pub type RvAddr = u32;

/// Width of a single bus transaction, in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RvSize {
    Byte = 1,
    HalfWord = 2,
    Word = 4,
}

impl From<RvSize> for usize {
    fn from(size: RvSize) -> usize {
        size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rv_size_width() {
        assert_eq!(usize::from(RvSize::Byte), 1);
        assert_eq!(usize::from(RvSize::HalfWord), 2);
        assert_eq!(usize::from(RvSize::Word), 4);
    }
}
