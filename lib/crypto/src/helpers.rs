// Licensed under the Apache-2.0 license

/// In-place byte swapping over word-oriented buffers.
pub trait EndianessTransform {
    fn change_endianess(&mut self);
    fn to_big_endian(&mut self);
    fn to_little_endian(&mut self);
}

impl EndianessTransform for [u8] {
    fn change_endianess(&mut self) {
        for word in self.chunks_exact_mut(4) {
            word.reverse();
        }
    }

    fn to_big_endian(&mut self) {
        self.change_endianess();
    }

    fn to_little_endian(&mut self) {
        self.change_endianess();
    }
}

impl EndianessTransform for [u32] {
    fn change_endianess(&mut self) {
        for word in self.iter_mut() {
            *word = word.swap_bytes();
        }
    }

    fn to_big_endian(&mut self) {
        self.change_endianess();
    }

    fn to_little_endian(&mut self) {
        self.change_endianess();
    }
}

impl EndianessTransform for [u64] {
    // Swaps bytes within each 32-bit half, preserving half order.
    fn change_endianess(&mut self) {
        for word in self.iter_mut() {
            let hi = ((*word >> 32) as u32).swap_bytes();
            let lo = (*word as u32).swap_bytes();
            *word = (u64::from(hi) << 32) | u64::from(lo);
        }
    }

    fn to_big_endian(&mut self) {
        self.change_endianess();
    }

    fn to_little_endian(&mut self) {
        self.change_endianess();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_slice() {
        let mut buf = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        buf.change_endianess();
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01, 0x08, 0x07, 0x06, 0x05]);
    }

    #[test]
    fn test_u32_slice() {
        let mut buf = [0x0102_0304u32, 0xaabb_ccdd];
        buf.change_endianess();
        assert_eq!(buf, [0x0403_0201, 0xddcc_bbaa]);
    }

    #[test]
    fn test_u64_slice() {
        let mut buf = [0x0102_0304_0506_0708u64];
        buf.change_endianess();
        assert_eq!(buf, [0x0403_0201_0807_0605]);
    }
}
