/*++

Licensed under the Apache-2.0 license.

File Name:

    subst_perm.rs

Abstract:

    File contains the lightweight substitution-permutation network used for
    ROM address and data scrambling.

--*/

use crate::prince::{SBOX4, SBOX4_INV};

fn mask(width: usize) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

// Nibble S-box over the low `width` bits; leftover bits above the last full
// nibble pass through unchanged.
fn sbox_layer(value: u64, width: usize, sbox: &[u8; 16]) -> u64 {
    let full = width - width % 4;
    let mut out = value & (mask(width) & !mask(full));
    for ix in (0..full).step_by(4) {
        out |= u64::from(sbox[((value >> ix) & 0xf) as usize]) << ix;
    }
    out
}

// Bit-reverse within `width`.
fn flip(value: u64, width: usize) -> u64 {
    let mut out = 0u64;
    for bit in 0..width {
        out |= ((value >> bit) & 1) << (width - 1 - bit);
    }
    out
}

// Butterfly shuffle: even bits to the low half, odd bits to the high half.
fn butterfly(value: u64, width: usize) -> u64 {
    let half = width / 2;
    let mut out = value & (mask(width) & !mask(2 * half));
    for ix in 0..half {
        out |= ((value >> (2 * ix)) & 1) << ix;
        out |= ((value >> (2 * ix + 1)) & 1) << (half + ix);
    }
    out
}

fn butterfly_inv(value: u64, width: usize) -> u64 {
    let half = width / 2;
    let mut out = value & (mask(width) & !mask(2 * half));
    for ix in 0..half {
        out |= ((value >> ix) & 1) << (2 * ix);
        out |= ((value >> (half + ix)) & 1) << (2 * ix + 1);
    }
    out
}

/// Scramble the low `width` bits of `value` with `rounds` rounds of
/// {xor key, S-box, flip, butterfly} and a final key xor.
pub fn subst_perm_enc(value: u64, key: u64, width: usize, rounds: usize) -> u64 {
    debug_assert!(width <= 64);
    let m = mask(width);
    let mut state = value & m;
    for _ in 0..rounds {
        state = (state ^ key) & m;
        state = sbox_layer(state, width, &SBOX4);
        state = flip(state, width);
        state = butterfly(state, width);
    }
    (state ^ key) & m
}

/// Inverse of [`subst_perm_enc`].
pub fn subst_perm_dec(value: u64, key: u64, width: usize, rounds: usize) -> u64 {
    debug_assert!(width <= 64);
    let m = mask(width);
    let mut state = (value ^ key) & m;
    for _ in 0..rounds {
        state = butterfly_inv(state, width);
        state = flip(state, width);
        state = sbox_layer(state, width, &SBOX4_INV);
        state = (state ^ key) & m;
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flip() {
        assert_eq!(flip(0b0001, 4), 0b1000);
        assert_eq!(flip(0b00101, 5), 0b10100);
        assert_eq!(flip(flip(0x1234_5678, 32), 32), 0x1234_5678);
    }

    #[test]
    fn test_butterfly_inverse_pair() {
        for width in [8usize, 12, 32, 39, 64] {
            for value in [0u64, 1, 0x5555_5555_5555_5555 & mask(width), mask(width)] {
                assert_eq!(butterfly_inv(butterfly(value, width), width), value);
            }
        }
    }

    #[test]
    fn test_round_trip_addr_width() {
        // Address scrambling operates on narrow, non-nibble-aligned widths.
        for width in [9usize, 10, 13] {
            for addr in 0..(1u64 << width) {
                let phys = subst_perm_enc(addr, 0x1a5, width, 2);
                assert_eq!(subst_perm_dec(phys, 0x1a5, width, 2), addr);
            }
        }
    }

    #[test]
    fn test_round_trip_39_bits() {
        for value in [0u64, 1, 0x55_5555_5555, mask(39), 0x12_3456_789a] {
            let enc = subst_perm_enc(value, 0, 39, 2);
            assert_eq!(subst_perm_dec(enc, 0, 39, 2), value);
        }
    }

    #[test]
    fn test_enc_is_a_permutation() {
        let width = 8;
        let mut seen = [false; 256];
        for value in 0..256u64 {
            let enc = subst_perm_enc(value, 0x3c, width, 2) as usize;
            assert!(!seen[enc]);
            seen[enc] = true;
        }
    }
}
