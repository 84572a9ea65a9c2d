/*++

Licensed under the Apache-2.0 license.

File Name:

    prince.rs

Abstract:

    File contains the PRINCE block cipher used for ROM scrambling keystreams.

--*/

/// PRINCE 4-bit S-box.
pub(crate) const SBOX4: [u8; 16] = [
    0xb, 0xf, 0x3, 0x2, 0xa, 0xc, 0x9, 0x1, 0x6, 0x7, 0x8, 0x0, 0xe, 0x5, 0xd, 0x4,
];

/// Inverse of [`SBOX4`].
pub(crate) const SBOX4_INV: [u8; 16] = [
    0xb, 0x7, 0x3, 0x2, 0xf, 0xd, 0x8, 0x9, 0xa, 0x6, 0x4, 0x0, 0x5, 0xe, 0xc, 0x1,
];

// Nibble destinations for the shift-rows step over a 64-bit state.
const SHIFT_ROWS64: [u8; 16] = [
    0x0, 0x5, 0xa, 0xf, 0x4, 0x9, 0xe, 0x3, 0x8, 0xd, 0x2, 0x7, 0xc, 0x1, 0x6, 0xb,
];
const SHIFT_ROWS64_INV: [u8; 16] = [
    0x0, 0xd, 0xa, 0x7, 0x4, 0x1, 0xe, 0xb, 0x8, 0x5, 0x2, 0xf, 0xc, 0x9, 0x6, 0x3,
];

const ROUND_CONSTS: [u64; 12] = [
    0x0000_0000_0000_0000,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
    0x4528_21e6_38d0_1377,
    0xbe54_66cf_34e9_0c6c,
    0x7ef8_4f78_fd95_5cb1,
    0x8584_0851_f1ac_43aa,
    0xc882_d32f_2532_3c54,
    0x64a5_1195_e0e3_610d,
    0xd3b5_a399_ca0c_2399,
    0xc0ac_29b7_c97c_50dd,
];

// 16-bit masks selecting the bits that XOR-fold into each output nibble of
// the mult-prime mixing step.
const MULT_PRIME_CONSTS: [u16; 4] = [0x7bde, 0xbde7, 0xde7b, 0xe7bd];

fn sbox_layer(data: u64, sbox: &[u8; 16]) -> u64 {
    let mut out = 0u64;
    for ix in (0..64).step_by(4) {
        out |= u64::from(sbox[((data >> ix) & 0xf) as usize]) << ix;
    }
    out
}

fn shift_rows(data: u64, inverse: bool) -> u64 {
    let table = if inverse {
        &SHIFT_ROWS64_INV
    } else {
        &SHIFT_ROWS64
    };
    let mut out = 0u64;
    for (ix, &dest) in table.iter().enumerate() {
        out |= ((data >> (4 * ix)) & 0xf) << (4 * dest);
    }
    out
}

// M' of PRINCE: four 16-bit lanes, each output nibble an XOR-reduction over a
// masked half-word. Lanes 0 and 3 use M-hat-0, lanes 1 and 2 use M-hat-1.
// Involutory, so it serves both directions.
fn mult_prime(data: u64) -> u64 {
    let mut out = 0u64;
    for blk in 0..4 {
        let hw = (data >> (16 * blk)) as u16;
        let base = usize::from(blk == 1 || blk == 2);
        let mut lane = 0u16;
        for nib in 0..4 {
            let masked = hw & MULT_PRIME_CONSTS[(4 - (nib + base)) % 4];
            let folded = (masked ^ (masked >> 4) ^ (masked >> 8) ^ (masked >> 12)) & 0xf;
            lane |= folded << (4 * nib);
        }
        out |= u64::from(lane) << (16 * blk);
    }
    out
}

/// Run PRINCE over a 64-bit block with `half_rounds` rounds on each side of
/// the middle layer (`half_rounds == 5` is the full cipher). The 128-bit key
/// is split into `k_hi` (k0, whitening) and `k_lo` (k1).
pub fn prince_run(data: u64, k_hi: u64, k_lo: u64, half_rounds: usize) -> u64 {
    debug_assert!((1..=5).contains(&half_rounds));
    let k0_prime = (((k_hi & 1) << 63) | (k_hi >> 1)) ^ (k_hi >> 63);

    let mut state = data ^ k_hi ^ k_lo ^ ROUND_CONSTS[0];

    for ix in 1..=half_rounds {
        state = sbox_layer(state, &SBOX4);
        state = mult_prime(state);
        state = shift_rows(state, false);
        state ^= ROUND_CONSTS[ix];
        state ^= if ix & 1 != 0 { k_lo } else { k_hi };
    }

    state = sbox_layer(state, &SBOX4);
    state = mult_prime(state);
    state = sbox_layer(state, &SBOX4_INV);

    for ix in (11 - half_rounds)..=10 {
        state ^= if ix & 1 != 0 { k_hi } else { k_lo };
        state ^= ROUND_CONSTS[ix];
        state = shift_rows(state, true);
        state = mult_prime(state);
        state = sbox_layer(state, &SBOX4_INV);
    }

    state ^ ROUND_CONSTS[11] ^ k_lo ^ k0_prime
}
