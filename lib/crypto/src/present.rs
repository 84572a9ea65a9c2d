/*++

Licensed under the Apache-2.0 license.

File Name:

    present.rs

Abstract:

    File contains the PRESENT block cipher with the 128-bit key schedule.

--*/

const SBOX4: [u8; 16] = [
    0xc, 0x5, 0x6, 0xb, 0x9, 0x0, 0xa, 0xd, 0x3, 0xe, 0xf, 0x8, 0x4, 0x7, 0x1, 0x2,
];

const SBOX4_INV: [u8; 16] = [
    0x5, 0xe, 0xf, 0x8, 0xc, 0x1, 0x2, 0xd, 0xb, 0x4, 0x6, 0x3, 0x0, 0x7, 0x9, 0xa,
];

const NUM_ROUNDS: usize = 31;

/// PRESENT with a 128-bit key, round keys precomputed at construction.
pub struct Present {
    round_keys: [u64; NUM_ROUNDS + 1],
}

impl Present {
    pub fn new(key: u128) -> Self {
        let mut round_keys = [0u64; NUM_ROUNDS + 1];
        let mut k = key;
        for (round, slot) in round_keys.iter_mut().enumerate() {
            *slot = (k >> 64) as u64;
            if round == NUM_ROUNDS {
                break;
            }
            // Rotate left by 61, S-box the two top nibbles, XOR the round
            // counter into bits 66..62.
            k = (k << 61) | (k >> 67);
            let hi = u128::from(SBOX4[((k >> 124) & 0xf) as usize]);
            let lo = u128::from(SBOX4[((k >> 120) & 0xf) as usize]);
            k = (k & !(0xffu128 << 120)) | (hi << 124) | (lo << 120);
            k ^= ((round as u128 + 1) & 0x1f) << 62;
        }
        Self { round_keys }
    }

    pub fn encrypt(&self, block: u64) -> u64 {
        let mut state = block;
        for round_key in &self.round_keys[..NUM_ROUNDS] {
            state ^= round_key;
            state = sbox_layer(state, &SBOX4);
            state = perm_layer(state);
        }
        state ^ self.round_keys[NUM_ROUNDS]
    }

    pub fn decrypt(&self, block: u64) -> u64 {
        let mut state = block ^ self.round_keys[NUM_ROUNDS];
        for round_key in self.round_keys[..NUM_ROUNDS].iter().rev() {
            state = perm_layer_inv(state);
            state = sbox_layer(state, &SBOX4_INV);
            state ^= round_key;
        }
        state
    }
}

fn sbox_layer(state: u64, sbox: &[u8; 16]) -> u64 {
    let mut out = 0u64;
    for ix in (0..64).step_by(4) {
        out |= u64::from(sbox[((state >> ix) & 0xf) as usize]) << ix;
    }
    out
}

// Bit i moves to position (16 * i) mod 63, bit 63 stays put.
fn perm_layer(state: u64) -> u64 {
    let mut out = state & (1 << 63);
    for bit in 0..63 {
        out |= ((state >> bit) & 1) << ((16 * bit) % 63);
    }
    out
}

fn perm_layer_inv(state: u64) -> u64 {
    let mut out = state & (1 << 63);
    for bit in 0..63 {
        out |= ((state >> ((16 * bit) % 63)) & 1) << bit;
    }
    out
}
