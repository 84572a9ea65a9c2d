/*++

Licensed under the Apache-2.0 license.

File Name:

    secded.rs

Abstract:

    File contains the 39/32 single-error-correcting double-error-detecting
    Hamming code used on scrambled ROM words.

--*/

// Odd-weight parity columns; parity bit i covers the data bits set in
// PARITY_MASKS[i]. Parity bit 1 (codeword bit 33) is stored inverted.
const PARITY_MASKS: [u32; 7] = [
    0x2606_bd25,
    0xdeba_8050,
    0x413d_89aa,
    0x3123_4ed1,
    0xc2c1_323b,
    0x2dcc_624c,
    0x9850_5586,
];

const PARITY_INVERT: u64 = 1 << 33;

/// Outcome of decoding a 39-bit codeword.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EccError {
    None = 0,
    Corrected = 1,
    Unrecoverable = 2,
    ParityCorrupted = 3,
}

impl EccError {
    /// True when the returned data is trustworthy.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EccError::Unrecoverable)
    }
}

fn parity(val: u32) -> u32 {
    val.count_ones() & 1
}

// Syndrome pattern produced by a single flip of data bit `bit`.
fn column(bit: u32) -> u32 {
    let mut col = 0u32;
    for (ix, mask) in PARITY_MASKS.iter().enumerate() {
        col |= ((mask >> bit) & 1) << ix;
    }
    col
}

/// Encode a 32-bit word into a 39-bit codeword.
pub fn secded_39_32_enc(data: u32) -> u64 {
    let mut codeword = u64::from(data);
    for (ix, mask) in PARITY_MASKS.iter().enumerate() {
        codeword |= u64::from(parity(data & mask)) << (32 + ix);
    }
    codeword ^ PARITY_INVERT
}

/// Decode a 39-bit codeword, correcting a single flipped bit if possible.
pub fn secded_39_32_dec(codeword: u64) -> (u32, EccError) {
    let codeword = (codeword ^ PARITY_INVERT) & ((1 << 39) - 1);
    let data = codeword as u32;
    let mut syndrome = 0u32;
    for (ix, mask) in PARITY_MASKS.iter().enumerate() {
        syndrome |= (parity(data & mask) ^ ((codeword >> (32 + ix)) as u32 & 1)) << ix;
    }
    if syndrome == 0 {
        return (data, EccError::None);
    }
    if syndrome.count_ones() & 1 == 0 {
        // Even-weight syndromes only arise from an even number of flips.
        return (data, EccError::Unrecoverable);
    }
    if syndrome.count_ones() == 1 {
        // A parity bit itself flipped; the data bits are intact.
        return (data, EccError::ParityCorrupted);
    }
    for bit in 0..32 {
        if column(bit) == syndrome {
            return (data ^ (1 << bit), EccError::Corrected);
        }
    }
    (data, EccError::Unrecoverable)
}
