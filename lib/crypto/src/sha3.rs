/*++

Licensed under the Apache-2.0 license.

File Name:

    sha3.rs

Abstract:

    File contains the SHA-3 sponge engine backing the KMAC peripheral,
    covering the SHA3, SHAKE, cSHAKE and KMAC operating modes.

--*/

use sha3::{
    digest::{ExtendableOutput, FixedOutput, Update, XofReader},
    CShake128, CShake128Core, CShake128Reader, CShake256, CShake256Core, CShake256Reader,
    Sha3_224, Sha3_256, Sha3_384, Sha3_512, Shake128, Shake128Reader, Shake256, Shake256Reader,
};

/// Size of the Keccak sponge state in bytes.
pub const KECCAK_STATE_SIZE: usize = 200;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sha3Mode {
    Sha3,
    Shake,
    CShake,
    Kmac,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sha3Strength {
    L128,
    L224,
    L256,
    L384,
    L512,
}

impl Sha3Strength {
    /// Sponge rate in bytes for the XOF modes.
    fn rate(&self) -> usize {
        match self {
            Sha3Strength::L128 => 168,
            _ => 136,
        }
    }
}

enum Hasher {
    Sha3_224(Sha3_224),
    Sha3_256(Sha3_256),
    Sha3_384(Sha3_384),
    Sha3_512(Sha3_512),
    Shake128(Shake128),
    Shake256(Shake256),
    CShake128(CShake128),
    CShake256(CShake256),
}

enum Reader {
    Shake128(Shake128Reader),
    Shake256(Shake256Reader),
    CShake128(CShake128Reader),
    CShake256(CShake256Reader),
}

/// SHA-3 engine with a readable 200-byte output state.
pub struct Sha3 {
    hasher: Option<Hasher>,

    /// Pending XOF output stream, present once an XOF mode is finalized.
    reader: Option<Reader>,

    /// True when the KMAC `right_encode(0)` suffix is still owed.
    kmac: bool,

    /// Output state, valid after `finalize()`.
    digest: [u8; KECCAK_STATE_SIZE],
}

impl Default for Sha3 {
    fn default() -> Self {
        Self::new()
    }
}

impl Sha3 {
    pub fn new() -> Self {
        Self {
            hasher: None,
            reader: None,
            kmac: false,
            digest: [0u8; KECCAK_STATE_SIZE],
        }
    }

    /// Whether the mode/strength pair is one the hardware accepts.
    pub fn supports(mode: Sha3Mode, strength: Sha3Strength) -> bool {
        match mode {
            Sha3Mode::Sha3 => !matches!(strength, Sha3Strength::L128),
            _ => matches!(strength, Sha3Strength::L128 | Sha3Strength::L256),
        }
    }

    /// Start a new hash operation. `func_name` and `customization` apply to
    /// the cSHAKE and KMAC modes; `key` is required for KMAC. Returns false
    /// and leaves the engine idle when the configuration is unsupported.
    pub fn init(
        &mut self,
        mode: Sha3Mode,
        strength: Sha3Strength,
        func_name: &[u8],
        customization: &[u8],
        key: Option<&[u8]>,
    ) -> bool {
        self.reset();
        if !Self::supports(mode, strength) {
            return false;
        }
        let hasher = match (mode, strength) {
            (Sha3Mode::Sha3, Sha3Strength::L224) => Hasher::Sha3_224(Sha3_224::default()),
            (Sha3Mode::Sha3, Sha3Strength::L256) => Hasher::Sha3_256(Sha3_256::default()),
            (Sha3Mode::Sha3, Sha3Strength::L384) => Hasher::Sha3_384(Sha3_384::default()),
            (Sha3Mode::Sha3, Sha3Strength::L512) => Hasher::Sha3_512(Sha3_512::default()),
            (Sha3Mode::Shake, Sha3Strength::L128) => Hasher::Shake128(Shake128::default()),
            (Sha3Mode::Shake, Sha3Strength::L256) => Hasher::Shake256(Shake256::default()),
            (Sha3Mode::CShake | Sha3Mode::Kmac, Sha3Strength::L128) => Hasher::CShake128(
                CShake128::from_core(CShake128Core::new_with_function_name(
                    func_name,
                    customization,
                )),
            ),
            (Sha3Mode::CShake | Sha3Mode::Kmac, Sha3Strength::L256) => Hasher::CShake256(
                CShake256::from_core(CShake256Core::new_with_function_name(
                    func_name,
                    customization,
                )),
            ),
            _ => return false,
        };
        self.hasher = Some(hasher);
        if mode == Sha3Mode::Kmac {
            let Some(key) = key else {
                self.hasher = None;
                return false;
            };
            self.kmac = true;
            let prefix = bytepad_key_prefix(key, strength.rate());
            self.update(&prefix);
        }
        true
    }

    /// Absorb message bytes. Returns false if no operation is in progress.
    pub fn update(&mut self, data: &[u8]) -> bool {
        let Some(hasher) = &mut self.hasher else {
            return false;
        };
        match hasher {
            Hasher::Sha3_224(h) => h.update(data),
            Hasher::Sha3_256(h) => h.update(data),
            Hasher::Sha3_384(h) => h.update(data),
            Hasher::Sha3_512(h) => h.update(data),
            Hasher::Shake128(h) => h.update(data),
            Hasher::Shake256(h) => h.update(data),
            Hasher::CShake128(h) => h.update(data),
            Hasher::CShake256(h) => h.update(data),
        }
        true
    }

    /// Pad and permute, filling the output state. For the fixed-length SHA3
    /// modes the digest occupies the leading bytes and the rest reads zero.
    pub fn finalize(&mut self) -> bool {
        if self.kmac {
            self.kmac = false;
            let mut suffix = Vec::new();
            right_encode(&mut suffix, 0);
            self.update(&suffix);
        }
        let Some(hasher) = &self.hasher else {
            return false;
        };
        self.digest = [0u8; KECCAK_STATE_SIZE];
        match hasher {
            Hasher::Sha3_224(h) => {
                self.digest[..28].copy_from_slice(&h.clone().finalize_fixed());
            }
            Hasher::Sha3_256(h) => {
                self.digest[..32].copy_from_slice(&h.clone().finalize_fixed());
            }
            Hasher::Sha3_384(h) => {
                self.digest[..48].copy_from_slice(&h.clone().finalize_fixed());
            }
            Hasher::Sha3_512(h) => {
                self.digest[..64].copy_from_slice(&h.clone().finalize_fixed());
            }
            Hasher::Shake128(h) => {
                let mut reader = h.clone().finalize_xof();
                reader.read(&mut self.digest);
                self.reader = Some(Reader::Shake128(reader));
            }
            Hasher::Shake256(h) => {
                let mut reader = h.clone().finalize_xof();
                reader.read(&mut self.digest);
                self.reader = Some(Reader::Shake256(reader));
            }
            Hasher::CShake128(h) => {
                let mut reader = h.clone().finalize_xof();
                reader.read(&mut self.digest);
                self.reader = Some(Reader::CShake128(reader));
            }
            Hasher::CShake256(h) => {
                let mut reader = h.clone().finalize_xof();
                reader.read(&mut self.digest);
                self.reader = Some(Reader::CShake256(reader));
            }
        }
        true
    }

    /// Advance an XOF output stream by another state's worth of bytes.
    /// Returns false for the fixed-length modes or before `finalize()`.
    pub fn squeeze(&mut self) -> bool {
        let Some(reader) = &mut self.reader else {
            return false;
        };
        match reader {
            Reader::Shake128(r) => r.read(&mut self.digest),
            Reader::Shake256(r) => r.read(&mut self.digest),
            Reader::CShake128(r) => r.read(&mut self.digest),
            Reader::CShake256(r) => r.read(&mut self.digest),
        }
        true
    }

    pub fn digest(&self) -> &[u8; KECCAK_STATE_SIZE] {
        &self.digest
    }

    pub fn has_hasher(&self) -> bool {
        self.hasher.is_some()
    }

    /// Drop any operation in progress and zero the output state.
    pub fn reset(&mut self) {
        self.hasher = None;
        self.reader = None;
        self.kmac = false;
        self.digest = [0u8; KECCAK_STATE_SIZE];
    }
}

/// NIST SP 800-185 `left_encode`.
pub fn left_encode(out: &mut Vec<u8>, val: u64) {
    let bytes = val.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    out.push((8 - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// NIST SP 800-185 `right_encode`.
pub fn right_encode(out: &mut Vec<u8>, val: u64) {
    let bytes = val.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    out.extend_from_slice(&bytes[skip..]);
    out.push((8 - skip) as u8);
}

// bytepad(encode_string(key), rate): the block the KMAC construction absorbs
// ahead of the message.
fn bytepad_key_prefix(key: &[u8], rate: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(rate);
    left_encode(&mut out, rate as u64);
    left_encode(&mut out, 8 * key.len() as u64);
    out.extend_from_slice(key);
    while out.len() % rate != 0 {
        out.push(0);
    }
    out
}
