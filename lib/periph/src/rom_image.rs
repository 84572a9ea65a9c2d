/*++

Licensed under the Apache-2.0 license.

File Name:

    rom_image.rs

Abstract:

    File contains the ROM image loaders and the scramble pipeline shared by
    the ROM controller and its tests.

--*/

use std::io::{Error, ErrorKind, Result};

use elf::abi::PT_LOAD;
use elf::endian::LittleEndian;
use elf::ElfBytes;
use ot_emu_crypto::{
    prince_run, secded_39_32_dec, secded_39_32_enc, subst_perm_dec, subst_perm_enc, EccError,
};

/// Words at the top of the ROM that hold the expected digest.
pub const DIGEST_WORDS: usize = 8;

const WORD39_MASK: u64 = (1 << 39) - 1;

/// PRINCE key and nonce configuration for the scrambled image formats.
#[derive(Clone, Copy, Debug)]
pub struct ScrambleParams {
    pub key_hi: u64,
    pub key_lo: u64,
    pub nonce: u64,
}

impl ScrambleParams {
    pub fn new(key: u128, nonce: u64) -> Self {
        Self {
            key_hi: (key >> 64) as u64,
            key_lo: key as u64,
            nonce,
        }
    }

    fn addr_nonce(&self, addr_width: usize) -> u64 {
        self.nonce & ((1 << addr_width) - 1)
    }

    fn data_nonce(&self, addr_width: usize) -> u64 {
        self.nonce >> addr_width
    }
}

/// A loaded ROM image, either cleartext bytes or physically-ordered 39-bit
/// scrambled words.
pub enum RomImage {
    Clear(Vec<u8>),
    Scrambled(Vec<u64>),
}

fn invalid_data(msg: String) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

fn parse_vmem_words(text: &str, max_word: u64) -> Result<Vec<u64>> {
    let mut words: Vec<u64> = Vec::new();
    let mut cursor = 0usize;
    for line in text.lines() {
        let line = line.split("//").next().unwrap_or("");
        for token in line.split_whitespace() {
            if let Some(addr) = token.strip_prefix('@') {
                cursor = usize::from_str_radix(addr, 16)
                    .map_err(|_| invalid_data(format!("bad vmem address token @{addr}")))?;
                continue;
            }
            let word = u64::from_str_radix(token, 16)
                .map_err(|_| invalid_data(format!("bad vmem word {token}")))?;
            if word > max_word {
                return Err(invalid_data(format!("vmem word {token} out of range")));
            }
            if cursor >= words.len() {
                words.resize(cursor + 1, 0);
            }
            words[cursor] = word;
            cursor += 1;
        }
    }
    Ok(words)
}

impl RomImage {
    /// Plain VMEM: `@HEXADDR` tokens and 32-bit hex words.
    pub fn from_vmem(text: &str) -> Result<RomImage> {
        let words = parse_vmem_words(text, u64::from(u32::MAX))?;
        let bytes = words
            .iter()
            .flat_map(|w| (*w as u32).to_le_bytes())
            .collect();
        Ok(RomImage::Clear(bytes))
    }

    /// Scrambled VMEM: same syntax, 39-bit words with ECC.
    pub fn from_scrambled_vmem(text: &str) -> Result<RomImage> {
        Ok(RomImage::Scrambled(parse_vmem_words(text, WORD39_MASK)?))
    }

    /// Scrambled HEX: one 10-hex-digit word per line, strictly ordered.
    pub fn from_scrambled_hex(text: &str) -> Result<RomImage> {
        let mut words = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.len() != 10 {
                return Err(invalid_data(format!("bad hex word {line}")));
            }
            let word = u64::from_str_radix(line, 16)
                .map_err(|_| invalid_data(format!("bad hex word {line}")))?;
            if word > WORD39_MASK {
                return Err(invalid_data(format!("hex word {line} out of range")));
            }
            words.push(word);
        }
        Ok(RomImage::Scrambled(words))
    }

    /// 32-bit RISC-V ELF, loaded by VMA; all segments must lie within the
    /// `size`-byte ROM region based at `base`.
    pub fn from_elf(bytes: &[u8], base: u32, size: usize) -> Result<RomImage> {
        let elf = ElfBytes::<LittleEndian>::minimal_parse(bytes)
            .map_err(|e| invalid_data(format!("bad ELF image: {e}")))?;
        let segments = elf
            .segments()
            .ok_or_else(|| invalid_data("ELF image has no program headers".into()))?;
        let mut data = Vec::new();
        for segment in segments {
            if segment.p_type != PT_LOAD || segment.p_filesz == 0 {
                continue;
            }
            let start = segment.p_vaddr.wrapping_sub(u64::from(base));
            let end = start + segment.p_filesz;
            if segment.p_vaddr < u64::from(base) || end > size as u64 {
                return Err(invalid_data(format!(
                    "ELF segment at {:#010x} does not fit the ROM region",
                    segment.p_vaddr
                )));
            }
            let contents = elf
                .segment_data(&segment)
                .map_err(|e| invalid_data(format!("bad ELF segment: {e}")))?;
            let start = start as usize;
            if data.len() < start + contents.len() {
                data.resize(start + contents.len(), 0);
            }
            data[start..start + contents.len()].copy_from_slice(contents);
        }
        Ok(RomImage::Clear(data))
    }

    /// Raw binary bytes.
    pub fn from_binary(bytes: &[u8]) -> RomImage {
        RomImage::Clear(bytes.to_vec())
    }
}

fn keystream(logical_addr: usize, addr_width: usize, params: &ScrambleParams) -> u64 {
    let iv = (params.data_nonce(addr_width) << addr_width) | logical_addr as u64;
    prince_run(iv, params.key_hi, params.key_lo, 3) & WORD39_MASK
}

/// Physical word index holding logical word `logical_addr`.
pub(crate) fn scramble_addr(
    logical_addr: usize,
    addr_width: usize,
    params: &ScrambleParams,
) -> usize {
    subst_perm_enc(
        logical_addr as u64,
        params.addr_nonce(addr_width),
        addr_width,
        2,
    ) as usize
}

pub(crate) fn descramble_word(
    raw: u64,
    logical_addr: usize,
    addr_width: usize,
    params: &ScrambleParams,
) -> (u32, EccError) {
    let codeword = subst_perm_dec(raw, 0, 39, 2) ^ keystream(logical_addr, addr_width, params);
    secded_39_32_dec(codeword)
}

/// Inverse of the ROM controller's descramble pipeline; used to fabricate
/// physical images from logical word contents. The top [`DIGEST_WORDS`]
/// words are stored with address scrambling only.
pub fn scramble_image(words: &[u32], params: &ScrambleParams) -> Vec<u64> {
    let count = words.len();
    assert!(count.is_power_of_two() && count > DIGEST_WORDS);
    let addr_width = count.trailing_zeros() as usize;
    let mut phys = vec![0u64; count];
    for (addr, &word) in words.iter().enumerate() {
        let raw = if addr >= count - DIGEST_WORDS {
            u64::from(word)
        } else {
            let codeword = secded_39_32_enc(word);
            subst_perm_enc(codeword ^ keystream(addr, addr_width, params), 0, 39, 2)
        };
        phys[scramble_addr(addr, addr_width, params)] = raw;
    }
    phys
}
