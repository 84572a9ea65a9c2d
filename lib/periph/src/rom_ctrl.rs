/*++

Licensed under the Apache-2.0 license.

File Name:

    rom_ctrl.rs

Abstract:

    File contains the ROM controller peripheral. It descrambles the ROM
    image at construction, streams the message portion to the KMAC engine
    over an application channel and gates boot on the digest comparison.

--*/

use std::cell::RefCell;
use std::io::{Error, ErrorKind};
use std::rc::Rc;

use ot_emu_bus::{ActionHandle, Bus, BusError, Clock, Mem, Timer, WriteOnlyRegister};
use ot_emu_crypto::{EccError, Sha3Mode, Sha3Strength};
use ot_emu_derive::Bus;
use ot_emu_types::{RvAddr, RvData, RvSize};

use crate::kmac::{AppCfg, AppRequest, KmacAppPorts, APP_REQ_SIZE};
use crate::rom_image::{descramble_word, scramble_addr, RomImage, ScrambleParams, DIGEST_WORDS};

/// Ticks between checker steps.
const ROM_CHECK_TICKS: u64 = 10;

/// KMAC function name bound to the checker's application channel.
const KMAC_FUNC_NAME: &[u8] = b"ROM_CTRL";

mod cause {
    pub const CHECKER_ERROR: u32 = 1 << 0;
    pub const INTEGRITY_ERROR: u32 = 1 << 1;
}

/// Descrambled ROM contents, shared between the controller and the bus
/// region that exposes them. The memory stays writable (and unreadable from
/// the bus) until the checker finishes.
pub struct RomMem {
    mem: Mem,
    writable: bool,
}

impl RomMem {
    fn new(data: Vec<u8>) -> Rc<RefCell<RomMem>> {
        Rc::new(RefCell::new(RomMem {
            mem: Mem::new(data),
            writable: true,
        }))
    }

    pub fn data(&self) -> &[u8] {
        self.mem.data()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

/// Bus front-end for the ROM contents.
pub struct RomRegion {
    mem: Rc<RefCell<RomMem>>,
}

impl RomRegion {
    pub fn new(mem: Rc<RefCell<RomMem>>) -> Self {
        Self { mem }
    }
}

impl Bus for RomRegion {
    fn read(&mut self, size: RvSize, addr: RvAddr) -> Result<RvData, BusError> {
        let mem = self.mem.borrow();
        if mem.writable {
            return Err(BusError::LoadAccessFault);
        }
        Ok(mem.mem.read(size, addr)?)
    }

    fn write(
        &mut self,
        size: RvSize,
        addr: RvAddr,
        val: RvData,
    ) -> Result<(), BusError> {
        let mut mem = self.mem.borrow_mut();
        if !mem.writable {
            return Err(BusError::StoreAccessFault);
        }
        Ok(mem.mem.write(size, addr, val)?)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CheckerState {
    Streaming,
    WaitDigest,
    Done,
}

/// ROM Controller Peripheral
#[derive(Bus)]
#[poll_fn(poll)]
pub struct RomCtrl {
    /// Alert Test register (WO)
    #[register(offset = 0x0000_0000)]
    alert_test: WriteOnlyRegister<u32>,

    /// Fatal Alert Cause register
    #[register(offset = 0x0000_0004, read_fn = read_fatal_alert_cause, write_fn = write_read_only)]
    _fatal_alert_cause: (),

    /// Computed and expected digest windows
    #[register_array(offset = 0x0000_0008, item_size = 4, len = 8, read_fn = read_digest, write_fn = write_digest)]
    #[register_array(offset = 0x0000_0028, item_size = 4, len = 8, read_fn = read_exp_digest, write_fn = write_digest)]
    _digest_regs: (),

    /// Descrambled ROM contents
    rom: Rc<RefCell<RomMem>>,

    /// Message bytes still to be streamed to the engine
    staging: Vec<u8>,

    digest: [u32; DIGEST_WORDS],
    exp_digest: [u32; DIGEST_WORDS],

    checker_alert: bool,
    integrity_alert: bool,

    /// ECC statistics from the descramble pass
    recovered_errors: u32,
    unrecoverable_errors: u32,

    state: CheckerState,
    stream_offset: usize,
    stream_pending: bool,

    app_ports: Rc<RefCell<KmacAppPorts>>,
    app_channel: usize,

    rom_good: bool,
    rom_done: bool,
    done_callback: Option<Box<dyn FnMut(bool)>>,

    timer: Timer,
    poll_action: Option<ActionHandle>,
}

impl RomCtrl {
    /// Create a new ROM controller over `image`. Scrambled images require
    /// `params`; cleartext images skip the KMAC check entirely.
    pub fn new(
        clock: &Clock,
        app_ports: Rc<RefCell<KmacAppPorts>>,
        app_channel: usize,
        image: RomImage,
        size: usize,
        params: Option<ScrambleParams>,
    ) -> std::io::Result<RomCtrl> {
        let timer = Timer::new(clock);
        let mut ctrl = RomCtrl {
            alert_test: WriteOnlyRegister::new(0),
            _fatal_alert_cause: (),
            _digest_regs: (),
            rom: RomMem::new(vec![0u8; size]),
            staging: Vec::new(),
            digest: [0; DIGEST_WORDS],
            exp_digest: [0; DIGEST_WORDS],
            checker_alert: false,
            integrity_alert: false,
            recovered_errors: 0,
            unrecoverable_errors: 0,
            state: CheckerState::Done,
            stream_offset: 0,
            stream_pending: false,
            app_ports,
            app_channel,
            rom_good: false,
            rom_done: false,
            done_callback: None,
            timer,
            poll_action: None,
        };
        match image {
            RomImage::Clear(data) => ctrl.load_clear(&data, size)?,
            RomImage::Scrambled(words) => {
                let Some(params) = params else {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        "scrambled ROM image requires a key and nonce",
                    ));
                };
                ctrl.load_scrambled(&words, size, &params)?;
            }
        }
        Ok(ctrl)
    }

    /// Shared handle to the ROM contents, for wiring up a [`RomRegion`].
    pub fn rom(&self) -> Rc<RefCell<RomMem>> {
        self.rom.clone()
    }

    /// True once the checker has finished.
    pub fn rom_done(&self) -> bool {
        self.rom_done
    }

    /// True if the digest check passed (or was skipped for a cleartext
    /// image). Only meaningful once [`Self::rom_done`] is true.
    pub fn rom_good(&self) -> bool {
        self.rom_good
    }

    pub fn set_done_callback(&mut self, callback: Box<dyn FnMut(bool)>) {
        self.done_callback = Some(callback);
    }

    /// Cleartext image: copy it in and report success without a KMAC pass.
    fn load_clear(&mut self, data: &[u8], size: usize) -> std::io::Result<()> {
        if data.len() > size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("ROM image is {} bytes, region is {size}", data.len()),
            ));
        }
        {
            let mut rom = self.rom.borrow_mut();
            rom.mem.data_mut()[..data.len()].copy_from_slice(data);
            rom.writable = false;
        }
        self.rom_good = true;
        self.rom_done = true;
        Ok(())
    }

    fn load_scrambled(
        &mut self,
        words: &[u64],
        size: usize,
        params: &ScrambleParams,
    ) -> std::io::Result<()> {
        let count = words.len();
        if count * 4 != size || !count.is_power_of_two() || count <= DIGEST_WORDS {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("scrambled ROM image has {count} words, region holds {size} bytes"),
            ));
        }
        let addr_width = count.trailing_zeros() as usize;
        {
            let mut rom = self.rom.borrow_mut();
            for addr in 0..count {
                let raw = words[scramble_addr(addr, addr_width, params)];
                let word = if addr >= count - DIGEST_WORDS {
                    let word = raw as u32;
                    self.exp_digest[addr - (count - DIGEST_WORDS)] = word;
                    word
                } else {
                    let (word, err) = descramble_word(raw, addr, addr_width, params);
                    match err {
                        EccError::None => (),
                        EccError::Corrected | EccError::ParityCorrupted => {
                            self.recovered_errors += 1;
                        }
                        EccError::Unrecoverable => {
                            self.unrecoverable_errors += 1;
                            self.integrity_alert = true;
                        }
                    }
                    self.staging.extend_from_slice(&word.to_le_bytes());
                    word
                };
                rom.mem
                    .write(RvSize::Word, (addr * 4) as RvAddr, word)
                    .map_err(|_| {
                        Error::new(ErrorKind::InvalidData, "ROM image exceeds the region")
                    })?;
            }
        }
        self.app_ports
            .borrow_mut()
            .connect(
                self.app_channel,
                AppCfg {
                    mode: Sha3Mode::CShake,
                    strength: Sha3Strength::L256,
                    func_name: KMAC_FUNC_NAME.to_vec(),
                    customization: Vec::new(),
                    key: None,
                },
            )
            .map_err(|_| {
                Error::new(
                    ErrorKind::AddrInUse,
                    "KMAC application channel is already bound",
                )
            })?;
        self.state = CheckerState::Streaming;
        self.poll_action = Some(self.timer.schedule_poll_in(ROM_CHECK_TICKS));
        Ok(())
    }

    fn read_fatal_alert_cause(&mut self, size: RvSize) -> Result<RvData, BusError> {
        if size != RvSize::Word {
            return Err(BusError::LoadAccessFault);
        }
        let mut val = 0;
        if self.checker_alert {
            val |= cause::CHECKER_ERROR;
        }
        if self.integrity_alert {
            val |= cause::INTEGRITY_ERROR;
        }
        Ok(val)
    }

    fn write_read_only(&mut self, _size: RvSize, _val: RvData) -> Result<(), BusError> {
        Err(BusError::StoreAccessFault)
    }

    fn read_digest(&mut self, size: RvSize, index: usize) -> Result<RvData, BusError> {
        if size != RvSize::Word {
            return Err(BusError::LoadAccessFault);
        }
        Ok(self.digest[index])
    }

    fn read_exp_digest(
        &mut self,
        size: RvSize,
        index: usize,
    ) -> Result<RvData, BusError> {
        if size != RvSize::Word {
            return Err(BusError::LoadAccessFault);
        }
        Ok(self.exp_digest[index])
    }

    fn write_digest(
        &mut self,
        _size: RvSize,
        _index: usize,
        _val: RvData,
    ) -> Result<(), BusError> {
        Err(BusError::StoreAccessFault)
    }

    fn poll(&mut self) {
        if !self.timer.fired(&mut self.poll_action) {
            return;
        }
        self.step();
        if self.state != CheckerState::Done {
            self.poll_action = Some(self.timer.schedule_poll_in(ROM_CHECK_TICKS));
        }
    }

    fn step(&mut self) {
        let ports = self.app_ports.clone();
        match self.state {
            CheckerState::Streaming => {
                let mut ports = ports.borrow_mut();
                if self.stream_pending {
                    if ports.take_response(self.app_channel).is_none() {
                        return;
                    }
                    self.stream_pending = false;
                }
                let remaining = self.staging.len() - self.stream_offset;
                let len = remaining.min(APP_REQ_SIZE);
                let mut data = [0u8; APP_REQ_SIZE];
                data[..len].copy_from_slice(
                    &self.staging[self.stream_offset..self.stream_offset + len],
                );
                let last = remaining <= APP_REQ_SIZE;
                if ports.request(self.app_channel, AppRequest { data, len, last }) {
                    self.stream_offset += len;
                    self.stream_pending = true;
                    if last {
                        self.staging.clear();
                        self.state = CheckerState::WaitDigest;
                    }
                }
            }
            CheckerState::WaitDigest => {
                let resp = ports.borrow_mut().take_response(self.app_channel);
                if let Some(resp) = resp {
                    if resp.done {
                        let mut digest = [0u32; DIGEST_WORDS];
                        for (ix, word) in digest.iter_mut().enumerate() {
                            let mut bytes = [0u8; 4];
                            for (b, byte) in bytes.iter_mut().enumerate() {
                                *byte = resp.digest_share0[ix * 4 + b]
                                    ^ resp.digest_share1[ix * 4 + b];
                            }
                            *word = u32::from_le_bytes(bytes);
                        }
                        self.finish(digest);
                    }
                }
            }
            CheckerState::Done => (),
        }
    }

    fn finish(&mut self, digest: [u32; DIGEST_WORDS]) {
        self.digest = digest;
        let mut good = true;
        for ix in 0..DIGEST_WORDS {
            if self.digest[ix] != self.exp_digest[ix] {
                log::error!(
                    "ROM_CTRL: digest word {ix} mismatch: computed {:#010x}, expected {:#010x} \
                     ({} recovered, {} unrecoverable ECC errors)",
                    self.digest[ix],
                    self.exp_digest[ix],
                    self.recovered_errors,
                    self.unrecoverable_errors,
                );
                good = false;
            }
        }
        if !good {
            self.checker_alert = true;
        }
        self.rom.borrow_mut().writable = false;
        self.rom_good = good;
        self.rom_done = true;
        self.state = CheckerState::Done;
        if let Some(callback) = &mut self.done_callback {
            callback(good);
        }
    }
}
