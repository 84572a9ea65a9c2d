/*++

Licensed under the Apache-2.0 license.

File Name:

    kmac.rs

Abstract:

    File contains the KMAC/SHA-3 engine peripheral implementation.

--*/

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use ot_emu_bus::{ActionHandle, BusError, Clock, ReadWriteRegister, Timer};
use ot_emu_crypto::{Sha3, Sha3Mode, Sha3Strength, KECCAK_STATE_SIZE};
use ot_emu_derive::Bus;
use ot_emu_types::{RvData, RvSize};
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::register_bitfields;
use tock_registers::LocalRegisterCopy;

register_bitfields! [
    u32,

    /// Interrupt State/Enable/Test Register Fields
    Intr [
        KMAC_DONE OFFSET(0) NUMBITS(1) [],
        FIFO_EMPTY OFFSET(1) NUMBITS(1) [],
        KMAC_ERR OFFSET(2) NUMBITS(1) [],
    ],

    /// Configuration Register Fields
    Cfg [
        KMAC_EN OFFSET(0) NUMBITS(1) [],
        KSTRENGTH OFFSET(1) NUMBITS(3) [],
        MODE OFFSET(4) NUMBITS(2) [],
        MSG_ENDIANNESS OFFSET(8) NUMBITS(1) [],
        STATE_ENDIANNESS OFFSET(9) NUMBITS(1) [],
        SIDELOAD OFFSET(12) NUMBITS(1) [],
        ENTROPY_MODE OFFSET(16) NUMBITS(2) [],
        ENTROPY_FAST_PROCESS OFFSET(19) NUMBITS(1) [],
        ENTROPY_READY OFFSET(24) NUMBITS(1) [],
    ],

    /// Command Register Fields
    Cmd [
        CMD OFFSET(0) NUMBITS(6) [],
        ENTROPY_REQ OFFSET(8) NUMBITS(1) [],
        HASH_CNT_CLR OFFSET(9) NUMBITS(1) [],
    ],

    /// Status Register Fields
    Status [
        SHA3_IDLE OFFSET(0) NUMBITS(1) [],
        SHA3_ABSORB OFFSET(1) NUMBITS(1) [],
        SHA3_SQUEEZE OFFSET(2) NUMBITS(1) [],
        FIFO_DEPTH OFFSET(8) NUMBITS(5) [],
        FIFO_EMPTY OFFSET(14) NUMBITS(1) [],
        FIFO_FULL OFFSET(15) NUMBITS(1) [],
        ALERT_FATAL_FAULT OFFSET(16) NUMBITS(1) [],
        ALERT_RECOV_CTRL_UPDATE_ERR OFFSET(17) NUMBITS(1) [],
    ],
];

/// Capacity of the software message FIFO in bytes.
const MSG_FIFO_SIZE: usize = 80;

/// Ticks between a triggering command and its bottom-half.
const KMAC_PROCESS_TICKS: u64 = 100;

/// Ticks between scans of the application ports.
const APP_SCAN_TICKS: u64 = 10;

/// Bytes of digest handed to an application per share.
pub const APP_DIGEST_SIZE: usize = 48;

/// Most bytes an application may carry in one request.
pub const APP_REQ_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CmdType {
    Start = 0x1d,
    Process = 0x2e,
    ManualRun = 0x31,
    Done = 0x16,
}

impl CmdType {
    fn decode(val: u32) -> Option<CmdType> {
        match val {
            0x1d => Some(CmdType::Start),
            0x2e => Some(CmdType::Process),
            0x31 => Some(CmdType::ManualRun),
            0x16 => Some(CmdType::Done),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum KmacFsm {
    Idle = 0,
    MsgFeed = 1,
    Processing = 2,
    Absorbed = 3,
    Squeezing = 4,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum KmacError {
    IncorrectFunctionName = 0x01,
    UnexpectedModeStrength = 0x02,
    SwPushedMsgFifo = 0x03,
    SwCmdSequence = 0x04,
    SwIssuedCmdInAppActive = 0x05,
}

/// Hash configuration carried by an application connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppCfg {
    pub mode: Sha3Mode,
    pub strength: Sha3Strength,
    pub func_name: Vec<u8>,
    pub customization: Vec<u8>,
    pub key: Option<Vec<u8>>,
}

/// One message beat on an application channel.
#[derive(Clone, Copy, Debug)]
pub struct AppRequest {
    pub data: [u8; APP_REQ_SIZE],
    pub len: usize,
    pub last: bool,
}

/// Engine reply to an application request.
#[derive(Clone, Copy, Debug)]
pub struct AppResponse {
    pub done: bool,
    pub digest_share0: [u8; APP_DIGEST_SIZE],
    pub digest_share1: [u8; APP_DIGEST_SIZE],
}

struct AppChannel {
    cfg: Option<AppCfg>,
    request: Option<AppRequest>,
    response: Option<AppResponse>,
}

/// Application-side hashing ports, shared between the engine and its
/// collaborating peripherals. Requests and responses are exchanged through
/// per-channel mailboxes serviced from `poll()`.
pub struct KmacAppPorts {
    channels: Vec<AppChannel>,
}

impl KmacAppPorts {
    pub fn new(num_app: usize) -> Rc<RefCell<KmacAppPorts>> {
        let channels = (0..num_app)
            .map(|_| AppChannel {
                cfg: None,
                request: None,
                response: None,
            })
            .collect();
        Rc::new(RefCell::new(KmacAppPorts { channels }))
    }

    /// Bind a hash configuration to a channel. Reconnecting with an
    /// identical configuration is accepted; a divergent one is rejected.
    pub fn connect(&mut self, channel: usize, cfg: AppCfg) -> Result<(), ()> {
        let Some(chan) = self.channels.get_mut(channel) else {
            return Err(());
        };
        match &chan.cfg {
            None => {
                chan.cfg = Some(cfg);
                Ok(())
            }
            Some(existing) if *existing == cfg => Ok(()),
            Some(_) => Err(()),
        }
    }

    /// Queue a message beat. Returns false while the previous beat is still
    /// unacknowledged or the channel is unconnected.
    pub fn request(&mut self, channel: usize, req: AppRequest) -> bool {
        let Some(chan) = self.channels.get_mut(channel) else {
            return false;
        };
        if chan.cfg.is_none() || chan.request.is_some() || chan.response.is_some() {
            return false;
        }
        chan.request = Some(req);
        true
    }

    /// Collect the engine's reply to the most recent request, if ready.
    pub fn take_response(&mut self, channel: usize) -> Option<AppResponse> {
        self.channels.get_mut(channel)?.response.take()
    }

    fn next_pending(&self) -> Option<usize> {
        self.channels.iter().position(|c| c.request.is_some())
    }

    fn cfg(&self, channel: usize) -> Option<AppCfg> {
        self.channels.get(channel)?.cfg.clone()
    }

    fn take_request(&mut self, channel: usize) -> Option<AppRequest> {
        self.channels.get_mut(channel)?.request.take()
    }

    fn post_response(&mut self, channel: usize, resp: AppResponse) {
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.response = Some(resp);
        }
    }
}

/// KMAC/SHA-3 Engine Peripheral
#[derive(Bus)]
#[poll_fn(poll)]
#[warm_reset_fn(warm_reset)]
pub struct Kmac {
    /// Interrupt State register (W1C)
    #[register(offset = 0x0000_0000, write_fn = on_write_intr_state)]
    intr_state: ReadWriteRegister<u32, Intr::Register>,

    /// Interrupt Enable register
    #[register(offset = 0x0000_0004)]
    intr_enable: ReadWriteRegister<u32, Intr::Register>,

    /// Interrupt Test register
    #[register(offset = 0x0000_0008, read_fn = read_write_only, write_fn = on_write_intr_test)]
    /// Alert Test register
    #[register(offset = 0x0000_000c, read_fn = read_write_only, write_fn = on_write_alert_test)]
    /// Configuration write-enable (clear while the engine is busy)
    #[register(offset = 0x0000_0010, read_fn = read_cfg_regwen, write_fn = write_read_only)]
    /// Shadowed configuration register (second identical write commits)
    #[register(offset = 0x0000_0014, read_fn = read_cfg, write_fn = on_write_cfg)]
    /// Command register
    #[register(offset = 0x0000_0018, read_fn = read_write_only, write_fn = on_write_cmd)]
    /// Status register
    #[register(offset = 0x0000_001c, read_fn = read_status, write_fn = write_read_only)]
    _ctrl_regs: (),

    /// Entropy timer period
    #[register(offset = 0x0000_0020)]
    entropy_period: ReadWriteRegister<u32>,

    /// Hashes-since-entropy-refresh counter
    #[register(offset = 0x0000_0024, read_fn = read_hash_cnt, write_fn = write_read_only)]
    _entropy_cnt_reg: (),

    /// Entropy refresh threshold
    #[register(offset = 0x0000_0028)]
    entropy_refresh_threshold: ReadWriteRegister<u32>,

    /// Entropy seed registers (accepted, unused: entropy is stubbed ready)
    #[register_array(offset = 0x0000_002c)]
    entropy_seed: [u32; 5],

    /// Key share 0 (write-only, reads as zero)
    #[register_array(offset = 0x0000_0040, item_size = 4, len = 16, read_fn = read_key_share0, write_fn = write_key_share0)]
    /// Key share 1 (write-only, reads as zero)
    #[register_array(offset = 0x0000_0080, item_size = 4, len = 16, read_fn = read_key_share1, write_fn = write_key_share1)]
    _key_share_regs: (),

    /// Key length select
    #[register(offset = 0x0000_00c0, write_fn = on_write_key_len)]
    key_len: ReadWriteRegister<u32>,

    /// cSHAKE/KMAC prefix (encoded function name + customization)
    #[register_array(offset = 0x0000_00c4)]
    prefix: [u32; 11],

    /// Error code register
    #[register(offset = 0x0000_00f0, read_fn = read_err_code, write_fn = write_read_only)]
    /// Sponge state window (readable in the Absorbed phase)
    #[register_array(offset = 0x0000_0400, item_size = 4, len = 128, read_fn = read_state, write_fn = write_state)]
    /// Message FIFO aperture
    #[register_array(offset = 0x0000_0800, item_size = 4, len = 512, read_fn = read_msg_fifo, write_fn = on_write_msg_fifo)]
    _window_regs: (),

    /// Committed configuration
    cfg_committed: LocalRegisterCopy<u32, Cfg::Register>,

    /// First write of a shadowed configuration update
    cfg_staged: Option<u32>,

    /// SHA-3 engine
    sha3: Sha3,

    /// Command state machine
    fsm: KmacFsm,

    /// Software input FIFO
    fifo: VecDeque<u8>,

    /// Key shares, XOR-combined on START
    key_share0: [u32; 16],
    key_share1: [u32; 16],

    /// Application ports shared with collaborating peripherals
    app_ports: Rc<RefCell<KmacAppPorts>>,

    /// Channel currently holding the engine
    active_app: Option<usize>,

    err_code: u32,

    hash_cnt: u32,

    recov_alert: bool,

    /// One guest error per out-of-phase state-window read burst
    state_read_warned: bool,

    timer: Timer,

    /// Deferred bottom-half for a triggering command
    op_complete_action: Option<ActionHandle>,

    /// Recurring application port scan
    app_scan_action: Option<ActionHandle>,
}

impl Kmac {
    pub fn new(clock: &Clock, app_ports: Rc<RefCell<KmacAppPorts>>) -> Self {
        let timer = Timer::new(clock);
        let app_scan_action = Some(timer.schedule_poll_in(APP_SCAN_TICKS));
        Self {
            intr_state: ReadWriteRegister::new(0),
            intr_enable: ReadWriteRegister::new(0),
            _ctrl_regs: (),
            entropy_period: ReadWriteRegister::new(0),
            _entropy_cnt_reg: (),
            entropy_refresh_threshold: ReadWriteRegister::new(0),
            entropy_seed: Default::default(),
            _key_share_regs: (),
            key_len: ReadWriteRegister::new(0),
            prefix: Default::default(),
            _window_regs: (),
            cfg_committed: LocalRegisterCopy::new(0),
            cfg_staged: None,
            sha3: Sha3::new(),
            fsm: KmacFsm::Idle,
            fifo: VecDeque::new(),
            key_share0: [0; 16],
            key_share1: [0; 16],
            app_ports,
            active_app: None,
            err_code: 0,
            hash_cnt: 0,
            recov_alert: false,
            state_read_warned: false,
            timer,
            op_complete_action: None,
            app_scan_action,
        }
    }

    fn idle(&self) -> bool {
        self.fsm == KmacFsm::Idle && self.active_app.is_none()
    }

    fn raise_err(&mut self, err: KmacError, info: u32) {
        log::warn!(
            "KMAC: error {:#04x} info {:#08x}",
            err as u32,
            info & 0xff_ffff
        );
        self.err_code = ((err as u32) << 24) | (info & 0xff_ffff);
        self.set_intr(Intr::KMAC_ERR.mask << Intr::KMAC_ERR.shift);
    }

    fn set_intr(&mut self, bits: u32) {
        self.intr_state.reg.set(self.intr_state.reg.get() | bits);
    }

    fn on_write_intr_state(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        self.intr_state.reg.set(self.intr_state.reg.get() & !val);
        Ok(())
    }

    fn on_write_intr_test(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        self.set_intr(val & 0x7);
        Ok(())
    }

    fn on_write_alert_test(&mut self, _size: RvSize, _val: RvData) -> Result<(), BusError> {
        // Alert wiring is not modeled beyond the status bits.
        Ok(())
    }

    fn read_write_only(&mut self, _size: RvSize) -> Result<RvData, BusError> {
        log::warn!("KMAC: read of write-only register");
        Ok(0)
    }

    fn write_read_only(&mut self, _size: RvSize, _val: RvData) -> Result<(), BusError> {
        log::warn!("KMAC: write to read-only register");
        Ok(())
    }

    fn read_cfg_regwen(&mut self, _size: RvSize) -> Result<RvData, BusError> {
        Ok(u32::from(self.idle()))
    }

    fn read_cfg(&mut self, _size: RvSize) -> Result<RvData, BusError> {
        Ok(self.cfg_committed.get())
    }

    fn on_write_cfg(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        if !self.idle() {
            log::warn!("KMAC: CFG_SHADOWED write while engine busy, ignored");
            return Ok(());
        }
        match self.cfg_staged.take() {
            None => self.cfg_staged = Some(val),
            Some(staged) if staged == val => self.cfg_committed.set(val),
            Some(_) => {
                log::warn!("KMAC: CFG_SHADOWED update mismatch");
                self.recov_alert = true;
            }
        }
        Ok(())
    }

    fn on_write_key_len(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        if !self.idle() {
            log::warn!("KMAC: KEY_LEN write while engine busy, ignored");
            return Ok(());
        }
        self.key_len.reg.set(val);
        Ok(())
    }

    fn read_key_share0(&mut self, _size: RvSize, _index: usize) -> Result<RvData, BusError> {
        Ok(0)
    }

    fn read_key_share1(&mut self, _size: RvSize, _index: usize) -> Result<RvData, BusError> {
        Ok(0)
    }

    fn write_key_share0(&mut self, size: RvSize, index: usize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        self.key_share0[index] = val;
        Ok(())
    }

    fn write_key_share1(&mut self, size: RvSize, index: usize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        self.key_share1[index] = val;
        Ok(())
    }

    fn read_hash_cnt(&mut self, _size: RvSize) -> Result<RvData, BusError> {
        Ok(self.hash_cnt)
    }

    fn read_err_code(&mut self, _size: RvSize) -> Result<RvData, BusError> {
        Ok(self.err_code)
    }

    fn read_status(&mut self, _size: RvSize) -> Result<RvData, BusError> {
        let mut status = LocalRegisterCopy::<u32, Status::Register>::new(0);
        status.modify(Status::SHA3_IDLE.val(u32::from(self.idle())));
        status.modify(Status::SHA3_ABSORB.val(u32::from(self.fsm == KmacFsm::MsgFeed)));
        status.modify(Status::SHA3_SQUEEZE.val(u32::from(self.fsm == KmacFsm::Absorbed)));
        status.modify(Status::FIFO_DEPTH.val(self.fifo.len().div_ceil(8) as u32));
        status.modify(Status::FIFO_EMPTY.val(u32::from(self.fifo.is_empty())));
        status.modify(Status::FIFO_FULL.val(u32::from(self.fifo.len() >= MSG_FIFO_SIZE)));
        status.modify(Status::ALERT_RECOV_CTRL_UPDATE_ERR.val(u32::from(self.recov_alert)));
        Ok(status.get())
    }

    fn on_write_cmd(&mut self, size: RvSize, val: RvData) -> Result<(), BusError> {
        if size != RvSize::Word {
            Err(BusError::StoreAccessFault)?
        }
        let cmd_reg = LocalRegisterCopy::<u32, Cmd::Register>::new(val);
        if cmd_reg.is_set(Cmd::HASH_CNT_CLR) {
            self.hash_cnt = 0;
        }
        let cmd_bits = cmd_reg.read(Cmd::CMD);
        if cmd_bits == 0 {
            return Ok(());
        }
        let Some(cmd) = CmdType::decode(cmd_bits) else {
            log::warn!("KMAC: unknown command {cmd_bits:#04x}");
            return Ok(());
        };
        if self.active_app.is_some() {
            self.raise_err(KmacError::SwIssuedCmdInAppActive, cmd_bits);
            return Ok(());
        }
        match (self.fsm, cmd) {
            (KmacFsm::Idle, CmdType::Start) => self.start_sw_hash(),
            (KmacFsm::MsgFeed, CmdType::Process) => {
                self.fsm = KmacFsm::Processing;
                self.op_complete_action = Some(self.timer.schedule_poll_in(KMAC_PROCESS_TICKS));
            }
            (KmacFsm::Absorbed, CmdType::ManualRun) => {
                self.fsm = KmacFsm::Squeezing;
                self.op_complete_action = Some(self.timer.schedule_poll_in(KMAC_PROCESS_TICKS));
            }
            (KmacFsm::Absorbed, CmdType::Done) => {
                self.sha3.reset();
                self.fifo.clear();
                self.hash_cnt = self.hash_cnt.wrapping_add(1);
                self.fsm = KmacFsm::Idle;
            }
            _ => {
                self.raise_err(
                    KmacError::SwCmdSequence,
                    ((self.fsm as u32) << 8) | cmd_bits,
                );
            }
        }
        Ok(())
    }

    fn start_sw_hash(&mut self) {
        let cfg = self.cfg_committed;
        let kstrength = cfg.read(Cfg::KSTRENGTH);
        let strength = match kstrength {
            0 => Sha3Strength::L128,
            1 => Sha3Strength::L224,
            2 => Sha3Strength::L256,
            3 => Sha3Strength::L384,
            4 => Sha3Strength::L512,
            _ => {
                self.raise_err(KmacError::UnexpectedModeStrength, cfg.get() & 0x3f);
                return;
            }
        };
        let mode_bits = cfg.read(Cfg::MODE);
        let mode = if cfg.is_set(Cfg::KMAC_EN) {
            Sha3Mode::Kmac
        } else {
            match mode_bits {
                0b00 => Sha3Mode::Sha3,
                0b10 => Sha3Mode::Shake,
                0b11 => Sha3Mode::CShake,
                _ => {
                    self.raise_err(KmacError::UnexpectedModeStrength, cfg.get() & 0x3f);
                    return;
                }
            }
        };
        if !Sha3::supports(mode, strength) {
            self.raise_err(KmacError::UnexpectedModeStrength, cfg.get() & 0x3f);
            return;
        }

        let mut func_name = Vec::new();
        let mut customization = Vec::new();
        if matches!(mode, Sha3Mode::CShake | Sha3Mode::Kmac) {
            let bytes = self.prefix_bytes();
            let Some((fname, custom)) = parse_prefix(&bytes) else {
                self.raise_err(KmacError::IncorrectFunctionName, self.prefix[0] & 0xff_ffff);
                return;
            };
            if mode == Sha3Mode::Kmac && fname != b"KMAC" {
                self.raise_err(KmacError::IncorrectFunctionName, self.prefix[0] & 0xff_ffff);
                return;
            }
            func_name = fname;
            customization = custom;
        }

        let key = (mode == Sha3Mode::Kmac).then(|| self.combined_key());
        if !self.sha3.init(
            mode,
            strength,
            &func_name,
            &customization,
            key.as_deref(),
        ) {
            self.raise_err(KmacError::UnexpectedModeStrength, cfg.get() & 0x3f);
            return;
        }
        self.fifo.clear();
        self.state_read_warned = false;
        self.fsm = KmacFsm::MsgFeed;
    }

    fn prefix_bytes(&self) -> Vec<u8> {
        self.prefix
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    // XOR of the two shares, truncated to the architected key length.
    fn combined_key(&self) -> Vec<u8> {
        let len_bytes = match self.key_len.reg.get() & 0x7 {
            0 => 16,
            1 => 24,
            2 => 32,
            3 => 48,
            _ => 64,
        };
        let mut key = Vec::with_capacity(len_bytes);
        for ix in 0..16 {
            key.extend((self.key_share0[ix] ^ self.key_share1[ix]).to_le_bytes());
        }
        key.truncate(len_bytes);
        key
    }

    fn read_state(&mut self, _size: RvSize, index: usize) -> Result<RvData, BusError> {
        if self.fsm != KmacFsm::Absorbed {
            if !self.state_read_warned {
                log::warn!("KMAC: STATE read at {:#x} while not absorbed", index * 4);
                self.state_read_warned = true;
            }
            return Ok(0);
        }
        let offset = index * 4;
        let mut word = if offset + 4 <= KECCAK_STATE_SIZE {
            let state = self.sha3.digest();
            u32::from_le_bytes([
                state[offset],
                state[offset + 1],
                state[offset + 2],
                state[offset + 3],
            ])
        } else {
            // Second share reads as zero: masking is stubbed out.
            0
        };
        if self.cfg_committed.is_set(Cfg::STATE_ENDIANNESS) {
            word = word.swap_bytes();
        }
        Ok(word)
    }

    fn write_state(&mut self, _size: RvSize, index: usize, _val: RvData) -> Result<(), BusError> {
        log::warn!("KMAC: write to read-only STATE window at {:#x}", index * 4);
        Ok(())
    }

    fn read_msg_fifo(&mut self, _size: RvSize, _index: usize) -> Result<RvData, BusError> {
        log::warn!("KMAC: read of write-only MSG_FIFO window");
        Ok(0)
    }

    fn on_write_msg_fifo(
        &mut self,
        size: RvSize,
        _index: usize,
        val: RvData,
    ) -> Result<(), BusError> {
        if self.active_app.is_some() {
            self.raise_err(KmacError::SwPushedMsgFifo, 2);
            return Ok(());
        }
        if self.fsm != KmacFsm::MsgFeed {
            self.raise_err(KmacError::SwPushedMsgFifo, 1);
            return Ok(());
        }
        let len = usize::from(size);
        let mut bytes = val.to_le_bytes();
        let beat = &mut bytes[..len];
        if self.cfg_committed.is_set(Cfg::MSG_ENDIANNESS) {
            beat.reverse();
        }
        if self.fifo.len() + len > MSG_FIFO_SIZE {
            self.drain_fifo();
        }
        self.fifo.extend(beat.iter());
        Ok(())
    }

    fn drain_fifo(&mut self) {
        if self.fifo.is_empty() {
            return;
        }
        let bytes: Vec<u8> = self.fifo.drain(..).collect();
        self.sha3.update(&bytes);
        self.set_intr(Intr::FIFO_EMPTY.mask << Intr::FIFO_EMPTY.shift);
    }

    fn op_complete(&mut self) {
        self.drain_fifo();
        match self.fsm {
            KmacFsm::Processing => {
                self.sha3.finalize();
                self.fsm = KmacFsm::Absorbed;
                self.set_intr(Intr::KMAC_DONE.mask << Intr::KMAC_DONE.shift);
            }
            KmacFsm::Squeezing => {
                self.sha3.squeeze();
                self.fsm = KmacFsm::Absorbed;
                self.set_intr(Intr::KMAC_DONE.mask << Intr::KMAC_DONE.shift);
            }
            _ => {}
        }
    }

    // Starts the lowest pending channel when the engine is free and absorbs
    // one queued beat for the active channel.
    fn process_app(&mut self) {
        let ports = self.app_ports.clone();
        let mut ports = ports.borrow_mut();
        if self.active_app.is_none() {
            if self.fsm != KmacFsm::Idle {
                return;
            }
            let Some(channel) = ports.next_pending() else {
                return;
            };
            let Some(cfg) = ports.cfg(channel) else {
                return;
            };
            if !self.sha3.init(
                cfg.mode,
                cfg.strength,
                &cfg.func_name,
                &cfg.customization,
                cfg.key.as_deref(),
            ) {
                log::error!("KMAC: app channel {channel} has an unsupported configuration");
                ports.take_request(channel);
                return;
            }
            self.active_app = Some(channel);
        }
        let Some(channel) = self.active_app else {
            return;
        };
        let Some(req) = ports.take_request(channel) else {
            return;
        };
        self.sha3.update(&req.data[..req.len.min(APP_REQ_SIZE)]);
        if req.last {
            self.sha3.finalize();
            let mut resp = AppResponse {
                done: true,
                digest_share0: [0; APP_DIGEST_SIZE],
                digest_share1: [0; APP_DIGEST_SIZE],
            };
            resp.digest_share0
                .copy_from_slice(&self.sha3.digest()[..APP_DIGEST_SIZE]);
            ports.post_response(channel, resp);
            self.sha3.reset();
            self.active_app = None;
        } else {
            ports.post_response(
                channel,
                AppResponse {
                    done: false,
                    digest_share0: [0; APP_DIGEST_SIZE],
                    digest_share1: [0; APP_DIGEST_SIZE],
                },
            );
        }
    }

    fn poll(&mut self) {
        if self.timer.fired(&mut self.op_complete_action) {
            self.op_complete();
        }
        if self.timer.fired(&mut self.app_scan_action) {
            self.process_app();
            self.app_scan_action = Some(self.timer.schedule_poll_in(APP_SCAN_TICKS));
        }
    }

    fn warm_reset(&mut self) {
        self.sha3.reset();
        self.fsm = KmacFsm::Idle;
        self.fifo.clear();
        self.active_app = None;
        self.err_code = 0;
        self.cfg_staged = None;
        self.cfg_committed.set(0);
        self.recov_alert = false;
        self.state_read_warned = false;
        self.intr_state.reg.set(0);
        self.op_complete_action = None;
    }
}

fn parse_encoded_string(bytes: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let len_of_len = *bytes.first()? as usize;
    if len_of_len == 0 || len_of_len > 2 {
        return None;
    }
    let mut bits = 0usize;
    for ix in 0..len_of_len {
        bits = (bits << 8) | usize::from(*bytes.get(1 + ix)?);
    }
    if bits % 8 != 0 {
        return None;
    }
    let start = 1 + len_of_len;
    let payload = bytes.get(start..start + bits / 8)?;
    Some((payload.to_vec(), &bytes[start + bits / 8..]))
}

// The PREFIX registers hold encode_string(N) || encode_string(S).
fn parse_prefix(bytes: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let (func_name, rest) = parse_encoded_string(bytes)?;
    let (customization, _) = parse_encoded_string(rest)?;
    Some((func_name, customization))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ot_emu_bus::Bus;

    const CFG_SHADOWED: u32 = 0x14;
    const CMD: u32 = 0x18;
    const STATUS: u32 = 0x1c;
    const KEY_LEN: u32 = 0xc0;
    const PREFIX: u32 = 0xc4;
    const ERR_CODE: u32 = 0xf0;
    const STATE: u32 = 0x400;
    const MSG_FIFO: u32 = 0x800;

    const CMD_START: u32 = 0x1d;
    const CMD_PROCESS: u32 = 0x2e;
    const CMD_MANUAL_RUN: u32 = 0x31;
    const CMD_DONE: u32 = 0x16;

    // CFG_SHADOWED value for SHA3-256: kstrength=2, mode=0.
    const CFG_SHA3_256: u32 = 2 << 1;

    fn new_kmac(clock: &Clock) -> Kmac {
        Kmac::new(clock, KmacAppPorts::new(4))
    }

    fn commit_cfg(kmac: &mut Kmac, val: u32) {
        kmac.write(RvSize::Word, CFG_SHADOWED, val).unwrap();
        kmac.write(RvSize::Word, CFG_SHADOWED, val).unwrap();
    }

    fn pump(clock: &Clock, kmac: &mut Kmac, ticks: u64) {
        for _ in 0..ticks {
            clock.increment_and_process_timer_actions(1, kmac);
        }
    }

    fn read_state_bytes(kmac: &mut Kmac, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for word in 0..len.div_ceil(4) {
            let val = kmac.read(RvSize::Word, STATE + 4 * word as u32).unwrap();
            out.extend(val.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_sha3_256_single_shot() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        commit_cfg(&mut kmac, CFG_SHA3_256);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();
        assert_ne!(
            kmac.read(RvSize::Word, STATUS).unwrap() & 0x2, // SHA3_ABSORB
            0
        );
        // "abc"
        kmac.write(RvSize::HalfWord, MSG_FIFO, 0x6261).unwrap();
        kmac.write(RvSize::Byte, MSG_FIFO + 4, 0x63).unwrap();
        kmac.write(RvSize::Word, CMD, CMD_PROCESS).unwrap();
        pump(&clock, &mut kmac, 2 * KMAC_PROCESS_TICKS);
        assert_ne!(
            kmac.read(RvSize::Word, STATUS).unwrap() & 0x4, // SHA3_SQUEEZE
            0
        );
        assert_eq!(
            hex(&read_state_bytes(&mut kmac, 32)),
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
        kmac.write(RvSize::Word, CMD, CMD_DONE).unwrap();
        assert_ne!(kmac.read(RvSize::Word, STATUS).unwrap() & 0x1, 0);
    }

    #[test]
    fn test_manual_run_advances_shake_stream() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        // SHAKE-128: kstrength=0, mode=0b10.
        commit_cfg(&mut kmac, 0b10 << 4);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();
        kmac.write(RvSize::Word, CMD, CMD_PROCESS).unwrap();
        pump(&clock, &mut kmac, 2 * KMAC_PROCESS_TICKS);
        let first = read_state_bytes(&mut kmac, 32);
        assert_eq!(
            hex(&first),
            "7f9c2ba4e88f827d616045507605853ed73b8093f6efbc88eb1a6eacfa66ef26"
        );
        kmac.write(RvSize::Word, CMD, CMD_MANUAL_RUN).unwrap();
        pump(&clock, &mut kmac, 2 * KMAC_PROCESS_TICKS);
        assert_ne!(read_state_bytes(&mut kmac, 32), first);
    }

    #[test]
    fn test_cmd_sequence_error() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        kmac.write(RvSize::Word, CMD, CMD_PROCESS).unwrap();
        let err = kmac.read(RvSize::Word, ERR_CODE).unwrap();
        assert_eq!(err >> 24, 0x04);
        // Interrupt state carries kmac_err.
        assert_ne!(kmac.read(RvSize::Word, 0x00).unwrap() & 0x4, 0);
        // Still idle.
        assert_ne!(kmac.read(RvSize::Word, STATUS).unwrap() & 0x1, 0);
    }

    #[test]
    fn test_unsupported_mode_strength() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        // SHA3-128 is not a thing.
        commit_cfg(&mut kmac, 0);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();
        assert_eq!(kmac.read(RvSize::Word, ERR_CODE).unwrap() >> 24, 0x02);
        assert_ne!(kmac.read(RvSize::Word, STATUS).unwrap() & 0x1, 0);
    }

    #[test]
    fn test_kmac_mode_needs_kmac_function_name() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        // KMAC-128 with a prefix encoding the function name "KMAD".
        let prefix_bytes = [0x01u8, 0x20, b'K', b'M', b'A', b'D', 0x01, 0x00];
        for (ix, chunk) in prefix_bytes.chunks(4).enumerate() {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            kmac.write(RvSize::Word, PREFIX + 4 * ix as u32, word)
                .unwrap();
        }
        commit_cfg(&mut kmac, 1);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();
        assert_eq!(kmac.read(RvSize::Word, ERR_CODE).unwrap() >> 24, 0x01);
    }

    #[test]
    fn test_kmac_mode_with_valid_prefix_starts() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        let prefix_bytes = [0x01u8, 0x20, b'K', b'M', b'A', b'C', 0x01, 0x00];
        for (ix, chunk) in prefix_bytes.chunks(4).enumerate() {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            kmac.write(RvSize::Word, PREFIX + 4 * ix as u32, word)
                .unwrap();
        }
        kmac.write(RvSize::Word, KEY_LEN, 2).unwrap();
        for ix in 0..8 {
            kmac.write(RvSize::Word, 0x40 + 4 * ix, 0x0403_0201).unwrap();
        }
        commit_cfg(&mut kmac, 1);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();
        assert_eq!(kmac.read(RvSize::Word, ERR_CODE).unwrap(), 0);
        assert_ne!(kmac.read(RvSize::Word, STATUS).unwrap() & 0x2, 0);
    }

    #[test]
    fn test_state_reads_zero_before_absorbed() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        commit_cfg(&mut kmac, CFG_SHA3_256);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();
        assert_eq!(kmac.read(RvSize::Word, STATE).unwrap(), 0);
    }

    #[test]
    fn test_shadow_write_mismatch_raises_recov_alert() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        kmac.write(RvSize::Word, CFG_SHADOWED, CFG_SHA3_256).unwrap();
        kmac.write(RvSize::Word, CFG_SHADOWED, CFG_SHA3_256 | 1)
            .unwrap();
        let status = kmac.read(RvSize::Word, STATUS).unwrap();
        assert_ne!(status & (1 << 17), 0);
        // The mismatching value did not commit.
        assert_eq!(kmac.read(RvSize::Word, CFG_SHADOWED).unwrap(), 0);
    }

    #[test]
    fn test_fifo_force_drain_on_overflow() {
        use sha3::{digest::Update, Digest, Sha3_256};

        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        commit_cfg(&mut kmac, CFG_SHA3_256);
        kmac.write(RvSize::Word, CMD, CMD_START).unwrap();

        let mut msg = Vec::new();
        for ix in 0..64u32 {
            kmac.write(RvSize::Word, MSG_FIFO + 4 * (ix % 16), ix).unwrap();
            msg.extend(ix.to_le_bytes());
        }
        kmac.write(RvSize::Word, CMD, CMD_PROCESS).unwrap();
        pump(&clock, &mut kmac, 2 * KMAC_PROCESS_TICKS);

        let mut reference = Sha3_256::new();
        Update::update(&mut reference, &msg);
        let expected: Vec<u8> = reference.finalize().to_vec();
        assert_eq!(read_state_bytes(&mut kmac, 32), expected);
    }

    #[test]
    fn test_app_channel_round_trip() {
        use sha3::{
            digest::{ExtendableOutput, Update, XofReader},
            CShake256, CShake256Core,
        };

        let clock = Clock::new();
        let ports = KmacAppPorts::new(4);
        let mut kmac = Kmac::new(&clock, ports.clone());
        ports
            .borrow_mut()
            .connect(
                0,
                AppCfg {
                    mode: Sha3Mode::CShake,
                    strength: Sha3Strength::L256,
                    func_name: b"ROM_CTRL".to_vec(),
                    customization: Vec::new(),
                    key: None,
                },
            )
            .unwrap();

        let msg = *b"01234567";
        assert!(ports.borrow_mut().request(
            0,
            AppRequest {
                data: msg,
                len: 8,
                last: false,
            }
        ));
        pump(&clock, &mut kmac, 2 * APP_SCAN_TICKS);
        let resp = ports.borrow_mut().take_response(0).unwrap();
        assert!(!resp.done);

        assert!(ports.borrow_mut().request(
            0,
            AppRequest {
                data: [0; 8],
                len: 0,
                last: true,
            }
        ));
        pump(&clock, &mut kmac, 2 * APP_SCAN_TICKS);
        let resp = ports.borrow_mut().take_response(0).unwrap();
        assert!(resp.done);

        let mut reference =
            CShake256::from_core(CShake256Core::new_with_function_name(b"ROM_CTRL", b""));
        reference.update(&msg);
        let mut expected = [0u8; APP_DIGEST_SIZE];
        reference.finalize_xof().read(&mut expected);
        assert_eq!(resp.digest_share0, expected);
        assert_eq!(resp.digest_share1, [0; APP_DIGEST_SIZE]);
    }

    #[test]
    fn test_sw_fifo_push_while_app_active() {
        let clock = Clock::new();
        let ports = KmacAppPorts::new(4);
        let mut kmac = Kmac::new(&clock, ports.clone());
        ports
            .borrow_mut()
            .connect(
                0,
                AppCfg {
                    mode: Sha3Mode::CShake,
                    strength: Sha3Strength::L256,
                    func_name: b"ROM_CTRL".to_vec(),
                    customization: Vec::new(),
                    key: None,
                },
            )
            .unwrap();
        ports.borrow_mut().request(
            0,
            AppRequest {
                data: [0; 8],
                len: 8,
                last: false,
            },
        );
        pump(&clock, &mut kmac, 2 * APP_SCAN_TICKS);
        assert!(kmac.active_app.is_some());
        kmac.write(RvSize::Word, MSG_FIFO, 0).unwrap();
        let err = kmac.read(RvSize::Word, ERR_CODE).unwrap();
        assert_eq!(err >> 24, 0x03);
        assert_eq!(err & 0xff_ffff, 2);
    }

    #[test]
    fn test_connect_is_idempotent_for_identical_cfg() {
        let ports = KmacAppPorts::new(2);
        let cfg = AppCfg {
            mode: Sha3Mode::CShake,
            strength: Sha3Strength::L256,
            func_name: b"ROM_CTRL".to_vec(),
            customization: Vec::new(),
            key: None,
        };
        assert!(ports.borrow_mut().connect(0, cfg.clone()).is_ok());
        assert!(ports.borrow_mut().connect(0, cfg.clone()).is_ok());
        let divergent = AppCfg {
            strength: Sha3Strength::L128,
            ..cfg
        };
        assert!(ports.borrow_mut().connect(0, divergent).is_err());
    }

    #[test]
    fn test_intr_state_w1c() {
        let clock = Clock::new();
        let mut kmac = new_kmac(&clock);
        kmac.write(RvSize::Word, 0x08, 0x7).unwrap(); // INTR_TEST
        assert_eq!(kmac.read(RvSize::Word, 0x00).unwrap(), 0x7);
        kmac.write(RvSize::Word, 0x00, 0x5).unwrap();
        assert_eq!(kmac.read(RvSize::Word, 0x00).unwrap(), 0x2);
    }

    #[test]
    fn test_parse_prefix() {
        let bytes = [0x01u8, 0x20, b'K', b'M', b'A', b'C', 0x01, 0x00];
        let (fname, custom) = parse_prefix(&bytes).unwrap();
        assert_eq!(fname, b"KMAC");
        assert!(custom.is_empty());

        // Truncated encoding.
        assert!(parse_prefix(&[0x01, 0x20, b'K']).is_none());
    }
}
