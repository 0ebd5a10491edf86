//! LEGO UART Messaging Protocol (LUMP): the wire framing, checksum, and
//! connection-lifecycle state machine used to talk to a Powered Up motor or
//! sensor over a plain UART.
//!
//! Message framing (`ev3_uart_get_msg_size`, `ev3_uart_prepare_tx_msg`), the
//! sync/info/ack/data state progression (`pbio_port_lump_sync_thread`), the
//! data send/receive handling (`pbio_port_lump_data_send_thread`,
//! `..._data_recv_thread`), `pbio_port_lump_lump_parse_msg`'s per-type
//! dispatch, `pbio_port_lump_is_ready`, and the absolute/relative motor
//! angle decoding in `pbio_port_lump_handle_known_data` all collapse here
//! into one poll-driven state machine per device (`LumpDevice::poll`) —
//! sync, send, and recv run as phases of that one state machine rather than
//! as separate cooperative threads, since this crate has no protothread
//! runtime of its own.

use crate::angle::Angle;
use crate::error::{Error, Result};
use crate::hal::{IoPoll, Uart};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Largest payload a LUMP message can carry (32 data bytes, matching
/// `LUMP_MAX_MSG_SIZE`), plus 3 bytes of header/command/checksum overhead.
pub const MAX_MSG_SIZE: usize = 32 + 3;
const MAX_DATA_SIZE: usize = 32;

const SYNC_BAUD: u32 = 115_200;
const SLOW_SYNC_BAUD: u32 = 2_400;
const SPEED_MIN: u32 = 2_400;
const SPEED_MAX: u32 = 460_800;
const TYPE_MIN: u8 = 29;
const TYPE_MAX: u8 = 101;

/// Number of bad type-id/checksum retries tolerated while scanning for sync
/// before giving up entirely (named here since the magic number otherwise
/// reads as arbitrary).
const SYNC_TYPE_RETRY_LIMIT: u32 = 10;

const KEEP_ALIVE_TIMEOUT_MS: u32 = 100;

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, defmt::Format)]
#[repr(u8)]
pub enum MsgType {
    Sys = 0x00,
    Cmd = 0x40,
    Info = 0x80,
    Data = 0xC0,
}

const MSG_TYPE_MASK: u8 = 0xC0;
const MSG_CMD_MASK: u8 = 0x07;
const MSG_SIZE_MASK: u8 = 0x38;

fn msg_type(header: u8) -> Option<MsgType> {
    MsgType::try_from(header & MSG_TYPE_MASK).ok()
}

fn msg_size_field(header: u8) -> usize {
    1usize << ((header & MSG_SIZE_MASK) >> 3)
}

/// Full frame size (header + payload + checksum, plus the extra command
/// byte an INFO message carries), matching `ev3_uart_get_msg_size`.
fn frame_size(header: u8) -> usize {
    match msg_type(header) {
        Some(MsgType::Sys) => 1,
        Some(MsgType::Info) => msg_size_field(header) + 3,
        _ => msg_size_field(header) + 2,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum SysCmd {
    Sync = 0x00,
    Nack = 0x02,
    Ack = 0x04,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum Cmd {
    Type = 0x00,
    Modes = 0x01,
    Speed = 0x02,
    Select = 0x03,
    Write = 0x04,
    ExtMode = 0x06,
    Version = 0x07,
}

/// Sub-commands of an INFO message, selected by the payload's first byte
/// (`cmd2` in `pbio_port_lump_lump_parse_msg`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum InfoCmd {
    Name = 0x00,
    Raw = 0x01,
    Pct = 0x02,
    Si = 0x03,
    Units = 0x04,
    Mapping = 0x05,
    ModeCombos = 0x06,
    Unk7 = 0x07,
    Unk8 = 0x08,
    Unk9 = 0x09,
    Format = 0x80,
}

/// A mode's wire-format shape, reported by the FORMAT/MAPPING INFO
/// sub-commands and needed before data for that mode can be trusted or
/// written. `pbio_port_lump_mode_info_t` in the original.
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive, defmt::Format)]
#[repr(u8)]
pub enum DataType {
    Data8 = 0,
    Data16 = 1,
    Data32 = 2,
    DataF = 3,
}

impl DataType {
    /// Byte width of one value, matching `pbio_port_lump_data_size`.
    fn size_bytes(self) -> usize {
        match self {
            DataType::Data8 => 1,
            DataType::Data16 => 2,
            DataType::Data32 | DataType::DataF => 4,
        }
    }
}

/// Maximum mode index this crate tracks per-mode metadata for (0..=15: the
/// original 3-bit EV3 mode space plus the Powered Up `ext_mode` extension).
const MAX_MODES: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
struct ModeInfo {
    data_type: DataType,
    num_values: u8,
    writable: bool,
}

impl Default for ModeInfo {
    fn default() -> Self {
        ModeInfo {
            data_type: DataType::Data8,
            num_values: 0,
            writable: false,
        }
    }
}

bitflags::bitflags! {
    /// Which required pieces of a device's mode-0 INFO handshake have been
    /// received, mirroring `ev3_uart_info_flags`'s `REQUIRED` subset (the
    /// crate doesn't track the optional RAW/PCT/SI/UNITS/MODE_COMBOS/UNKx
    /// bits since nothing here reads them).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct InfoFlags: u8 {
        const CMD_TYPE    = 0x01;
        const CMD_MODES   = 0x02;
        const INFO_NAME   = 0x04;
        const INFO_FORMAT = 0x08;
        const REQUIRED = Self::CMD_TYPE.bits() | Self::CMD_MODES.bits() | Self::INFO_NAME.bits() | Self::INFO_FORMAT.bits();
    }
}

bitflags::bitflags! {
    /// Capability bits reported in a device's NAME info message.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const ABS_POS = 0x01;
    }
}

impl Capabilities {
    pub fn has_abs_pos(self) -> bool {
        self.contains(Self::ABS_POS)
    }

    /// Merges in a raw capability byte, keeping unrecognized bits intact
    /// rather than truncating them, since future device firmwares may set
    /// flags this crate doesn't interpret.
    fn merge(self, byte: u8) -> Capabilities {
        self.union(Capabilities::from_bits_retain(byte))
    }
}

impl defmt::Format for Capabilities {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "Capabilities({=u8:b})", self.bits())
    }
}

/// Connection lifecycle of a LUMP device, mirroring
/// `pbdrv_legodev_lump_status_t`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
enum Status {
    Err,
    Syncing,
    Info,
    Ack,
    Data,
}

/// Sub-phase within [`Status::Syncing`]/[`Status::Info`], tracking exactly
/// where the poll-driven state machine is inside one logical
/// read-or-write step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, defmt::Format)]
enum Phase {
    SendSpeedCmd,
    AwaitAckByte,
    ScanForTypeByte,
    ReadTypeRest,
    ReadInfoHeader,
    ReadInfoRest,
    SendAck,
    AwaitBaudSettle { until_ms: u32 },
    SendDefaultModeRequest,
    Idle,
}

#[derive(Debug, Copy, Clone, Default, defmt::Format)]
struct ModeSwitch {
    desired_mode: u8,
    requested: bool,
    time_ms: u32,
}

#[derive(Debug, Copy, Clone, defmt::Format)]
struct DataSet {
    bin_data: [u8; MAX_DATA_SIZE],
    size: u8,
    desired_mode: u8,
    time_ms: u32,
}

impl Default for DataSet {
    fn default() -> Self {
        DataSet {
            bin_data: [0; MAX_DATA_SIZE],
            size: 0,
            desired_mode: 0,
            time_ms: 0,
        }
    }
}

/// True if this is the motor type reporting an absolute angle in mode 0
/// (`LEGO_DEVICE_MODE_PUP_ABS_MOTOR__CALIB`), the only mode relevant to
/// this crate's angle tracking.
fn is_absolute_motor(_type_id: u8, mode: u8, capabilities: Capabilities) -> bool {
    capabilities.has_abs_pos() && mode == 0
}

/// True if this is an interactive (relative-encoder) motor reporting
/// incremental position in mode 2 (`LEGO_DEVICE_MODE_PUP_REL_MOTOR__POS`).
fn is_relative_motor(type_id: u8, mode: u8) -> bool {
    type_id == 38 && mode == 2
}

/// Updates `angle` from a freshly-received DATA payload, mirroring
/// `pbio_port_lump_handle_known_data`'s absolute/relative-motor cases.
fn update_angle_from_data(angle: &mut Angle, type_id: u8, mode: u8, capabilities: Capabilities, payload: &[u8]) {
    if is_absolute_motor(type_id, mode, capabilities) && payload.len() >= 2 {
        let raw = i16::from_le_bytes([payload[0], payload[1]]) as i32;
        let abs_mdeg = raw * 100;
        let abs_prev = angle.millidegrees;
        angle.millidegrees = abs_mdeg;
        if abs_prev > 270_000 && abs_mdeg < 90_000 {
            angle.rotations += 1;
        }
        if abs_prev < 90_000 && abs_mdeg > 270_000 {
            angle.rotations -= 1;
        }
    } else if is_relative_motor(type_id, mode) && payload.len() >= 4 {
        let degrees = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        angle.millidegrees = degrees.rem_euclid(360) * 1_000;
        angle.rotations = degrees.div_euclid(360);
    }
}

/// Computes the frame checksum: XOR of every byte including the header,
/// seeded with `0xFF`, matching `ev3_uart_prepare_tx_msg`/
/// `pbio_port_lump_lump_parse_msg`.
fn checksum(frame_without_checksum: &[u8]) -> u8 {
    frame_without_checksum.iter().fold(0xFFu8, |acc, &b| acc ^ b)
}

/// Validates a received frame's checksum, special-casing the EV3 colour
/// sensor's known-bad RGB-raw checksum (mode 4, 8-byte DATA frame): once
/// already in the `Data` state, a bad checksum there is tolerated since the
/// payload is just dropped rather than applied, so a persistently wrong
/// checksum never affects correctness.
fn checksum_is_acceptable(frame: &[u8], already_syncing_data: bool, type_id: u8, header: u8) -> bool {
    if frame.len() < 2 {
        return true;
    }
    let expected = checksum(&frame[..frame.len() - 1]);
    if expected == frame[frame.len() - 1] {
        return true;
    }
    already_syncing_data && type_id == 29 && header == (0xC0 | (3 << 3) | 4)
}

/// Builds a LUMP frame in `out`, returning its length. Mirrors
/// `ev3_uart_prepare_tx_msg`, minus the Powered-Up `EXT_MODE` prefix (data
/// writes to modes beyond 7 aren't needed by this crate's device set).
fn prepare_frame(out: &mut [u8; MAX_MSG_SIZE], msg_type: MsgType, cmd: u8, data: &[u8]) -> usize {
    let len = match data.len() {
        0 | 1 => 1,
        2 => 2,
        n if n <= 4 => 4,
        n if n <= 8 => 8,
        n if n <= 16 => 16,
        _ => 32,
    };
    let size_code = (len.trailing_zeros() as u8) << 3;
    let header = (msg_type as u8) | size_code | (cmd & MSG_CMD_MASK);
    out[0] = header;
    let mut cksum = 0xFFu8 ^ header;
    for i in 0..len {
        let b = data.get(i).copied().unwrap_or(0);
        out[1 + i] = b;
        cksum ^= b;
    }
    out[1 + len] = cksum;
    2 + len
}

/// One LUMP-connected device's lifecycle, buffers, and decoded state.
pub struct LumpDevice {
    status: Status,
    phase: Phase,
    type_id: u8,
    mode: u8,
    ext_mode: u8,
    capabilities: Capabilities,
    num_modes: u8,
    mode_info: [ModeInfo; MAX_MODES],
    /// Mode the most recent NAME INFO was for, awaiting its FORMAT/MAPPING
    /// follow-up. `new_mode` in the original.
    new_mode: u8,
    info_flags: InfoFlags,
    new_baud_rate: u32,
    err_count: u32,
    data_rec: bool,
    angle: Angle,
    mode_switch: ModeSwitch,
    data_set: DataSet,
    bin_data: [u8; MAX_DATA_SIZE],
    bin_data_len: u8,
    keep_alive_deadline_ms: u32,

    rx_buf: [u8; MAX_MSG_SIZE],
    rx_have: usize,
    rx_want: usize,
    tx_buf: [u8; MAX_MSG_SIZE],
    tx_len: usize,
}

impl LumpDevice {
    pub fn new() -> Self {
        LumpDevice {
            status: Status::Err,
            phase: Phase::SendSpeedCmd,
            type_id: 0,
            mode: 0,
            ext_mode: 0,
            capabilities: Capabilities::empty(),
            num_modes: 1,
            mode_info: [ModeInfo::default(); MAX_MODES],
            new_mode: 0,
            info_flags: InfoFlags::empty(),
            new_baud_rate: SYNC_BAUD,
            err_count: 0,
            data_rec: false,
            angle: Angle::ZERO,
            mode_switch: ModeSwitch::default(),
            data_set: DataSet::default(),
            bin_data: [0; MAX_DATA_SIZE],
            bin_data_len: 0,
            keep_alive_deadline_ms: 0,
            rx_buf: [0; MAX_MSG_SIZE],
            rx_have: 0,
            rx_want: 0,
            tx_buf: [0; MAX_MSG_SIZE],
            tx_len: 0,
        }
    }

    /// Drops the connection and restarts the sync handshake from scratch,
    /// matching `pbio_port_lump_sync_thread`'s reset-and-retry on entry and
    /// `pbio_port_lump_request_reset`'s external trigger.
    pub fn request_reset(&mut self) -> Result<()> {
        self.is_ready()?;
        self.reset_for_resync();
        Ok(())
    }

    fn reset_for_resync(&mut self) {
        self.status = Status::Err;
        self.phase = Phase::SendSpeedCmd;
        self.type_id = 0;
        self.mode = 0;
        self.ext_mode = 0;
        self.capabilities = Capabilities::empty();
        self.num_modes = 1;
        self.mode_info = [ModeInfo::default(); MAX_MODES];
        self.new_mode = 0;
        self.info_flags = InfoFlags::empty();
        self.new_baud_rate = SYNC_BAUD;
        self.err_count = 0;
        self.data_rec = false;
        self.mode_switch = ModeSwitch::default();
        self.data_set = DataSet::default();
        self.rx_have = 0;
        self.rx_want = 0;
        self.tx_len = 0;
    }

    pub fn is_ready(&self) -> Result<()> {
        match self.status {
            Status::Err => Err(Error::NoDev),
            Status::Data => {
                if self.mode != self.mode_switch.desired_mode {
                    return Err(Error::Again);
                }
                if self.data_set.size > 0 {
                    return Err(Error::Again);
                }
                Ok(())
            }
            _ => Err(Error::Again),
        }
    }

    pub fn type_id(&self) -> u8 {
        self.type_id
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn assert_type_id(&self, expected: u8) -> Result<u8> {
        self.is_ready()?;
        if expected != self.type_id {
            return Err(Error::NoDev);
        }
        Ok(self.type_id)
    }

    pub fn get_angle(&self, get_abs_angle: bool) -> Result<Angle> {
        self.is_ready()?;
        if !is_relative_motor(self.type_id, self.mode) && !is_absolute_motor(self.type_id, self.mode, self.capabilities) {
            return Err(Error::NoDev);
        }
        if get_abs_angle {
            if !is_absolute_motor(self.type_id, self.mode, self.capabilities) {
                return Err(Error::NotSupported);
            }
            let mut mdeg = self.angle.millidegrees;
            if mdeg >= 180_000 {
                mdeg -= 360_000;
            }
            return Ok(Angle::new(0, mdeg));
        }
        Ok(self.angle)
    }

    pub fn set_mode(&mut self, mode: u8) -> Result<()> {
        if self.mode_switch.desired_mode == mode || self.mode == mode {
            return Ok(());
        }
        self.is_ready()?;
        if mode >= self.num_modes {
            return Err(Error::InvalidArg);
        }
        self.mode_switch.desired_mode = mode;
        self.mode_switch.requested = true;
        Ok(())
    }

    pub fn get_data(&self, mode: u8) -> Result<&[u8]> {
        if mode != self.mode {
            return Err(Error::InvalidOp);
        }
        self.is_ready()?;
        Ok(&self.bin_data[..self.bin_data_len as usize])
    }

    pub fn set_mode_with_data(&mut self, mode: u8, data: &[u8]) -> Result<()> {
        if data.len() > MAX_DATA_SIZE {
            return Err(Error::InvalidArg);
        }
        let info = self.mode_info.get(mode as usize).copied().unwrap_or_default();
        if !info.writable || data.len() != info.num_values as usize * info.data_type.size_bytes() {
            return Err(Error::InvalidOp);
        }
        self.set_mode(mode)?;
        self.data_set.size = data.len() as u8;
        self.data_set.desired_mode = mode;
        self.data_set.bin_data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Parses one complete, checksum-valid frame already sitting in
    /// `rx_buf[..len]`, updating device state the way
    /// `pbio_port_lump_lump_parse_msg` dispatches on message type.
    fn parse_frame(&mut self, len: usize, now_ms: u32) {
        let header = self.rx_buf[0];
        let Some(kind) = msg_type(header) else { return };
        let cmd = header & MSG_CMD_MASK;

        match kind {
            MsgType::Sys => {
                if cmd == SysCmd::Ack as u8 {
                    // Refuse the handshake unless every mandatory piece of
                    // the mode-0 INFO exchange has actually arrived, per
                    // `EV3_UART_INFO_FLAG_REQUIRED`.
                    if self.num_modes == 0 || !self.info_flags.contains(InfoFlags::REQUIRED) {
                        return;
                    }
                    self.status = Status::Ack;
                }
            }
            MsgType::Cmd => match cmd {
                c if c == Cmd::Modes as u8 => {
                    let cmd2 = self.rx_buf[1];
                    self.num_modes = cmd2.saturating_add(1).min(MAX_MODES as u8);
                    self.info_flags.insert(InfoFlags::CMD_MODES);
                }
                c if c == Cmd::Speed as u8 => {
                    let speed = u32::from_le_bytes([self.rx_buf[1], self.rx_buf[2], self.rx_buf[3], self.rx_buf[4]]);
                    if (SPEED_MIN..=SPEED_MAX).contains(&speed) {
                        self.new_baud_rate = speed;
                    }
                }
                c if c == Cmd::ExtMode as u8 => {
                    self.ext_mode = self.rx_buf[1];
                }
                _ => {}
            },
            MsgType::Info => {
                let mode = (cmd + self.ext_mode) as usize;
                if mode >= MAX_MODES {
                    return;
                }
                match self.rx_buf[1] {
                    c if c == InfoCmd::Name as u8 => {
                        // NAME is a variable-length string starting at byte
                        // 2; the capability byte (if present, newer
                        // firmwares only) is the first of six optional flag
                        // bytes right after it, matching `rx_msg[8]`.
                        self.new_mode = mode as u8;
                        self.info_flags.remove(
                            InfoFlags::INFO_NAME | InfoFlags::INFO_FORMAT,
                        );
                        self.info_flags.insert(InfoFlags::INFO_NAME);
                        if len > 9 {
                            self.capabilities = self.capabilities.merge(self.rx_buf[8]);
                        }
                    }
                    c if c == InfoCmd::Mapping as u8 => {
                        if self.new_mode as usize != mode {
                            return;
                        }
                        self.mode_info[mode].writable = self.rx_buf[3] != 0;
                    }
                    c if c == InfoCmd::Format as u8 => {
                        if self.new_mode as usize != mode {
                            return;
                        }
                        let num_values = self.rx_buf[2];
                        if num_values == 0 || len < 7 {
                            return;
                        }
                        if !self.info_flags.contains(InfoFlags::REQUIRED - InfoFlags::INFO_FORMAT) {
                            return;
                        }
                        let Ok(data_type) = DataType::try_from(self.rx_buf[3]) else {
                            return;
                        };
                        self.mode_info[mode].num_values = num_values;
                        self.mode_info[mode].data_type = data_type;
                        self.info_flags.insert(InfoFlags::INFO_FORMAT);
                    }
                    _ => {}
                }
            }
            MsgType::Data => {
                if !matches!(self.status, Status::Data) {
                    return;
                }
                let mode = cmd + self.ext_mode;
                if mode == self.mode_switch.desired_mode {
                    let payload_len = len - 2;
                    let n = payload_len.min(MAX_DATA_SIZE);
                    self.bin_data[..n].copy_from_slice(&self.rx_buf[1..1 + n]);
                    self.bin_data_len = n as u8;
                    if self.mode != mode {
                        self.mode_switch.time_ms = now_ms;
                    }
                }
                self.mode = mode;
                update_angle_from_data(&mut self.angle, self.type_id, self.mode, self.capabilities, &self.bin_data[..self.bin_data_len as usize]);
                self.data_rec = true;
            }
        }
    }

    /// Advances the connection/data state machine by however many bytes
    /// `uart` has ready right now. Should be called frequently (every
    /// control tick is fine) from the port scheduler; it never blocks.
    pub fn poll(&mut self, uart: &mut impl Uart, now_ms: u32) -> Result<()> {
        match self.status {
            Status::Err => self.poll_sync_start(uart),
            Status::Syncing => self.poll_syncing(uart, now_ms),
            Status::Info => self.poll_info(uart),
            Status::Ack => self.poll_ack(uart, now_ms),
            Status::Data => self.poll_data(uart, now_ms),
        }
    }

    fn poll_sync_start(&mut self, uart: &mut impl Uart) -> Result<()> {
        self.reset_for_resync();
        uart.set_baud(SYNC_BAUD)?;
        self.tx_len = prepare_frame(&mut self.tx_buf, MsgType::Cmd, Cmd::Speed as u8, &SYNC_BAUD.to_le_bytes());
        self.status = Status::Syncing;
        self.phase = Phase::SendSpeedCmd;
        self.rx_have = 0;
        self.rx_want = 1;
        Ok(())
    }

    fn poll_syncing(&mut self, uart: &mut impl Uart, now_ms: u32) -> Result<()> {
        match self.phase {
            Phase::SendSpeedCmd => {
                if let IoPoll::Ready(()) = uart.poll_write(&self.tx_buf[..self.tx_len])? {
                    uart.flush();
                    self.phase = Phase::AwaitAckByte;
                    self.rx_have = 0;
                    self.rx_want = 1;
                }
            }
            Phase::AwaitAckByte => {
                if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[..1])? {
                    if self.rx_buf[0] != SysCmd::Ack as u8 {
                        uart.set_baud(SLOW_SYNC_BAUD)?;
                    }
                    self.phase = Phase::ScanForTypeByte;
                    self.rx_have = 0;
                    self.rx_want = 1;
                }
            }
            Phase::ScanForTypeByte => {
                if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[..1])? {
                    if self.rx_buf[0] == (MsgType::Cmd as u8 | Cmd::Type as u8) {
                        self.phase = Phase::ReadTypeRest;
                        self.rx_have = 1;
                        self.rx_want = 3;
                    }
                    // else: stay in ScanForTypeByte, drop the byte.
                }
            }
            Phase::ReadTypeRest => {
                let have = self.rx_have;
                if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[have..3])? {
                    let type_byte = self.rx_buf[1];
                    let bad_id = !(TYPE_MIN..=TYPE_MAX).contains(&type_byte);
                    let expected = checksum(&self.rx_buf[..2]);
                    let bad_checksum = self.rx_buf[2] != expected;
                    if bad_id || bad_checksum {
                        self.err_count += 1;
                        if self.err_count > SYNC_TYPE_RETRY_LIMIT {
                            self.status = Status::Err;
                            return Err(Error::Failed);
                        }
                        self.phase = Phase::ScanForTypeByte;
                        self.rx_have = 0;
                        self.rx_want = 1;
                        return Ok(());
                    }
                    self.type_id = type_byte;
                    self.data_rec = false;
                    self.err_count = 0;
                    self.info_flags = InfoFlags::CMD_TYPE;
                    self.num_modes = 1;
                    self.status = Status::Info;
                    self.phase = Phase::ReadInfoHeader;
                    self.rx_have = 0;
                    self.rx_want = 1;
                } else {
                    self.rx_have = have;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn poll_info(&mut self, uart: &mut impl Uart) -> Result<()> {
        match self.phase {
            Phase::ReadInfoHeader => {
                if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[..1])? {
                    let total = frame_size(self.rx_buf[0]).min(MAX_MSG_SIZE);
                    self.rx_have = 1;
                    self.rx_want = total;
                    if total <= 1 {
                        self.parse_frame(total, 0);
                        self.phase = Phase::ReadInfoHeader;
                        self.rx_have = 0;
                        self.rx_want = 1;
                    } else {
                        self.phase = Phase::ReadInfoRest;
                    }
                }
            }
            Phase::ReadInfoRest => {
                let have = self.rx_have;
                let want = self.rx_want;
                if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[have..want])? {
                    if checksum_is_acceptable(&self.rx_buf[..want], false, self.type_id, self.rx_buf[0]) {
                        self.parse_frame(want, 0);
                    }
                    if matches!(self.status, Status::Info) {
                        self.phase = Phase::ReadInfoHeader;
                        self.rx_have = 0;
                        self.rx_want = 1;
                    }
                } else {
                    self.rx_have = have;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn poll_ack(&mut self, uart: &mut impl Uart, now_ms: u32) -> Result<()> {
        match self.phase {
            Phase::AwaitBaudSettle { until_ms } => {
                if now_ms >= until_ms {
                    uart.set_baud(self.new_baud_rate)?;
                    self.request_default_mode();
                    self.data_set.time_ms = now_ms.wrapping_sub(1_000);
                    self.data_set.size = 0;
                    self.status = Status::Data;
                    self.keep_alive_deadline_ms = now_ms + 1;
                    self.phase = Phase::Idle;
                }
                Ok(())
            }
            _ => {
                self.tx_buf[0] = SysCmd::Ack as u8;
                self.tx_len = 1;
                if let IoPoll::Ready(()) = uart.poll_write(&self.tx_buf[..self.tx_len])? {
                    self.phase = Phase::AwaitBaudSettle { until_ms: now_ms + 10 };
                }
                Ok(())
            }
        }
    }

    fn request_default_mode(&mut self) {
        let default_mode = if self.capabilities.has_abs_pos() {
            0
        } else if self.type_id == 38 {
            2
        } else {
            return;
        };
        self.mode_switch.desired_mode = default_mode;
        self.mode_switch.requested = true;
    }

    fn poll_data(&mut self, uart: &mut impl Uart, now_ms: u32) -> Result<()> {
        self.poll_data_send(uart, now_ms)?;
        self.poll_data_recv(uart, now_ms)
    }

    fn poll_data_send(&mut self, uart: &mut impl Uart, now_ms: u32) -> Result<()> {
        if now_ms >= self.keep_alive_deadline_ms {
            self.data_rec = false;
            self.tx_buf[0] = SysCmd::Nack as u8;
            if let IoPoll::Ready(()) = uart.poll_write(&self.tx_buf[..1])? {
                self.keep_alive_deadline_ms = now_ms + KEEP_ALIVE_TIMEOUT_MS;
            }
            return Ok(());
        }

        if self.mode_switch.requested {
            self.mode_switch.requested = false;
            self.mode_switch.time_ms = now_ms;
            let len = prepare_frame(&mut self.tx_buf, MsgType::Cmd, Cmd::Select as u8, &[self.mode_switch.desired_mode]);
            self.tx_len = len;
            let _ = uart.poll_write(&self.tx_buf[..self.tx_len])?;
            return Ok(());
        }

        if self.data_set.size > 0 {
            if self.mode == self.data_set.desired_mode {
                let size = self.data_set.size as usize;
                let len = prepare_frame(&mut self.tx_buf, MsgType::Data, self.data_set.desired_mode, &self.data_set.bin_data[..size]);
                self.tx_len = len;
                self.data_set.size = 0;
                self.data_set.time_ms = now_ms;
                let _ = uart.poll_write(&self.tx_buf[..self.tx_len])?;
            } else if now_ms.wrapping_sub(self.data_set.time_ms) >= 500 {
                self.data_set.size = 0;
            }
        }
        Ok(())
    }

    fn poll_data_recv(&mut self, uart: &mut impl Uart, now_ms: u32) -> Result<()> {
        if self.rx_want == 0 {
            self.rx_have = 0;
            self.rx_want = 1;
        }
        if self.rx_have < 1 {
            if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[..1])? {
                let total = frame_size(self.rx_buf[0]);
                if total < 3 || total > MAX_MSG_SIZE {
                    self.rx_have = 0;
                    return Ok(());
                }
                self.rx_have = 1;
                self.rx_want = total;
            }
            return Ok(());
        }
        let have = self.rx_have;
        let want = self.rx_want;
        if have < want {
            if let IoPoll::Ready(()) = uart.poll_read(&mut self.rx_buf[have..want])? {
                if checksum_is_acceptable(&self.rx_buf[..want], true, self.type_id, self.rx_buf[0]) {
                    self.parse_frame(want, now_ms);
                }
                self.rx_have = 0;
                self.rx_want = 1;
            } else {
                self.rx_have = have;
            }
        }
        Ok(())
    }
}

impl Default for LumpDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips() {
        let mut out = [0u8; MAX_MSG_SIZE];
        let len = prepare_frame(&mut out, MsgType::Cmd, Cmd::Speed as u8, &115_200u32.to_le_bytes());
        assert!(checksum_is_acceptable(&out[..len], false, 0, out[0]));
    }

    #[test]
    fn ev3_color_sensor_rgb_raw_bad_checksum_is_tolerated_once_in_data_state() {
        let header = 0xC0 | (3 << 3) | 4;
        // Checksum byte (last) is deliberately wrong; the EV3 colour sensor
        // quirk tolerates this for exactly this (type 29, mode 4) frame.
        let frame = [header, 1, 2, 3, 4, 5, 6, 7, 8, 0xAA];
        assert!(checksum_is_acceptable(&frame, true, 29, header));
        // Outside the DATA state the quirk doesn't apply.
        assert!(!checksum_is_acceptable(&frame, false, 29, header));
    }

    #[test]
    fn non_color_sensor_bad_checksum_in_data_state_is_rejected() {
        let header = 0xC0 | (3 << 3) | 4;
        let frame = [header, 1, 2, 3, 4, 5, 6, 7, 8, 0xAA];
        assert!(!checksum_is_acceptable(&frame, true, 39, header));
    }

    #[test]
    fn absolute_motor_angle_wraps_forward_past_zero() {
        let mut angle = Angle::new(0, 350_000);
        let caps = Capabilities::ABS_POS;
        update_angle_from_data(&mut angle, 0, 0, caps, &10i16.to_le_bytes());
        // 10 decidegrees -> 1000 mdeg, wrapping past 360 degrees.
        assert_eq!(angle.millidegrees, 1_000);
        assert_eq!(angle.rotations, 1);
    }

    #[test]
    fn absolute_motor_angle_wraps_backward_past_zero() {
        let mut angle = Angle::new(0, 1_000);
        let caps = Capabilities::ABS_POS;
        update_angle_from_data(&mut angle, 0, 0, caps, &3_550i16.to_le_bytes());
        assert_eq!(angle.millidegrees, 355_000);
        assert_eq!(angle.rotations, -1);
    }

    #[test]
    fn relative_motor_decodes_whole_degrees() {
        let mut angle = Angle::ZERO;
        update_angle_from_data(&mut angle, 38, 2, Capabilities::empty(), &400i32.to_le_bytes());
        assert_eq!(angle.rotations, 1);
        assert_eq!(angle.millidegrees, 40_000);
    }

    #[test]
    fn is_ready_reports_no_dev_before_sync() {
        let dev = LumpDevice::new();
        assert_eq!(dev.is_ready(), Err(Error::NoDev));
    }

    #[test]
    fn is_ready_reports_again_while_mode_switch_pending() {
        let mut dev = LumpDevice::new();
        dev.status = Status::Data;
        dev.mode = 0;
        dev.mode_switch.desired_mode = 1;
        assert_eq!(dev.is_ready(), Err(Error::Again));
    }

    #[test]
    fn set_mode_rejects_out_of_range_mode() {
        let mut dev = LumpDevice::new();
        dev.status = Status::Data;
        dev.num_modes = 2;
        assert_eq!(dev.set_mode(5), Err(Error::InvalidArg));
    }

    fn feed(dev: &mut LumpDevice, msg_type: MsgType, cmd: u8, data: &[u8]) {
        let mut out = [0u8; MAX_MSG_SIZE];
        let len = prepare_frame(&mut out, msg_type, cmd, data);
        dev.rx_buf[..len].copy_from_slice(&out[..len]);
        dev.parse_frame(len, 0);
    }

    #[test]
    fn ack_is_refused_until_modes_name_and_format_all_arrive() {
        let mut dev = LumpDevice::new();
        dev.status = Status::Info;
        dev.type_id = 39;
        dev.info_flags = InfoFlags::CMD_TYPE;
        dev.num_modes = 0;

        dev.rx_buf[0] = SysCmd::Ack as u8;
        dev.parse_frame(1, 0);
        assert_eq!(dev.status, Status::Info);

        feed(&mut dev, MsgType::Cmd, Cmd::Modes as u8, &[0]);
        dev.rx_buf[0] = SysCmd::Ack as u8;
        dev.parse_frame(1, 0);
        assert_eq!(dev.status, Status::Info, "NAME/FORMAT still missing");

        feed(&mut dev, MsgType::Info, 0, &[InfoCmd::Name as u8, b'M', b'o', b't']);
        dev.rx_buf[0] = SysCmd::Ack as u8;
        dev.parse_frame(1, 0);
        assert_eq!(dev.status, Status::Info, "FORMAT still missing");

        feed(&mut dev, MsgType::Info, 0, &[InfoCmd::Format as u8, 1, DataType::Data16 as u8, 0, 0]);
        dev.rx_buf[0] = SysCmd::Ack as u8;
        dev.parse_frame(1, 0);
        assert_eq!(dev.status, Status::Ack);
    }

    #[test]
    fn format_info_populates_the_mode_table() {
        let mut dev = LumpDevice::new();
        dev.status = Status::Info;
        dev.type_id = 39;
        dev.info_flags = InfoFlags::CMD_TYPE;

        feed(&mut dev, MsgType::Cmd, Cmd::Modes as u8, &[0]);
        feed(&mut dev, MsgType::Info, 0, &[InfoCmd::Name as u8, b'M', b'o', b't']);
        feed(&mut dev, MsgType::Info, 0, &[InfoCmd::Mapping as u8, 0, 0xFF]);
        feed(&mut dev, MsgType::Info, 0, &[InfoCmd::Format as u8, 2, DataType::Data16 as u8, 0, 0]);

        let info = dev.mode_info[0];
        assert_eq!(info.num_values, 2);
        assert_eq!(info.data_type, DataType::Data16);
        assert!(info.writable);
    }

    #[test]
    fn format_info_for_a_stale_mode_is_ignored() {
        let mut dev = LumpDevice::new();
        dev.status = Status::Info;
        dev.type_id = 39;
        dev.info_flags = InfoFlags::CMD_TYPE;

        feed(&mut dev, MsgType::Cmd, Cmd::Modes as u8, &[1]);
        feed(&mut dev, MsgType::Info, 0, &[InfoCmd::Name as u8, b'M', b'o', b't']);
        // FORMAT addressed to mode 1 while new_mode is still 0: dropped.
        feed(&mut dev, MsgType::Info, 1, &[InfoCmd::Format as u8, 2, DataType::Data16 as u8, 0, 0]);

        assert_eq!(dev.mode_info[1].num_values, 0);
        assert!(!dev.info_flags.contains(InfoFlags::INFO_FORMAT));
    }

    #[test]
    fn set_mode_with_data_rejects_wrong_size_and_non_writable_modes() {
        let mut dev = LumpDevice::new();
        dev.status = Status::Data;
        dev.num_modes = 2;
        dev.mode = 0;
        dev.mode_switch.desired_mode = 0;

        dev.mode_info[0] = ModeInfo {
            data_type: DataType::Data16,
            num_values: 2,
            writable: false,
        };
        assert_eq!(dev.set_mode_with_data(0, &[0, 0, 0, 0]), Err(Error::InvalidOp));

        dev.mode_info[0].writable = true;
        assert_eq!(dev.set_mode_with_data(0, &[0, 0]), Err(Error::InvalidOp));
        assert!(dev.set_mode_with_data(0, &[0, 0, 0, 0]).is_ok());
    }
}
