// lib.rs — shared LoRa link protocol: wire framing, MAC sealing, time service

pub mod fec;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

// =============================== Constants ==================================

/// Mission/station identifier stamped on every outbound packet.
pub const MISSION_ID: u8 = 0x01;

/// ECC tag byte: frame payload is Reed-Solomon encoded.
pub const RS_ON: u8 = 0xAA;
/// ECC tag byte: frame payload is plain.
pub const RS_OFF: u8 = 0x55;

/// Serialized header size: station, ecc, command, payload_length,
/// time_unix (u32 BE), MAC (u32 BE).
pub const HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD_LEN: usize = 98;
pub const MAX_FRAME_LEN: usize = 128;

/// HMAC-SHA256 key. A 4-byte key is deliberately part of the wire contract;
/// both ends must reproduce it bit-exactly.
pub const SECRET_KEY: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];

/// 2025-01-01T00:00:00Z, the clock value before the first TEC_SET_TIME.
pub const EPOCH_UNIX: u32 = 1_735_689_600;

// ============================= Command codes ================================

/// Telecommands (uplink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tec {
    ObcReboot = 0x01,
    ExitState = 0x02,
    VarChange = 0x03,
    SetTime = 0x04,
    EpsReboot = 0x08,
    AdcsReboot = 0x10,
    AdcsTle = 0x11,
    LoraState = 0x18,
    LoraConfig = 0x19,
    LoraPing = 0x1A,
    CryExp = 0x80,
}

/// Telemetry replies (downlink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ter {
    Beacon = 0x30,
    Ack = 0x31,
    Nack = 0x32,
    LoraLink = 0x33,
}

impl Tec {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ObcReboot),
            0x02 => Some(Self::ExitState),
            0x03 => Some(Self::VarChange),
            0x04 => Some(Self::SetTime),
            0x08 => Some(Self::EpsReboot),
            0x10 => Some(Self::AdcsReboot),
            0x11 => Some(Self::AdcsTle),
            0x18 => Some(Self::LoraState),
            0x19 => Some(Self::LoraConfig),
            0x1A => Some(Self::LoraPing),
            0x80 => Some(Self::CryExp),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Ter {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x30 => Some(Self::Beacon),
            0x31 => Some(Self::Ack),
            0x32 => Some(Self::Nack),
            0x33 => Some(Self::LoraLink),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The command byte of a packet, either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    Tec(Tec),
    Ter(Ter),
}

impl CommandCode {
    pub fn from_code(code: u8) -> Option<Self> {
        Tec::from_code(code)
            .map(Self::Tec)
            .or_else(|| Ter::from_code(code).map(Self::Ter))
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Tec(t) => t.code(),
            Self::Ter(t) => t.code(),
        }
    }
}

impl From<Tec> for CommandCode {
    fn from(t: Tec) -> Self {
        Self::Tec(t)
    }
}

impl From<Ter> for CommandCode {
    fn from(t: Ter) -> Self {
        Self::Ter(t)
    }
}

// ================================ Errors ====================================

/// Protocol error taxonomy. The numeric codes go out on the wire as the
/// second NACK payload byte, so they are part of the contract.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("garbled RS flag byte")]
    Rs,
    #[error("RS block uncorrectable")]
    Decode,
    #[error("framing length mismatch")]
    Length,
    #[error("authentication failure")]
    Mac,
    #[error("command queue saturated")]
    CmdFull,
    #[error("internal command pointer error")]
    CmdPointer,
    #[error("unknown command code")]
    CmdUnknown,
    #[error("command payload out of range")]
    CmdPayload,
    #[error("command allocation failure")]
    CmdMemory,
}

impl PacketError {
    pub fn code(self) -> i8 {
        match self {
            Self::Rs => -1,
            Self::Decode => -2,
            Self::Length => -3,
            Self::Mac => -4,
            Self::CmdFull => -5,
            Self::CmdPointer => -6,
            Self::CmdUnknown => -7,
            Self::CmdPayload => -8,
            Self::CmdMemory => -9,
        }
    }
}

/// A rejected inbound frame, with whatever header fields could still be
/// read so the caller can decide whether (and how) to NACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub error: PacketError,
    pub command: Option<u8>,
    pub ecc: Option<bool>,
}

impl DecodeFailure {
    /// Best-effort peek at a raw (possibly corrupt) frame's header.
    pub fn peek(error: PacketError, data: &[u8]) -> Self {
        if data.len() >= HEADER_LEN {
            Self {
                error,
                command: Some(data[2]),
                ecc: match data[1] {
                    RS_ON => Some(true),
                    RS_OFF => Some(false),
                    _ => None,
                },
            }
        } else {
            Self {
                error,
                command: None,
                ecc: None,
            }
        }
    }
}

// ================================= MAC ======================================

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over `buf`, truncated to the high-order 4 bytes, big-endian.
pub fn truncated_mac(buf: &[u8], key: &[u8]) -> Result<u32, PacketError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| PacketError::Mac)?;
    mac.update(buf);
    let tag = mac.finalize().into_bytes();
    Ok(u32::from_be_bytes([tag[0], tag[1], tag[2], tag[3]]))
}

// ================================ Packet ====================================

/// The single wire entity, both directions.
///
/// Lifecycle: `new` → `set_payload` → `seal`, after which the packet is
/// immutable until it is serialized or consumed from a queue. Inbound
/// packets come from `from_bytes`, which has already verified the MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub station: u8,
    pub ecc: bool,
    pub command: CommandCode,
    pub time_unix: u32,
    pub mac: u32,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: impl Into<CommandCode>, ecc: bool) -> Self {
        Self {
            station: MISSION_ID,
            ecc,
            command: command.into(),
            time_unix: 0,
            mac: 0,
            payload: Vec::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::Length);
        }
        self.payload = bytes.to_vec();
        Ok(())
    }

    /// Stamp the clock and compute the MAC. Must be the last mutation
    /// before the packet is queued or serialized.
    pub fn seal(&mut self, now_unix: u32) -> Result<(), PacketError> {
        self.time_unix = now_unix;
        self.mac = 0;
        self.mac = self.compute_mac()?;
        Ok(())
    }

    /// MAC over the serialized packet with the MAC field zeroed.
    pub fn compute_mac(&self) -> Result<u32, PacketError> {
        let mut buf = self.to_bytes();
        buf[8..12].fill(0);
        truncated_mac(&buf, &SECRET_KEY)
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize to the 12-byte header + payload. The caller decides
    /// whether to RS-encode the result.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(self.station);
        out.push(if self.ecc { RS_ON } else { RS_OFF });
        out.push(self.command.code());
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.time_unix.to_be_bytes());
        out.extend_from_slice(&self.mac.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse and authenticate one (already RS-decoded) frame.
    ///
    /// Trailing `RS_PADDING` bytes left over from block decoding are
    /// stripped; any other trailing byte is a framing error.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeFailure> {
        if data.len() < HEADER_LEN || data.len() > MAX_FRAME_LEN {
            return Err(DecodeFailure {
                error: PacketError::Length,
                command: None,
                ecc: None,
            });
        }
        let station = data[0];
        let ecc = match data[1] {
            RS_ON => true,
            RS_OFF => false,
            _ => {
                return Err(DecodeFailure {
                    error: PacketError::Rs,
                    command: Some(data[2]),
                    ecc: None,
                })
            }
        };
        let command_byte = data[2];
        let fail = |error| DecodeFailure {
            error,
            command: Some(command_byte),
            ecc: Some(ecc),
        };

        let command =
            CommandCode::from_code(command_byte).ok_or_else(|| fail(PacketError::CmdUnknown))?;
        let payload_length = data[3] as usize;
        let time_unix = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let mac = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut len = data.len();
        while len > HEADER_LEN + payload_length {
            if data[len - 1] != fec::RS_PADDING {
                return Err(fail(PacketError::Length));
            }
            len -= 1;
        }
        if payload_length > MAX_PAYLOAD_LEN || len != HEADER_LEN + payload_length {
            return Err(fail(PacketError::Length));
        }

        let pkt = Self {
            station,
            ecc,
            command,
            time_unix,
            mac,
            payload: data[HEADER_LEN..len].to_vec(),
        };
        let expected = pkt.compute_mac().map_err(fail)?;
        if expected != mac {
            return Err(fail(PacketError::Mac));
        }
        Ok(pkt)
    }
}

// ============================== Time service ================================

/// Mission wall clock: seconds since the UNIX epoch, settable in flight by
/// TEC_SET_TIME. Monotonicity is not guaranteed across sets.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    anchor: Instant,
    // unix seconds at `anchor`; i64 so a backwards set cannot underflow
    offset: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                anchor: Instant::now(),
                offset: AtomicI64::new(EPOCH_UNIX as i64),
            }),
        }
    }

    /// `t = 0` re-initializes to the 2025-01-01 epoch.
    pub fn set_unix(&self, t: u32) {
        let t = if t == 0 { EPOCH_UNIX } else { t };
        let elapsed = self.inner.anchor.elapsed().as_secs() as i64;
        self.inner.offset.store(t as i64 - elapsed, Ordering::Relaxed);
    }

    pub fn now_unix(&self) -> u32 {
        let elapsed = self.inner.anchor.elapsed().as_secs() as i64;
        (self.inner.offset.load(Ordering::Relaxed) + elapsed).clamp(0, u32::MAX as i64) as u32
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

// ================================ Tests =====================================
