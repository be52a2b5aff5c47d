//! Wire framing for the ranging protocol.
//!
//! Every frame starts with a one-byte packet tag; the rest of the layout is
//! internal to this crate. Frames are packed by hand into fixed buffers so
//! the interrupt path never allocates. Multi-byte fields are little-endian.

use heapless::Vec;
use static_assertions::const_assert;
use thiserror::Error;

use crate::ranging::RadioTimestamp;
use crate::types::{DeviceId, DEVICE_ID_LEN, MAX_NETWORK_SIZE};

/// Largest frame the radio will carry.
pub const MAX_FRAME_LEN: usize = 127;

/// A ranging frame can echo every earlier slot of a full network.
pub const MAX_ECHOES: usize = MAX_NETWORK_SIZE - 1;

// Worst-case layouts must fit the radio frame budget, and the status bitmap
// must cover every slot.
const_assert!(1 + 4 + 1 + DEVICE_ID_LEN * MAX_NETWORK_SIZE <= MAX_FRAME_LEN);
const_assert!(1 + 1 + 8 + 1 + MAX_ECHOES * 9 <= MAX_FRAME_LEN);
const_assert!(MAX_NETWORK_SIZE <= 16);

/// Leading tag byte of every ranging-protocol frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketTag {
    Ranging = 0x80,
    Schedule = 0x83,
    StatusSuccess = 0x85,
    Unknown = 0x86,
}

impl PacketTag {
    pub const fn byte(self) -> u8 {
        self as u8
    }

    pub const fn from_byte(byte: u8) -> Option<PacketTag> {
        match byte {
            0x80 => Some(PacketTag::Ranging),
            0x83 => Some(PacketTag::Schedule),
            0x85 => Some(PacketTag::StatusSuccess),
            0x86 => Some(PacketTag::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short for its layout")]
    Truncated,
    #[error("unrecognized packet tag {0:#04x}")]
    UnrecognizedTag(u8),
    #[error("tag {0:?} does not match the expected frame type")]
    WrongTag(PacketTag),
    #[error("length field exceeds table capacity")]
    Oversize,
}

/// Fixed-capacity frame buffer handed to and from the radio driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBuf {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl FrameBuf {
    pub fn from_slice(data: &[u8]) -> Option<FrameBuf> {
        if data.len() > MAX_FRAME_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(FrameBuf {
            bytes,
            len: data.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read the leading tag byte without touching the rest of the frame.
pub fn peek_tag(frame: &[u8]) -> Result<PacketTag, FrameError> {
    let first = *frame.first().ok_or(FrameError::Truncated)?;
    PacketTag::from_byte(first).ok_or(FrameError::UnrecognizedTag(first))
}

fn expect_tag(frame: &[u8], expected: PacketTag) -> Result<(), FrameError> {
    let tag = peek_tag(frame)?;
    if tag == expected {
        Ok(())
    } else {
        Err(FrameError::WrongTag(tag))
    }
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// Round-opening broadcast from the master: the full slot table.
///
/// Layout: tag, round index (u32), slot count (u8), then one 6-byte id per
/// slot in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFrame {
    pub round: u32,
    pub slots: Vec<DeviceId, MAX_NETWORK_SIZE>,
}

impl ScheduleFrame {
    pub fn encode(&self) -> FrameBuf {
        debug_assert!(self.slots.len() <= MAX_NETWORK_SIZE);
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[0] = PacketTag::Schedule.byte();
        bytes[1..5].copy_from_slice(&self.round.to_le_bytes());
        bytes[5] = self.slots.len() as u8;
        let mut at = 6;
        for id in &self.slots {
            bytes[at..at + DEVICE_ID_LEN].copy_from_slice(&id.bytes());
            at += DEVICE_ID_LEN;
        }
        FrameBuf { bytes, len: at }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        expect_tag(frame, PacketTag::Schedule)?;
        if frame.len() < 6 {
            return Err(FrameError::Truncated);
        }
        let round = read_u32(&frame[1..5]);
        let count = frame[5] as usize;
        if count > MAX_NETWORK_SIZE {
            return Err(FrameError::Oversize);
        }
        if frame.len() < 6 + count * DEVICE_ID_LEN {
            return Err(FrameError::Truncated);
        }
        let mut slots = Vec::new();
        for i in 0..count {
            let at = 6 + i * DEVICE_ID_LEN;
            let mut id = [0u8; DEVICE_ID_LEN];
            id.copy_from_slice(&frame[at..at + DEVICE_ID_LEN]);
            let _ = slots.push(DeviceId::new(id));
        }
        Ok(ScheduleFrame { round, slots })
    }
}

/// One echoed reception: which slot we heard and when it arrived on our clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoEntry {
    pub slot: u8,
    pub rx_timestamp: RadioTimestamp,
}

/// Slot-owner broadcast during the ranging phase.
///
/// Carries the sender's slot, its transmit timestamp, and echoes of every
/// frame it heard earlier in the round. The echo closes the two-way exchange
/// for the earlier-slot device of each pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangingFrame {
    pub slot: u8,
    pub tx_timestamp: RadioTimestamp,
    pub echoes: Vec<EchoEntry, MAX_ECHOES>,
}

impl RangingFrame {
    pub fn encode(&self) -> FrameBuf {
        debug_assert!(self.echoes.len() <= MAX_ECHOES);
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[0] = PacketTag::Ranging.byte();
        bytes[1] = self.slot;
        bytes[2..10].copy_from_slice(&self.tx_timestamp.ticks().to_le_bytes());
        bytes[10] = self.echoes.len() as u8;
        let mut at = 11;
        for echo in &self.echoes {
            bytes[at] = echo.slot;
            bytes[at + 1..at + 9].copy_from_slice(&echo.rx_timestamp.ticks().to_le_bytes());
            at += 9;
        }
        FrameBuf { bytes, len: at }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        expect_tag(frame, PacketTag::Ranging)?;
        if frame.len() < 11 {
            return Err(FrameError::Truncated);
        }
        let slot = frame[1];
        let tx_timestamp = RadioTimestamp::new(read_u64(&frame[2..10]));
        let count = frame[10] as usize;
        if count > MAX_ECHOES {
            return Err(FrameError::Oversize);
        }
        if frame.len() < 11 + count * 9 {
            return Err(FrameError::Truncated);
        }
        let mut echoes = Vec::new();
        for i in 0..count {
            let at = 11 + i * 9;
            let _ = echoes.push(EchoEntry {
                slot: frame[at],
                rx_timestamp: RadioTimestamp::new(read_u64(&frame[at + 1..at + 9])),
            });
        }
        Ok(RangingFrame {
            slot,
            tx_timestamp,
            echoes,
        })
    }
}

/// Per-device report of which ranging slots it heard this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusFrame {
    pub slot: u8,
    pub heard_mask: u16,
}

impl StatusFrame {
    pub fn encode(&self) -> FrameBuf {
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[0] = PacketTag::StatusSuccess.byte();
        bytes[1] = self.slot;
        bytes[2..4].copy_from_slice(&self.heard_mask.to_le_bytes());
        FrameBuf { bytes, len: 4 }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        expect_tag(frame, PacketTag::StatusSuccess)?;
        if frame.len() < 4 {
            return Err(FrameError::Truncated);
        }
        Ok(StatusFrame {
            slot: frame[1],
            heard_mask: read_u16(&frame[2..4]),
        })
    }
}
