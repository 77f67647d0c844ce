//! Desk command set and notification decoding on top of [`crate::framing`].

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum_macros::{Display, EnumIter, IntoStaticStr};
use tracing::debug;

use crate::framing::{
    FRAME_TERMINATOR, Frame, FramingError, HEADER_COMMAND, HEADER_REPLY, encode_frame,
};

/// Command byte values understood by the controller.
///
/// Several commands share an opcode; the preceding [`Opcode::Prime`] frame or
/// the payload decides how the desk interprets them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Display, EnumIter,
)]
#[repr(u8)]
pub enum Opcode {
    Prime = 0x00,
    MoveUp = 0x01,
    MoveDown = 0x02,
    QueryHeight = 0x07,
    HeightReport = 0x15,
    GotoHeight = 0x1B,
    ToggleLock = 0x1F,
    Stop = 0x2B,
    Handshake = 0xFE,
}

/// Memory slot payloads for recalling the stored presets.
const SIT_PRESET_PAYLOAD: [u8; 2] = [0x02, 0xDA];
const STAND_PRESET_PAYLOAD: [u8; 2] = [0x03, 0x06];
const TOGGLE_LOCK_PAYLOAD: [u8; 1] = [0x01];

/// Height values below this are reported in centimetres by variant B replies.
const CENTIMETRE_CUTOFF: u32 = 300;
const MIN_HEIGHT_FRAME_LEN: usize = 7;
const MIN_LOCK_FRAME_LEN: usize = 6;

/// Single outbound frame the desk understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum DeskCommand {
    MoveUp,
    MoveDown,
    Stop,
    Handshake,
    QueryHeight,
    Prime,
    SitPreset,
    StandPreset,
    ToggleLock,
    /// Target height in millimetres, sent big-endian.
    SetHeight(u16),
}

impl DeskCommand {
    pub fn opcode(self) -> Opcode {
        match self {
            Self::MoveUp => Opcode::MoveUp,
            Self::MoveDown => Opcode::MoveDown,
            Self::Stop => Opcode::Stop,
            Self::Handshake => Opcode::Handshake,
            Self::QueryHeight => Opcode::QueryHeight,
            Self::Prime => Opcode::Prime,
            Self::SitPreset | Self::StandPreset | Self::SetHeight(_) => Opcode::GotoHeight,
            Self::ToggleLock => Opcode::ToggleLock,
        }
    }

    pub fn payload(self) -> Vec<u8> {
        match self {
            Self::SitPreset => SIT_PRESET_PAYLOAD.to_vec(),
            Self::StandPreset => STAND_PRESET_PAYLOAD.to_vec(),
            Self::ToggleLock => TOGGLE_LOCK_PAYLOAD.to_vec(),
            Self::SetHeight(target_mm) => target_mm.to_be_bytes().to_vec(),
            Self::MoveUp
            | Self::MoveDown
            | Self::Stop
            | Self::Handshake
            | Self::QueryHeight
            | Self::Prime => Vec::new(),
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn encode(self) -> Result<Vec<u8>, FramingError> {
        encode_frame(self.opcode().into(), &self.payload())
    }
}

/// Frames for one logical desk operation, in the order they must be written.
pub fn command_sequence(operation: DeskOperation) -> Result<Vec<Vec<u8>>, FramingError> {
    operation
        .commands()
        .into_iter()
        .map(DeskCommand::encode)
        .collect()
}

/// A user-facing operation, which may span several frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum DeskOperation {
    MoveUp,
    MoveDown,
    Stop,
    MoveToSitPreset,
    MoveToStandPreset,
    ToggleLock,
    SaveSitPreset,
    SaveStandPreset,
    SetHeight(u16),
    QueryHeight,
}

impl DeskOperation {
    pub fn commands(self) -> Vec<DeskCommand> {
        match self {
            Self::MoveUp => vec![DeskCommand::MoveUp],
            Self::MoveDown => vec![DeskCommand::MoveDown],
            Self::Stop => vec![DeskCommand::Stop],
            Self::MoveToSitPreset => vec![DeskCommand::SitPreset],
            Self::MoveToStandPreset => vec![DeskCommand::StandPreset],
            Self::ToggleLock => vec![DeskCommand::ToggleLock],
            // A primed move-down/stop frame stores the current height instead.
            Self::SaveSitPreset => vec![DeskCommand::Prime, DeskCommand::MoveDown],
            Self::SaveStandPreset => vec![DeskCommand::Prime, DeskCommand::Stop],
            Self::SetHeight(target_mm) => {
                vec![DeskCommand::Prime, DeskCommand::SetHeight(target_mm)]
            }
            Self::QueryHeight => vec![DeskCommand::QueryHeight],
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// How strictly inbound frames are checked before interpretation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Reject frames whose length byte or checksum disagree with the buffer.
    pub verify_checksum: bool,
}

/// Result of decoding one notification buffer. Both fields may be set when a
/// buffer matches both the height and the lock shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodedNotification {
    pub height_mm: Option<u32>,
    pub locked: Option<bool>,
}

impl DecodedNotification {
    pub fn is_unrecognized(&self) -> bool {
        self.height_mm.is_none() && self.locked.is_none()
    }
}

pub fn decode_notification(raw: &[u8], options: DecodeOptions) -> DecodedNotification {
    if options.verify_checksum {
        if let Err(err) = Frame::parse(raw).and_then(|frame| frame.verify_checksum()) {
            debug!(%err, frame = %hex(raw), "rejecting notification");
            return DecodedNotification::default();
        }
    }

    DecodedNotification {
        height_mm: decode_height(raw),
        locked: decode_lock_state(raw),
    }
}

/// Parses a height report.
///
/// Variant A: `F1 F1 {07|15} len low high .. sum 7E`, little-endian centimetres.
/// Variant B: `F2 F2 01 len high low .. sum 7E`, big-endian, centimetres when
/// the value is below 300 and millimetres otherwise.
pub fn decode_height(raw: &[u8]) -> Option<u32> {
    if raw.len() < MIN_HEIGHT_FRAME_LEN || raw[raw.len() - 1] != FRAME_TERMINATOR {
        return None;
    }

    let header = [raw[0], raw[1]];
    let command = raw[2];
    let length = raw[3];

    if header == HEADER_COMMAND
        && length >= 2
        && matches!(
            Opcode::try_from(command),
            Ok(Opcode::QueryHeight | Opcode::HeightReport)
        )
    {
        let centimetres = u32::from(u16::from_le_bytes([raw[4], raw[5]]));
        return Some(centimetres * 10);
    }

    if header == HEADER_REPLY && command == 0x01 && length >= 3 {
        let value = u32::from(u16::from_be_bytes([raw[4], raw[5]]));
        if value < CENTIMETRE_CUTOFF {
            return Some(value * 10);
        }
        return Some(value);
    }

    None
}

/// Parses a lock-state report: `F2 F2 1F len state ..`.
pub fn decode_lock_state(raw: &[u8]) -> Option<bool> {
    if raw.len() < MIN_LOCK_FRAME_LEN
        || raw[..2] != HEADER_REPLY
        || raw[2] != u8::from(Opcode::ToggleLock)
        || raw[3] < 1
    {
        return None;
    }

    match raw[4] {
        0x00 => Some(false),
        0x01 => Some(true),
        _ => None,
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
