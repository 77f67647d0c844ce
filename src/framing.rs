//! Byte framing for desk controller frames.
//!
//! ```text
//! +------+------+-----+-----+-------------+-----+------+
//! | hdr0 | hdr1 | cmd | len | payload[..] | sum | 0x7E |
//! +------+------+-----+-----+-------------+-----+------+
//! ```
//!
//! `sum` is `(cmd + len + sum(payload)) mod 256`.

use thiserror::Error;

/// Header used for outbound commands and legacy replies.
pub const HEADER_COMMAND: [u8; 2] = [0xF1, 0xF1];
/// Header used by newer controller replies.
pub const HEADER_REPLY: [u8; 2] = [0xF2, 0xF2];
pub const FRAME_TERMINATOR: u8 = 0x7E;

/// Header, command, length, checksum and terminator bytes.
pub const FRAME_OVERHEAD: usize = 6;
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid payload: {len} bytes does not fit the length byte")]
    InvalidPayload { len: usize },
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("frame does not end with terminator byte")]
    MissingTerminator,
    #[error("length mismatch: declared {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

pub fn checksum(command: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(command.wrapping_add(payload.len() as u8), |acc, &b| {
            acc.wrapping_add(b)
        })
}

pub fn encode_frame(command: u8, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FramingError::InvalidPayload { len: payload.len() });
    }

    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    out.extend_from_slice(&HEADER_COMMAND);
    out.push(command);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out.push(checksum(command, payload));
    out.push(FRAME_TERMINATOR);
    Ok(out)
}

/// A structurally validated frame borrowed from a raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: [u8; 2],
    pub command: u8,
    pub payload: &'a [u8],
    pub checksum: u8,
}

impl<'a> Frame<'a> {
    /// Parses a complete frame, requiring the declared length to match the
    /// buffer exactly. The checksum byte is returned as-is, see
    /// [`Frame::verify_checksum`].
    pub fn parse(raw: &'a [u8]) -> Result<Self, FramingError> {
        if raw.len() < FRAME_OVERHEAD {
            return Err(FramingError::TooShort {
                expected: FRAME_OVERHEAD,
                actual: raw.len(),
            });
        }
        if raw[raw.len() - 1] != FRAME_TERMINATOR {
            return Err(FramingError::MissingTerminator);
        }

        let declared = raw[3] as usize;
        let actual = raw.len() - FRAME_OVERHEAD;
        if declared != actual {
            return Err(FramingError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            header: [raw[0], raw[1]],
            command: raw[2],
            payload: &raw[4..4 + declared],
            checksum: raw[4 + declared],
        })
    }

    pub fn expected_checksum(&self) -> u8 {
        checksum(self.command, self.payload)
    }

    pub fn verify_checksum(&self) -> Result<(), FramingError> {
        let expected = self.expected_checksum();
        if expected == self.checksum {
            Ok(())
        } else {
            Err(FramingError::ChecksumMismatch {
                expected,
                actual: self.checksum,
            })
        }
    }
}
