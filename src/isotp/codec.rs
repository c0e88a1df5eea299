//! Encoding and decoding of ISO-TP frames
//!
//! The upper nibble of the first byte (PCI) selects the frame type:
//!
//! | Nibble | Frame       | Layout                                  |
//! |--------|-------------|-----------------------------------------|
//! | 0      | Single      | `0L dd dd dd dd dd dd dd`               |
//! | 1      | First       | `1L LL dd dd dd dd dd dd` (12bit length)|
//! | 2      | Consecutive | `2N dd dd dd dd dd dd dd`               |
//! | 3      | FlowControl | `3S BS ST`                              |

use super::MAX_MESSAGE_LEN;

/// Payload bytes carried by a Single frame
pub const SINGLE_FRAME_MAX: usize = 7;
/// Payload bytes carried by a First frame
pub const FIRST_FRAME_DATA: usize = 6;
/// Payload bytes carried by a Consecutive frame
pub const CONSECUTIVE_FRAME_DATA: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
/// Malformed CAN frame
pub enum FormatError {
    /// Frame has no PCI byte
    #[error("frame is empty")]
    Empty,
    /// Frame is shorter than its PCI requires
    #[error("frame too short. Expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes present
        actual: usize,
    },
    /// Upper PCI nibble is not a known frame type
    #[error("unknown frame type 0x{0:X}")]
    InvalidType(u8),
    /// Declared length is out of range for the frame type
    #[error("invalid declared length {0}")]
    InvalidLength(usize),
    /// Flow status nibble is not Continue, Wait or Overflow
    #[error("unknown flow status 0x{0:X}")]
    InvalidFlowStatus(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Flow status of a flow control frame
pub enum FlowStatus {
    /// Clear to send
    Continue,
    /// Receiver is not ready, wait for another flow control frame
    Wait,
    /// Receiver cannot take the message
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A decoded ISO-TP frame
pub enum WireFrame {
    /// Complete message of 1-7 bytes
    Single {
        /// Message bytes
        data: Vec<u8>,
    },
    /// Start of a segmented message
    First {
        /// Length of the whole message (8-4095)
        total_len: u16,
        /// First 6 bytes of the message
        data: Vec<u8>,
    },
    /// Continuation of a segmented message
    Consecutive {
        /// Sequence number (0-15)
        sequence: u8,
        /// Up to 7 bytes of the message. May contain padding on the last frame
        data: Vec<u8>,
    },
    /// Receiver to sender authorisation to continue
    FlowControl {
        /// Flow status
        status: FlowStatus,
        /// Consecutive frames to send before the next flow control. 0 = unlimited
        block_size: u8,
        /// Minimum time between consecutive frames in microseconds
        separation_time_us: u32,
    },
}

/// Converts an STmin byte to microseconds.
/// Reserved values are treated as the longest valid time (127ms)
pub fn st_min_to_micros(st: u8) -> u32 {
    match st {
        0x00..=0x7F => st as u32 * 1000,
        0xF1..=0xF9 => (st - 0xF0) as u32 * 100,
        _ => 127_000,
    }
}

/// Converts microseconds to the nearest STmin byte that is not shorter than requested
pub fn micros_to_st_min(us: u32) -> u8 {
    match us {
        0 => 0,
        1..=900 => 0xF0 + us.div_ceil(100) as u8,
        _ => us.div_ceil(1000).min(0x7F) as u8,
    }
}

/// Encodes a frame into CAN payload bytes (Unpadded, at most 8 bytes).
///
/// The frame must be well formed: Single data 1-7 bytes, First data 6 bytes,
/// Consecutive data at most 7 bytes.
pub fn encode(frame: &WireFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    match frame {
        WireFrame::Single { data } => {
            debug_assert!(!data.is_empty() && data.len() <= SINGLE_FRAME_MAX);
            out.push(data.len() as u8 & 0x0F);
            out.extend_from_slice(data);
        }
        WireFrame::First { total_len, data } => {
            debug_assert!(data.len() <= FIRST_FRAME_DATA);
            out.push(0x10 | ((total_len >> 8) as u8 & 0x0F));
            out.push((total_len & 0xFF) as u8);
            out.extend_from_slice(data);
        }
        WireFrame::Consecutive { sequence, data } => {
            debug_assert!(data.len() <= CONSECUTIVE_FRAME_DATA);
            out.push(0x20 | (sequence & 0x0F));
            out.extend_from_slice(data);
        }
        WireFrame::FlowControl {
            status,
            block_size,
            separation_time_us,
        } => {
            let fs = match status {
                FlowStatus::Continue => 0,
                FlowStatus::Wait => 1,
                FlowStatus::Overflow => 2,
            };
            out.push(0x30 | fs);
            out.push(*block_size);
            out.push(micros_to_st_min(*separation_time_us));
        }
    }
    out
}

/// Encodes a frame, padding it to a full 8 bytes if `padding` is set
pub fn encode_padded(frame: &WireFrame, padding: Option<u8>) -> Vec<u8> {
    let mut out = encode(frame);
    if let Some(pad) = padding {
        out.resize(8, pad);
    }
    out
}

/// Decodes the payload of a CAN frame
pub fn decode(payload: &[u8]) -> Result<WireFrame, FormatError> {
    let pci = *payload.first().ok_or(FormatError::Empty)?;
    if payload.len() > 8 {
        return Err(FormatError::InvalidLength(payload.len()));
    }
    match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            if len == 0 || len > SINGLE_FRAME_MAX {
                return Err(FormatError::InvalidLength(len));
            }
            let data = payload
                .get(1..1 + len)
                .ok_or(FormatError::Truncated {
                    expected: 1 + len,
                    actual: payload.len(),
                })?;
            Ok(WireFrame::Single {
                data: data.to_vec(),
            })
        }
        0x1 => {
            if payload.len() < 8 {
                return Err(FormatError::Truncated {
                    expected: 8,
                    actual: payload.len(),
                });
            }
            let total_len = ((pci as u16 & 0x0F) << 8) | payload[1] as u16;
            if (total_len as usize) <= SINGLE_FRAME_MAX || total_len as usize > MAX_MESSAGE_LEN {
                return Err(FormatError::InvalidLength(total_len as usize));
            }
            Ok(WireFrame::First {
                total_len,
                data: payload[2..].to_vec(),
            })
        }
        0x2 => Ok(WireFrame::Consecutive {
            sequence: pci & 0x0F,
            data: payload[1..].to_vec(),
        }),
        0x3 => {
            if payload.len() < 3 {
                return Err(FormatError::Truncated {
                    expected: 3,
                    actual: payload.len(),
                });
            }
            let status = match pci & 0x0F {
                0 => FlowStatus::Continue,
                1 => FlowStatus::Wait,
                2 => FlowStatus::Overflow,
                x => return Err(FormatError::InvalidFlowStatus(x)),
            };
            Ok(WireFrame::FlowControl {
                status,
                block_size: payload[1],
                separation_time_us: st_min_to_micros(payload[2]),
            })
        }
        x => Err(FormatError::InvalidType(x)),
    }
}
