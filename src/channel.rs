//! Module for the raw CAN channel an ISO-TP engine runs on top of
//!
//! The CAN controller driver itself lives outside this crate. Anything that can
//! put a classic CAN frame on the bus and report received frames can be used by
//! implementing [CanChannel]. Received frames (and asynchronous bus faults) are
//! handed back to the engine through the [FrameSink] it passes to [CanChannel::open].

use std::{fmt, sync::mpsc};

use crate::isotp::engine::EngineInput;

/// CAN channel result
pub type CanResult<T> = Result<T, CanError>;

/// Highest valid 11bit identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;
/// Highest valid 29bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
/// Fault reported by the CAN controller driver.
///
/// All of these are fatal to the transport exchange in flight, never to the process.
pub enum CanError {
    /// The controller has gone bus-off
    #[error("CAN controller is bus-off")]
    BusOff,
    /// A frame could not be transmitted in time
    #[error("timeout transmitting CAN frame")]
    TxTimeout,
    /// The controller dropped received frames
    #[error("CAN receive buffer overrun")]
    RxOverrun,
    /// The channel is not open
    #[error("CAN channel is not open")]
    NotOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// CAN frame identifier
pub enum CanId {
    /// 11bit identifier
    Standard(u16),
    /// 29bit identifier
    Extended(u32),
}

impl CanId {
    /// Creates an 11bit identifier. Returns None if the ID does not fit in 11 bits
    pub const fn standard(id: u16) -> Option<Self> {
        if id <= MAX_STANDARD_ID {
            Some(Self::Standard(id))
        } else {
            None
        }
    }

    /// Creates a 29bit identifier. Returns None if the ID does not fit in 29 bits
    pub const fn extended(id: u32) -> Option<Self> {
        if id <= MAX_EXTENDED_ID {
            Some(Self::Extended(id))
        } else {
            None
        }
    }

    /// Raw numeric value of the identifier
    pub const fn raw(&self) -> u32 {
        match self {
            Self::Standard(id) => *id as u32,
            Self::Extended(id) => *id,
        }
    }

    /// Returns true for 29bit identifiers
    pub const fn is_extended(&self) -> bool {
        matches!(self, Self::Extended(_))
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard(id) => write!(f, "0x{id:03X}"),
            Self::Extended(id) => write!(f, "0x{id:08X}"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
/// A classic CAN frame. Immutable once built.
pub struct CanFrame {
    id: CanId,
    data: [u8; 8],
    dlc: u8,
}

impl CanFrame {
    /// Creates a new CAN frame. Returns None if `data` is longer than 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            data: buf,
            dlc: data.len() as u8,
        })
    }

    /// Identifier of the frame
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Payload of the frame (0-8 bytes)
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:02X?}]", self.id, self.data())
    }
}

/// Handle a [CanChannel] uses to notify the engine of received frames and bus faults.
///
/// Frames are queued on a single ordered channel, so the order frames are delivered
/// in is the order the engine processes them in.
#[derive(Debug, Clone)]
pub struct FrameSink {
    sender: mpsc::Sender<EngineInput>,
}

impl FrameSink {
    pub(crate) fn new(sender: mpsc::Sender<EngineInput>) -> Self {
        Self { sender }
    }

    /// Delivers a received frame. Returns false if the engine has stopped
    pub fn deliver(&self, frame: CanFrame) -> bool {
        self.sender.send(EngineInput::Frame(frame)).is_ok()
    }

    /// Reports an asynchronous driver fault (Bus off, Rx overrun...).
    /// Returns false if the engine has stopped
    pub fn report_error(&self, error: CanError) -> bool {
        self.sender.send(EngineInput::BusError(error)).is_ok()
    }
}

/// Raw CAN driver the ISO-TP engine transmits on
pub trait CanChannel: Send {
    /// Opens the channel. Every frame received from now on must be passed to `sink`
    fn open(&mut self, sink: FrameSink) -> CanResult<()>;

    /// Closes the channel
    fn close(&mut self) -> CanResult<()>;

    /// Transmits a single frame
    fn send_frame(&mut self, frame: &CanFrame) -> CanResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_ranges() {
        assert_eq!(CanId::standard(0x7FF), Some(CanId::Standard(0x7FF)));
        assert_eq!(CanId::standard(0x800), None);
        assert!(CanId::extended(0x1FFF_FFFF).unwrap().is_extended());
        assert_eq!(CanId::extended(0x2000_0000), None);
        assert_eq!(CanId::Standard(0x7E0).raw(), 0x7E0);
    }

    #[test]
    fn frame_payload_bounds() {
        let id = CanId::Standard(0x7E0);
        assert!(CanFrame::new(id, &[0; 9]).is_none());
        let f = CanFrame::new(id, &[1, 2, 3]).unwrap();
        assert_eq!(f.data(), &[1, 2, 3]);
        assert_eq!(CanFrame::new(id, &[]).unwrap().data().len(), 0);
    }
}
