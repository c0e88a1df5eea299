//! Software ISO-TP (ISO15765-2) transport for classic CAN
//!
//! * [codec] - Encoding and decoding of single CAN frames ([WireFrame])
//! * [session] - Per peer-pair segmentation and reassembly state machine
//! * [engine] - Background thread running every session against a [crate::channel::CanChannel]

use std::time::Duration;

use crate::channel::{CanError, CanId};

pub mod codec;
pub mod engine;
pub mod session;

pub use codec::{FlowStatus, FormatError, WireFrame};
pub use engine::{InboundMessage, IsoTpEngine, IsoTpHandle};
pub use session::{SessionOutput, TransportSession, TransportState};

/// Largest message the 12bit First frame length field can describe
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Transport result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Reason an ISO-TP message failed to send or be received.
///
/// Any of these aborts only the message in flight. The session returns to idle
/// and remains usable.
pub enum TransportError {
    /// Consecutive frame arrived out of order
    #[error("consecutive frame out of sequence. Expected SN {expected}, got {received}")]
    SequenceError {
        /// Sequence number that was expected
        expected: u8,
        /// Sequence number that was received
        received: u8,
    },
    /// Receiver did not send flow control in time (N_Bs)
    #[error("timeout awaiting flow control")]
    FlowControlTimeout,
    /// Receiver rejected the message as too large
    #[error("receiver reported buffer overflow")]
    Overflow,
    /// Sender stopped sending consecutive frames (N_Cr)
    #[error("timeout awaiting consecutive frame")]
    ReassemblyTimeout,
    /// Receiver kept asking to wait
    #[error("receiver sent too many flow control wait frames")]
    WaitLimitExceeded,
    /// Another message is already being exchanged with this peer
    #[error("transport session is busy")]
    Busy,
    /// Nothing to send
    #[error("message is empty")]
    EmptyPayload,
    /// Message does not fit the 12bit length field
    #[error("message of {0} bytes exceeds the maximum ISO-TP length")]
    PayloadTooLarge(usize),
    /// Functional requests have to fit in a single frame
    #[error("functional message of {0} bytes does not fit a single frame")]
    FunctionalTooLong(usize),
    /// No route is configured for the peer
    #[error("no route configured for {0}")]
    NoRoute(CanId),
    /// Driver fault
    #[error("CAN driver error: {0}")]
    Can(
        #[from]
        #[source]
        CanError,
    ),
    /// The engine thread is no longer running
    #[error("ISO-TP engine is not running")]
    EngineStopped,
}

/// The two CAN identifiers an ISO-TP conversation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeerPair {
    /// ID this node transmits on (data and flow control frames)
    pub local_id: CanId,
    /// ID the peer transmits on
    pub remote_id: CanId,
}

impl PeerPair {
    /// Creates a new peer pair
    pub const fn new(local_id: CanId, remote_id: CanId) -> Self {
        Self {
            local_id,
            remote_id,
        }
    }
}

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsoTpSettings {
    /// Block size advertised in our flow control frames. 0 = unlimited
    pub block_size: u8,
    /// Minimum separation time advertised in our flow control frames (In microseconds)
    pub st_min_us: u32,
    /// Pad transmitted frames to 8 bytes with this byte
    pub padding: Option<u8>,
    /// Time to wait for flow control after a First frame or a completed block (N_Bs)
    pub n_bs: Duration,
    /// Time to wait between consecutive frames while receiving (N_Cr)
    pub n_cr: Duration,
    /// Maximum number of flow control wait frames accepted in a row
    pub wft_max: u8,
    /// Largest message we are willing to reassemble
    pub max_message_len: usize,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            block_size: 8,
            st_min_us: 0,
            padding: Some(0xCC),
            n_bs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            wft_max: 8,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }
}
