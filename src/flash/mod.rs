//! Firmware download (RequestDownload / TransferData / RequestTransferExit)
//!
//! [FlashTransfer] is the per ECU state machine shared by both ends of a download.
//! The tester uses it to number and size blocks ([client]), the ECU uses it to
//! validate them before handing the bytes to a [FlashDriver] ([crate::server]).

use log::{debug, error};

use crate::client::OrchestratorError;
use crate::uds::DiagnosticError;

pub mod client;

/// Flash result
pub type FlashResult<T> = Result<T, FlashError>;

/// Bytes of a TransferData request that are not block payload (SID + sequence counter)
pub const TRANSFER_DATA_OVERHEAD: usize = 2;

/// State of a firmware download
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashState {
    /// No download in progress
    #[default]
    Idle,
    /// Download accepted, no block transferred yet
    DownloadRequested,
    /// Blocks are being transferred
    Transferring,
    /// Every byte was transferred and the transfer exited
    Completed,
    /// The download failed or was cancelled
    Aborted,
}

impl FlashState {
    /// Returns true while a download is in progress
    pub fn is_active(self) -> bool {
        matches!(self, Self::DownloadRequested | Self::Transferring)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Flash driver failure
pub enum FlashDriverError {
    /// Address range is outside the flash memory
    #[error("address range 0x{address:08X}+{length} is out of range")]
    OutOfRange {
        /// Start address
        address: u32,
        /// Length in bytes
        length: usize,
    },
    /// Programming failed
    #[error("programming failed at 0x{0:08X}")]
    ProgramFailed(u32),
    /// Read back did not match the programmed data
    #[error("verification failed at 0x{0:08X}")]
    VerifyFailed(u32),
}

/// Non volatile memory programming driver
pub trait FlashDriver: Send {
    /// Erases `length` bytes from `address`
    fn erase(&mut self, address: u32, length: usize) -> Result<(), FlashDriverError>;
    /// Programs `data` at `address`
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashDriverError>;
    /// Verifies memory at `address` contains `data`
    fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), FlashDriverError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Firmware download error. The download is aborted, the ECU stays in the programming session
pub enum FlashError {
    /// Block arrived with the wrong sequence counter
    #[error("block sequence error. Expected {expected}, got {received}")]
    SequenceError {
        /// Expected block sequence counter
        expected: u8,
        /// Received block sequence counter
        received: u8,
    },
    /// Block is larger than the negotiated maximum
    #[error("block of {len} bytes exceeds the maximum of {max}")]
    BlockTooLarge {
        /// Block length
        len: usize,
        /// Maximum block payload
        max: usize,
    },
    /// Block goes past the announced download size
    #[error("block of {len} bytes overruns the {remaining} bytes remaining")]
    Overrun {
        /// Block length
        len: usize,
        /// Bytes remaining in the download
        remaining: usize,
    },
    /// Transfer exit before all data was transferred
    #[error("transfer ended with {remaining} bytes outstanding")]
    Incomplete {
        /// Bytes remaining in the download
        remaining: usize,
    },
    /// Operation not possible in the current state
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// State of the download
        state: FlashState,
        /// What was attempted
        operation: &'static str,
    },
    /// ECU rejected a download request
    #[error("ECU rejected service 0x{service:02X} with NRC 0x{code:02X}")]
    Rejected {
        /// Service ID
        service: u8,
        /// Negative response code
        code: u8,
    },
    /// Flash driver failure
    #[error("flash driver error: {0}")]
    Driver(
        #[from]
        #[source]
        FlashDriverError,
    ),
    /// The exchange with the ECU failed
    #[error("exchange failed: {0}")]
    Exchange(#[source] OrchestratorError),
}

impl From<OrchestratorError> for FlashError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::Diagnostic(DiagnosticError::Negative { service, code }) => {
                Self::Rejected { service, code }
            }
            other => Self::Exchange(other),
        }
    }
}

/// Snapshot of a download's progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashProgress {
    /// Download state
    pub state: FlashState,
    /// Sequence counter of the last accepted block (0 before the first)
    pub sequence: u8,
    /// Bytes transferred so far
    pub bytes_sent: usize,
    /// Size of the download
    pub total: usize,
}

impl FlashProgress {
    /// Percentage transferred (0-100)
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            if self.state == FlashState::Completed { 100.0 } else { 0.0 }
        } else {
            self.bytes_sent as f32 * 100.0 / self.total as f32
        }
    }
}

/// Download state machine for one ECU.
///
/// Holds the block sequence counter, which starts at 1 and wraps from 0xFF to 0x00.
#[derive(Debug, Clone, Default)]
pub struct FlashTransfer {
    state: FlashState,
    next_sequence: u8,
    last_sequence: u8,
    total: usize,
    bytes_remaining: usize,
    max_block_length: usize,
}

impl FlashTransfer {
    /// Current state
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Starts a download of `total` bytes.
    ///
    /// `max_block_length` is the ECU's maxNumberOfBlockLength, which counts the
    /// TransferData SID and sequence counter.
    pub fn download_accepted(&mut self, total: usize, max_block_length: usize) -> FlashResult<()> {
        if self.state.is_active() {
            return Err(FlashError::InvalidState {
                state: self.state,
                operation: "request download",
            });
        }
        if max_block_length <= TRANSFER_DATA_OVERHEAD {
            return Err(FlashError::BlockTooLarge {
                len: 1,
                max: max_block_length.saturating_sub(TRANSFER_DATA_OVERHEAD),
            });
        }
        debug!("Download of {total} bytes accepted, max block length {max_block_length}");
        *self = Self {
            state: FlashState::DownloadRequested,
            next_sequence: 1,
            last_sequence: 0,
            total,
            bytes_remaining: total,
            max_block_length,
        };
        Ok(())
    }

    /// Sequence counter the next block must carry
    pub fn next_sequence(&self) -> u8 {
        self.next_sequence
    }

    /// Largest block payload allowed
    pub fn max_payload(&self) -> usize {
        self.max_block_length.saturating_sub(TRANSFER_DATA_OVERHEAD)
    }

    /// Bytes still to be transferred
    pub fn bytes_remaining(&self) -> usize {
        self.bytes_remaining
    }

    /// Offset of the next block from the download start address
    pub fn offset(&self) -> usize {
        self.total - self.bytes_remaining
    }

    /// Validates and accounts a block. Any violation aborts the download
    pub fn accept_block(&mut self, sequence: u8, len: usize) -> FlashResult<()> {
        if !self.state.is_active() {
            return Err(FlashError::InvalidState {
                state: self.state,
                operation: "transfer data",
            });
        }
        let res = if sequence != self.next_sequence {
            Err(FlashError::SequenceError {
                expected: self.next_sequence,
                received: sequence,
            })
        } else if len > self.max_payload() {
            Err(FlashError::BlockTooLarge {
                len,
                max: self.max_payload(),
            })
        } else if len > self.bytes_remaining {
            Err(FlashError::Overrun {
                len,
                remaining: self.bytes_remaining,
            })
        } else {
            Ok(())
        };
        if let Err(e) = res {
            error!("Aborting download: {e}");
            self.state = FlashState::Aborted;
            return Err(e);
        }
        self.bytes_remaining -= len;
        self.last_sequence = sequence;
        self.next_sequence = sequence.wrapping_add(1);
        self.state = FlashState::Transferring;
        Ok(())
    }

    /// Completes the download on transfer exit
    pub fn complete(&mut self) -> FlashResult<()> {
        if !self.state.is_active() {
            return Err(FlashError::InvalidState {
                state: self.state,
                operation: "exit transfer",
            });
        }
        if self.bytes_remaining != 0 {
            error!("Transfer exit with {} bytes outstanding", self.bytes_remaining);
            self.state = FlashState::Aborted;
            return Err(FlashError::Incomplete {
                remaining: self.bytes_remaining,
            });
        }
        debug!("Download of {} bytes completed", self.total);
        self.state = FlashState::Completed;
        Ok(())
    }

    /// Aborts a download in progress
    pub fn abort(&mut self) {
        if self.state.is_active() {
            debug!("Download aborted after {} bytes", self.offset());
            self.state = FlashState::Aborted;
        }
    }

    /// Progress snapshot
    pub fn progress(&self) -> FlashProgress {
        FlashProgress {
            state: self.state,
            sequence: self.last_sequence,
            bytes_sent: self.offset(),
            total: self.total,
        }
    }
}
