#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    //unstable_features,
    //unused_imports,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides an ISO-TP transport and a UDS diagnostic stack for
//! querying and reprogramming ECUs over a CAN bus.
//!
//! ## Layers
//!
//! ### ISO-TP (ISO 15765-2)
//! [isotp] segments diagnostic messages up to 4095 bytes into classic CAN frames and
//! reassembles them, honouring the peer's flow control (block size and separation time).
//! One background engine thread owns every transport session of a channel.
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - [uds] builds requests, classifies responses and matches them to the
//! request that caused them, including the response pending (0x78) and busy (0x21)
//! negative responses.
//!
//! ### Sessions and flashing
//! [session] tracks the diagnostic session of every ECU (with S3 fallback) and gates
//! services on it. [flash] implements the RequestDownload / TransferData /
//! RequestTransferExit state machine used on both ends of a firmware download.
//!
//! ### Client and server
//! [client::Client] is the tester side of the bus. [server::EcuServer] answers requests
//! like a bootloader would, writing downloaded data through a [flash::FlashDriver].
//!
//! ## Hardware
//!
//! The CAN driver is abstracted by [channel::CanChannel]. [simulation] provides an
//! in-memory bus and flash memory, for testing without an adapter.

pub mod channel;
pub mod client;
pub mod flash;
pub mod isotp;
pub mod server;
pub mod session;
pub mod simulation;
pub mod uds;

pub use channel::{CanChannel, CanError, CanFrame, CanId};
pub use client::{Client, ClientOptions, OrchestratorError};
pub use flash::{FlashDriver, FlashError, FlashProgress, FlashState};
pub use isotp::{IsoTpSettings, TransportError};
pub use server::{EcuServer, EcuServerOptions};
pub use session::DiagSession;
pub use uds::{DiagnosticError, DiagnosticRequest, DiagnosticResponse, EcuAddress};
