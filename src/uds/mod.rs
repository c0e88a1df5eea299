//! Module for UDS (Unified diagnostic services - ISO14229) requests and responses
//!
//! This module models the logical diagnostic messages carried by the ISO-TP layer.
//! [dispatcher] correlates requests with the ECU responses to them.

use std::fmt;

use automotive_diag::{
    uds::{ResetType, UdsCommand, UdsError, UdsErrorByte},
    ByteWrapper::{Extended, Standard},
};

use crate::{
    channel::CanId,
    isotp::{PeerPair, TransportError},
    session::DiagSession,
};

pub mod dispatcher;

pub use dispatcher::{CancelToken, Dispatcher, DispatcherOptions};

/// First byte of every negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// Positive response SID = request SID + this offset
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
/// Sub function bit asking the ECU not to send a positive response
pub const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// Diagnostic result
pub type DiagnosticResult<T> = Result<T, DiagnosticError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Diagnostic layer error
pub enum DiagnosticError {
    /// ECU responded negatively
    #[error("ECU rejected service 0x{service:02X} with NRC 0x{code:02X} ({})", describe_nrc(*code))]
    Negative {
        /// Service ID of the request
        service: u8,
        /// Negative response code
        code: u8,
    },
    /// No matching response arrived in time
    #[error("no response to service 0x{service:02X}")]
    Timeout {
        /// Service ID of the request
        service: u8,
    },
    /// Service is not permitted in the ECU's current diagnostic session
    #[error("service 0x{service:02X} is not permitted in the {session} session")]
    WrongSession {
        /// Service ID of the request
        service: u8,
        /// Session the ECU is in
        session: DiagSession,
    },
    /// ECU response was malformed
    #[error("invalid response to service 0x{service:02X}: {reason}")]
    InvalidResponse {
        /// Service ID of the request
        service: u8,
        /// What was wrong with it
        reason: String,
    },
    /// The message failed to send or be received
    #[error("transport error: {0}")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// Caller cancelled the request
    #[error("request was cancelled")]
    Cancelled,
    /// The dispatcher has been shut down
    #[error("diagnostic dispatcher is not running")]
    ServerNotRunning,
}

/// Returns a readable name for a UDS negative response code
pub fn describe_nrc(code: u8) -> String {
    match UdsErrorByte::from(code) {
        Standard(e) => format!("{e:?}"),
        Extended(x) => format!("Unknown NRC 0x{x:02X}"),
    }
}

/// CAN identifiers used to talk to one ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuAddress {
    /// ID the tester sends physical requests on
    pub request_id: CanId,
    /// ID the ECU responds on
    pub response_id: CanId,
}

impl EcuAddress {
    /// Creates a new ECU address
    pub const fn new(request_id: CanId, response_id: CanId) -> Self {
        Self {
            request_id,
            response_id,
        }
    }

    /// ISO-TP pair as seen from the tester
    pub const fn pair(&self) -> PeerPair {
        PeerPair::new(self.request_id, self.response_id)
    }

    /// ISO-TP pair as seen from the ECU
    pub const fn server_pair(&self) -> PeerPair {
        PeerPair::new(self.response_id, self.request_id)
    }
}

impl fmt::Display for EcuAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ECU {}/{}", self.request_id, self.response_id)
    }
}

/// Where a request is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// One ECU
    Physical(EcuAddress),
    /// Every ECU listening on a functional (broadcast) ID
    Functional(CanId),
}

/// A UDS request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRequest {
    /// Destination
    pub target: Target,
    /// Service ID
    pub service: u8,
    /// Sub function byte, for services that have one
    pub sub_function: Option<u8>,
    /// Parameter data after the SID and sub function
    pub data: Vec<u8>,
}

impl DiagnosticRequest {
    /// Creates a new request
    pub fn new(target: Target, service: UdsCommand, sub_function: Option<u8>, data: Vec<u8>) -> Self {
        Self {
            target,
            service: service.into(),
            sub_function,
            data,
        }
    }

    /// DiagnosticSessionControl (0x10)
    pub fn session_control(ecu: EcuAddress, session: DiagSession) -> Self {
        Self::new(
            Target::Physical(ecu),
            UdsCommand::DiagnosticSessionControl,
            Some(session.sub_function()),
            vec![],
        )
    }

    /// ECUReset (0x11)
    pub fn ecu_reset(ecu: EcuAddress, reset: ResetType) -> Self {
        Self::new(Target::Physical(ecu), UdsCommand::ECUReset, Some(reset.into()), vec![])
    }

    /// ReadDataByIdentifier (0x22)
    pub fn read_data_by_identifier(target: Target, did: u16) -> Self {
        Self::new(
            target,
            UdsCommand::ReadDataByIdentifier,
            None,
            did.to_be_bytes().to_vec(),
        )
    }

    /// WriteDataByIdentifier (0x2E)
    pub fn write_data_by_identifier(ecu: EcuAddress, did: u16, value: &[u8]) -> Self {
        let mut data = did.to_be_bytes().to_vec();
        data.extend_from_slice(value);
        Self::new(Target::Physical(ecu), UdsCommand::WriteDataByIdentifier, None, data)
    }

    /// RequestDownload (0x34) with no compression/encryption, 4 byte address and 4 byte size
    pub fn request_download(ecu: EcuAddress, address: u32, size: u32) -> Self {
        let mut data = vec![0x00, 0x44];
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&size.to_be_bytes());
        Self::new(Target::Physical(ecu), UdsCommand::RequestDownload, None, data)
    }

    /// TransferData (0x36)
    pub fn transfer_data(ecu: EcuAddress, sequence: u8, block: &[u8]) -> Self {
        let mut data = Vec::with_capacity(block.len() + 1);
        data.push(sequence);
        data.extend_from_slice(block);
        Self::new(Target::Physical(ecu), UdsCommand::TransferData, None, data)
    }

    /// RequestTransferExit (0x37)
    pub fn request_transfer_exit(ecu: EcuAddress) -> Self {
        Self::new(Target::Physical(ecu), UdsCommand::RequestTransferExit, None, vec![])
    }

    /// TesterPresent (0x3E)
    pub fn tester_present(target: Target, suppress_response: bool) -> Self {
        let sub = if suppress_response { SUPPRESS_POSITIVE_RESPONSE } else { 0x00 };
        Self::new(target, UdsCommand::TesterPresent, Some(sub), vec![])
    }

    /// Returns true if the ECU will not send a positive response
    pub fn suppress_positive_response(&self) -> bool {
        self.sub_function
            .is_some_and(|s| s & SUPPRESS_POSITIVE_RESPONSE != 0)
    }

    /// Physical destination, if any
    pub fn ecu(&self) -> Option<EcuAddress> {
        match self.target {
            Target::Physical(ecu) => Some(ecu),
            Target::Functional(_) => None,
        }
    }

    /// Serializes the request into the ISO-TP payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.data.len());
        out.push(self.service);
        if let Some(sub) = self.sub_function {
            out.push(sub);
        }
        out.extend_from_slice(&self.data);
        out
    }
}

/// A UDS response from an ECU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticResponse {
    /// CAN ID the response came from
    pub source: CanId,
    /// Service ID of the request this answers
    pub service: u8,
    /// True for a positive response
    pub positive: bool,
    /// Negative response code, for negative responses
    pub nrc: Option<u8>,
    /// Response bytes after the (positive) response SID. Empty for negative responses
    pub data: Vec<u8>,
}

/// How a received message relates to an outstanding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Positive response to the request
    Positive(DiagnosticResponse),
    /// Final negative response to the request
    Negative(DiagnosticResponse),
    /// NRC 0x78, the ECU needs more time
    Pending,
    /// NRC 0x21, the ECU asks for the request to be sent again
    BusyRepeat,
    /// Not a response to this request
    Stray,
}

/// Classifies a message received from `source` against a request for `service`
pub fn classify(service: u8, source: CanId, payload: &[u8]) -> ResponseKind {
    match payload {
        [NEGATIVE_RESPONSE_SID, sid, code, ..] if *sid == service => match UdsErrorByte::from(*code) {
            Standard(UdsError::RequestCorrectlyReceivedResponsePending) => ResponseKind::Pending,
            Standard(UdsError::BusyRepeatRequest) => ResponseKind::BusyRepeat,
            _ => ResponseKind::Negative(DiagnosticResponse {
                source,
                service,
                positive: false,
                nrc: Some(*code),
                data: vec![],
            }),
        },
        [sid, rest @ ..] if *sid == service.wrapping_add(POSITIVE_RESPONSE_OFFSET) => {
            ResponseKind::Positive(DiagnosticResponse {
                source,
                service,
                positive: true,
                nrc: None,
                data: rest.to_vec(),
            })
        }
        _ => ResponseKind::Stray,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECU: EcuAddress = EcuAddress::new(CanId::Standard(0x7E0), CanId::Standard(0x7E8));

    #[test]
    fn request_bytes() {
        assert_eq!(
            DiagnosticRequest::session_control(ECU, DiagSession::Programming).to_bytes(),
            vec![0x10, 0x02]
        );
        assert_eq!(
            DiagnosticRequest::ecu_reset(ECU, ResetType::HardReset).to_bytes(),
            vec![0x11, 0x01]
        );
        assert_eq!(
            DiagnosticRequest::read_data_by_identifier(Target::Physical(ECU), 0xF190).to_bytes(),
            vec![0x22, 0xF1, 0x90]
        );
        assert_eq!(
            DiagnosticRequest::request_download(ECU, 0x0800_0000, 0x300).to_bytes(),
            vec![0x34, 0x00, 0x44, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00]
        );
        assert_eq!(
            DiagnosticRequest::transfer_data(ECU, 1, &[0xAA, 0xBB]).to_bytes(),
            vec![0x36, 0x01, 0xAA, 0xBB]
        );
        let tp = DiagnosticRequest::tester_present(Target::Functional(CanId::Standard(0x7DF)), true);
        assert_eq!(tp.to_bytes(), vec![0x3E, 0x80]);
        assert!(tp.suppress_positive_response());
        assert_eq!(tp.ecu(), None);
    }

    #[test]
    fn response_classification() {
        let src = ECU.response_id;
        assert!(matches!(
            classify(0x22, src, &[0x62, 0xF1, 0x90, 0x01]),
            ResponseKind::Positive(r) if r.data == vec![0xF1, 0x90, 0x01] && r.positive
        ));
        assert_eq!(classify(0x22, src, &[0x7F, 0x22, 0x78]), ResponseKind::Pending);
        assert_eq!(classify(0x22, src, &[0x7F, 0x22, 0x21]), ResponseKind::BusyRepeat);
        assert!(matches!(
            classify(0x22, src, &[0x7F, 0x22, 0x31]),
            ResponseKind::Negative(r) if r.nrc == Some(0x31) && !r.positive
        ));
        // Answers to another service, or garbage
        assert_eq!(classify(0x22, src, &[0x7F, 0x10, 0x12]), ResponseKind::Stray);
        assert_eq!(classify(0x22, src, &[0x50, 0x01]), ResponseKind::Stray);
        assert_eq!(classify(0x22, src, &[0x7F, 0x22]), ResponseKind::Stray);
        assert_eq!(classify(0x22, src, &[]), ResponseKind::Stray);
    }

    #[test]
    fn nrc_names() {
        assert_eq!(describe_nrc(0x31), "RequestOutOfRange");
        assert!(!describe_nrc(0x01).is_empty());
    }
}
