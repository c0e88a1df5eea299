//! Reading and writing data by identifier (0x22 / 0x2E)

use std::time::Duration;

use crate::uds::{DiagnosticError, DiagnosticRequest, DiagnosticResponse, EcuAddress, Target};

use super::{Client, ClientResult};

fn strip_identifier(service: u8, did: u16, resp: &DiagnosticResponse) -> Result<Vec<u8>, DiagnosticError> {
    match resp.data.split_first_chunk::<2>() {
        Some((echo, value)) if u16::from_be_bytes(*echo) == did => Ok(value.to_vec()),
        Some((echo, _)) => Err(DiagnosticError::InvalidResponse {
            service,
            reason: format!(
                "requested ident 0x{did:04X}, received 0x{:04X}",
                u16::from_be_bytes(*echo)
            ),
        }),
        None => Err(DiagnosticError::InvalidResponse {
            service,
            reason: "response too short".into(),
        }),
    }
}

/// Answer of one ECU to a functional identification read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentificationRecord {
    /// ECU response ID
    pub source: crate::channel::CanId,
    /// Identifier value, or the negative response code
    pub value: Result<Vec<u8>, u8>,
}

impl Client {
    /// Reads a data identifier from one ECU
    pub fn read_data_by_identifier(&self, ecu: EcuAddress, did: u16) -> ClientResult<Vec<u8>> {
        let req = DiagnosticRequest::read_data_by_identifier(Target::Physical(ecu), did);
        let service = req.service;
        let resp = self.send(req)?;
        Ok(strip_identifier(service, did, &resp)?)
    }

    /// Writes a data identifier
    pub fn write_data_by_identifier(&self, ecu: EcuAddress, did: u16, value: &[u8]) -> ClientResult<()> {
        let req = DiagnosticRequest::write_data_by_identifier(ecu, did, value);
        let service = req.service;
        let resp = self.send(req)?;
        match resp.data.get(..2) {
            Some(echo) if echo == did.to_be_bytes() => Ok(()),
            _ => Err(DiagnosticError::InvalidResponse {
                service,
                reason: format!("write of ident 0x{did:04X} not echoed"),
            }
            .into()),
        }
    }

    /// Reads an identification data identifier from every ECU on the bus.
    ///
    /// The request is sent functionally, all answers within `window` are returned.
    pub fn read_identification(&self, did: u16, window: Duration) -> ClientResult<Vec<IdentificationRecord>> {
        let req = DiagnosticRequest::read_data_by_identifier(Target::Functional(self.functional_id()), did);
        let service = req.service;
        let responses = self.broadcast(req, window)?;
        Ok(responses
            .into_iter()
            .filter_map(|r| {
                let value = if r.positive {
                    match strip_identifier(service, did, &r) {
                        Ok(v) => Ok(v),
                        Err(e) => {
                            log::warn!("Ignoring identification from {}: {e}", r.source);
                            return None;
                        }
                    }
                } else {
                    Err(r.nrc.unwrap_or_default())
                };
                Some(IdentificationRecord {
                    source: r.source,
                    value,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CanId;

    fn resp(data: Vec<u8>) -> DiagnosticResponse {
        DiagnosticResponse {
            source: CanId::Standard(0x7E8),
            service: 0x22,
            positive: true,
            nrc: None,
            data,
        }
    }

    #[test]
    fn identifier_echo_is_checked() {
        assert_eq!(strip_identifier(0x22, 0xF190, &resp(vec![0xF1, 0x90, 0x41])), Ok(vec![0x41]));
        assert!(matches!(
            strip_identifier(0x22, 0xF190, &resp(vec![0xF1, 0x91, 0x41])),
            Err(DiagnosticError::InvalidResponse { .. })
        ));
        assert!(strip_identifier(0x22, 0xF190, &resp(vec![0xF1])).is_err());
    }
}
