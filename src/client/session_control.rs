//! Provides methods to manipulate the ECUs diagnostic session mode

use crate::{session::DiagSession, uds::{DiagnosticRequest, EcuAddress}};

use super::{Client, ClientResult};

impl Client {
    /// Requests the ECU to go into a specific diagnostic session mode
    pub fn set_session(&self, ecu: EcuAddress, session: DiagSession) -> ClientResult<()> {
        self.send(DiagnosticRequest::session_control(ecu, session))?;
        Ok(())
    }
}
