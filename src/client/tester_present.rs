//! Keeps a non default diagnostic session alive

use crate::uds::{DiagnosticRequest, EcuAddress, Target};

use super::{Client, ClientResult};

impl Client {
    /// Sends TesterPresent with the suppress positive response bit set,
    /// restarting the S3 timer on both ends
    pub fn tester_present(&self, ecu: EcuAddress) -> ClientResult<()> {
        self.send(DiagnosticRequest::tester_present(Target::Physical(ecu), true))?;
        self.sessions().touch(ecu);
        Ok(())
    }
}
