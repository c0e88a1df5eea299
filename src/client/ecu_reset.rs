//! Provides methods to reset the ECU in order to simulate power cycling and resetting memory regions

pub use automotive_diag::uds::ResetType;

use crate::uds::{DiagnosticRequest, EcuAddress};

use super::{Client, ClientResult};

impl Client {
    /// Asks the ECU to perform a reset. On success the ECU is back in the default session
    pub fn ecu_reset(&self, ecu: EcuAddress, reset: ResetType) -> ClientResult<()> {
        self.send(DiagnosticRequest::ecu_reset(ecu, reset))?;
        Ok(())
    }

    /// Asks the ECU to perform a hard reset. See [ResetType::HardReset] for more details
    pub fn ecu_hard_reset(&self, ecu: EcuAddress) -> ClientResult<()> {
        self.ecu_reset(ecu, ResetType::HardReset)
    }

    /// Asks the ECU to perform a soft reset. See [ResetType::SoftReset] for more details
    pub fn ecu_soft_reset(&self, ecu: EcuAddress) -> ClientResult<()> {
        self.ecu_reset(ecu, ResetType::SoftReset)
    }
}
