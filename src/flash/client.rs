//! Tester side of a firmware download

use log::{debug, info};

use crate::{
    client::{Client, OrchestratorError},
    isotp::MAX_MESSAGE_LEN,
    uds::{DiagnosticError, DiagnosticRequest, DiagnosticResponse, EcuAddress},
};

use super::{FlashError, FlashProgress, FlashResult};

/// Reads maxNumberOfBlockLength from a positive RequestDownload response
fn max_block_length(resp: &DiagnosticResponse) -> FlashResult<usize> {
    let invalid = |reason: &str| {
        FlashError::Exchange(OrchestratorError::Diagnostic(DiagnosticError::InvalidResponse {
            service: resp.service,
            reason: reason.into(),
        }))
    };
    let (&lfid, rest) = resp.data.split_first().ok_or_else(|| invalid("response too short"))?;
    let len = (lfid >> 4) as usize;
    if len == 0 || len > size_of::<usize>() {
        return Err(invalid("invalid length format identifier"));
    }
    let bytes = rest.get(..len).ok_or_else(|| invalid("block length truncated"))?;
    Ok(bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
}

impl Client {
    /// Downloads `image` to `address` on the ECU.
    ///
    /// Runs RequestDownload, then TransferData blocks sized to the ECU's maximum
    /// block length, then RequestTransferExit. The ECU must be in the programming
    /// session. `hook` receives the progress after every step. Any failure aborts
    /// the download and leaves the ECU in the programming session.
    pub fn flash_image(
        &self,
        ecu: EcuAddress,
        address: u32,
        image: &[u8],
        mut hook: impl FnMut(FlashProgress),
    ) -> FlashResult<()> {
        let size = u32::try_from(image.len()).map_err(|_| FlashError::Overrun {
            len: image.len(),
            remaining: u32::MAX as usize,
        })?;
        info!("Flashing {} bytes to 0x{address:08X} on {ecu}", image.len());
        let resp = self.send(DiagnosticRequest::request_download(ecu, address, size))?;
        // A TransferData request must fit in one ISO-TP message
        let max = max_block_length(&resp)?.min(MAX_MESSAGE_LEN);
        self.sessions()
            .with_flash(ecu, |f| f.download_accepted(image.len(), max))?;
        hook(self.flash_progress(ecu));

        let res = self.transfer_image(ecu, image, &mut hook);
        if res.is_err() {
            self.abort_flash(ecu);
            hook(self.flash_progress(ecu));
        }
        res
    }

    fn transfer_image(&self, ecu: EcuAddress, image: &[u8], hook: &mut impl FnMut(FlashProgress)) -> FlashResult<()> {
        let mut offset = 0;
        while offset < image.len() {
            let (sequence, max) = self.sessions().with_flash(ecu, |f| {
                if f.state().is_active() {
                    Ok((f.next_sequence(), f.max_payload()))
                } else {
                    Err(FlashError::InvalidState {
                        state: f.state(),
                        operation: "transfer data",
                    })
                }
            })?;
            let end = (offset + max).min(image.len());
            let block = &image[offset..end];
            let resp = self.send(DiagnosticRequest::transfer_data(ecu, sequence, block))?;
            match resp.data.first() {
                Some(&echo) if echo == sequence => {}
                Some(&echo) => {
                    return Err(FlashError::SequenceError {
                        expected: sequence,
                        received: echo,
                    });
                }
                None => {
                    return Err(FlashError::Exchange(OrchestratorError::Diagnostic(
                        DiagnosticError::InvalidResponse {
                            service: resp.service,
                            reason: "block sequence counter missing".into(),
                        },
                    )));
                }
            }
            self.sessions()
                .with_flash(ecu, |f| f.accept_block(sequence, block.len()))?;
            offset = end;
            debug!("Block {sequence} accepted, {offset}/{} bytes", image.len());
            hook(self.flash_progress(ecu));
        }
        self.send(DiagnosticRequest::request_transfer_exit(ecu))?;
        self.sessions().with_flash(ecu, |f| f.complete())?;
        info!("Flashing {ecu} completed");
        hook(self.flash_progress(ecu));
        Ok(())
    }

    /// Aborts the download to `ecu`. No further blocks are sent
    pub fn abort_flash(&self, ecu: EcuAddress) {
        self.sessions().with_flash(ecu, |f| f.abort());
    }
}
