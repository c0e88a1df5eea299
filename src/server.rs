//! ECU side UDS responder
//!
//! [EcuServer] answers diagnostic requests the way a bootloader would. It keeps
//! its own session state (with S3 fallback), applies the same service gate as
//! the client, and writes downloaded blocks through a [FlashDriver]. It is used
//! as the remote end of the bus in bench setups and tests.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use automotive_diag::uds::{UdsCommand, UdsError};
use log::{debug, error, info, warn};

use crate::{
    channel::{CanChannel, CanId},
    flash::{FlashDriver, FlashError, FlashProgress, FlashState, FlashTransfer},
    isotp::{InboundMessage, IsoTpEngine, IsoTpHandle, IsoTpSettings, PeerPair},
    session::{permitted_sessions, DiagSession, EcuSessionState, SessionOptions},
    uds::{DiagnosticResult, EcuAddress, NEGATIVE_RESPONSE_SID, POSITIVE_RESPONSE_OFFSET, SUPPRESS_POSITIVE_RESPONSE},
};

/// ECU server options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuServerOptions {
    /// ISO-TP settings
    pub isotp: IsoTpSettings,
    /// S3 session timeout
    pub session: SessionOptions,
    /// Functional request ID to listen on, if any
    pub functional_id: Option<CanId>,
    /// maxNumberOfBlockLength returned for RequestDownload (Includes SID and counter)
    pub max_block_length: u16,
    /// Delay before every response
    pub response_delay: Duration,
    /// Number of NRC 0x78 response pending messages sent before every response
    pub pending_responses: u8,
    /// Time between response pending messages
    pub pending_interval: Duration,
}

impl Default for EcuServerOptions {
    fn default() -> Self {
        Self {
            isotp: IsoTpSettings::default(),
            session: SessionOptions::default(),
            functional_id: Some(CanId::Standard(0x7DF)),
            max_block_length: 0x0102,
            response_delay: Duration::ZERO,
            pending_responses: 0,
            pending_interval: Duration::from_millis(20),
        }
    }
}

type Handled = Result<Option<Vec<u8>>, UdsError>;

fn positive(sub_function: u8, data: Vec<u8>) -> Handled {
    if sub_function & SUPPRESS_POSITIVE_RESPONSE != 0 {
        Ok(None)
    } else {
        Ok(Some(data))
    }
}

fn single_arg(args: &[u8]) -> Result<u8, UdsError> {
    match args {
        [x] => Ok(*x),
        _ => Err(UdsError::IncorrectMessageLengthOrInvalidFormat),
    }
}

fn be_value(bytes: &[u8]) -> usize {
    bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
}

struct ServerState {
    options: EcuServerOptions,
    session: EcuSessionState,
    flash: FlashTransfer,
    download_address: u32,
    driver: Box<dyn FlashDriver>,
    identifiers: HashMap<u16, Vec<u8>>,
    resets: u32,
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerState")
            .field("session", &self.session)
            .field("flash", &self.flash)
            .field("download_address", &self.download_address)
            .field("identifiers", &self.identifiers)
            .field("resets", &self.resets)
            .finish()
    }
}

impl ServerState {
    fn new(driver: Box<dyn FlashDriver>, options: EcuServerOptions, now: Instant) -> Self {
        Self {
            options,
            session: EcuSessionState::new(now),
            flash: FlashTransfer::default(),
            download_address: 0,
            driver,
            identifiers: HashMap::new(),
            resets: 0,
        }
    }

    fn session_at(&self, now: Instant) -> DiagSession {
        self.session.session_at(now, self.options.session.s3_timeout)
    }

    fn enter(&mut self, session: DiagSession, now: Instant) {
        if self.session.session() == DiagSession::Programming && session != DiagSession::Programming {
            self.flash.abort();
        }
        self.session.enter(session, now);
    }

    /// Handles one request. Returns the response to send, if any
    fn handle(&mut self, request: &[u8], functional: bool, now: Instant) -> Option<Vec<u8>> {
        let (&sid, args) = request.split_first()?;
        if self.session.refresh(now, self.options.session.s3_timeout) == Some(DiagSession::Programming) {
            self.flash.abort();
        }
        self.session.touch(now);

        let res = match UdsCommand::try_from(sid) {
            Err(_) => Err(UdsError::ServiceNotSupported),
            Ok(_) if !permitted_sessions(sid).contains(self.session.session().into()) => {
                Err(UdsError::ServiceNotSupportedInActiveSession)
            }
            Ok(cmd) => self.dispatch(cmd, args, now),
        };
        match res {
            Ok(Some(data)) => {
                let mut out = Vec::with_capacity(data.len() + 1);
                out.push(sid.wrapping_add(POSITIVE_RESPONSE_OFFSET));
                out.extend(data);
                Some(out)
            }
            Ok(None) => None,
            Err(
                UdsError::ServiceNotSupported
                | UdsError::SubFunctionNotSupported
                | UdsError::RequestOutOfRange
                | UdsError::ServiceNotSupportedInActiveSession,
            ) if functional => None,
            Err(e) => {
                warn!("Rejecting service 0x{sid:02X}: {e:?}");
                Some(vec![NEGATIVE_RESPONSE_SID, sid, e.into()])
            }
        }
    }

    fn dispatch(&mut self, cmd: UdsCommand, args: &[u8], now: Instant) -> Handled {
        match cmd {
            UdsCommand::DiagnosticSessionControl => {
                let sub = single_arg(args)?;
                let session = DiagSession::from_sub_function(sub).ok_or(UdsError::SubFunctionNotSupported)?;
                self.enter(session, now);
                // P2 = 50ms, P2* = 5000ms
                positive(sub, vec![sub & 0x7F, 0x00, 0x32, 0x01, 0xF4])
            }
            UdsCommand::ECUReset => {
                let sub = single_arg(args)?;
                if !(0x01..=0x03).contains(&(sub & 0x7F)) {
                    return Err(UdsError::SubFunctionNotSupported);
                }
                info!("ECU reset (0x{:02X})", sub & 0x7F);
                self.resets += 1;
                self.enter(DiagSession::Default, now);
                positive(sub, vec![sub & 0x7F])
            }
            UdsCommand::TesterPresent => {
                let sub = single_arg(args)?;
                if sub & 0x7F != 0 {
                    return Err(UdsError::SubFunctionNotSupported);
                }
                positive(sub, vec![0x00])
            }
            UdsCommand::ReadDataByIdentifier => {
                let [hi, lo] = args else {
                    return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
                };
                let value = self
                    .identifiers
                    .get(&u16::from_be_bytes([*hi, *lo]))
                    .ok_or(UdsError::RequestOutOfRange)?;
                let mut out = vec![*hi, *lo];
                out.extend_from_slice(value);
                Ok(Some(out))
            }
            UdsCommand::WriteDataByIdentifier => {
                let [hi, lo, value @ ..] = args else {
                    return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
                };
                if value.is_empty() {
                    return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
                }
                let slot = self
                    .identifiers
                    .get_mut(&u16::from_be_bytes([*hi, *lo]))
                    .ok_or(UdsError::RequestOutOfRange)?;
                *slot = value.to_vec();
                Ok(Some(vec![*hi, *lo]))
            }
            UdsCommand::RequestDownload => self.request_download(args),
            UdsCommand::TransferData => self.transfer_data(args),
            UdsCommand::RequestTransferExit => {
                if !args.is_empty() {
                    return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
                }
                self.flash.complete().map_err(|e| {
                    error!("Transfer exit rejected: {e}");
                    UdsError::RequestSequenceError
                })?;
                info!("Download complete");
                Ok(Some(vec![]))
            }
            _ => Err(UdsError::ServiceNotSupported),
        }
    }

    fn request_download(&mut self, args: &[u8]) -> Handled {
        let [_format, alfid, rest @ ..] = args else {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        let addr_len = (alfid & 0x0F) as usize;
        let size_len = (alfid >> 4) as usize;
        if !(1..=4).contains(&addr_len) || !(1..=4).contains(&size_len) {
            return Err(UdsError::RequestOutOfRange);
        }
        if rest.len() != addr_len + size_len {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        if self.flash.state().is_active() {
            return Err(UdsError::ConditionsNotCorrect);
        }
        let address = be_value(&rest[..addr_len]) as u32;
        let size = be_value(&rest[addr_len..]);
        self.driver.erase(address, size).map_err(|e| {
            error!("Erase failed: {e}");
            UdsError::UploadDownloadNotAccepted
        })?;
        self.flash
            .download_accepted(size, self.options.max_block_length as usize)
            .map_err(|_| UdsError::UploadDownloadNotAccepted)?;
        self.download_address = address;
        info!("Download of {size} bytes to 0x{address:08X} accepted");
        let [hi, lo] = self.options.max_block_length.to_be_bytes();
        Ok(Some(vec![0x20, hi, lo]))
    }

    fn transfer_data(&mut self, args: &[u8]) -> Handled {
        let [sequence, data @ ..] = args else {
            return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        let address = u32::try_from(self.flash.offset())
            .ok()
            .and_then(|offset| self.download_address.checked_add(offset));
        let Some(address) = address else {
            error!("Block {sequence} lies beyond the end of the address space");
            self.flash.abort();
            return Err(UdsError::RequestOutOfRange);
        };
        self.flash.accept_block(*sequence, data.len()).map_err(|e| match e {
            FlashError::SequenceError { .. } => UdsError::WrongBlockSequenceCounter,
            FlashError::InvalidState { .. } => UdsError::RequestSequenceError,
            _ => UdsError::TransferDataSuspended,
        })?;
        let written = self
            .driver
            .program(address, data)
            .and_then(|_| self.driver.verify(address, data));
        if let Err(e) = written {
            error!("Programming block {sequence} failed: {e}");
            self.flash.abort();
            return Err(UdsError::GeneralProgrammingFailure);
        }
        debug!("Programmed block {sequence} ({} bytes) at 0x{address:08X}", data.len());
        Ok(Some(vec![*sequence]))
    }
}

/// Simulated ECU answering UDS requests on a CAN channel
#[derive(Debug)]
pub struct EcuServer {
    address: EcuAddress,
    state: Arc<Mutex<ServerState>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EcuServer {
    /// Starts the server on `channel`, answering requests to `address`
    pub fn start(
        channel: Box<dyn CanChannel>,
        address: EcuAddress,
        driver: Box<dyn FlashDriver>,
        options: EcuServerOptions,
    ) -> DiagnosticResult<Self> {
        let (tx, rx) = mpsc::channel::<InboundMessage>();
        let engine = IsoTpEngine::start(channel, options.isotp, tx)?;
        let handle = engine.handle();
        handle.add_route(address.server_pair())?;
        if let Some(id) = options.functional_id {
            handle.add_route(PeerPair::new(address.response_id, id))?;
        }
        let state = Arc::new(Mutex::new(ServerState::new(driver, options, Instant::now())));
        let running = Arc::new(AtomicBool::new(true));

        let state_c = state.clone();
        let running_c = running.clone();
        let thread = std::thread::spawn(move || {
            // Keeps the engine alive as long as the server
            let _engine = engine;
            while running_c.load(Ordering::Relaxed) {
                let msg = match rx.recv_timeout(Duration::from_millis(10)) {
                    Ok(m) => m,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let request = match msg.result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Failed to receive request: {e}");
                        continue;
                    }
                };
                let functional = Some(msg.pair.remote_id) == options.functional_id;
                debug!("ECU request {request:02X?} (functional: {functional})");
                let reply = state_c
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handle(&request, functional, Instant::now());
                if let (Some(reply), Some(&sid)) = (reply, request.first()) {
                    respond(&handle, address, sid, reply, &options);
                }
            }
        });
        Ok(Self {
            address,
            state,
            running,
            thread: Some(thread),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ServerState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Address the server answers on
    pub fn address(&self) -> EcuAddress {
        self.address
    }

    /// Current diagnostic session
    pub fn session(&self) -> DiagSession {
        self.with_state(|s| s.session_at(Instant::now()))
    }

    /// Download progress
    pub fn flash_progress(&self) -> FlashProgress {
        self.with_state(|s| s.flash.progress())
    }

    /// Download state
    pub fn flash_state(&self) -> FlashState {
        self.with_state(|s| s.flash.state())
    }

    /// Number of resets performed
    pub fn reset_count(&self) -> u32 {
        self.with_state(|s| s.resets)
    }

    /// Defines a data identifier readable with 0x22 and writable with 0x2E
    pub fn set_identifier(&self, did: u16, value: &[u8]) {
        self.with_state(|s| s.identifiers.insert(did, value.to_vec()));
    }

    /// Current value of a data identifier
    pub fn identifier(&self, did: u16) -> Option<Vec<u8>> {
        self.with_state(|s| s.identifiers.get(&did).cloned())
    }

    /// Stops the server
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                error!("ECU server thread panicked");
            }
        }
    }
}

impl Drop for EcuServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn respond(handle: &IsoTpHandle, address: EcuAddress, sid: u8, reply: Vec<u8>, options: &EcuServerOptions) {
    if !options.response_delay.is_zero() {
        std::thread::sleep(options.response_delay);
    }
    for _ in 0..options.pending_responses {
        let pending = vec![NEGATIVE_RESPONSE_SID, sid, UdsError::RequestCorrectlyReceivedResponsePending.into()];
        if let Err(e) = handle.send(address.server_pair(), pending) {
            error!("Failed to send response pending: {e}");
            return;
        }
        std::thread::sleep(options.pending_interval);
    }
    if let Err(e) = handle.send(address.server_pair(), reply) {
        error!("Failed to send response: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::MemoryFlash;

    fn server(flash: &MemoryFlash) -> ServerState {
        let options = EcuServerOptions {
            max_block_length: 6,
            ..Default::default()
        };
        let mut s = ServerState::new(Box::new(flash.clone()), options, Instant::now());
        s.identifiers.insert(0xF190, b"VIN".to_vec());
        s
    }

    fn req(s: &mut ServerState, bytes: &[u8]) -> Option<Vec<u8>> {
        s.handle(bytes, false, Instant::now())
    }

    #[test]
    fn session_gate() {
        let flash = MemoryFlash::new(0, 64);
        let mut s = server(&flash);
        assert_eq!(
            req(&mut s, &[0x34, 0x00, 0x11, 0x00, 0x10]),
            Some(vec![0x7F, 0x34, 0x7F])
        );
        assert_eq!(req(&mut s, &[0x2E, 0xF1, 0x90, 0x41]), Some(vec![0x7F, 0x2E, 0x7F]));
        assert_eq!(req(&mut s, &[0x10, 0x03]), Some(vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]));
        assert_eq!(req(&mut s, &[0x2E, 0xF1, 0x90, 0x41]), Some(vec![0x6E, 0xF1, 0x90]));
        assert_eq!(req(&mut s, &[0x22, 0xF1, 0x90]), Some(vec![0x62, 0xF1, 0x90, 0x41]));
        assert_eq!(req(&mut s, &[0x22, 0xF1, 0x91]), Some(vec![0x7F, 0x22, 0x31]));
        assert_eq!(req(&mut s, &[0x10, 0x05]), Some(vec![0x7F, 0x10, 0x12]));
        assert_eq!(req(&mut s, &[0x85, 0x01]), Some(vec![0x7F, 0x85, 0x11]));
        assert_eq!(req(&mut s, &[0xBA]), Some(vec![0x7F, 0xBA, 0x11]));
    }

    #[test]
    fn suppressed_and_functional_responses() {
        let flash = MemoryFlash::new(0, 64);
        let mut s = server(&flash);
        assert_eq!(req(&mut s, &[0x3E, 0x80]), None);
        assert_eq!(req(&mut s, &[0x3E, 0x00]), Some(vec![0x7E, 0x00]));
        assert_eq!(s.handle(&[0x22, 0x12, 0x34], true, Instant::now()), None);
        assert_eq!(
            s.handle(&[0x22, 0xF1, 0x90], true, Instant::now()),
            Some(vec![0x62, 0xF1, 0x90, b'V', b'I', b'N'])
        );
    }

    #[test]
    fn download_with_corrupted_sequence() {
        let flash = MemoryFlash::new(0x100, 64);
        let mut s = server(&flash);
        req(&mut s, &[0x10, 0x02]).unwrap();
        assert_eq!(
            req(&mut s, &[0x34, 0x00, 0x12, 0x01, 0x00, 0x0C]),
            Some(vec![0x74, 0x20, 0x00, 0x06])
        );
        assert_eq!(req(&mut s, &[0x36, 0x01, 1, 2, 3, 4]), Some(vec![0x76, 0x01]));
        assert_eq!(req(&mut s, &[0x36, 0x03, 5, 6, 7, 8]), Some(vec![0x7F, 0x36, 0x73]));
        assert_eq!(req(&mut s, &[0x36, 0x03, 9, 10, 11, 12]), Some(vec![0x7F, 0x36, 0x24]));
        assert_eq!(s.flash.state(), FlashState::Aborted);
        assert_eq!(&flash.contents()[..8], &[1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(req(&mut s, &[0x37]), Some(vec![0x7F, 0x37, 0x24]));
    }

    #[test]
    fn programming_failure_aborts() {
        let flash = MemoryFlash::new(0, 64);
        let mut s = server(&flash);
        req(&mut s, &[0x10, 0x02]).unwrap();
        req(&mut s, &[0x34, 0x00, 0x11, 0x00, 0x08]).unwrap();
        flash.fail_program_at(Some(5));
        req(&mut s, &[0x36, 0x01, 1, 2, 3, 4]).unwrap();
        assert_eq!(req(&mut s, &[0x36, 0x02, 5, 6, 7, 8]), Some(vec![0x7F, 0x36, 0x72]));
        assert_eq!(s.flash.state(), FlashState::Aborted);
    }

    #[test]
    fn reset_and_session_change_abort_download() {
        let flash = MemoryFlash::new(0, 64);
        let mut s = server(&flash);
        req(&mut s, &[0x10, 0x02]).unwrap();
        req(&mut s, &[0x34, 0x00, 0x11, 0x00, 0x08]).unwrap();
        assert_eq!(req(&mut s, &[0x11, 0x01]), Some(vec![0x51, 0x01]));
        assert_eq!(s.session.session(), DiagSession::Default);
        assert_eq!(s.flash.state(), FlashState::Aborted);
        assert_eq!(s.resets, 1);
    }

    #[test]
    fn download_address_overflow_is_rejected() {
        let flash = MemoryFlash::new(0xFFFF_FFF0, 0x20);
        let options = EcuServerOptions {
            max_block_length: 18,
            ..Default::default()
        };
        let mut s = ServerState::new(Box::new(flash.clone()), options, Instant::now());
        req(&mut s, &[0x10, 0x02]).unwrap();
        assert_eq!(
            req(&mut s, &[0x34, 0x00, 0x14, 0xFF, 0xFF, 0xFF, 0xF0, 0x20]),
            Some(vec![0x74, 0x20, 0x00, 0x12])
        );
        let mut block = vec![0x36, 0x01];
        block.extend([0xA5; 16]);
        assert_eq!(req(&mut s, &block), Some(vec![0x76, 0x01]));
        assert_eq!(req(&mut s, &[0x36, 0x02, 0x5A, 0x5A]), Some(vec![0x7F, 0x36, 0x31]));
        assert_eq!(s.flash.state(), FlashState::Aborted);
        assert!(flash.contents()[..0x10].iter().all(|b| *b == 0xA5));
    }

    #[test]
    fn s3_timeout_falls_back_to_default() {
        let flash = MemoryFlash::new(0, 64);
        let mut s = server(&flash);
        let now = Instant::now();
        s.handle(&[0x10, 0x02], false, now).unwrap();
        s.handle(&[0x34, 0x00, 0x11, 0x00, 0x08], false, now).unwrap();
        let later = now + Duration::from_secs(6);
        assert_eq!(s.session_at(later), DiagSession::Default);
        assert_eq!(
            s.handle(&[0x36, 0x01, 1, 2], false, later),
            Some(vec![0x7F, 0x36, 0x7F])
        );
        assert_eq!(s.flash.state(), FlashState::Aborted);
    }
}
