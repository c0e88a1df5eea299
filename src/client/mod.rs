//! Tester side diagnostic client
//!
//! [Client] owns the dispatcher and the session manager. It allows one
//! outstanding exchange per ECU, gates every physical request on the ECU's
//! diagnostic session, and collects responses to functional requests.
//!
//! The typed UDS services live in their own modules, each adding methods to [Client].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use log::{debug, warn};

use crate::{
    channel::{CanChannel, CanId},
    flash::FlashProgress,
    isotp::IsoTpSettings,
    session::{DiagSession, SessionManager, SessionOptions},
    uds::{
        CancelToken, DiagnosticError, DiagnosticRequest, DiagnosticResponse, DiagnosticResult, Dispatcher,
        DispatcherOptions, EcuAddress, Target,
    },
};

mod data_identifier;
mod ecu_reset;
mod session_control;
mod tester_present;

pub use data_identifier::IdentificationRecord;
pub use ecu_reset::ResetType;

/// Client result
pub type ClientResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Client error
pub enum OrchestratorError {
    /// An exchange with this ECU is already in flight
    #[error("an exchange with {0} is already in progress")]
    Busy(EcuAddress),
    /// Operation needs a physically addressed request
    #[error("request must be physically addressed")]
    NotPhysical,
    /// Operation needs a functionally addressed request
    #[error("request must be functionally addressed")]
    NotFunctional,
    /// The exchange was cancelled
    #[error("exchange was cancelled")]
    Cancelled,
    /// The request failed
    #[error(transparent)]
    Diagnostic(DiagnosticError),
}

impl From<DiagnosticError> for OrchestratorError {
    fn from(e: DiagnosticError) -> Self {
        match e {
            DiagnosticError::Cancelled => Self::Cancelled,
            other => Self::Diagnostic(other),
        }
    }
}

/// Client configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientOptions {
    /// ISO-TP settings
    pub isotp: IsoTpSettings,
    /// Response timing
    pub dispatcher: DispatcherOptions,
    /// Session tracking
    pub session: SessionOptions,
    /// Functional (broadcast) request ID
    pub functional_id: CanId,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            isotp: IsoTpSettings::default(),
            dispatcher: DispatcherOptions::default(),
            session: SessionOptions::default(),
            functional_id: CanId::Standard(0x7DF),
        }
    }
}

type Slots = Arc<Mutex<HashMap<EcuAddress, u64>>>;

fn release(slots: &Slots, ecu: EcuAddress, id: u64) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if slots.get(&ecu) == Some(&id) {
        slots.remove(&ecu);
    }
}

/// A physical exchange running in the background
#[derive(Debug)]
pub struct Exchange {
    ecu: EcuAddress,
    id: u64,
    cancel: CancelToken,
    result: mpsc::Receiver<DiagnosticResult<DiagnosticResponse>>,
    slots: Slots,
}

impl Exchange {
    /// ECU the exchange is with
    pub fn ecu(&self) -> EcuAddress {
        self.ecu
    }

    /// Cancels the exchange. The ECU is immediately free for a new exchange
    pub fn cancel(&self) {
        debug!("Cancelling exchange with {}", self.ecu);
        self.cancel.cancel();
        release(&self.slots, self.ecu, self.id);
    }

    /// Returns the result if the exchange has finished
    pub fn try_result(&self) -> Option<ClientResult<DiagnosticResponse>> {
        match self.result.try_recv() {
            Ok(r) => Some(r.map_err(Into::into)),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(OrchestratorError::Cancelled)),
        }
    }

    /// Blocks until the exchange finishes
    pub fn wait(self) -> ClientResult<DiagnosticResponse> {
        match self.result.recv() {
            Ok(r) => r.map_err(Into::into),
            Err(_) => Err(OrchestratorError::Cancelled),
        }
    }
}

/// Diagnostic client for the tester side of the bus
#[derive(Debug)]
pub struct Client {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    slots: Slots,
    next_exchange: AtomicU64,
    functional_id: CanId,
    /// Registered ECUs by response ID
    ecus: RwLock<HashMap<CanId, EcuAddress>>,
}

impl Client {
    /// Starts a client on `channel`
    pub fn start(channel: Box<dyn CanChannel>, options: ClientOptions) -> ClientResult<Self> {
        let dispatcher = Dispatcher::start(channel, options.isotp, options.dispatcher)?;
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            sessions: Arc::new(SessionManager::new(options.session)),
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_exchange: AtomicU64::new(0),
            functional_id: options.functional_id,
            ecus: RwLock::new(HashMap::new()),
        })
    }

    /// Makes `ecu` known to the client, so it can answer functional requests
    pub fn add_ecu(&self, ecu: EcuAddress) -> ClientResult<()> {
        self.dispatcher.register(ecu)?;
        self.ecus
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ecu.response_id, ecu);
        Ok(())
    }

    /// Functional request ID
    pub fn functional_id(&self) -> CanId {
        self.functional_id
    }

    /// Current diagnostic session of `ecu`
    pub fn session(&self, ecu: EcuAddress) -> DiagSession {
        self.sessions.current_session(ecu)
    }

    /// Flash download progress of `ecu`
    pub fn flash_progress(&self, ecu: EcuAddress) -> FlashProgress {
        self.sessions.flash_progress(ecu)
    }

    pub(crate) fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Starts a physical exchange in the background.
    ///
    /// Fails immediately with [DiagnosticError::WrongSession] if the service is not
    /// permitted in the ECU's session, or with [OrchestratorError::Busy] if an
    /// exchange with the ECU is still unresolved.
    pub fn submit(&self, request: DiagnosticRequest) -> ClientResult<Exchange> {
        let Target::Physical(ecu) = request.target else {
            return Err(OrchestratorError::NotPhysical);
        };
        self.sessions.check(ecu, request.service)?;
        let id = self.next_exchange.fetch_add(1, Ordering::Relaxed);
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots.contains_key(&ecu) {
                warn!("Rejecting request 0x{:02X}, {ecu} is busy", request.service);
                return Err(OrchestratorError::Busy(ecu));
            }
            slots.insert(ecu, id);
        }

        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let dispatcher = self.dispatcher.clone();
        let sessions = self.sessions.clone();
        let slots = self.slots.clone();
        let cancel_c = cancel.clone();
        std::thread::spawn(move || {
            let res = dispatcher.request(&request, &cancel_c);
            match &res {
                Ok(resp) => sessions.observe(ecu, &request, resp),
                Err(DiagnosticError::Negative { .. }) => sessions.touch(ecu),
                Err(_) => {}
            }
            release(&slots, ecu, id);
            let _ = tx.send(res);
        });
        Ok(Exchange {
            ecu,
            id,
            cancel,
            result: rx,
            slots: self.slots.clone(),
        })
    }

    /// Sends a physical request and waits for the response
    pub fn send(&self, request: DiagnosticRequest) -> ClientResult<DiagnosticResponse> {
        self.submit(request)?.wait()
    }

    /// Sends a functional request and collects the responses arriving within `window`.
    ///
    /// Only ECUs added with [Client::add_ecu] are heard. An empty result means no ECU answered.
    /// Fails with [DiagnosticError::WrongSession] if the service is not permitted in the
    /// session of any of them. The responses update each ECU's session like physical ones do.
    pub fn broadcast(&self, request: DiagnosticRequest, window: Duration) -> ClientResult<Vec<DiagnosticResponse>> {
        if !matches!(request.target, Target::Functional(_)) {
            return Err(OrchestratorError::NotFunctional);
        }
        let ecus = self.ecus.read().unwrap_or_else(PoisonError::into_inner).clone();
        for ecu in ecus.values() {
            self.sessions.check(*ecu, request.service)?;
        }
        let responses = self.dispatcher.collect(&request, window)?;
        for resp in &responses {
            match ecus.get(&resp.source) {
                Some(ecu) => self.sessions.observe(*ecu, &request, resp),
                None => warn!("Response from unknown ECU {}", resp.source),
            }
        }
        Ok(responses)
    }
}
