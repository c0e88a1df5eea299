//! Request/response correlation on top of the ISO-TP engine
//!
//! A router thread fans every message received by the engine out to the requests
//! currently waiting on it. Each waiter subscribes before its request is sent, so
//! a fast ECU can never answer before anyone is listening.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, PoisonError,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, error, trace, warn};

use crate::{
    channel::{CanChannel, CanId},
    isotp::{InboundMessage, IsoTpEngine, IsoTpHandle, IsoTpSettings},
};

use super::{
    classify, describe_nrc, DiagnosticError, DiagnosticRequest, DiagnosticResponse, DiagnosticResult,
    EcuAddress, ResponseKind, Target,
};

/// Granularity of cancellation checks while waiting
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Response timing options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DispatcherOptions {
    /// Time the ECU has to start responding (P2)
    pub response_timeout: Duration,
    /// Time window granted by each NRC 0x78 response pending (P2*)
    pub pending_timeout: Duration,
    /// Maximum number of NRC 0x78 extensions granted to a single request
    pub max_pending_extensions: u32,
    /// Maximum number of times a request is repeated after NRC 0x21
    pub busy_repeat_limit: u32,
    /// Delay before repeating a request after NRC 0x21
    pub busy_repeat_delay: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(150),
            pending_timeout: Duration::from_millis(5000),
            max_pending_extensions: 5,
            busy_repeat_limit: 3,
            busy_repeat_delay: Duration::from_millis(500),
        }
    }
}

/// Shared flag used to cancel a request from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every request using this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true once [CancelToken::cancel] was called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct Waiter {
    source: Option<CanId>,
    tx: mpsc::Sender<InboundMessage>,
}

type Waiters = Arc<Mutex<HashMap<u64, Waiter>>>;

struct Subscription {
    id: u64,
    rx: mpsc::Receiver<InboundMessage>,
    waiters: Waiters,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Sends UDS requests and matches ECU responses to them
#[derive(Debug)]
pub struct Dispatcher {
    engine: IsoTpEngine,
    handle: IsoTpHandle,
    options: DispatcherOptions,
    waiters: Waiters,
    next_waiter: AtomicU64,
    running: Arc<AtomicBool>,
    router: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").field("source", &self.source).finish()
    }
}

impl Dispatcher {
    /// Starts an ISO-TP engine on `channel` and the response router
    pub fn start(
        channel: Box<dyn CanChannel>,
        isotp: IsoTpSettings,
        options: DispatcherOptions,
    ) -> DiagnosticResult<Self> {
        let (tx, rx) = mpsc::channel::<InboundMessage>();
        let engine = IsoTpEngine::start(channel, isotp, tx)?;
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let waiters_c = waiters.clone();
        let running_c = running.clone();
        let router = std::thread::spawn(move || {
            while running_c.load(Ordering::Relaxed) {
                match rx.recv_timeout(POLL_SLICE) {
                    Ok(msg) => {
                        let waiters = waiters_c.lock().unwrap_or_else(PoisonError::into_inner);
                        let mut delivered = false;
                        for w in waiters.values() {
                            if w.source.is_none_or(|s| s == msg.pair.remote_id) {
                                delivered |= w.tx.send(msg.clone()).is_ok();
                            }
                        }
                        if !delivered {
                            trace!("No waiter for message from {}: {:02X?}", msg.pair.remote_id, msg.result);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(Self {
            handle: engine.handle(),
            engine,
            options,
            waiters,
            next_waiter: AtomicU64::new(0),
            running,
            router: Some(router),
        })
    }

    /// Timing options in use
    pub fn options(&self) -> DispatcherOptions {
        self.options
    }

    /// Starts receiving responses from `ecu` (Needed for functional requests)
    pub fn register(&self, ecu: EcuAddress) -> DiagnosticResult<()> {
        Ok(self.handle.add_route(ecu.pair())?)
    }

    fn subscribe(&self, source: Option<CanId>) -> Subscription {
        let (tx, rx) = mpsc::channel();
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Waiter { source, tx });
        Subscription {
            id,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    fn transmit(&self, req: &DiagnosticRequest) -> DiagnosticResult<()> {
        if !self.engine.is_running() {
            return Err(DiagnosticError::ServerNotRunning);
        }
        let bytes = req.to_bytes();
        debug!("Sending request {bytes:02X?} to {:?}", req.target);
        match req.target {
            Target::Physical(ecu) => self.handle.send(ecu.pair(), bytes)?,
            Target::Functional(id) => self.handle.send_functional(id, bytes)?,
        }
        Ok(())
    }

    /// Sends a request and waits for its response.
    ///
    /// * NRC 0x78 restarts the wait with [DispatcherOptions::pending_timeout], at most
    ///   [DispatcherOptions::max_pending_extensions] times.
    /// * NRC 0x21 repeats the request, at most [DispatcherOptions::busy_repeat_limit] times.
    /// * Responses for other services are ignored.
    ///
    /// Requests with the suppress positive response bit set return an empty positive
    /// response as soon as they are sent.
    pub fn request(&self, req: &DiagnosticRequest, cancel: &CancelToken) -> DiagnosticResult<DiagnosticResponse> {
        let service = req.service;
        let source = req.ecu().map(|e| e.response_id);
        let sub = self.subscribe(source);
        let mut busy_repeats = 0;
        'send: loop {
            if cancel.is_cancelled() {
                return Err(DiagnosticError::Cancelled);
            }
            self.transmit(req)?;
            if req.suppress_positive_response() {
                debug!("Request doesn't require response. Just sending.");
                return Ok(DiagnosticResponse {
                    source: source.unwrap_or(CanId::Standard(0)),
                    service,
                    positive: true,
                    nrc: None,
                    data: vec![],
                });
            }
            let mut deadline = Instant::now() + self.options.response_timeout;
            let mut extensions = 0;
            loop {
                if cancel.is_cancelled() {
                    debug!("Request 0x{service:02X} cancelled");
                    return Err(DiagnosticError::Cancelled);
                }
                let now = Instant::now();
                if now >= deadline {
                    error!("ECU did not respond to service 0x{service:02X}");
                    return Err(DiagnosticError::Timeout { service });
                }
                let msg = match sub.rx.recv_timeout((deadline - now).min(POLL_SLICE)) {
                    Ok(m) => m,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Err(DiagnosticError::ServerNotRunning),
                };
                let payload = match msg.result {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Receiving response to service 0x{service:02X} failed: {e}");
                        return Err(e.into());
                    }
                };
                match classify(service, msg.pair.remote_id, &payload) {
                    ResponseKind::Positive(r) => {
                        debug!("ECU responded positively to service 0x{service:02X}");
                        return Ok(r);
                    }
                    ResponseKind::Negative(r) => {
                        let code = r.nrc.unwrap_or_default();
                        error!("ECU Negative response 0x{code:02X} ({})", describe_nrc(code));
                        return Err(DiagnosticError::Negative { service, code });
                    }
                    ResponseKind::Pending if extensions < self.options.max_pending_extensions => {
                        extensions += 1;
                        debug!("ECU response pending ({extensions}/{})", self.options.max_pending_extensions);
                        deadline = Instant::now() + self.options.pending_timeout;
                    }
                    ResponseKind::Pending => {
                        warn!("ECU response pending limit reached, not extending the deadline");
                    }
                    ResponseKind::BusyRepeat if busy_repeats < self.options.busy_repeat_limit => {
                        busy_repeats += 1;
                        warn!(
                            "ECU Responded with busy_repeat_request! Retrying in {:?}",
                            self.options.busy_repeat_delay
                        );
                        if !sleep_unless_cancelled(self.options.busy_repeat_delay, cancel) {
                            return Err(DiagnosticError::Cancelled);
                        }
                        continue 'send;
                    }
                    ResponseKind::BusyRepeat => {
                        error!("ECU still busy after {busy_repeats} repeats");
                        return Err(DiagnosticError::Negative { service, code: 0x21 });
                    }
                    ResponseKind::Stray => {
                        warn!("Ignoring stray message {payload:02X?} from {}", msg.pair.remote_id);
                    }
                }
            }
        }
    }

    /// Sends a request and collects every response that arrives within `window`.
    ///
    /// Responses are keyed by source ID, a later response from the same source
    /// replaces the earlier one. Returns once the window has elapsed, possibly with
    /// no responses at all.
    pub fn collect(&self, req: &DiagnosticRequest, window: Duration) -> DiagnosticResult<Vec<DiagnosticResponse>> {
        let service = req.service;
        let sub = self.subscribe(None);
        self.transmit(req)?;
        let deadline = Instant::now() + window;
        let mut responses: Vec<DiagnosticResponse> = Vec::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let msg = match sub.rx.recv_timeout(deadline - now) {
                Ok(m) => m,
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Err(DiagnosticError::ServerNotRunning),
            };
            let payload = match msg.result {
                Ok(p) => p,
                Err(e) => {
                    warn!("Failed to receive response from {}: {e}", msg.pair.remote_id);
                    continue;
                }
            };
            match classify(service, msg.pair.remote_id, &payload) {
                ResponseKind::Positive(r) | ResponseKind::Negative(r) => {
                    match responses.iter_mut().find(|x| x.source == r.source) {
                        Some(existing) => *existing = r,
                        None => responses.push(r),
                    }
                }
                ResponseKind::Pending | ResponseKind::BusyRepeat => {
                    debug!("{} is not ready yet", msg.pair.remote_id);
                }
                ResponseKind::Stray => {
                    warn!("Ignoring stray message {payload:02X?} from {}", msg.pair.remote_id);
                }
            }
        }
        debug!("Collected {} responses to service 0x{service:02X}", responses.len());
        Ok(responses)
    }

    /// Stops the router and the ISO-TP engine
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.engine.stop();
        if let Some(t) = self.router.take() {
            if t.join().is_err() {
                error!("Response router thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_unless_cancelled(duration: Duration, cancel: &CancelToken) -> bool {
    let end = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= end {
            return true;
        }
        std::thread::sleep((end - now).min(POLL_SLICE));
    }
}
