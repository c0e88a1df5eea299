//! Diagnostic session tracking and service gating
//!
//! Which services an ECU accepts depends on its diagnostic session:
//!
//! | Service                                  | Default | Programming | Extended |
//! |------------------------------------------|---------|-------------|----------|
//! | 0x10, 0x11, 0x22, 0x3E                   | yes     | yes         | yes      |
//! | 0x34, 0x36, 0x37 (download)              | no      | yes         | no       |
//! | Anything else (e.g. 0x2E)                | no      | yes         | yes      |
//!
//! A non default session falls back to [DiagSession::Default] when nothing was
//! exchanged with the ECU for the S3 time.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::{Duration, Instant},
};

use automotive_diag::{
    uds::{UdsCommand, UdsSessionType, UdsSessionTypeByte},
    ByteWrapper::Standard,
};
use bitflags::bitflags;
use log::{debug, info, warn};

use crate::{
    flash::{FlashProgress, FlashTransfer},
    uds::{DiagnosticError, DiagnosticRequest, DiagnosticResponse, DiagnosticResult, EcuAddress},
};

/// UDS diagnostic session
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagSession {
    /// Default session the ECU starts in
    #[default]
    Default,
    /// Reprogramming session
    Programming,
    /// Extended diagnostic session
    Extended,
}

impl DiagSession {
    /// DiagnosticSessionControl sub function for this session
    pub fn sub_function(self) -> u8 {
        match self {
            Self::Default => UdsSessionType::Default.into(),
            Self::Programming => UdsSessionType::Programming.into(),
            Self::Extended => UdsSessionType::Extended.into(),
        }
    }

    /// Parses a DiagnosticSessionControl sub function (Suppress bit ignored)
    pub fn from_sub_function(sub: u8) -> Option<Self> {
        match UdsSessionTypeByte::from(sub & 0x7F) {
            Standard(UdsSessionType::Default) => Some(Self::Default),
            Standard(UdsSessionType::Programming) => Some(Self::Programming),
            Standard(UdsSessionType::Extended) => Some(Self::Extended),
            _ => None,
        }
    }
}

bitflags! {
    /// Set of diagnostic sessions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SessionMask: u8 {
        /// Default session
        const DEFAULT = 0b001;
        /// Programming session
        const PROGRAMMING = 0b010;
        /// Extended session
        const EXTENDED = 0b100;
    }
}

impl From<DiagSession> for SessionMask {
    fn from(s: DiagSession) -> Self {
        match s {
            DiagSession::Default => Self::DEFAULT,
            DiagSession::Programming => Self::PROGRAMMING,
            DiagSession::Extended => Self::EXTENDED,
        }
    }
}

/// Sessions in which `service` may be requested
pub fn permitted_sessions(service: u8) -> SessionMask {
    match UdsCommand::try_from(service) {
        Ok(
            UdsCommand::DiagnosticSessionControl
            | UdsCommand::ECUReset
            | UdsCommand::ReadDataByIdentifier
            | UdsCommand::TesterPresent,
        ) => SessionMask::all(),
        Ok(UdsCommand::RequestDownload | UdsCommand::TransferData | UdsCommand::RequestTransferExit) => {
            SessionMask::PROGRAMMING
        }
        _ => SessionMask::PROGRAMMING | SessionMask::EXTENDED,
    }
}

/// Fails with [DiagnosticError::WrongSession] if `service` is not permitted in `session`
pub fn check_service(service: u8, session: DiagSession) -> DiagnosticResult<()> {
    if permitted_sessions(service).contains(session.into()) {
        Ok(())
    } else {
        Err(DiagnosticError::WrongSession { service, session })
    }
}

/// Session record of one ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcuSessionState {
    session: DiagSession,
    last_activity: Instant,
}

impl EcuSessionState {
    /// A fresh ECU in the default session
    pub fn new(now: Instant) -> Self {
        Self {
            session: DiagSession::Default,
            last_activity: now,
        }
    }

    /// Session as of `now`, taking S3 expiry into account
    pub fn session_at(&self, now: Instant, s3: Duration) -> DiagSession {
        if self.session != DiagSession::Default && now.saturating_duration_since(self.last_activity) >= s3 {
            DiagSession::Default
        } else {
            self.session
        }
    }

    /// Applies S3 expiry. Returns the session that was left, if it expired
    pub fn refresh(&mut self, now: Instant, s3: Duration) -> Option<DiagSession> {
        let current = self.session_at(now, s3);
        if current != self.session {
            let old = self.session;
            info!("S3 elapsed, {old} session fell back to {current}");
            self.session = current;
            Some(old)
        } else {
            None
        }
    }

    /// Records activity, restarting S3
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Switches session
    pub fn enter(&mut self, session: DiagSession, now: Instant) {
        if session != self.session {
            debug!("Session {} -> {session}", self.session);
        }
        self.session = session;
        self.last_activity = now;
    }

    /// Session without S3 applied
    pub fn session(&self) -> DiagSession {
        self.session
    }
}

/// Session options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionOptions {
    /// Inactivity time after which an ECU returns to the default session
    pub s3_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            s3_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug)]
struct EcuRecord {
    state: EcuSessionState,
    flash: FlashTransfer,
}

impl EcuRecord {
    fn new(now: Instant) -> Self {
        Self {
            state: EcuSessionState::new(now),
            flash: FlashTransfer::default(),
        }
    }

    fn refresh(&mut self, now: Instant, s3: Duration) {
        if self.state.refresh(now, s3) == Some(DiagSession::Programming) {
            self.flash.abort();
        }
    }

    fn enter(&mut self, session: DiagSession, now: Instant) {
        if self.state.session() == DiagSession::Programming && session != DiagSession::Programming {
            self.flash.abort();
        }
        self.state.enter(session, now);
    }
}

/// Tester side view of the session and flash state of every ECU
#[derive(Debug, Default)]
pub struct SessionManager {
    options: SessionOptions,
    ecus: RwLock<HashMap<EcuAddress, EcuRecord>>,
}

impl SessionManager {
    /// Creates an empty manager
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            ecus: RwLock::new(HashMap::new()),
        }
    }

    fn with_record<R>(&self, ecu: EcuAddress, f: impl FnOnce(&mut EcuRecord) -> R) -> R {
        let now = Instant::now();
        let mut ecus = self.ecus.write().unwrap_or_else(PoisonError::into_inner);
        let record = ecus.entry(ecu).or_insert_with(|| EcuRecord::new(now));
        record.refresh(now, self.options.s3_timeout);
        f(record)
    }

    /// Current diagnostic session of `ecu`
    pub fn current_session(&self, ecu: EcuAddress) -> DiagSession {
        let ecus = self.ecus.read().unwrap_or_else(PoisonError::into_inner);
        ecus.get(&ecu)
            .map(|r| r.state.session_at(Instant::now(), self.options.s3_timeout))
            .unwrap_or_default()
    }

    /// Checks `service` may be sent to `ecu` in its current session
    pub fn check(&self, ecu: EcuAddress, service: u8) -> DiagnosticResult<()> {
        let session = self.current_session(ecu);
        check_service(service, session).inspect_err(|_| {
            warn!("Rejecting service 0x{service:02X} to {ecu}, ECU is in the {session} session");
        })
    }

    /// Updates the ECU's state from a completed exchange
    pub fn observe(&self, ecu: EcuAddress, request: &DiagnosticRequest, response: &DiagnosticResponse) {
        let now = Instant::now();
        self.with_record(ecu, |r| {
            if !response.positive {
                r.state.touch(now);
                return;
            }
            match UdsCommand::try_from(request.service) {
                Ok(UdsCommand::DiagnosticSessionControl) => {
                    match request.sub_function.and_then(DiagSession::from_sub_function) {
                        Some(session) => r.enter(session, now),
                        None => r.state.touch(now),
                    }
                }
                Ok(UdsCommand::ECUReset) => {
                    info!("{ecu} reset, back in the default session");
                    r.enter(DiagSession::Default, now);
                }
                _ => r.state.touch(now),
            }
        });
    }

    /// Records activity with `ecu`, restarting S3
    pub fn touch(&self, ecu: EcuAddress) {
        self.with_record(ecu, |r| r.state.touch(Instant::now()));
    }

    /// Runs `f` on the flash transfer record of `ecu`
    pub(crate) fn with_flash<R>(&self, ecu: EcuAddress, f: impl FnOnce(&mut FlashTransfer) -> R) -> R {
        self.with_record(ecu, |r| f(&mut r.flash))
    }

    /// Flash transfer progress of `ecu`
    pub fn flash_progress(&self, ecu: EcuAddress) -> FlashProgress {
        self.with_flash(ecu, |f| f.progress())
    }
}
