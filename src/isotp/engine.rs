//! Background ISO-TP engine
//!
//! One thread owns the [CanChannel] and every [TransportSession]. Received frames,
//! driver faults and send requests all arrive on one ordered mpsc queue, so each
//! session is only ever touched by the engine thread.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use log::{debug, error, trace, warn};

use crate::channel::{CanChannel, CanError, CanFrame, CanId, CanResult, FrameSink};

use super::{
    codec::{self, WireFrame, SINGLE_FRAME_MAX},
    session::{SessionOutput, TransportSession},
    IsoTpSettings, PeerPair, TransportError, TransportResult,
};

/// Longest the engine sleeps when no session has a pending deadline
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub(crate) enum EngineInput {
    Frame(CanFrame),
    BusError(CanError),
    Send {
        pair: PeerPair,
        payload: Vec<u8>,
        reply: mpsc::Sender<TransportResult<()>>,
    },
    SendFunctional {
        id: CanId,
        payload: Vec<u8>,
        reply: mpsc::Sender<TransportResult<()>>,
    },
    AddRoute(PeerPair),
}

/// A message (or reassembly failure) received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Pair the message arrived on. `remote_id` is the sender
    pub pair: PeerPair,
    /// Reassembled payload
    pub result: TransportResult<Vec<u8>>,
}

/// Cloneable handle for submitting messages to a running [IsoTpEngine]
#[derive(Debug, Clone)]
pub struct IsoTpHandle {
    sender: mpsc::Sender<EngineInput>,
}

impl IsoTpHandle {
    fn submit<T>(&self, make: impl FnOnce(mpsc::Sender<TransportResult<T>>) -> EngineInput) -> TransportResult<T> {
        let (tx, rx) = mpsc::channel::<TransportResult<T>>();
        self.sender
            .send(make(tx))
            .map_err(|_| TransportError::EngineStopped)?;
        rx.recv().map_err(|_| TransportError::EngineStopped)?
    }

    /// Sends a message on a physical pair, blocking until the last frame is on the bus.
    ///
    /// This also routes frames from `pair.remote_id` to the pair, so the peer's
    /// flow control and responses are received.
    pub fn send(&self, pair: PeerPair, payload: Vec<u8>) -> TransportResult<()> {
        self.submit(|reply| EngineInput::Send { pair, payload, reply })
    }

    /// Sends a single frame message to a functional (broadcast) identifier.
    /// Functional messages are never segmented
    pub fn send_functional(&self, id: CanId, payload: Vec<u8>) -> TransportResult<()> {
        self.submit(|reply| EngineInput::SendFunctional { id, payload, reply })
    }

    /// Starts accepting messages from `pair.remote_id` without sending anything first
    pub fn add_route(&self, pair: PeerPair) -> TransportResult<()> {
        self.sender
            .send(EngineInput::AddRoute(pair))
            .map_err(|_| TransportError::EngineStopped)
    }
}

/// Software ISO-TP engine running on its own thread
#[derive(Debug)]
pub struct IsoTpEngine {
    running: Arc<AtomicBool>,
    handle: IsoTpHandle,
    thread: Option<JoinHandle<()>>,
}

impl IsoTpEngine {
    /// Opens `channel` and starts the engine thread.
    /// Every message received from a routed peer is sent to `listener`
    pub fn start(
        mut channel: Box<dyn CanChannel>,
        settings: IsoTpSettings,
        listener: mpsc::Sender<InboundMessage>,
    ) -> TransportResult<Self> {
        let (tx, rx) = mpsc::channel::<EngineInput>();
        channel.open(FrameSink::new(tx.clone()))?;
        let running = Arc::new(AtomicBool::new(true));
        let running_c = running.clone();
        let thread = std::thread::spawn(move || {
            let mut worker = Worker {
                channel,
                settings,
                listener,
                routes: HashMap::new(),
                sessions: HashMap::new(),
            };
            worker.run(rx, running_c);
        });
        debug!("ISO-TP engine started");
        Ok(Self {
            running,
            handle: IsoTpHandle { sender: tx },
            thread: Some(thread),
        })
    }

    /// Returns a handle for sending messages
    pub fn handle(&self) -> IsoTpHandle {
        self.handle.clone()
    }

    /// Returns true while the engine thread is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the engine and closes the CAN channel. Messages in flight are dropped
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                error!("ISO-TP engine thread panicked");
            }
        }
    }
}

impl Drop for IsoTpEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Slot {
    session: TransportSession,
    pending_send: Option<mpsc::Sender<TransportResult<()>>>,
}

struct Worker {
    channel: Box<dyn CanChannel>,
    settings: IsoTpSettings,
    listener: mpsc::Sender<InboundMessage>,
    // Incoming CAN ID -> pair it belongs to
    routes: HashMap<CanId, PeerPair>,
    sessions: HashMap<PeerPair, Slot>,
}

impl Worker {
    fn run(&mut self, rx: mpsc::Receiver<EngineInput>, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            let wait = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(now))
                .unwrap_or(IDLE_POLL)
                .min(IDLE_POLL);
            match rx.recv_timeout(wait) {
                Ok(input) => self.handle_input(input),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll_sessions(Instant::now());
        }
        if let Err(e) = self.channel.close() {
            warn!("Error closing CAN channel: {e}");
        }
        debug!("ISO-TP engine stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter_map(|s| s.session.next_deadline())
            .min()
    }

    fn slot(&mut self, pair: PeerPair) -> &mut Slot {
        let settings = self.settings;
        self.sessions.entry(pair).or_insert_with(|| Slot {
            session: TransportSession::new(settings),
            pending_send: None,
        })
    }

    fn handle_input(&mut self, input: EngineInput) {
        let now = Instant::now();
        match input {
            EngineInput::Frame(frame) => {
                let Some(pair) = self.routes.get(&frame.id()).copied() else {
                    trace!("Ignoring frame from unrouted ID {frame:?}");
                    return;
                };
                match codec::decode(frame.data()) {
                    Ok(wire) => {
                        trace!("ISO-TP Rx {frame:?}");
                        let outputs = self.slot(pair).session.on_frame(wire, now);
                        self.apply(pair, outputs);
                    }
                    Err(e) => warn!("Dropping malformed frame {frame:?}: {e}"),
                }
            }
            EngineInput::BusError(e) => {
                error!("CAN driver fault: {e}");
                let pairs = self.sessions.keys().copied().collect::<Vec<_>>();
                for pair in pairs {
                    let outputs = self.slot(pair).session.abort(TransportError::Can(e));
                    self.apply(pair, outputs);
                }
            }
            EngineInput::Send { pair, payload, reply } => {
                self.routes.entry(pair.remote_id).or_insert(pair);
                let slot = self.slot(pair);
                if slot.pending_send.is_some() {
                    let _ = reply.send(Err(TransportError::Busy));
                    return;
                }
                match slot.session.start_send(payload, now) {
                    Ok(outputs) => {
                        slot.pending_send = Some(reply);
                        self.apply(pair, outputs);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            EngineInput::SendFunctional { id, payload, reply } => {
                let res = if payload.is_empty() {
                    Err(TransportError::EmptyPayload)
                } else if payload.len() > SINGLE_FRAME_MAX {
                    Err(TransportError::FunctionalTooLong(payload.len()))
                } else {
                    self.transmit(id, &WireFrame::Single { data: payload })
                        .map_err(TransportError::from)
                };
                let _ = reply.send(res);
            }
            EngineInput::AddRoute(pair) => {
                debug!("Routing {} to pair {} <-> {}", pair.remote_id, pair.local_id, pair.remote_id);
                self.routes.insert(pair.remote_id, pair);
            }
        }
    }

    fn poll_sessions(&mut self, now: Instant) {
        let due = self
            .sessions
            .iter()
            .filter(|(_, s)| s.session.next_deadline().is_some_and(|d| d <= now))
            .map(|(p, _)| *p)
            .collect::<Vec<_>>();
        for pair in due {
            let outputs = self.slot(pair).session.poll(now);
            self.apply(pair, outputs);
        }
    }

    fn transmit(&mut self, id: CanId, frame: &WireFrame) -> CanResult<()> {
        let bytes = codec::encode_padded(frame, self.settings.padding);
        match CanFrame::new(id, &bytes) {
            Some(f) => {
                trace!("ISO-TP Tx {f:?}");
                self.channel.send_frame(&f)
            }
            None => {
                error!("Encoded frame {bytes:02X?} does not fit a CAN frame");
                Ok(())
            }
        }
    }

    fn apply(&mut self, pair: PeerPair, outputs: Vec<SessionOutput>) {
        let mut queue = VecDeque::from(outputs);
        while let Some(out) = queue.pop_front() {
            match out {
                SessionOutput::Transmit(frame) => {
                    if let Err(e) = self.transmit(pair.local_id, &frame) {
                        error!("Failed to transmit {frame:02X?}: {e}");
                        let single_frame_send = queue.contains(&SessionOutput::Sent);
                        queue.clear();
                        let mut aborted = self.slot(pair).session.abort(TransportError::Can(e));
                        if aborted.is_empty() && single_frame_send {
                            aborted.push(SessionOutput::SendFailed(TransportError::Can(e)));
                        }
                        queue.extend(aborted);
                    }
                }
                SessionOutput::Received(data) => {
                    let _ = self.listener.send(InboundMessage {
                        pair,
                        result: Ok(data),
                    });
                }
                SessionOutput::ReceiveFailed(e) => {
                    let _ = self.listener.send(InboundMessage { pair, result: Err(e) });
                }
                SessionOutput::Sent => {
                    if let Some(reply) = self.slot(pair).pending_send.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
                SessionOutput::SendFailed(e) => {
                    if let Some(reply) = self.slot(pair).pending_send.take() {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    const TESTER: CanId = CanId::Standard(0x7E0);
    const ECU: CanId = CanId::Standard(0x7E8);

    #[derive(Clone, Default)]
    struct RecordingChannel {
        sink: Arc<Mutex<Option<FrameSink>>>,
        sent: Arc<Mutex<Vec<CanFrame>>>,
        fail_with: Arc<Mutex<Option<CanError>>>,
    }

    impl RecordingChannel {
        fn inject(&self, id: CanId, data: &[u8]) {
            let sink = self.sink.lock().unwrap();
            sink.as_ref().unwrap().deliver(CanFrame::new(id, data).unwrap());
        }

        fn fault(&self, e: CanError) {
            self.sink.lock().unwrap().as_ref().unwrap().report_error(e);
        }

        fn wait_for_frames(&self, n: usize) -> Vec<CanFrame> {
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(2) {
                let sent = self.sent.lock().unwrap().clone();
                if sent.len() >= n {
                    return sent;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            panic!("Timed out waiting for {n} frames");
        }
    }

    impl CanChannel for RecordingChannel {
        fn open(&mut self, sink: FrameSink) -> CanResult<()> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        fn close(&mut self) -> CanResult<()> {
            Ok(())
        }

        fn send_frame(&mut self, frame: &CanFrame) -> CanResult<()> {
            if let Some(e) = *self.fail_with.lock().unwrap() {
                return Err(e);
            }
            self.sent.lock().unwrap().push(*frame);
            Ok(())
        }
    }

    fn start() -> (IsoTpEngine, RecordingChannel, mpsc::Receiver<InboundMessage>) {
        let channel = RecordingChannel::default();
        let (tx, rx) = mpsc::channel();
        let engine = IsoTpEngine::start(Box::new(channel.clone()), IsoTpSettings::default(), tx).unwrap();
        (engine, channel, rx)
    }

    #[test]
    fn single_frame_is_padded() {
        let (engine, channel, _rx) = start();
        engine
            .handle()
            .send(PeerPair::new(TESTER, ECU), vec![0x3E, 0x00])
            .unwrap();
        let sent = channel.wait_for_frames(1);
        assert_eq!(sent[0].id(), TESTER);
        assert_eq!(sent[0].data(), &[0x02, 0x3E, 0x00, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
    }

    #[test]
    fn only_routed_ids_are_received() {
        let (engine, channel, rx) = start();
        channel.inject(ECU, &[0x02, 0x50, 0x01]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        engine.handle().add_route(PeerPair::new(TESTER, ECU)).unwrap();
        channel.inject(ECU, &[0x02, 0x50, 0x01]);
        let msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.pair.remote_id, ECU);
        assert_eq!(msg.result, Ok(vec![0x50, 0x01]));
    }

    #[test]
    fn multi_frame_receive_sends_flow_control() {
        let (engine, channel, rx) = start();
        engine.handle().add_route(PeerPair::new(TESTER, ECU)).unwrap();
        channel.inject(ECU, &[0x10, 0x0A, 0x62, 0xF1, 0x90, 0x41, 0x42, 0x43]);
        let fc = channel.wait_for_frames(1);
        assert_eq!(fc[0].id(), TESTER);
        assert_eq!(&fc[0].data()[..3], &[0x30, 0x08, 0x00]);
        channel.inject(ECU, &[0x21, 0x44, 0x45, 0x46, 0x47, 0xCC, 0xCC, 0xCC]);
        let msg = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            msg.result,
            Ok(vec![0x62, 0xF1, 0x90, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47])
        );
    }

    #[test]
    fn functional_messages_must_fit_one_frame() {
        let (engine, channel, _rx) = start();
        let functional = CanId::Standard(0x7DF);
        assert_eq!(
            engine.handle().send_functional(functional, vec![0; 8]),
            Err(TransportError::FunctionalTooLong(8))
        );
        engine.handle().send_functional(functional, vec![0x3E, 0x80]).unwrap();
        assert_eq!(channel.wait_for_frames(1)[0].id(), functional);
    }

    #[test]
    fn driver_faults_abort_sends() {
        let (engine, channel, _rx) = start();
        *channel.fail_with.lock().unwrap() = Some(CanError::TxTimeout);
        assert_eq!(
            engine.handle().send(PeerPair::new(TESTER, ECU), vec![0x11, 0x01]),
            Err(TransportError::Can(CanError::TxTimeout))
        );
        *channel.fail_with.lock().unwrap() = None;

        let handle = engine.handle();
        let t = std::thread::spawn(move || handle.send(PeerPair::new(TESTER, ECU), vec![0; 20]));
        channel.wait_for_frames(1);
        channel.fault(CanError::BusOff);
        assert_eq!(t.join().unwrap(), Err(TransportError::Can(CanError::BusOff)));
    }

    #[test]
    fn stopped_engine_rejects_sends() {
        let (mut engine, _channel, _rx) = start();
        let handle = engine.handle();
        engine.stop();
        assert!(!engine.is_running());
        assert_eq!(
            handle.send(PeerPair::new(TESTER, ECU), vec![0x3E, 0x00]),
            Err(TransportError::EngineStopped)
        );
    }
}
