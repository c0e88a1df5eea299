//! ISO-TP segmentation and reassembly state machine for one peer pair
//!
//! A [TransportSession] holds no clock and does no IO. Every call takes the current
//! time and returns a list of [SessionOutput] for the owner to act on (frames to put
//! on the bus, completed messages, failures). Time driven transitions happen in
//! [TransportSession::poll], which the owner should call no later than
//! [TransportSession::next_deadline].

use std::time::{Duration, Instant};

use log::{debug, error, warn};

use super::{
    codec::{CONSECUTIVE_FRAME_DATA, FIRST_FRAME_DATA, FlowStatus, SINGLE_FRAME_MAX, WireFrame},
    IsoTpSettings, MAX_MESSAGE_LEN, TransportError, TransportResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Externally visible state of a [TransportSession]
pub enum TransportState {
    /// No message in flight
    Idle,
    /// First frame or a full block was sent, waiting for the receiver's flow control
    AwaitingFlowControl,
    /// Sending consecutive frames
    SendingConsecutive,
    /// Reassembling a segmented message
    ReceivingConsecutive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Action requested by a [TransportSession]
pub enum SessionOutput {
    /// Put this frame on the bus
    Transmit(WireFrame),
    /// A complete message was received
    Received(Vec<u8>),
    /// Reassembly of an incoming message was aborted
    ReceiveFailed(TransportError),
    /// The outgoing message was fully transmitted
    Sent,
    /// The outgoing message was aborted
    SendFailed(TransportError),
}

#[derive(Debug)]
struct TxBuffer {
    data: Vec<u8>,
    offset: usize,
    sequence: u8,
    block_size: u8,
    sent_in_block: usize,
    separation: Duration,
}

impl TxBuffer {
    fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            offset: FIRST_FRAME_DATA,
            sequence: 1,
            block_size: 0,
            sent_in_block: 0,
            separation: Duration::ZERO,
        }
    }

    fn begin_block(&mut self, block_size: u8, separation_time_us: u32) {
        self.block_size = block_size;
        self.sent_in_block = 0;
        self.separation = Duration::from_micros(separation_time_us as u64);
    }

    fn next_frame(&mut self) -> WireFrame {
        let end = (self.offset + CONSECUTIVE_FRAME_DATA).min(self.data.len());
        let frame = WireFrame::Consecutive {
            sequence: self.sequence,
            data: self.data[self.offset..end].to_vec(),
        };
        self.offset = end;
        self.sequence = (self.sequence + 1) & 0x0F;
        self.sent_in_block += 1;
        frame
    }

    fn is_complete(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn block_exhausted(&self) -> bool {
        self.block_size != 0 && self.sent_in_block >= self.block_size as usize
    }
}

#[derive(Debug)]
struct RxBuffer {
    data: Vec<u8>,
    total: usize,
    expected_sequence: u8,
    block_count: u8,
}

#[derive(Debug)]
enum Inner {
    Idle,
    AwaitingFlowControl {
        tx: TxBuffer,
        deadline: Instant,
        waits: u8,
    },
    SendingConsecutive {
        tx: TxBuffer,
        next_tx_at: Instant,
    },
    ReceivingConsecutive {
        rx: RxBuffer,
        deadline: Instant,
    },
}

impl Inner {
    fn state(&self) -> TransportState {
        match self {
            Inner::Idle => TransportState::Idle,
            Inner::AwaitingFlowControl { .. } => TransportState::AwaitingFlowControl,
            Inner::SendingConsecutive { .. } => TransportState::SendingConsecutive,
            Inner::ReceivingConsecutive { .. } => TransportState::ReceivingConsecutive,
        }
    }
}

/// Segmentation and reassembly state for one (local, remote) identifier pair
#[derive(Debug)]
pub struct TransportSession {
    settings: IsoTpSettings,
    inner: Inner,
}

impl TransportSession {
    /// Creates an idle session
    pub fn new(settings: IsoTpSettings) -> Self {
        Self {
            settings,
            inner: Inner::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// Time at which [TransportSession::poll] next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.inner {
            Inner::Idle => None,
            Inner::AwaitingFlowControl { deadline, .. } => Some(*deadline),
            Inner::SendingConsecutive { next_tx_at, .. } => Some(*next_tx_at),
            Inner::ReceivingConsecutive { deadline, .. } => Some(*deadline),
        }
    }

    /// Starts sending a message.
    ///
    /// Messages of up to 7 bytes complete immediately as a single frame.
    /// Longer messages send a First frame and wait for flow control.
    pub fn start_send(&mut self, payload: Vec<u8>, now: Instant) -> TransportResult<Vec<SessionOutput>> {
        if !matches!(self.inner, Inner::Idle) {
            return Err(TransportError::Busy);
        }
        if payload.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        if payload.len() <= SINGLE_FRAME_MAX {
            return Ok(vec![
                SessionOutput::Transmit(WireFrame::Single { data: payload }),
                SessionOutput::Sent,
            ]);
        }
        let first = WireFrame::First {
            total_len: payload.len() as u16,
            data: payload[..FIRST_FRAME_DATA].to_vec(),
        };
        debug!("Sending {} byte message, awaiting flow control", payload.len());
        self.inner = Inner::AwaitingFlowControl {
            tx: TxBuffer::new(payload),
            deadline: now + self.settings.n_bs,
            waits: 0,
        };
        Ok(vec![SessionOutput::Transmit(first)])
    }

    /// Processes a frame received from the peer
    pub fn on_frame(&mut self, frame: WireFrame, now: Instant) -> Vec<SessionOutput> {
        match (std::mem::replace(&mut self.inner, Inner::Idle), frame) {
            (Inner::Idle, WireFrame::Single { data }) => vec![SessionOutput::Received(data)],
            (Inner::Idle, WireFrame::First { total_len, data }) => {
                self.begin_receive(total_len as usize, data, now)
            }
            (
                Inner::AwaitingFlowControl { mut tx, deadline, waits },
                WireFrame::FlowControl {
                    status,
                    block_size,
                    separation_time_us,
                },
            ) => match status {
                FlowStatus::Continue => {
                    tx.begin_block(block_size, separation_time_us);
                    self.send_consecutive(tx, now, now)
                }
                FlowStatus::Wait if waits >= self.settings.wft_max => {
                    error!("Receiver sent {} wait frames, aborting send", waits + 1);
                    vec![SessionOutput::SendFailed(TransportError::WaitLimitExceeded)]
                }
                FlowStatus::Wait => {
                    debug!("Flow control wait, restarting N_Bs (Was due {deadline:?})");
                    self.inner = Inner::AwaitingFlowControl {
                        tx,
                        deadline: now + self.settings.n_bs,
                        waits: waits + 1,
                    };
                    vec![]
                }
                FlowStatus::Overflow => {
                    error!("Receiver cannot take {} byte message", tx.data.len());
                    vec![SessionOutput::SendFailed(TransportError::Overflow)]
                }
            },
            (Inner::ReceivingConsecutive { rx, .. }, WireFrame::Consecutive { sequence, data }) => {
                self.continue_receive(rx, sequence, data, now)
            }
            (inner, frame) => {
                warn!("Dropping {frame:02X?}, unexpected in state {:?}", inner.state());
                self.inner = inner;
                vec![]
            }
        }
    }

    /// Runs timers and paced transmission
    pub fn poll(&mut self, now: Instant) -> Vec<SessionOutput> {
        match std::mem::replace(&mut self.inner, Inner::Idle) {
            Inner::AwaitingFlowControl { deadline, .. } if now >= deadline => {
                error!("Flow control not received in time (N_Bs)");
                vec![SessionOutput::SendFailed(TransportError::FlowControlTimeout)]
            }
            Inner::ReceivingConsecutive { rx, deadline } if now >= deadline => {
                error!(
                    "Consecutive frame not received in time (N_Cr). Got {}/{} bytes",
                    rx.data.len(),
                    rx.total
                );
                vec![SessionOutput::ReceiveFailed(TransportError::ReassemblyTimeout)]
            }
            Inner::SendingConsecutive { tx, next_tx_at } => self.send_consecutive(tx, next_tx_at, now),
            other => {
                self.inner = other;
                vec![]
            }
        }
    }

    /// Aborts whatever is in flight, e.g. after a CAN driver fault
    pub fn abort(&mut self, error: TransportError) -> Vec<SessionOutput> {
        match std::mem::replace(&mut self.inner, Inner::Idle) {
            Inner::Idle => vec![],
            Inner::AwaitingFlowControl { .. } | Inner::SendingConsecutive { .. } => {
                vec![SessionOutput::SendFailed(error)]
            }
            Inner::ReceivingConsecutive { .. } => vec![SessionOutput::ReceiveFailed(error)],
        }
    }

    fn flow_control(&self, status: FlowStatus) -> SessionOutput {
        SessionOutput::Transmit(WireFrame::FlowControl {
            status,
            block_size: self.settings.block_size,
            separation_time_us: self.settings.st_min_us,
        })
    }

    fn begin_receive(&mut self, total: usize, mut data: Vec<u8>, now: Instant) -> Vec<SessionOutput> {
        if total > self.settings.max_message_len {
            warn!(
                "Incoming message of {total} bytes exceeds the {} byte limit",
                self.settings.max_message_len
            );
            return vec![self.flow_control(FlowStatus::Overflow)];
        }
        data.truncate(total);
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&data);
        debug!("Receiving {total} byte message");
        self.inner = Inner::ReceivingConsecutive {
            rx: RxBuffer {
                data: buf,
                total,
                expected_sequence: 1,
                block_count: 0,
            },
            deadline: now + self.settings.n_cr,
        };
        vec![self.flow_control(FlowStatus::Continue)]
    }

    fn continue_receive(&mut self, mut rx: RxBuffer, sequence: u8, data: Vec<u8>, now: Instant) -> Vec<SessionOutput> {
        if sequence != rx.expected_sequence {
            error!(
                "Consecutive frame out of sequence. Expected {}, got {sequence}",
                rx.expected_sequence
            );
            return vec![SessionOutput::ReceiveFailed(TransportError::SequenceError {
                expected: rx.expected_sequence,
                received: sequence,
            })];
        }
        let take = (rx.total - rx.data.len()).min(data.len());
        rx.data.extend_from_slice(&data[..take]);
        rx.expected_sequence = (rx.expected_sequence + 1) & 0x0F;
        if rx.data.len() == rx.total {
            debug!("Received {} byte message", rx.total);
            return vec![SessionOutput::Received(rx.data)];
        }
        let mut out = Vec::new();
        if self.settings.block_size != 0 {
            rx.block_count += 1;
            if rx.block_count == self.settings.block_size {
                rx.block_count = 0;
                out.push(self.flow_control(FlowStatus::Continue));
            }
        }
        self.inner = Inner::ReceivingConsecutive {
            rx,
            deadline: now + self.settings.n_cr,
        };
        out
    }

    fn send_consecutive(&mut self, mut tx: TxBuffer, mut next_tx_at: Instant, now: Instant) -> Vec<SessionOutput> {
        let mut out = Vec::new();
        while next_tx_at <= now {
            out.push(SessionOutput::Transmit(tx.next_frame()));
            if tx.is_complete() {
                debug!("Sent {} byte message", tx.data.len());
                out.push(SessionOutput::Sent);
                return out;
            }
            if tx.block_exhausted() {
                self.inner = Inner::AwaitingFlowControl {
                    tx,
                    deadline: now + self.settings.n_bs,
                    waits: 0,
                };
                return out;
            }
            next_tx_at = now + tx.separation;
        }
        self.inner = Inner::SendingConsecutive { tx, next_tx_at };
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isotp::codec::{decode, encode_padded};

    fn frames(out: &[SessionOutput]) -> Vec<WireFrame> {
        out.iter()
            .filter_map(|o| match o {
                SessionOutput::Transmit(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn continue_fc(block_size: u8, separation_time_us: u32) -> WireFrame {
        WireFrame::FlowControl {
            status: FlowStatus::Continue,
            block_size,
            separation_time_us,
        }
    }

    /// Moves frames between two sessions (through the codec) until both are idle
    fn transfer(payload: &[u8], settings: IsoTpSettings) -> Vec<u8> {
        let now = Instant::now();
        let mut tx = TransportSession::new(settings);
        let mut rx = TransportSession::new(settings);
        let first = tx.start_send(payload.to_vec(), now).unwrap();
        let mut sent = first.contains(&SessionOutput::Sent);
        let mut to_rx = frames(&first);
        let mut received = None;
        while !to_rx.is_empty() {
            let mut to_tx = Vec::new();
            for f in to_rx.drain(..) {
                let wire = decode(&encode_padded(&f, settings.padding)).unwrap();
                for o in rx.on_frame(wire, now) {
                    match o {
                        SessionOutput::Transmit(fc) => to_tx.push(fc),
                        SessionOutput::Received(d) => received = Some(d),
                        other => panic!("Unexpected receiver output {other:?}"),
                    }
                }
            }
            for fc in to_tx {
                let wire = decode(&encode_padded(&fc, settings.padding)).unwrap();
                for o in tx.on_frame(wire, now) {
                    match o {
                        SessionOutput::Transmit(f) => to_rx.push(f),
                        SessionOutput::Sent => sent = true,
                        other => panic!("Unexpected sender output {other:?}"),
                    }
                }
            }
        }
        assert!(sent);
        assert_eq!(tx.state(), TransportState::Idle);
        assert_eq!(rx.state(), TransportState::Idle);
        received.unwrap()
    }

    #[test]
    fn segment_then_reassemble() {
        let settings = IsoTpSettings::default();
        for len in [1, 7, 8, 13, 14, 62, 111, 112, 255, 4095] {
            let payload = (0..len).map(|x| (x * 7 % 256) as u8).collect::<Vec<u8>>();
            assert_eq!(transfer(&payload, settings), payload, "length {len}");
        }
        let unpadded = IsoTpSettings {
            padding: None,
            block_size: 0,
            ..Default::default()
        };
        let payload = (0..500).map(|x| x as u8).collect::<Vec<u8>>();
        assert_eq!(transfer(&payload, unpadded), payload);
    }

    #[test]
    fn ten_byte_message_frames() {
        let now = Instant::now();
        let payload = (0xA0..0xAA).collect::<Vec<u8>>();
        let mut s = TransportSession::new(IsoTpSettings::default());
        let out = s.start_send(payload.clone(), now).unwrap();
        assert_eq!(
            crate::isotp::codec::encode(&frames(&out)[0]),
            vec![0x10, 0x0A, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]
        );
        assert_eq!(s.state(), TransportState::AwaitingFlowControl);

        let out = s.on_frame(continue_fc(0, 0), now);
        assert_eq!(
            crate::isotp::codec::encode(&frames(&out)[0]),
            vec![0x21, 0xA6, 0xA7, 0xA8, 0xA9]
        );
        assert_eq!(out.last(), Some(&SessionOutput::Sent));
        assert_eq!(s.state(), TransportState::Idle);
    }

    #[test]
    fn sequence_error_aborts_only_that_message() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings::default());
        s.on_frame(
            WireFrame::First {
                total_len: 20,
                data: vec![0; 6],
            },
            now,
        );
        let out = s.on_frame(
            WireFrame::Consecutive {
                sequence: 2,
                data: vec![0; 7],
            },
            now,
        );
        assert_eq!(
            out,
            vec![SessionOutput::ReceiveFailed(TransportError::SequenceError {
                expected: 1,
                received: 2
            })]
        );
        assert_eq!(s.state(), TransportState::Idle);

        // Next message is unaffected
        s.on_frame(
            WireFrame::First {
                total_len: 10,
                data: vec![1, 2, 3, 4, 5, 6],
            },
            now,
        );
        let out = s.on_frame(
            WireFrame::Consecutive {
                sequence: 1,
                data: vec![7, 8, 9, 10, 0xCC, 0xCC, 0xCC],
            },
            now,
        );
        assert_eq!(out, vec![SessionOutput::Received((1..=10).collect())]);
    }

    #[test]
    fn sequence_number_wraps() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings {
            block_size: 0,
            ..Default::default()
        });
        s.on_frame(
            WireFrame::First {
                total_len: 6 + 7 * 17,
                data: vec![0; 6],
            },
            now,
        );
        let mut last = vec![];
        for i in 1..=17u8 {
            last = s.on_frame(
                WireFrame::Consecutive {
                    sequence: i & 0x0F,
                    data: vec![i; 7],
                },
                now,
            );
        }
        assert!(matches!(last.as_slice(), [SessionOutput::Received(d)] if d.len() == 125));
    }

    #[test]
    fn receiver_sends_flow_control_every_block() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings {
            block_size: 2,
            ..Default::default()
        });
        let out = s.on_frame(
            WireFrame::First {
                total_len: 6 + 7 * 5,
                data: vec![0; 6],
            },
            now,
        );
        let mut fc_count = frames(&out).len();
        for sn in 1..=5u8 {
            let out = s.on_frame(
                WireFrame::Consecutive {
                    sequence: sn,
                    data: vec![sn; 7],
                },
                now,
            );
            let fcs = frames(&out).len();
            // FC after CF 2 and 4, none once complete
            assert_eq!(fcs, if sn == 2 || sn == 4 { 1 } else { 0 }, "CF {sn}");
            fc_count += fcs;
        }
        assert_eq!(fc_count, 3);
    }

    #[test]
    fn sender_honours_block_size() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings::default());
        s.start_send(vec![0x55; 6 + 7 * 5], now).unwrap();
        let out = s.on_frame(continue_fc(2, 0), now);
        assert_eq!(frames(&out).len(), 2);
        assert_eq!(s.state(), TransportState::AwaitingFlowControl);
        let out = s.on_frame(continue_fc(2, 0), now);
        assert_eq!(frames(&out).len(), 2);
        let out = s.on_frame(continue_fc(2, 0), now);
        assert_eq!(frames(&out).len(), 1);
        assert_eq!(out.last(), Some(&SessionOutput::Sent));
    }

    #[test]
    fn unlimited_block_size_sends_everything() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings::default());
        s.start_send(vec![0x55; 4095], now).unwrap();
        let out = s.on_frame(continue_fc(0, 0), now);
        assert_eq!(frames(&out).len(), 4089usize.div_ceil(7));
        assert_eq!(s.state(), TransportState::Idle);
    }

    #[test]
    fn separation_time_paces_frames() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings::default());
        s.start_send(vec![0x55; 30], now).unwrap();
        let out = s.on_frame(continue_fc(0, 10_000), now);
        assert_eq!(frames(&out).len(), 1);
        assert_eq!(s.state(), TransportState::SendingConsecutive);
        assert_eq!(s.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(s.poll(now + Duration::from_millis(5)).is_empty());
        let out = s.poll(now + Duration::from_millis(10));
        assert_eq!(frames(&out).len(), 1);
    }

    #[test]
    fn flow_control_timeout() {
        let now = Instant::now();
        let settings = IsoTpSettings::default();
        let mut s = TransportSession::new(settings);
        s.start_send(vec![0; 20], now).unwrap();
        assert!(s.poll(now + settings.n_bs / 2).is_empty());
        assert_eq!(
            s.poll(now + settings.n_bs),
            vec![SessionOutput::SendFailed(TransportError::FlowControlTimeout)]
        );
        assert_eq!(s.state(), TransportState::Idle);
    }

    #[test]
    fn flow_control_wait_and_overflow() {
        let now = Instant::now();
        let settings = IsoTpSettings {
            wft_max: 1,
            ..Default::default()
        };
        let wait = WireFrame::FlowControl {
            status: FlowStatus::Wait,
            block_size: 0,
            separation_time_us: 0,
        };
        let mut s = TransportSession::new(settings);
        s.start_send(vec![0; 20], now).unwrap();
        let later = now + Duration::from_millis(800);
        assert!(s.on_frame(wait.clone(), later).is_empty());
        // Wait restarted N_Bs
        assert!(s.poll(now + settings.n_bs).is_empty());
        assert_eq!(
            s.on_frame(wait, later),
            vec![SessionOutput::SendFailed(TransportError::WaitLimitExceeded)]
        );

        s.start_send(vec![0; 20], now).unwrap();
        let out = s.on_frame(
            WireFrame::FlowControl {
                status: FlowStatus::Overflow,
                block_size: 0,
                separation_time_us: 0,
            },
            now,
        );
        assert_eq!(out, vec![SessionOutput::SendFailed(TransportError::Overflow)]);
        assert_eq!(s.state(), TransportState::Idle);
    }

    #[test]
    fn reassembly_timer_rearms_on_each_frame() {
        let now = Instant::now();
        let settings = IsoTpSettings::default();
        let mut s = TransportSession::new(settings);
        s.on_frame(
            WireFrame::First {
                total_len: 30,
                data: vec![0; 6],
            },
            now,
        );
        let t1 = now + Duration::from_millis(900);
        s.on_frame(
            WireFrame::Consecutive {
                sequence: 1,
                data: vec![0; 7],
            },
            t1,
        );
        assert!(s.poll(now + settings.n_cr).is_empty());
        assert_eq!(
            s.poll(t1 + settings.n_cr),
            vec![SessionOutput::ReceiveFailed(TransportError::ReassemblyTimeout)]
        );
    }

    #[test]
    fn unexpected_frames_are_dropped() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings::default());
        assert!(s.on_frame(continue_fc(0, 0), now).is_empty());
        assert!(s
            .on_frame(
                WireFrame::Consecutive {
                    sequence: 1,
                    data: vec![1]
                },
                now
            )
            .is_empty());
        s.on_frame(
            WireFrame::First {
                total_len: 10,
                data: vec![0; 6],
            },
            now,
        );
        assert!(s.on_frame(WireFrame::Single { data: vec![1] }, now).is_empty());
        assert_eq!(s.state(), TransportState::ReceivingConsecutive);
    }

    #[test]
    fn oversized_first_frame_gets_overflow() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings {
            max_message_len: 100,
            ..Default::default()
        });
        let out = s.on_frame(
            WireFrame::First {
                total_len: 200,
                data: vec![0; 6],
            },
            now,
        );
        assert!(matches!(
            frames(&out).as_slice(),
            [WireFrame::FlowControl {
                status: FlowStatus::Overflow,
                ..
            }]
        ));
        assert_eq!(s.state(), TransportState::Idle);
    }

    #[test]
    fn busy_and_invalid_sends() {
        let now = Instant::now();
        let mut s = TransportSession::new(IsoTpSettings::default());
        assert_eq!(s.start_send(vec![], now), Err(TransportError::EmptyPayload));
        assert_eq!(
            s.start_send(vec![0; 4096], now),
            Err(TransportError::PayloadTooLarge(4096))
        );
        s.start_send(vec![0; 20], now).unwrap();
        assert_eq!(s.start_send(vec![0; 3], now), Err(TransportError::Busy));
        assert_eq!(
            s.abort(TransportError::Can(crate::channel::CanError::BusOff)),
            vec![SessionOutput::SendFailed(TransportError::Can(
                crate::channel::CanError::BusOff
            ))]
        );
    }
}
