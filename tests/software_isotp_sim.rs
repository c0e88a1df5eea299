use std::{sync::mpsc, time::Duration};

use ecu_flasher::{
    channel::{CanError, CanId},
    isotp::{InboundMessage, IsoTpEngine, IsoTpSettings, PeerPair, TransportError},
    simulation::VirtualBus,
};

const TESTER: PeerPair = PeerPair::new(CanId::Standard(0x07E0), CanId::Standard(0x07E8));
const ECU: PeerPair = PeerPair::new(CanId::Standard(0x07E8), CanId::Standard(0x07E0));

fn start(bus: &VirtualBus, settings: IsoTpSettings) -> (IsoTpEngine, mpsc::Receiver<InboundMessage>) {
    let (tx, rx) = mpsc::channel();
    let engine = IsoTpEngine::start(Box::new(bus.channel()), settings, tx).unwrap();
    (engine, rx)
}

fn recv(rx: &mpsc::Receiver<InboundMessage>) -> InboundMessage {
    rx.recv_timeout(Duration::from_secs(5)).expect("no message received")
}

#[test]
pub fn isotp_round_trips() {
    let _ = env_logger::try_init();
    let bus = VirtualBus::new();
    let (tester, tester_rx) = start(&bus, IsoTpSettings::default());
    let ecu_settings = IsoTpSettings {
        block_size: 4,
        st_min_us: 500,
        ..Default::default()
    };
    let (ecu, ecu_rx) = start(&bus, ecu_settings);
    ecu.handle().add_route(ECU).unwrap();

    for len in [1usize, 7, 8, 62, 300, 4095] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        tester.handle().send(TESTER, payload.clone()).unwrap();
        let msg = recv(&ecu_rx);
        assert_eq!(msg.pair, ECU);
        assert_eq!(msg.result, Ok(payload.clone()));

        let reply: Vec<u8> = payload.iter().rev().copied().collect();
        ecu.handle().send(ECU, reply.clone()).unwrap();
        let msg = recv(&tester_rx);
        assert_eq!(msg.pair, TESTER);
        assert_eq!(msg.result, Ok(reply));
    }

    // Every frame on the bus is padded
    assert!(bus.frames().iter().all(|f| f.data().len() == 8));
}

#[test]
pub fn isotp_message_limits() {
    let bus = VirtualBus::new();
    let (tester, _rx) = start(&bus, IsoTpSettings::default());
    assert_eq!(
        tester.handle().send(TESTER, vec![0; 4096]),
        Err(TransportError::PayloadTooLarge(4096))
    );
    assert_eq!(tester.handle().send(TESTER, vec![]), Err(TransportError::EmptyPayload));
    assert_eq!(
        tester.handle().send_functional(CanId::Standard(0x7DF), vec![0; 8]),
        Err(TransportError::FunctionalTooLong(8))
    );
}

#[test]
pub fn isotp_flow_control_timeout() {
    let bus = VirtualBus::new();
    let settings = IsoTpSettings {
        n_bs: Duration::from_millis(50),
        ..Default::default()
    };
    let (tester, _rx) = start(&bus, settings);
    // Nobody answers with flow control
    assert_eq!(
        tester.handle().send(TESTER, vec![0x36; 20]),
        Err(TransportError::FlowControlTimeout)
    );
    assert_eq!(bus.frames().len(), 1);
}

#[test]
pub fn isotp_bus_fault() {
    let bus = VirtualBus::new();
    let (tester, _tester_rx) = start(&bus, IsoTpSettings::default());
    let (ecu, _ecu_rx) = start(&bus, IsoTpSettings::default());
    ecu.handle().add_route(ECU).unwrap();

    bus.set_fault(Some(CanError::BusOff));
    assert_eq!(
        tester.handle().send(TESTER, vec![0x22, 0xF1, 0x90]),
        Err(TransportError::Can(CanError::BusOff))
    );
    bus.set_fault(None);
    tester.handle().send(TESTER, vec![0x22, 0xF1, 0x90]).unwrap();
}
