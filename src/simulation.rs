//! In-memory CAN bus and flash memory for bench testing without hardware

use std::sync::{Arc, Mutex, PoisonError};

use log::trace;

use crate::{
    channel::{CanChannel, CanError, CanFrame, CanResult, FrameSink},
    flash::{FlashDriver, FlashDriverError},
};

#[derive(Debug, Default)]
struct BusInner {
    nodes: Vec<Option<FrameSink>>,
    log: Vec<CanFrame>,
    fault: Option<CanError>,
}

/// A loss free CAN bus shared by any number of [VirtualChannel]s.
///
/// Every frame sent by one channel is delivered to every other open channel in
/// send order, and recorded in a log.
#[derive(Debug, Clone, Default)]
pub struct VirtualBus {
    inner: Arc<Mutex<BusInner>>,
}

impl VirtualBus {
    /// Creates an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new node to the bus
    pub fn channel(&self) -> VirtualChannel {
        let mut inner = self.lock();
        inner.nodes.push(None);
        VirtualChannel {
            bus: self.clone(),
            node: inner.nodes.len() - 1,
        }
    }

    /// Every frame sent on the bus so far
    pub fn frames(&self) -> Vec<CanFrame> {
        self.lock().log.clone()
    }

    /// Clears the frame log
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Makes every send fail with `fault` (None restores the bus) and reports
    /// it to every open node
    pub fn set_fault(&self, fault: Option<CanError>) {
        let mut inner = self.lock();
        inner.fault = fault;
        if let Some(e) = fault {
            for sink in inner.nodes.iter().flatten() {
                sink.report_error(e);
            }
        }
    }
}

/// One node's connection to a [VirtualBus]
#[derive(Debug)]
pub struct VirtualChannel {
    bus: VirtualBus,
    node: usize,
}

impl CanChannel for VirtualChannel {
    fn open(&mut self, sink: FrameSink) -> CanResult<()> {
        self.bus.lock().nodes[self.node] = Some(sink);
        Ok(())
    }

    fn close(&mut self) -> CanResult<()> {
        self.bus.lock().nodes[self.node] = None;
        Ok(())
    }

    fn send_frame(&mut self, frame: &CanFrame) -> CanResult<()> {
        let mut inner = self.bus.lock();
        if inner.nodes[self.node].is_none() {
            return Err(CanError::NotOpen);
        }
        if let Some(e) = inner.fault {
            return Err(e);
        }
        trace!("Bus node {} -> {frame:?}", self.node);
        inner.log.push(*frame);
        for (idx, sink) in inner.nodes.iter().enumerate() {
            if let Some(sink) = sink.as_ref().filter(|_| idx != self.node) {
                sink.deliver(*frame);
            }
        }
        Ok(())
    }
}

/// Flash memory backed by a byte vector. Erased bytes read as 0xFF.
///
/// Clones share the same memory, so a test can keep one to inspect what an ECU programmed.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    base: u32,
    memory: Arc<Mutex<Vec<u8>>>,
    fail_at: Arc<Mutex<Option<u32>>>,
}

impl MemoryFlash {
    /// Erased value of a byte
    pub const ERASED: u8 = 0xFF;

    /// Creates `size` bytes of erased memory starting at `base`
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            memory: Arc::new(Mutex::new(vec![Self::ERASED; size])),
            fail_at: Arc::new(Mutex::new(None)),
        }
    }

    /// Copy of the memory contents
    pub fn contents(&self) -> Vec<u8> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Makes programming any range containing `address` fail
    pub fn fail_program_at(&self, address: Option<u32>) {
        *self.fail_at.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }

    fn range(&self, address: u32, length: usize, size: usize) -> Result<std::ops::Range<usize>, FlashDriverError> {
        let out_of_range = FlashDriverError::OutOfRange { address, length };
        let start = address.checked_sub(self.base).ok_or(out_of_range.clone())? as usize;
        match start.checked_add(length) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(out_of_range),
        }
    }
}

impl FlashDriver for MemoryFlash {
    fn erase(&mut self, address: u32, length: usize) -> Result<(), FlashDriverError> {
        let mut mem = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let range = self.range(address, length, mem.len())?;
        mem[range].fill(Self::ERASED);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashDriverError> {
        let mut mem = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let range = self.range(address, data.len(), mem.len())?;
        if let Some(bad) = *self.fail_at.lock().unwrap_or_else(PoisonError::into_inner) {
            if (address..address.saturating_add(data.len() as u32)).contains(&bad) {
                return Err(FlashDriverError::ProgramFailed(bad));
            }
        }
        mem[range].copy_from_slice(data);
        Ok(())
    }

    fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), FlashDriverError> {
        let mem = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let range = self.range(address, data.len(), mem.len())?;
        match mem[range].iter().zip(data).position(|(a, b)| a != b) {
            Some(idx) => Err(FlashDriverError::VerifyFailed(address + idx as u32)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{channel::CanId, isotp::engine::EngineInput};

    #[test]
    fn frames_reach_other_nodes_only() {
        let bus = VirtualBus::new();
        let (tx_a, rx_a) = mpsc::channel::<EngineInput>();
        let (tx_b, rx_b) = mpsc::channel::<EngineInput>();
        let mut a = bus.channel();
        let mut b = bus.channel();
        let mut closed = bus.channel();
        a.open(FrameSink::new(tx_a)).unwrap();
        b.open(FrameSink::new(tx_b)).unwrap();

        let f = CanFrame::new(CanId::Standard(0x7E0), &[0x02, 0x10, 0x01]).unwrap();
        a.send_frame(&f).unwrap();
        assert!(matches!(rx_b.try_recv(), Ok(EngineInput::Frame(x)) if x == f));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(bus.frames(), vec![f]);
        assert_eq!(closed.send_frame(&f), Err(CanError::NotOpen));

        bus.set_fault(Some(CanError::BusOff));
        assert!(matches!(rx_a.try_recv(), Ok(EngineInput::BusError(CanError::BusOff))));
        assert_eq!(a.send_frame(&f), Err(CanError::BusOff));
    }

    #[test]
    fn memory_flash() {
        let mut flash = MemoryFlash::new(0x1000, 16);
        flash.program(0x1004, &[1, 2, 3]).unwrap();
        flash.verify(0x1004, &[1, 2, 3]).unwrap();
        assert_eq!(flash.verify(0x1004, &[1, 9, 3]), Err(FlashDriverError::VerifyFailed(0x1005)));
        assert_eq!(&flash.contents()[3..8], &[0xFF, 1, 2, 3, 0xFF]);
        assert!(flash.program(0x0FFF, &[0]).is_err());
        assert!(flash.program(0x100F, &[0, 0]).is_err());
        flash.erase(0x1000, 16).unwrap();
        assert!(flash.contents().iter().all(|b| *b == 0xFF));
        flash.fail_program_at(Some(0x1002));
        assert_eq!(flash.program(0x1000, &[0; 4]), Err(FlashDriverError::ProgramFailed(0x1002)));
    }
}
