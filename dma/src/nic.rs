//! Device-side contract.
//!
//! The small set of operations every registered NIC driver provides. The
//! core composes these under the DMA and recovery policies; it never
//! reaches into device registers itself. Bus-master families additionally
//! implement [`DmaNicOps`], the hook the mapper's SG lists are handed to.
//!
//! [`LoopbackNic`] is the reference implementation: a software device
//! wired to a [`BusMemory`] view, used by the capability tester and by
//! every harness that needs a NIC without hardware.

use heapless::Vec;
use log::debug;

use crate::addr::ETH_MAX_FRAME;
use crate::error::{Error, Result};
use crate::sg::SgList;
use crate::vds::BusMemory;

/// Internal frame buffer size: one MTU frame plus the padding a
/// multiple-of-4 DMA engine may append.
const FRAME_BUF: usize = 1600;

// ═══════════════════════════════════════════════════════════════════════════
// CONTRACT
// ═══════════════════════════════════════════════════════════════════════════

/// Operations the core requires from every NIC driver.
pub trait NicOps {
    /// Full device reset. Clears queues and error state.
    fn reset(&mut self) -> Result<()>;

    fn irq_enable(&mut self);
    fn irq_disable(&mut self);

    /// Has the last transmit finished?
    fn tx_complete(&mut self) -> bool;

    /// Is a received frame waiting?
    fn rx_ready(&mut self) -> bool;

    /// Programmed-I/O transmit.
    fn send_pio(&mut self, frame: &[u8]) -> Result<()>;

    /// Programmed-I/O receive. `Ok(None)` when nothing is waiting.
    fn recv_pio(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Register self-test: true when the device state reads back sane.
    fn self_test(&mut self) -> bool;

    fn link_up(&self) -> bool;

    /// Internal loopback mode for capability testing.
    fn set_loopback(&mut self, on: bool);
}

/// Bus-master extension: execute a mapper-produced SG list.
pub trait DmaNicOps: NicOps {
    /// Gather `sg` and transmit it.
    fn start_tx_dma(&mut self, sg: &SgList) -> Result<()>;

    /// Scatter the next received frame into `sg`. Returns frame length.
    fn start_rx_dma(&mut self, sg: &SgList) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════
// SOFTWARE LOOPBACK NIC
// ═══════════════════════════════════════════════════════════════════════════

/// Fault-injection knobs for tests and capability probing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackFaults {
    /// Next transmit fails, then the flag clears.
    pub fail_next_tx: bool,
    /// Link reported down.
    pub link_down: bool,
    /// Self-test reads back corrupt registers.
    pub fail_self_test: bool,
    /// `tx_complete` stays false for this many polls.
    pub defer_completion: u32,
    /// `reset` itself fails (dead card).
    pub fail_reset: bool,
    /// DMA transmits succeed this many more times, then the bus-master
    /// engine wedges. PIO is unaffected.
    pub fail_dma_after: Option<u32>,
}

/// In-memory NIC. Transmits land in a one-frame queue; with loopback on,
/// what is sent is what is received. DMA paths go through the bus-memory
/// view exactly as silicon would.
pub struct LoopbackNic<'b> {
    bus: &'b dyn BusMemory,
    queue: Option<Vec<u8, FRAME_BUF>>,
    loopback: bool,
    irq_enabled: bool,
    completion_wait: u32,
    pub faults: LoopbackFaults,
    pub resets: u32,
}

impl<'b> LoopbackNic<'b> {
    pub fn new(bus: &'b dyn BusMemory) -> Self {
        Self {
            bus,
            queue: None,
            loopback: false,
            irq_enabled: false,
            completion_wait: 0,
            faults: LoopbackFaults::default(),
            resets: 0,
        }
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled
    }

    fn enqueue(&mut self, frame: Vec<u8, FRAME_BUF>) {
        if self.loopback {
            self.queue = Some(frame);
        }
        // Without loopback the frame leaves the machine.
        self.completion_wait = self.faults.defer_completion;
    }

    fn take_fault(&mut self) -> Result<()> {
        if self.faults.fail_next_tx {
            self.faults.fail_next_tx = false;
            return Err(Error::HardwareFailure);
        }
        if self.faults.link_down && !self.loopback {
            return Err(Error::HardwareFailure);
        }
        Ok(())
    }
}

impl NicOps for LoopbackNic<'_> {
    fn reset(&mut self) -> Result<()> {
        if self.faults.fail_reset {
            return Err(Error::HardwareFailure);
        }
        self.resets += 1;
        self.queue = None;
        self.completion_wait = 0;
        self.irq_enabled = false;
        // A reset clears transient error injection but not the link
        self.faults.fail_next_tx = false;
        self.faults.fail_self_test = false;
        debug!("[LOOPBACK] reset #{}", self.resets);
        Ok(())
    }

    fn irq_enable(&mut self) {
        self.irq_enabled = true;
    }

    fn irq_disable(&mut self) {
        self.irq_enabled = false;
    }

    fn tx_complete(&mut self) -> bool {
        if self.completion_wait > 0 {
            self.completion_wait -= 1;
            return false;
        }
        true
    }

    fn rx_ready(&mut self) -> bool {
        self.queue.is_some()
    }

    fn send_pio(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > ETH_MAX_FRAME {
            return Err(Error::BufferTooLarge);
        }
        self.take_fault()?;
        let mut copy = Vec::new();
        copy.extend_from_slice(frame).map_err(|_| Error::BufferTooLarge)?;
        self.enqueue(copy);
        Ok(())
    }

    fn recv_pio(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.queue.take() {
            None => Ok(None),
            Some(frame) => {
                if buf.len() < frame.len() {
                    // Frame stays queued; caller brought too small a buffer
                    self.queue = Some(frame);
                    return Err(Error::InvalidParam);
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
        }
    }

    fn self_test(&mut self) -> bool {
        !self.faults.fail_self_test
    }

    fn link_up(&self) -> bool {
        !self.faults.link_down
    }

    fn set_loopback(&mut self, on: bool) {
        self.loopback = on;
    }
}

impl DmaNicOps for LoopbackNic<'_> {
    fn start_tx_dma(&mut self, sg: &SgList) -> Result<()> {
        self.take_fault()?;
        if let Some(budget) = self.faults.fail_dma_after.as_mut() {
            if *budget == 0 {
                return Err(Error::HardwareFailure);
            }
            *budget -= 1;
        }
        let total = sg.total_len() as usize;
        if total > FRAME_BUF {
            return Err(Error::BufferTooLarge);
        }
        // Gather: read each physical run the way the bus master would
        let mut frame: Vec<u8, FRAME_BUF> = Vec::new();
        for seg in sg.iter() {
            let start = frame.len();
            frame
                .resize_default(start + seg.len as usize)
                .map_err(|_| Error::BufferTooLarge)?;
            if !self.bus.read_phys(seg.phys, &mut frame[start..]) {
                return Err(Error::HardwareFailure);
            }
        }
        self.enqueue(frame);
        Ok(())
    }

    fn start_rx_dma(&mut self, sg: &SgList) -> Result<usize> {
        let frame = self.queue.take().ok_or(Error::Timeout)?;
        if (sg.total_len() as usize) < frame.len() {
            self.queue = Some(frame);
            return Err(Error::BufferTooLarge);
        }
        // Scatter into the physical runs
        let mut offset = 0usize;
        for seg in sg.iter() {
            if offset >= frame.len() {
                break;
            }
            let take = (seg.len as usize).min(frame.len() - offset);
            if !self.bus.write_phys(seg.phys, &frame[offset..offset + take]) {
                return Err(Error::HardwareFailure);
            }
            offset += take;
        }
        self.completion_wait = self.faults.defer_completion;
        Ok(frame.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
