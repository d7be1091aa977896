//! Device constraints and the device registry.
//!
//! Each NIC family registers one immutable [`DeviceCaps`] tuple at init.
//! The mapper consults it on every request; nothing mutates it afterwards
//! except the two copybreak thresholds, which the capability tester sets
//! once through interior atomics. Per-device health counters live next to
//! the caps and are the recovery engine's writable state.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::addr::{ETH_MAX_FRAME, ISA_LIMIT};
use crate::error::{Error, Result};

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE CLASSES
// ═══════════════════════════════════════════════════════════════════════════

/// Hardware family, as far as DMA constraints go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// ISA PIO-only card (3C509B class).
    Isa,
    /// ISA bus-master (3C515 class).
    IsaBusMaster,
    /// PCI bus-master (3C905B/C class).
    Pci,
    /// PCMCIA (3C589 class), electrically ISA.
    Pcmcia,
}

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE CAPS
// ═══════════════════════════════════════════════════════════════════════════

/// Per-device DMA constraints, fixed at registration.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCaps {
    pub name: &'static str,
    pub class: DeviceClass,
    /// First byte the device cannot address (exclusive limit).
    pub max_phys_addr: u64,
    /// Required start alignment, power of two <= 128.
    pub alignment: u16,
    /// Transfers must not cross a 64 KB physical boundary.
    pub no_64k_cross: bool,
    /// Device needs one physically contiguous run.
    pub requires_contiguous: bool,
    /// Device executes scatter/gather lists.
    pub supports_sg: bool,
    /// Fragment limit when `supports_sg`.
    pub max_sg_entries: u8,
    /// Largest single transfer in bytes.
    pub max_transfer: u32,
    /// Segment lengths must be multiples of 4.
    pub len_multiple_of_4: bool,
    /// Chipset-independent hardware coherency (PCI snooping bridges).
    pub cache_coherent: bool,
    /// Device must not be programmed with unpinned addresses under V86.
    pub needs_vds: bool,
    /// Default copybreak thresholds, refined later by the tester.
    pub rx_copybreak: u16,
    pub tx_copybreak: u16,
}

impl DeviceCaps {
    /// ISA PIO card: 3C509B class. No DMA engine of its own; mappings
    /// exist only so the shared TX path can treat all cards alike.
    pub const fn isa_pio_3c509b() -> Self {
        Self {
            name: "3C509B EtherLink III",
            class: DeviceClass::Isa,
            max_phys_addr: ISA_LIMIT,
            alignment: 4,
            no_64k_cross: true,
            requires_contiguous: true,
            supports_sg: false,
            max_sg_entries: 1,
            max_transfer: ETH_MAX_FRAME as u32,
            len_multiple_of_4: false,
            cache_coherent: false,
            needs_vds: false,
            rx_copybreak: 1514,
            tx_copybreak: 1514,
        }
    }

    /// PCMCIA card: 3C589 class.
    pub const fn pcmcia_3c589() -> Self {
        Self {
            name: "3C589 EtherLink III PCMCIA",
            class: DeviceClass::Pcmcia,
            max_phys_addr: ISA_LIMIT,
            alignment: 16,
            no_64k_cross: true,
            requires_contiguous: true,
            supports_sg: false,
            max_sg_entries: 1,
            max_transfer: ETH_MAX_FRAME as u32,
            len_multiple_of_4: false,
            cache_coherent: false,
            needs_vds: false,
            rx_copybreak: 1514,
            tx_copybreak: 1514,
        }
    }

    /// ISA bus-master: 3C515-TX class.
    pub const fn isa_busmaster_3c515() -> Self {
        Self {
            name: "3C515-TX Corkscrew",
            class: DeviceClass::IsaBusMaster,
            max_phys_addr: ISA_LIMIT,
            alignment: 8,
            no_64k_cross: true,
            requires_contiguous: false,
            supports_sg: true,
            max_sg_entries: 8,
            max_transfer: 65_536,
            len_multiple_of_4: true,
            cache_coherent: false,
            needs_vds: true,
            rx_copybreak: 256,
            tx_copybreak: 256,
        }
    }

    /// PCI bus-master: 3C905B/C class. Descriptor rings want one
    /// contiguous run per frame even though the DnList format is SG.
    pub const fn pci_3c905b() -> Self {
        Self {
            name: "3C905B/C Cyclone",
            class: DeviceClass::Pci,
            max_phys_addr: 0x1_0000_0000,
            alignment: 16,
            no_64k_cross: false,
            requires_contiguous: true,
            supports_sg: true,
            max_sg_entries: 8,
            max_transfer: 65_536,
            len_multiple_of_4: false,
            cache_coherent: true,
            needs_vds: true,
            rx_copybreak: 256,
            tx_copybreak: 256,
        }
    }

    /// Registration-time sanity checks.
    pub fn validate(&self) -> Result<()> {
        let align_ok = self.alignment.is_power_of_two() && self.alignment <= 128;
        let xfer_ok = self.max_transfer >= ETH_MAX_FRAME as u32;
        let sg_ok = !self.supports_sg || self.max_sg_entries >= 1;
        if align_ok && xfer_ok && sg_ok {
            Ok(())
        } else {
            Err(Error::InvalidParam)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE HEALTH
// ═══════════════════════════════════════════════════════════════════════════

/// Mutable per-device state, touched from the main path and from
/// interrupt-driven completion accounting. Plain atomics; compound
/// read-modify-write happens under critical sections in the owners.
#[derive(Debug)]
pub struct DeviceHealth {
    pub link_up: AtomicBool,
    disabled: AtomicBool,
    pub tx_packets: AtomicU32,
    pub rx_packets: AtomicU32,
    pub tx_errors: AtomicU32,
    pub rx_errors: AtomicU32,
    pub consecutive_errors: AtomicU32,
    pub last_error_us: AtomicU64,
    rx_copybreak: AtomicU16,
    tx_copybreak: AtomicU16,
}

impl DeviceHealth {
    fn new(caps: &DeviceCaps) -> Self {
        Self {
            link_up: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            tx_packets: AtomicU32::new(0),
            rx_packets: AtomicU32::new(0),
            tx_errors: AtomicU32::new(0),
            rx_errors: AtomicU32::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_error_us: AtomicU64::new(0),
            rx_copybreak: AtomicU16::new(caps.rx_copybreak),
            tx_copybreak: AtomicU16::new(caps.tx_copybreak),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Graceful degradation: no new mappings will target this device.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn record_success(&self, tx: bool) {
        if tx {
            self.tx_packets.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rx_packets.fetch_add(1, Ordering::Relaxed);
        }
        self.consecutive_errors.store(0, Ordering::Release);
    }

    pub fn record_error(&self, tx: bool, now_us: u64) -> u32 {
        // Counter invariant: an errored operation is still an operation.
        if tx {
            self.tx_packets.fetch_add(1, Ordering::Relaxed);
            self.tx_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.rx_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.last_error_us.store(now_us, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn rx_copybreak(&self) -> u16 {
        self.rx_copybreak.load(Ordering::Relaxed)
    }

    pub fn tx_copybreak(&self) -> u16 {
        self.tx_copybreak.load(Ordering::Relaxed)
    }

    /// Capability-tester hook.
    pub fn set_copybreak(&self, rx: u16, tx: u16) {
        self.rx_copybreak.store(rx, Ordering::Relaxed);
        self.tx_copybreak.store(tx, Ordering::Relaxed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// Maximum NICs one machine can present to this driver.
pub const MAX_DEVICES: usize = 4;

/// Opaque device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(u8);

impl DeviceId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

struct Entry {
    caps: DeviceCaps,
    health: DeviceHealth,
}

/// Fixed-capacity device table. Registration happens during single-
/// threaded init (`&mut self`); afterwards the registry is shared
/// immutably and only the interior atomics move.
pub struct DeviceRegistry {
    entries: [Option<Entry>; MAX_DEVICES],
    count: u8,
}

impl DeviceRegistry {
    pub const fn new() -> Self {
        const VACANT: Option<Entry> = None;
        Self { entries: [VACANT; MAX_DEVICES], count: 0 }
    }

    /// Register a device. Caps are validated and frozen.
    pub fn register(&mut self, caps: DeviceCaps) -> Result<DeviceId> {
        caps.validate()?;
        let index = self.count as usize;
        if index >= MAX_DEVICES {
            return Err(Error::InvalidParam);
        }
        let health = DeviceHealth::new(&caps);
        self.entries[index] = Some(Entry { caps, health });
        self.count += 1;
        log::info!("[REGISTRY] {} registered as device {}", caps.name, index);
        Ok(DeviceId(index as u8))
    }

    pub fn caps(&self, id: DeviceId) -> Result<&DeviceCaps> {
        self.entries
            .get(id.index())
            .and_then(|e| e.as_ref())
            .map(|e| &e.caps)
            .ok_or(Error::InvalidParam)
    }

    pub fn health(&self, id: DeviceId) -> Result<&DeviceHealth> {
        self.entries
            .get(id.index())
            .and_then(|e| e.as_ref())
            .map(|e| &e.health)
            .ok_or(Error::InvalidParam)
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Registered device ids, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> {
        (0..self.count).map(DeviceId)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
