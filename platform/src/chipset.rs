//! Host-bridge identification.
//!
//! A small built-in table of the bridges this driver is likely to meet,
//! each with the one fact the DMA core cares about: does the chipset snoop
//! bus-master writes into the CPU cache. Identification only ever uses
//! configuration-space reads through the PCI BIOS facade.

use log::debug;

use crate::pcibios::{offset, PciAddr, PciBios, PciConfigAccess, NO_DEVICE};

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// How certain the identification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Identified host bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chipset {
    pub vendor: u16,
    pub device: u16,
    /// Human-readable bridge name, or "unknown host bridge".
    pub name: &'static str,
    /// Whether the bridge snoops bus-master DMA into the CPU cache.
    pub snoops_dma: bool,
    pub confidence: Confidence,
}

struct BridgeEntry {
    vendor: u16,
    device: u16,
    name: &'static str,
    snoops_dma: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// BRIDGE TABLE
// ═══════════════════════════════════════════════════════════════════════════

/// Bridges with known snoop behaviour.
///
/// The Intel desktop parts all snoop. The 486-era VL/ISA bridges from SiS,
/// UMC and OPTi mostly do not snoop master cycles originating on the ISA
/// side, which is exactly the traffic this driver generates.
const BRIDGES: &[BridgeEntry] = &[
    BridgeEntry { vendor: 0x8086, device: 0x122D, name: "Intel 82437FX (430FX)", snoops_dma: true },
    BridgeEntry { vendor: 0x8086, device: 0x1250, name: "Intel 82439HX (430HX)", snoops_dma: true },
    BridgeEntry { vendor: 0x8086, device: 0x7030, name: "Intel 82437VX (430VX)", snoops_dma: true },
    BridgeEntry { vendor: 0x8086, device: 0x7100, name: "Intel 82439TX (430TX)", snoops_dma: true },
    BridgeEntry { vendor: 0x8086, device: 0x1237, name: "Intel 82441FX (440FX)", snoops_dma: true },
    BridgeEntry { vendor: 0x8086, device: 0x7190, name: "Intel 82443BX (440BX)", snoops_dma: true },
    BridgeEntry { vendor: 0x1039, device: 0x0496, name: "SiS 85C496", snoops_dma: false },
    BridgeEntry { vendor: 0x1039, device: 0x5511, name: "SiS 5511", snoops_dma: true },
    BridgeEntry { vendor: 0x1060, device: 0x0881, name: "UMC UM8881F", snoops_dma: false },
    BridgeEntry { vendor: 0x1060, device: 0x886A, name: "UMC UM8886AF", snoops_dma: false },
    BridgeEntry { vendor: 0x1045, device: 0xC557, name: "OPTi 82C557 Viper-M", snoops_dma: false },
    BridgeEntry { vendor: 0x1004, device: 0x0005, name: "VLSI 82C592 Wildcat", snoops_dma: false },
    BridgeEntry { vendor: 0x10B9, device: 0x1489, name: "ALi M1489", snoops_dma: false },
];

// ═══════════════════════════════════════════════════════════════════════════
// IDENTIFICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Identify the host bridge at 00:00.0.
///
/// `None` when no PCI BIOS is present or the bridge slot is empty. An
/// unlisted bridge yields `Confidence::Medium` with `snoops_dma = false`:
/// unknown parts never relax the DMA policy.
pub fn identify(access: &dyn PciConfigAccess, bios: Option<&PciBios>) -> Option<Chipset> {
    bios?;

    let host = PciAddr::new(0, 0, 0);
    let vendor = access.read16(host, offset::VENDOR_ID);
    if vendor == NO_DEVICE || vendor == 0x0000 {
        return None;
    }
    let device = access.read16(host, offset::DEVICE_ID);

    for entry in BRIDGES {
        if entry.vendor == vendor && entry.device == device {
            debug!("[CHIPSET] {} (snoop={})", entry.name, entry.snoops_dma);
            return Some(Chipset {
                vendor,
                device,
                name: entry.name,
                snoops_dma: entry.snoops_dma,
                confidence: Confidence::High,
            });
        }
    }

    debug!("[CHIPSET] unknown host bridge {:04x}:{:04x}", vendor, device);
    Some(Chipset {
        vendor,
        device,
        name: "unknown host bridge",
        snoops_dma: false,
        confidence: Confidence::Medium,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
