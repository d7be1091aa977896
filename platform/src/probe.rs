//! Platform probe orchestrator.
//!
//! One-shot, non-destructive detection pass. After this runs, the DMA core
//! knows everything about the machine that can be known without actually
//! moving data:
//!
//! ```text
//! probe()
//!    │
//!    ▼
//! ┌────────────────────────────────────────────────────────┐
//! │  Phase 1: CPU      class, features, cache mode, V86    │
//! │  Phase 2: PCI      BIOS installation check             │
//! │  Phase 3: Chipset  host-bridge snoop characteristics   │
//! │                                                        │
//! │  Result: PlatformReport (immutable)                    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Active verification (loopback transfers, timing) is the capability
//! tester's job; this module only inspects.

use log::info;

use crate::chipset::{self, Chipset};
use crate::cpu::CpuInfo;
use crate::pcibios::{PciBios, PciConfigAccess};

/// Everything the one-shot probe learned.
///
/// Immutable once produced; the DMA core and the capability tester only
/// ever read it.
#[derive(Debug, Clone, Copy)]
pub struct PlatformReport {
    pub cpu: CpuInfo,
    /// PCI BIOS, when installed.
    pub pci: Option<PciBios>,
    /// Identified host bridge, when a PCI BIOS exists.
    pub chipset: Option<Chipset>,
    /// Whether the virtual DMA service responded to its presence check.
    /// Supplied by the caller, which owns the VDS facade.
    pub vds_present: bool,
}

/// Run the full inspection pass.
///
/// `vds_present` is handed in because the VDS facade lives a layer above;
/// its presence check has already been done by the time the report is
/// assembled.
pub fn probe(access: &dyn PciConfigAccess, vds_present: bool) -> PlatformReport {
    info!("[PROBE] platform inspection start");

    let cpu = CpuInfo::detect();
    info!(
        "[PROBE]   cpu: {:?}, cache {:?}, v86={}",
        cpu.class, cpu.cache_mode, cpu.v86_active
    );

    let pci = PciBios::detect();
    match &pci {
        Some(bios) => info!(
            "[PROBE]   pci bios {:x}.{:02x}, last bus {}",
            bios.major, bios.minor, bios.last_bus
        ),
        None => info!("[PROBE]   no pci bios"),
    }

    let chipset = chipset::identify(access, pci.as_ref());
    if let Some(cs) = &chipset {
        info!("[PROBE]   host bridge: {}", cs.name);
    }

    info!("[PROBE]   vds present: {}", vds_present);

    PlatformReport { cpu, pci, chipset, vds_present }
}
