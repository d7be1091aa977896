//! Platform Layer
//!
//! Everything the EtherLink DMA core needs to know about the machine it is
//! running on, and the bare-metal primitives the rest of the workspace is
//! built from.
//!
//! # What This Crate Does
//!
//! - CPU identification (class, cache instructions, cache mode, V86)
//! - PCI BIOS installation check and configuration-space reads
//! - Host-bridge identification with snoop characteristics
//! - Monotonic tick sources (TSC, BIOS tick, manual) and bounded waits
//! - Closure-scoped critical sections over interrupt-shared state
//!
//! # What This Crate Does NOT Do
//!
//! - Active DMA capability testing (see `etherlink-dma`)
//! - Device-specific register programming
//! - Policy decisions (it reports facts; the core decides)
//!
//! Hardware access is confined to narrow `cfg`-gated primitives with
//! portable stubs, so the whole crate builds and tests on a hosted target.

#![cfg_attr(not(test), no_std)]

pub mod chipset;
pub mod cpu;
pub mod pcibios;
pub mod probe;
pub mod sync;
pub mod timer;

// ═══════════════════════════════════════════════════════════════════════════
// CPU RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use cpu::{CacheMode, CpuClass, CpuFeatures, CpuInfo};

// ═══════════════════════════════════════════════════════════════════════════
// PROBE RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use chipset::{Chipset, Confidence};
pub use pcibios::{offset, BiosConfigAccess, PciAddr, PciBios, PciConfigAccess, NO_DEVICE};
pub use probe::{probe, PlatformReport};

// ═══════════════════════════════════════════════════════════════════════════
// SYNC RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use sync::{critical_section, interrupts_enabled, IrqCell};

// ═══════════════════════════════════════════════════════════════════════════
// TIMER RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use timer::{busy_wait, BiosTicker, ManualTicker, TickSource, TscTicker, WaitTimeout, BIOS_TICK_US};
