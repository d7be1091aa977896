//! EtherLink DMA Safety Core
//!
//! Decides, for every buffer handed to hardware, whether it is safe to
//! DMA it as-is, whether it must be copied through a bounce buffer, and
//! what cache management must surround the transfer.
//!
//! # Architecture
//!
//! ```text
//! caller buffer
//!      │
//!      ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ DmaMapper                                                │
//! │   policy gate ── VDS lock / flat translation             │
//! │   64 KB split ── device constraint check                 │
//! │   │                    │ violation                       │
//! │   │ direct             ▼                                 │
//! │   │              BouncePool (copy through slot)          │
//! │   ▼                    │                                 │
//! │   CacheManager sync ◄──┘                                 │
//! └──────────────────────────────────────────────────────────┘
//!      │
//!      ▼
//! SG list -> device (via the NicOps / DmaNicOps contract)
//! ```
//!
//! # What This Crate Does
//!
//! - Monotonic DMA policy (probe sets, tester refines, never loosens)
//! - VDS facade: real-mode translation or the V86 host's lock service
//! - Direction-aware cache tiers (CLFLUSH / WBINVD / software / none)
//! - Fixed ISA-reachable bounce pool with canaried slots
//! - The mapping engine with a generation-tagged descriptor arena
//! - Active capability testing and copybreak selection
//! - Structural integrity sweeps (signatures, canaries, checksums)
//!
//! # What This Crate Does NOT Do
//!
//! - Device register programming (drivers implement [`NicOps`])
//! - Failure recovery orchestration (see `etherlink-engine`)

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod bounce;
pub mod cache;
pub mod caps;
pub mod captest;
pub mod error;
pub mod integrity;
pub mod mapper;
pub mod nic;
pub mod policy;
pub mod sg;
pub mod vds;

// ═══════════════════════════════════════════════════════════════════════════
// CORE RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use addr::{DmaDirection, PhysAddr, VirtRegion, ETH_MAX_FRAME, ETH_MIN_FRAME};
pub use error::{Error, Result};
pub use policy::{initial_policy, CacheTier, DmaPolicy, PolicyCell};

// ═══════════════════════════════════════════════════════════════════════════
// DEVICE RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use caps::{DeviceCaps, DeviceClass, DeviceHealth, DeviceId, DeviceRegistry, MAX_DEVICES};
pub use nic::{DmaNicOps, LoopbackFaults, LoopbackNic, NicOps};

// ═══════════════════════════════════════════════════════════════════════════
// MAPPING RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use bounce::{BouncePool, BounceStats, Purpose, SlotId, BOUNCE_SLOTS, SLOT_SIZE};
pub use cache::{CacheConfig, CacheManager, CacheStats};
pub use mapper::{
    DmaMapper, MapState, MapperConfig, MapperStats, MappingHandle, MappingInfo,
    MAX_ACTIVE_MAPPINGS,
};
pub use sg::{SgList, SgSegment, MAX_SG_ENTRIES};
pub use vds::{
    BusMemory, MappedBus, MappedVds, RealModeBackend, V86Backend, VdsBackend, VdsError, VdsFlags,
    VdsLock,
};

// ═══════════════════════════════════════════════════════════════════════════
// TESTING & INTEGRITY RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use captest::{
    run_capability_tests, CapabilityConfig, CapabilityContext, CapabilityReport, TestOutcome,
};
pub use integrity::{run_sweep, SweepReport};
