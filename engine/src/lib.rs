//! EtherLink Transfer Engine
//!
//! The operational layer above the DMA safety core: failure detection,
//! recovery strategies, retry-wrapped send/receive with copybreak
//! routing, failover across registered NICs, and the periodic integrity
//! tick.
//!
//! The engine degrades rather than dies: a failing NIC is soft-reset,
//! hard-reset, reinitialized, failed-over, or disabled in that order of
//! escalation, and the driver keeps serving traffic (PIO-only, or one
//! NIC down) until every device is gone, at which point callers see
//! `HardwareFailure` explicitly.

#![cfg_attr(not(test), no_std)]

pub mod engine;
pub mod health;
pub mod recovery;

// ═══════════════════════════════════════════════════════════════════════════
// RE-EXPORTS
// ═══════════════════════════════════════════════════════════════════════════

pub use engine::{EngineConfig, FailoverEvent, PacketEngine};
pub use health::{classify, ErrorContext, FailureKind, HealthConfig, OpKind, Sample, ERROR_WINDOW};
pub use recovery::{execute, strategy_for, RecoveryConfig, Strategy};
