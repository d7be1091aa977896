//! Recovery strategies.
//!
//! Picks a strategy per failure class and executes the device-local ones
//! through the NIC contract. Failover and disable need knowledge of the
//! whole fleet, so the engine carries those out itself.

use etherlink_dma::{Error, NicOps, Result};
use etherlink_platform::{busy_wait, TickSource};
use log::{info, warn};

use crate::health::{FailureKind, HealthConfig};

// ═══════════════════════════════════════════════════════════════════════════
// STRATEGIES
// ═══════════════════════════════════════════════════════════════════════════

/// What to do about a failure, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Quiesce interrupts, pause, re-enable.
    SoftReset,
    /// Device reset, settle delay, interrupt reinit.
    HardReset,
    /// Full cleanup + init.
    Reinit,
    /// Redirect traffic to a healthy peer.
    Failover,
    /// Graceful degradation: stop using the device.
    Disable,
}

/// Execution knobs.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// Soft-reset quiesce pause.
    pub pause_us: u64,
    /// Post-reset settle delay.
    pub settle_us: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { pause_us: 10_000, settle_us: 50_000 }
    }
}

/// Default strategy per failure class, escalated to failover once the
/// consecutive-error budget is gone.
pub fn strategy_for(kind: FailureKind, consecutive: u32, config: &HealthConfig) -> Strategy {
    if kind == FailureKind::Critical {
        return Strategy::Disable;
    }
    if consecutive >= config.max_consecutive_errors {
        return Strategy::Failover;
    }
    match kind {
        FailureKind::LinkLost | FailureKind::TxTimeout | FailureKind::RxTimeout => {
            Strategy::SoftReset
        }
        FailureKind::ErrorRate => Strategy::Reinit,
        FailureKind::InterruptStorm | FailureKind::RegisterCorruption => Strategy::HardReset,
        FailureKind::Critical => Strategy::Disable,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION
// ═══════════════════════════════════════════════════════════════════════════

/// Execute a device-local strategy.
///
/// Success means the device passes self-test afterwards. `Failover` and
/// `Disable` are fleet-level; asking this function to run them is a bug
/// surfaced as `InvalidParam`.
pub fn execute(
    nic: &mut dyn NicOps,
    tick: &dyn TickSource,
    strategy: Strategy,
    config: &RecoveryConfig,
) -> Result<()> {
    match strategy {
        Strategy::SoftReset => {
            info!("[RECOVERY] soft reset");
            nic.irq_disable();
            let _ = busy_wait(tick, config.pause_us, || false);
            nic.irq_enable();
        }
        Strategy::HardReset => {
            info!("[RECOVERY] hard reset");
            nic.reset()?;
            let _ = busy_wait(tick, config.settle_us, || false);
            nic.irq_enable();
        }
        Strategy::Reinit => {
            info!("[RECOVERY] reinitialize");
            nic.irq_disable();
            nic.reset()?;
            nic.irq_enable();
        }
        Strategy::Failover | Strategy::Disable => {
            warn!("[RECOVERY] fleet-level strategy passed to device executor");
            return Err(Error::InvalidParam);
        }
    }
    if nic.self_test() {
        Ok(())
    } else {
        Err(Error::HardwareFailure)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
