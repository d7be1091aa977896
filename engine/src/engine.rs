//! Retry-wrapped transfer paths.
//!
//! The engine owns the operational loop around the DMA core: copybreak
//! routing between PIO and DMA, bounded completion waits, failure
//! classification after every operation, recovery execution, and the
//! fleet-level strategies (failover, disable) that need to see every
//! registered NIC.
//!
//! Retry discipline: parameter and environment errors surface
//! immediately; hardware-class failures get at most `max_retries`
//! attempts with exponential backoff, each preceded by detection and
//! recovery. A successful recovery earns exactly one retry of the
//! original operation.

use etherlink_dma::{
    run_sweep, BouncePool, DeviceId, DeviceRegistry, DmaMapper, DmaNicOps, DmaPolicy, Error,
    PolicyCell, Result, SweepReport, VirtRegion, ETH_MAX_FRAME, ETH_MIN_FRAME, MAX_DEVICES,
};
use etherlink_platform::{busy_wait, TickSource};
use log::{error, info, warn};

use crate::health::{classify, ErrorContext, FailureKind, HealthConfig, OpKind, Sample};
use crate::recovery::{execute, strategy_for, RecoveryConfig, Strategy};

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub health: HealthConfig,
    pub recovery: RecoveryConfig,
    /// Hardware-failure retries per operation.
    pub max_retries: u32,
    /// First retry backoff; doubles per attempt.
    pub retry_backoff_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            recovery: RecoveryConfig::default(),
            max_retries: 3,
            retry_backoff_us: 1_000,
        }
    }
}

/// Record of the last failover decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEvent {
    pub from: DeviceId,
    /// `None` when no healthy peer existed and `from` was only disabled.
    pub to: Option<DeviceId>,
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════

/// The per-machine transfer coordinator. Main-path only; interrupt
/// handlers never call into it.
pub struct PacketEngine<'a> {
    mapper: &'a DmaMapper<'a>,
    registry: &'a DeviceRegistry,
    pool: &'a BouncePool,
    policy: &'a PolicyCell,
    tick: &'a dyn TickSource,
    config: EngineConfig,
    contexts: [Option<ErrorContext>; MAX_DEVICES],
    pub last_failover: Option<FailoverEvent>,
}

impl<'a> PacketEngine<'a> {
    pub fn new(
        mapper: &'a DmaMapper<'a>,
        registry: &'a DeviceRegistry,
        pool: &'a BouncePool,
        policy: &'a PolicyCell,
        tick: &'a dyn TickSource,
        config: EngineConfig,
    ) -> Self {
        Self {
            mapper,
            registry,
            pool,
            policy,
            tick,
            config,
            contexts: core::array::from_fn(|_| None),
            last_failover: None,
        }
    }

    // ── Transmit ────────────────────────────────────────────────────────

    /// Send one frame, with copybreak routing and bounded recovery.
    pub fn send(&mut self, nic: &mut dyn DmaNicOps, dev: DeviceId, frame: &[u8]) -> Result<()> {
        if frame.len() < ETH_MIN_FRAME || frame.len() > ETH_MAX_FRAME {
            return Err(Error::InvalidParam);
        }
        let health = self.registry.health(dev)?;
        if health.is_disabled() {
            return Err(Error::DeviceDisabled);
        }
        health
            .link_up
            .store(nic.link_up(), core::sync::atomic::Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            match self.try_send_once(nic, dev, frame) {
                Ok(()) => {
                    let now = self.tick.now_us();
                    health.record_success(true);
                    self.context_mut(dev).record(false, now);
                    return Ok(());
                }
                // Parameter and environment errors: no retry
                Err(
                    e @ (Error::InvalidParam
                    | Error::BufferTooLarge
                    | Error::DmaForbidden
                    | Error::VdsUnavailable
                    | Error::DeviceDisabled
                    | Error::BounceExhausted
                    | Error::IntegrityViolation),
                ) => return Err(e),
                Err(e) => {
                    let now = self.tick.now_us();
                    let consecutive = health.record_error(true, now);
                    self.context_mut(dev).record(true, now);

                    let sample = Sample {
                        link_up: nic.link_up(),
                        timed_out: (e == Error::Timeout).then_some(OpKind::Tx),
                        self_test_ok: nic.self_test(),
                        critical: false,
                    };
                    let health_config = self.config.health;
                    let kind = classify(self.context_mut(dev), &health_config, &sample)
                        .unwrap_or(FailureKind::TxTimeout);
                    self.run_recovery(nic, dev, kind, consecutive)?;

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!("[ENGINE] tx retry budget exhausted on dev {}", dev.index());
                        return Err(e);
                    }
                    let backoff = self.config.retry_backoff_us << (attempt - 1);
                    let _ = busy_wait(self.tick, backoff, || false);
                }
            }
        }
    }

    fn try_send_once(&self, nic: &mut dyn DmaNicOps, dev: DeviceId, frame: &[u8]) -> Result<()> {
        let health = self.registry.health(dev)?;
        let use_pio = self.policy.get() == DmaPolicy::Forbid
            || frame.len() <= health.tx_copybreak() as usize;
        if use_pio {
            return self.send_pio_once(nic, frame);
        }

        let handle = match self.mapper.map_tx(VirtRegion::from_slice(frame), dev) {
            Ok(h) => h,
            // Policy clamped mid-flight: the PIO path still exists
            Err(Error::DmaForbidden) => return self.send_pio_once(nic, frame),
            Err(e) => return Err(e),
        };
        let info = self.mapper.info(handle)?;
        if let Err(e) = nic.start_tx_dma(&info.segments) {
            let _ = self.mapper.unmap(handle);
            return Err(e);
        }
        let wait = busy_wait(self.tick, self.config.health.tx_timeout_us, || nic.tx_complete());
        let unmapped = self.mapper.unmap(handle);
        wait?;
        unmapped
    }

    fn send_pio_once(&self, nic: &mut dyn DmaNicOps, frame: &[u8]) -> Result<()> {
        nic.send_pio(frame)?;
        busy_wait(self.tick, self.config.health.tx_timeout_us, || nic.tx_complete())?;
        Ok(())
    }

    // ── Receive ─────────────────────────────────────────────────────────

    /// Wait for and deliver one frame into `buf`.
    pub fn receive(&mut self, nic: &mut dyn DmaNicOps, dev: DeviceId, buf: &mut [u8]) -> Result<usize> {
        let health = self.registry.health(dev)?;
        if health.is_disabled() {
            return Err(Error::DeviceDisabled);
        }
        health
            .link_up
            .store(nic.link_up(), core::sync::atomic::Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            let ready = busy_wait(self.tick, self.config.health.rx_timeout_us, || nic.rx_ready());
            if ready.is_ok() {
                let len = self.receive_once(nic, dev, buf)?;
                let now = self.tick.now_us();
                health.record_success(false);
                self.context_mut(dev).record(false, now);
                return Ok(len);
            }

            // RX timeout
            let now = self.tick.now_us();
            let consecutive = health.record_error(false, now);
            self.context_mut(dev).record(true, now);
            let sample = Sample {
                link_up: nic.link_up(),
                timed_out: Some(OpKind::Rx),
                self_test_ok: nic.self_test(),
                critical: false,
            };
            let health_config = self.config.health;
            let kind = classify(self.context_mut(dev), &health_config, &sample)
                .unwrap_or(FailureKind::RxTimeout);
            self.run_recovery(nic, dev, kind, consecutive)?;

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(Error::Timeout);
            }
        }
    }

    fn receive_once(&self, nic: &mut dyn DmaNicOps, dev: DeviceId, buf: &mut [u8]) -> Result<usize> {
        let health = self.registry.health(dev)?;
        let use_pio = self.policy.get() == DmaPolicy::Forbid
            || buf.len() <= health.rx_copybreak() as usize;
        if use_pio {
            return nic.recv_pio(buf)?.ok_or(Error::Timeout);
        }

        let handle = match self.mapper.map_rx(VirtRegion::from_mut_slice(buf), dev) {
            Ok(h) => h,
            Err(Error::DmaForbidden) => return nic.recv_pio(buf)?.ok_or(Error::Timeout),
            Err(e) => return Err(e),
        };
        let info = self.mapper.info(handle)?;
        let len = match nic.start_rx_dma(&info.segments) {
            Ok(len) => len,
            Err(e) => {
                let _ = self.mapper.unmap(handle);
                return Err(e);
            }
        };
        // Copy-out for bounced receives happens inside unmap
        self.mapper.unmap(handle)?;
        Ok(len)
    }

    // ── Recovery orchestration ──────────────────────────────────────────

    /// Run the chosen strategy. Local strategies either succeed (caller
    /// may retry once) or surface `HardwareFailure`; fleet strategies
    /// always surface after acting.
    fn run_recovery(
        &mut self,
        nic: &mut dyn DmaNicOps,
        dev: DeviceId,
        kind: FailureKind,
        consecutive: u32,
    ) -> Result<()> {
        let strategy = strategy_for(kind, consecutive, &self.config.health);
        info!(
            "[ENGINE] dev {} failure {:?} (x{}) -> {:?}",
            dev.index(),
            kind,
            consecutive,
            strategy
        );
        match strategy {
            Strategy::Failover => {
                self.failover(dev);
                Err(Error::HardwareFailure)
            }
            Strategy::Disable => {
                if let Ok(h) = self.registry.health(dev) {
                    h.disable();
                }
                warn!("[ENGINE] dev {} disabled", dev.index());
                Err(Error::HardwareFailure)
            }
            local => {
                self.context_mut(dev).recovering = true;
                let recovered = execute(nic, self.tick, local, &self.config.recovery);
                self.context_mut(dev).recovering = false;
                if recovered.is_err() {
                    // Recovery itself failed: escalate immediately
                    self.failover(dev);
                    return Err(Error::HardwareFailure);
                }
                Ok(())
            }
        }
    }

    /// Mark `failed` errored-out and pick a healthy peer for traffic.
    fn failover(&mut self, failed: DeviceId) {
        let to = self.select_failover(failed);
        if let Ok(h) = self.registry.health(failed) {
            h.disable();
        }
        match to {
            Some(peer) => info!("[ENGINE] failover dev {} -> dev {}", failed.index(), peer.index()),
            None => error!("[ENGINE] dev {} failed and no healthy peer exists", failed.index()),
        }
        self.last_failover = Some(FailoverEvent { from: failed, to });
    }

    /// A healthy peer: registered, enabled, link up, no error streak.
    pub fn select_failover(&self, failed: DeviceId) -> Option<DeviceId> {
        self.registry.ids().find(|&id| {
            id != failed
                && self
                    .registry
                    .health(id)
                    .map(|h| {
                        !h.is_disabled()
                            && h.link_up.load(core::sync::atomic::Ordering::Relaxed)
                            && h.consecutive_errors.load(core::sync::atomic::Ordering::Relaxed) == 0
                    })
                    .unwrap_or(false)
        })
    }

    /// Are any devices still usable?
    pub fn any_device_usable(&self) -> bool {
        self.registry
            .ids()
            .any(|id| self.registry.health(id).map(|h| !h.is_disabled()).unwrap_or(false))
    }

    // ── Periodic work ───────────────────────────────────────────────────

    /// Idle/timer tick: structural validation over mappings and slots.
    pub fn on_tick(&mut self) -> SweepReport {
        run_sweep(self.mapper, self.pool, self.policy)
    }

    fn context_mut(&mut self, dev: DeviceId) -> &mut ErrorContext {
        self.contexts[dev.index()].get_or_insert_with(|| ErrorContext::new(dev))
    }
}
