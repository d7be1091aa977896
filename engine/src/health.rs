//! Failure detection.
//!
//! Every send/receive samples the device afterwards; the periodic tick
//! samples it at rest. A sample plus the device's rolling history
//! classifies into one failure kind at most; the most urgent wins.

use etherlink_dma::DeviceId;

// ═══════════════════════════════════════════════════════════════════════════
// TAXONOMY
// ═══════════════════════════════════════════════════════════════════════════

/// What went wrong, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    LinkLost,
    TxTimeout,
    RxTimeout,
    /// Errored fraction of recent operations above threshold.
    ErrorRate,
    /// Error density per unit time above threshold.
    InterruptStorm,
    /// Self-test disagreement.
    RegisterCorruption,
    /// Thermal / power / memory. Fatal; no local recovery.
    Critical,
}

/// Which operation a timeout occurred on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Tx,
    Rx,
}

/// One post-operation observation of the device.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub link_up: bool,
    pub timed_out: Option<OpKind>,
    pub self_test_ok: bool,
    pub critical: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════

/// Rolling window length for the error-rate detector.
pub const ERROR_WINDOW: usize = 32;

/// Detection thresholds.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// TX completion deadline.
    pub tx_timeout_us: u64,
    /// RX ready deadline.
    pub rx_timeout_us: u64,
    /// Errored percentage of the window that trips `ErrorRate`.
    pub error_rate_pct: u8,
    /// Minimum samples before the rate detector speaks.
    pub error_rate_min_samples: u8,
    /// Errors within one second that trip `InterruptStorm`.
    pub storm_errors_per_sec: u32,
    /// Consecutive errors before failover is attempted.
    pub max_consecutive_errors: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tx_timeout_us: 1_000_000,
            rx_timeout_us: 2_000_000,
            error_rate_pct: 25,
            error_rate_min_samples: 8,
            storm_errors_per_sec: 50,
            max_consecutive_errors: 5,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PER-DEVICE CONTEXT
// ═══════════════════════════════════════════════════════════════════════════

/// Rolling error history for one device. Main-path only.
#[derive(Debug)]
pub struct ErrorContext {
    pub dev: DeviceId,
    window: [bool; ERROR_WINDOW],
    cursor: usize,
    filled: usize,
    /// Errors inside the current one-second bucket.
    storm_count: u32,
    storm_bucket_start_us: u64,
    /// Set while a recovery is executing, to keep detection re-entrant.
    pub recovering: bool,
}

impl ErrorContext {
    pub fn new(dev: DeviceId) -> Self {
        Self {
            dev,
            window: [false; ERROR_WINDOW],
            cursor: 0,
            filled: 0,
            storm_count: 0,
            storm_bucket_start_us: 0,
            recovering: false,
        }
    }

    /// Record one operation outcome.
    pub fn record(&mut self, errored: bool, now_us: u64) {
        self.window[self.cursor] = errored;
        self.cursor = (self.cursor + 1) % ERROR_WINDOW;
        self.filled = (self.filled + 1).min(ERROR_WINDOW);

        if now_us.saturating_sub(self.storm_bucket_start_us) >= 1_000_000 {
            self.storm_bucket_start_us = now_us;
            self.storm_count = 0;
        }
        if errored {
            self.storm_count += 1;
        }
    }

    pub fn samples(&self) -> usize {
        self.filled
    }

    pub fn error_rate_pct(&self) -> u8 {
        if self.filled == 0 {
            return 0;
        }
        let errors = self.window[..self.filled].iter().filter(|&&e| e).count();
        (errors * 100 / self.filled) as u8
    }

    pub fn storm_rate(&self) -> u32 {
        self.storm_count
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CLASSIFICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Classify one sample against the device's history.
///
/// Most-urgent-first: a critical condition outranks everything, register
/// corruption outranks timeouts, and the statistical detectors speak only
/// when nothing acute fired.
pub fn classify(ctx: &ErrorContext, config: &HealthConfig, sample: &Sample) -> Option<FailureKind> {
    if sample.critical {
        return Some(FailureKind::Critical);
    }
    if !sample.self_test_ok {
        return Some(FailureKind::RegisterCorruption);
    }
    if !sample.link_up {
        return Some(FailureKind::LinkLost);
    }
    match sample.timed_out {
        Some(OpKind::Tx) => return Some(FailureKind::TxTimeout),
        Some(OpKind::Rx) => return Some(FailureKind::RxTimeout),
        None => {}
    }
    if ctx.storm_rate() > config.storm_errors_per_sec {
        return Some(FailureKind::InterruptStorm);
    }
    if ctx.samples() >= config.error_rate_min_samples as usize
        && ctx.error_rate_pct() >= config.error_rate_pct
    {
        return Some(FailureKind::ErrorRate);
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
