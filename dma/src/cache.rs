//! Cache-management tier.
//!
//! Direction-aware synchronization around every transfer whose device is
//! not hardware-coherent. Four tiers, picked once from the probe report:
//!
//! - **T1 Clflush**: per-line flush, cheap and targeted.
//! - **T2 Wbinvd**: whole-cache write-back-and-invalidate. Brutal, so
//!   only with explicit opt-in, and post-DMA invalidates may be coalesced.
//! - **T3 Software**: touch-read emulation for parts without either
//!   instruction.
//! - **T4 None**: cache disabled; nothing to do.
//!
//! Inline flush/fence assembly exists only inside this module's `hw`
//! block; everything else speaks `sync_for_device` / `sync_for_cpu`.

use core::sync::atomic::{AtomicU32, Ordering};

use etherlink_platform::{CpuFeatures, IrqCell, PlatformReport, TickSource};
use log::info;

use crate::addr::{DmaDirection, VirtRegion};
use crate::policy::CacheTier;

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════════════════

/// Tier-selection and coalescing knobs.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Permit the whole-cache tier. Off by default: WBINVD stalls the
    /// machine for tens of microseconds every transfer.
    pub allow_wbinvd: bool,
    /// Coalesce up to this many post-DMA invalidates...
    pub coalesce_threshold: u8,
    /// ...or until the oldest deferred one reaches this age.
    pub coalesce_max_age_us: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            allow_wbinvd: false,
            coalesce_threshold: 4,
            coalesce_max_age_us: 1_000,
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub line_flushes: u32,
    pub wide_flushes: u32,
    pub deferred: u32,
    pub forced: u32,
    pub touches: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════════════════

struct Deferred {
    pending: u8,
    oldest_us: u64,
}

/// The tier selector plus sync entry points.
pub struct CacheManager<'t> {
    tier: CacheTier,
    line_size: u32,
    config: CacheConfig,
    tick: &'t dyn TickSource,
    // Deferred state is main-path only; the cell keeps the idle-tick
    // sweep honest when it reads alongside.
    deferred: IrqCell<Deferred>,
    line_flushes: AtomicU32,
    wide_flushes: AtomicU32,
    deferred_count: AtomicU32,
    forced: AtomicU32,
    touches: AtomicU32,
}

impl<'t> CacheManager<'t> {
    /// Pick the tier the probe report supports.
    pub fn select(report: &PlatformReport, config: CacheConfig, tick: &'t dyn TickSource) -> Self {
        let tier = if report.cpu.cache_mode == etherlink_platform::CacheMode::Disabled {
            CacheTier::None
        } else if report.cpu.features.contains(CpuFeatures::CLFLUSH) {
            CacheTier::Clflush
        } else if report.cpu.features.contains(CpuFeatures::WBINVD) && config.allow_wbinvd {
            CacheTier::Wbinvd
        } else {
            CacheTier::Software
        };
        info!("[CACHE] tier {:?}, line {}", tier, report.cpu.cache_line_size);
        Self {
            tier,
            line_size: report.cpu.cache_line_size.max(16) as u32,
            config,
            tick,
            deferred: IrqCell::new(Deferred { pending: 0, oldest_us: 0 }),
            line_flushes: AtomicU32::new(0),
            wide_flushes: AtomicU32::new(0),
            deferred_count: AtomicU32::new(0),
            forced: AtomicU32::new(0),
            touches: AtomicU32::new(0),
        }
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    /// Make all prior CPU writes to `region` visible to the device.
    ///
    /// Required before device-start for `ToDevice` / `Bidirectional`.
    /// Any deferred invalidates are forced first: nothing stale may be
    /// in flight when the device starts reading.
    pub fn sync_for_device(&self, region: VirtRegion, dir: DmaDirection) {
        if !dir.to_device() {
            return;
        }
        match self.tier {
            CacheTier::None => {}
            CacheTier::Clflush => self.flush_lines(region),
            CacheTier::Wbinvd => {
                self.force();
                hw::wbinvd();
                self.wide_flushes.fetch_add(1, Ordering::Relaxed);
            }
            CacheTier::Software => self.touch_lines(region),
        }
        hw::fence();
    }

    /// Discard stale cache lines over `region` before the CPU reads what
    /// the device wrote. Required after device-complete for `FromDevice`
    /// / `Bidirectional`.
    pub fn sync_for_cpu(&self, region: VirtRegion, dir: DmaDirection) {
        if !dir.from_device() {
            return;
        }
        match self.tier {
            CacheTier::None => {}
            CacheTier::Clflush => self.flush_lines(region),
            CacheTier::Wbinvd => self.defer_wide_flush(),
            CacheTier::Software => self.touch_lines(region),
        }
        hw::fence();
    }

    /// Flush anything deferred, now. Called before every device-visible
    /// write and available to callers at quiescent points.
    pub fn force(&self) {
        let claimed = self.deferred.with(|d| {
            let pending = d.pending > 0;
            d.pending = 0;
            pending
        });
        // WBINVD stalls the machine; run it with interrupts back on,
        // the pending count is already claimed
        if claimed {
            hw::wbinvd();
            self.wide_flushes.fetch_add(1, Ordering::Relaxed);
            self.forced.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn defer_wide_flush(&self) {
        let now = self.tick.now_us();
        let due = self.deferred.with(|d| {
            if d.pending == 0 {
                d.oldest_us = now;
            }
            d.pending += 1;
            let due = d.pending >= self.config.coalesce_threshold
                || now.saturating_sub(d.oldest_us) >= self.config.coalesce_max_age_us;
            if due {
                d.pending = 0;
            }
            due
        });
        self.deferred_count.fetch_add(1, Ordering::Relaxed);
        if due {
            hw::wbinvd();
            self.wide_flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush_lines(&self, region: VirtRegion) {
        let start = region.addr() & !(self.line_size as usize - 1);
        let end = region.addr() + region.len();
        let mut line = start;
        let mut count = 0u32;
        while line < end {
            hw::clflush(line as *const u8);
            line += self.line_size as usize;
            count += 1;
        }
        self.line_flushes.fetch_add(count, Ordering::Relaxed);
    }

    /// Touch-read one byte per line. On parts with neither CLFLUSH nor a
    /// usable WBINVD this is the only lever: the read traffic displaces
    /// the stale lines.
    fn touch_lines(&self, region: VirtRegion) {
        let end = region.addr() + region.len();
        let mut line = region.addr();
        while line < end {
            unsafe {
                core::ptr::read_volatile(line as *const u8);
            }
            line += self.line_size as usize;
        }
        self.touches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            line_flushes: self.line_flushes.load(Ordering::Relaxed),
            wide_flushes: self.wide_flushes.load(Ordering::Relaxed),
            deferred: self.deferred_count.load(Ordering::Relaxed),
            forced: self.forced.load(Ordering::Relaxed),
            touches: self.touches.load(Ordering::Relaxed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PRIMITIVES
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    #[inline]
    pub fn clflush(line: *const u8) {
        unsafe {
            core::arch::asm!("clflush [{}]", in(reg) line, options(nostack, preserves_flags));
        }
    }

    #[inline]
    pub fn wbinvd() {
        unsafe {
            core::arch::asm!("wbinvd", options(nomem, nostack, preserves_flags));
        }
    }

    #[inline]
    pub fn fence() {
        unsafe {
            core::arch::asm!("mfence", options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hw {
    /// Hosted stubs; the manager's counters still record intent.
    #[inline]
    pub fn clflush(_line: *const u8) {}

    #[inline]
    pub fn wbinvd() {}

    #[inline]
    pub fn fence() {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use etherlink_platform::{CpuInfo, ManualTicker, PlatformReport};

    fn report_with(features: CpuFeatures, mode: etherlink_platform::CacheMode) -> PlatformReport {
        let mut cpu = CpuInfo::conservative();
        cpu.features = features;
        cpu.cache_mode = mode;
        PlatformReport { cpu, pci: None, chipset: None, vds_present: false }
    }

    #[test]
    fn test_tier_ladder() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::CLFLUSH | CpuFeatures::WBINVD, etherlink_platform::CacheMode::WriteBack),
            CacheConfig::default(),
            &tick,
        );
        assert_eq!(m.tier(), CacheTier::Clflush);

        let m = CacheManager::select(
            &report_with(CpuFeatures::WBINVD, etherlink_platform::CacheMode::WriteBack),
            CacheConfig { allow_wbinvd: true, ..CacheConfig::default() },
            &tick,
        );
        assert_eq!(m.tier(), CacheTier::Wbinvd);

        // WBINVD present but not opted in: software emulation
        let m = CacheManager::select(
            &report_with(CpuFeatures::WBINVD, etherlink_platform::CacheMode::WriteBack),
            CacheConfig::default(),
            &tick,
        );
        assert_eq!(m.tier(), CacheTier::Software);

        let m = CacheManager::select(
            &report_with(CpuFeatures::empty(), etherlink_platform::CacheMode::Disabled),
            CacheConfig::default(),
            &tick,
        );
        assert_eq!(m.tier(), CacheTier::None);
    }

    #[test]
    fn test_clflush_counts_lines() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::CLFLUSH, etherlink_platform::CacheMode::WriteBack),
            CacheConfig::default(),
            &tick,
        );
        let buf = [0u8; 256];
        m.sync_for_device(VirtRegion::from_slice(&buf), DmaDirection::ToDevice);
        // 256 bytes over 32-byte lines, possibly one extra for misalignment
        let flushes = m.stats().line_flushes;
        assert!((8..=9).contains(&flushes), "{} line flushes", flushes);
    }

    #[test]
    fn test_direction_gating() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::CLFLUSH, etherlink_platform::CacheMode::WriteBack),
            CacheConfig::default(),
            &tick,
        );
        let buf = [0u8; 64];
        // Receive buffer needs nothing before the device writes it
        m.sync_for_device(VirtRegion::from_slice(&buf), DmaDirection::FromDevice);
        // Transmit buffer needs nothing after completion
        m.sync_for_cpu(VirtRegion::from_slice(&buf), DmaDirection::ToDevice);
        assert_eq!(m.stats().line_flushes, 0);
    }

    #[test]
    fn test_wbinvd_coalescing_by_count() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::WBINVD, etherlink_platform::CacheMode::WriteBack),
            CacheConfig { allow_wbinvd: true, coalesce_threshold: 3, coalesce_max_age_us: u64::MAX / 2, ..CacheConfig::default() },
            &tick,
        );
        let buf = [0u8; 64];
        let region = VirtRegion::from_slice(&buf);
        m.sync_for_cpu(region, DmaDirection::FromDevice);
        m.sync_for_cpu(region, DmaDirection::FromDevice);
        assert_eq!(m.stats().wide_flushes, 0);
        m.sync_for_cpu(region, DmaDirection::FromDevice);
        assert_eq!(m.stats().wide_flushes, 1);
        assert_eq!(m.stats().deferred, 3);
    }

    #[test]
    fn test_wbinvd_coalescing_by_age() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::WBINVD, etherlink_platform::CacheMode::WriteBack),
            CacheConfig { allow_wbinvd: true, coalesce_threshold: 100, coalesce_max_age_us: 500, ..CacheConfig::default() },
            &tick,
        );
        let buf = [0u8; 64];
        let region = VirtRegion::from_slice(&buf);
        m.sync_for_cpu(region, DmaDirection::FromDevice);
        tick.advance(600);
        m.sync_for_cpu(region, DmaDirection::FromDevice);
        assert_eq!(m.stats().wide_flushes, 1);
    }

    #[test]
    fn test_deferred_flush_forced_before_device_write() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::WBINVD, etherlink_platform::CacheMode::WriteBack),
            CacheConfig { allow_wbinvd: true, coalesce_threshold: 100, coalesce_max_age_us: u64::MAX / 2, ..CacheConfig::default() },
            &tick,
        );
        let buf = [0u8; 64];
        let region = VirtRegion::from_slice(&buf);
        m.sync_for_cpu(region, DmaDirection::FromDevice);
        assert_eq!(m.stats().wide_flushes, 0);
        // The next transmit must not start with invalidates pending
        m.sync_for_device(region, DmaDirection::ToDevice);
        assert_eq!(m.stats().forced, 1);
        assert!(m.stats().wide_flushes >= 1);
    }

    #[test]
    fn test_software_tier_touches() {
        let tick = ManualTicker::new();
        let m = CacheManager::select(
            &report_with(CpuFeatures::empty(), etherlink_platform::CacheMode::Unknown),
            CacheConfig::default(),
            &tick,
        );
        assert_eq!(m.tier(), CacheTier::Software);
        let buf = [0u8; 128];
        m.sync_for_cpu(VirtRegion::from_slice(&buf), DmaDirection::FromDevice);
        assert_eq!(m.stats().touches, 1);
    }
}
