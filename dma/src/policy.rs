//! DMA policy and cache tier selection state.
//!
//! The policy is monotonic: the platform probe sets it once, the
//! capability tester refines it once, and every later influence (integrity
//! sweeps, recovery) may only tighten it. Nothing in the driver can widen
//! DMA capability at runtime.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use etherlink_platform::{CpuClass, PlatformReport};
use log::{info, warn};

// ═══════════════════════════════════════════════════════════════════════════
// POLICY
// ═══════════════════════════════════════════════════════════════════════════

/// Global DMA strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPolicy {
    /// Everything may be attempted; the mapper decides per request.
    Auto,
    /// Direct mapping is proven safe.
    Direct,
    /// Only bounce-buffer transfers are safe.
    BounceOnly,
    /// No DMA at all; PIO only.
    Forbid,
}

impl DmaPolicy {
    /// Strictness rank; higher forbids more.
    const fn rank(self) -> u8 {
        match self {
            DmaPolicy::Auto => 0,
            DmaPolicy::Direct => 1,
            DmaPolicy::BounceOnly => 2,
            DmaPolicy::Forbid => 3,
        }
    }

    const fn from_rank(rank: u8) -> Self {
        match rank {
            0 => DmaPolicy::Auto,
            1 => DmaPolicy::Direct,
            2 => DmaPolicy::BounceOnly,
            _ => DmaPolicy::Forbid,
        }
    }
}

/// Cache synchronization tier, chosen once from probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Per-line flush (CLFLUSH).
    Clflush,
    /// Whole-cache write-back-and-invalidate (WBINVD), opt-in.
    Wbinvd,
    /// Software touch-based emulation for older parts.
    Software,
    /// No cache, disabled cache, or coherent device: nothing to do.
    None,
}

// ═══════════════════════════════════════════════════════════════════════════
// POLICY CELL
// ═══════════════════════════════════════════════════════════════════════════

/// Interior-mutable policy holder.
///
/// A single byte read by the mapper on every request and written from two
/// places only: the one-shot refinement and tighten-on-failure paths.
pub struct PolicyCell {
    value: AtomicU8,
    refined: AtomicBool,
}

impl PolicyCell {
    pub const fn new(initial: DmaPolicy) -> Self {
        Self {
            value: AtomicU8::new(initial.rank()),
            refined: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> DmaPolicy {
        DmaPolicy::from_rank(self.value.load(Ordering::Acquire))
    }

    /// Keep-or-tighten. Returns the effective policy.
    pub fn tighten(&self, new: DmaPolicy) -> DmaPolicy {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let effective = current.max(new.rank());
            match self.value.compare_exchange_weak(
                current,
                effective,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if effective != current {
                        warn!(
                            "[POLICY] tightened to {:?}",
                            DmaPolicy::from_rank(effective)
                        );
                    }
                    return DmaPolicy::from_rank(effective);
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// One-shot refinement by the capability tester.
    ///
    /// Still tighten-only; a second refinement attempt is ignored.
    pub fn refine(&self, new: DmaPolicy) -> DmaPolicy {
        if self.refined.swap(true, Ordering::AcqRel) {
            warn!("[POLICY] duplicate refinement ignored");
            return self.get();
        }
        let effective = self.tighten(new);
        info!("[POLICY] refined: {:?}", effective);
        effective
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INITIAL POLICY
// ═══════════════════════════════════════════════════════════════════════════

/// Derive the startup policy from the inspection report.
///
/// - 286-class: no cache management, no reliable masking of the quirks
///   this core depends on; DMA is off the table.
/// - V86 without VDS: segmented addresses no longer mean anything
///   physically, so only pre-translated bounce buffers are safe.
pub fn initial_policy(report: &PlatformReport) -> DmaPolicy {
    if report.cpu.class == CpuClass::Cpu286 {
        return DmaPolicy::Forbid;
    }
    if report.cpu.v86_active && !report.vds_present {
        return DmaPolicy::BounceOnly;
    }
    DmaPolicy::Auto
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use etherlink_platform::{CpuInfo, PlatformReport};

    fn report(class: CpuClass, v86: bool, vds: bool) -> PlatformReport {
        let mut cpu = CpuInfo::conservative();
        cpu.class = class;
        cpu.v86_active = v86;
        PlatformReport { cpu, pci: None, chipset: None, vds_present: vds }
    }

    #[test]
    fn test_initial_policy_table() {
        assert_eq!(initial_policy(&report(CpuClass::Cpu286, false, false)), DmaPolicy::Forbid);
        assert_eq!(initial_policy(&report(CpuClass::Cpu486, true, false)), DmaPolicy::BounceOnly);
        assert_eq!(initial_policy(&report(CpuClass::Cpu486, true, true)), DmaPolicy::Auto);
        assert_eq!(initial_policy(&report(CpuClass::Cpu586Plus, false, false)), DmaPolicy::Auto);
    }

    #[test]
    fn test_tighten_is_monotonic() {
        let cell = PolicyCell::new(DmaPolicy::Auto);
        assert_eq!(cell.tighten(DmaPolicy::BounceOnly), DmaPolicy::BounceOnly);
        // An attempt to loosen keeps the stricter value
        assert_eq!(cell.tighten(DmaPolicy::Direct), DmaPolicy::BounceOnly);
        assert_eq!(cell.get(), DmaPolicy::BounceOnly);
        assert_eq!(cell.tighten(DmaPolicy::Forbid), DmaPolicy::Forbid);
    }

    #[test]
    fn test_refine_is_one_shot() {
        let cell = PolicyCell::new(DmaPolicy::Auto);
        assert_eq!(cell.refine(DmaPolicy::Direct), DmaPolicy::Direct);
        // Second refinement ignored even though it would tighten
        assert_eq!(cell.refine(DmaPolicy::Forbid), DmaPolicy::Direct);
    }
}
