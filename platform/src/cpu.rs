//! CPU identification and cache-behaviour probe.
//!
//! One-shot detection of everything knowable about the processor without
//! destructive testing: family class, the cache-management instructions it
//! advertises, the cache operating mode, and whether we are running inside
//! a virtual-8086 monitor.
//!
//! # Failure rule
//!
//! Any probe step that cannot complete leaves the corresponding field at
//! `Unknown` (or the feature absent). Probing never widens capability.

use bitflags::bitflags;

// ═══════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════

/// Processor family class, as far as the DMA core cares.
///
/// Everything newer than a Pentium behaves like `Cpu586Plus` here; the
/// distinctions that matter are "no cache management at all" (286), "no
/// WBINVD" (386) and "has CPUID/feature bits" (586+).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuClass {
    Cpu286,
    Cpu386,
    Cpu486,
    Cpu586Plus,
}

/// Cache operating mode, from CR0.CD/NW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Probe could not read CR0 (or ran unprivileged).
    Unknown,
    /// Cache enabled, write-through (CD=0, NW=0 on 486).
    WriteThrough,
    /// Cache enabled, write-back.
    WriteBack,
    /// Cache disabled (CD=1).
    Disabled,
}

bitflags! {
    /// Instruction-level capabilities relevant to DMA cache management.
    pub struct CpuFeatures: u32 {
        /// CPUID instruction available (EFLAGS.ID toggles).
        const CPUID   = 1 << 0;
        /// Per-line cache flush (CLFLUSH).
        const CLFLUSH = 1 << 1;
        /// Memory fences (SFENCE/LFENCE/MFENCE).
        const FENCES  = 1 << 2;
        /// Whole-cache write-back-and-invalidate (WBINVD, 486+).
        const WBINVD  = 1 << 3;
        /// Time-stamp counter.
        const TSC     = 1 << 4;
    }
}

/// Everything the CPU probe learned.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub class: CpuClass,
    pub features: CpuFeatures,
    /// Cache line size in bytes. 32 is assumed when CPUID does not say.
    pub cache_line_size: u16,
    pub cache_mode: CacheMode,
    /// True when executing under a virtual-8086 monitor.
    pub v86_active: bool,
}

impl CpuInfo {
    /// Conservative report: oldest class, no features, nothing known.
    ///
    /// This is what hosted builds and failed probes return; every consumer
    /// must treat it as "assume the worst".
    pub const fn conservative() -> Self {
        Self {
            class: CpuClass::Cpu286,
            features: CpuFeatures::empty(),
            cache_line_size: 32,
            cache_mode: CacheMode::Unknown,
            v86_active: false,
        }
    }

    /// Detect the running processor.
    ///
    /// On hardware builds this runs the EFLAGS toggle tests, CPUID when
    /// available, and reads CR0. Elsewhere it returns
    /// [`CpuInfo::conservative`].
    pub fn detect() -> Self {
        hw::detect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HARDWARE PROBE
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    use super::{CacheMode, CpuClass, CpuFeatures, CpuInfo};

    const EFLAGS_AC: usize = 1 << 18;
    const EFLAGS_ID: usize = 1 << 21;
    const CR0_CD: usize = 1 << 30;
    const CR0_NW: usize = 1 << 29;

    const CPUID_EDX_TSC: u32 = 1 << 4;
    const CPUID_EDX_CLFSH: u32 = 1 << 19;
    const CPUID_EDX_SSE2: u32 = 1 << 26;

    #[inline]
    fn read_eflags() -> usize {
        let flags: usize;
        unsafe {
            core::arch::asm!("pushf", "pop {}", out(reg) flags, options(nomem));
        }
        flags
    }

    #[inline]
    fn write_eflags(flags: usize) {
        unsafe {
            core::arch::asm!("push {}", "popf", in(reg) flags, options(nomem));
        }
    }

    /// Try to toggle an EFLAGS bit; returns true if the bit sticks.
    fn eflags_bit_toggles(bit: usize) -> bool {
        let original = read_eflags();
        write_eflags(original ^ bit);
        let toggled = read_eflags() & bit != original & bit;
        write_eflags(original);
        toggled
    }

    fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
        let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
        unsafe {
            core::arch::asm!(
                "push rbx",
                "cpuid",
                "mov {ebx_out:e}, ebx",
                "pop rbx",
                ebx_out = out(reg) ebx,
                inout("eax") leaf => eax,
                out("ecx") ecx,
                out("edx") edx,
            );
        }
        (eax, ebx, ecx, edx)
    }

    fn read_cr0() -> usize {
        let cr0: usize;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack));
        }
        cr0
    }

    pub fn detect() -> CpuInfo {
        let mut info = CpuInfo::conservative();

        // 286 cannot set AC; 386 can set AC but not ID; 486 sets AC.
        if !eflags_bit_toggles(EFLAGS_AC) {
            info.class = CpuClass::Cpu286;
            return info;
        }
        info.class = CpuClass::Cpu486;
        info.features |= CpuFeatures::WBINVD;

        if eflags_bit_toggles(EFLAGS_ID) {
            info.features |= CpuFeatures::CPUID;
            let (_, ebx, _, edx) = cpuid(1);
            info.class = CpuClass::Cpu586Plus;
            if edx & CPUID_EDX_TSC != 0 {
                info.features |= CpuFeatures::TSC;
            }
            if edx & CPUID_EDX_CLFSH != 0 {
                info.features |= CpuFeatures::CLFLUSH;
                info.cache_line_size = (((ebx >> 8) & 0xFF) * 8) as u16;
            }
            if edx & CPUID_EDX_SSE2 != 0 {
                info.features |= CpuFeatures::FENCES;
            }
        }

        let cr0 = read_cr0();
        info.cache_mode = if cr0 & CR0_CD != 0 {
            CacheMode::Disabled
        } else if cr0 & CR0_NW != 0 {
            CacheMode::WriteBack
        } else {
            CacheMode::WriteThrough
        };

        info
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hw {
    use super::CpuInfo;

    /// Hosted stub: nothing is knowable, assume the worst.
    pub fn detect() -> CpuInfo {
        CpuInfo::conservative()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
