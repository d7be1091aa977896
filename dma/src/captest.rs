//! Active DMA capability testing.
//!
//! The platform probe infers; this module verifies by experiment, using a
//! NIC in internal loopback. Eight tests run in a fixed order, each with
//! an individually-logged outcome, and the results refine the global
//! policy (tighten-only) and pick the copybreak threshold below which PIO
//! beats DMA.
//!
//! The coherency verdict is computed from observed bytes alone; whether
//! the probe mapping happened to bounce is recorded separately, so the
//! two signals are never conflated.

use etherlink_platform::{busy_wait, PlatformReport, TickSource};
use heapless::Vec;
use log::{info, warn};

use crate::addr::{DmaDirection, VirtRegion};
use crate::cache::CacheManager;
use crate::caps::{DeviceId, DeviceRegistry};
use crate::error::Result;
use crate::mapper::DmaMapper;
use crate::nic::DmaNicOps;
use crate::policy::{CacheTier, DmaPolicy, PolicyCell};
use crate::vds::BusMemory;

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG & REPORT
// ═══════════════════════════════════════════════════════════════════════════

/// Test vectors and measurement knobs.
#[derive(Debug, Clone, Copy)]
pub struct CapabilityConfig {
    /// Frame sizes for the copybreak benchmark.
    pub copybreak_sizes: &'static [usize],
    /// Offsets for the alignment scan.
    pub alignments: &'static [u16],
    /// Round-trips averaged per measurement point.
    pub iterations: u32,
    /// Bound on every completion wait.
    pub completion_timeout_us: u64,
    /// Cache-flush penalty added per KiB to DMA measurements when a
    /// non-trivial cache tier is active.
    pub cache_penalty_us_per_kib: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            copybreak_sizes: &[64, 128, 256, 512, 1024, 1514],
            alignments: &[1, 2, 4, 8, 16, 32, 64],
            iterations: 4,
            completion_timeout_us: 100_000,
            cache_penalty_us_per_kib: 40,
        }
    }
}

/// One test's verdict.
#[derive(Debug, Clone, Copy)]
pub struct TestOutcome {
    pub name: &'static str,
    pub passed: bool,
    pub detail: &'static str,
}

/// Everything the tester learned.
#[derive(Debug, Clone)]
pub struct CapabilityReport {
    /// Refined policy (already applied to the cell, tighten-only).
    pub policy: DmaPolicy,
    pub coherent: bool,
    pub snoops: bool,
    /// Direct transfers across a 64 KB boundary worked.
    pub crosses_64k: bool,
    pub optimal_alignment: u16,
    /// Frame size below which PIO wins.
    pub copybreak: u16,
    /// Percentage of tests passed.
    pub confidence_pct: u8,
    /// Measurements came from a coarse (BIOS tick) source; copybreak was
    /// clamped to the device default rather than trusted.
    pub coarse_timer: bool,
    pub outcomes: Vec<TestOutcome, 8>,
}

/// Everything the tester borrows from the assembled core.
pub struct CapabilityContext<'a> {
    pub mapper: &'a DmaMapper<'a>,
    pub registry: &'a DeviceRegistry,
    pub bus: &'a dyn BusMemory,
    pub cache: &'a CacheManager<'a>,
    pub tick: &'a dyn TickSource,
    pub policy: &'a PolicyCell,
    pub report: &'a PlatformReport,
    /// Device under test; capability results bind to this device and the
    /// global policy only tightens, so heterogeneous systems converge to
    /// the strictest tested outcome.
    pub dev: DeviceId,
    /// Mapped scratch, aligned to at least 64, at least 2 KB.
    pub aligned: VirtRegion,
    /// Mapped scratch whose physical image straddles a 64 KB boundary.
    pub straddle: VirtRegion,
}

// ═══════════════════════════════════════════════════════════════════════════
// ENTRY POINT
// ═══════════════════════════════════════════════════════════════════════════

/// Run the full battery on `nic` (placed into internal loopback).
pub fn run_capability_tests(
    nic: &mut dyn DmaNicOps,
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
) -> CapabilityReport {
    nic.set_loopback(true);
    let mut outcomes: Vec<TestOutcome, 8> = Vec::new();
    let push = |o: TestOutcome, outcomes: &mut Vec<TestOutcome, 8>| {
        info!("[CAPTEST] {}: {} ({})", o.name, if o.passed { "pass" } else { "FAIL" }, o.detail);
        let _ = outcomes.push(o);
    };

    // 1. Cache mode read-back (no transfer)
    let cache_mode_known = ctx.report.cpu.cache_mode != etherlink_platform::CacheMode::Unknown;
    push(
        TestOutcome {
            name: "cache-mode",
            passed: cache_mode_known,
            detail: if cache_mode_known { "control register read" } else { "mode unknown" },
        },
        &mut outcomes,
    );

    // 2. Coherency
    let (coherent, coherency_outcome) = test_coherency(ctx, 0);
    push(coherency_outcome, &mut outcomes);

    // 3. Bus snooping
    let (snoops, snoop_outcome) = test_snoop(ctx);
    push(snoop_outcome, &mut outcomes);

    // 4. 64 KB boundary transfer
    let (crosses_64k, boundary_broken, boundary_outcome) = test_boundary(nic, ctx, config);
    push(boundary_outcome, &mut outcomes);

    // 5. Alignment scan
    let (optimal_alignment, align_outcome) = test_alignment_scan(ctx, config);
    push(align_outcome, &mut outcomes);

    // 6. Burst / bus-master sanity
    let burst_ok = test_burst(nic, ctx, config);
    push(
        TestOutcome {
            name: "burst",
            passed: burst_ok,
            detail: if burst_ok { "full frame dma round trip" } else { "dma path broken" },
        },
        &mut outcomes,
    );

    // 7. Misaligned coherency
    let misalign_outcome = test_misaligned_coherency(ctx, coherent);
    push(misalign_outcome, &mut outcomes);

    // 8. Copybreak benchmark
    let (copybreak, copybreak_outcome) = test_copybreak(nic, ctx, config);
    push(copybreak_outcome, &mut outcomes);

    nic.set_loopback(false);

    // Policy refinement: any demonstrated transfer failure (the burst
    // sanity check, or a direct boundary transfer that broke) forces
    // bounce-only. A boundary the device merely cannot cross is not a
    // failure; the mapper splits at 64 KB instead. Cache sync covers
    // incoherent machines on the direct path.
    let refined = if !burst_ok || boundary_broken {
        DmaPolicy::BounceOnly
    } else {
        DmaPolicy::Direct
    };
    let policy = ctx.policy.refine(refined);

    let coarse_timer = ctx.tick.resolution_us() >= 1_000;
    let copybreak = if coarse_timer {
        // 55 ms granularity cannot resolve per-frame round trips
        warn!("[CAPTEST] coarse timer, keeping default copybreak");
        match ctx.registry.caps(ctx.dev) {
            Ok(caps) => caps.tx_copybreak,
            Err(_) => copybreak,
        }
    } else {
        copybreak
    };
    if let Ok(health) = ctx.registry.health(ctx.dev) {
        health.set_copybreak(copybreak, copybreak);
    }

    let passed = outcomes.iter().filter(|o| o.passed).count();
    let confidence_pct = (passed * 100 / outcomes.len()) as u8;
    info!(
        "[CAPTEST] policy {:?}, copybreak {}, confidence {}%",
        policy, copybreak, confidence_pct
    );

    CapabilityReport {
        policy,
        coherent,
        snoops,
        crosses_64k,
        optimal_alignment,
        copybreak,
        confidence_pct,
        coarse_timer,
        outcomes,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INDIVIDUAL TESTS
// ═══════════════════════════════════════════════════════════════════════════

const PATTERN_A: u8 = 0xA5;
const PATTERN_B: u8 = 0x3C;
const PATTERN_DMA: u8 = 0x77;

/// Write pattern A, map, overwrite with pattern B without any explicit
/// flush, then look at the bytes through the device's view of the
/// mapping. Coherent iff the device sees pattern B. A bounced probe is
/// inconclusive, never "incoherent".
fn test_coherency(ctx: &CapabilityContext<'_>, offset: usize) -> (bool, TestOutcome) {
    let probe = ctx.aligned.sub(offset, 64);
    unsafe { probe.bytes_mut() }.fill(PATTERN_A);

    let handle = match ctx.mapper.map(probe, ctx.dev, DmaDirection::Bidirectional) {
        Ok(h) => h,
        Err(_) => {
            return (false, TestOutcome { name: "coherency", passed: false, detail: "map failed" })
        }
    };
    let map_info = match ctx.mapper.info(handle) {
        Ok(i) => i,
        Err(_) => {
            let _ = ctx.mapper.unmap(handle);
            return (false, TestOutcome { name: "coherency", passed: false, detail: "no info" });
        }
    };

    if map_info.uses_bounce {
        let _ = ctx.mapper.unmap(handle);
        return (
            false,
            TestOutcome { name: "coherency", passed: false, detail: "bounced; inconclusive" },
        );
    }

    unsafe { probe.bytes_mut() }.fill(PATTERN_B);
    let mut device_view = [0u8; 64];
    let seg = map_info.segments.as_slice()[0];
    let read_ok = ctx.bus.read_phys(seg.phys, &mut device_view);
    let _ = ctx.mapper.unmap(handle);

    let coherent = read_ok && device_view.iter().all(|&b| b == PATTERN_B);
    (
        coherent,
        TestOutcome {
            name: "coherency",
            passed: coherent,
            detail: if coherent { "device saw unflushed write" } else { "stale data at device" },
        },
    )
}

/// Prime the cache by reading, overwrite through the bus path the way a
/// master would, then read back through the CPU. Snooping iff the fresh
/// value is observed.
fn test_snoop(ctx: &CapabilityContext<'_>) -> (bool, TestOutcome) {
    let probe = ctx.aligned.sub(64, 64);
    unsafe { probe.bytes_mut() }.fill(PATTERN_A);

    let handle = match ctx.mapper.map(probe, ctx.dev, DmaDirection::Bidirectional) {
        Ok(h) => h,
        Err(_) => return (false, TestOutcome { name: "snoop", passed: false, detail: "map failed" }),
    };
    let map_info = match ctx.mapper.info(handle) {
        Ok(i) => i,
        Err(_) => {
            let _ = ctx.mapper.unmap(handle);
            return (false, TestOutcome { name: "snoop", passed: false, detail: "no info" });
        }
    };
    if map_info.uses_bounce {
        let _ = ctx.mapper.unmap(handle);
        return (false, TestOutcome { name: "snoop", passed: false, detail: "bounced; inconclusive" });
    }

    // Prime: pull the line into the cache
    let mut sink = 0u8;
    for b in unsafe { probe.bytes() } {
        sink ^= *b;
    }
    core::hint::black_box(sink);

    let seg = map_info.segments.as_slice()[0];
    let fresh = [PATTERN_DMA; 64];
    let wrote = ctx.bus.write_phys(seg.phys, &fresh);
    let snoops = wrote && unsafe { probe.bytes() }.iter().all(|&b| b == PATTERN_DMA);
    let _ = ctx.mapper.unmap(handle);

    (
        snoops,
        TestOutcome {
            name: "snoop",
            passed: snoops,
            detail: if snoops { "cache followed master write" } else { "stale cache line" },
        },
    )
}

/// Map a buffer that physically straddles a 64 KB boundary and run one
/// DMA round trip across it.
///
/// Three distinct verdicts come out: the crossing worked (`crossed`),
/// the mapper fell back to a slot so nothing was proven (inconclusive),
/// or a direct transfer was attempted and broke (`broken`). Only the
/// last one condemns the DMA path.
fn test_boundary(
    nic: &mut dyn DmaNicOps,
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
) -> (bool, bool, TestOutcome) {
    let len = ctx.straddle.len().min(1500);
    let probe = ctx.straddle.sub(0, len);
    for (i, b) in unsafe { probe.bytes_mut() }.iter_mut().enumerate() {
        *b = i as u8;
    }

    let handle = match ctx.mapper.map_tx(probe, ctx.dev) {
        Ok(h) => h,
        Err(_) => {
            return (
                false,
                false,
                TestOutcome { name: "boundary-64k", passed: false, detail: "map failed" },
            )
        }
    };
    let map_info = match ctx.mapper.info(handle) {
        Ok(i) => i,
        Err(_) => {
            let _ = ctx.mapper.unmap(handle);
            return (
                false,
                false,
                TestOutcome { name: "boundary-64k", passed: false, detail: "no info" },
            );
        }
    };
    if map_info.uses_bounce {
        let _ = ctx.mapper.unmap(handle);
        return (
            false,
            false,
            TestOutcome { name: "boundary-64k", passed: false, detail: "bounce fallback" },
        );
    }

    let round_trip = dma_round_trip(nic, ctx, config, &map_info.segments);
    let _ = ctx.mapper.unmap(handle);
    let crossed = round_trip.is_ok()
        && unsafe { probe.bytes() }.iter().enumerate().all(|(i, &b)| b == i as u8);
    (
        crossed,
        !crossed,
        TestOutcome {
            name: "boundary-64k",
            passed: crossed,
            detail: if crossed { "direct transfer across boundary" } else { "transfer failed" },
        },
    )
}

/// Time one map/unmap at each offset; the cheapest offset is the optimal
/// alignment.
fn test_alignment_scan(
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
) -> (u16, TestOutcome) {
    let mut best_align = 1u16;
    let mut best_time = u64::MAX;
    let mut all_failed = true;
    for &align in config.alignments {
        let probe = ctx.aligned.sub(align as usize, 256);
        let start = ctx.tick.now_us();
        if let Ok(handle) = ctx.mapper.map_tx(probe, ctx.dev) {
            let _ = ctx.mapper.unmap(handle);
            all_failed = false;
        }
        let elapsed = ctx.tick.now_us().saturating_sub(start);
        if elapsed < best_time {
            best_time = elapsed;
            best_align = align;
        }
    }
    (
        best_align,
        TestOutcome {
            name: "alignment-scan",
            passed: !all_failed,
            detail: if all_failed { "no mapping succeeded" } else { "scan complete" },
        },
    )
}

/// One full-size frame through the DMA engine.
fn test_burst(
    nic: &mut dyn DmaNicOps,
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
) -> bool {
    let probe = ctx.aligned.sub(0, 1514);
    unsafe { probe.bytes_mut() }.fill(0xEE);
    let handle = match ctx.mapper.map_tx(probe, ctx.dev) {
        Ok(h) => h,
        Err(_) => return false,
    };
    let map_info = match ctx.mapper.info(handle) {
        Ok(i) => i,
        Err(_) => {
            let _ = ctx.mapper.unmap(handle);
            return false;
        }
    };
    let ok = dma_round_trip(nic, ctx, config, &map_info.segments).is_ok();
    let _ = ctx.mapper.unmap(handle);
    ok
}

/// Repeat the coherency probe at several offsets within a cache line;
/// partial-line bugs show up as disagreement with the aligned verdict.
fn test_misaligned_coherency(ctx: &CapabilityContext<'_>, aligned_verdict: bool) -> TestOutcome {
    let mut disagreements = 0u32;
    let mut direct_probes = 0u32;
    for &offset in &[2usize, 6, 14, 30] {
        let (verdict, outcome) = test_coherency(ctx, 128 + offset);
        // Bounced probes are inconclusive, not contradictions
        if outcome.detail == "bounced; inconclusive" {
            continue;
        }
        direct_probes += 1;
        if verdict != aligned_verdict {
            disagreements += 1;
        }
    }
    let passed = disagreements == 0;
    TestOutcome {
        name: "misaligned-coherency",
        passed,
        detail: if direct_probes == 0 {
            "all probes bounced"
        } else if passed {
            "consistent at all offsets"
        } else {
            "partial-line disagreement"
        },
    }
}

/// PIO vs DMA round-trip benchmark over the configured sizes. Threshold
/// is the midpoint between the first DMA-winning size and its
/// predecessor; a non-trivial cache tier adds a per-KiB penalty to every
/// DMA measurement first.
fn test_copybreak(
    nic: &mut dyn DmaNicOps,
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
) -> (u16, TestOutcome) {
    let penalize = ctx.cache.tier() != CacheTier::None;
    let mut dma_failed = false;
    let mut threshold: Option<usize> = None;
    let mut prev_size = 0usize;

    for &size in config.copybreak_sizes {
        let probe = ctx.aligned.sub(0, size);
        unsafe { probe.bytes_mut() }.fill(0xC3);

        // PIO round trip
        let pio_start = ctx.tick.now_us();
        for _ in 0..config.iterations {
            if pio_round_trip(nic, ctx, config, probe).is_err() {
                return (
                    1514,
                    TestOutcome { name: "copybreak", passed: false, detail: "pio path broken" },
                );
            }
        }
        let pio_us = (ctx.tick.now_us() - pio_start) / config.iterations as u64;

        // DMA round trip
        let dma_start = ctx.tick.now_us();
        for _ in 0..config.iterations {
            let handle = match ctx.mapper.map_tx(probe, ctx.dev) {
                Ok(h) => h,
                Err(_) => {
                    dma_failed = true;
                    break;
                }
            };
            let segs = match ctx.mapper.info(handle) {
                Ok(i) => i.segments,
                Err(_) => {
                    let _ = ctx.mapper.unmap(handle);
                    dma_failed = true;
                    break;
                }
            };
            if dma_round_trip(nic, ctx, config, &segs).is_err() {
                dma_failed = true;
            }
            let _ = ctx.mapper.unmap(handle);
            if dma_failed {
                break;
            }
        }
        if dma_failed {
            break;
        }
        let mut dma_us = (ctx.tick.now_us() - dma_start) / config.iterations as u64;
        if penalize {
            dma_us += config.cache_penalty_us_per_kib * size as u64 / 1024;
        }

        if threshold.is_none() && dma_us < pio_us {
            threshold = Some((size + prev_size) / 2);
        }
        prev_size = size;
    }

    match threshold {
        Some(t) => (
            t as u16,
            TestOutcome { name: "copybreak", passed: true, detail: "threshold measured" },
        ),
        None => (
            // DMA never won (or broke): everything goes PIO
            1514,
            TestOutcome {
                name: "copybreak",
                passed: !dma_failed,
                detail: if dma_failed { "dma path broken" } else { "pio wins at all sizes" },
            },
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ROUND-TRIP HELPERS
// ═══════════════════════════════════════════════════════════════════════════

fn pio_round_trip(
    nic: &mut dyn DmaNicOps,
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
    frame: VirtRegion,
) -> Result<()> {
    nic.send_pio(unsafe { frame.bytes() })?;
    busy_wait(ctx.tick, config.completion_timeout_us, || nic.tx_complete())?;
    let mut sink = [0u8; 1600];
    nic.recv_pio(&mut sink)?;
    Ok(())
}

fn dma_round_trip(
    nic: &mut dyn DmaNicOps,
    ctx: &CapabilityContext<'_>,
    config: &CapabilityConfig,
    segments: &crate::sg::SgList,
) -> Result<()> {
    nic.start_tx_dma(segments)?;
    busy_wait(ctx.tick, config.completion_timeout_us, || nic.tx_complete())?;
    let mut sink = [0u8; 1600];
    nic.recv_pio(&mut sink)?;
    Ok(())
}
