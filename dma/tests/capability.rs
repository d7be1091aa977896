//! The full capability battery against the software loopback NIC.

mod common;

use common::{map_buffer, with_core, CoreOpts};
use etherlink_dma::{
    run_capability_tests, CapabilityConfig, CapabilityContext, DmaPolicy, LoopbackNic,
};

#[test]
fn loopback_battery_refines_policy() {
    with_core(CoreOpts::default(), |core| {
        // Scratch the tester maps directly: 64-aligned, one 64 KB page
        let mut aligned_buf = vec![0u8; 4096];
        let aligned = map_buffer(core.bus, 0x0030_0000, &mut aligned_buf);
        // Scratch whose physical image straddles the 0x20000 boundary
        let mut straddle_buf = vec![0u8; 1500];
        let straddle = map_buffer(core.bus, 0x0002_0000 - 1024, &mut straddle_buf);

        let mut nic = LoopbackNic::new(core.bus);
        let ctx = CapabilityContext {
            mapper: core.mapper,
            registry: core.registry,
            bus: core.bus,
            cache: core.cache,
            tick: core.tick,
            policy: core.policy,
            report: &core.report,
            dev: core.devs.busmaster,
            aligned,
            straddle,
        };

        let report = run_capability_tests(&mut nic, &ctx, &CapabilityConfig::default());

        // Emulated memory is coherent and snooped, and the SG-capable
        // card crosses boundaries by splitting
        assert!(report.coherent);
        assert!(report.snoops);
        assert!(report.crosses_64k);
        assert_eq!(report.policy, DmaPolicy::Direct);
        assert_eq!(core.policy.get(), DmaPolicy::Direct);

        // All eight tests ran; a functioning loopback passes most
        assert_eq!(report.outcomes.len(), 8);
        assert!(report.confidence_pct >= 60, "confidence {}%", report.confidence_pct);

        // Manual microsecond clock: not coarse, threshold applied to the
        // device under test
        assert!(!report.coarse_timer);
        let health = core.registry.health(core.devs.busmaster).unwrap();
        assert_eq!(health.tx_copybreak(), report.copybreak);

        // Nothing leaked out of the battery
        assert_eq!(core.mapper.active_count(), 0);
        assert_eq!(core.pool.stats().in_use, 0);
    });
}

#[test]
fn broken_dma_path_forces_bounce_only() {
    with_core(CoreOpts::default(), |core| {
        let mut aligned_buf = vec![0u8; 4096];
        let aligned = map_buffer(core.bus, 0x0040_0000, &mut aligned_buf);
        let mut straddle_buf = vec![0u8; 1500];
        let straddle = map_buffer(core.bus, 0x0005_0000 - 700, &mut straddle_buf);

        let mut nic = LoopbackNic::new(core.bus);
        // Every DMA start fails, PIO still works: the refinement table
        // sends everything through bounce slots
        nic.faults.defer_completion = u32::MAX;

        let ctx = CapabilityContext {
            mapper: core.mapper,
            registry: core.registry,
            bus: core.bus,
            cache: core.cache,
            tick: core.tick,
            policy: core.policy,
            report: &core.report,
            dev: core.devs.busmaster,
            aligned,
            straddle,
        };

        let report = run_capability_tests(&mut nic, &ctx, &CapabilityConfig::default());
        assert!(!report.crosses_64k);
        assert_eq!(report.policy, DmaPolicy::BounceOnly);
        assert_eq!(core.policy.get(), DmaPolicy::BounceOnly);
    });
}

/// A bus-master engine that wedges after its first transfer: the
/// boundary test still reports a successful crossing, but the failed
/// burst sanity check alone must clamp the policy to bounce-only.
#[test]
fn wedged_bus_master_forces_bounce_only() {
    with_core(CoreOpts::default(), |core| {
        let mut aligned_buf = vec![0u8; 4096];
        let aligned = map_buffer(core.bus, 0x0080_0000, &mut aligned_buf);
        let mut straddle_buf = vec![0u8; 1500];
        let straddle = map_buffer(core.bus, 0x0009_0000 - 1024, &mut straddle_buf);

        let mut nic = LoopbackNic::new(core.bus);
        // The boundary round trip is the battery's first DMA; everything
        // after it hits the wedged engine
        nic.faults.fail_dma_after = Some(1);

        let ctx = CapabilityContext {
            mapper: core.mapper,
            registry: core.registry,
            bus: core.bus,
            cache: core.cache,
            tick: core.tick,
            policy: core.policy,
            report: &core.report,
            dev: core.devs.busmaster,
            aligned,
            straddle,
        };

        let report = run_capability_tests(&mut nic, &ctx, &CapabilityConfig::default());
        // Crossing worked, burst did not: broken DMA may not stay Direct
        assert!(report.crosses_64k);
        assert_eq!(report.policy, DmaPolicy::BounceOnly);
        assert_eq!(core.policy.get(), DmaPolicy::BounceOnly);
    });
}

#[test]
fn coarse_timer_keeps_default_copybreak() {
    with_core(CoreOpts::default(), |core| {
        let mut aligned_buf = vec![0u8; 4096];
        let aligned = map_buffer(core.bus, 0x0060_0000, &mut aligned_buf);
        let mut straddle_buf = vec![0u8; 1500];
        let straddle = map_buffer(core.bus, 0x0007_0000 - 512, &mut straddle_buf);

        // A 55 ms BIOS-tick stand-in
        let coarse = CoarseTick(core.tick);
        let mut nic = LoopbackNic::new(core.bus);
        let ctx = CapabilityContext {
            mapper: core.mapper,
            registry: core.registry,
            bus: core.bus,
            cache: core.cache,
            tick: &coarse,
            policy: core.policy,
            report: &core.report,
            dev: core.devs.busmaster,
            aligned,
            straddle,
        };

        let report = run_capability_tests(&mut nic, &ctx, &CapabilityConfig::default());
        assert!(report.coarse_timer);
        // Numbers from a coarse clock are advisory: defaults stand
        let default_caps = core.registry.caps(core.devs.busmaster).unwrap();
        assert_eq!(report.copybreak, default_caps.tx_copybreak);
    });
}

/// Wraps the manual ticker but reports BIOS-tick resolution.
struct CoarseTick<'a>(&'a etherlink_platform::ManualTicker);

impl etherlink_platform::TickSource for CoarseTick<'_> {
    fn now_us(&self) -> u64 {
        self.0.now_us()
    }

    fn resolution_us(&self) -> u64 {
        etherlink_platform::BIOS_TICK_US
    }
}
