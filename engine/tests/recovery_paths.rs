//! Engine-level paths: copybreak routing, retry-wrapped recovery, RX
//! timeout escalation, failover, and graceful degradation.

use core::sync::atomic::Ordering;

use etherlink_dma::{
    BouncePool, CacheConfig, CacheManager, DeviceCaps, DeviceId, DeviceRegistry, DmaMapper,
    DmaPolicy, Error, LoopbackNic, MappedBus, MappedVds, MapperConfig, NicOps, PhysAddr,
    PolicyCell, BOUNCE_SLOTS, SLOT_SIZE,
};
use etherlink_engine::{EngineConfig, FailoverEvent, PacketEngine};
use etherlink_platform::{CpuInfo, ManualTicker, PlatformReport, TickSource};

const POOL_PHYS: u32 = 0x0010_0000;

struct Devices {
    isa: DeviceId,
    pcmcia: DeviceId,
    busmaster: DeviceId,
    pci: DeviceId,
}

struct Env<'a> {
    registry: &'a DeviceRegistry,
    policy: &'a PolicyCell,
    tick: &'a ManualTicker,
    bus: &'a MappedBus,
    pool: &'a BouncePool,
    devs: Devices,
}

/// Assemble core + engine + loopback NIC and hand them to the test.
fn with_engine<R>(
    config: EngineConfig,
    f: impl FnOnce(&mut PacketEngine<'_>, &mut LoopbackNic<'_>, Env<'_>) -> R,
) -> R {
    let bus = MappedBus::new();
    let pool = Box::new(BouncePool::new());
    bus.map(PhysAddr::new(POOL_PHYS), pool.storage_base(), BOUNCE_SLOTS * SLOT_SIZE);
    pool.init(PhysAddr::new(POOL_PHYS)).unwrap();

    let mut registry = DeviceRegistry::new();
    let devs = Devices {
        isa: registry.register(DeviceCaps::isa_pio_3c509b()).unwrap(),
        pcmcia: registry.register(DeviceCaps::pcmcia_3c589()).unwrap(),
        busmaster: registry.register(DeviceCaps::isa_busmaster_3c515()).unwrap(),
        pci: registry.register(DeviceCaps::pci_3c905b()).unwrap(),
    };

    let mut cpu = CpuInfo::conservative();
    cpu.cache_mode = etherlink_platform::CacheMode::Disabled;
    let report = PlatformReport { cpu, pci: None, chipset: None, vds_present: false };

    // Big steps keep the 2-second RX deadline to a few thousand polls
    let tick = ManualTicker::auto(1_000);
    let cache = CacheManager::select(&report, CacheConfig::default(), &tick);
    let policy = PolicyCell::new(DmaPolicy::Auto);
    let backend = MappedVds(&bus);
    let mapper = DmaMapper::new(
        &registry,
        &backend,
        &cache,
        &pool,
        &tick,
        &policy,
        MapperConfig::default(),
    );

    let mut engine = PacketEngine::new(&mapper, &registry, &pool, &policy, &tick, config);
    let mut nic = LoopbackNic::new(&bus);
    nic.set_loopback(true);

    f(&mut engine, &mut nic, Env {
        registry: &registry,
        policy: &policy,
        tick: &tick,
        bus: &bus,
        pool: &pool,
        devs,
    })
}

#[test]
fn pio_round_trip_below_copybreak() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        let frame = [0xABu8; 100];
        engine.send(nic, env.devs.isa, &frame).unwrap();

        let mut rx = [0u8; 1514];
        let len = engine.receive(nic, env.devs.isa, &mut rx).unwrap();
        assert_eq!(len, 100);
        assert_eq!(&rx[..100], &frame[..]);

        let health = env.registry.health(env.devs.isa).unwrap();
        assert_eq!(health.tx_packets.load(Ordering::Relaxed), 1);
        assert_eq!(health.rx_packets.load(Ordering::Relaxed), 1);
        assert_eq!(health.consecutive_errors.load(Ordering::Relaxed), 0);
    });
}

#[test]
fn dma_send_above_copybreak() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        // 1024 > the bus-master's 256-byte copybreak; mapped so the
        // "silicon" can gather it
        let mut frame = vec![0x5Au8; 1024];
        env.bus.map(PhysAddr::new(0x0030_0000), frame.as_mut_ptr() as usize, frame.len());
        engine.send(nic, env.devs.busmaster, &frame).unwrap();

        // Receive lands through a bounce slot and copies out on unmap
        let mut rx = vec![0u8; 1514];
        let len = engine.receive(nic, env.devs.busmaster, &mut rx).unwrap();
        assert_eq!(len, 1024);
        assert_eq!(&rx[..1024], &frame[..]);
        assert_eq!(env.pool.stats().in_use, 0);
    });
}

#[test]
fn frame_length_bounds() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        let runt = [0u8; 59];
        assert_eq!(engine.send(nic, env.devs.isa, &runt), Err(Error::InvalidParam));
        let giant = [0u8; 1515];
        assert_eq!(engine.send(nic, env.devs.isa, &giant), Err(Error::InvalidParam));
    });
}

#[test]
fn tx_fault_is_recovered_and_retried() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        nic.faults.fail_next_tx = true;
        let frame = [0x11u8; 80];
        engine.send(nic, env.devs.isa, &frame).unwrap();

        let health = env.registry.health(env.devs.isa).unwrap();
        // One errored attempt, one good one; streak cleared by success
        assert_eq!(health.tx_errors.load(Ordering::Relaxed), 1);
        assert_eq!(health.tx_packets.load(Ordering::Relaxed), 2);
        assert_eq!(health.consecutive_errors.load(Ordering::Relaxed), 0);
        // Soft reset left interrupts on
        assert!(nic.irq_enabled());
    });
}

/// RX times out at the 2-second deadline, recovery soft-resets, and the
/// streak clears as soon as an operation succeeds again.
#[test]
fn rx_timeout_soft_reset_then_success_clears_streak() {
    let config = EngineConfig { max_retries: 1, ..EngineConfig::default() };
    with_engine(config, |engine, nic, env| {
        let mut rx = [0u8; 1514];
        // Nothing queued: both the wait and its one retry expire
        let r = engine.receive(nic, env.devs.isa, &mut rx);
        assert_eq!(r, Err(Error::Timeout));

        let health = env.registry.health(env.devs.isa).unwrap();
        assert_eq!(health.consecutive_errors.load(Ordering::Relaxed), 2);
        // Soft reset ran and re-enabled interrupts
        assert!(nic.irq_enabled());

        // Traffic arrives; the next receive succeeds and clears the streak
        nic.send_pio(&[0x77u8; 64]).unwrap();
        let len = engine.receive(nic, env.devs.isa, &mut rx).unwrap();
        assert_eq!(len, 64);
        assert_eq!(health.consecutive_errors.load(Ordering::Relaxed), 0);
    });
}

/// Five consecutive RX timeouts escalate to failover onto the healthy
/// peer; the failed device is taken out of service.
#[test]
fn repeated_rx_timeouts_fail_over_to_healthy_peer() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        // The PCMCIA card is the healthy peer
        env.registry
            .health(env.devs.pcmcia)
            .unwrap()
            .link_up
            .store(true, Ordering::Relaxed);

        let mut rx = [0u8; 1514];
        // First call: initial wait + 3 retries = 4 consecutive errors
        assert_eq!(engine.receive(nic, env.devs.isa, &mut rx), Err(Error::Timeout));
        let health = env.registry.health(env.devs.isa).unwrap();
        assert_eq!(health.consecutive_errors.load(Ordering::Relaxed), 4);

        // Fifth timeout trips the failover threshold
        assert_eq!(engine.receive(nic, env.devs.isa, &mut rx), Err(Error::HardwareFailure));
        assert_eq!(
            engine.last_failover,
            Some(FailoverEvent { from: env.devs.isa, to: Some(env.devs.pcmcia) })
        );
        assert!(health.is_disabled());
        assert!(engine.any_device_usable());

        // The dead card refuses further traffic explicitly
        assert_eq!(engine.send(nic, env.devs.isa, &[0u8; 100]), Err(Error::DeviceDisabled));
    });
}

/// With no healthy peer left, the device is disabled and the caller is
/// told the hardware is gone.
#[test]
fn failover_without_peer_disables_device() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        for dev in [env.devs.pcmcia, env.devs.busmaster, env.devs.pci] {
            env.registry.health(dev).unwrap().disable();
        }

        let mut rx = [0u8; 1514];
        assert_eq!(engine.receive(nic, env.devs.isa, &mut rx), Err(Error::Timeout));
        assert_eq!(engine.receive(nic, env.devs.isa, &mut rx), Err(Error::HardwareFailure));

        assert_eq!(
            engine.last_failover,
            Some(FailoverEvent { from: env.devs.isa, to: None })
        );
        assert!(!engine.any_device_usable());
    });
}

/// A dead card that cannot even reset escalates straight to failover.
#[test]
fn failed_recovery_escalates_immediately() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        env.registry
            .health(env.devs.pcmcia)
            .unwrap()
            .link_up
            .store(true, Ordering::Relaxed);

        // Self-test failure classifies as register corruption -> hard
        // reset, and the reset itself fails
        nic.faults.fail_next_tx = true;
        nic.faults.fail_self_test = true;
        nic.faults.fail_reset = true;

        let r = engine.send(nic, env.devs.isa, &[0x22u8; 80]);
        assert_eq!(r, Err(Error::HardwareFailure));
        assert_eq!(
            engine.last_failover,
            Some(FailoverEvent { from: env.devs.isa, to: Some(env.devs.pcmcia) })
        );
        assert!(env.registry.health(env.devs.isa).unwrap().is_disabled());
    });
}

/// The periodic tick repairs idle slot corruption through the sweep.
#[test]
fn on_tick_runs_integrity_sweep() {
    with_engine(EngineConfig::default(), |engine, _nic, env| {
        let slot = env.pool.reserve(64, etherlink_dma::Purpose::Tx).unwrap();
        env.pool.release(slot).unwrap();
        env.pool.debug_scramble_slot(slot);

        let report = engine.on_tick();
        assert_eq!(report.repaired, 1);
        assert!(!report.refused);
        assert_eq!(env.policy.get(), DmaPolicy::Auto);

        // Quiet afterwards
        assert_eq!(engine.on_tick().repaired, 0);
    });
}

/// Corruption across most of the pool clamps the policy to Forbid.
#[test]
fn half_pool_corruption_refuses_dma() {
    with_engine(EngineConfig::default(), |engine, _nic, env| {
        // Five of eight slots corrupt while reserved: quarantined, not
        // repaired
        let slots: Vec<_> = (0..5)
            .map(|_| env.pool.reserve(64, etherlink_dma::Purpose::Tx).unwrap())
            .collect();
        for s in &slots {
            env.pool.debug_scramble_slot(*s);
        }

        let report = engine.on_tick();
        assert_eq!(report.quarantined, 5);
        assert!(report.refused);
        assert_eq!(env.policy.get(), DmaPolicy::Forbid);
    });
}

#[test]
fn waits_are_bounded_against_the_tick_source() {
    with_engine(EngineConfig::default(), |engine, nic, env| {
        let before = env.tick.now_us();
        let mut rx = [0u8; 64];
        nic.send_pio(&[0x01u8; 64]).unwrap();
        engine.receive(nic, env.devs.isa, &mut rx).unwrap();
        assert!(env.tick.now_us() > before);
    });
}
