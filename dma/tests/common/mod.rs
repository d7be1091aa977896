//! Shared harness: a fully-assembled DMA core over an emulated physical
//! address space.

#![allow(dead_code)]

use etherlink_dma::{
    BouncePool, CacheConfig, CacheManager, DeviceCaps, DeviceId, DeviceRegistry, DmaMapper,
    DmaPolicy, MappedBus, MappedVds, MapperConfig, MappingInfo, PhysAddr, PolicyCell, V86Backend,
    VdsBackend, VirtRegion, BOUNCE_SLOTS, SLOT_SIZE,
};
use etherlink_platform::{CacheMode, CpuFeatures, CpuInfo, ManualTicker, PlatformReport};

/// Synthetic physical base of the bounce pool storage.
pub const POOL_PHYS: u32 = 0x0010_0000;

pub struct Devices {
    pub isa: DeviceId,
    pub pcmcia: DeviceId,
    pub busmaster: DeviceId,
    pub pci: DeviceId,
}

pub struct CoreOpts {
    pub cache_mode: CacheMode,
    pub features: CpuFeatures,
    pub v86: bool,
    pub policy: DmaPolicy,
    /// Use the real V86 backend (service absent on hosted builds)
    /// instead of the mapped-window backend.
    pub use_v86_backend: bool,
    pub base_backoff_us: u64,
}

impl Default for CoreOpts {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Disabled,
            features: CpuFeatures::empty(),
            v86: false,
            policy: DmaPolicy::Auto,
            use_v86_backend: false,
            base_backoff_us: 50,
        }
    }
}

pub struct Core<'a> {
    pub mapper: &'a DmaMapper<'a>,
    pub bus: &'a MappedBus,
    pub pool: &'a BouncePool,
    pub registry: &'a DeviceRegistry,
    pub policy: &'a PolicyCell,
    pub tick: &'a ManualTicker,
    pub cache: &'a CacheManager<'a>,
    pub report: PlatformReport,
    pub devs: Devices,
}

pub fn registry_with_all() -> (DeviceRegistry, Devices) {
    let mut registry = DeviceRegistry::new();
    let isa = registry.register(DeviceCaps::isa_pio_3c509b()).unwrap();
    let pcmcia = registry.register(DeviceCaps::pcmcia_3c589()).unwrap();
    let busmaster = registry.register(DeviceCaps::isa_busmaster_3c515()).unwrap();
    let pci = registry.register(DeviceCaps::pci_3c905b()).unwrap();
    (registry, Devices { isa, pcmcia, busmaster, pci })
}

/// Build the whole core on the stack and hand it to the test body.
pub fn with_core<R, F: FnOnce(Core<'_>) -> R>(opts: CoreOpts, f: F) -> R {
    let bus = MappedBus::new();
    let pool = Box::new(BouncePool::new());
    bus.map(PhysAddr::new(POOL_PHYS), pool.storage_base(), BOUNCE_SLOTS * SLOT_SIZE);
    pool.init(PhysAddr::new(POOL_PHYS)).unwrap();

    let (registry, devs) = registry_with_all();

    let mut cpu = CpuInfo::conservative();
    cpu.cache_mode = opts.cache_mode;
    cpu.features = opts.features;
    cpu.v86_active = opts.v86;
    let report = PlatformReport { cpu, pci: None, chipset: None, vds_present: false };

    let tick = ManualTicker::auto(1);
    let cache = CacheManager::select(&report, CacheConfig::default(), &tick);
    let policy = PolicyCell::new(opts.policy);

    let v86_backend = V86Backend;
    let mapped_backend = MappedVds(&bus);
    let vds: &dyn VdsBackend = if opts.use_v86_backend { &v86_backend } else { &mapped_backend };

    let mapper = DmaMapper::new(
        &registry,
        vds,
        &cache,
        &pool,
        &tick,
        &policy,
        MapperConfig { v86_active: opts.v86, base_backoff_us: opts.base_backoff_us },
    );

    f(Core {
        mapper: &mapper,
        bus: &bus,
        pool: &pool,
        registry: &registry,
        policy: &policy,
        tick: &tick,
        cache: &cache,
        report,
        devs,
    })
}

/// Register a host buffer at a synthetic physical address.
pub fn map_buffer(bus: &MappedBus, phys: u32, buf: &mut [u8]) -> VirtRegion {
    bus.map(PhysAddr::new(phys), buf.as_mut_ptr() as usize, buf.len());
    VirtRegion::from_mut_slice(buf)
}

/// The universal mapping invariants from the driver's contract.
pub fn assert_mapping_invariants(info: &MappingInfo, caps: &DeviceCaps) {
    let sum: u32 = info.segments.iter().map(|s| s.len as u32).sum();
    assert_eq!(sum, info.total_len, "segment lengths must sum to total");
    assert!(!info.segments.is_empty());

    if !caps.supports_sg {
        assert_eq!(info.segments.len(), 1, "non-SG device must get one segment");
    }
    assert!(info.segments.len() <= caps.max_sg_entries as usize);
    if info.uses_bounce {
        assert_eq!(info.segments.len(), 1, "bounce mapping must be one segment");
    }

    for seg in info.segments.iter() {
        assert!(seg.len > 0);
        assert!(seg.len as u32 <= 65_535);
        let end = seg.phys.raw() as u64 + seg.len as u64;
        assert!(end <= caps.max_phys_addr, "segment exceeds device address width");
        assert_eq!(
            seg.phys.raw() % caps.alignment as u32,
            0,
            "segment start must honor device alignment"
        );
        if caps.no_64k_cross {
            let first_page = seg.phys.raw() / 65_536;
            let last_page = (seg.phys.raw() + seg.len as u32 - 1) / 65_536;
            assert_eq!(first_page, last_page, "segment crosses a 64 KB boundary");
        }
        if caps.len_multiple_of_4 {
            assert_eq!(seg.len % 4, 0);
        }
    }
}
