//! The DMA mapping engine.
//!
//! Transforms a virtual buffer into something the device can safely
//! execute against, or refuses. For every `(buffer, device, direction)`
//! request the mapper:
//!
//! 1. gates on device health and the global policy,
//! 2. obtains a physical layout (VDS lock under V86, flat translation in
//!    real mode),
//! 3. splits it at 64 KB boundaries and checks every device constraint,
//! 4. falls through to a bounce slot when the direct layout cannot be
//!    executed,
//! 5. records the cache-sync obligations and armors the descriptor.
//!
//! Live descriptors sit in a fixed arena indexed by generation-tagged
//! handles, so a use-after-unmap is a typed error instead of silent
//! corruption.

use core::sync::atomic::{AtomicU32, Ordering};

use etherlink_platform::{busy_wait, IrqCell, TickSource};
use log::{debug, warn};

use crate::addr::{DmaDirection, VirtRegion};
use crate::bounce::{BouncePool, Purpose, SlotId, SLOT_SIZE};
use crate::cache::CacheManager;
use crate::caps::{DeviceCaps, DeviceId, DeviceRegistry};
use crate::error::{Error, Result};
use crate::integrity::{Digest, CANARY_FRONT, CANARY_REAR, MAPPING_SIGNATURE};
use crate::policy::{DmaPolicy, PolicyCell};
use crate::sg::{SgList, SgSegment};
use crate::vds::{VdsBackend, VdsError, VdsFlags};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// In-flight mapping limit; matches the deepest queue any one NIC runs.
pub const MAX_ACTIVE_MAPPINGS: usize = 8;

/// Floor under the per-device alignment requirement.
pub const MIN_DMA_ALIGNMENT: u16 = 2;

// ═══════════════════════════════════════════════════════════════════════════
// MAPPING DESCRIPTOR
// ═══════════════════════════════════════════════════════════════════════════

/// Descriptor lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// Device may own the buffer.
    Active,
    /// Synced back for CPU access; device must not touch it.
    CpuOwned,
    /// Quarantined after an integrity failure; leaked, never recycled.
    Dead,
}

#[derive(Debug, Clone)]
struct DmaMapping {
    signature: u32,
    front_canary: u32,
    sg: SgList,
    total_len: u32,
    dir: DmaDirection,
    dev: DeviceId,
    uses_bounce: bool,
    vds_handle: Option<u16>,
    slot: Option<SlotId>,
    caller: VirtRegion,
    state: MapState,
    checksum: u16,
    rear_canary: u32,
}

impl DmaMapping {
    fn digest(&self) -> u16 {
        let mut d = Digest::new();
        d.push_u32(self.signature);
        d.push_u32(self.total_len);
        d.push_u8(self.dir as u8);
        d.push_u8(self.dev.index() as u8);
        d.push_u8(self.uses_bounce as u8);
        d.push_u16(self.vds_handle.unwrap_or(0xFFFF));
        d.push_u8(self.slot.map(|s| s.index() as u8).unwrap_or(0xFF));
        d.push_usize(self.caller.addr());
        d.push_usize(self.caller.len());
        d.push_u8(self.state as u8);
        for seg in self.sg.iter() {
            d.push_u32(seg.phys.raw());
            d.push_u16(seg.len);
            d.push_usize(seg.virt);
        }
        d.finish()
    }

    fn rearm(&mut self) {
        self.checksum = self.digest();
    }

    fn is_intact(&self) -> bool {
        self.signature == MAPPING_SIGNATURE
            && self.front_canary == CANARY_FRONT
            && self.rear_canary == CANARY_REAR
            && self.checksum == self.digest()
    }
}

/// Generation-tagged handle to a live mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingHandle {
    index: u8,
    generation: u16,
}

/// Read-only view of a mapping for device programming and tests.
#[derive(Debug, Clone)]
pub struct MappingInfo {
    pub segments: SgList,
    pub total_len: u32,
    pub dir: DmaDirection,
    pub uses_bounce: bool,
    pub state: MapState,
}

/// Outcome of an arena validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MappingSweep {
    pub checked: u32,
    pub quarantined: u32,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapperStats {
    pub direct_maps: u32,
    pub bounce_maps: u32,
    pub failures: u32,
    pub unmaps: u32,
}

// ═══════════════════════════════════════════════════════════════════════════
// MAPPER
// ═══════════════════════════════════════════════════════════════════════════

/// Construction knobs.
#[derive(Debug, Clone, Copy)]
pub struct MapperConfig {
    /// Running under a V86 monitor: physical layout must come from VDS.
    pub v86_active: bool,
    /// Base delay for bounce-exhaustion backoff (retries wait 10x, 20x,
    /// 40x this).
    pub base_backoff_us: u64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self { v86_active: false, base_backoff_us: 50 }
    }
}

struct ArenaEntry {
    mapping: Option<DmaMapping>,
    generation: u16,
}

/// The request engine. Cheap to share: all entry points take `&self`.
pub struct DmaMapper<'a> {
    registry: &'a DeviceRegistry,
    vds: &'a dyn VdsBackend,
    cache: &'a CacheManager<'a>,
    pool: &'a BouncePool,
    tick: &'a dyn TickSource,
    policy: &'a PolicyCell,
    config: MapperConfig,
    arena: IrqCell<[ArenaEntry; MAX_ACTIVE_MAPPINGS]>,
    direct_maps: AtomicU32,
    bounce_maps: AtomicU32,
    failures: AtomicU32,
    unmaps: AtomicU32,
}

impl<'a> DmaMapper<'a> {
    pub fn new(
        registry: &'a DeviceRegistry,
        vds: &'a dyn VdsBackend,
        cache: &'a CacheManager<'a>,
        pool: &'a BouncePool,
        tick: &'a dyn TickSource,
        policy: &'a PolicyCell,
        config: MapperConfig,
    ) -> Self {
        const VACANT: ArenaEntry = ArenaEntry { mapping: None, generation: 0 };
        Self {
            registry,
            vds,
            cache,
            pool,
            tick,
            policy,
            config,
            arena: IrqCell::new([VACANT; MAX_ACTIVE_MAPPINGS]),
            direct_maps: AtomicU32::new(0),
            bounce_maps: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            unmaps: AtomicU32::new(0),
        }
    }

    // ── Public API ──────────────────────────────────────────────────────

    pub fn map_tx(&self, region: VirtRegion, dev: DeviceId) -> Result<MappingHandle> {
        self.map(region, dev, DmaDirection::ToDevice)
    }

    pub fn map_rx(&self, region: VirtRegion, dev: DeviceId) -> Result<MappingHandle> {
        self.map(region, dev, DmaDirection::FromDevice)
    }

    pub fn map(&self, region: VirtRegion, dev: DeviceId, dir: DmaDirection) -> Result<MappingHandle> {
        match self.map_inner(region, dev, dir) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Release a mapping: cache-sync for the CPU, bounce copy-out for
    /// receives, slot release, VDS unlock. A second call with the same
    /// handle is a detected error, never a double-release.
    pub fn unmap(&self, handle: MappingHandle) -> Result<()> {
        let mapping = self.arena.with(|arena| {
            let entry = arena
                .get_mut(handle.index as usize)
                .ok_or(Error::InvalidParam)?;
            if entry.generation != handle.generation {
                warn!("[MAP] stale handle (double unmap?) idx {}", handle.index);
                return Err(Error::InvalidParam);
            }
            match &entry.mapping {
                None => return Err(Error::InvalidParam),
                Some(m) if m.state == MapState::Dead => return Err(Error::IntegrityViolation),
                Some(_) => {}
            }
            let mapping = entry.mapping.take().ok_or(Error::InvalidParam)?;
            if !mapping.is_intact() {
                // Possibly torn: leak it, never recycle
                let mut dead = mapping;
                dead.state = MapState::Dead;
                dead.rearm();
                entry.mapping = Some(dead);
                return Err(Error::IntegrityViolation);
            }
            entry.generation = entry.generation.wrapping_add(1);
            Ok(mapping)
        })?;

        // Copies, cache maintenance and unlocks run with interrupts back on
        let caps = self.registry.caps(mapping.dev)?;
        if !caps.cache_coherent && mapping.dir.from_device() {
            for seg in mapping.sg.iter() {
                self.cache
                    .sync_for_cpu(VirtRegion::new(seg.virt, seg.len as usize), mapping.dir);
            }
        }
        if let Some(slot) = mapping.slot {
            if mapping.dir.from_device() {
                let out = unsafe { mapping.caller.bytes_mut() };
                self.pool.copy_out(slot, out, mapping.caller.len())?;
            }
            self.pool.release(slot)?;
        }
        if let Some(h) = mapping.vds_handle {
            self.vds.unlock(h);
        }
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Explicit re-sync before handing the buffer back to the device.
    pub fn sync_for_device(&self, handle: MappingHandle) -> Result<()> {
        self.sync(handle, true)
    }

    /// Explicit re-sync before the CPU reads a still-mapped buffer.
    pub fn sync_for_cpu(&self, handle: MappingHandle) -> Result<()> {
        self.sync(handle, false)
    }

    /// Snapshot a mapping for device programming or verification.
    pub fn info(&self, handle: MappingHandle) -> Result<MappingInfo> {
        self.arena.with(|arena| {
            let entry = arena
                .get(handle.index as usize)
                .ok_or(Error::InvalidParam)?;
            if entry.generation != handle.generation {
                return Err(Error::InvalidParam);
            }
            let m = entry.mapping.as_ref().ok_or(Error::InvalidParam)?;
            Ok(MappingInfo {
                segments: m.sg.clone(),
                total_len: m.total_len,
                dir: m.dir,
                uses_bounce: m.uses_bounce,
                state: m.state,
            })
        })
    }

    /// Integrity pass over every live descriptor. Interrupt-shared, so it
    /// runs entirely inside the arena critical section.
    pub fn validate_active(&self) -> MappingSweep {
        self.arena.with(|arena| {
            let mut sweep = MappingSweep::default();
            for (i, entry) in arena.iter_mut().enumerate() {
                if let Some(m) = entry.mapping.as_mut() {
                    sweep.checked += 1;
                    if m.state != MapState::Dead && !m.is_intact() {
                        warn!("[MAP] descriptor {} failed validation, quarantined", i);
                        m.state = MapState::Dead;
                        m.rearm();
                        sweep.quarantined += 1;
                    }
                }
            }
            sweep
        })
    }

    pub fn active_count(&self) -> usize {
        self.arena
            .with(|arena| arena.iter().filter(|e| e.mapping.is_some()).count())
    }

    pub fn stats(&self) -> MapperStats {
        MapperStats {
            direct_maps: self.direct_maps.load(Ordering::Relaxed),
            bounce_maps: self.bounce_maps.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
        }
    }

    /// Corrupt a live descriptor's armor. Test scaffolding.
    #[doc(hidden)]
    pub fn debug_scramble_mapping(&self, handle: MappingHandle) {
        self.arena.with(|arena| {
            if let Some(entry) = arena.get_mut(handle.index as usize) {
                if let Some(m) = entry.mapping.as_mut() {
                    m.checksum ^= 0xFFFF;
                }
            }
        });
    }

    // ── Mapping algorithm ───────────────────────────────────────────────

    fn map_inner(&self, region: VirtRegion, dev: DeviceId, dir: DmaDirection) -> Result<MappingHandle> {
        let caps = self.registry.caps(dev)?;
        let health = self.registry.health(dev)?;

        if health.is_disabled() {
            return Err(Error::DeviceDisabled);
        }
        let policy = self.policy.get();
        if policy == DmaPolicy::Forbid {
            return Err(Error::DmaForbidden);
        }
        if region.is_empty() {
            return Err(Error::InvalidParam);
        }
        if region.len() as u32 > caps.max_transfer {
            return Err(Error::BufferTooLarge);
        }

        // A paged machine without a pinning service cannot run ring
        // devices at all; a single bounce slot is no substitute for
        // pinned descriptor memory. This holds under every policy.
        if self.config.v86_active && !self.vds.available() && caps.needs_vds {
            return Err(Error::VdsUnavailable);
        }

        let alignment = caps.alignment.max(MIN_DMA_ALIGNMENT) as u32;

        if policy != DmaPolicy::BounceOnly {
            if let Some((sg, vds_handle)) = self.try_direct(region, caps, alignment)? {
                return self.commit(region, dev, dir, caps, sg, None, vds_handle);
            }
        }
        self.map_bounce(region, dev, dir, caps)
    }

    /// Attempt the zero-copy layout. `Ok(None)` means "constraints cannot
    /// be met directly, bounce instead"; `Err` is a hard surface.
    fn try_direct(
        &self,
        region: VirtRegion,
        caps: &DeviceCaps,
        alignment: u32,
    ) -> Result<Option<(SgList, Option<u16>)>> {
        if self.config.v86_active {
            if !self.vds.available() {
                // No pinning service: only pre-translated bounce slots
                // are safe (needs_vds devices were rejected earlier)
                return Ok(None);
            }
            let mut flags = VdsFlags::empty();
            if caps.no_64k_cross {
                flags |= VdsFlags::NO_CROSS_64K;
            }
            if caps.requires_contiguous {
                flags |= VdsFlags::CONTIGUOUS;
            }
            return match self.vds.lock(region, flags) {
                Ok(lock) => {
                    let mut sg = SgList::new();
                    let mut splittable = true;
                    for seg in lock.sg.iter() {
                        if sg
                            .append_split(
                                seg.phys,
                                seg.len as u32,
                                seg.virt,
                                caps.no_64k_cross,
                                caps.len_multiple_of_4,
                            )
                            .is_err()
                        {
                            splittable = false;
                            break;
                        }
                    }
                    if splittable && self.segments_fit(&sg, caps, alignment) {
                        Ok(Some((sg, Some(lock.handle))))
                    } else {
                        self.vds.unlock(lock.handle);
                        debug!("[MAP] locked layout unusable, bouncing");
                        Ok(None)
                    }
                }
                // Host refusals are never silently converted
                Err(VdsError::Unavailable) => Err(Error::VdsUnavailable),
                Err(VdsError::NotLockable) => Err(Error::InvalidParam),
                Err(VdsError::RegionTooLarge) => Err(Error::BufferTooLarge),
                Err(VdsError::TooFragmented) => Ok(None),
            };
        }

        // Real mode: flat translation, iterate boundary chunks directly
        let phys = match self.vds.translate(region) {
            Some(p) => p,
            None => return Ok(None),
        };
        if !phys.is_aligned(alignment) {
            return Ok(None);
        }
        let mut sg = SgList::new();
        if sg
            .append_split(
                phys,
                region.len() as u32,
                region.addr(),
                caps.no_64k_cross,
                caps.len_multiple_of_4,
            )
            .is_err()
        {
            return Ok(None);
        }
        if self.segments_fit(&sg, caps, alignment) {
            Ok(Some((sg, None)))
        } else {
            Ok(None)
        }
    }

    fn segments_fit(&self, sg: &SgList, caps: &DeviceCaps, alignment: u32) -> bool {
        if sg.check_against(caps).is_err() {
            return false;
        }
        // The effective alignment may be stricter than the device's own
        sg.iter().all(|seg| seg.phys.is_aligned(alignment))
    }

    /// Bounce path: copy through a pool slot, with bounded backoff when
    /// the pool is dry.
    fn map_bounce(
        &self,
        region: VirtRegion,
        dev: DeviceId,
        dir: DmaDirection,
        caps: &DeviceCaps,
    ) -> Result<MappingHandle> {
        if region.len() > SLOT_SIZE {
            return Err(Error::BufferTooLarge);
        }
        let purpose = if dir.to_device() { Purpose::Tx } else { Purpose::Rx };
        let slot = self.reserve_with_backoff(region.len(), purpose)?;
        let phys = self.pool.slot_phys(slot)?;

        if dir.to_device() {
            let bytes = unsafe { region.bytes() };
            if let Err(e) = self.pool.copy_in(slot, bytes) {
                let _ = self.pool.release(slot);
                return Err(e);
            }
        }

        let seg_len = if caps.len_multiple_of_4 {
            crate::addr::align_up(region.len() as u32, 4)
        } else {
            region.len() as u32
        };
        let mut sg = SgList::new();
        sg.push(SgSegment {
            phys,
            len: seg_len as u16,
            virt: self.pool.slot_virt(slot),
        })
        .map_err(|_| Error::InvalidParam)?;

        self.commit(region, dev, dir, caps, sg, Some(slot), None)
    }

    fn reserve_with_backoff(&self, len: usize, purpose: Purpose) -> Result<SlotId> {
        match self.pool.reserve(len, purpose) {
            Ok(slot) => return Ok(slot),
            Err(Error::BounceExhausted) => {}
            Err(e) => return Err(e),
        }
        for backoff_mult in [10u64, 20, 40] {
            let delay = self.config.base_backoff_us * backoff_mult;
            let _ = busy_wait(self.tick, delay, || false);
            // Emergency sweep: corrupt-but-idle slots come back
            let _ = self.pool.validate_slots(true);
            match self.pool.reserve(len, purpose) {
                Ok(slot) => return Ok(slot),
                Err(Error::BounceExhausted) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!("[MAP] bounce pool exhausted after backoff");
        Err(Error::BounceExhausted)
    }

    /// Armor the descriptor, record sync obligations, park it in the
    /// arena.
    fn commit(
        &self,
        region: VirtRegion,
        dev: DeviceId,
        dir: DmaDirection,
        caps: &DeviceCaps,
        sg: SgList,
        slot: Option<SlotId>,
        vds_handle: Option<u16>,
    ) -> Result<MappingHandle> {
        if !caps.cache_coherent {
            for seg in sg.iter() {
                self.cache
                    .sync_for_device(VirtRegion::new(seg.virt, seg.len as usize), dir);
            }
        }

        let mut mapping = DmaMapping {
            signature: MAPPING_SIGNATURE,
            front_canary: CANARY_FRONT,
            total_len: sg.total_len(),
            sg,
            dir,
            dev,
            uses_bounce: slot.is_some(),
            vds_handle,
            slot,
            caller: region,
            state: MapState::Active,
            checksum: 0,
            rear_canary: CANARY_REAR,
        };
        mapping.rearm();
        let uses_bounce = mapping.uses_bounce;

        let parked = self.arena.with(move |arena| {
            for (i, entry) in arena.iter_mut().enumerate() {
                if entry.mapping.is_none() {
                    let generation = entry.generation;
                    entry.mapping = Some(mapping);
                    return Some(MappingHandle { index: i as u8, generation });
                }
            }
            None
        });

        match parked {
            Some(handle) => {
                if uses_bounce {
                    self.bounce_maps.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.direct_maps.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    "[MAP] dev {} -> entry {} (bounce={})",
                    dev.index(),
                    handle.index,
                    uses_bounce
                );
                Ok(handle)
            }
            None => {
                // Table full: roll everything back before surfacing
                warn!("[MAP] mapping table full");
                if let Some(s) = slot {
                    let _ = self.pool.release(s);
                }
                if let Some(h) = vds_handle {
                    self.vds.unlock(h);
                }
                Err(Error::BounceExhausted)
            }
        }
    }

    fn sync(&self, handle: MappingHandle, for_device: bool) -> Result<()> {
        // Validate and claim under the mask, sync with interrupts back on
        let (segments, dir, coherent) = self.arena.with(|arena| {
            let entry = arena
                .get_mut(handle.index as usize)
                .ok_or(Error::InvalidParam)?;
            if entry.generation != handle.generation {
                return Err(Error::InvalidParam);
            }
            let m = entry.mapping.as_mut().ok_or(Error::InvalidParam)?;
            if m.state == MapState::Dead {
                return Err(Error::IntegrityViolation);
            }
            if !m.is_intact() {
                m.state = MapState::Dead;
                m.rearm();
                return Err(Error::IntegrityViolation);
            }
            let caps = self.registry.caps(m.dev)?;
            m.state = if for_device { MapState::Active } else { MapState::CpuOwned };
            m.rearm();
            Ok((m.sg.clone(), m.dir, caps.cache_coherent))
        })?;

        if !coherent {
            for seg in segments.iter() {
                let region = VirtRegion::new(seg.virt, seg.len as usize);
                if for_device {
                    self.cache.sync_for_device(region, dir);
                } else {
                    self.cache.sync_for_cpu(region, dir);
                }
            }
        }
        Ok(())
    }
}
