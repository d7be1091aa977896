//! Bounce-buffer pool.
//!
//! A fixed pool of physically contiguous, ISA-reachable, frame-sized
//! buffers, allocated once at init and lent out by reservation. The
//! in-use bits are interrupt-shared state, so every scan and flip happens
//! inside a critical section. The pool never grows; exhaustion is a hard
//! failure the mapper retries with bounded backoff.

use core::cell::UnsafeCell;

use etherlink_platform::IrqCell;
use log::{info, warn};

use crate::addr::PhysAddr;
use crate::error::{Error, Result};
use crate::integrity::{Digest, CANARY_FRONT, CANARY_REAR, SLOT_SIGNATURE};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Slot count, fixed at init.
pub const BOUNCE_SLOTS: usize = 8;

/// One Ethernet frame with headroom, kept 16-aligned.
pub const SLOT_SIZE: usize = 1600;

/// What a reservation is for (diagnostics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Tx,
    Rx,
    CapabilityTest,
}

/// Handle to a reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u8);

impl SlotId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SLOT METADATA
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    signature: u32,
    front_canary: u32,
    phys: PhysAddr,
    in_use: bool,
    /// Quarantined: never handed out again.
    dead: bool,
    purpose: Purpose,
    use_count: u32,
    checksum: u16,
    rear_canary: u32,
}

impl SlotMeta {
    const fn vacant() -> Self {
        Self {
            signature: 0,
            front_canary: 0,
            phys: PhysAddr::new(0),
            in_use: false,
            dead: false,
            purpose: Purpose::Tx,
            use_count: 0,
            checksum: 0,
            rear_canary: 0,
        }
    }

    fn digest(&self) -> u16 {
        let mut d = Digest::new();
        d.push_u32(self.signature);
        d.push_u32(self.phys.raw());
        d.push_u8(self.in_use as u8);
        d.push_u8(self.dead as u8);
        d.push_u8(self.purpose as u8);
        d.push_u32(self.use_count);
        d.finish()
    }

    fn rearm(&mut self) {
        self.checksum = self.digest();
    }

    fn is_intact(&self) -> bool {
        self.signature == SLOT_SIGNATURE
            && self.front_canary == CANARY_FRONT
            && self.rear_canary == CANARY_REAR
            && self.checksum == self.digest()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

struct PoolState {
    slots: [SlotMeta; BOUNCE_SLOTS],
    initialized: bool,
    reserves: u32,
    releases: u32,
    exhaustions: u32,
}

/// Counter snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceStats {
    pub reserves: u32,
    pub releases: u32,
    pub exhaustions: u32,
    pub in_use: u8,
    pub dead: u8,
}

/// Outcome of one slot validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotSweep {
    pub checked: u32,
    pub repaired: u32,
    pub quarantined: u32,
    /// Dead slots after the pass (for the half-pool refusal rule).
    pub dead_total: u32,
}

/// The bounce pool.
///
/// Construct with [`BouncePool::new`], place it somewhere stable, then
/// call [`BouncePool::init`] exactly once with the storage's physical
/// base before any reservation.
pub struct BouncePool {
    data: UnsafeCell<[u8; BOUNCE_SLOTS * SLOT_SIZE]>,
    state: IrqCell<PoolState>,
}

// Safety: `data` is only touched through reserved-slot accessors while a
// reservation pins the slot, and metadata is only reachable inside the
// cell's critical sections.
unsafe impl Send for BouncePool {}
unsafe impl Sync for BouncePool {}

impl BouncePool {
    pub const fn new() -> Self {
        Self {
            data: UnsafeCell::new([0; BOUNCE_SLOTS * SLOT_SIZE]),
            state: IrqCell::new(PoolState {
                slots: [SlotMeta::vacant(); BOUNCE_SLOTS],
                initialized: false,
                reserves: 0,
                releases: 0,
                exhaustions: 0,
            }),
        }
    }

    /// Arm the pool: compute per-slot physical addresses and install
    /// protection. `phys_base` is the storage's device-visible address.
    ///
    /// Fails when any slot would leave the ISA range or cross a 64 KB
    /// boundary; the pool must be placed so neither can happen.
    pub fn init(&self, phys_base: PhysAddr) -> Result<()> {
        self.state.with(|st| {
            if st.initialized {
                return Err(Error::InvalidParam);
            }
            for (i, meta) in st.slots.iter_mut().enumerate() {
                let phys = phys_base.add((i * SLOT_SIZE) as u32);
                if !phys.isa_reachable(SLOT_SIZE as u32) {
                    return Err(Error::InvalidParam);
                }
                if phys.crosses_64k(SLOT_SIZE as u32) {
                    return Err(Error::BoundaryViolation);
                }
                *meta = SlotMeta {
                    signature: SLOT_SIGNATURE,
                    front_canary: CANARY_FRONT,
                    phys,
                    in_use: false,
                    dead: false,
                    purpose: Purpose::Tx,
                    use_count: 0,
                    checksum: 0,
                    rear_canary: CANARY_REAR,
                };
                meta.rearm();
            }
            st.initialized = true;
            Ok(())
        })?;
        info!(
            "[POOL] {} slots of {} bytes at {:#x}",
            BOUNCE_SLOTS,
            SLOT_SIZE,
            phys_base.raw()
        );
        Ok(())
    }

    /// First-fit reservation. O(N) over a small pool, under a critical
    /// section; validates slot integrity before issuing.
    pub fn reserve(&self, len: usize, purpose: Purpose) -> Result<SlotId> {
        if len == 0 {
            return Err(Error::InvalidParam);
        }
        if len > SLOT_SIZE {
            return Err(Error::BufferTooLarge);
        }
        self.state.with(|st| {
            if !st.initialized {
                return Err(Error::InvalidParam);
            }
            for i in 0..BOUNCE_SLOTS {
                let meta = &mut st.slots[i];
                if meta.dead || meta.in_use {
                    continue;
                }
                if !meta.is_intact() {
                    warn!("[POOL] slot {} failed pre-issue validation", i);
                    meta.dead = true;
                    meta.rearm();
                    continue;
                }
                meta.in_use = true;
                meta.purpose = purpose;
                meta.use_count += 1;
                meta.rearm();
                st.reserves += 1;
                return Ok(SlotId(i as u8));
            }
            st.exhaustions += 1;
            Err(Error::BounceExhausted)
        })
    }

    /// Return a slot. Contents are not cleared. Releasing a slot that is
    /// not reserved is a detected bug, never a silent double-free.
    pub fn release(&self, id: SlotId) -> Result<()> {
        self.state.with(|st| {
            let meta = st.slots.get_mut(id.index()).ok_or(Error::InvalidParam)?;
            if !meta.in_use {
                warn!("[POOL] double release of slot {}", id.index());
                return Err(Error::IntegrityViolation);
            }
            if !meta.is_intact() {
                meta.dead = true;
                meta.in_use = false;
                meta.rearm();
                return Err(Error::IntegrityViolation);
            }
            meta.in_use = false;
            meta.rearm();
            st.releases += 1;
            Ok(())
        })
    }

    /// Device-visible address of a slot.
    pub fn slot_phys(&self, id: SlotId) -> Result<PhysAddr> {
        self.state.with(|st| {
            st.slots
                .get(id.index())
                .map(|meta| meta.phys)
                .ok_or(Error::InvalidParam)
        })
    }

    /// CPU-visible address of a slot's storage.
    pub fn slot_virt(&self, id: SlotId) -> usize {
        self.data.get() as usize + id.index() * SLOT_SIZE
    }

    /// CPU-visible base of the whole storage block (for bus mapping).
    pub fn storage_base(&self) -> usize {
        self.data.get() as usize
    }

    /// Copy caller data into a reserved slot.
    pub fn copy_in(&self, id: SlotId, data: &[u8]) -> Result<()> {
        if data.len() > SLOT_SIZE {
            return Err(Error::BufferTooLarge);
        }
        self.check_reserved(id)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.slot_virt(id) as *mut u8,
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes out of a reserved slot.
    pub fn copy_out(&self, id: SlotId, out: &mut [u8], len: usize) -> Result<()> {
        if len > SLOT_SIZE || len > out.len() {
            return Err(Error::BufferTooLarge);
        }
        self.check_reserved(id)?;
        unsafe {
            core::ptr::copy_nonoverlapping(self.slot_virt(id) as *const u8, out.as_mut_ptr(), len);
        }
        Ok(())
    }

    fn check_reserved(&self, id: SlotId) -> Result<()> {
        self.state.with(|st| {
            let meta = st.slots.get(id.index()).ok_or(Error::InvalidParam)?;
            if !meta.in_use || meta.dead {
                return Err(Error::InvalidParam);
            }
            Ok(())
        })
    }

    /// Validate every slot. Idle corrupt slots are repaired by
    /// re-initializing protection when `repair_idle`; in-use corrupt
    /// slots are marked dead and leaked.
    pub fn validate_slots(&self, repair_idle: bool) -> SlotSweep {
        self.state.with(|st| {
            let mut sweep = SlotSweep::default();
            if !st.initialized {
                return sweep;
            }
            for (i, meta) in st.slots.iter_mut().enumerate() {
                sweep.checked += 1;
                if meta.is_intact() {
                    if meta.dead {
                        sweep.dead_total += 1;
                    }
                    continue;
                }
                if !meta.in_use && repair_idle {
                    meta.signature = SLOT_SIGNATURE;
                    meta.front_canary = CANARY_FRONT;
                    meta.rear_canary = CANARY_REAR;
                    meta.dead = false;
                    meta.rearm();
                    sweep.repaired += 1;
                    warn!("[POOL] repaired idle slot {}", i);
                } else {
                    meta.dead = true;
                    meta.rearm();
                    sweep.quarantined += 1;
                    sweep.dead_total += 1;
                    warn!("[POOL] quarantined slot {}", i);
                }
            }
            sweep
        })
    }

    pub fn stats(&self) -> BounceStats {
        self.state.with(|st| BounceStats {
            reserves: st.reserves,
            releases: st.releases,
            exhaustions: st.exhaustions,
            in_use: st.slots.iter().filter(|s| s.in_use).count() as u8,
            dead: st.slots.iter().filter(|s| s.dead).count() as u8,
        })
    }

    /// Corrupt a slot's armor in place. Test scaffolding for the
    /// integrity sweep paths.
    #[doc(hidden)]
    pub fn debug_scramble_slot(&self, id: SlotId) {
        self.state.with(|st| {
            if let Some(meta) = st.slots.get_mut(id.index()) {
                meta.checksum ^= 0xFFFF;
            }
        });
    }
}

impl Default for BouncePool {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
