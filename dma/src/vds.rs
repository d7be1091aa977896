//! Virtual DMA Services facade.
//!
//! "Lock this buffer and tell me its physical layout", uniformly, whether
//! the machine is in pure real mode or sitting under a V86 memory manager.
//! The legacy INT 4Bh interface never escapes this module.
//!
//! # Contract
//!
//! Between `lock` and `unlock` the physical addresses in the returned
//! scatter/gather list are valid and pinned; the underlying pages will not
//! be relocated. In pure real mode `lock` yields a single segment whose
//! physical address is the flat-linear translation of the virtual base;
//! regions past the 1 MiB + 64 KiB real-mode limit fail. Under V86 without
//! the service every `lock` fails and callers must fall back to a
//! pre-translated bounce buffer.
//!
//! # Reference
//! Virtual DMA Services Specification 1.0 (INT 4Bh, AX=81xxh)

use bitflags::bitflags;

use crate::addr::{PhysAddr, VirtRegion, REAL_MODE_LIMIT};
use crate::sg::SgList;

bitflags! {
    /// Options for a lock request, derived from device caps.
    pub struct VdsFlags: u16 {
        /// No returned run may cross a 64 KB physical boundary.
        const NO_CROSS_64K = 1 << 0;
        /// The whole region must come back as one physical run.
        const CONTIGUOUS   = 1 << 1;
    }
}

/// Failures of the lock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdsError {
    /// No service responded to the presence check.
    Unavailable,
    /// The host refused to lock (page not present / not writable).
    NotLockable,
    /// Physical layout needs more runs than a lock can carry.
    TooFragmented,
    /// Region cannot be described by the service at all.
    RegionTooLarge,
}

/// A pinned region: pass `handle` back to [`VdsBackend::unlock`].
#[derive(Debug, Clone)]
pub struct VdsLock {
    pub handle: u16,
    pub sg: SgList,
}

/// Physical-layout provider. One implementation per address regime.
pub trait VdsBackend {
    /// Did the service answer its presence check?
    fn available(&self) -> bool;

    /// Pin `region` and return its physical layout.
    fn lock(&self, region: VirtRegion, flags: VdsFlags) -> Result<VdsLock, VdsError>;

    /// Release a pinned region. Unknown handles are ignored.
    fn unlock(&self, handle: u16);

    /// Flat translation of an (unpinned) region's base address.
    ///
    /// `None` when the region is not physically contiguous in this
    /// regime or lies outside it. Real mode answers for everything below
    /// the 1 MiB + 64 KiB line; a V86 host answers for nothing.
    fn translate(&self, region: VirtRegion) -> Option<PhysAddr>;
}

// ═══════════════════════════════════════════════════════════════════════════
// REAL MODE
// ═══════════════════════════════════════════════════════════════════════════

/// Pure real mode: physical address is the linear address, memory is
/// never relocated, so locking is translation.
pub struct RealModeBackend;

impl VdsBackend for RealModeBackend {
    fn available(&self) -> bool {
        // Translation needs no host service
        true
    }

    fn lock(&self, region: VirtRegion, _flags: VdsFlags) -> Result<VdsLock, VdsError> {
        let phys = self.translate(region).ok_or(VdsError::RegionTooLarge)?;
        let mut sg = SgList::new();
        sg.append_split(phys, region.len() as u32, region.addr(), false, false)
            .map_err(|_| VdsError::RegionTooLarge)?;
        Ok(VdsLock { handle: 0, sg })
    }

    fn unlock(&self, _handle: u16) {}

    fn translate(&self, region: VirtRegion) -> Option<PhysAddr> {
        let end = region.addr().checked_add(region.len())?;
        if end > REAL_MODE_LIMIT as usize + 1 {
            return None;
        }
        Some(PhysAddr::new(region.addr() as u32))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// V86 SERVICE
// ═══════════════════════════════════════════════════════════════════════════

/// V86 regime: all layout questions go to the host's DMA service.
///
/// When the host exposes no service, `available()` is false, every lock
/// fails, and `translate` answers nothing; segmented addresses no longer
/// mean anything physically.
pub struct V86Backend;

impl VdsBackend for V86Backend {
    fn available(&self) -> bool {
        hw::vds_present()
    }

    fn lock(&self, region: VirtRegion, flags: VdsFlags) -> Result<VdsLock, VdsError> {
        if !hw::vds_present() {
            return Err(VdsError::Unavailable);
        }
        hw::vds_lock_region(region, flags)
    }

    fn unlock(&self, handle: u16) {
        hw::vds_unlock_region(handle);
    }

    fn translate(&self, _region: VirtRegion) -> Option<PhysAddr> {
        None
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    use super::{VdsError, VdsFlags, VdsLock};
    use crate::addr::VirtRegion;

    // INT 4Bh thunks from the 16-bit stub segment.
    extern "C" {
        fn vds_installation_check() -> u16;
        fn vds_lock_dma_region(base: u32, len: u32, flags: u16, out_dds: *mut u8) -> u16;
        fn vds_unlock_dma_region(handle: u16) -> u16;
    }

    pub fn vds_present() -> bool {
        unsafe { vds_installation_check() != 0 }
    }

    pub fn vds_lock_region(region: VirtRegion, flags: VdsFlags) -> Result<VdsLock, VdsError> {
        // DDS decode lives with the thunk; not ported into this tree yet.
        let _ = (region, flags);
        Err(VdsError::Unavailable)
    }

    pub fn vds_unlock_region(handle: u16) {
        unsafe {
            vds_unlock_dma_region(handle);
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hw {
    use super::{VdsError, VdsFlags, VdsLock};
    use crate::addr::VirtRegion;

    /// Hosted stubs: no V86 host, no service.
    pub fn vds_present() -> bool {
        false
    }

    pub fn vds_lock_region(_region: VirtRegion, _flags: VdsFlags) -> Result<VdsLock, VdsError> {
        Err(VdsError::Unavailable)
    }

    pub fn vds_unlock_region(_handle: u16) {}
}

// ═══════════════════════════════════════════════════════════════════════════
// BUS MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Physical-address-side memory access, as a bus master sees it.
///
/// On hardware this is the identity view the silicon has anyway; the
/// software loopback NIC and the capability tester use it to emulate what
/// a device would read or write at a given physical range.
pub trait BusMemory {
    /// Read `buf.len()` bytes starting at `phys`. False if unmapped.
    fn read_phys(&self, phys: PhysAddr, buf: &mut [u8]) -> bool;

    /// Write `data` starting at `phys`. False if unmapped.
    fn write_phys(&self, phys: PhysAddr, data: &[u8]) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════════
// MAPPED BUS (emulated address space)
// ═══════════════════════════════════════════════════════════════════════════

/// Window table tying a synthetic physical range to CPU-visible storage.
///
/// The emulated counterpart of real mode's identity view: harnesses and
/// capability self-tests register their buffers here, and the software
/// loopback NIC masters "the bus" through it.
pub struct MappedBus {
    windows: etherlink_platform::IrqCell<heapless::Vec<Window, 16>>,
}

#[derive(Clone, Copy)]
struct Window {
    phys: u32,
    virt: usize,
    len: usize,
}

impl MappedBus {
    pub const fn new() -> Self {
        Self { windows: etherlink_platform::IrqCell::new(heapless::Vec::new()) }
    }

    /// Register a window. Later windows may shadow earlier ones; keep
    /// ranges disjoint.
    pub fn map(&self, phys: PhysAddr, virt: usize, len: usize) {
        self.windows.with(|windows| {
            let _ = windows.push(Window { phys: phys.raw(), virt, len });
        });
    }

    /// CPU address backing `[phys, phys+len)`, if one window covers it.
    fn virt_of(&self, phys: PhysAddr, len: usize) -> Option<usize> {
        self.windows.with(|windows| {
            let p = phys.raw() as u64;
            windows
                .iter()
                .find(|w| p >= w.phys as u64 && p + len as u64 <= w.phys as u64 + w.len as u64)
                .map(|w| w.virt + (p - w.phys as u64) as usize)
        })
    }

    /// Synthetic physical address of a CPU range, if registered.
    pub fn phys_of(&self, virt: usize, len: usize) -> Option<PhysAddr> {
        self.windows.with(|windows| {
            windows
                .iter()
                .find(|w| virt >= w.virt && virt + len <= w.virt + w.len)
                .map(|w| PhysAddr::new(w.phys + (virt - w.virt) as u32))
        })
    }
}

impl Default for MappedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusMemory for MappedBus {
    fn read_phys(&self, phys: PhysAddr, buf: &mut [u8]) -> bool {
        match self.virt_of(phys, buf.len()) {
            None => false,
            Some(virt) => {
                unsafe {
                    core::ptr::copy_nonoverlapping(virt as *const u8, buf.as_mut_ptr(), buf.len());
                }
                true
            }
        }
    }

    fn write_phys(&self, phys: PhysAddr, data: &[u8]) -> bool {
        match self.virt_of(phys, data.len()) {
            None => false,
            Some(virt) => {
                unsafe {
                    core::ptr::copy_nonoverlapping(data.as_ptr(), virt as *mut u8, data.len());
                }
                true
            }
        }
    }
}

/// [`VdsBackend`] over a [`MappedBus`] window table: the address regime
/// harnesses run the core under.
pub struct MappedVds<'b>(pub &'b MappedBus);

impl VdsBackend for MappedVds<'_> {
    fn available(&self) -> bool {
        true
    }

    fn lock(&self, region: VirtRegion, _flags: VdsFlags) -> Result<VdsLock, VdsError> {
        let phys = self.translate(region).ok_or(VdsError::NotLockable)?;
        let mut sg = SgList::new();
        sg.append_split(phys, region.len() as u32, region.addr(), false, false)
            .map_err(|_| VdsError::RegionTooLarge)?;
        Ok(VdsLock { handle: 1, sg })
    }

    fn unlock(&self, _handle: u16) {}

    fn translate(&self, region: VirtRegion) -> Option<PhysAddr> {
        self.0.phys_of(region.addr(), region.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
