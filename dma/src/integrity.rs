//! Structural integrity armor.
//!
//! Every mapping descriptor and bounce slot carries a fixed signature,
//! front and rear canaries, and a 16-bit checksum over its other fields.
//! The type system prevents misuse of handles; this layer is the defence
//! for what types cannot cover: hardware scribbling over a descriptor
//! behind our back.

use log::{error, warn};

use crate::bounce::BouncePool;
use crate::mapper::DmaMapper;
use crate::policy::{DmaPolicy, PolicyCell};

// ═══════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════

/// Signature stamped on every live mapping descriptor.
pub const MAPPING_SIGNATURE: u32 = 0x4D41_5031; // "MAP1"

/// Signature stamped on every bounce slot.
pub const SLOT_SIGNATURE: u32 = 0x424E_4331; // "BNC1"

pub const CANARY_FRONT: u32 = 0x5A5A_A5A5;
pub const CANARY_REAR: u32 = 0xA5A5_5A5A;

/// 16-bit structural checksum: CRC-32 folded onto itself.
pub fn checksum16(bytes: &[u8]) -> u16 {
    let h = crc32fast::hash(bytes);
    (h as u16) ^ ((h >> 16) as u16)
}

// ═══════════════════════════════════════════════════════════════════════════
// FIELD DIGEST
// ═══════════════════════════════════════════════════════════════════════════

/// Accumulates a structure's checksummed fields into a flat byte image.
///
/// Capacity covers the largest protected structure (a full-fanout mapping
/// descriptor).
pub struct Digest {
    buf: [u8; 160],
    len: usize,
}

impl Digest {
    pub const fn new() -> Self {
        Self { buf: [0; 160], len: 0 }
    }

    pub fn push_u8(&mut self, v: u8) {
        if self.len < self.buf.len() {
            self.buf[self.len] = v;
            self.len += 1;
        }
    }

    pub fn push_u16(&mut self, v: u16) {
        for b in v.to_le_bytes() {
            self.push_u8(b);
        }
    }

    pub fn push_u32(&mut self, v: u32) {
        for b in v.to_le_bytes() {
            self.push_u8(b);
        }
    }

    pub fn push_usize(&mut self, v: usize) {
        self.push_u32(v as u32);
        self.push_u32((v as u64 >> 32) as u32);
    }

    pub fn finish(&self) -> u16 {
        checksum16(&self.buf[..self.len])
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PERIODIC SWEEP
// ═══════════════════════════════════════════════════════════════════════════

/// Outcome of one integrity pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Structures examined (mappings + slots).
    pub checked: u32,
    /// Idle corrupt slots restored by re-initializing their protection.
    pub repaired: u32,
    /// In-use corrupt descriptors marked dead and leaked.
    pub quarantined: u32,
    /// True when corruption density forced the policy to `Forbid`.
    pub refused: bool,
}

/// Validate every in-use mapping and every bounce slot.
///
/// Conservative by construction: possibly-torn in-use state is never
/// recycled, only leaked. When more than half the pool is corrupt the
/// whole framework stops trusting its own memory and clamps the policy
/// to `Forbid`.
pub fn run_sweep(mapper: &DmaMapper<'_>, pool: &BouncePool, policy: &PolicyCell) -> SweepReport {
    let mut report = SweepReport::default();

    let maps = mapper.validate_active();
    report.checked += maps.checked;
    report.quarantined += maps.quarantined;

    let slots = pool.validate_slots(true);
    report.checked += slots.checked;
    report.repaired += slots.repaired;
    report.quarantined += slots.quarantined;

    if maps.quarantined > 0 || slots.quarantined > 0 {
        warn!(
            "[SWEEP] quarantined {} descriptors",
            maps.quarantined + slots.quarantined
        );
    }

    if slots.dead_total as usize > crate::bounce::BOUNCE_SLOTS / 2 {
        error!("[SWEEP] over half the bounce pool is corrupt, refusing DMA");
        policy.tighten(DmaPolicy::Forbid);
        report.refused = true;
    }

    report
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum16(b"etherlink"), checksum16(b"etherlink"));
        assert_ne!(checksum16(b"etherlink"), checksum16(b"etherlinK"));
    }

    #[test]
    fn test_digest_order_matters() {
        let mut a = Digest::new();
        a.push_u32(1);
        a.push_u32(2);
        let mut b = Digest::new();
        b.push_u32(2);
        b.push_u32(1);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_digest_empty_is_consistent() {
        assert_eq!(Digest::new().finish(), Digest::new().finish());
    }
}
