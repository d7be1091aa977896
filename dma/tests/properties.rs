//! Property-based laws over random buffers, devices, and policies: `map`
//! either returns a mapping satisfying every structural invariant, or one
//! of the closed error kinds. It never panics and never corrupts state.

mod common;

use common::{assert_mapping_invariants, map_buffer, with_core, CoreOpts};
use etherlink_dma::{DeviceId, DmaPolicy, Error};
use proptest::prelude::*;

fn arb_policy() -> impl Strategy<Value = DmaPolicy> {
    prop_oneof![
        Just(DmaPolicy::Auto),
        Just(DmaPolicy::Direct),
        Just(DmaPolicy::BounceOnly),
        Just(DmaPolicy::Forbid),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn map_is_total_and_structurally_sound(
        dev_index in 0usize..4,
        // Anywhere in the low 15 MiB, any sub-page offset
        phys_page in 1u32..0x00F0u32,
        offset in 0u32..4096u32,
        len in 1usize..1514usize,
        policy in arb_policy(),
        registered in proptest::bool::ANY,
    ) {
        let opts = CoreOpts { policy, ..CoreOpts::default() };
        with_core(opts, |core| {
            let devs = [core.devs.isa, core.devs.pcmcia, core.devs.busmaster, core.devs.pci];
            let dev: DeviceId = devs[dev_index];
            let caps = *core.registry.caps(dev).unwrap();

            let mut buf = vec![0u8; len];
            let region = if registered {
                map_buffer(core.bus, phys_page * 0x1_0000 + offset, &mut buf)
            } else {
                etherlink_dma::VirtRegion::from_mut_slice(&mut buf)
            };

            match core.mapper.map_tx(region, dev) {
                Ok(handle) => {
                    let info = core.mapper.info(handle).unwrap();
                    assert_mapping_invariants(&info, &caps);
                    // Total covers the request (equal, or padded to the
                    // device's length granularity through a bounce slot)
                    prop_assert!(info.total_len >= len as u32);
                    prop_assert!(info.total_len <= len as u32 + 3);
                    if policy == DmaPolicy::BounceOnly {
                        prop_assert!(info.uses_bounce);
                    }
                    core.mapper.unmap(handle).unwrap();
                    // Poisoned handle stays poisoned
                    prop_assert_eq!(core.mapper.unmap(handle), Err(Error::InvalidParam));
                }
                Err(e) => {
                    // Closed error set only
                    prop_assert!(matches!(
                        e,
                        Error::InvalidParam
                            | Error::DmaForbidden
                            | Error::DeviceDisabled
                            | Error::BufferTooLarge
                            | Error::BounceExhausted
                            | Error::VdsUnavailable
                            | Error::NonContiguous
                            | Error::BoundaryViolation
                            | Error::AlignmentViolation
                            | Error::Timeout
                            | Error::HardwareFailure
                            | Error::IntegrityViolation
                    ));
                    if policy == DmaPolicy::Forbid {
                        prop_assert_eq!(e, Error::DmaForbidden);
                    }
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn sweeps_over_unchanged_structures_are_quiet(
        lens in proptest::collection::vec(1usize..1400, 1..6),
    ) {
        with_core(CoreOpts::default(), |core| {
            let mut bufs: Vec<Vec<u8>> = lens.iter().map(|&l| vec![0u8; l]).collect();
            let mut handles = Vec::new();
            for (i, buf) in bufs.iter_mut().enumerate() {
                let region = map_buffer(core.bus, 0x0030_0000 + (i as u32) * 0x1_0000, buf);
                handles.push(core.mapper.map_tx(region, core.devs.busmaster).ok());
            }

            // First sweep may observe whatever exists; it must change nothing
            let first = core.mapper.validate_active();
            prop_assert_eq!(first.quarantined, 0);
            let second = core.mapper.validate_active();
            prop_assert_eq!(second.quarantined, 0);
            prop_assert_eq!(first.checked, second.checked);

            let pool_first = core.pool.validate_slots(true);
            let pool_second = core.pool.validate_slots(true);
            prop_assert_eq!(pool_first.repaired + pool_first.quarantined, 0);
            prop_assert_eq!(pool_second.repaired + pool_second.quarantined, 0);

            for handle in handles.into_iter().flatten() {
                core.mapper.unmap(handle).unwrap();
            }
            Ok(())
        })?;
    }

    #[test]
    fn tx_bounce_round_trip_preserves_bytes(
        len in 1usize..1400,
        seed in proptest::num::u8::ANY,
    ) {
        with_core(CoreOpts::default(), |core| {
            let mut buf: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_add(seed)).collect();
            let original = buf.clone();
            // Unregistered: forces the bounce path
            let region = etherlink_dma::VirtRegion::from_mut_slice(&mut buf);

            let handle = core.mapper.map(region, core.devs.isa, etherlink_dma::DmaDirection::Bidirectional).unwrap();
            let info = core.mapper.info(handle).unwrap();
            prop_assert!(info.uses_bounce);
            core.mapper.unmap(handle).unwrap();

            // Copy-in then copy-out is byte-identical
            prop_assert_eq!(&buf, &original);
            Ok(())
        })?;
    }
}
