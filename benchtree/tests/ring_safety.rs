//! Slot reuse under a delayed-completion model.
//!
//! Every acquired slot is stamped with the id of the operation using it. The
//! operation completes `delay` acquisitions later and must find its stamp
//! intact; a later acquisition handing out the same cell would overwrite it.

use std::collections::VecDeque;

use benchtree::arena::{
    ArenaGeometry, MAX_INFLIGHT_CAS, MAX_INFLIGHT_PAGE, MAX_INFLIGHT_SIBLING, ScratchArena, Slot,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Cas,
    Page,
    Sibling,
}

fn acquire(arena: &ScratchArena, kind: Kind) -> Slot<'_> {
    match kind {
        Kind::Cas => arena.acquire_cas_slot(),
        Kind::Page => arena.acquire_page_slot(),
        Kind::Sibling => arena.acquire_sibling_slot(),
    }
}

/// Run operations with the given completion delays (in later acquisitions
/// of the same kind); returns the ids whose stamp was clobbered.
fn run_model(arena: &ScratchArena, kind: Kind, delays: &[usize]) -> Vec<u64> {
    struct Pending<'a> {
        id: u64,
        slot: Slot<'a>,
        due: usize,
    }
    let mut inflight: VecDeque<Pending> = VecDeque::new();
    let mut clobbered = Vec::new();

    let mut settle = |inflight: &mut VecDeque<Pending>, step: usize| {
        inflight.retain(|p| {
            if p.due > step {
                return true;
            }
            if p.slot.read_u64() != p.id {
                clobbered.push(p.id);
            }
            false
        });
    };

    for (step, delay) in delays.iter().copied().enumerate() {
        settle(&mut inflight, step);
        let slot = acquire(arena, kind);
        let id = step as u64 + 1;
        slot.write_u64(id);
        inflight.push_back(Pending {
            id,
            slot,
            due: step + delay,
        });
    }
    settle(&mut inflight, usize::MAX);
    drop(settle);
    clobbered
}

fn small() -> ArenaGeometry {
    ArenaGeometry {
        cas_slots: 8,
        page_slots: 8,
        sibling_slots: 4,
        page_size: 64,
    }
}

proptest! {
    #[test]
    fn prop_no_aliasing_within_depth(
        kind in prop_oneof![Just(Kind::Cas), Just(Kind::Page), Just(Kind::Sibling)],
        seed_delays in prop::collection::vec(0usize..64, 1..200),
    ) {
        let geometry = small();
        let depth = match kind {
            Kind::Cas => geometry.cas_slots,
            Kind::Page => geometry.page_slots,
            Kind::Sibling => geometry.sibling_slots,
        };
        // An operation stays in flight for at most depth - 1 acquisitions.
        let delays: Vec<usize> = seed_delays.iter().map(|d| d % depth).collect();
        let arena = ScratchArena::with_geometry(geometry, geometry.span());
        prop_assert!(run_model(&arena, kind, &delays).is_empty());
    }

    #[test]
    fn prop_default_depths_cover_max_inflight(
        delays in prop::collection::vec(0usize..=MAX_INFLIGHT_SIBLING, 1..300),
    ) {
        let arena = ScratchArena::new();
        let scale = |max: usize| -> Vec<usize> {
            delays.iter().map(|d| d * max / MAX_INFLIGHT_SIBLING).collect()
        };
        let (cas, page) = (scale(MAX_INFLIGHT_CAS), scale(MAX_INFLIGHT_PAGE));
        prop_assert!(run_model(&arena, Kind::Cas, &cas).is_empty());
        prop_assert!(run_model(&arena, Kind::Page, &page).is_empty());
        prop_assert!(run_model(&arena, Kind::Sibling, &delays).is_empty());
    }
}

#[test]
fn test_window_beyond_depth_aliases() {
    let geometry = small();
    let arena = ScratchArena::with_geometry(geometry, geometry.span());
    // The first operation outlives a full lap of the ring.
    let mut delays = vec![geometry.page_slots + 1];
    delays.extend(std::iter::repeat_n(0, geometry.page_slots + 1));
    let clobbered = run_model(&arena, Kind::Page, &delays);
    assert_eq!(clobbered, vec![1]);
}

#[test]
fn test_window_at_depth_minus_one_is_safe() {
    let geometry = small();
    let arena = ScratchArena::with_geometry(geometry, geometry.span());
    let delays = vec![geometry.cas_slots - 1; 64];
    assert!(run_model(&arena, Kind::Cas, &delays).is_empty());
}
