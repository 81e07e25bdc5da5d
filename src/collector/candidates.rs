//! Fragmentation-driven selection of evacuation candidate pages.

use crate::collector::MarkCompactCollector;
use crate::heap::page::flags;
use crate::heap::space::{SpaceId, StackState};
use crate::heap::Heap;
use crate::object::PageId;
use crate::util::constants::{
    MAX_EVACUATED_BYTES, MAX_EVACUATED_BYTES_MEMORY_REDUCING, MIN_CANDIDATE_FRAGMENTATION_PCT,
    PAGE_BYTES, TARGET_PAGE_EVACUATION_MICROS,
};
use itertools::Itertools;
use rand::Rng;

pub fn select_evacuation_candidates(collector: &mut MarkCompactCollector, heap: &Heap) {
    debug_assert!(collector.evacuation_candidates.is_empty());

    let options = &collector.options;
    let stack_present = heap.stack_state() == StackState::MayContainHeapPointers;
    if stack_present && !*options.compact_with_stack {
        return;
    }

    let mut spaces = vec![SpaceId::Old];
    if *options.compact_maps {
        spaces.push(SpaceId::Map);
    }
    if *options.compact_code_space && (!stack_present || *options.compact_code_space_with_stack) {
        spaces.push(SpaceId::Code);
    }

    // Candidate thresholds. Memory-reducing mode uses fixed constants; the
    // adaptive mode derives a target fragmentation from measured compaction
    // speed so evacuating one page costs about half a millisecond.
    let (quota, threshold_pct) = if *options.compact_on_every_full_gc {
        (usize::MAX, 0)
    } else if *options.reduce_memory {
        (
            MAX_EVACUATED_BYTES_MEMORY_REDUCING,
            MIN_CANDIDATE_FRAGMENTATION_PCT,
        )
    } else {
        let threshold = match collector.compaction_speed.bytes_per_micro() {
            Some(speed) if speed > 0 => {
                let max_live = speed * TARGET_PAGE_EVACUATION_MICROS;
                let max_live_pct = (max_live * 100 / PAGE_BYTES).min(100);
                (100 - max_live_pct).max(MIN_CANDIDATE_FRAGMENTATION_PCT)
            }
            _ => MIN_CANDIDATE_FRAGMENTATION_PCT,
        };
        (MAX_EVACUATED_BYTES, threshold)
    };

    let mut selected: Vec<PageId> = Vec::new();
    let mut total_live = 0usize;

    for space_id in spaces {
        let eligible: Vec<PageId> = heap
            .space(space_id)
            .page_ids()
            .into_iter()
            .filter(|page_id| {
                let page = heap.page(*page_id);
                !page.has_flag(flags::PINNED)
                    && !page.has_flag(flags::NEVER_EVACUATE)
                    && !page.is_large()
                    && heap.space(space_id).allocation_page() != Some(*page_id)
            })
            .collect();

        let chosen: Vec<PageId> = if *options.manual_evacuation_candidates_selection {
            eligible
                .into_iter()
                .filter(|p| heap.page(*p).has_flag(flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING))
                .collect()
        } else if *options.stress_compaction {
            eligible.into_iter().enumerate().filter(|(i, _)| i % 2 == 0).map(|(_, p)| p).collect()
        } else if *options.stress_compaction_random {
            let mut rng = rand::rng();
            eligible.into_iter().filter(|_| rng.random_bool(0.5)).collect()
        } else {
            // Score by allocated bytes, most-fragmented-first is implied by
            // accepting the least-allocated pages up to the byte quota.
            let sorted = eligible
                .into_iter()
                .filter(|p| heap.page(*p).fragmentation_pct() >= threshold_pct)
                .sorted_by_key(|p| heap.page(*p).allocated_bytes());
            let mut accepted = Vec::new();
            for page_id in sorted {
                let live = heap.page(page_id).allocated_bytes();
                if total_live + live > quota {
                    break;
                }
                total_live += live;
                accepted.push(page_id);
            }
            accepted
        };

        if *options.trace_fragmentation {
            for page_id in &chosen {
                let page = heap.page(*page_id);
                info!(
                    "candidate page {} in {:?}: {}% free, {} bytes allocated",
                    page_id,
                    space_id,
                    page.fragmentation_pct(),
                    page.allocated_bytes()
                );
            }
        }
        selected.extend(chosen);
    }

    // If evacuation would not actually compact (no page released), skip it.
    // Test modes force their set through regardless.
    let test_mode = *options.manual_evacuation_candidates_selection
        || *options.stress_compaction
        || *options.stress_compaction_random;
    let live_total: usize = selected.iter().map(|p| heap.page(*p).allocated_bytes()).sum();
    let released = selected.len() as isize - live_total.div_ceil(PAGE_BYTES) as isize;
    if !selected.is_empty() && released <= 0 && !test_mode && !*options.compact_on_every_full_gc {
        if *options.trace_evacuation_candidates {
            info!(
                "dropping {} candidates: evacuation would release no pages",
                selected.len()
            );
        }
        selected.clear();
    }

    for page_id in &selected {
        heap.page(*page_id).set_flag(flags::EVACUATION_CANDIDATE);
    }
    if *options.trace_evacuation_candidates {
        info!(
            "selected {} evacuation candidates ({} live bytes)",
            selected.len(),
            live_total
        );
    }
    collector.evacuation_candidates = selected;
}
