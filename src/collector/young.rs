//! The young-generation mark-compact collector (MMC): the full pipeline
//! specialized for the nursery.
//!
//! Grey is the young "marked" state, which lets young mark metadata coexist
//! with the full collector's Black bits on shared structures; marked objects
//! are blackened in bulk just before evacuation so the evacuator and sweeper
//! can reuse the full collector's liveness test. Roots are the strong roots
//! minus the old generation, plus the OLD_TO_NEW remembered set.

use crate::collector::clearing::prune_weak_list;
use crate::collector::evacuation::{
    promote_page_to_old, EvacuationItem, EvacuationMode, Evacuator,
};
use crate::collector::update;
use crate::collector::AbortedEvacuation;
use crate::heap::page::flags;
use crate::heap::remembered_set::RememberedSetClass;
use crate::heap::space::SpaceId;
use crate::heap::sweeper::{SweepMode, Sweeper};
use crate::heap::Heap;
use crate::object::map::external_string_layout;
use crate::object::visit::{read_typed_slot, visit_body, BodyVisitor};
use crate::object::{ObjectRef, PageId, TaggedValue};
use crate::roots::{iterate_roots, RootVisitor, SkipRoots};
use crate::scheduler::worklist::{Worklist, WorklistLocal};
use crate::scheduler::{ClaimCounter, Job, JobDelegate, WorkerPool};
use crate::util::constants::{MAX_YOUNG_MARKING_TASKS, WORD_BYTES};
use crate::util::options::Options;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct MinorMarkCompactCollector {
    pub options: Arc<Options>,
    pool: WorkerPool,
    marking: Worklist<ObjectRef>,
    aborted: Mutex<Vec<AbortedEvacuation>>,
}

impl MinorMarkCompactCollector {
    pub fn new(options: Arc<Options>) -> MinorMarkCompactCollector {
        let pool = WorkerPool::new((*options.threads).min(MAX_YOUNG_MARKING_TASKS));
        MinorMarkCompactCollector {
            options,
            pool,
            marking: Worklist::new(),
            aborted: Mutex::new(Vec::new()),
        }
    }

    /// Run one young-generation collection.
    pub fn collect_garbage(&mut self, heap: &Heap, sweeper: &Sweeper) {
        self.prepare(heap);
        self.mark_young_objects(heap);
        self.clear_young_references(heap);
        let items = self.evacuate(heap);
        self.update_pointers(heap);
        self.epilogue(heap, sweeper, &items);
    }

    fn prepare(&mut self, heap: &Heap) {
        debug_assert!(self.marking.is_empty());
        for space in [SpaceId::New, SpaceId::NewLarge] {
            for page_id in heap.space(space).page_ids() {
                let page = heap.page(page_id);
                page.bitmap.clear();
                page.set_live_bytes(0);
                page.clear_flag(flags::PAGE_NEW_TO_NEW | flags::PAGE_NEW_TO_OLD);
            }
        }
    }

    fn mark_young_objects(&mut self, heap: &Heap) {
        // Seed from the strong roots, old generation excluded.
        {
            let mut local = self.marking.local();
            let mut live = HashMap::new();
            let mut visitor = YoungRootVisitor {
                heap,
                marking: &mut local,
                live_bytes: &mut live,
            };
            iterate_roots(heap, &mut visitor, SkipRoots::NONE);
            flush_live_bytes(heap, &live);
        }

        // OLD_TO_NEW chunks are marking items; workers accumulate per-page
        // live bytes locally and flush once at the end.
        let chunks: Vec<PageId> = heap
            .all_page_ids()
            .into_iter()
            .filter(|page_id| {
                let page = heap.page(*page_id);
                !page.space().is_young()
                    && (!page.slot_set(RememberedSetClass::OldToNew).is_empty()
                        || !page.typed_slot_set(RememberedSetClass::OldToNew).is_empty())
            })
            .collect();
        let concurrency = if *self.options.parallel_marking {
            self.pool.worker_count()
        } else {
            1
        };
        let chunk_count = chunks.len();
        let job = YoungMarkingJob {
            heap,
            worklist: &self.marking,
            chunks,
            claim: ClaimCounter::new(chunk_count),
            idle: AtomicUsize::new(0),
            concurrency,
        };
        self.pool.run_job(&job);
        debug_assert!(self.marking.is_empty());

        // Blacken the survivors so the shared evacuator and sweeper see them.
        for space in [SpaceId::New, SpaceId::NewLarge] {
            for page_id in heap.space(space).page_ids() {
                let page = heap.page(page_id);
                heap.iterate_page_objects(page_id, |obj, _map, _size| {
                    if page.bitmap.is_grey(obj.word_index()) {
                        page.bitmap.grey_to_black(obj.word_index());
                    }
                });
            }
        }
    }

    /// Only the young-side external string table and a young weak-retainer
    /// traversal run; the internalized table lives in old space.
    fn clear_young_references(&mut self, heap: &Heap) {
        {
            let mut strings = heap.young_external_strings.lock().unwrap();
            strings.retain(|string| {
                if heap.is_marked(*string) {
                    return true;
                }
                let resource = heap
                    .read_slot(*string, external_string_layout::RESOURCE)
                    .as_smi();
                let freed = heap.external_resources.finalize(resource as usize);
                heap.space(heap.space_of(*string)).sub_external_bytes(freed);
                false
            });
        }
        let head = heap.allocation_sites_head();
        let is_live = |site: ObjectRef| !heap.in_young(site) || heap.is_marked(site);
        let new_head = prune_weak_list(heap, head, &is_live);
        heap.set_allocation_sites_head(new_head);
    }

    fn evacuate(&mut self, heap: &Heap) -> Vec<EvacuationItem> {
        let mut items = Vec::new();
        for page_id in heap.space(SpaceId::New).page_ids() {
            let page = heap.page(page_id);
            let live_pct = page.live_bytes() * 100 / page.area_bytes();
            let mode = if *self.options.page_promotion
                && page.live_bytes() > 0
                && live_pct >= *self.options.page_promotion_threshold
            {
                if page.has_flag(flags::NEW_BELOW_AGE_MARK) {
                    EvacuationMode::PageNewToOld
                } else {
                    EvacuationMode::PageNewToNew
                }
            } else {
                EvacuationMode::ObjectsNewToOld
            };
            items.push(EvacuationItem { page: page_id, mode });
        }

        if *self.options.minor_mc_trace_fragmentation {
            for item in &items {
                let page = heap.page(item.page);
                info!(
                    "young page {}: {:?}, {} live of {} bytes",
                    item.page,
                    item.mode,
                    page.live_bytes(),
                    page.area_bytes()
                );
            }
        }

        // Live young large objects promote in place before pointers are
        // updated.
        for page_id in heap.space(SpaceId::NewLarge).page_ids() {
            if heap.page(page_id).live_bytes() > 0 {
                promote_page_to_old(heap, page_id);
            }
        }

        // Nursery evacuation is all-or-nothing: a failed promotion is fatal,
        // so a single pass (parallelized by the shared evacuator elsewhere)
        // suffices here.
        let mut evacuator = Evacuator::new(heap, &self.options, &self.aborted);
        for item in &items {
            evacuator.evacuate_page(*item);
        }
        evacuator.finalize();
        debug_assert!(self.aborted.lock().unwrap().is_empty());
        items
    }

    fn update_pointers(&mut self, heap: &Heap) {
        update::update_roots(heap);
        let chunks: Vec<PageId> = heap
            .all_page_ids()
            .into_iter()
            .filter(|page_id| heap.page(*page_id).has_recorded_slots())
            .collect();
        let count = chunks.len();
        let job = YoungPointerUpdateJob {
            heap,
            chunks,
            claim: ClaimCounter::new(count),
            parallel: *self.options.parallel_pointer_update,
        };
        self.pool.run_job(&job);
        update::update_new_to_new_pages(heap);
        update::update_external_string_table(heap);
        update::update_ephemeron_remembered_set(heap, false);
    }

    fn epilogue(&mut self, heap: &Heap, sweeper: &Sweeper, items: &[EvacuationItem]) {
        let sweep_mode = if *self.options.minor_mc_sweeping {
            SweepMode::Lazy
        } else {
            SweepMode::Eager
        };
        for item in items {
            let page = heap.page(item.page);
            match item.mode {
                EvacuationMode::PageNewToNew => {
                    page.clear_flag(flags::PAGE_NEW_TO_NEW);
                    page.set_flag(flags::NEW_BELOW_AGE_MARK);
                    page.set_allocated_bytes(page.live_bytes());
                }
                EvacuationMode::ObjectsNewToOld => {
                    // Residual from-space pages are relinquished.
                    heap.release_page(item.page);
                }
                EvacuationMode::PageNewToOld => {
                    sweeper.add_page(heap, page.space(), item.page, sweep_mode);
                }
                EvacuationMode::ObjectsOldToOld => unreachable!("not a young mode"),
            }
        }

        // Dead young large objects are released; the live ones promoted
        // before pointer updates.
        for page_id in heap.space(SpaceId::NewLarge).page_ids() {
            debug_assert_eq!(heap.page(page_id).live_bytes(), 0);
            heap.release_page(page_id);
        }

        // The nursery's age mark is the post-evacuation allocation top.
        let new_space = heap.space(SpaceId::New);
        new_space.set_age_mark(heap.new_space_top_packed());
    }
}

fn flush_live_bytes(heap: &Heap, live: &HashMap<PageId, usize>) {
    for (page_id, bytes) in live {
        heap.page(*page_id).add_live_bytes(*bytes);
    }
}

fn try_mark_young(
    heap: &Heap,
    target: ObjectRef,
    marking: &mut WorklistLocal<'_, ObjectRef>,
    live_bytes: &mut HashMap<PageId, usize>,
) {
    if !heap.in_young(target) || heap.instance_kind(target).is_filler() {
        return;
    }
    let page = heap.page(target.page());
    if page.bitmap.attempt_white_to_grey(target.word_index()) {
        let size = heap.object_size_words(target) as usize * WORD_BYTES;
        *live_bytes.entry(target.page()).or_insert(0) += size;
        marking.push(target);
    }
}

struct YoungRootVisitor<'a, 'h> {
    heap: &'h Heap,
    marking: &'a mut WorklistLocal<'h, ObjectRef>,
    live_bytes: &'a mut HashMap<PageId, usize>,
}

impl RootVisitor for YoungRootVisitor<'_, '_> {
    fn visit_root_slot(&mut self, slot: &mut TaggedValue) {
        if slot.is_strong() {
            if let Some(target) = slot.to_object() {
                try_mark_young(self.heap, target, self.marking, self.live_bytes);
            }
        }
    }

    fn visit_immovable_root(&mut self, _obj: ObjectRef) {
        // Well-knowns are never young.
    }
}

struct YoungBodyVisitor<'a, 'h> {
    heap: &'h Heap,
    marking: &'a mut WorklistLocal<'h, ObjectRef>,
    live_bytes: &'a mut HashMap<PageId, usize>,
}

impl YoungBodyVisitor<'_, '_> {
    fn mark_slot(&mut self, host: ObjectRef, index: u32) {
        let value = self.heap.read_slot(host, index);
        if value.is_strong() {
            if let Some(target) = value.to_object() {
                try_mark_young(self.heap, target, self.marking, self.live_bytes);
            }
        }
    }
}

impl BodyVisitor for YoungBodyVisitor<'_, '_> {
    fn visit_strong(&mut self, host: ObjectRef, index: u32) {
        self.mark_slot(host, index);
    }

    fn visit_weak(&mut self, host: ObjectRef, index: u32) {
        // Weak edges never retain nursery objects; dead referents are
        // cleared by the update walk.
        let _ = (host, index);
    }

    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32) {
        use crate::object::map::ephemeron_layout;
        // The young collector treats ephemeron values conservatively; the
        // next full cycle applies the precise fixpoint.
        self.mark_slot(table, ephemeron_layout::value_index(entry));
    }

    fn visit_typed(&mut self, code: ObjectRef, _kind: crate::object::map::TypedSlotKind, body_offset: u32) {
        let target = read_typed_slot(self.heap, code, body_offset);
        if target.raw() != 0 {
            try_mark_young(self.heap, target, self.marking, self.live_bytes);
        }
    }
}

/// Parallel young marking: OLD_TO_NEW chunks seed the closure, then workers
/// drain the shared worklist with the idle-counter termination protocol.
struct YoungMarkingJob<'c> {
    heap: &'c Heap,
    worklist: &'c Worklist<ObjectRef>,
    chunks: Vec<PageId>,
    claim: ClaimCounter,
    idle: AtomicUsize,
    concurrency: usize,
}

impl YoungMarkingJob<'_> {
    fn seed_from_chunk(
        &self,
        page_id: PageId,
        marking: &mut WorklistLocal<'_, ObjectRef>,
        live_bytes: &mut HashMap<PageId, usize>,
    ) {
        let heap = self.heap;
        let page = heap.page(page_id);
        page.slot_set(RememberedSetClass::OldToNew).iterate(|word| {
            let value = TaggedValue::from_bits(page.read_word(word));
            if value.is_strong() {
                if let Some(target) = value.to_object() {
                    if heap.in_young(target) {
                        try_mark_young(heap, target, marking, live_bytes);
                    }
                }
            }
        });
        page.typed_slot_set(RememberedSetClass::OldToNew)
            .iterate_and_filter(|slot| {
                let target = ObjectRef::from_raw(page.read_word(slot.offset) as u32);
                if target.raw() != 0 && heap.in_young(target) {
                    try_mark_young(heap, target, marking, live_bytes);
                }
                crate::heap::remembered_set::SlotVerdict::Keep
            });
    }
}

impl Job for YoungMarkingJob<'_> {
    fn run(&self, _delegate: &JobDelegate) {
        let heap = self.heap;
        let mut marking = self.worklist.local();
        let mut live_bytes: HashMap<PageId, usize> = HashMap::new();

        while let Some(index) = self.claim.claim() {
            self.seed_from_chunk(self.chunks[index], &mut marking, &mut live_bytes);
        }

        loop {
            while let Some(obj) = marking.pop() {
                let map = heap.map_of(obj);
                let mut visitor = YoungBodyVisitor {
                    heap,
                    marking: &mut marking,
                    live_bytes: &mut live_bytes,
                };
                visit_body(heap, obj, map, &mut visitor);
            }
            marking.publish();
            self.idle.fetch_add(1, Ordering::AcqRel);
            loop {
                if !self.worklist.is_empty() {
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
                if self.idle.load(Ordering::Acquire) == self.concurrency {
                    flush_live_bytes(heap, &live_bytes);
                    return;
                }
                std::thread::yield_now();
            }
        }
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        self.concurrency.min(worker_count).min(MAX_YOUNG_MARKING_TASKS)
    }
}

struct YoungPointerUpdateJob<'c> {
    heap: &'c Heap,
    chunks: Vec<PageId>,
    claim: ClaimCounter,
    parallel: bool,
}

impl Job for YoungPointerUpdateJob<'_> {
    fn run(&self, delegate: &JobDelegate) {
        while let Some(index) = self.claim.claim() {
            update::update_chunk(self.heap, self.chunks[index]);
            delegate.yield_now();
        }
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        if !self.parallel {
            return 1;
        }
        worker_count
            .min(crate::util::constants::MAX_POINTER_UPDATE_TASKS)
            .min(self.chunks.len().max(1))
    }
}
