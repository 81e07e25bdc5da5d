//! The evacuator: parallel page visitors that copy live objects, install
//! forwarding addresses, and record migrated slots; plus the abort recovery
//! and the evacuation epilogue.

use crate::collector::{fatal_out_of_memory, update, AbortedEvacuation, MarkCompactCollector};
use crate::heap::allocator::EvacuationAllocator;
use crate::heap::page::{flags, CodePageWriteScope};
use crate::heap::remembered_set::RememberedSetClass;
use crate::heap::space::SpaceId;
use crate::heap::sweeper::SweepMode;
use crate::heap::Heap;
use crate::object::map::{
    ephemeron_layout, map_kind, object_size_with_map, InstanceKind, TypedSlotKind,
};
use crate::object::visit::{read_typed_slot, visit_body, BodyVisitor};
use crate::object::{MapWord, ObjectRef, PageId};
use crate::scheduler::{ClaimCounter, Job, JobDelegate};
use crate::util::constants::{EVACUATION_PAGES_PER_TASK, WORD_BYTES};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// How a page is processed during evacuation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EvacuationMode {
    /// Copy each Black object into a fresh region of the same space. May be
    /// aborted on allocation failure.
    ObjectsOldToOld,
    /// Promote Black nursery objects into old space (or shared old space for
    /// internalizable strings when a shared string table is active).
    ObjectsNewToOld,
    /// Whole-page promotion into old space; no copies, only slot recording.
    PageNewToOld,
    /// Whole-page promotion within the nursery.
    PageNewToNew,
}

#[derive(Copy, Clone, Debug)]
pub struct EvacuationItem {
    pub page: PageId,
    pub mode: EvacuationMode,
}

pub fn evacuate(collector: &mut MarkCompactCollector, heap: &Heap) {
    let items = prologue(collector, heap);

    let started = Instant::now();
    let copied = copy_in_parallel(collector, heap, &items);
    collector
        .compaction_speed
        .record(copied, started.elapsed().as_micros() as u64);
    if *collector.options.trace_evacuation {
        info!(
            "evacuated {} bytes across {} pages",
            copied,
            items.len()
        );
    }

    update::update_pointers_after_evacuation(collector, heap);
    epilogue(collector, heap, &items);
}

/// Decide the mode of every page that participates in this evacuation.
fn prologue(collector: &MarkCompactCollector, heap: &Heap) -> Vec<EvacuationItem> {
    let options = &collector.options;
    let mut items: Vec<EvacuationItem> = collector
        .evacuation_candidates
        .iter()
        .map(|page| EvacuationItem {
            page: *page,
            mode: EvacuationMode::ObjectsOldToOld,
        })
        .collect();

    for page_id in heap.space(SpaceId::New).page_ids() {
        let page = heap.page(page_id);
        let live_pct = page.live_bytes() * 100 / page.area_bytes();
        let mode = if *options.page_promotion
            && page.live_bytes() > 0
            && live_pct >= *options.page_promotion_threshold
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

    // Live young large objects are promoted in place up front, so the
    // pointer-update phase already sees them in old space.
    for page_id in heap.space(SpaceId::NewLarge).page_ids() {
        if heap.page(page_id).live_bytes() > 0 {
            promote_page_to_old(heap, page_id);
        }
    }
    items
}

struct PageEvacuationJob<'c> {
    collector: &'c MarkCompactCollector,
    heap: &'c Heap,
    items: &'c [EvacuationItem],
    claim: ClaimCounter,
    copied_bytes: AtomicUsize,
    parallel: bool,
}

impl Job for PageEvacuationJob<'_> {
    fn run(&self, delegate: &JobDelegate) {
        let mut evacuator = Evacuator::new(
            self.heap,
            &self.collector.options,
            &self.collector.aborted,
        );
        while let Some(index) = self.claim.claim() {
            evacuator.evacuate_page(self.items[index]);
            delegate.yield_now();
        }
        self.copied_bytes
            .fetch_add(evacuator.copied_bytes, Ordering::Relaxed);
        evacuator.allocator.finalize();
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        if !self.parallel {
            return 1;
        }
        // N = min(ceil(items / pages-per-task), desired task count).
        self.items
            .len()
            .div_ceil(EVACUATION_PAGES_PER_TASK.max(1))
            .min(worker_count)
    }
}

fn copy_in_parallel(
    collector: &MarkCompactCollector,
    heap: &Heap,
    items: &[EvacuationItem],
) -> usize {
    if items.is_empty() {
        return 0;
    }
    let job = PageEvacuationJob {
        collector,
        heap,
        items,
        claim: ClaimCounter::new(items.len()),
        copied_bytes: AtomicUsize::new(0),
        parallel: *collector.options.parallel_compaction,
    };
    collector.pool.run_job(&job);
    job.copied_bytes.load(Ordering::Relaxed)
}

/// A per-worker evacuator with its own allocation buffers.
pub struct Evacuator<'c> {
    heap: &'c Heap,
    options: &'c crate::util::options::Options,
    aborted: &'c std::sync::Mutex<Vec<AbortedEvacuation>>,
    allocator: EvacuationAllocator<'c>,
    copied_bytes: usize,
}

impl<'c> Evacuator<'c> {
    pub fn new(
        heap: &'c Heap,
        options: &'c crate::util::options::Options,
        aborted: &'c std::sync::Mutex<Vec<AbortedEvacuation>>,
    ) -> Evacuator<'c> {
        Evacuator {
            heap,
            options,
            aborted,
            allocator: EvacuationAllocator::new(heap),
            copied_bytes: 0,
        }
    }

    pub fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    pub fn finalize(&mut self) {
        self.allocator.finalize();
    }

    pub fn evacuate_page(&mut self, item: EvacuationItem) {
        match item.mode {
            EvacuationMode::ObjectsOldToOld => self.evacuate_objects(item.page, true),
            EvacuationMode::ObjectsNewToOld => self.evacuate_objects(item.page, false),
            EvacuationMode::PageNewToOld => promote_page_to_old(self.heap, item.page),
            EvacuationMode::PageNewToNew => promote_page_new_to_new(self.heap, item.page),
        }
    }

    /// Walk the page and copy every Black object out. `recoverable` marks
    /// old-to-old evacuation, where allocation failure aborts the page;
    /// nursery promotion failure is fatal.
    fn evacuate_objects(&mut self, page_id: PageId, recoverable: bool) {
        let heap = self.heap;
        let page = heap.page(page_id);
        let source_space = page.space();
        let top = page.top();
        let mut word = 0u32;
        while word < top {
            let obj = ObjectRef::new(page_id, word);
            let map = match heap.map_word(obj) {
                MapWord::Map(map) => map,
                MapWord::Forwarded(to) => {
                    panic!("source {} already forwarded to {}", obj, to)
                }
            };
            let size = object_size_with_map(heap, obj, map);
            if page.bitmap.is_black(word) {
                let target_space = self.target_space_for(obj, map, source_space);
                match self.allocator.allocate(target_space, size) {
                    Ok(dst) => self.migrate_object(obj, dst, map, size),
                    Err(_) if recoverable => {
                        if *self.options.crash_on_aborted_evacuation {
                            fatal_out_of_memory("aborted evacuation escalated by flag");
                        }
                        self.aborted.lock().unwrap().push(AbortedEvacuation {
                            page: page_id,
                            failed_word: word,
                        });
                        trace!("evacuation of page {} aborted at word {}", page_id, word);
                        return;
                    }
                    Err(_) => fatal_out_of_memory("nursery promotion"),
                }
            }
            word += size;
        }
    }

    fn target_space_for(&self, obj: ObjectRef, map: ObjectRef, source_space: SpaceId) -> SpaceId {
        if !source_space.is_young() {
            return source_space;
        }
        if self.heap.shared_string_table && map_kind(self.heap, map).is_internalizable_string() {
            // Internalizable strings promote straight into the shared heap.
            let _ = obj;
            return SpaceId::SharedOld;
        }
        SpaceId::Old
    }

    /// Raw copy, forwarding installation, observers and slot recording.
    fn migrate_object(&mut self, src: ObjectRef, dst: ObjectRef, map: ObjectRef, size: u32) {
        let heap = self.heap;
        let _src_scope = CodePageWriteScope::new(heap.page(src.page()));
        let _dst_scope = CodePageWriteScope::new(heap.page(dst.page()));
        for i in 0..size {
            heap.write_word(dst, i, heap.read_word(src, i));
        }
        heap.set_forwarding(src, dst);
        self.copied_bytes += size as usize * WORD_BYTES;

        // Migration observers.
        heap.incremental_marker.transfer_color(heap, src, dst);

        if map_kind(heap, map) == InstanceKind::Code {
            // Destination code is re-registered; its relocation offsets are
            // object-relative and need no further rebasing.
            heap.page(dst.page()).register_code_object(dst.word_index());
        }

        let mut recorder = RecordMigratedSlotVisitor { heap };
        visit_body(heap, dst, map, &mut recorder);
    }
}

/// Classifies every interior pointer of a migrated (or promoted) object into
/// the remembered sets of its new page.
pub struct RecordMigratedSlotVisitor<'h> {
    pub heap: &'h Heap,
}

impl RecordMigratedSlotVisitor<'_> {
    fn record(&mut self, host: ObjectRef, index: u32) {
        if let Some(target) = self.heap.read_slot(host, index).to_object() {
            self.heap.record_slot(host, index, target);
        }
    }
}

impl BodyVisitor for RecordMigratedSlotVisitor<'_> {
    fn visit_strong(&mut self, host: ObjectRef, index: u32) {
        self.record(host, index);
    }

    fn visit_weak(&mut self, host: ObjectRef, index: u32) {
        self.record(host, index);
    }

    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32) {
        let key_index = ephemeron_layout::key_index(entry);
        self.record(table, key_index);
        self.record(table, ephemeron_layout::value_index(entry));
        // Ephemerons with young keys go to the dedicated remembered set.
        if let Some(key) = self.heap.read_slot(table, key_index).to_object() {
            if self.heap.in_young(key) && !self.heap.in_young(table) {
                self.heap
                    .ephemeron_remembered
                    .lock()
                    .unwrap()
                    .entry(table)
                    .or_default()
                    .insert(entry);
            }
        }
    }

    fn visit_typed(&mut self, code: ObjectRef, kind: TypedSlotKind, body_offset: u32) {
        let target = read_typed_slot(self.heap, code, body_offset);
        if target.raw() != 0 {
            self.heap.record_typed_slot(code, kind, body_offset, target);
        }
    }
}

/// Whole-page promotion out of the nursery: ownership flips, slots are
/// recorded, no object moves.
pub fn promote_page_to_old(heap: &Heap, page_id: PageId) {
    let page = heap.page(page_id);
    let from_space = page.space();
    let to_space = if from_space == SpaceId::NewLarge {
        SpaceId::Large
    } else {
        SpaceId::Old
    };
    heap.space(from_space).remove_page(page_id);
    page.set_space(to_space);
    heap.space(to_space).adopt_page(page_id);
    page.clear_flag(flags::TO_PAGE | flags::FROM_PAGE | flags::NEW_BELOW_AGE_MARK);
    page.set_flag(flags::PAGE_NEW_TO_OLD);
    page.set_allocated_bytes(page.live_bytes());

    let mut recorder = RecordMigratedSlotVisitor { heap };
    heap.iterate_page_objects(page_id, |obj, map, _size| {
        if page.bitmap.is_black(obj.word_index()) {
            visit_body(heap, obj, map, &mut recorder);
        }
    });
    trace!("promoted page {} whole to {:?}", page_id, to_space);
}

fn promote_page_new_to_new(heap: &Heap, page_id: PageId) {
    let page = heap.page(page_id);
    page.set_flag(flags::PAGE_NEW_TO_NEW);
    trace!("promoted page {} within the nursery", page_id);
}

/// Abort recovery plus candidate/nursery release. Runs after the pointer
/// update, so nothing references the discarded prefixes any more.
fn epilogue(collector: &mut MarkCompactCollector, heap: &Heap, items: &[EvacuationItem]) {
    let lazy = *collector.options.concurrent_sweeping;
    let sweep_mode = if lazy { SweepMode::Lazy } else { SweepMode::Eager };

    // Aborted pages: discard the copied prefix, re-record the survivors'
    // slots, and route the page to the sweeper instead of releasing it.
    let aborted: Vec<AbortedEvacuation> =
        std::mem::take(&mut *collector.aborted.lock().unwrap());
    for ab in &aborted {
        let page = heap.page(ab.page);
        page.set_flag(flags::COMPACTION_WAS_ABORTED);
        page.clear_flag(flags::EVACUATION_CANDIDATE);

        for class in [
            RememberedSetClass::OldToNew,
            RememberedSetClass::OldToOld,
            RememberedSetClass::OldToCode,
            RememberedSetClass::OldToShared,
        ] {
            page.slot_set(class).remove_range(0, ab.failed_word);
            page.typed_slot_set(class).remove_range(0, ab.failed_word);
        }
        page.bitmap.clear_range(0, ab.failed_word);
        if ab.failed_word > 0 {
            heap.create_filler(ab.page, 0, ab.failed_word);
        }

        // Re-derive live bytes and slots from the surviving suffix.
        let mut live_words = 0u32;
        let mut word = ab.failed_word;
        let top = page.top();
        let mut recorder = RecordMigratedSlotVisitor { heap };
        while word < top {
            let obj = ObjectRef::new(ab.page, word);
            let map = heap.map_of(obj);
            let size = object_size_with_map(heap, obj, map);
            if page.bitmap.is_black(word) {
                live_words += size;
                visit_body(heap, obj, map, &mut recorder);
            }
            word += size;
        }
        page.set_live_bytes(live_words as usize * WORD_BYTES);

        collector
            .sweeper
            .add_page(heap, page.space(), ab.page, sweep_mode);
        warn!(
            "compaction of page {} was aborted; {} live bytes re-recorded",
            ab.page,
            live_words as usize * WORD_BYTES
        );
    }

    // Fully evacuated candidates are released.
    let aborted_pages: Vec<PageId> = aborted.iter().map(|a| a.page).collect();
    for page_id in collector.evacuation_candidates.drain(..) {
        if !aborted_pages.contains(&page_id) {
            heap.page(page_id).clear_flag(flags::EVACUATION_CANDIDATE);
            heap.release_page(page_id);
        }
    }

    // Nursery epilogue: surviving new-to-new pages age; everything else in
    // the from-space is relinquished.
    for item in items {
        match item.mode {
            EvacuationMode::PageNewToNew => {
                let page = heap.page(item.page);
                page.clear_flag(flags::PAGE_NEW_TO_NEW);
                page.set_flag(flags::NEW_BELOW_AGE_MARK);
                page.set_allocated_bytes(page.live_bytes());
            }
            EvacuationMode::ObjectsNewToOld => {
                heap.release_page(item.page);
            }
            EvacuationMode::PageNewToOld => {
                // The page joined old space after sweeping started; its dead
                // objects still need reclaiming.
                let page = heap.page(item.page);
                collector.sweeper.add_page(heap, page.space(), item.page, sweep_mode);
            }
            EvacuationMode::ObjectsOldToOld => {}
        }
    }

    // Whatever is left in the young large-object space is dead.
    for page_id in heap.space(SpaceId::NewLarge).page_ids() {
        debug_assert_eq!(heap.page(page_id).live_bytes(), 0);
        heap.release_page(page_id);
    }

    // The age mark follows the post-evacuation allocation top.
    let new_space = heap.space(SpaceId::New);
    new_space.set_age_mark(heap.new_space_top_packed());
}
