//! The full-heap mark-compact collector and its young-generation sibling.
//!
//! The full cycle runs `Prepare -> MarkLiveObjects -> ClearNonLiveReferences
//! -> VerifyMarking -> StartSweepSpaces -> Evacuate -> Finish`, driving the
//! state machine `IDLE -> PREPARE_GC -> MARK_LIVE_OBJECTS -> SWEEP_SPACES ->
//! RELOCATE_OBJECTS -> IDLE`. Within a phase, work is farmed to the worker
//! pool; cross-phase barriers flush all thread-local worklists.

pub mod candidates;
pub mod clearing;
pub mod evacuation;
pub mod marking;
pub mod update;
pub mod verify;
pub mod young;

use crate::embedder::{EmbedderHeapTracer, NoopTracer};
use crate::heap::page::flags;
use crate::heap::space::SpaceId;
use crate::heap::sweeper::{SweepMode, Sweeper};
use crate::heap::Heap;
use crate::object::map::TypedSlotKind;
use crate::object::{ObjectRef, PageId};
use crate::scheduler::worklist::Worklist;
use crate::scheduler::WorkerPool;
use crate::util::options::Options;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Out-of-memory conditions the collector cannot absorb.
pub fn fatal_out_of_memory(context: &str) -> ! {
    panic!("Fatal process out of memory: {}", context);
}

/// A (key, value) pair whose value is reachable iff the key is reachable.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ephemeron {
    pub key: ObjectRef,
    pub value: ObjectRef,
}

/// A weak slot discovered during marking: `host`'s `index`-th word.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct WeakSlot {
    pub host: ObjectRef,
    pub index: u32,
}

/// A weakly embedded object in an optimized code body.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CodeWeakSlot {
    pub code: ObjectRef,
    pub kind: TypedSlotKind,
    pub body_offset: u32,
}

/// The worklists shared by the marking driver and the clearing pipeline.
pub struct MarkingWorklists {
    pub marking: Worklist<ObjectRef>,
    /// Wrapper (embedder) objects pending foreign tracing.
    pub wrapper: Worklist<ObjectRef>,
    pub current_ephemerons: Worklist<Ephemeron>,
    pub discovered_ephemerons: Worklist<Ephemeron>,
    pub next_ephemerons: Worklist<Ephemeron>,
    pub weak_references: Worklist<WeakSlot>,
    pub weak_cells: Worklist<ObjectRef>,
    pub js_weak_refs: Worklist<ObjectRef>,
    pub transition_arrays: Worklist<ObjectRef>,
    pub ephemeron_tables: Worklist<ObjectRef>,
    pub code_flush_candidates: Worklist<ObjectRef>,
    pub baseline_flush_candidates: Worklist<ObjectRef>,
    pub flushed_functions: Worklist<ObjectRef>,
    pub weak_objects_in_code: Worklist<CodeWeakSlot>,
}

impl MarkingWorklists {
    pub fn new() -> MarkingWorklists {
        MarkingWorklists {
            marking: Worklist::new(),
            wrapper: Worklist::new(),
            current_ephemerons: Worklist::new(),
            discovered_ephemerons: Worklist::new(),
            next_ephemerons: Worklist::new(),
            weak_references: Worklist::new(),
            weak_cells: Worklist::new(),
            js_weak_refs: Worklist::new(),
            transition_arrays: Worklist::new(),
            ephemeron_tables: Worklist::new(),
            code_flush_candidates: Worklist::new(),
            baseline_flush_candidates: Worklist::new(),
            flushed_functions: Worklist::new(),
            weak_objects_in_code: Worklist::new(),
        }
    }

    /// Every list the marker feeds must be drained at the marking barrier.
    pub fn assert_marking_complete(&self) {
        debug_assert!(self.marking.is_empty());
        debug_assert!(self.wrapper.is_empty());
        debug_assert!(self.current_ephemerons.is_empty());
        debug_assert!(self.discovered_ephemerons.is_empty());
        debug_assert!(self.next_ephemerons.is_empty());
    }

    /// Everything must be empty between cycles.
    pub fn assert_all_empty(&self) {
        self.assert_marking_complete();
        debug_assert!(self.weak_references.is_empty());
        debug_assert!(self.weak_cells.is_empty());
        debug_assert!(self.js_weak_refs.is_empty());
        debug_assert!(self.transition_arrays.is_empty());
        debug_assert!(self.ephemeron_tables.is_empty());
        debug_assert!(self.code_flush_candidates.is_empty());
        debug_assert!(self.baseline_flush_candidates.is_empty());
        debug_assert!(self.flushed_functions.is_empty());
        debug_assert!(self.weak_objects_in_code.is_empty());
    }
}

impl Default for MarkingWorklists {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CollectorState {
    Idle,
    PrepareGc,
    MarkLiveObjects,
    SweepSpaces,
    RelocateObjects,
}

/// Measured compaction throughput, feeding the adaptive candidate mode.
pub struct CompactionSpeed {
    bytes: AtomicUsize,
    micros: AtomicU64,
}

impl CompactionSpeed {
    fn new() -> CompactionSpeed {
        CompactionSpeed {
            bytes: AtomicUsize::new(0),
            micros: AtomicU64::new(0),
        }
    }

    pub fn record(&self, bytes: usize, micros: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Bytes evacuated per microsecond, if anything has been measured.
    pub fn bytes_per_micro(&self) -> Option<usize> {
        let micros = self.micros.load(Ordering::Relaxed);
        if micros == 0 {
            return None;
        }
        Some(self.bytes.load(Ordering::Relaxed) / micros as usize)
    }
}

/// An evacuation that failed mid-page: the page and the first uncopied word.
#[derive(Copy, Clone, Debug)]
pub struct AbortedEvacuation {
    pub page: PageId,
    pub failed_word: u32,
}

pub struct MarkCompactCollector {
    pub options: Arc<Options>,
    pub pool: WorkerPool,
    state: CollectorState,
    pub worklists: MarkingWorklists,
    /// Main-thread-only: pages chosen for compaction this cycle.
    evacuation_candidates: Vec<PageId>,
    pub sweeper: Sweeper,
    pub embedder: Mutex<Box<dyn EmbedderHeapTracer>>,
    epoch: AtomicUsize,
    pub compaction_speed: CompactionSpeed,
    pub aborted: Mutex<Vec<AbortedEvacuation>>,
    /// Whether incremental marking was active when this cycle stopped it.
    was_incremental: bool,
}

impl MarkCompactCollector {
    pub fn new(options: Arc<Options>) -> MarkCompactCollector {
        let pool = WorkerPool::new(*options.threads);
        MarkCompactCollector {
            options,
            pool,
            state: CollectorState::Idle,
            worklists: MarkingWorklists::new(),
            evacuation_candidates: Vec::new(),
            sweeper: Sweeper::new(),
            embedder: Mutex::new(Box::new(NoopTracer)),
            epoch: AtomicUsize::new(0),
            compaction_speed: CompactionSpeed::new(),
            aborted: Mutex::new(Vec::new()),
            was_incremental: false,
        }
    }

    pub fn set_up(&mut self) {
        crate::util::logger::try_init();
        debug_assert_eq!(self.state, CollectorState::Idle);
    }

    pub fn tear_down(&mut self, heap: &Heap) {
        if self.sweeper.sweeping_in_progress() {
            self.sweeper.ensure_completed(heap);
        }
        self.abort_compaction(heap);
    }

    pub fn set_embedder_tracer(&self, tracer: Box<dyn EmbedderHeapTracer>) {
        *self.embedder.lock().unwrap() = tracer;
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn evacuation_candidates(&self) -> &[PageId] {
        &self.evacuation_candidates
    }

    fn transition(&mut self, from: CollectorState, to: CollectorState) {
        debug_assert_eq!(self.state, from, "invalid collector state transition");
        self.state = to;
    }

    /// Drop every evacuation candidate. Callable from any state; does not
    /// advance the state machine.
    pub fn abort_compaction(&mut self, heap: &Heap) {
        for page_id in self.evacuation_candidates.drain(..) {
            heap.page(page_id).clear_flag(flags::EVACUATION_CANDIDATE);
        }
    }

    /// Run one full collection cycle.
    pub fn collect_garbage(&mut self, heap: &Heap) {
        self.prepare(heap);
        self.mark_live_objects(heap);
        self.clear_non_live_references(heap);
        self.verify_marking(heap);
        self.start_sweep_spaces(heap);
        self.evacuate(heap);
        self.finish(heap);
    }

    fn prepare(&mut self, heap: &Heap) {
        self.transition(CollectorState::Idle, CollectorState::PrepareGc);
        if *self.options.trace_gc {
            info!("mark-compact: prepare (epoch {})", self.epoch());
        }

        // Stop the incremental marker and remember the flag; its residual
        // worklists are consumed as roots.
        self.was_incremental = heap.incremental_marker.stop();
        if self.was_incremental {
            heap.incremental_marker.publish_all();
        }

        // Marking left over from the previous cycle must not leak in.
        if self.sweeper.sweeping_in_progress() {
            self.sweeper.ensure_completed(heap);
        }
        self.worklists.assert_all_empty();
        debug_assert!(self.aborted.lock().unwrap().is_empty());

        for page_id in heap.all_page_ids() {
            let page = heap.page(page_id);
            page.bitmap.clear();
            page.set_live_bytes(0);
            page.clear_flag(
                flags::PAGE_NEW_TO_OLD | flags::PAGE_NEW_TO_NEW | flags::COMPACTION_WAS_ABORTED,
            );
        }

        let compacting = *self.options.compact
            && !(*self.options.reduce_memory && *self.options.gc_experiment_less_compaction);
        if compacting {
            candidates::select_evacuation_candidates(self, heap);
        }

        let mut embedder = self.embedder.lock().unwrap();
        embedder.prepare_for_trace();
        embedder.trace_prologue();
    }

    fn mark_live_objects(&mut self, heap: &Heap) {
        self.transition(CollectorState::PrepareGc, CollectorState::MarkLiveObjects);
        marking::mark_live_objects(self, heap);
        self.worklists.assert_marking_complete();
        heap.incremental_marker.deactivate_all();
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    fn clear_non_live_references(&mut self, heap: &Heap) {
        debug_assert_eq!(self.state, CollectorState::MarkLiveObjects);
        clearing::clear_non_live_references(self, heap);
    }

    fn verify_marking(&mut self, heap: &Heap) {
        if cfg!(debug_assertions) || cfg!(feature = "sanity") {
            verify::verify_marking(heap);
        }
    }

    fn start_sweep_spaces(&mut self, heap: &Heap) {
        use strum::IntoEnumIterator;
        self.transition(CollectorState::MarkLiveObjects, CollectorState::SweepSpaces);
        let lazy = *self.options.concurrent_sweeping;
        let swept_spaces = SpaceId::iter()
            .filter(|s| !s.is_young() && *s != SpaceId::Large)
            .collect::<Vec<_>>();
        for space_id in swept_spaces {
            for page_id in heap.space(space_id).page_ids() {
                let page = heap.page(page_id);
                if page.is_evacuation_candidate() {
                    // Candidates are released (or re-recorded) by the
                    // evacuation epilogue instead.
                    continue;
                }
                if page.live_bytes() == page.allocated_bytes() {
                    continue;
                }
                let mode = if lazy { SweepMode::Lazy } else { SweepMode::Eager };
                self.sweeper.add_page(heap, space_id, page_id, mode);
            }
        }
        // Dead large objects are released outright.
        for page_id in heap.space(SpaceId::Large).page_ids() {
            let page = heap.page(page_id);
            if page.live_bytes() == 0 {
                heap.release_page(page_id);
            }
        }
        self.sweeper.start_sweeping();
    }

    fn evacuate(&mut self, heap: &Heap) {
        self.transition(CollectorState::SweepSpaces, CollectorState::RelocateObjects);
        evacuation::evacuate(self, heap);
    }

    fn finish(&mut self, heap: &Heap) {
        self.transition(CollectorState::RelocateObjects, CollectorState::Idle);
        if !*self.options.concurrent_sweeping {
            self.sweeper.ensure_completed(heap);
        }
        {
            let mut embedder = self.embedder.lock().unwrap();
            embedder.trace_epilogue();
        }
        self.worklists.assert_all_empty();
        if *self.options.trace_gc {
            info!("mark-compact: finish (epoch {})", self.epoch());
        }
    }
}

/// The public per-isolate collector pair: one full collector, one
/// young-generation collector, one worker pool between them.
pub struct GarbageCollector {
    pub full: MarkCompactCollector,
    pub young: young::MinorMarkCompactCollector,
}

impl GarbageCollector {
    pub fn new(options: Arc<Options>) -> GarbageCollector {
        GarbageCollector {
            full: MarkCompactCollector::new(options.clone()),
            young: young::MinorMarkCompactCollector::new(options),
        }
    }

    pub fn set_up(&mut self) {
        self.full.set_up();
    }

    pub fn tear_down(&mut self, heap: &Heap) {
        self.full.tear_down(heap);
    }

    pub fn collect_full(&mut self, heap: &Heap) {
        self.full.collect_garbage(heap);
    }

    pub fn collect_young(&mut self, heap: &Heap) {
        if !*self.young.options.minor_mc {
            // Without the nursery variant, a young request escalates to a
            // full collection.
            self.collect_full(heap);
            return;
        }
        self.young.collect_garbage(heap, &self.full.sweeper);
    }
}
