//! The marking driver: root enumeration, the grey-to-black transitive
//! closure, the ephemeron fixpoint (with its linear fallback) and
//! wrapper/embedder tracing.

use crate::collector::{CodeWeakSlot, Ephemeron, MarkCompactCollector, WeakSlot};
use crate::heap::Heap;
use crate::object::map::*;
use crate::object::visit::{read_typed_slot, visit_body, BodyVisitor};
use crate::object::{ObjectRef, TaggedValue};
use crate::roots::{
    iterate_roots, iterate_roots_including_clients, RootVisitor, SkipRoots,
};
use crate::scheduler::worklist::WorklistLocal;
use crate::scheduler::{Job, JobDelegate};
use crate::util::constants::{EPHEMERON_NEWLY_DISCOVERED_LIMIT, WORD_BYTES};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-cycle marking configuration, derived from the options once.
#[derive(Copy, Clone)]
pub struct MarkingConfig {
    pub flush_bytecode: bool,
    pub flush_baseline: bool,
    pub bytecode_old_age: usize,
}

impl MarkingConfig {
    pub fn from_options(options: &crate::util::options::Options) -> MarkingConfig {
        MarkingConfig {
            flush_bytecode: *options.flush_bytecode,
            flush_baseline: *options.flush_baseline_code,
            bytecode_old_age: *options.bytecode_old_age,
        }
    }
}

/// The per-thread marking context: local views of every worklist the marker
/// feeds, plus the newly-discovered tracking used by the linear ephemeron
/// algorithm.
pub struct MarkingState<'a> {
    pub heap: &'a Heap,
    cfg: MarkingConfig,
    marking: WorklistLocal<'a, ObjectRef>,
    wrapper: WorklistLocal<'a, ObjectRef>,
    discovered_ephemerons: WorklistLocal<'a, Ephemeron>,
    weak_references: WorklistLocal<'a, WeakSlot>,
    weak_cells: WorklistLocal<'a, ObjectRef>,
    js_weak_refs: WorklistLocal<'a, ObjectRef>,
    transition_arrays: WorklistLocal<'a, ObjectRef>,
    ephemeron_tables: WorklistLocal<'a, ObjectRef>,
    code_flush_candidates: WorklistLocal<'a, ObjectRef>,
    baseline_flush_candidates: WorklistLocal<'a, ObjectRef>,
    flushed_functions: WorklistLocal<'a, ObjectRef>,
    weak_objects_in_code: WorklistLocal<'a, CodeWeakSlot>,
    track_newly: bool,
    newly: Vec<ObjectRef>,
    newly_overflowed: bool,
}

impl<'a> MarkingState<'a> {
    pub fn new(
        heap: &'a Heap,
        worklists: &'a crate::collector::MarkingWorklists,
        cfg: MarkingConfig,
    ) -> MarkingState<'a> {
        MarkingState {
            heap,
            cfg,
            marking: worklists.marking.local(),
            wrapper: worklists.wrapper.local(),
            discovered_ephemerons: worklists.discovered_ephemerons.local(),
            weak_references: worklists.weak_references.local(),
            weak_cells: worklists.weak_cells.local(),
            js_weak_refs: worklists.js_weak_refs.local(),
            transition_arrays: worklists.transition_arrays.local(),
            ephemeron_tables: worklists.ephemeron_tables.local(),
            code_flush_candidates: worklists.code_flush_candidates.local(),
            baseline_flush_candidates: worklists.baseline_flush_candidates.local(),
            flushed_functions: worklists.flushed_functions.local(),
            weak_objects_in_code: worklists.weak_objects_in_code.local(),
            track_newly: false,
            newly: Vec::new(),
            newly_overflowed: false,
        }
    }

    pub fn set_track_newly_discovered(&mut self, on: bool) {
        self.track_newly = on;
        self.newly.clear();
        self.newly_overflowed = false;
    }

    pub fn take_newly_discovered(&mut self) -> (Vec<ObjectRef>, bool) {
        let overflowed = self.newly_overflowed;
        self.newly_overflowed = false;
        (std::mem::take(&mut self.newly), overflowed)
    }

    fn marking_local_is_empty(&self) -> bool {
        self.marking.is_empty_local()
    }

    /// Publish all local buffers to the global pools.
    pub fn publish(&mut self) {
        self.marking.publish();
        self.wrapper.publish();
        self.discovered_ephemerons.publish();
        self.weak_references.publish();
        self.weak_cells.publish();
        self.js_weak_refs.publish();
        self.transition_arrays.publish();
        self.ephemeron_tables.publish();
        self.code_flush_candidates.publish();
        self.baseline_flush_candidates.publish();
        self.flushed_functions.publish();
        self.weak_objects_in_code.publish();
    }

    /// White -> Grey; pushes the object for body visiting. Fillers are never
    /// marked. Returns true if this call discovered the object.
    pub fn mark_object(&mut self, obj: ObjectRef) -> bool {
        if self.heap.instance_kind(obj).is_filler() {
            return false;
        }
        let page = self.heap.page(obj.page());
        if page.bitmap.attempt_white_to_grey(obj.word_index()) {
            if self.track_newly {
                if self.newly.len() < EPHEMERON_NEWLY_DISCOVERED_LIMIT {
                    self.newly.push(obj);
                } else {
                    self.newly_overflowed = true;
                }
            }
            self.marking.push(obj);
            return true;
        }
        false
    }

    /// Pop and process items until the worklist drains or `budget_words` of
    /// object size has been visited. Returns true when fully drained.
    pub fn process_marking_worklist(&mut self, budget_words: usize) -> bool {
        let mut processed = 0usize;
        while let Some(obj) = self.marking.pop() {
            if processed >= budget_words {
                // Budget exhausted: stash the popped item and surface the
                // rest to other workers.
                self.marking.push_on_hold(obj);
                self.marking.publish();
                return false;
            }
            processed += self.process_object(obj);
        }
        true
    }

    fn process_object(&mut self, obj: ObjectRef) -> usize {
        let page = self.heap.page(obj.page());
        let word = obj.word_index();
        debug_assert!(page.bitmap.is_grey(word), "marking item must be grey");
        page.bitmap.grey_to_black(word);
        let map = self.heap.map_of(obj);
        let size = object_size_with_map(self.heap, obj, map) as usize;
        page.add_live_bytes(size * WORD_BYTES);
        self.visit_object(obj, map);
        size
    }

    fn visit_object(&mut self, obj: ObjectRef, map: ObjectRef) {
        use InstanceKind::*;
        match map_kind(self.heap, map) {
            SharedFunctionInfo => self.visit_sfi(obj, map),
            JsFunction => self.visit_js_function(obj, map),
            EphemeronHashTable => {
                self.ephemeron_tables.push(obj);
                self.generic_visit(obj, map);
            }
            Code => self.visit_code(obj, map),
            JsWeakRef => {
                self.js_weak_refs.push(obj);
                self.generic_visit(obj, map);
            }
            WeakCell => {
                self.weak_cells.push(obj);
                self.generic_visit(obj, map);
            }
            TransitionArray => {
                self.transition_arrays.push(obj);
                // Entries are pruned by the transition compactor; record them
                // for the update phase but do not mark through them.
                self.mark_strong_slot(obj, 0);
                let len = self.heap.read_slot(obj, array_layout::LENGTH).as_smi() as u32;
                for i in 0..len {
                    self.record_ref_slot(obj, array_layout::ELEMENTS_START + i);
                }
            }
            WrapperObject => {
                self.wrapper.push(obj);
                #[cfg(feature = "sandbox")]
                {
                    let handle = self.heap.read_slot(obj, wrapper_layout::FOREIGN).as_smi();
                    if handle >= 0 {
                        self.heap.external_pointer_table.mark(handle as usize);
                    }
                }
                self.generic_visit(obj, map);
            }
            _ => self.generic_visit(obj, map),
        }
    }

    fn generic_visit(&mut self, obj: ObjectRef, map: ObjectRef) {
        let mut visitor = MarkingBodyVisitor { state: self };
        visit_body(visitor.state.heap, obj, map, &mut visitor);
    }

    fn visit_sfi(&mut self, obj: ObjectRef, map: ObjectRef) {
        debug_assert_eq!(map_kind(self.heap, map), InstanceKind::SharedFunctionInfo);
        self.mark_strong_slot(obj, 0);

        if let Some(baseline) = self.heap.read_slot(obj, sfi_layout::BASELINE_CODE).to_object() {
            if self.cfg.flush_baseline {
                self.record_ref_slot(obj, sfi_layout::BASELINE_CODE);
                self.baseline_flush_candidates.push(obj);
            } else {
                self.mark_and_record(obj, sfi_layout::BASELINE_CODE, baseline);
            }
        }

        let Some(data) = self.heap.read_slot(obj, sfi_layout::FUNCTION_DATA).to_object() else {
            return;
        };
        if self.cfg.flush_bytecode
            && self.heap.instance_kind(data) == InstanceKind::BytecodeArray
        {
            let age = self.bump_bytecode_age(data);
            if age >= self.cfg.bytecode_old_age {
                // Old enough: hold the bytecode weakly and decide at clearing.
                self.record_ref_slot(obj, sfi_layout::FUNCTION_DATA);
                self.code_flush_candidates.push(obj);
                return;
            }
        }
        self.mark_and_record(obj, sfi_layout::FUNCTION_DATA, data);
    }

    /// Age the bytecode by one cycle; concurrent markers race benignly
    /// through the CAS. Returns the post-bump age.
    fn bump_bytecode_age(&mut self, bytecode: ObjectRef) -> usize {
        let page = self.heap.page(bytecode.page());
        let slot = bytecode.word_index() + bytecode_layout::AGE;
        loop {
            let old = page.read_word(slot);
            let age = TaggedValue::from_bits(old).as_smi();
            let new = TaggedValue::from_smi(age + 1).bits();
            if page.compare_exchange_word(slot, old, new) {
                return (age + 1) as usize;
            }
        }
    }

    fn visit_js_function(&mut self, obj: ObjectRef, map: ObjectRef) {
        debug_assert_eq!(map_kind(self.heap, map), InstanceKind::JsFunction);
        self.mark_strong_slot(obj, 0);
        self.mark_strong_slot(obj, js_function_layout::SHARED);
        self.mark_strong_slot(obj, js_function_layout::CONTEXT);

        if let Some(code) = self.heap.read_slot(obj, js_function_layout::CODE).to_object() {
            if self.cfg.flush_bytecode
                && self.heap.instance_kind(code) == InstanceKind::BytecodeArray
            {
                // The code entry follows the bytecode's fate; reset after
                // clearing if it was flushed.
                self.record_ref_slot(obj, js_function_layout::CODE);
                self.flushed_functions.push(obj);
            } else {
                self.mark_and_record(obj, js_function_layout::CODE, code);
            }
        }
    }

    fn visit_code(&mut self, obj: ObjectRef, map: ObjectRef) {
        debug_assert_eq!(map_kind(self.heap, map), InstanceKind::Code);
        self.mark_strong_slot(obj, 0);
        self.mark_strong_slot(obj, code_layout::DEOPT_LITERALS);
        let can_deopt = self.heap.read_slot(obj, code_layout::FLAGS).as_smi()
            & code_layout::FLAG_CAN_DEOPT
            != 0;
        self.visit_code_relocations(obj, can_deopt);
    }

    /// The top optimized frame's code is visited with every embedded object
    /// held strongly, so its deoptimization literals survive.
    pub fn visit_running_code(&mut self, code: ObjectRef) {
        if self.heap.instance_kind(code) != InstanceKind::Code {
            return;
        }
        self.mark_object(code);
        self.mark_strong_slot(code, code_layout::DEOPT_LITERALS);
        self.visit_code_relocations(code, false);
    }

    fn visit_code_relocations(&mut self, code: ObjectRef, weak: bool) {
        let relocs = self.heap.read_slot(code, code_layout::RELOC_COUNT).as_smi() as u32;
        for i in 0..relocs {
            let kind = TypedSlotKind::from_code(
                self.heap
                    .read_slot(code, code_layout::RELOC_START + 2 * i)
                    .as_smi() as u8,
            );
            let offset = self
                .heap
                .read_slot(code, code_layout::RELOC_START + 2 * i + 1)
                .as_smi() as u32;
            self.mark_typed_slot(code, kind, offset, weak);
        }
    }

    fn mark_typed_slot(&mut self, code: ObjectRef, kind: TypedSlotKind, offset: u32, weak: bool) {
        let target = read_typed_slot(self.heap, code, offset);
        if target.raw() == 0 {
            return;
        }
        self.heap.record_typed_slot(code, kind, offset, target);
        if weak {
            self.weak_objects_in_code.push(CodeWeakSlot {
                code,
                kind,
                body_offset: offset,
            });
        } else {
            self.mark_object(target);
        }
    }

    // Slot helpers.

    fn mark_strong_slot(&mut self, host: ObjectRef, index: u32) {
        let value = self.heap.read_slot(host, index);
        if let Some(target) = value.to_object() {
            debug_assert!(value.is_strong(), "weak value in strong slot of {}", host);
            self.mark_and_record(host, index, target);
        }
    }

    fn mark_maybe_slot(&mut self, host: ObjectRef, index: u32) {
        let value = self.heap.read_slot(host, index);
        if value.is_strong() {
            self.mark_and_record(host, index, value.to_object().unwrap());
        } else if value.is_weak() {
            let target = value.to_object().unwrap();
            self.heap.record_slot(host, index, target);
            self.weak_references.push(WeakSlot { host, index });
        }
    }

    fn mark_and_record(&mut self, host: ObjectRef, index: u32, target: ObjectRef) {
        self.mark_object(target);
        self.heap.record_slot(host, index, target);
    }

    fn record_ref_slot(&mut self, host: ObjectRef, index: u32) {
        if let Some(target) = self.heap.read_slot(host, index).to_object() {
            self.heap.record_slot(host, index, target);
        }
    }

    fn mark_ephemeron_entry(&mut self, table: ObjectRef, entry: u32) {
        let key_index = ephemeron_layout::key_index(entry);
        let value_index = ephemeron_layout::value_index(entry);
        let key_value = self.heap.read_slot(table, key_index);
        let Some(key) = key_value.to_object() else {
            return;
        };
        if key == self.heap.well_known().the_hole {
            return;
        }
        self.heap.record_slot(table, key_index, key);
        if self.heap.is_marked(key) {
            self.mark_strong_slot(table, value_index);
        } else {
            self.record_ref_slot(table, value_index);
            if let Some(value) = self.heap.read_slot(table, value_index).to_object() {
                if !self.heap.is_marked(value) {
                    self.discovered_ephemerons.push(Ephemeron { key, value });
                }
            }
        }
    }

    /// Apply the fixpoint rule to one ephemeron. Returns true if the value
    /// was newly marked; pushes unresolved pairs to `next_out`.
    fn process_ephemeron(
        &mut self,
        ephemeron: Ephemeron,
        next_out: &mut WorklistLocal<'_, Ephemeron>,
    ) -> bool {
        if self.heap.is_marked(ephemeron.key) {
            self.mark_object(ephemeron.value)
        } else {
            if !self.heap.is_marked(ephemeron.value) {
                next_out.push(ephemeron);
            }
            false
        }
    }
}

struct MarkingBodyVisitor<'a, 'b> {
    state: &'b mut MarkingState<'a>,
}

impl BodyVisitor for MarkingBodyVisitor<'_, '_> {
    fn visit_strong(&mut self, host: ObjectRef, index: u32) {
        self.state.mark_strong_slot(host, index);
    }

    fn visit_weak(&mut self, host: ObjectRef, index: u32) {
        self.state.mark_maybe_slot(host, index);
    }

    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32) {
        self.state.mark_ephemeron_entry(table, entry);
    }

    fn visit_typed(&mut self, code: ObjectRef, kind: TypedSlotKind, body_offset: u32) {
        self.state.mark_typed_slot(code, kind, body_offset, false);
    }

    fn visit_weak_list_link(&mut self, host: ObjectRef, index: u32) {
        // Pruned by the weak-list retainer, updated via the remembered set.
        self.state.record_ref_slot(host, index);
    }

    fn visit_custom_weak(&mut self, host: ObjectRef, index: u32) {
        // Cleared by the weak-object pipeline; only record for updating.
        self.state.record_ref_slot(host, index);
    }
}

/// Marks every strong root; movable and immovable roots alike.
pub struct RootMarkingVisitor<'a, 'b> {
    pub state: &'b mut MarkingState<'a>,
}

impl RootVisitor for RootMarkingVisitor<'_, '_> {
    fn visit_root_slot(&mut self, slot: &mut TaggedValue) {
        if slot.is_strong() {
            if let Some(target) = slot.to_object() {
                self.state.mark_object(target);
            }
        }
    }

    fn visit_immovable_root(&mut self, obj: ObjectRef) {
        self.state.mark_object(obj);
    }
}

/// The parallel transitive-closure job. Termination uses an idle counter:
/// a worker publishes before announcing itself idle, so work can never be
/// stranded in a local buffer once every worker has parked.
struct MarkingJob<'c> {
    collector: &'c MarkCompactCollector,
    heap: &'c Heap,
    cfg: MarkingConfig,
    idle: AtomicUsize,
    concurrency: usize,
}

impl Job for MarkingJob<'_> {
    fn run(&self, _delegate: &JobDelegate) {
        let mut state = MarkingState::new(self.heap, &self.collector.worklists, self.cfg);
        loop {
            state.process_marking_worklist(usize::MAX);
            state.publish();
            self.idle.fetch_add(1, Ordering::AcqRel);
            loop {
                if !self.collector.worklists.marking.is_empty() {
                    self.idle.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
                if self.idle.load(Ordering::Acquire) == self.concurrency {
                    return;
                }
                std::thread::yield_now();
            }
        }
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        worker_count
    }
}

/// Compose the root closure: stop-the-marker hand-off, strong roots, client
/// heaps, the parallel closure, the ephemeron fixpoint and embedder tracing.
pub fn mark_live_objects(collector: &MarkCompactCollector, heap: &Heap) {
    let cfg = MarkingConfig::from_options(&collector.options);
    let is_shared_gc = !heap.client_roots.is_empty();

    collector.embedder.lock().unwrap().enter_final_pause();

    {
        let mut state = MarkingState::new(heap, &collector.worklists, cfg);

        // Residual grey objects from the stopped incremental marker.
        heap.incremental_marker.drain_residual(|obj| {
            state.mark_object(obj);
        });

        {
            let mut visitor = RootMarkingVisitor { state: &mut state };
            if is_shared_gc {
                iterate_roots_including_clients(heap, &mut visitor, SkipRoots::NONE);
            } else {
                iterate_roots(heap, &mut visitor, SkipRoots::NONE);
            }
        }

        // The top optimized frame retains its deoptimization literals.
        let top_frames: Vec<TaggedValue> = std::iter::once(heap.roots.top_frame_code())
            .chain(heap.client_roots.iter().map(|roots| roots.top_frame_code()))
            .collect();
        for frame in top_frames {
            if let Some(code) = frame.to_object() {
                state.visit_running_code(code);
            }
        }

        if is_shared_gc {
            record_client_shared_references(&mut state);
        }

        state.publish();
    }

    // Parallel closure, then a single-threaded final closure to settle weak
    // maps and embedder tracing.
    run_closure(collector, heap, cfg);
    process_ephemerons(collector, heap, cfg);
    perform_wrapper_tracing(collector, heap, cfg);

    debug_assert!(collector.worklists.current_ephemerons.is_empty());
    debug_assert!(collector.worklists.discovered_ephemerons.is_empty());
    debug_assert!(collector.worklists.next_ephemerons.is_empty());
}

fn run_closure(collector: &MarkCompactCollector, heap: &Heap, cfg: MarkingConfig) {
    if *collector.options.parallel_marking && collector.pool.worker_count() > 1 {
        let job = MarkingJob {
            collector,
            heap,
            cfg,
            idle: AtomicUsize::new(0),
            concurrency: collector.pool.worker_count(),
        };
        collector.pool.run_job(&job);
    } else {
        let mut state = MarkingState::new(heap, &collector.worklists, cfg);
        state.process_marking_worklist(usize::MAX);
        state.publish();
    }
}

/// In shared-GC mode every client-heap object keeps its shared references
/// alive; walk them, mark the targets, and record `OLD_TO_SHARED`.
fn record_client_shared_references(state: &mut MarkingState<'_>) {
    let heap = state.heap;
    for page_id in heap.all_page_ids() {
        let page = heap.page(page_id);
        if page.space().is_shared() {
            continue;
        }
        heap.iterate_page_objects(page_id, |obj, map, _size| {
            let mut visitor = ClientSharedVisitor { state: &mut *state };
            visit_body(heap, obj, map, &mut visitor);
        });
    }
}

struct ClientSharedVisitor<'a, 'c> {
    state: &'c mut MarkingState<'a>,
}

impl ClientSharedVisitor<'_, '_> {
    fn handle(&mut self, host: ObjectRef, index: u32) {
        let heap = self.state.heap;
        if let Some(target) = heap.read_slot(host, index).to_object() {
            if heap.in_shared(target) {
                self.state.mark_object(target);
                heap.record_slot(host, index, target);
            }
        }
    }
}

impl BodyVisitor for ClientSharedVisitor<'_, '_> {
    fn visit_strong(&mut self, host: ObjectRef, index: u32) {
        self.handle(host, index);
    }

    fn visit_weak(&mut self, host: ObjectRef, index: u32) {
        self.handle(host, index);
    }

    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32) {
        self.handle(table, ephemeron_layout::key_index(entry));
        self.handle(table, ephemeron_layout::value_index(entry));
    }

    fn visit_typed(&mut self, code: ObjectRef, _kind: TypedSlotKind, body_offset: u32) {
        let heap = self.state.heap;
        let target = read_typed_slot(heap, code, body_offset);
        if target.raw() != 0 && heap.in_shared(target) {
            self.state.mark_object(target);
        }
    }

    fn visit_map_word(&mut self, host: ObjectRef) {
        self.handle(host, 0);
    }
}

/// Fixpoint iteration over ephemerons, bounded by
/// `ephemeron_fixpoint_iterations`; cancellation falls back to the linear
/// algorithm.
pub fn process_ephemerons(collector: &MarkCompactCollector, heap: &Heap, cfg: MarkingConfig) {
    let max_iterations = *collector.options.ephemeron_fixpoint_iterations;
    let mut iterations = 0;
    loop {
        if iterations >= max_iterations {
            trace!("ephemeron fixpoint cancelled after {} iterations", iterations);
            process_ephemerons_linear(collector, heap, cfg);
            break;
        }
        let marked_any = process_ephemerons_one_round(collector, heap, cfg);
        iterations += 1;
        if !marked_any {
            break;
        }
    }
    // Whatever is left is provably dead; the table compaction in the
    // clearing pipeline removes the entries themselves.
    collector.worklists.next_ephemerons.clear();
    collector.worklists.current_ephemerons.clear();
    collector.worklists.discovered_ephemerons.clear();
}

fn process_ephemerons_one_round(
    collector: &MarkCompactCollector,
    heap: &Heap,
    cfg: MarkingConfig,
) -> bool {
    let worklists = &collector.worklists;
    let mut marked_any = false;
    let mut state = MarkingState::new(heap, worklists, cfg);

    // 1. Swap next_ephemerons into current_ephemerons.
    worklists.current_ephemerons.swap(&worklists.next_ephemerons);

    // 2. Drain current_ephemerons.
    {
        let mut next_out = worklists.next_ephemerons.local();
        worklists.current_ephemerons.drain(|ephemeron| {
            marked_any |= state.process_ephemeron(ephemeron, &mut next_out);
        });
    }

    // 3. Drain the main worklist; new ephemerons land in
    // discovered_ephemerons.
    if !worklists.marking.is_empty() || !state.marking_local_is_empty() {
        marked_any = true;
        state.process_marking_worklist(usize::MAX);
    }

    // 4. Drain discovered_ephemerons with the same rule.
    state.publish();
    {
        let mut next_out = worklists.next_ephemerons.local();
        worklists.discovered_ephemerons.drain(|ephemeron| {
            marked_any |= state.process_ephemeron(ephemeron, &mut next_out);
        });
    }
    if !worklists.marking.is_empty() || !state.marking_local_is_empty() {
        marked_any = true;
        state.process_marking_worklist(usize::MAX);
    }
    state.publish();
    marked_any
}

/// The linear fallback: build a key -> values multimap, then chase newly
/// discovered keys through a bounded buffer; on overflow, conservatively
/// revisit all pending ephemerons.
fn process_ephemerons_linear(collector: &MarkCompactCollector, heap: &Heap, cfg: MarkingConfig) {
    let worklists = &collector.worklists;
    let mut key_to_values: HashMap<ObjectRef, Vec<ObjectRef>> = HashMap::new();
    let mut state = MarkingState::new(heap, worklists, cfg);
    state.set_track_newly_discovered(true);

    let mut seed = |state: &mut MarkingState<'_>,
                    key_to_values: &mut HashMap<ObjectRef, Vec<ObjectRef>>,
                    ephemeron: Ephemeron| {
        if heap.is_marked(ephemeron.key) {
            state.mark_object(ephemeron.value);
        } else if !heap.is_marked(ephemeron.value) {
            key_to_values
                .entry(ephemeron.key)
                .or_default()
                .push(ephemeron.value);
        }
    };

    worklists
        .next_ephemerons
        .drain(|e| seed(&mut state, &mut key_to_values, e));
    worklists
        .current_ephemerons
        .drain(|e| seed(&mut state, &mut key_to_values, e));

    loop {
        let mut changed = false;

        if !worklists.marking.is_empty() || !state.marking_local_is_empty() {
            state.process_marking_worklist(usize::MAX);
            changed = true;
        }

        let (newly, overflowed) = state.take_newly_discovered();
        if overflowed {
            // The buffer could not hold every discovery; visit all pending
            // ephemerons conservatively.
            let keys: Vec<ObjectRef> = key_to_values.keys().copied().collect();
            for key in keys {
                if heap.is_marked(key) {
                    for value in key_to_values.remove(&key).unwrap() {
                        changed |= state.mark_object(value);
                    }
                }
            }
        } else {
            for key in newly {
                if let Some(values) = key_to_values.remove(&key) {
                    for value in values {
                        changed |= state.mark_object(value);
                    }
                }
            }
        }

        state.publish();
        {
            let mut discovered = Vec::new();
            worklists.discovered_ephemerons.drain(|e| discovered.push(e));
            for ephemeron in discovered {
                if heap.is_marked(ephemeron.key) {
                    changed |= state.mark_object(ephemeron.value);
                } else if !heap.is_marked(ephemeron.value) {
                    key_to_values
                        .entry(ephemeron.key)
                        .or_default()
                        .push(ephemeron.value);
                }
            }
        }

        if !changed && worklists.marking.is_empty() && state.marking_local_is_empty() {
            break;
        }
    }

    state.set_track_newly_discovered(false);
    state.publish();
}

/// Hand the wrapper queue to the embedder and read back the interior roots
/// it discovered; loop until both sides are out of work.
fn perform_wrapper_tracing(collector: &MarkCompactCollector, heap: &Heap, cfg: MarkingConfig) {
    const TRACE_DEADLINE_ITEMS: usize = 1000;
    let worklists = &collector.worklists;
    loop {
        let mut state = MarkingState::new(heap, worklists, cfg);
        state.process_marking_worklist(usize::MAX);

        let mut wrappers = Vec::new();
        worklists.wrapper.drain(|w| wrappers.push(w));

        let done = {
            let mut embedder = collector.embedder.lock().unwrap();
            if !wrappers.is_empty() {
                embedder.register_wrappers(&wrappers);
            }
            let mut reached = Vec::new();
            let done = embedder.trace(TRACE_DEADLINE_ITEMS, &mut |obj| reached.push(obj));
            drop(embedder);
            for obj in reached {
                state.mark_object(obj);
            }
            done
        };
        state.publish();

        let embedder_done = collector.embedder.lock().unwrap().is_remote_tracing_done();
        if done
            && embedder_done
            && worklists.marking.is_empty()
            && worklists.wrapper.is_empty()
        {
            break;
        }
    }
}
