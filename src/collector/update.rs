//! The pointer-update phase: after copying completes, every slot in the heap
//! that could reference a moved object is rewritten through the forwarding
//! addresses.

use crate::collector::MarkCompactCollector;
use crate::heap::page::flags;
use crate::heap::remembered_set::{RememberedSetClass, SlotVerdict, TypedSlot};
use crate::heap::space::SpaceId;
use crate::heap::Heap;
use crate::object::map::{external_string_layout, TypedSlotKind};
use crate::object::visit::{visit_body, BodyVisitor};
use crate::object::{MapWord, ObjectRef, PageId, TaggedValue};
use crate::roots::{iterate_roots_including_clients, RootVisitor, SkipRoots};
use crate::scheduler::{ClaimCounter, Job, JobDelegate};
use crate::util::constants::MAX_POINTER_UPDATE_TASKS;
use std::collections::BTreeSet;

pub fn update_pointers_after_evacuation(collector: &MarkCompactCollector, heap: &Heap) {
    update_roots(heap);
    update_remembered_sets(collector, heap);
    update_new_to_new_pages(heap);
    // The external string table is handled last.
    update_external_string_table(heap);
    // The full collector knows table liveness and drops dead tables here.
    update_ephemeron_remembered_set(heap, true);
}

fn update_tagged(heap: &Heap, value: TaggedValue) -> Option<TaggedValue> {
    let target = value.to_object()?;
    let to = heap.forwarded(target)?;
    Some(value.retarget(to))
}

/// Rewrites root slots whose referent's map word is a forwarding tag.
pub struct RootUpdateVisitor<'h> {
    pub heap: &'h Heap,
}

impl RootVisitor for RootUpdateVisitor<'_> {
    fn visit_root_slot(&mut self, slot: &mut TaggedValue) {
        if let Some(updated) = update_tagged(self.heap, *slot) {
            *slot = updated;
        }
    }

    fn visit_immovable_root(&mut self, _obj: ObjectRef) {}
}

pub(crate) fn update_roots(heap: &Heap) {
    let mut visitor = RootUpdateVisitor { heap };
    iterate_roots_including_clients(
        heap,
        &mut visitor,
        SkipRoots::NONE.with(SkipRoots::GLOBAL_HANDLES),
    );
    // Global handles, including live phantom slots.
    heap.globals.update_all_slots(|slot| {
        if let Some(updated) = update_tagged(heap, *slot) {
            *slot = updated;
        }
    });
    // Heap-internal weak roots.
    if let Some(updated) = update_tagged(heap, heap.allocation_sites_head()) {
        heap.set_allocation_sites_head(updated);
    }
    {
        // Dead records are tombstones; their referents may be long gone.
        let mut table = heap.string_forwarding.lock().unwrap();
        for record in table.iter_mut().filter(|r| !r.dead) {
            if let Some(to) = heap.forwarded(record.original) {
                record.original = to;
            }
            if let Some(to) = heap.forwarded(record.target) {
                record.target = to;
            }
        }
    }
    {
        for bucket_index in 0..heap.string_table.bucket_count() {
            let mut bucket = heap.string_table.bucket(bucket_index).lock().unwrap();
            for entry in bucket.iter_mut() {
                if let Some(to) = heap.forwarded(*entry) {
                    *entry = to;
                }
            }
        }
    }
}

/// Filters out recorded slots that landed inside the freed tail of a
/// shrunken object (right-trimmed arrays, flushed bytecode).
struct InvalidatedSlotsFilter {
    regions: Vec<(u32, u32, u32)>,
}

impl InvalidatedSlotsFilter {
    fn new(heap: &Heap, page: PageId) -> InvalidatedSlotsFilter {
        let regions = heap
            .page(page)
            .invalidated_objects()
            .iter()
            .map(|r| (r.object_word, r.valid_words, r.full_words))
            .collect();
        InvalidatedSlotsFilter { regions }
    }

    fn is_valid(&self, word: u32) -> bool {
        for (start, valid, full) in &self.regions {
            if word >= *start && word < *start + *full {
                return word < *start + *valid;
            }
        }
        true
    }
}

struct PointersUpdatingJob<'c> {
    heap: &'c Heap,
    chunks: Vec<PageId>,
    claim: ClaimCounter,
    parallel: bool,
}

impl Job for PointersUpdatingJob<'_> {
    fn run(&self, delegate: &JobDelegate) {
        while let Some(index) = self.claim.claim() {
            update_chunk(self.heap, self.chunks[index]);
            delegate.yield_now();
        }
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        if !self.parallel {
            return 1;
        }
        worker_count.min(MAX_POINTER_UPDATE_TASKS).min(self.chunks.len().max(1))
    }
}

fn update_remembered_sets(collector: &MarkCompactCollector, heap: &Heap) {
    let chunks: Vec<PageId> = heap
        .all_page_ids()
        .into_iter()
        .filter(|page_id| heap.page(*page_id).has_recorded_slots())
        .collect();
    if chunks.is_empty() {
        return;
    }
    let count = chunks.len();
    let job = PointersUpdatingJob {
        heap,
        chunks,
        claim: ClaimCounter::new(count),
        parallel: *collector.options.parallel_pointer_update,
    };
    collector.pool.run_job(&job);
}

/// Walk every recorded slot of one chunk under its mutex.
pub fn update_chunk(heap: &Heap, page_id: PageId) {
    let page = heap.page(page_id);
    let _guard = page.mutex.lock().unwrap();
    let _write_scope = crate::heap::page::CodePageWriteScope::new(page);
    let filter = InvalidatedSlotsFilter::new(heap, page_id);

    // Slots into evacuation candidates are rewritten and dropped; after this
    // phase no OLD_TO_OLD set is non-empty.
    for class in [RememberedSetClass::OldToOld, RememberedSetClass::OldToCode] {
        page.slot_set(class).iterate_and_filter(|word| {
            if filter.is_valid(word) {
                update_untyped_slot(heap, page_id, word);
            }
            SlotVerdict::Remove
        });
        page.typed_slot_set(class).iterate_and_filter(|slot| {
            if filter.is_valid(slot.offset) {
                update_typed_slot(heap, page_id, slot);
            }
            SlotVerdict::Remove
        });
    }

    page.slot_set(RememberedSetClass::OldToNew).iterate_and_filter(|word| {
        if !filter.is_valid(word) {
            return SlotVerdict::Remove;
        }
        update_old_to_new_slot(heap, page_id, word)
    });
    page.typed_slot_set(RememberedSetClass::OldToNew).iterate_and_filter(|slot| {
        if !filter.is_valid(slot.offset) {
            return SlotVerdict::Remove;
        }
        update_old_to_new_typed_slot(heap, page_id, slot)
    });

    // Shared-heap references are repaired with the same semantics; the set
    // survives for future shared collections.
    page.slot_set(RememberedSetClass::OldToShared).iterate_and_filter(|word| {
        if !filter.is_valid(word) {
            return SlotVerdict::Remove;
        }
        update_untyped_slot(heap, page_id, word);
        SlotVerdict::Keep
    });
}

fn update_untyped_slot(heap: &Heap, page_id: PageId, word: u32) {
    let page = heap.page(page_id);
    let value = TaggedValue::from_bits(page.read_word(word));
    if let Some(updated) = update_tagged(heap, value) {
        page.write_word(word, updated.bits());
    }
}

/// Typed slots use a relocation-info helper that handles each slot-type
/// variant.
fn update_typed_slot(heap: &Heap, page_id: PageId, slot: TypedSlot) {
    let page = heap.page(page_id);
    let word = page.read_word(slot.offset);
    let target = ObjectRef::from_raw(word as u32);
    if target.raw() == 0 {
        return;
    }
    let Some(to) = heap.forwarded(target) else {
        return;
    };
    match slot.kind {
        TypedSlotKind::EmbeddedObjectCompressed => {
            page.write_word(slot.offset, (word & !0xffff_ffff) | to.raw() as u64);
        }
        TypedSlotKind::CodeEntry
        | TypedSlotKind::EmbeddedObjectFull
        | TypedSlotKind::ConstPoolEmbeddedObject
        | TypedSlotKind::ConstPoolCodeEntry => {
            page.write_word(slot.offset, to.raw() as u64);
        }
    }
}

/// The OLD_TO_NEW rules: forwarded targets are followed; targets on
/// NEW_TO_NEW-promoted pages consult the mark bits; everything that is no
/// longer young leaves the set.
fn update_old_to_new_slot(heap: &Heap, page_id: PageId, word: u32) -> SlotVerdict {
    let page = heap.page(page_id);
    let value = TaggedValue::from_bits(page.read_word(word));
    let Some(target) = value.to_object() else {
        return SlotVerdict::Remove;
    };
    let target_page = heap.page(target.page());

    if let Some(to) = heap.forwarded(target) {
        page.write_word(word, value.retarget(to).bits());
        return if heap.in_young(to) {
            SlotVerdict::Keep
        } else {
            SlotVerdict::Remove
        };
    }

    if !target_page.bitmap.is_marked(target.word_index()) {
        // The referent died this cycle. A weak slot observes the cleared
        // sentinel; a strong slot can only sit in an equally dead host.
        if value.is_weak() {
            page.write_word(word, TaggedValue::cleared_weak().bits());
        }
        return SlotVerdict::Remove;
    }

    if target_page.space().is_young() {
        debug_assert!(target_page.has_flag(flags::PAGE_NEW_TO_NEW));
        SlotVerdict::Keep
    } else {
        // Promoted in place (NEW_TO_OLD); the slot is no longer old-to-new.
        SlotVerdict::Remove
    }
}

fn update_old_to_new_typed_slot(heap: &Heap, page_id: PageId, slot: TypedSlot) -> SlotVerdict {
    let page = heap.page(page_id);
    let word = page.read_word(slot.offset);
    let target = ObjectRef::from_raw(word as u32);
    if target.raw() == 0 {
        return SlotVerdict::Remove;
    }
    if let Some(to) = heap.forwarded(target) {
        update_typed_slot(heap, page_id, slot);
        return if heap.in_young(to) {
            SlotVerdict::Keep
        } else {
            SlotVerdict::Remove
        };
    }
    if heap.in_young(target) && heap.is_marked(target) {
        SlotVerdict::Keep
    } else {
        SlotVerdict::Remove
    }
}

/// Pages promoted within the nursery did not record slots; their objects are
/// walked directly.
pub fn update_new_to_new_pages(heap: &Heap) {
    for page_id in heap.space(SpaceId::New).page_ids() {
        let page = heap.page(page_id);
        if !page.has_flag(flags::PAGE_NEW_TO_NEW) {
            continue;
        }
        heap.iterate_page_objects(page_id, |obj, map, _size| {
            let mut visitor = ObjectSlotUpdateVisitor { heap };
            visit_body(heap, obj, map, &mut visitor);
        });
    }
}

/// Rewrites the slots of a single object in place.
pub struct ObjectSlotUpdateVisitor<'h> {
    pub heap: &'h Heap,
}

impl ObjectSlotUpdateVisitor<'_> {
    fn update(&mut self, host: ObjectRef, index: u32) {
        let value = self.heap.read_slot(host, index);
        if let Some(updated) = update_tagged(self.heap, value) {
            self.heap.write_slot_untracked(host, index, updated);
        }
    }
}

impl BodyVisitor for ObjectSlotUpdateVisitor<'_> {
    fn visit_strong(&mut self, host: ObjectRef, index: u32) {
        self.update(host, index);
    }

    fn visit_weak(&mut self, host: ObjectRef, index: u32) {
        self.update(host, index);
    }

    fn visit_map_word(&mut self, host: ObjectRef) {
        // The header's strong-tag encoding matches an ordinary slot, but it
        // must never be confused with a forwarding word for `host` itself.
        if let MapWord::Map(map) = self.heap.map_word(host) {
            if let Some(to) = self.heap.forwarded(map) {
                self.heap.set_map(host, to);
            }
        }
    }

    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32) {
        use crate::object::map::ephemeron_layout;
        self.update(table, ephemeron_layout::key_index(entry));
        self.update(table, ephemeron_layout::value_index(entry));
    }

    fn visit_typed(&mut self, code: ObjectRef, kind: TypedSlotKind, body_offset: u32) {
        let page_offset = code.word_index() + self.heap.code_body_start(code) + body_offset;
        update_typed_slot(
            self.heap,
            code.page(),
            TypedSlot {
                kind,
                offset: page_offset,
            },
        );
    }
}

/// Entries are rewritten via forwarding; strings promoted out of the nursery
/// have their backing-store bytes re-accounted and move to the old table.
pub fn update_external_string_table(heap: &Heap) {
    {
        let mut table = heap.external_strings.lock().unwrap();
        for entry in table.iter_mut() {
            if let Some(to) = heap.forwarded(*entry) {
                *entry = to;
            }
        }
    }
    let mut promoted = Vec::new();
    {
        let mut young = heap.young_external_strings.lock().unwrap();
        young.retain_mut(|entry| {
            let from_space = heap.space_of(*entry);
            if let Some(to) = heap.forwarded(*entry) {
                *entry = to;
            }
            let to_space = heap.space_of(*entry);
            if to_space.is_young() {
                return true;
            }
            let bytes = heap
                .read_slot(*entry, external_string_layout::LENGTH)
                .as_smi() as usize;
            heap.space(from_space).sub_external_bytes(bytes);
            heap.space(to_space).add_external_bytes(bytes);
            promoted.push(*entry);
            false
        });
    }
    if !promoted.is_empty() {
        heap.external_strings.lock().unwrap().extend(promoted);
    }
}

/// Tables whose map word forwards are re-keyed; each recorded key is chased
/// through forwarding, and indices whose key left the nursery are dropped.
/// A full collection additionally drops tables that died this cycle
/// (`tables_must_be_marked`); the young collector does not mark old tables
/// and leaves them in place.
pub fn update_ephemeron_remembered_set(heap: &Heap, tables_must_be_marked: bool) {
    let mut guard = heap.ephemeron_remembered.lock().unwrap();
    let old = std::mem::take(&mut *guard);
    for (table, indices) in old {
        let table_now = heap.forwarded(table).unwrap_or(table);
        if tables_must_be_marked && !heap.is_marked(table_now) {
            continue;
        }
        let mut kept = BTreeSet::new();
        for entry in indices {
            let key = heap.ephemeron_key(table_now, entry);
            let Some(key_obj) = key.to_object() else {
                continue;
            };
            let key_now = heap.forwarded(key_obj).unwrap_or(key_obj);
            if heap.in_young(key_now) {
                kept.insert(entry);
            }
        }
        if !kept.is_empty() {
            guard.insert(table_now, kept);
        }
    }
}
