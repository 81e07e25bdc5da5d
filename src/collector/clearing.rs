//! The weak-reference and dependent-code clearing pipeline.
//!
//! Runs strictly after marking has reached its fixpoint; each step depends on
//! the previous ones. Liveness here means Black.

use crate::collector::MarkCompactCollector;
use crate::heap::page::InvalidatedRegion;
use crate::heap::space::SpaceId;
use crate::heap::Heap;
use crate::object::map::*;
use crate::object::visit::{read_typed_slot, write_typed_slot};
use crate::object::{ObjectRef, TaggedValue};
use crate::scheduler::{ClaimCounter, Job, JobDelegate};
use crate::util::constants::WORD_BYTES;
use std::collections::HashMap;
use std::sync::Mutex;

pub fn clear_non_live_references(collector: &MarkCompactCollector, heap: &Heap) {
    // 1. Strings forwarded during interning.
    clear_string_forwarding_table(heap);
    // 2. The internalized string table (parallel job).
    clean_string_table(collector, heap);
    // 3. Dead external strings are finalized.
    clean_external_strings(heap, &heap.external_strings);
    clean_external_strings(heap, &heap.young_external_strings);
    // 4. Phantom global handles.
    heap.globals.process_phantom_handles(|referent| !heap.is_black(referent));
    // 5. Bytecode/baseline flushing.
    flush_code(collector, heap);
    // 6. Heap-internal weak lists.
    process_weak_lists(heap);
    // 7. Map transitions and descriptor arrays.
    clear_full_map_transitions(collector, heap);
    trim_descriptor_arrays(heap);
    // 8. Weak references, weak collections, JS weak refs, weak cells.
    clear_weak_references(collector, heap);
    clear_weak_collections(collector, heap);
    clear_js_weak_refs(collector, heap);
    clear_weak_cells(collector, heap);
    // 9. Dependent code.
    mark_dependent_code_for_deoptimization(collector, heap);
    // 10. External pointer table sweep (sandboxed builds only).
    #[cfg(feature = "sandbox")]
    {
        let freed = heap.external_pointer_table.sweep();
        trace!("external pointer table sweep freed {} entries", freed);
    }
}

/// Store plus GC-time remembered-set classification: clearing rewrites live
/// graph edges and must keep the sets the update phase walks consistent.
fn write_and_record(heap: &Heap, host: ObjectRef, index: u32, value: TaggedValue) {
    heap.write_slot_untracked(host, index, value);
    if let Some(target) = value.to_object() {
        heap.record_slot(host, index, target);
    }
}

fn clear_string_forwarding_table(heap: &Heap) {
    let mut table = heap.string_forwarding.lock().unwrap();
    for record in table.iter_mut() {
        if record.dead {
            continue;
        }
        if !heap.is_black(record.original) {
            // The forwarded string itself died; drop the record.
            record.dead = true;
            continue;
        }
        if !heap.is_black(record.target) {
            // The internalized target is gone: demote the original back to
            // an unforwarded string.
            heap.write_slot_untracked(
                record.original,
                string_layout::FORWARD_INDEX,
                TaggedValue::from_smi(-1),
            );
            record.dead = true;
        }
    }
}

struct StringTableCleaningJob<'h> {
    heap: &'h Heap,
    claim: ClaimCounter,
}

impl Job for StringTableCleaningJob<'_> {
    fn run(&self, _delegate: &JobDelegate) {
        while let Some(index) = self.claim.claim() {
            let mut bucket = self.heap.string_table.bucket(index).lock().unwrap();
            bucket.retain(|s| self.heap.is_black(*s));
        }
    }

    fn max_concurrency(&self, worker_count: usize) -> usize {
        worker_count.min(self.heap.string_table.bucket_count())
    }
}

fn clean_string_table(collector: &MarkCompactCollector, heap: &Heap) {
    let job = StringTableCleaningJob {
        heap,
        claim: ClaimCounter::new(heap.string_table.bucket_count()),
    };
    collector.pool.run_job(&job);
}

fn clean_external_strings(heap: &Heap, table: &Mutex<Vec<ObjectRef>>) {
    let mut strings = table.lock().unwrap();
    strings.retain(|string| {
        if heap.is_black(*string) {
            return true;
        }
        let resource = heap.read_slot(*string, external_string_layout::RESOURCE).as_smi();
        let freed = heap.external_resources.finalize(resource as usize);
        heap.space(heap.space_of(*string)).sub_external_bytes(freed);
        trace!("finalized external string {} ({} bytes)", string, freed);
        false
    });
}

fn flush_code(collector: &MarkCompactCollector, heap: &Heap) {
    let worklists = &collector.worklists;

    // Dead bytecode is replaced in place by an uncompiled-data object.
    worklists.code_flush_candidates.drain(|sfi| {
        let Some(data) = heap.read_slot(sfi, sfi_layout::FUNCTION_DATA).to_object() else {
            return;
        };
        if heap.instance_kind(data) != InstanceKind::BytecodeArray {
            // A shared bytecode array was already flushed through another
            // candidate; the slot now references the uncompiled data.
            debug_assert_eq!(heap.instance_kind(data), InstanceKind::UncompiledData);
            return;
        }
        if heap.is_black(data) {
            // Still reachable elsewhere: keep it and re-record the slot.
            heap.record_slot(sfi, sfi_layout::FUNCTION_DATA, data);
            return;
        }
        flush_bytecode_in_place(heap, data);
        heap.record_slot(sfi, sfi_layout::FUNCTION_DATA, data);
    });

    // Dead baseline code resets to the bytecode fallback.
    worklists.baseline_flush_candidates.drain(|sfi| {
        let baseline = heap.read_slot(sfi, sfi_layout::BASELINE_CODE);
        let Some(code) = baseline.to_object() else {
            return;
        };
        if heap.is_black(code) {
            heap.record_slot(sfi, sfi_layout::BASELINE_CODE, code);
        } else {
            heap.write_slot_untracked(sfi, sfi_layout::BASELINE_CODE, TaggedValue::from_smi(0));
        }
    });

    // Functions whose code was flushed fall back to the lazy-compile stub.
    let lazy_compile = heap.well_known().lazy_compile_code;
    worklists.flushed_functions.drain(|function| {
        let Some(code) = heap.read_slot(function, js_function_layout::CODE).to_object() else {
            return;
        };
        let was_flushed = !heap.is_black(code)
            || heap.instance_kind(code) == InstanceKind::UncompiledData;
        if was_flushed {
            write_and_record(
                heap,
                function,
                js_function_layout::CODE,
                TaggedValue::from_strong(lazy_compile),
            );
        } else {
            heap.record_slot(function, js_function_layout::CODE, code);
        }
    });
}

/// Overwrite a dead bytecode array with an uncompiled-data object of known
/// smaller size, tagging the remaining bytes as filler.
fn flush_bytecode_in_place(heap: &Heap, bytecode: ObjectRef) {
    let page = heap.page(bytecode.page());
    let word = bytecode.word_index();
    let old_size = heap.object_size_words(bytecode);
    let new_size = uncompiled_data_layout::SIZE_WORDS;
    debug_assert!(new_size < old_size);

    heap.set_map(bytecode, heap.well_known().map_for(InstanceKind::UncompiledData));
    heap.write_slot_untracked(
        bytecode,
        uncompiled_data_layout::INFERRED_NAME,
        TaggedValue::from_smi(0),
    );
    heap.create_filler(bytecode.page(), word + new_size, old_size - new_size);

    // The replacement is reachable from its (live) shared function info.
    page.bitmap.mark_black(word);
    page.add_live_bytes(new_size as usize * WORD_BYTES);

    // Slots recorded inside the old body are stale now.
    page.register_invalidated_object(InvalidatedRegion {
        object_word: word,
        valid_words: new_size,
        full_words: old_size,
    });
    trace!("flushed bytecode {} ({} -> {} words)", bytecode, old_size, new_size);
}

/// The generic weak-list retainer: retains Black entries and grants
/// allocation sites a one-time reprieve (zombie, marked Black).
pub fn prune_weak_list(
    heap: &Heap,
    head: TaggedValue,
    is_live: &dyn Fn(ObjectRef) -> bool,
) -> TaggedValue {
    let mut kept: Vec<ObjectRef> = Vec::new();
    let mut cursor = head;
    while let Some(site) = cursor.to_object() {
        let next = heap.read_slot(site, allocation_site_layout::NEXT);
        if is_live(site) {
            kept.push(site);
        } else if !heap.allocation_site_is_zombie(site) {
            let flags = heap.read_slot(site, allocation_site_layout::FLAGS).as_smi();
            heap.write_slot_untracked(
                site,
                allocation_site_layout::FLAGS,
                TaggedValue::from_smi(flags | allocation_site_layout::FLAG_ZOMBIE),
            );
            let page = heap.page(site.page());
            page.bitmap.mark_black(site.word_index());
            page.add_live_bytes(allocation_site_layout::SIZE_WORDS as usize * WORD_BYTES);
            kept.push(site);
        }
        cursor = next;
    }

    for i in 0..kept.len() {
        let next = if i + 1 < kept.len() {
            TaggedValue::from_strong(kept[i + 1])
        } else {
            TaggedValue::from_smi(0)
        };
        write_and_record(heap, kept[i], allocation_site_layout::NEXT, next);
    }
    match kept.first() {
        Some(first) => TaggedValue::from_strong(*first),
        None => TaggedValue::from_smi(0),
    }
}

fn process_weak_lists(heap: &Heap) {
    let head = heap.allocation_sites_head();
    let new_head = prune_weak_list(heap, head, &|site| heap.is_black(site));
    heap.set_allocation_sites_head(new_head);
}

/// Compact each discovered transition array in place, sliding live entries
/// left. Arrays still being deserialized (first entry is the uninitialized
/// sentinel) are skipped and left unchanged.
fn clear_full_map_transitions(collector: &MarkCompactCollector, heap: &Heap) {
    let uninitialized = heap.well_known().uninitialized;
    collector.worklists.transition_arrays.drain(|array| {
        let len = heap.array_length(array);
        if len > 0 {
            let first = heap.array_get(array, 0);
            if first.is_strong() && first.to_object() == Some(uninitialized) {
                return;
            }
        }

        let mut kept = 0u32;
        for i in 0..len {
            let entry = heap.array_get(array, i);
            let live = match entry.to_object() {
                Some(target) => heap.is_black(target),
                None => false,
            };
            if live {
                if kept != i {
                    write_and_record(heap, array, array_layout::ELEMENTS_START + kept, entry);
                }
                kept += 1;
            }
        }
        if kept < len {
            right_trim_array(heap, array, kept, len);
        }
    });
}

/// Shrink an array-shaped object to `new_len` entries, filling the tail and
/// invalidating its stale recorded slots.
fn right_trim_array(heap: &Heap, array: ObjectRef, new_len: u32, old_len: u32) {
    debug_assert!(new_len < old_len);
    let page = heap.page(array.page());
    let word = array.word_index();
    heap.write_slot_untracked(array, array_layout::LENGTH, TaggedValue::from_smi(new_len as i64));
    let tail_start = word + array_layout::ELEMENTS_START + new_len;
    let tail_words = old_len - new_len;
    heap.create_filler(array.page(), tail_start, tail_words);
    page.register_invalidated_object(InvalidatedRegion {
        object_word: word,
        valid_words: array_layout::ELEMENTS_START + new_len,
        full_words: array_layout::ELEMENTS_START + old_len,
    });
    if page.bitmap.is_black(word) {
        // The object was sized at its old length when it was blackened.
        let page_live = page.live_bytes();
        page.set_live_bytes(page_live - tail_words as usize * WORD_BYTES);
    }
}

/// A descriptor array owned only by dead maps dies with them; one shared
/// with live maps is right-trimmed to the widest live owner.
fn trim_descriptor_arrays(heap: &Heap) {
    let mut required: HashMap<ObjectRef, u32> = HashMap::new();
    for page_id in heap.space(SpaceId::Map).page_ids() {
        heap.iterate_page_objects(page_id, |obj, map, _size| {
            if map_kind(heap, map) != InstanceKind::Map || !heap.is_black(obj) {
                return;
            }
            if let Some(descriptors) = heap.read_slot(obj, map_layout::DESCRIPTORS).to_object() {
                let own = heap.read_slot(obj, map_layout::OWN_DESCRIPTORS).as_smi() as u32;
                let entry = required.entry(descriptors).or_insert(0);
                *entry = (*entry).max(own);
            }
        });
    }
    for (descriptors, needed) in required {
        if !heap.is_black(descriptors) {
            continue;
        }
        let len = heap.array_length(descriptors);
        if needed < len {
            right_trim_array(heap, descriptors, needed, len);
        }
    }
}

/// Dead weak referents are replaced by the cleared-weak sentinel.
fn clear_weak_references(collector: &MarkCompactCollector, heap: &Heap) {
    collector.worklists.weak_references.drain(|slot| {
        let value = heap.read_slot(slot.host, slot.index);
        if !value.is_weak() {
            return;
        }
        let target = value.to_object().unwrap();
        if !heap.is_black(target) {
            heap.write_slot_untracked(slot.host, slot.index, TaggedValue::cleared_weak());
        }
    });
}

/// Remove dead-key entries from ephemeron hash tables.
fn clear_weak_collections(collector: &MarkCompactCollector, heap: &Heap) {
    let the_hole = heap.the_hole_value();
    collector.worklists.ephemeron_tables.drain(|table| {
        let capacity = heap.ephemeron_capacity(table);
        for entry in 0..capacity {
            let key_value = heap.ephemeron_key(table, entry);
            let Some(key) = key_value.to_object() else {
                continue;
            };
            if !key_value.is_weak() {
                continue;
            }
            if !heap.is_black(key) {
                heap.write_slot_untracked(table, ephemeron_layout::key_index(entry), the_hole);
                heap.write_slot_untracked(table, ephemeron_layout::value_index(entry), the_hole);
            } else {
                debug_assert!(
                    heap.ephemeron_value(table, entry)
                        .to_object()
                        .map(|v| heap.is_black(v))
                        .unwrap_or(true),
                    "live ephemeron key with dead value after fixpoint"
                );
            }
        }
    });
}

fn clear_js_weak_refs(collector: &MarkCompactCollector, heap: &Heap) {
    let undefined = heap.undefined_value();
    collector.worklists.js_weak_refs.drain(|weak_ref| {
        let target = heap.read_slot(weak_ref, js_weak_ref_layout::TARGET);
        if let Some(obj) = target.to_object() {
            if target.is_weak() && !heap.is_black(obj) {
                heap.write_slot_untracked(weak_ref, js_weak_ref_layout::TARGET, undefined);
            }
        }
    });
}

fn clear_weak_cells(collector: &MarkCompactCollector, heap: &Heap) {
    let undefined = heap.undefined_value();
    collector.worklists.weak_cells.drain(|cell| {
        let target = heap.read_slot(cell, weak_cell_layout::TARGET);
        if let Some(obj) = target.to_object() {
            if target.is_weak() && !heap.is_black(obj) {
                // The registry gains a cleanup task for this cell.
                let registry = heap
                    .read_slot(cell, weak_cell_layout::REGISTRY)
                    .to_object()
                    .expect("weak cell without registry");
                unlink_weak_cell(heap, registry, cell);
                let cleared_head =
                    heap.read_slot(registry, finalization_registry_layout::CLEARED_CELLS);
                write_and_record(heap, cell, weak_cell_layout::NEXT, cleared_head);
                write_and_record(
                    heap,
                    registry,
                    finalization_registry_layout::CLEARED_CELLS,
                    TaggedValue::from_strong(cell),
                );
                heap.write_slot_untracked(
                    registry,
                    finalization_registry_layout::NEEDS_CLEANUP,
                    TaggedValue::from_smi(1),
                );
                heap.write_slot_untracked(cell, weak_cell_layout::TARGET, undefined);
            }
        }
        let token = heap.read_slot(cell, weak_cell_layout::UNREGISTER_TOKEN);
        if let Some(obj) = token.to_object() {
            if token.is_weak() && !heap.is_black(obj) {
                heap.write_slot_untracked(cell, weak_cell_layout::UNREGISTER_TOKEN, undefined);
            }
        }
    });
}

fn unlink_weak_cell(heap: &Heap, registry: ObjectRef, cell: ObjectRef) {
    let mut prev: Option<ObjectRef> = None;
    let mut cursor = heap.read_slot(registry, finalization_registry_layout::ACTIVE_CELLS);
    while let Some(current) = cursor.to_object() {
        let next = heap.read_slot(current, weak_cell_layout::NEXT);
        if current == cell {
            match prev {
                Some(prev_cell) => write_and_record(heap, prev_cell, weak_cell_layout::NEXT, next),
                None => write_and_record(
                    heap,
                    registry,
                    finalization_registry_layout::ACTIVE_CELLS,
                    next,
                ),
            }
            return;
        }
        prev = Some(current);
        cursor = next;
    }
    debug_assert!(false, "weak cell {} not found on its registry", cell);
}

/// Every live code object whose weakly embedded object died is marked for
/// deoptimization and has the embedded slot cleared.
fn mark_dependent_code_for_deoptimization(collector: &MarkCompactCollector, heap: &Heap) {
    let undefined = heap.well_known().undefined;
    collector.worklists.weak_objects_in_code.drain(|slot| {
        if !heap.is_black(slot.code) {
            return;
        }
        let target = read_typed_slot(heap, slot.code, slot.body_offset);
        if target.raw() == 0 || heap.is_black(target) {
            return;
        }
        let _write_scope =
            crate::heap::page::CodePageWriteScope::new(heap.page(slot.code.page()));
        let code_flags = heap.read_slot(slot.code, code_layout::FLAGS).as_smi();
        heap.write_slot_untracked(
            slot.code,
            code_layout::FLAGS,
            TaggedValue::from_smi(code_flags | code_layout::FLAG_MARKED_FOR_DEOPT),
        );
        write_typed_slot(heap, slot.code, slot.kind, slot.body_offset, undefined);
        trace!("code {} marked for deoptimization", slot.code);
    });
}
