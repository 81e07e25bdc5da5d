use crate::heap::space::SpaceId;
use crate::object::map::*;
use crate::object::TaggedValue;
use crate::tests::fixture::GcFixture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn dead_weak_referent_leaves_cleared_sentinel() {
    let mut f = GcFixture::new();
    let x = f.heap.new_weak_fixed_array(2, SpaceId::Old);
    let y = f.heap.new_fixed_array(1, SpaceId::Old);
    let keeper = f.heap.new_fixed_array(1, SpaceId::Old);
    f.heap.array_set(x, 0, TaggedValue::from_weak(y));
    f.heap.array_set(x, 1, TaggedValue::from_weak(keeper));
    let _rx = f.root(x);
    let _rk = f.root(keeper);

    f.collect_full();

    assert!(f.heap.is_black(x));
    assert!(f.heap.array_get(x, 0).is_cleared_weak());
    // A live weak referent is untouched.
    assert_eq!(f.heap.array_get(x, 1).to_object(), Some(keeper));
}

#[test]
fn ephemeron_value_lives_only_through_its_key() {
    let mut f = GcFixture::new();
    let table = f.heap.new_ephemeron_table(2, SpaceId::Old);
    let k1 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v1 = f.heap.new_fixed_array(1, SpaceId::Old);
    let k2 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v2 = f.heap.new_fixed_array(1, SpaceId::Old);
    f.heap.ephemeron_set(table, 0, k1, TaggedValue::from_strong(v1));
    f.heap.ephemeron_set(table, 1, k2, TaggedValue::from_strong(v2));
    let _rt = f.root(table);
    let _rk1 = f.root(k1);

    f.collect_full();

    let heap = &f.heap;
    assert!(heap.is_black(k1) && heap.is_black(v1));
    assert!(!heap.is_black(k2) && !heap.is_black(v2));
    // The dead-key entry was removed from the table.
    assert_eq!(heap.ephemeron_key(table, 1).to_object(), Some(heap.well_known().the_hole));
    assert_eq!(heap.ephemeron_key(table, 0).to_object(), Some(k1));
}

#[test]
fn ephemeron_chains_resolve_through_the_fixpoint() {
    // v1 is the key of the second entry, so resolving entry 2 needs the
    // marking performed by entry 1: at least two fixpoint rounds.
    let mut f = GcFixture::new();
    let table = f.heap.new_ephemeron_table(3, SpaceId::Old);
    let k1 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v1 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v2 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v3 = f.heap.new_fixed_array(1, SpaceId::Old);
    f.heap.ephemeron_set(table, 0, k1, TaggedValue::from_strong(v1));
    f.heap.ephemeron_set(table, 1, v1, TaggedValue::from_strong(v2));
    f.heap.ephemeron_set(table, 2, v2, TaggedValue::from_strong(v3));
    let _rt = f.root(table);
    let _rk = f.root(k1);

    f.collect_full();

    for obj in [k1, v1, v2, v3] {
        assert!(f.heap.is_black(obj));
    }
}

#[test]
fn ephemerons_resolve_with_tight_fixpoint_budget() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("ephemeron_fixpoint_iterations", "1");
    });
    let table = f.heap.new_ephemeron_table(3, SpaceId::Old);
    let k1 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v1 = f.heap.new_fixed_array(1, SpaceId::Old);
    let v2 = f.heap.new_fixed_array(1, SpaceId::Old);
    let dead_k = f.heap.new_fixed_array(1, SpaceId::Old);
    let dead_v = f.heap.new_fixed_array(1, SpaceId::Old);
    f.heap.ephemeron_set(table, 0, k1, TaggedValue::from_strong(v1));
    f.heap.ephemeron_set(table, 1, v1, TaggedValue::from_strong(v2));
    f.heap.ephemeron_set(table, 2, dead_k, TaggedValue::from_strong(dead_v));
    let _rt = f.root(table);
    let _rk = f.root(k1);

    f.collect_full();

    assert!(f.heap.is_black(v1) && f.heap.is_black(v2));
    assert!(!f.heap.is_black(dead_k) && !f.heap.is_black(dead_v));
}

#[test]
fn js_weak_ref_and_finalization_registry_clear_dead_targets() {
    let mut f = GcFixture::new();
    let target = f.heap.new_fixed_array(1, SpaceId::Old);
    let weak_ref = f.heap.new_js_weak_ref(target, SpaceId::Old);
    let registry = f.heap.new_finalization_registry(SpaceId::Old);
    let live_target = f.heap.new_fixed_array(1, SpaceId::Old);
    let dead_cell = f.heap.register_weak_cell(
        registry,
        target,
        None,
        TaggedValue::from_smi(7),
        SpaceId::Old,
    );
    let live_cell = f.heap.register_weak_cell(
        registry,
        live_target,
        None,
        TaggedValue::from_smi(8),
        SpaceId::Old,
    );
    let _r1 = f.root(weak_ref);
    let _r2 = f.root(registry);
    let _r3 = f.root(live_target);

    f.collect_full();

    let heap = &f.heap;
    let undefined = heap.well_known().undefined;
    assert_eq!(
        heap.read_slot(weak_ref, js_weak_ref_layout::TARGET).to_object(),
        Some(undefined)
    );
    // The dead cell moved from the active list to the cleared list.
    assert_eq!(
        heap.read_slot(registry, finalization_registry_layout::ACTIVE_CELLS).to_object(),
        Some(live_cell)
    );
    assert_eq!(
        heap.read_slot(registry, finalization_registry_layout::CLEARED_CELLS).to_object(),
        Some(dead_cell)
    );
    assert_eq!(
        heap.read_slot(registry, finalization_registry_layout::NEEDS_CLEANUP).as_smi(),
        1
    );
    assert_eq!(
        heap.read_slot(dead_cell, weak_cell_layout::TARGET).to_object(),
        Some(undefined)
    );
    assert_eq!(
        heap.read_slot(live_cell, weak_cell_layout::TARGET).to_object(),
        Some(live_target)
    );
}

#[test]
fn phantom_handle_callback_fires_for_dead_referent() {
    let mut f = GcFixture::new();
    let doomed = f.heap.new_fixed_array(1, SpaceId::Old);
    let fired = Arc::new(AtomicUsize::new(0));
    let observer = fired.clone();
    f.heap.globals.create_phantom(
        TaggedValue::from_strong(doomed),
        Box::new(move |_obj| {
            observer.fetch_add(1, Ordering::Relaxed);
        }),
    );

    f.collect_full();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    // Phantom registration did not keep the referent alive.
    assert!(!f.heap.is_black(doomed));
}

#[test]
fn string_tables_drop_dead_entries_and_finalize_externals() {
    let mut f = GcFixture::new();
    let kept = f.heap.intern("kept");
    let _dropped = f.heap.intern("dropped");
    assert_eq!(f.heap.string_table.len(), 2);
    let _rk = f.root(kept);

    let resource_data = vec![0u8; 4096];
    let external = f.heap.new_external_string(resource_data, SpaceId::Old);
    let resource = f
        .heap
        .read_slot(external, external_string_layout::RESOURCE)
        .as_smi() as usize;
    assert!(f.heap.external_resources.is_live(resource));

    f.collect_full();

    assert_eq!(f.heap.string_table.len(), 1);
    assert!(f.heap.is_black(kept));
    // The dead external string's backing store was freed.
    assert!(!f.heap.external_resources.is_live(resource));
}

#[test]
fn old_bytecode_is_flushed_to_uncompiled_data() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("bytecode_old_age", "1");
    });
    let pool = f.heap.new_fixed_array(1, SpaceId::Old);
    let bytecode = f.heap.new_bytecode_array(16, Some(pool), SpaceId::Old);
    let sfi = f.heap.new_shared_function_info(bytecode, SpaceId::Old);
    let function = f.heap.new_js_function(sfi, bytecode, SpaceId::Old);
    let _rf = f.root(function);

    f.collect_full();

    let heap = &f.heap;
    // The bytecode was replaced in place by uncompiled data...
    let data = heap.read_slot(sfi, sfi_layout::FUNCTION_DATA).to_object().unwrap();
    assert_eq!(data, bytecode);
    assert_eq!(heap.instance_kind(data), InstanceKind::UncompiledData);
    assert!(heap.is_black(data));
    // ...and the function's code entry fell back to the lazy-compile stub.
    assert_eq!(
        heap.read_slot(function, js_function_layout::CODE).to_object(),
        Some(heap.well_known().lazy_compile_code)
    );
    // The constant pool died with the bytecode.
    assert!(!heap.is_black(pool));
}

#[test]
fn young_bytecode_survives_flushing_candidacy() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("bytecode_old_age", "3");
    });
    let bytecode = f.heap.new_bytecode_array(16, None, SpaceId::Old);
    let sfi = f.heap.new_shared_function_info(bytecode, SpaceId::Old);
    let _r = f.root(sfi);

    f.collect_full();

    assert_eq!(f.heap.instance_kind(bytecode), InstanceKind::BytecodeArray);
    assert!(f.heap.is_black(bytecode));
    assert_eq!(f.heap.read_slot(bytecode, bytecode_layout::AGE).as_smi(), 1);
}

#[test]
fn dead_baseline_code_is_flushed_and_live_baseline_is_retained() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("flush_baseline_code", "true");
    });

    // An SFI whose baseline code is only reachable through the weak slot.
    let flushed_bytecode = f.heap.new_bytecode_array(8, None, SpaceId::Old);
    let flushed_sfi = f.heap.new_shared_function_info(flushed_bytecode, SpaceId::Old);
    let dead_baseline = f.heap.new_code(&[], &[], false, None);
    f.heap.set_baseline_code(flushed_sfi, dead_baseline);

    // And one whose baseline code survives through another strong path.
    let kept_bytecode = f.heap.new_bytecode_array(8, None, SpaceId::Old);
    let kept_sfi = f.heap.new_shared_function_info(kept_bytecode, SpaceId::Old);
    let live_baseline = f.heap.new_code(&[], &[], false, None);
    f.heap.set_baseline_code(kept_sfi, live_baseline);

    let _r1 = f.root(flushed_sfi);
    let _r2 = f.root(kept_sfi);
    let _r3 = f.root(live_baseline);

    f.collect_full();

    let heap = &f.heap;
    // The dead baseline was reset to the bytecode fallback.
    assert!(!heap.is_black(dead_baseline));
    assert_eq!(heap.read_slot(flushed_sfi, sfi_layout::BASELINE_CODE).as_smi(), 0);
    // The live one stayed weakly installed.
    assert!(heap.is_black(live_baseline));
    let kept_slot = heap.read_slot(kept_sfi, sfi_layout::BASELINE_CODE);
    assert!(kept_slot.is_weak());
    assert_eq!(kept_slot.to_object(), Some(live_baseline));
    // Baseline candidacy does not disturb the bytecode itself.
    assert_eq!(
        heap.read_slot(flushed_sfi, sfi_layout::FUNCTION_DATA).to_object(),
        Some(flushed_bytecode)
    );
    assert!(heap.is_black(flushed_bytecode));
}

#[test]
fn transition_arrays_compact_and_descriptor_arrays_trim() {
    let mut f = GcFixture::new();
    let parent = f.heap.new_object_map(2);
    let live_child = f.heap.new_object_map(3);
    let dead_child = f.heap.new_object_map(3);
    let transitions = f.heap.new_transition_array(2, SpaceId::Old);
    f.heap.set_transition(transitions, 0, dead_child);
    f.heap.set_transition(transitions, 1, live_child);
    f.heap.set_map_transitions(parent, transitions);

    // Parent and dead child share a descriptor array; the dead child owned
    // the tail.
    let descriptors = f.heap.new_descriptor_array(4, SpaceId::Old);
    f.heap.set_map_descriptors(parent, descriptors, 2);
    f.heap.set_map_descriptors(dead_child, descriptors, 4);

    let parent_obj = f.heap.new_js_object(parent, SpaceId::Old);
    let child_obj = f.heap.new_js_object(live_child, SpaceId::Old);
    let _r1 = f.root(parent_obj);
    let _r2 = f.root(child_obj);

    f.collect_full();

    let heap = &f.heap;
    assert!(!heap.is_black(dead_child));
    // Dead entry slid out; the live one moved to slot 0.
    assert_eq!(heap.array_length(transitions), 1);
    assert_eq!(heap.array_get(transitions, 0).to_object(), Some(live_child));
    // The shared descriptor array was right-trimmed to the live owner.
    assert_eq!(heap.array_length(descriptors), 2);
}

#[test]
fn uninitialized_transition_array_is_skipped() {
    let mut f = GcFixture::new();
    let map = f.heap.new_object_map(1);
    let transitions = f.heap.new_transition_array(2, SpaceId::Old);
    // Deserialization sentinel in the first entry.
    f.heap.write_slot(
        transitions,
        array_layout::ELEMENTS_START,
        TaggedValue::from_strong(f.heap.well_known().uninitialized),
    );
    f.heap.set_map_transitions(map, transitions);
    let obj = f.heap.new_js_object(map, SpaceId::Old);
    let _r = f.root(obj);

    f.collect_full();

    // Left entirely unchanged.
    assert_eq!(f.heap.array_length(transitions), 2);
    assert_eq!(
        f.heap.array_get(transitions, 0).to_object(),
        Some(f.heap.well_known().uninitialized)
    );
}

#[test]
fn dependent_code_deoptimizes_when_weak_embedded_object_dies() {
    let mut f = GcFixture::new();
    let dead = f.heap.new_fixed_array(1, SpaceId::Old);
    let code = f.heap.new_code(
        &[(TypedSlotKind::EmbeddedObjectFull, 0)],
        &[0],
        /* can_deopt */ true,
        None,
    );
    f.heap.code_write_embedded_ref(code, 0, dead);
    let _r = f.root(code);

    f.collect_full();

    let heap = &f.heap;
    assert!(heap.is_black(code));
    assert!(!heap.is_black(dead));
    assert!(heap.code_is_marked_for_deopt(code));
    // The embedded slot was cleared to undefined.
    assert_eq!(
        crate::object::visit::read_typed_slot(heap, code, 0),
        heap.well_known().undefined
    );
}

#[test]
fn allocation_sites_get_a_one_time_reprieve() {
    let mut f = GcFixture::new();
    let site = f.heap.new_allocation_site(SpaceId::Old);

    f.collect_full();
    // Unreferenced, but zombified and retained once.
    assert!(f.heap.allocation_site_is_zombie(site));
    assert!(f.heap.is_black(site));
    assert_eq!(f.heap.allocation_sites_head().to_object(), Some(site));

    f.collect_full();
    // The second cycle drops it from the list.
    assert_eq!(f.heap.allocation_sites_head().as_smi(), 0);
}
