use crate::heap::page::flags;
use crate::heap::space::SpaceId;
use crate::object::MapWord;
use crate::tests::fixture::GcFixture;
use crate::util::constants::WORD_BYTES;

#[test]
fn fragmented_pages_are_evacuated_and_released() {
    let mut f = GcFixture::new();

    // Two pages that will end up ~20% live, then a full page on top.
    let mut sparse_roots = Vec::new();
    let mut sparse_pages = Vec::new();
    for _ in 0..2 {
        let page = f.fresh_page(SpaceId::Old);
        sparse_pages.push(page);
        for i in 0..12 {
            let obj = f.heap.new_fixed_array(250, SpaceId::Old);
            assert_eq!(obj.page(), page);
            if i % 5 == 0 {
                // Keep 3 of 12 objects (~19% of the page area).
                sparse_roots.push(f.root(obj));
            }
        }
    }
    let full_page = f.fresh_page(SpaceId::Old);
    let mut full_roots = Vec::new();
    for _ in 0..16 {
        let obj = f.heap.new_fixed_array(250, SpaceId::Old);
        full_roots.push(f.root(obj));
    }
    // Park the linear allocation area elsewhere.
    f.fresh_page(SpaceId::Old);

    // First cycle sweeps, establishing the fragmentation picture.
    f.collect_full();
    for page in &sparse_pages {
        assert!(f.heap.page(*page).fragmentation_pct() >= 20);
    }

    // Second cycle selects the fragmented pages and compacts them away.
    f.collect_full();

    let live_pages = f.heap.all_page_ids();
    for page in &sparse_pages {
        assert!(!live_pages.contains(page), "page {} was not released", page);
    }
    assert!(live_pages.contains(&full_page));
    for handle in &sparse_roots {
        let obj = f.root_value(*handle);
        assert!(!sparse_pages.contains(&obj.page()));
        assert!(f.heap.is_black(obj));
    }
    for handle in &full_roots {
        assert_eq!(f.root_value(*handle).page(), full_page);
    }
}

#[test]
fn aborted_evacuation_recovers_and_completes_the_cycle() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("manual_evacuation_candidates_selection", "true");
    });

    // A holder elsewhere referencing the first object on the doomed page.
    let holder = f.heap.new_fixed_array(1, SpaceId::Old);
    let _rh = f.root(holder);

    let page = f.fresh_page(SpaceId::Old);
    // Objects bigger than an allocation buffer, so every copy performs its
    // own raw allocation.
    let x = f.heap.new_fixed_array(600, SpaceId::Old);
    let y = f.heap.new_fixed_array(600, SpaceId::Old);
    assert_eq!(x.page(), page);
    assert_eq!(y.page(), page);
    f.heap.array_set(holder, 0, f.strong(x));
    let rx = f.root(x);
    let ry = f.root(y);

    f.heap
        .page(page)
        .set_flag(flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
    f.fresh_page(SpaceId::Old);

    // The first copy succeeds, the second allocation fails.
    f.heap.set_oom_countdown(SpaceId::Old, 1);
    f.collect_full();
    f.heap.set_oom_countdown(SpaceId::Old, -1);

    let heap = &f.heap;
    let page_ref = heap.page(page);
    assert!(page_ref.has_flag(flags::COMPACTION_WAS_ABORTED));
    assert!(!page_ref.is_evacuation_candidate());

    // x escaped; every reference to it was rewritten.
    let x_now = f.root_value(rx);
    assert_ne!(x_now.page(), page);
    assert_eq!(heap.array_get(holder, 0).to_object(), Some(x_now));

    // y stayed put, and no forwarding word survives on the page.
    assert_eq!(f.root_value(ry), y);
    heap.iterate_page_objects(page, |obj, _map, _size| {
        assert!(matches!(heap.map_word(obj), MapWord::Map(_)));
    });
    assert_eq!(heap.page(page).live_bytes(), 602 * WORD_BYTES);
}

#[test]
#[should_panic(expected = "aborted evacuation escalated by flag")]
fn crash_on_aborted_evacuation_escalates() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("manual_evacuation_candidates_selection", "true");
        o.set_from_command_line("crash_on_aborted_evacuation", "true");
        // A single worker keeps the panic on the joining thread.
        o.set_from_command_line("threads", "1");
    });
    let page = f.fresh_page(SpaceId::Old);
    let obj = f.heap.new_fixed_array(600, SpaceId::Old);
    let _r = f.root(obj);
    f.heap
        .page(page)
        .set_flag(flags::FORCE_EVACUATION_CANDIDATE_FOR_TESTING);
    f.fresh_page(SpaceId::Old);
    f.heap.set_oom_countdown(SpaceId::Old, 0);
    f.collect_full();
}

#[test]
fn stress_compaction_moves_objects_on_alternating_pages() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("stress_compaction", "true");
    });
    let mut handles = Vec::new();
    for _ in 0..4 {
        f.fresh_page(SpaceId::Old);
        for _ in 0..4 {
            let obj = f.heap.new_fixed_array(100, SpaceId::Old);
            handles.push(f.root(obj));
        }
    }
    f.fresh_page(SpaceId::Old);

    f.collect_full();

    // Whatever moved stayed reachable with intact contents.
    for handle in &handles {
        let obj = f.root_value(*handle);
        assert!(f.heap.is_black(obj));
        assert_eq!(f.heap.array_length(obj), 100);
    }
}

#[test]
fn compaction_disabled_with_stack_when_flag_forbids_it() {
    let mut f = GcFixture::with_options(|o| {
        o.set_from_command_line("compact_with_stack", "false");
        o.set_from_command_line("compact_on_every_full_gc", "true");
    });
    let page = f.fresh_page(SpaceId::Old);
    let obj = f.heap.new_fixed_array(10, SpaceId::Old);
    let root = f.root(obj);
    f.fresh_page(SpaceId::Old);

    // Default stack state says a stack may refer into the heap.
    f.collect_full();
    assert_eq!(f.root_value(root).page(), page);
}
