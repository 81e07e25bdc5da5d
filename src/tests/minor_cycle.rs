use crate::heap::page::flags;
use crate::heap::remembered_set::RememberedSetClass;
use crate::heap::space::SpaceId;
use crate::object::TaggedValue;
use crate::tests::fixture::GcFixture;

#[test]
fn hot_pages_promote_whole_and_nursery_drains() {
    let mut f = GcFixture::new();

    // A hot page: well above the promotion threshold.
    let hot_page = f.fresh_page(SpaceId::New);
    let mut hot_roots = Vec::new();
    for _ in 0..5 {
        let obj = f.heap.new_fixed_array(600, SpaceId::New);
        assert_eq!(obj.page(), hot_page);
        hot_roots.push((f.root(obj), obj));
    }
    // A cold page holding one small survivor.
    let cold_page = f.fresh_page(SpaceId::New);
    let survivor = f.heap.new_fixed_array(4, SpaceId::New);
    assert_eq!(survivor.page(), cold_page);
    let survivor_root = f.root(survivor);

    // First young cycle: the hot page is fresh, so it ages within the
    // nursery; the cold page's survivor is promoted by copy.
    f.collect_young();

    let heap = &f.heap;
    assert!(heap.page(hot_page).has_flag(flags::NEW_BELOW_AGE_MARK));
    assert_eq!(heap.space_of(hot_roots[0].1), SpaceId::New);
    for (handle, obj) in &hot_roots {
        assert_eq!(f.root_value(*handle), *obj, "aging must not move objects");
    }
    let survivor_now = f.root_value(survivor_root);
    assert!(!f.heap.in_young(survivor_now));
    assert!(!f.heap.all_page_ids().contains(&cold_page));

    // Second young cycle: the aged page is promoted whole to old space.
    f.collect_young();

    let heap = &f.heap;
    assert_eq!(heap.page(hot_page).space(), SpaceId::Old);
    assert!(heap.page(hot_page).has_flag(flags::PAGE_NEW_TO_OLD));
    for (handle, obj) in &hot_roots {
        assert_eq!(f.root_value(*handle), *obj);
        assert!(!heap.in_young(*obj));
    }
    // The nursery is empty and the age mark sits at the allocation top.
    assert_eq!(heap.space(SpaceId::New).page_count(), 0);
    assert_eq!(heap.space(SpaceId::New).age_mark(), heap.new_space_top_packed());
}

#[test]
fn old_to_new_remembered_set_discovers_and_repairs_nursery_references() {
    let mut f = GcFixture::new();
    let holder = f.heap.new_fixed_array(1, SpaceId::Old);
    let _rh = f.root(holder);
    f.fresh_page(SpaceId::New);
    let young = f.heap.new_fixed_array(6, SpaceId::New);
    // The recording store files this slot under OLD_TO_NEW.
    f.heap.array_set(holder, 0, f.strong(young));
    assert!(!f
        .heap
        .page(holder.page())
        .slot_set(RememberedSetClass::OldToNew)
        .is_empty());

    // No root references the young object directly.
    f.collect_young();

    let heap = &f.heap;
    let promoted = heap.array_get(holder, 0).to_object().expect("slot lost");
    assert!(!heap.in_young(promoted));
    assert_eq!(heap.array_length(promoted), 6);
    // The slot left the remembered set once its target left the nursery.
    assert!(heap
        .page(holder.page())
        .slot_set(RememberedSetClass::OldToNew)
        .is_empty());
}

#[test]
fn dead_young_weak_referents_are_cleared_by_the_update_walk() {
    let mut f = GcFixture::new();
    let holder = f.heap.new_weak_fixed_array(1, SpaceId::Old);
    let _rh = f.root(holder);
    f.fresh_page(SpaceId::New);
    let doomed = f.heap.new_fixed_array(2, SpaceId::New);
    f.heap.array_set(holder, 0, TaggedValue::from_weak(doomed));

    f.collect_young();

    assert!(f.heap.array_get(holder, 0).is_cleared_weak());
}

#[test]
fn young_external_strings_are_finalized_when_dead() {
    let mut f = GcFixture::new();
    f.fresh_page(SpaceId::New);
    let dead = f.heap.new_external_string(vec![1u8; 512], SpaceId::New);
    let kept = f.heap.new_external_string(vec![2u8; 256], SpaceId::New);
    let kept_root = f.root(kept);
    let dead_resource = f
        .heap
        .read_slot(dead, crate::object::map::external_string_layout::RESOURCE)
        .as_smi() as usize;

    f.collect_young();

    let heap = &f.heap;
    assert!(!heap.external_resources.is_live(dead_resource));
    // The survivor was promoted and moved to the old external table.
    let kept_now = f.root_value(kept_root);
    assert!(!heap.in_young(kept_now));
    assert!(heap.external_strings.lock().unwrap().contains(&kept_now));
    assert!(heap.young_external_strings.lock().unwrap().is_empty());
}

#[test]
fn young_large_objects_promote_eagerly() {
    let mut f = GcFixture::new();
    let big = f.heap.new_fixed_array(3000, SpaceId::New);
    assert_eq!(f.heap.space_of(big), SpaceId::NewLarge);
    let root = f.root(big);
    let doomed_big = f.heap.new_fixed_array(3000, SpaceId::New);
    let doomed_page = doomed_big.page();

    f.collect_young();

    let heap = &f.heap;
    // Promotion flips the page; the object does not move.
    assert_eq!(f.root_value(root), big);
    assert_eq!(heap.space_of(big), SpaceId::Large);
    assert!(!heap.all_page_ids().contains(&doomed_page));
}

#[test]
fn ephemeron_remembered_set_follows_promoted_keys() {
    let mut f = GcFixture::new();
    let table = f.heap.new_ephemeron_table(1, SpaceId::Old);
    let _rt = f.root(table);
    f.fresh_page(SpaceId::New);
    let key = f.heap.new_fixed_array(1, SpaceId::New);
    let _rk = f.root(key);
    f.heap
        .ephemeron_set(table, 0, key, TaggedValue::from_smi(5));
    assert!(f.heap.ephemeron_remembered.lock().unwrap().contains_key(&table));

    f.collect_young();

    let heap = &f.heap;
    // The key left the nursery, so the index was dropped.
    assert!(heap.ephemeron_remembered.lock().unwrap().is_empty());
    let key_now = heap.ephemeron_key(table, 0).to_object().expect("key slot lost");
    assert!(!heap.in_young(key_now));
}
