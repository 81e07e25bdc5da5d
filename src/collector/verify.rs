//! The marking verifier: walks the whole heap after clearing and checks the
//! marking invariants. Runs in debug builds and under the `sanity` feature.

use crate::heap::Heap;
use crate::object::map::{ephemeron_layout, TypedSlotKind};
use crate::object::visit::{read_typed_slot, visit_body, BodyVisitor};
use crate::object::ObjectRef;
use crate::util::constants::WORD_BYTES;

struct VerifyVisitor<'h> {
    heap: &'h Heap,
}

impl VerifyVisitor<'_> {
    fn check_black(&self, host: ObjectRef, index: u32, target: ObjectRef) {
        assert!(
            self.heap.is_black(target),
            "black {} has slot {} referencing non-black {}",
            host,
            index,
            target
        );
    }
}

impl BodyVisitor for VerifyVisitor<'_> {
    fn visit_strong(&mut self, host: ObjectRef, index: u32) {
        let value = self.heap.read_slot(host, index);
        if let Some(target) = value.to_object() {
            self.check_black(host, index, target);
        }
    }

    fn visit_weak(&mut self, host: ObjectRef, index: u32) {
        // Dead weak referents hold the cleared sentinel by now, so whatever
        // references remain must be live.
        let value = self.heap.read_slot(host, index);
        if let Some(target) = value.to_object() {
            self.check_black(host, index, target);
        }
    }

    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32) {
        let key = self.heap.read_slot(table, ephemeron_layout::key_index(entry));
        let value = self.heap.read_slot(table, ephemeron_layout::value_index(entry));
        if let Some(key_obj) = key.to_object() {
            self.check_black(table, ephemeron_layout::key_index(entry), key_obj);
            if let Some(value_obj) = value.to_object() {
                // If the key is live the value must be.
                self.check_black(table, ephemeron_layout::value_index(entry), value_obj);
            }
        }
    }

    fn visit_typed(&mut self, code: ObjectRef, _kind: TypedSlotKind, body_offset: u32) {
        let target = read_typed_slot(self.heap, code, body_offset);
        if target.raw() != 0 {
            self.check_black(code, body_offset, target);
        }
    }
}

/// Check, for every page: no Grey object survives, no `01` bit pair exists,
/// the recorded live bytes equal the sum of Black object sizes, and every
/// slot of a Black object references a Black object.
pub fn verify_marking(heap: &Heap) {
    for page_id in heap.all_page_ids() {
        let page = heap.page(page_id);
        let mut black_bytes = 0usize;
        let mut object_starts = Vec::new();
        heap.iterate_page_objects(page_id, |obj, map, size| {
            let word = obj.word_index();
            object_starts.push(word);
            assert!(
                !page.bitmap.is_grey(word),
                "grey object {} after marking finished",
                obj
            );
            if page.bitmap.is_black(word) {
                black_bytes += size as usize * WORD_BYTES;
                let mut visitor = VerifyVisitor { heap };
                visit_body(heap, obj, map, &mut visitor);
            }
        });
        assert!(
            !page.bitmap.scan_for_corruption(object_starts.into_iter()),
            "impossible 01 mark pattern on page {}",
            page_id
        );
        assert_eq!(
            page.live_bytes(),
            black_bytes,
            "live-byte counter mismatch on page {}",
            page_id
        );
    }
}
