//! Slot enumeration over object bodies.
//!
//! [`visit_body`] applies a map's layout to classify every slot of an object
//! by semantic kind. Concrete visitors implement the subset of callbacks they
//! need; the dispatch is static because the marking visitor is hot.

use crate::heap::Heap;
use crate::object::map::*;
use crate::object::ObjectRef;

/// A visitor over the slots of a single object.
///
/// Default implementations fold the rarer slot kinds into the common ones:
/// a weak-list link behaves like a strong slot for recording and updating,
/// and the custom-weak fields of weak cells and JS weak refs behave like
/// ordinary weak slots. The marker overrides those.
pub trait BodyVisitor {
    /// A slot that must keep its referent alive.
    fn visit_strong(&mut self, host: ObjectRef, index: u32);

    /// A maybe-object slot: a weak reference, or a strong one stored in a
    /// weak position.
    fn visit_weak(&mut self, host: ObjectRef, index: u32);

    /// The header word. Its encoding matches a strong slot.
    fn visit_map_word(&mut self, host: ObjectRef) {
        self.visit_strong(host, 0);
    }

    /// One (key, value) entry of an ephemeron hash table.
    fn visit_ephemeron(&mut self, table: ObjectRef, entry: u32);

    /// A typed code-relocation slot; `body_offset` indexes the code body.
    fn visit_typed(&mut self, code: ObjectRef, kind: TypedSlotKind, body_offset: u32);

    /// A link in a heap-internal weak list (pruned by the retainer, not the
    /// marker).
    fn visit_weak_list_link(&mut self, host: ObjectRef, index: u32) {
        self.visit_strong(host, index);
    }

    /// A field cleared by the weak-object pipeline rather than generic weak
    /// processing (JS weak ref targets, weak cell targets and tokens).
    fn visit_custom_weak(&mut self, host: ObjectRef, index: u32) {
        self.visit_weak(host, index);
    }
}

/// Enumerate the slots of `obj` according to `map`'s instance kind.
pub fn visit_body<V: BodyVisitor>(heap: &Heap, obj: ObjectRef, map: ObjectRef, visitor: &mut V) {
    use InstanceKind::*;

    visitor.visit_map_word(obj);

    match map_kind(heap, map) {
        Map => {
            visitor.visit_weak(obj, map_layout::TRANSITIONS);
            visitor.visit_strong(obj, map_layout::DESCRIPTORS);
        }
        FixedArray | DescriptorArray => {
            let len = heap.read_slot(obj, array_layout::LENGTH).as_smi() as u32;
            for i in 0..len {
                visitor.visit_strong(obj, array_layout::ELEMENTS_START + i);
            }
        }
        WeakFixedArray | TransitionArray => {
            let len = heap.read_slot(obj, array_layout::LENGTH).as_smi() as u32;
            for i in 0..len {
                visitor.visit_weak(obj, array_layout::ELEMENTS_START + i);
            }
        }
        EphemeronHashTable => {
            let capacity = heap.read_slot(obj, ephemeron_layout::CAPACITY).as_smi() as u32;
            for entry in 0..capacity {
                visitor.visit_ephemeron(obj, entry);
            }
        }
        BytecodeArray => {
            visitor.visit_strong(obj, bytecode_layout::CONSTANT_POOL);
        }
        UncompiledData => {
            visitor.visit_strong(obj, uncompiled_data_layout::INFERRED_NAME);
        }
        Code => {
            visitor.visit_strong(obj, code_layout::DEOPT_LITERALS);
            let relocs = heap.read_slot(obj, code_layout::RELOC_COUNT).as_smi() as u32;
            for i in 0..relocs {
                let kind = TypedSlotKind::from_code(
                    heap.read_slot(obj, code_layout::RELOC_START + 2 * i).as_smi() as u8,
                );
                let offset =
                    heap.read_slot(obj, code_layout::RELOC_START + 2 * i + 1).as_smi() as u32;
                visitor.visit_typed(obj, kind, offset);
            }
        }
        SharedFunctionInfo => {
            visitor.visit_strong(obj, sfi_layout::FUNCTION_DATA);
            visitor.visit_weak(obj, sfi_layout::BASELINE_CODE);
        }
        JsFunction => {
            visitor.visit_strong(obj, js_function_layout::CODE);
            visitor.visit_strong(obj, js_function_layout::SHARED);
            visitor.visit_strong(obj, js_function_layout::CONTEXT);
        }
        JsObject => {
            let size = map_instance_size(heap, map);
            for i in 1..size {
                visitor.visit_strong(obj, i);
            }
        }
        JsWeakRef => {
            visitor.visit_custom_weak(obj, js_weak_ref_layout::TARGET);
        }
        WeakCell => {
            visitor.visit_custom_weak(obj, weak_cell_layout::TARGET);
            visitor.visit_custom_weak(obj, weak_cell_layout::UNREGISTER_TOKEN);
            visitor.visit_strong(obj, weak_cell_layout::REGISTRY);
            visitor.visit_strong(obj, weak_cell_layout::NEXT);
            visitor.visit_strong(obj, weak_cell_layout::HOLDINGS);
        }
        FinalizationRegistry => {
            visitor.visit_strong(obj, finalization_registry_layout::ACTIVE_CELLS);
            visitor.visit_strong(obj, finalization_registry_layout::CLEARED_CELLS);
        }
        AllocationSite => {
            visitor.visit_weak_list_link(obj, allocation_site_layout::NEXT);
        }
        WrapperObject => {
            visitor.visit_strong(obj, wrapper_layout::PAYLOAD);
        }
        // No pointer slots beyond the map word.
        Oddball | FreeSpace | OneWordFiller | ByteArray | SeqString | InternalizedString
        | ExternalString => {}
    }
}

/// Read the raw ref bits of a typed slot in a code body. Every slot kind
/// keeps the ref bits in the low half of the instruction word; the kinds
/// differ in what the high half means on write.
pub fn read_typed_slot(heap: &Heap, code: ObjectRef, body_offset: u32) -> ObjectRef {
    let relocs = heap.read_slot(code, code_layout::RELOC_COUNT).as_smi() as u32;
    let word = heap.read_word(code, code_layout::body_start(relocs) + body_offset);
    ObjectRef::from_raw(word as u32)
}

/// Write the raw ref bits of a typed slot in a code body.
pub fn write_typed_slot(
    heap: &Heap,
    code: ObjectRef,
    kind: TypedSlotKind,
    body_offset: u32,
    target: ObjectRef,
) {
    let relocs = heap.read_slot(code, code_layout::RELOC_COUNT).as_smi() as u32;
    let index = code_layout::body_start(relocs) + body_offset;
    match kind {
        TypedSlotKind::EmbeddedObjectCompressed => {
            // Preserve the high half of the instruction word.
            let old = heap.read_word(code, index);
            heap.write_word(code, index, (old & !0xffff_ffff) | target.raw() as u64);
        }
        _ => heap.write_word(code, index, target.raw() as u64),
    }
}
