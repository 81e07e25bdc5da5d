//! Typed allocation-and-initialization helpers, and the bootstrap of the
//! well-known objects. This is the mutator-side surface the tests drive.

use crate::heap::page;
use crate::heap::space::SpaceId;
use crate::heap::{AllocError, AllocationOrigin, Heap, WellKnown};
use crate::object::map::*;
use crate::object::{MapWord, ObjectRef, TaggedValue};
use crate::util::constants::WORD_BYTES;
use std::collections::HashMap;

impl Heap {
    pub(super) fn bootstrap(&mut self) {
        use InstanceKind::*;

        // The meta map's map word points at itself.
        let meta_map = self
            .allocate_raw(SpaceId::Map, map_layout::SIZE_WORDS, AllocationOrigin::Gc)
            .expect("bootstrap allocation cannot fail");
        self.write_word(meta_map, 0, MapWord::encode_map(meta_map));
        self.write_slot_untracked(meta_map, map_layout::INFO, encode_map_info(Map, map_layout::SIZE_WORDS));
        self.write_slot_untracked(meta_map, map_layout::TRANSITIONS, TaggedValue::from_smi(0));
        self.write_slot_untracked(meta_map, map_layout::DESCRIPTORS, TaggedValue::from_smi(0));
        self.write_slot_untracked(meta_map, map_layout::OWN_DESCRIPTORS, TaggedValue::from_smi(0));

        let fixed_sizes: &[(InstanceKind, u32)] = &[
            (Map, map_layout::SIZE_WORDS),
            (Oddball, oddball_layout::SIZE_WORDS),
            (FreeSpace, 0),
            (OneWordFiller, 1),
            (FixedArray, 0),
            (WeakFixedArray, 0),
            (ByteArray, 0),
            (SeqString, 0),
            (InternalizedString, 0),
            (ExternalString, external_string_layout::SIZE_WORDS),
            (EphemeronHashTable, 0),
            (TransitionArray, 0),
            (DescriptorArray, 0),
            (BytecodeArray, 0),
            (UncompiledData, uncompiled_data_layout::SIZE_WORDS),
            (Code, 0),
            (SharedFunctionInfo, sfi_layout::SIZE_WORDS),
            (JsFunction, js_function_layout::SIZE_WORDS),
            (JsWeakRef, js_weak_ref_layout::SIZE_WORDS),
            (WeakCell, weak_cell_layout::SIZE_WORDS),
            (FinalizationRegistry, finalization_registry_layout::SIZE_WORDS),
            (AllocationSite, allocation_site_layout::SIZE_WORDS),
            (WrapperObject, wrapper_layout::SIZE_WORDS),
        ];
        let mut kind_maps = HashMap::new();
        kind_maps.insert(Map, meta_map);
        for (kind, size) in fixed_sizes {
            if *kind == Map {
                continue;
            }
            kind_maps.insert(*kind, self.make_map(meta_map, *kind, *size));
        }

        let undefined = self.make_oddball(kind_maps[&Oddball], oddball_layout::UNDEFINED);
        let the_hole = self.make_oddball(kind_maps[&Oddball], oddball_layout::THE_HOLE);
        let uninitialized = self.make_oddball(kind_maps[&Oddball], oddball_layout::UNINITIALIZED);

        let lazy_compile_code = self.make_code(kind_maps[&Code], &[], &[], false, None);

        // Bootstrap pages hold process roots and are immovable.
        for id in self.all_page_ids() {
            self.page(id).set_flag(page::flags::NEVER_EVACUATE);
        }

        self.well_known = Some(WellKnown {
            meta_map,
            kind_maps,
            undefined,
            the_hole,
            uninitialized,
            lazy_compile_code,
        });
    }

    fn make_map(&self, meta_map: ObjectRef, kind: InstanceKind, instance_size: u32) -> ObjectRef {
        let map = self
            .allocate_raw(SpaceId::Map, map_layout::SIZE_WORDS, AllocationOrigin::Gc)
            .expect("bootstrap allocation cannot fail");
        self.write_word(map, 0, MapWord::encode_map(meta_map));
        self.write_slot_untracked(map, map_layout::INFO, encode_map_info(kind, instance_size));
        self.write_slot_untracked(map, map_layout::TRANSITIONS, TaggedValue::from_smi(0));
        self.write_slot_untracked(map, map_layout::DESCRIPTORS, TaggedValue::from_smi(0));
        self.write_slot_untracked(map, map_layout::OWN_DESCRIPTORS, TaggedValue::from_smi(0));
        map
    }

    fn make_oddball(&self, oddball_map: ObjectRef, kind: i64) -> ObjectRef {
        let oddball = self
            .allocate_raw(SpaceId::Old, oddball_layout::SIZE_WORDS, AllocationOrigin::Gc)
            .expect("bootstrap allocation cannot fail");
        self.write_word(oddball, 0, MapWord::encode_map(oddball_map));
        self.write_slot_untracked(oddball, oddball_layout::KIND, TaggedValue::from_smi(kind));
        oddball
    }

    pub fn undefined_value(&self) -> TaggedValue {
        TaggedValue::from_strong(self.well_known().undefined)
    }

    pub fn the_hole_value(&self) -> TaggedValue {
        TaggedValue::from_strong(self.well_known().the_hole)
    }

    /// Allocate and install the header for an object of `kind`.
    fn allocate_with_map(
        &self,
        kind: InstanceKind,
        size_words: u32,
        space: SpaceId,
    ) -> Result<ObjectRef, AllocError> {
        let obj = self.allocate_raw(space, size_words, AllocationOrigin::Mutator)?;
        self.write_word(obj, 0, MapWord::encode_map(self.well_known().map_for(kind)));
        Ok(obj)
    }

    /// Create a fresh map for JS objects with `field_count` tagged fields.
    pub fn new_object_map(&self, field_count: u32) -> ObjectRef {
        self.make_map(
            self.well_known().meta_map,
            InstanceKind::JsObject,
            1 + field_count,
        )
    }

    pub fn new_js_object(&self, map: ObjectRef, space: SpaceId) -> ObjectRef {
        let size = map_instance_size(self, map);
        let obj = self
            .allocate_raw(space, size, AllocationOrigin::Mutator)
            .expect("object allocation failed");
        self.write_word(obj, 0, MapWord::encode_map(map));
        for i in 1..size {
            self.write_slot_untracked(obj, i, self.undefined_value());
        }
        obj
    }

    pub fn new_fixed_array(&self, len: u32, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::FixedArray, array_layout::ELEMENTS_START + len, space)
            .expect("array allocation failed");
        self.write_slot_untracked(obj, array_layout::LENGTH, TaggedValue::from_smi(len as i64));
        for i in 0..len {
            self.write_slot_untracked(obj, array_layout::ELEMENTS_START + i, self.undefined_value());
        }
        obj
    }

    pub fn new_weak_fixed_array(&self, len: u32, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::WeakFixedArray, array_layout::ELEMENTS_START + len, space)
            .expect("array allocation failed");
        self.write_slot_untracked(obj, array_layout::LENGTH, TaggedValue::from_smi(len as i64));
        for i in 0..len {
            self.write_slot_untracked(obj, array_layout::ELEMENTS_START + i, TaggedValue::cleared_weak());
        }
        obj
    }

    pub fn new_byte_array(&self, len_words: u32, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::ByteArray, array_layout::ELEMENTS_START + len_words, space)
            .expect("array allocation failed");
        self.write_slot_untracked(obj, array_layout::LENGTH, TaggedValue::from_smi(len_words as i64));
        obj
    }

    pub fn array_get(&self, array: ObjectRef, index: u32) -> TaggedValue {
        self.read_slot(array, array_layout::ELEMENTS_START + index)
    }

    pub fn array_set(&self, array: ObjectRef, index: u32, value: TaggedValue) {
        self.write_slot(array, array_layout::ELEMENTS_START + index, value);
    }

    pub fn array_length(&self, array: ObjectRef) -> u32 {
        self.read_slot(array, array_layout::LENGTH).as_smi() as u32
    }

    // Strings.

    pub(super) fn new_string_of_kind(&self, kind: InstanceKind, s: &str, space: SpaceId) -> ObjectRef {
        let bytes = s.as_bytes();
        let data_words = bytes.len().div_ceil(WORD_BYTES) as u32;
        let obj = self
            .allocate_with_map(kind, string_layout::DATA_START + data_words, space)
            .expect("string allocation failed");
        self.write_slot_untracked(obj, string_layout::LENGTH, TaggedValue::from_smi(bytes.len() as i64));
        self.write_slot_untracked(obj, string_layout::FORWARD_INDEX, TaggedValue::from_smi(-1));
        for (word_index, chunk) in bytes.chunks(WORD_BYTES).enumerate() {
            let mut word = 0u64;
            for (i, byte) in chunk.iter().enumerate() {
                word |= (*byte as u64) << (i * 8);
            }
            self.write_word(obj, string_layout::DATA_START + word_index as u32, word);
        }
        obj
    }

    pub fn new_string(&self, s: &str, space: SpaceId) -> ObjectRef {
        self.new_string_of_kind(InstanceKind::SeqString, s, space)
    }

    /// Create an external string backed by a registered resource and add it
    /// to the external string table.
    pub fn new_external_string(&self, data: Vec<u8>, space: SpaceId) -> ObjectRef {
        let len = data.len();
        let resource = self.external_resources.register(data);
        let obj = self
            .allocate_with_map(InstanceKind::ExternalString, external_string_layout::SIZE_WORDS, space)
            .expect("string allocation failed");
        self.write_slot_untracked(
            obj,
            external_string_layout::RESOURCE,
            TaggedValue::from_smi(resource as i64),
        );
        self.write_slot_untracked(
            obj,
            external_string_layout::LENGTH,
            TaggedValue::from_smi(len as i64),
        );
        if space.is_young() {
            self.young_external_strings.lock().unwrap().push(obj);
        } else {
            self.external_strings.lock().unwrap().push(obj);
        }
        self.space(space).add_external_bytes(len);
        obj
    }

    /// Record that `original` was forwarded to `target` during interning.
    pub fn forward_string(&self, original: ObjectRef, target: ObjectRef) {
        let mut table = self.string_forwarding.lock().unwrap();
        let index = table.len();
        table.push(crate::heap::ForwardRecord {
            original,
            target,
            dead: false,
        });
        self.write_slot_untracked(
            original,
            string_layout::FORWARD_INDEX,
            TaggedValue::from_smi(index as i64),
        );
    }

    // Ephemerons.

    pub fn new_ephemeron_table(&self, capacity: u32, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(
                InstanceKind::EphemeronHashTable,
                ephemeron_layout::ENTRIES_START + 2 * capacity,
                space,
            )
            .expect("table allocation failed");
        self.write_slot_untracked(obj, ephemeron_layout::CAPACITY, TaggedValue::from_smi(capacity as i64));
        for entry in 0..capacity {
            self.write_slot_untracked(obj, ephemeron_layout::key_index(entry), self.the_hole_value());
            self.write_slot_untracked(obj, ephemeron_layout::value_index(entry), self.the_hole_value());
        }
        obj
    }

    /// Install an ephemeron `(key, value)` pair. The key is held weakly.
    pub fn ephemeron_set(&self, table: ObjectRef, entry: u32, key: ObjectRef, value: TaggedValue) {
        self.write_slot(table, ephemeron_layout::key_index(entry), TaggedValue::from_weak(key));
        self.write_slot(table, ephemeron_layout::value_index(entry), value);
        if self.in_young(key) && !self.in_young(table) {
            self.ephemeron_remembered
                .lock()
                .unwrap()
                .entry(table)
                .or_default()
                .insert(entry);
        }
    }

    pub fn ephemeron_key(&self, table: ObjectRef, entry: u32) -> TaggedValue {
        self.read_slot(table, ephemeron_layout::key_index(entry))
    }

    pub fn ephemeron_value(&self, table: ObjectRef, entry: u32) -> TaggedValue {
        self.read_slot(table, ephemeron_layout::value_index(entry))
    }

    pub fn ephemeron_capacity(&self, table: ObjectRef) -> u32 {
        self.read_slot(table, ephemeron_layout::CAPACITY).as_smi() as u32
    }

    // Transitions and descriptors.

    pub fn new_transition_array(&self, len: u32, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::TransitionArray, array_layout::ELEMENTS_START + len, space)
            .expect("array allocation failed");
        self.write_slot_untracked(obj, array_layout::LENGTH, TaggedValue::from_smi(len as i64));
        for i in 0..len {
            self.write_slot_untracked(obj, array_layout::ELEMENTS_START + i, TaggedValue::cleared_weak());
        }
        obj
    }

    pub fn set_transition(&self, array: ObjectRef, index: u32, target_map: ObjectRef) {
        self.write_slot(array, array_layout::ELEMENTS_START + index, TaggedValue::from_weak(target_map));
    }

    /// Install a full transition array (held strongly; its entries are weak).
    pub fn set_map_transitions(&self, map: ObjectRef, transitions: ObjectRef) {
        self.write_slot(map, map_layout::TRANSITIONS, TaggedValue::from_strong(transitions));
    }

    /// Install a single successor map as a weak simple transition.
    pub fn set_map_simple_transition(&self, map: ObjectRef, target: ObjectRef) {
        self.write_slot(map, map_layout::TRANSITIONS, TaggedValue::from_weak(target));
    }

    pub fn new_descriptor_array(&self, len: u32, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::DescriptorArray, array_layout::ELEMENTS_START + len, space)
            .expect("array allocation failed");
        self.write_slot_untracked(obj, array_layout::LENGTH, TaggedValue::from_smi(len as i64));
        for i in 0..len {
            self.write_slot_untracked(obj, array_layout::ELEMENTS_START + i, self.undefined_value());
        }
        obj
    }

    pub fn set_map_descriptors(&self, map: ObjectRef, descriptors: ObjectRef, own_count: u32) {
        self.write_slot(map, map_layout::DESCRIPTORS, TaggedValue::from_strong(descriptors));
        self.write_slot_untracked(
            map,
            map_layout::OWN_DESCRIPTORS,
            TaggedValue::from_smi(own_count as i64),
        );
    }

    // Code and functions.

    fn make_code(
        &self,
        code_map: ObjectRef,
        relocs: &[(TypedSlotKind, u32)],
        body: &[u64],
        can_deopt: bool,
        deopt_literals: Option<ObjectRef>,
    ) -> ObjectRef {
        let size = code_layout::body_start(relocs.len() as u32) + body.len() as u32;
        let obj = self
            .allocate_raw(SpaceId::Code, size.max(code_layout::RELOC_START), AllocationOrigin::Mutator)
            .expect("code allocation failed");
        let _write_scope = page::CodePageWriteScope::new(self.page(obj.page()));
        self.write_word(obj, 0, MapWord::encode_map(code_map));
        let flags = if can_deopt { code_layout::FLAG_CAN_DEOPT } else { 0 };
        self.write_slot_untracked(obj, code_layout::FLAGS, TaggedValue::from_smi(flags));
        self.write_slot_untracked(
            obj,
            code_layout::DEOPT_LITERALS,
            match deopt_literals {
                Some(literals) => TaggedValue::from_strong(literals),
                None => TaggedValue::from_smi(0),
            },
        );
        self.write_slot_untracked(obj, code_layout::BODY_LEN, TaggedValue::from_smi(body.len() as i64));
        self.write_slot_untracked(obj, code_layout::RELOC_COUNT, TaggedValue::from_smi(relocs.len() as i64));
        for (i, (kind, offset)) in relocs.iter().enumerate() {
            self.write_slot_untracked(
                obj,
                code_layout::RELOC_START + 2 * i as u32,
                TaggedValue::from_smi(*kind as u8 as i64),
            );
            self.write_slot_untracked(
                obj,
                code_layout::RELOC_START + 2 * i as u32 + 1,
                TaggedValue::from_smi(*offset as i64),
            );
        }
        let body_start = code_layout::body_start(relocs.len() as u32);
        for (i, word) in body.iter().enumerate() {
            self.write_word(obj, body_start + i as u32, *word);
        }
        self.page(obj.page()).register_code_object(obj.word_index());
        obj
    }

    /// Create a code object. Body words at relocation offsets hold the raw
    /// ref bits of their embedded targets.
    pub fn new_code(
        &self,
        relocs: &[(TypedSlotKind, u32)],
        body: &[u64],
        can_deopt: bool,
        deopt_literals: Option<ObjectRef>,
    ) -> ObjectRef {
        self.make_code(
            self.well_known().map_for(InstanceKind::Code),
            relocs,
            body,
            can_deopt,
            deopt_literals,
        )
    }

    pub fn code_body_start(&self, code: ObjectRef) -> u32 {
        let relocs = self.read_slot(code, code_layout::RELOC_COUNT).as_smi() as u32;
        code_layout::body_start(relocs)
    }

    pub fn code_read_body_word(&self, code: ObjectRef, offset: u32) -> u64 {
        self.read_word(code, self.code_body_start(code) + offset)
    }

    pub fn code_write_embedded_ref(&self, code: ObjectRef, offset: u32, target: ObjectRef) {
        let _write_scope = page::CodePageWriteScope::new(self.page(code.page()));
        let body_start = self.code_body_start(code);
        self.write_word(code, body_start + offset, target.raw() as u64);
    }

    pub fn code_is_marked_for_deopt(&self, code: ObjectRef) -> bool {
        self.read_slot(code, code_layout::FLAGS).as_smi() & code_layout::FLAG_MARKED_FOR_DEOPT != 0
    }

    pub fn new_bytecode_array(
        &self,
        len_words: u32,
        constant_pool: Option<ObjectRef>,
        space: SpaceId,
    ) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::BytecodeArray, bytecode_layout::DATA_START + len_words, space)
            .expect("bytecode allocation failed");
        self.write_slot_untracked(obj, bytecode_layout::LENGTH, TaggedValue::from_smi(len_words as i64));
        self.write_slot_untracked(obj, bytecode_layout::AGE, TaggedValue::from_smi(0));
        self.write_slot_untracked(
            obj,
            bytecode_layout::CONSTANT_POOL,
            match constant_pool {
                Some(pool) => TaggedValue::from_strong(pool),
                None => TaggedValue::from_smi(0),
            },
        );
        obj
    }

    pub fn new_shared_function_info(&self, function_data: ObjectRef, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::SharedFunctionInfo, sfi_layout::SIZE_WORDS, space)
            .expect("sfi allocation failed");
        self.write_slot_untracked(obj, sfi_layout::FLAGS, TaggedValue::from_smi(0));
        self.write_slot(obj, sfi_layout::FUNCTION_DATA, TaggedValue::from_strong(function_data));
        self.write_slot_untracked(obj, sfi_layout::BASELINE_CODE, TaggedValue::from_smi(0));
        obj
    }

    pub fn set_baseline_code(&self, sfi: ObjectRef, code: ObjectRef) {
        self.write_slot(sfi, sfi_layout::BASELINE_CODE, TaggedValue::from_weak(code));
    }

    pub fn new_js_function(&self, sfi: ObjectRef, code: ObjectRef, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::JsFunction, js_function_layout::SIZE_WORDS, space)
            .expect("function allocation failed");
        self.write_slot(obj, js_function_layout::CODE, TaggedValue::from_strong(code));
        self.write_slot(obj, js_function_layout::SHARED, TaggedValue::from_strong(sfi));
        self.write_slot_untracked(obj, js_function_layout::CONTEXT, TaggedValue::from_smi(0));
        obj
    }

    // Weak JS objects.

    pub fn new_js_weak_ref(&self, target: ObjectRef, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::JsWeakRef, js_weak_ref_layout::SIZE_WORDS, space)
            .expect("weak ref allocation failed");
        self.write_slot(obj, js_weak_ref_layout::TARGET, TaggedValue::from_weak(target));
        obj
    }

    pub fn new_finalization_registry(&self, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(
                InstanceKind::FinalizationRegistry,
                finalization_registry_layout::SIZE_WORDS,
                space,
            )
            .expect("registry allocation failed");
        self.write_slot_untracked(obj, finalization_registry_layout::ACTIVE_CELLS, TaggedValue::from_smi(0));
        self.write_slot_untracked(obj, finalization_registry_layout::CLEARED_CELLS, TaggedValue::from_smi(0));
        self.write_slot_untracked(obj, finalization_registry_layout::NEEDS_CLEANUP, TaggedValue::from_smi(0));
        obj
    }

    /// Register `target` with a finalization registry; returns the weak cell.
    pub fn register_weak_cell(
        &self,
        registry: ObjectRef,
        target: ObjectRef,
        unregister_token: Option<ObjectRef>,
        holdings: TaggedValue,
        space: SpaceId,
    ) -> ObjectRef {
        let cell = self
            .allocate_with_map(InstanceKind::WeakCell, weak_cell_layout::SIZE_WORDS, space)
            .expect("cell allocation failed");
        self.write_slot(cell, weak_cell_layout::TARGET, TaggedValue::from_weak(target));
        self.write_slot_untracked(
            cell,
            weak_cell_layout::UNREGISTER_TOKEN,
            match unregister_token {
                Some(token) => TaggedValue::from_weak(token),
                None => TaggedValue::from_smi(0),
            },
        );
        self.write_slot(cell, weak_cell_layout::REGISTRY, TaggedValue::from_strong(registry));
        let head = self.read_slot(registry, finalization_registry_layout::ACTIVE_CELLS);
        self.write_slot_untracked(cell, weak_cell_layout::NEXT, head);
        self.write_slot(cell, weak_cell_layout::HOLDINGS, holdings);
        self.write_slot(registry, finalization_registry_layout::ACTIVE_CELLS, TaggedValue::from_strong(cell));
        cell
    }

    // Allocation sites.

    /// Create an allocation site and link it into the heap's weak list.
    pub fn new_allocation_site(&self, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::AllocationSite, allocation_site_layout::SIZE_WORDS, space)
            .expect("site allocation failed");
        self.write_slot_untracked(obj, allocation_site_layout::FLAGS, TaggedValue::from_smi(0));
        self.write_slot_untracked(obj, allocation_site_layout::WEIGHT, TaggedValue::from_smi(0));
        self.write_slot_untracked(obj, allocation_site_layout::NEXT, self.allocation_sites_head());
        self.set_allocation_sites_head(TaggedValue::from_strong(obj));
        obj
    }

    pub fn allocation_site_is_zombie(&self, site: ObjectRef) -> bool {
        self.read_slot(site, allocation_site_layout::FLAGS).as_smi() & allocation_site_layout::FLAG_ZOMBIE
            != 0
    }

    // Wrappers.

    pub fn new_wrapper(&self, foreign: i64, payload: TaggedValue, space: SpaceId) -> ObjectRef {
        let obj = self
            .allocate_with_map(InstanceKind::WrapperObject, wrapper_layout::SIZE_WORDS, space)
            .expect("wrapper allocation failed");
        self.write_slot_untracked(obj, wrapper_layout::FOREIGN, TaggedValue::from_smi(foreign));
        self.write_slot(obj, wrapper_layout::PAYLOAD, payload);
        obj
    }
}
