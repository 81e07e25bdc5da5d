//! Maps (object shapes) and the closed set of instance kinds the collector
//! understands.
//!
//! A map is itself a heap object (living in the map space). Its info word
//! packs the instance kind with the instance size for fixed-size kinds;
//! variable-size kinds derive their size from a length field in the object.

use crate::heap::Heap;
use crate::object::{MapWord, ObjectRef, TaggedValue};

/// Layout of a `Map` object.
pub mod map_layout {
    /// Smi: `kind | instance_size_words << 8`.
    pub const INFO: u32 = 1;
    /// Maybe-object: strong reference to the map's `TransitionArray`, a weak
    /// reference to a single successor map, or Smi 0.
    pub const TRANSITIONS: u32 = 2;
    /// Strong reference to the map's `DescriptorArray`, or Smi 0.
    pub const DESCRIPTORS: u32 = 3;
    /// Smi: how many descriptors of the (possibly shared) descriptor array
    /// this map owns.
    pub const OWN_DESCRIPTORS: u32 = 4;
    pub const SIZE_WORDS: u32 = 5;
}

/// Layout of array-like objects (`FixedArray`, `WeakFixedArray`, `ByteArray`,
/// `DescriptorArray`, `TransitionArray`).
pub mod array_layout {
    pub const LENGTH: u32 = 1;
    pub const ELEMENTS_START: u32 = 2;
}

/// Layout of sequential (and internalized) strings.
pub mod string_layout {
    /// Smi: length in bytes.
    pub const LENGTH: u32 = 1;
    /// Smi: index into the string forwarding table, or -1.
    pub const FORWARD_INDEX: u32 = 2;
    pub const DATA_START: u32 = 3;
}

/// Layout of external strings.
pub mod external_string_layout {
    /// Smi: id of the registered external resource.
    pub const RESOURCE: u32 = 1;
    /// Smi: length in bytes.
    pub const LENGTH: u32 = 2;
    pub const SIZE_WORDS: u32 = 3;
}

/// Layout of ephemeron hash tables: `capacity` (key, value) pairs.
pub mod ephemeron_layout {
    pub const CAPACITY: u32 = 1;
    pub const ENTRIES_START: u32 = 2;

    pub fn key_index(entry: u32) -> u32 {
        ENTRIES_START + entry * 2
    }

    pub fn value_index(entry: u32) -> u32 {
        ENTRIES_START + entry * 2 + 1
    }
}

/// Layout of bytecode arrays.
pub mod bytecode_layout {
    /// Smi: length of the raw bytecode, in words.
    pub const LENGTH: u32 = 1;
    /// Smi: number of full GCs survived without execution.
    pub const AGE: u32 = 2;
    /// Strong reference to the constant pool (`FixedArray`), or Smi 0.
    pub const CONSTANT_POOL: u32 = 3;
    pub const DATA_START: u32 = 4;
}

/// Layout of code objects. The body holds raw instruction words; embedded
/// references live at the offsets named by the relocation table.
pub mod code_layout {
    /// Smi flags.
    pub const FLAGS: u32 = 1;
    /// Strong reference to the deoptimization literals (`FixedArray`), or Smi 0.
    pub const DEOPT_LITERALS: u32 = 2;
    /// Smi: body length in words.
    pub const BODY_LEN: u32 = 3;
    /// Smi: number of relocation entries.
    pub const RELOC_COUNT: u32 = 4;
    /// Relocation entries, two words each: (kind Smi, body offset Smi).
    pub const RELOC_START: u32 = 5;

    pub const FLAG_MARKED_FOR_DEOPT: i64 = 1;
    /// Optimized code embeds its objects weakly and deoptimizes when one dies.
    pub const FLAG_CAN_DEOPT: i64 = 2;

    pub fn body_start(reloc_count: u32) -> u32 {
        RELOC_START + reloc_count * 2
    }
}

/// Layout of shared function infos.
pub mod sfi_layout {
    pub const FLAGS: u32 = 1;
    /// Strong reference: `BytecodeArray`, `UncompiledData` or a builtin `Code`.
    pub const FUNCTION_DATA: u32 = 2;
    /// Weak reference to baseline `Code`, or Smi 0.
    pub const BASELINE_CODE: u32 = 3;
    pub const SIZE_WORDS: u32 = 4;
}

/// Layout of uncompiled-data objects (what flushed bytecode turns into).
pub mod uncompiled_data_layout {
    /// Strong reference to the inferred name string, or Smi 0.
    pub const INFERRED_NAME: u32 = 1;
    pub const SIZE_WORDS: u32 = 2;
}

/// Layout of JS functions.
pub mod js_function_layout {
    /// Strong reference to the function's code entry.
    pub const CODE: u32 = 1;
    /// Strong reference to the `SharedFunctionInfo`.
    pub const SHARED: u32 = 2;
    pub const CONTEXT: u32 = 3;
    pub const SIZE_WORDS: u32 = 4;
}

/// Layout of JS weak refs.
pub mod js_weak_ref_layout {
    /// Weak reference to the target; reset to strong `undefined` when cleared.
    pub const TARGET: u32 = 1;
    pub const SIZE_WORDS: u32 = 2;
}

/// Layout of weak cells (FinalizationRegistry internals).
pub mod weak_cell_layout {
    pub const TARGET: u32 = 1;
    pub const UNREGISTER_TOKEN: u32 = 2;
    /// Strong reference to the owning registry.
    pub const REGISTRY: u32 = 3;
    /// Strong reference to the next cell in the registry list, or Smi 0.
    pub const NEXT: u32 = 4;
    pub const HOLDINGS: u32 = 5;
    pub const SIZE_WORDS: u32 = 6;
}

/// Layout of finalization registries.
pub mod finalization_registry_layout {
    /// Strong reference to the first active `WeakCell`, or Smi 0.
    pub const ACTIVE_CELLS: u32 = 1;
    /// Strong reference to the first cleared `WeakCell`, or Smi 0.
    pub const CLEARED_CELLS: u32 = 2;
    /// Smi: 1 when a cleanup task should run.
    pub const NEEDS_CLEANUP: u32 = 3;
    pub const SIZE_WORDS: u32 = 4;
}

/// Layout of allocation sites.
pub mod allocation_site_layout {
    /// Smi flags.
    pub const FLAGS: u32 = 1;
    pub const WEIGHT: u32 = 2;
    /// The weak-list link: followed by the retainer, never by the marker.
    pub const NEXT: u32 = 3;
    pub const SIZE_WORDS: u32 = 4;

    pub const FLAG_ZOMBIE: i64 = 1;
}

/// Layout of embedder wrapper objects.
pub mod wrapper_layout {
    /// Smi: id of the foreign payload the embedder traces.
    pub const FOREIGN: u32 = 1;
    pub const PAYLOAD: u32 = 2;
    pub const SIZE_WORDS: u32 = 3;
}

/// Layout of oddballs.
pub mod oddball_layout {
    pub const KIND: u32 = 1;
    pub const SIZE_WORDS: u32 = 2;

    pub const UNDEFINED: i64 = 0;
    pub const THE_HOLE: i64 = 1;
    /// Marks a transition array that is still being deserialized.
    pub const UNINITIALIZED: i64 = 2;
}

/// Layout of free-space fillers.
pub mod free_space_layout {
    /// Smi: total size in words, including the header.
    pub const SIZE: u32 = 1;
}

/// The closed set of object shapes the collector can visit.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum InstanceKind {
    Map = 0,
    Oddball,
    FreeSpace,
    OneWordFiller,
    FixedArray,
    WeakFixedArray,
    ByteArray,
    SeqString,
    InternalizedString,
    ExternalString,
    EphemeronHashTable,
    TransitionArray,
    DescriptorArray,
    BytecodeArray,
    UncompiledData,
    Code,
    SharedFunctionInfo,
    JsFunction,
    JsObject,
    JsWeakRef,
    WeakCell,
    FinalizationRegistry,
    AllocationSite,
    WrapperObject,
}

impl InstanceKind {
    pub fn from_code(code: u8) -> InstanceKind {
        use InstanceKind::*;
        match code {
            0 => Map,
            1 => Oddball,
            2 => FreeSpace,
            3 => OneWordFiller,
            4 => FixedArray,
            5 => WeakFixedArray,
            6 => ByteArray,
            7 => SeqString,
            8 => InternalizedString,
            9 => ExternalString,
            10 => EphemeronHashTable,
            11 => TransitionArray,
            12 => DescriptorArray,
            13 => BytecodeArray,
            14 => UncompiledData,
            15 => Code,
            16 => SharedFunctionInfo,
            17 => JsFunction,
            18 => JsObject,
            19 => JsWeakRef,
            20 => WeakCell,
            21 => FinalizationRegistry,
            22 => AllocationSite,
            23 => WrapperObject,
            _ => panic!("invalid instance kind code {}", code),
        }
    }

    pub fn is_filler(self) -> bool {
        matches!(self, InstanceKind::FreeSpace | InstanceKind::OneWordFiller)
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            InstanceKind::SeqString | InstanceKind::InternalizedString | InstanceKind::ExternalString
        )
    }

    /// Strings eligible for promotion into the shared old space when a shared
    /// string table is active.
    pub fn is_internalizable_string(self) -> bool {
        matches!(self, InstanceKind::SeqString | InstanceKind::InternalizedString)
    }
}

/// Encode the info word of a map.
pub fn encode_map_info(kind: InstanceKind, instance_size_words: u32) -> TaggedValue {
    TaggedValue::from_smi(kind as i64 | ((instance_size_words as i64) << 8))
}

pub fn map_kind(heap: &Heap, map: ObjectRef) -> InstanceKind {
    let info = heap.read_slot(map, map_layout::INFO).as_smi();
    InstanceKind::from_code((info & 0xff) as u8)
}

pub fn map_instance_size(heap: &Heap, map: ObjectRef) -> u32 {
    let info = heap.read_slot(map, map_layout::INFO).as_smi();
    (info >> 8) as u32
}

/// The kinds of typed (code-relocation) slots.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TypedSlotKind {
    /// A call/jump target: raw ref bits of a code object in a body word.
    CodeEntry = 0,
    /// A full-width embedded object: raw ref bits in a body word.
    EmbeddedObjectFull,
    /// A compressed embedded object: raw ref bits in the low half of a body word.
    EmbeddedObjectCompressed,
    /// An embedded object reached through the constant pool.
    ConstPoolEmbeddedObject,
    /// A code target reached through the constant pool.
    ConstPoolCodeEntry,
}

impl TypedSlotKind {
    pub fn from_code(code: u8) -> TypedSlotKind {
        use TypedSlotKind::*;
        match code {
            0 => CodeEntry,
            1 => EmbeddedObjectFull,
            2 => EmbeddedObjectCompressed,
            3 => ConstPoolEmbeddedObject,
            4 => ConstPoolCodeEntry,
            _ => panic!("invalid typed slot kind {}", code),
        }
    }
}

/// Size of `obj` in words, given its map. Evacuation computes sizes before it
/// overwrites the source map word, so the map is threaded explicitly.
pub fn object_size_with_map(heap: &Heap, obj: ObjectRef, map: ObjectRef) -> u32 {
    use InstanceKind::*;
    match map_kind(heap, map) {
        OneWordFiller => 1,
        FreeSpace => heap.read_slot(obj, free_space_layout::SIZE).as_smi() as u32,
        FixedArray | WeakFixedArray | ByteArray | DescriptorArray | TransitionArray => {
            array_layout::ELEMENTS_START + heap.read_slot(obj, array_layout::LENGTH).as_smi() as u32
        }
        SeqString | InternalizedString => {
            let bytes = heap.read_slot(obj, string_layout::LENGTH).as_smi() as u32;
            string_layout::DATA_START + bytes.div_ceil(crate::util::constants::WORD_BYTES as u32)
        }
        EphemeronHashTable => {
            ephemeron_layout::ENTRIES_START
                + 2 * heap.read_slot(obj, ephemeron_layout::CAPACITY).as_smi() as u32
        }
        BytecodeArray => {
            bytecode_layout::DATA_START + heap.read_slot(obj, bytecode_layout::LENGTH).as_smi() as u32
        }
        Code => {
            let relocs = heap.read_slot(obj, code_layout::RELOC_COUNT).as_smi() as u32;
            code_layout::body_start(relocs)
                + heap.read_slot(obj, code_layout::BODY_LEN).as_smi() as u32
        }
        _ => map_instance_size(heap, map),
    }
}

/// Size of `obj` in words. Panics if the object has already been forwarded.
pub fn object_size(heap: &Heap, obj: ObjectRef) -> u32 {
    match heap.map_word(obj) {
        MapWord::Map(map) => object_size_with_map(heap, obj, map),
        MapWord::Forwarded(_) => panic!("size of forwarded object {}", obj),
    }
}
