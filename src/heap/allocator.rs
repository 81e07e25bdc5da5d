//! Per-worker evacuation allocation with thread-local linear allocation
//! buffers (LABs). A LAB claims a run of words from its space in one shot
//! and carves objects out locally; `finalize` returns the unused tail to the
//! owning space as a filler plus free-list entry.

use crate::heap::page::FreeRegion;
use crate::heap::space::SpaceId;
use crate::heap::{AllocError, AllocationOrigin, Heap};
use crate::object::ObjectRef;
use crate::util::constants::{MIN_OBJECT_SIZE_WORDS, WORD_BYTES};
use enum_map::EnumMap;

/// Words claimed per LAB refill.
const LAB_WORDS: u32 = 512;

#[derive(Copy, Clone, Default)]
struct Lab {
    page: u32,
    cursor: u32,
    limit: u32,
}

impl Lab {
    fn is_valid(&self) -> bool {
        self.page != 0
    }

    fn remaining(&self) -> u32 {
        self.limit - self.cursor
    }
}

pub struct EvacuationAllocator<'h> {
    heap: &'h Heap,
    labs: EnumMap<SpaceId, Lab>,
}

impl<'h> EvacuationAllocator<'h> {
    pub fn new(heap: &'h Heap) -> EvacuationAllocator<'h> {
        EvacuationAllocator {
            heap,
            labs: EnumMap::default(),
        }
    }

    /// Allocate `size_words` in `space`. Failure is returned to the caller:
    /// the evacuator decides whether it is recoverable.
    pub fn allocate(&mut self, space: SpaceId, size_words: u32) -> Result<ObjectRef, AllocError> {
        let lab = &mut self.labs[space];
        if lab.is_valid() && lab.remaining() >= size_words {
            let obj = ObjectRef::new(lab.page, lab.cursor);
            lab.cursor += size_words;
            return Ok(obj);
        }
        self.refill(space, size_words)?;
        let lab = &mut self.labs[space];
        debug_assert!(lab.remaining() >= size_words);
        let obj = ObjectRef::new(lab.page, lab.cursor);
        lab.cursor += size_words;
        Ok(obj)
    }

    fn refill(&mut self, space: SpaceId, min_words: u32) -> Result<(), AllocError> {
        self.retire_lab(space);
        let words = LAB_WORDS.max(min_words);
        let start = self.heap.allocate_raw(space, words, AllocationOrigin::Gc)?;
        self.labs[space] = Lab {
            page: start.page(),
            cursor: start.word_index(),
            limit: start.word_index() + words,
        };
        Ok(())
    }

    fn retire_lab(&mut self, space: SpaceId) {
        let lab = self.labs[space];
        if !lab.is_valid() {
            return;
        }
        let unused = lab.remaining();
        if unused > 0 {
            self.heap.create_filler(lab.page, lab.cursor, unused);
            let page = self.heap.page(lab.page);
            if unused as usize >= MIN_OBJECT_SIZE_WORDS {
                page.add_free_region(FreeRegion {
                    start: lab.cursor,
                    words: unused,
                });
            }
            page.sub_allocated_bytes(unused as usize * WORD_BYTES);
        }
        self.labs[space] = Lab::default();
    }

    /// Release every LAB back to its owning space. Called when the worker
    /// joins.
    pub fn finalize(&mut self) {
        for space in self.labs.iter().map(|(space, _)| space).collect::<Vec<_>>() {
            self.retire_lab(space);
        }
    }
}

impl<'h> Drop for EvacuationAllocator<'h> {
    fn drop(&mut self) {
        self.finalize();
    }
}
