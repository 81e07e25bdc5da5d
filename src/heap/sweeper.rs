//! The lazy sweeper.
//!
//! After `StartSweepSpaces` hands pages over, sweeping proceeds on demand:
//! `ensure_page_swept` reclaims a single page, `ensure_completed` drains
//! everything. With `concurrent_sweeping` the collector leaves pages pending
//! at the end of the cycle and the mutator's allocation slow path (or an
//! explicit `ensure_completed`) finishes them; otherwise the cycle epilogue
//! sweeps eagerly.
//!
//! Sweeping turns every dead run into a filler plus a free-list entry and
//! resets the page's byte accounting. Mark bits are left intact; the next
//! cycle's prepare phase clears them.

use crate::heap::page::{FreeRegion, SweepState};
use crate::heap::remembered_set::RememberedSetClass;
use crate::heap::space::SpaceId;
use crate::heap::Heap;
use crate::object::map::object_size_with_map;
use crate::object::{MapWord, ObjectRef, PageId};
use crate::util::constants::{MIN_OBJECT_SIZE_WORDS, WORD_BYTES};
use enum_map::EnumMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// How a page should be swept.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SweepMode {
    /// Defer until the page's free space is needed.
    Lazy,
    /// Sweep during the handing-over phase.
    Eager,
}

pub struct Sweeper {
    queues: EnumMap<SpaceId, Mutex<Vec<PageId>>>,
    sweeping_in_progress: AtomicBool,
}

impl Sweeper {
    pub fn new() -> Sweeper {
        Sweeper {
            queues: EnumMap::from_fn(|_| Mutex::new(Vec::new())),
            sweeping_in_progress: AtomicBool::new(false),
        }
    }

    pub fn sweeping_in_progress(&self) -> bool {
        self.sweeping_in_progress.load(Ordering::Acquire)
    }

    /// Queue a page for sweeping.
    pub fn add_page(&self, heap: &Heap, space: SpaceId, page_id: PageId, mode: SweepMode) {
        let page = heap.page(page_id);
        debug_assert_eq!(page.space(), space);
        page.set_sweep_state(SweepState::Pending);
        page.clear_free_list();
        match mode {
            SweepMode::Eager => {
                page.try_start_sweeping();
                sweep_page(heap, page_id);
            }
            SweepMode::Lazy => {
                self.queues[space].lock().unwrap().push(page_id);
            }
        }
    }

    pub fn start_sweeping(&self) {
        self.sweeping_in_progress.store(true, Ordering::Release);
    }

    /// Sweep a specific page now if it is still pending.
    pub fn ensure_page_swept(&self, heap: &Heap, page_id: PageId) {
        let page = heap.page(page_id);
        if page.try_start_sweeping() {
            sweep_page(heap, page_id);
        }
        // Another path may be sweeping it concurrently; wait it out.
        while page.sweep_state() == SweepState::InProgress {
            std::thread::yield_now();
        }
    }

    /// Drain every queued page and end the sweeping phase.
    pub fn ensure_completed(&self, heap: &Heap) {
        for (_space, queue) in self.queues.iter() {
            let pages = std::mem::take(&mut *queue.lock().unwrap());
            for page_id in pages {
                self.ensure_page_swept(heap, page_id);
            }
        }
        self.sweeping_in_progress.store(false, Ordering::Release);
    }

    /// Sweep one queued page of `space`, if any are left. Returns whether a
    /// page was swept (the main thread's cooperative-promotion poll).
    pub fn sweep_one(&self, heap: &Heap, space: SpaceId) -> bool {
        let page_id = self.queues[space].lock().unwrap().pop();
        match page_id {
            Some(page_id) => {
                self.ensure_page_swept(heap, page_id);
                true
            }
            None => false,
        }
    }
}

impl Default for Sweeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Reclaim the dead runs of a page: every maximal run of non-Black objects
/// becomes a filler and (if large enough) a free-list entry.
fn sweep_page(heap: &Heap, page_id: PageId) {
    let page = heap.page(page_id);
    debug_assert_eq!(page.sweep_state(), SweepState::InProgress);

    let top = page.top();
    let mut live_words = 0u32;
    let mut free_run_start: Option<u32> = None;
    let mut word = 0u32;
    let mut free_runs: Vec<FreeRegion> = Vec::new();

    while word < top {
        let obj = ObjectRef::new(page_id, word);
        let map = match heap.map_word(obj) {
            MapWord::Map(map) => map,
            MapWord::Forwarded(to) => panic!("sweeping forwarded object {} -> {}", obj, to),
        };
        let size = object_size_with_map(heap, obj, map);
        if page.bitmap.is_black(word) {
            if let Some(start) = free_run_start.take() {
                free_runs.push(FreeRegion {
                    start,
                    words: word - start,
                });
            }
            live_words += size;
        } else if free_run_start.is_none() {
            free_run_start = Some(word);
        }
        word += size;
    }
    if let Some(start) = free_run_start {
        free_runs.push(FreeRegion {
            start,
            words: top - start,
        });
    }

    for run in free_runs {
        heap.create_filler(page_id, run.start, run.words);
        // Slots recorded inside a reclaimed region are stale.
        for class in [
            RememberedSetClass::OldToNew,
            RememberedSetClass::OldToOld,
            RememberedSetClass::OldToCode,
            RememberedSetClass::OldToShared,
        ] {
            page.slot_set(class).remove_range(run.start, run.start + run.words);
            page.typed_slot_set(class).remove_range(run.start, run.start + run.words);
        }
        if run.words as usize >= MIN_OBJECT_SIZE_WORDS {
            page.add_free_region(run);
        }
    }

    // Executable pages rebuild their code object registry from survivors.
    if page.has_flag(crate::heap::page::flags::EXECUTABLE) {
        page.clear_code_object_registry();
        let mut word = 0u32;
        while word < top {
            let obj = ObjectRef::new(page_id, word);
            let map = heap.map_of(obj);
            if page.bitmap.is_black(word)
                && crate::object::map::map_kind(heap, map) == crate::object::map::InstanceKind::Code
            {
                page.register_code_object(word);
            }
            word += object_size_with_map(heap, obj, map);
        }
    }

    page.set_live_bytes(live_words as usize * WORD_BYTES);
    page.set_allocated_bytes(live_words as usize * WORD_BYTES);
    page.set_sweep_state(SweepState::Swept);
    trace!(
        "swept page {}: {} live words of {}",
        page_id,
        live_words,
        top
    );
}
