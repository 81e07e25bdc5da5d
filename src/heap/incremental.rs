//! The incremental/concurrent marker collaborator.
//!
//! The full collector does not drive incremental marking; it only stops the
//! marker, consumes its residual grey worklist, and deactivates the write
//! barrier for the atomic pause. This stub models exactly that contract.

use crate::heap::Heap;
use crate::object::ObjectRef;
use crate::scheduler::worklist::Worklist;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct IncrementalMarker {
    marking: AtomicBool,
    barrier_active: AtomicBool,
    /// Grey objects discovered by the barrier before the atomic pause.
    residual: Worklist<ObjectRef>,
}

impl IncrementalMarker {
    pub fn new() -> IncrementalMarker {
        IncrementalMarker {
            marking: AtomicBool::new(false),
            barrier_active: AtomicBool::new(false),
            residual: Worklist::new(),
        }
    }

    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Relaxed)
    }

    /// Begin an incremental cycle (the write barrier starts recording).
    pub fn start(&self) {
        self.marking.store(true, Ordering::Relaxed);
        self.barrier_active.store(true, Ordering::Relaxed);
    }

    /// Record a grey object through the barrier.
    pub fn record_grey(&self, obj: ObjectRef) {
        debug_assert!(self.is_marking());
        self.residual.push_segment(vec![obj]);
    }

    /// Publish all thread-local barrier state. The stub keeps everything
    /// global already, so this is a barrier-ordering no-op.
    pub fn publish_all(&self) {}

    /// Stop incremental marking, returning whether it was active.
    pub fn stop(&self) -> bool {
        self.marking.swap(false, Ordering::Relaxed)
    }

    /// Hand any residual grey objects to the caller.
    pub fn drain_residual(&self, mut f: impl FnMut(ObjectRef)) {
        self.residual.drain(&mut f);
    }

    pub fn deactivate_all(&self) {
        self.barrier_active.store(false, Ordering::Relaxed);
    }

    /// Migration observer: carry a source object's marking state over to its
    /// copy so a concurrently running marker does not lose it.
    pub fn transfer_color(&self, heap: &Heap, src: ObjectRef, dst: ObjectRef) {
        if !self.is_marking() {
            return;
        }
        let src_bitmap = &heap.page(src.page()).bitmap;
        if src_bitmap.is_marked(src.word_index()) {
            let dst_bitmap = &heap.page(dst.page()).bitmap;
            dst_bitmap.attempt_white_to_grey(dst.word_index());
            if src_bitmap.is_black(src.word_index()) {
                dst_bitmap.grey_to_black(dst.word_index());
            }
        }
    }
}

impl Default for IncrementalMarker {
    fn default() -> Self {
        Self::new()
    }
}
