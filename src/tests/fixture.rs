//! Shared scaffolding for collection scenarios.

use crate::collector::GarbageCollector;
use crate::heap::space::SpaceId;
use crate::heap::Heap;
use crate::object::{ObjectRef, PageId, TaggedValue};
use crate::roots::Handle;
use crate::util::options::Options;
use std::sync::Arc;

pub struct GcFixture {
    pub heap: Heap,
    pub gc: GarbageCollector,
}

impl GcFixture {
    pub fn new() -> GcFixture {
        Self::with_options(|_| {})
    }

    pub fn with_options(configure: impl FnOnce(&mut Options)) -> GcFixture {
        let mut options = Options::default();
        // Keep worker fan-out modest so scenarios stay deterministic-ish.
        options.set_from_command_line("threads", "2");
        configure(&mut options);
        let options = Arc::new(options);
        let heap = Heap::new(options.clone());
        let mut gc = GarbageCollector::new(options);
        gc.set_up();
        GcFixture { heap, gc }
    }

    /// Register a strong global root for `obj`.
    pub fn root(&self, obj: ObjectRef) -> Handle {
        self.heap.globals.create(TaggedValue::from_strong(obj))
    }

    /// The current referent of a rooted handle (follows any relocation).
    pub fn root_value(&self, handle: Handle) -> ObjectRef {
        self.heap
            .globals
            .get(handle)
            .to_object()
            .expect("root was cleared")
    }

    pub fn collect_full(&mut self) {
        self.gc.collect_full(&self.heap);
    }

    pub fn collect_young(&mut self) {
        self.gc.collect_young(&self.heap);
    }

    /// Open a fresh page in `space` and make it the allocation target.
    pub fn fresh_page(&self, space: SpaceId) -> PageId {
        self.heap.allocate_next_page(space)
    }

    pub fn strong(&self, obj: ObjectRef) -> TaggedValue {
        TaggedValue::from_strong(obj)
    }
}
