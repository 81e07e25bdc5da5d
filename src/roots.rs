//! Strong-root storage and enumeration.
//!
//! Roots come in two shapes: *updatable slots* (stack scopes, global handles,
//! the top-frame code entry) that the pointer-update phase rewrites, and
//! *immovable roots* (the bootstrap well-knowns, whose pages are flagged
//! never-evacuate) that only the marker cares about.

use crate::heap::Heap;
use crate::object::{ObjectRef, TaggedValue};
use std::sync::Mutex;

/// Root categories a traversal may skip.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct SkipRoots(u32);

impl SkipRoots {
    pub const NONE: SkipRoots = SkipRoots(0);
    pub const STACK: SkipRoots = SkipRoots(1 << 0);
    pub const GLOBAL_HANDLES: SkipRoots = SkipRoots(1 << 1);
    pub const TOP_FRAME: SkipRoots = SkipRoots(1 << 2);
    pub const CLIENTS: SkipRoots = SkipRoots(1 << 3);

    pub fn with(self, other: SkipRoots) -> SkipRoots {
        SkipRoots(self.0 | other.0)
    }

    pub fn contains(self, other: SkipRoots) -> bool {
        self.0 & other.0 != 0
    }
}

/// A visitor over strong roots.
pub trait RootVisitor {
    /// An updatable root slot holding a tagged value.
    fn visit_root_slot(&mut self, slot: &mut TaggedValue);

    /// A root that is guaranteed never to move.
    fn visit_immovable_root(&mut self, obj: ObjectRef);
}

/// The per-isolate mutable root storage.
pub struct RootSet {
    /// Conservative stack values of the isolate's threads.
    stack: Mutex<Vec<TaggedValue>>,
    /// The code object of the top-of-stack optimized frame, or Smi 0. Its
    /// deoptimization literals are retained by a custom body visit.
    top_frame_code: Mutex<TaggedValue>,
}

impl RootSet {
    pub fn new() -> RootSet {
        RootSet {
            stack: Mutex::new(Vec::new()),
            top_frame_code: Mutex::new(TaggedValue::from_smi(0)),
        }
    }

    pub fn push_stack_root(&self, value: TaggedValue) {
        self.stack.lock().unwrap().push(value);
    }

    pub fn clear_stack(&self) {
        self.stack.lock().unwrap().clear();
    }

    pub fn stack_roots(&self) -> Vec<TaggedValue> {
        self.stack.lock().unwrap().clone()
    }

    pub fn set_top_frame_code(&self, code: TaggedValue) {
        *self.top_frame_code.lock().unwrap() = code;
    }

    pub fn top_frame_code(&self) -> TaggedValue {
        *self.top_frame_code.lock().unwrap()
    }

    fn iterate(&self, visitor: &mut impl RootVisitor, skip: SkipRoots) {
        if !skip.contains(SkipRoots::STACK) {
            let mut stack = self.stack.lock().unwrap();
            for slot in stack.iter_mut() {
                visitor.visit_root_slot(slot);
            }
        }
        if !skip.contains(SkipRoots::TOP_FRAME) {
            let mut top = self.top_frame_code.lock().unwrap();
            visitor.visit_root_slot(&mut top);
        }
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}

/// An index into the global handle arena.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Handle(usize);

struct HandleEntry {
    value: TaggedValue,
    /// Invoked when a phantom handle's referent dies. Phantom handles are
    /// weak roots: they do not keep their referent alive.
    phantom_callback: Option<Box<dyn FnMut(ObjectRef) + Send>>,
    free: bool,
}

/// An arena of global root slots with optional phantom registration.
pub struct GlobalHandles {
    entries: Mutex<Vec<HandleEntry>>,
}

impl GlobalHandles {
    pub fn new() -> GlobalHandles {
        GlobalHandles {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn create(&self, value: TaggedValue) -> Handle {
        self.create_entry(value, None)
    }

    pub fn create_phantom(
        &self,
        value: TaggedValue,
        callback: Box<dyn FnMut(ObjectRef) + Send>,
    ) -> Handle {
        self.create_entry(value, Some(callback))
    }

    fn create_entry(
        &self,
        value: TaggedValue,
        phantom_callback: Option<Box<dyn FnMut(ObjectRef) + Send>>,
    ) -> Handle {
        let mut entries = self.entries.lock().unwrap();
        entries.push(HandleEntry {
            value,
            phantom_callback,
            free: false,
        });
        Handle(entries.len() - 1)
    }

    pub fn get(&self, handle: Handle) -> TaggedValue {
        let entries = self.entries.lock().unwrap();
        debug_assert!(!entries[handle.0].free);
        entries[handle.0].value
    }

    pub fn destroy(&self, handle: Handle) {
        let mut entries = self.entries.lock().unwrap();
        entries[handle.0].free = true;
        entries[handle.0].phantom_callback = None;
    }

    fn iterate_strong(&self, visitor: &mut impl RootVisitor) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.free || entry.phantom_callback.is_some() {
                continue;
            }
            visitor.visit_root_slot(&mut entry.value);
        }
    }

    /// Clearing step 4: invoke callbacks of phantom handles whose referents
    /// died, then clear the handle.
    pub fn process_phantom_handles(&self, is_dead: impl Fn(ObjectRef) -> bool) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if entry.free || entry.phantom_callback.is_none() {
                continue;
            }
            if let Some(referent) = entry.value.to_object() {
                if is_dead(referent) {
                    if let Some(mut callback) = entry.phantom_callback.take() {
                        callback(referent);
                    }
                    entry.value = TaggedValue::from_smi(0);
                    entry.free = true;
                }
            }
        }
    }

    /// The pointer-update phase rewrites live phantom slots too: a surviving
    /// referent may have moved.
    pub fn update_all_slots(&self, mut update: impl FnMut(&mut TaggedValue)) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter_mut() {
            if !entry.free {
                update(&mut entry.value);
            }
        }
    }
}

impl Default for GlobalHandles {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterate the isolate's strong roots with the given skip set.
pub fn iterate_roots(heap: &Heap, visitor: &mut impl RootVisitor, skip: SkipRoots) {
    for obj in heap.well_known().roots() {
        visitor.visit_immovable_root(obj);
    }
    heap.roots.iterate(visitor, skip);
    if !skip.contains(SkipRoots::GLOBAL_HANDLES) {
        heap.globals.iterate_strong(visitor);
    }
}

/// Iterate strong roots, including each client isolate's roots (shared-GC
/// mode).
pub fn iterate_roots_including_clients(
    heap: &Heap,
    visitor: &mut impl RootVisitor,
    skip: SkipRoots,
) {
    iterate_roots(heap, visitor, skip);
    if !skip.contains(SkipRoots::CLIENTS) {
        for client in heap.client_roots.iter() {
            client.iterate(visitor, skip);
        }
    }
}
