//! magpie-gc is a full-heap mark-compact garbage collector (with a
//! young-generation mark-compact sibling) for a managed-object heap backing
//! a high-performance language runtime.
//!
//! Logically, the crate divides into:
//! * The [object model](object/index.html): tagged words, packed object
//!   references, map words that double as forwarding addresses, and the
//!   closed set of instance kinds the collector can visit.
//! * The [heap](heap/index.html): an index-addressed page arena with per-page
//!   mark bitmaps, live-byte counters, remembered sets, a factory for every
//!   instance kind, the evacuation allocator and the lazy sweeper.
//! * The [collector](collector/index.html): the marking driver with its
//!   ephemeron fixpoint, the weak-reference clearing pipeline, compaction
//!   candidate selection, the parallel evacuator, the pointer-update phase,
//!   and the nursery variant.
//! * The [scheduler](scheduler/index.html): block-based worklists with
//!   thread-local buffers and the job runner that fans phases out to worker
//!   threads.

#[macro_use]
extern crate log;
#[cfg(test)]
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

pub mod collector;
pub mod embedder;
pub mod heap;
pub mod object;
pub mod roots;
pub mod scheduler;
pub mod util;

#[cfg(test)]
mod tests;

pub use crate::collector::GarbageCollector;
pub use crate::heap::space::SpaceId;
pub use crate::heap::Heap;
pub use crate::object::{ObjectRef, TaggedValue};
pub use crate::util::options::Options;
