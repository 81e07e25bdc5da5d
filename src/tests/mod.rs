//! End-to-end collection scenarios.

mod fixture;

mod compaction;
mod embedder_tracing;
mod full_cycle;
mod minor_cycle;
mod weak_objects;
