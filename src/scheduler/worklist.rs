//! Multi-producer/multi-consumer worklists with per-thread local buffers.
//!
//! The global pool stores published segments in a lock-free queue; a
//! [`WorklistLocal`] buffers up to a segment's worth of entries to amortize
//! the cost of the shared pool and preserve per-thread cache locality. The
//! marker's local additionally supports an on-hold stash for objects that
//! must be re-processed after a context switch. Worklists are drained to
//! completion at each pipeline barrier; `is_empty_local_and_global` is
//! asserted there.

use crate::util::constants::WORKLIST_SEGMENT_SIZE;
use crossbeam::queue::SegQueue;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

type Segment<T> = Vec<T>;

pub struct Worklist<T> {
    segments: SegQueue<Segment<T>>,
    entries: AtomicUsize,
}

impl<T> Worklist<T> {
    pub fn new() -> Worklist<T> {
        Worklist {
            segments: SegQueue::new(),
            entries: AtomicUsize::new(0),
        }
    }

    pub fn push_segment(&self, segment: Segment<T>) {
        debug_assert!(!segment.is_empty());
        self.entries.fetch_add(segment.len(), Ordering::Relaxed);
        self.segments.push(segment);
    }

    pub fn pop_segment(&self) -> Option<Segment<T>> {
        let segment = self.segments.pop()?;
        self.entries.fetch_sub(segment.len(), Ordering::Relaxed);
        Some(segment)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    /// Exchange the contents of two worklists (the ephemeron fixpoint swaps
    /// `next_ephemerons` into `current_ephemerons`). Only called at pipeline
    /// barriers, with no concurrent producers or consumers.
    pub fn swap(&self, other: &Worklist<T>) {
        let mut ours = Vec::new();
        while let Some(segment) = self.pop_segment() {
            ours.push(segment);
        }
        let mut theirs = Vec::new();
        while let Some(segment) = other.pop_segment() {
            theirs.push(segment);
        }
        for segment in theirs {
            self.push_segment(segment);
        }
        for segment in ours {
            other.push_segment(segment);
        }
    }

    pub fn clear(&self) {
        while self.pop_segment().is_some() {}
    }

    /// Drain every published entry on the calling thread.
    pub fn drain(&self, mut f: impl FnMut(T)) {
        while let Some(segment) = self.pop_segment() {
            for item in segment {
                f(item);
            }
        }
    }

    pub fn local(&self) -> WorklistLocal<'_, T> {
        WorklistLocal {
            worklist: self,
            buffer: Vec::with_capacity(WORKLIST_SEGMENT_SIZE),
            on_hold: Vec::new(),
        }
    }
}

impl<T> Default for Worklist<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread-local view of a worklist. Must be published or dropped before
/// its worker joins; dropping publishes any remaining entries.
pub struct WorklistLocal<'a, T> {
    worklist: &'a Worklist<T>,
    buffer: Vec<T>,
    on_hold: Vec<T>,
}

impl<'a, T> WorklistLocal<'a, T> {
    pub fn push(&mut self, item: T) {
        if self.buffer.len() >= WORKLIST_SEGMENT_SIZE {
            let segment = mem::replace(&mut self.buffer, Vec::with_capacity(WORKLIST_SEGMENT_SIZE));
            self.worklist.push_segment(segment);
        }
        self.buffer.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        if let Some(item) = self.buffer.pop() {
            return Some(item);
        }
        self.buffer = self.worklist.pop_segment()?;
        self.buffer.pop()
    }

    /// Stash an item to be re-processed later on this thread.
    pub fn push_on_hold(&mut self, item: T) {
        self.on_hold.push(item);
    }

    /// Move the on-hold stash back into the regular buffer.
    pub fn flush_on_hold(&mut self) {
        while let Some(item) = self.on_hold.pop() {
            self.push(item);
        }
    }

    /// Flush the thread-local buffer to the global pool.
    pub fn publish(&mut self) {
        self.flush_on_hold();
        if !self.buffer.is_empty() {
            let segment = mem::take(&mut self.buffer);
            self.worklist.push_segment(segment);
        }
    }

    pub fn is_empty_local(&self) -> bool {
        self.buffer.is_empty() && self.on_hold.is_empty()
    }

    pub fn is_empty_local_and_global(&self) -> bool {
        self.is_empty_local() && self.worklist.is_empty()
    }
}

impl<'a, T> Drop for WorklistLocal<'a, T> {
    fn drop(&mut self) {
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn local_buffers_until_segment_full() {
        let worklist = Worklist::new();
        let mut local = worklist.local();
        for i in 0..WORKLIST_SEGMENT_SIZE {
            local.push(i);
        }
        // Everything still fits the local buffer.
        assert!(worklist.is_empty());
        local.push(WORKLIST_SEGMENT_SIZE);
        assert!(!worklist.is_empty());
    }

    #[test]
    fn publish_makes_work_globally_visible() {
        let worklist = Worklist::new();
        let mut producer = worklist.local();
        producer.push(42);
        assert!(!producer.is_empty_local_and_global());
        producer.publish();
        assert!(producer.is_empty_local());

        let mut consumer = worklist.local();
        assert_eq!(consumer.pop(), Some(42));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn on_hold_items_return_on_flush() {
        let worklist = Worklist::new();
        let mut local = worklist.local();
        local.push_on_hold(7);
        assert_eq!(local.pop(), None);
        local.flush_on_hold();
        assert_eq!(local.pop(), Some(7));
    }

    #[test]
    fn swap_exchanges_contents() {
        let a = Worklist::new();
        let b = Worklist::new();
        a.local().push(1);
        a.swap(&b);
        assert!(a.is_empty());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn drop_publishes_remaining_entries() {
        let worklist = Worklist::new();
        {
            let mut local = worklist.local();
            local.push(3);
        }
        assert_eq!(worklist.len(), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let worklist: Arc<Worklist<usize>> = Arc::new(Worklist::new());
        let consumed = Arc::new(AtomicUsize::new(0));
        const PER_PRODUCER: usize = 10_000;

        panic_after(5000, {
            let worklist = worklist.clone();
            let consumed = consumed.clone();
            move || {
                std::thread::scope(|scope| {
                    for t in 0..2 {
                        let worklist = &worklist;
                        scope.spawn(move || {
                            let mut local = worklist.local();
                            for i in 0..PER_PRODUCER {
                                local.push(t * PER_PRODUCER + i);
                            }
                            local.publish();
                        });
                    }
                });
                // All work is published; drain it.
                worklist.drain(|_| {
                    consumed.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(consumed.load(Ordering::Relaxed), 2 * PER_PRODUCER);
    }
}
