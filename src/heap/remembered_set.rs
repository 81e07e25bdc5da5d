//! Per-page remembered sets.
//!
//! A [`SlotSet`] is a compact bitmap keyed by word offset within the page; a
//! [`TypedSlotSet`] stores code-relocation slots with a (kind, offset) tag.
//! Each page carries one of each per source->target class.

use crate::object::map::TypedSlotKind;
use enum_map::Enum;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// The source->target classes of remembered sets.
#[derive(Enum, Copy, Clone, PartialEq, Eq, Debug)]
pub enum RememberedSetClass {
    /// Old-generation slots pointing into the nursery.
    OldToNew,
    /// Slots that point into evacuation candidates and must be rewritten
    /// after evacuation.
    OldToOld,
    /// Strong code references held in non-code spaces.
    OldToCode,
    /// References from per-isolate pages into the shared heap.
    OldToShared,
}

/// Verdict of a slot callback during iteration.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SlotVerdict {
    Keep,
    Remove,
}

const BITS_PER_CELL: usize = 32;

/// An untyped slot set: a lazily allocated bitmap of word offsets.
///
/// Insertion during marking and evacuation is racy-by-design across workers
/// writing to disjoint chunks; the bitmap uses relaxed atomics throughout.
/// Structured iteration during pointer updates happens under the page mutex.
pub struct SlotSet {
    bits: spin::RwLock<Option<Box<[AtomicU32]>>>,
    area_words: usize,
}

impl SlotSet {
    pub fn new(area_words: usize) -> SlotSet {
        SlotSet {
            bits: spin::RwLock::new(None),
            area_words,
        }
    }

    fn allocate(area_words: usize) -> Box<[AtomicU32]> {
        (0..area_words.div_ceil(BITS_PER_CELL))
            .map(|_| AtomicU32::new(0))
            .collect()
    }

    pub fn insert(&self, word: u32) {
        debug_assert!((word as usize) < self.area_words);
        let mask = 1 << (word as usize % BITS_PER_CELL);
        {
            let guard = self.bits.read();
            if let Some(bits) = guard.as_ref() {
                bits[word as usize / BITS_PER_CELL].fetch_or(mask, Ordering::Relaxed);
                return;
            }
        }
        let mut guard = self.bits.write();
        if guard.is_none() {
            *guard = Some(Self::allocate(self.area_words));
        }
        guard.as_ref().unwrap()[word as usize / BITS_PER_CELL].fetch_or(mask, Ordering::Relaxed);
    }

    pub fn contains(&self, word: u32) -> bool {
        let guard = self.bits.read();
        match guard.as_ref() {
            Some(bits) => {
                bits[word as usize / BITS_PER_CELL].load(Ordering::Relaxed)
                    & (1 << (word as usize % BITS_PER_CELL))
                    != 0
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.bits.read();
        match guard.as_ref() {
            Some(bits) => bits.iter().all(|cell| cell.load(Ordering::Relaxed) == 0),
            None => true,
        }
    }

    pub fn clear(&self) {
        *self.bits.write() = None;
    }

    /// Remove every recorded slot in `[start, end)`.
    pub fn remove_range(&self, start: u32, end: u32) {
        let guard = self.bits.read();
        if let Some(bits) = guard.as_ref() {
            for word in start..end.min(self.area_words as u32) {
                let mask = !(1u32 << (word as usize % BITS_PER_CELL));
                bits[word as usize / BITS_PER_CELL].fetch_and(mask, Ordering::Relaxed);
            }
        }
    }

    /// Visit every recorded offset, dropping slots for which the callback
    /// returns [`SlotVerdict::Remove`].
    pub fn iterate_and_filter(&self, mut f: impl FnMut(u32) -> SlotVerdict) {
        let guard = self.bits.read();
        let Some(bits) = guard.as_ref() else {
            return;
        };
        for (cell_index, cell) in bits.iter().enumerate() {
            let mut value = cell.load(Ordering::Relaxed);
            if value == 0 {
                continue;
            }
            let mut kept = 0u32;
            while value != 0 {
                let bit = value.trailing_zeros();
                value &= value - 1;
                let word = (cell_index * BITS_PER_CELL) as u32 + bit;
                if f(word) == SlotVerdict::Keep {
                    kept |= 1 << bit;
                }
            }
            cell.store(kept, Ordering::Relaxed);
        }
    }

    /// Visit every recorded offset without modifying the set.
    pub fn iterate(&self, mut f: impl FnMut(u32)) {
        self.iterate_and_filter(|word| {
            f(word);
            SlotVerdict::Keep
        })
    }

    pub fn count(&self) -> usize {
        let guard = self.bits.read();
        match guard.as_ref() {
            Some(bits) => bits
                .iter()
                .map(|cell| cell.load(Ordering::Relaxed).count_ones() as usize)
                .sum(),
            None => 0,
        }
    }
}

/// A typed slot: a code-relocation entry at a page-relative word offset.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TypedSlot {
    pub kind: TypedSlotKind,
    pub offset: u32,
}

/// A typed slot set. Insertion takes a lock: background code publication
/// (e.g. a tiering compiler) may insert concurrently with mutator execution.
pub struct TypedSlotSet {
    slots: Mutex<Vec<TypedSlot>>,
}

impl TypedSlotSet {
    pub fn new() -> TypedSlotSet {
        TypedSlotSet {
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, kind: TypedSlotKind, offset: u32) {
        self.slots.lock().unwrap().push(TypedSlot { kind, offset });
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap().clear();
    }

    pub fn remove_range(&self, start: u32, end: u32) {
        self.slots
            .lock()
            .unwrap()
            .retain(|slot| slot.offset < start || slot.offset >= end);
    }

    pub fn iterate_and_filter(&self, mut f: impl FnMut(TypedSlot) -> SlotVerdict) {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|slot| f(*slot) == SlotVerdict::Keep);
    }
}

impl Default for TypedSlotSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_iterate_filter() {
        let set = SlotSet::new(4096);
        set.insert(3);
        set.insert(77);
        set.insert(4095);
        assert_eq!(set.count(), 3);
        assert!(set.contains(77));

        let mut seen = Vec::new();
        set.iterate_and_filter(|word| {
            seen.push(word);
            if word == 77 {
                SlotVerdict::Remove
            } else {
                SlotVerdict::Keep
            }
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![3, 77, 4095]);
        assert!(!set.contains(77));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn remove_range_discards_prefix() {
        let set = SlotSet::new(4096);
        for word in [0, 10, 100, 1000] {
            set.insert(word);
        }
        set.remove_range(0, 100);
        assert!(!set.contains(0));
        assert!(!set.contains(10));
        assert!(set.contains(100));
        assert!(set.contains(1000));
    }

    #[test]
    fn empty_set_allocates_nothing() {
        let set = SlotSet::new(4096);
        assert!(set.is_empty());
        set.iterate(|_| panic!("no slots expected"));
        set.remove_range(0, 4096);
    }

    #[test]
    fn typed_slots_filter_by_kind() {
        let set = TypedSlotSet::new();
        set.insert(TypedSlotKind::CodeEntry, 12);
        set.insert(TypedSlotKind::EmbeddedObjectFull, 13);
        set.iterate_and_filter(|slot| {
            if slot.kind == TypedSlotKind::CodeEntry {
                SlotVerdict::Remove
            } else {
                SlotVerdict::Keep
            }
        });
        let mut remaining = Vec::new();
        set.iterate_and_filter(|slot| {
            remaining.push(slot);
            SlotVerdict::Keep
        });
        assert_eq!(
            remaining,
            vec![TypedSlot {
                kind: TypedSlotKind::EmbeddedObjectFull,
                offset: 13
            }]
        );
    }

    #[test]
    fn concurrent_insertion_is_lossless() {
        let set = SlotSet::new(4096);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let set = &set;
                scope.spawn(move || {
                    for word in (t..4096).step_by(4) {
                        set.insert(word as u32);
                    }
                });
            }
        });
        assert_eq!(set.count(), 4096);
    }
}
