//! Pages: fixed-size, index-addressed regions holding objects of one space.
//!
//! A page owns its payload words, a mark bitmap, a live-byte counter, atomic
//! flag bits, remembered sets per class, an invalidated-object list and (on
//! executable pages) a code object registry. Pages are arena-allocated in the
//! heap's page table; the collector borrows them for the duration of a phase.

use crate::heap::bitmap::MarkBitmap;
use crate::heap::remembered_set::{RememberedSetClass, SlotSet, TypedSlotSet};
use crate::heap::space::SpaceId;
use crate::util::constants::WORD_BYTES;
use atomic::Atomic;
use enum_map::EnumMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Page flag bits, set and cleared with atomic read-modify-writes.
pub mod flags {
    pub const EVACUATION_CANDIDATE: u32 = 1 << 0;
    pub const NEVER_EVACUATE: u32 = 1 << 1;
    pub const PINNED: u32 = 1 << 2;
    pub const FROM_PAGE: u32 = 1 << 3;
    pub const TO_PAGE: u32 = 1 << 4;
    pub const PAGE_NEW_TO_OLD: u32 = 1 << 5;
    pub const PAGE_NEW_TO_NEW: u32 = 1 << 6;
    pub const COMPACTION_WAS_ABORTED: u32 = 1 << 7;
    pub const EXECUTABLE: u32 = 1 << 8;
    pub const NEVER_ALLOCATE_ON_PAGE: u32 = 1 << 9;
    pub const FORCE_EVACUATION_CANDIDATE_FOR_TESTING: u32 = 1 << 10;
    pub const LARGE_PAGE: u32 = 1 << 11;
    /// A nursery page whose objects predate the age mark (they survived a
    /// previous collection).
    pub const NEW_BELOW_AGE_MARK: u32 = 1 << 12;
}

/// Sweeping progress of a page.
#[derive(Copy, Clone, PartialEq, Eq, Debug, bytemuck::NoUninit)]
#[repr(u8)]
pub enum SweepState {
    Swept,
    Pending,
    InProgress,
}

/// Grants write access to a (possibly executable) page for its lifetime.
/// Every mark-or-sweep scope that modifies read-only-executable pages holds
/// one; access is rescinded on all exits.
pub struct CodePageWriteScope<'a> {
    page: &'a Page,
}

impl<'a> CodePageWriteScope<'a> {
    pub fn new(page: &'a Page) -> CodePageWriteScope<'a> {
        page.enter_write_scope();
        CodePageWriteScope { page }
    }
}

impl Drop for CodePageWriteScope<'_> {
    fn drop(&mut self) {
        self.page.exit_write_scope();
    }
}

/// A free region produced by sweeping: `(start word, size in words)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct FreeRegion {
    pub start: u32,
    pub words: u32,
}

/// An object on this page whose tail was freed (e.g. a right-trimmed
/// descriptor array); recorded slots beyond `valid_words` are stale.
#[derive(Copy, Clone, Debug)]
pub struct InvalidatedRegion {
    pub object_word: u32,
    pub valid_words: u32,
    pub full_words: u32,
}

pub struct Page {
    space: Atomic<SpaceId>,
    flags: AtomicU32,
    words: Box<[AtomicU64]>,
    pub bitmap: MarkBitmap,
    live_bytes: AtomicUsize,
    allocated_bytes: AtomicUsize,
    /// Bump cursor: objects live in `[0, top)`.
    top: AtomicU32,
    sweep_state: Atomic<SweepState>,
    slot_sets: EnumMap<RememberedSetClass, SlotSet>,
    typed_slot_sets: EnumMap<RememberedSetClass, TypedSlotSet>,
    /// The per-chunk mutex guarding structured slot walks.
    pub mutex: Mutex<()>,
    invalidated: Mutex<Vec<InvalidatedRegion>>,
    /// Header offsets of code objects (executable pages).
    code_objects: Mutex<Vec<u32>>,
    free_list: Mutex<Vec<FreeRegion>>,
    /// Nesting depth of write scopes on this (executable) page.
    write_scope_depth: AtomicUsize,
}

impl Page {
    pub fn new(space: SpaceId, area_words: usize) -> Page {
        let words = (0..area_words).map(|_| AtomicU64::new(0)).collect();
        let mut initial_flags = 0;
        if space.is_executable() {
            initial_flags |= flags::EXECUTABLE;
        }
        if matches!(space, SpaceId::Large | SpaceId::NewLarge) {
            initial_flags |= flags::LARGE_PAGE;
        }
        Page {
            space: Atomic::new(space),
            flags: AtomicU32::new(initial_flags),
            words,
            bitmap: MarkBitmap::new(area_words),
            live_bytes: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            top: AtomicU32::new(0),
            sweep_state: Atomic::new(SweepState::Swept),
            slot_sets: EnumMap::from_fn(|_| SlotSet::new(area_words)),
            typed_slot_sets: EnumMap::from_fn(|_| TypedSlotSet::new()),
            mutex: Mutex::new(()),
            invalidated: Mutex::new(Vec::new()),
            code_objects: Mutex::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            write_scope_depth: AtomicUsize::new(0),
        }
    }

    pub fn space(&self) -> SpaceId {
        self.space.load(Ordering::Relaxed)
    }

    /// Flip page ownership to another space (whole-page promotion).
    pub fn set_space(&self, space: SpaceId) {
        self.space.store(space, Ordering::Relaxed);
    }

    pub fn area_start(&self) -> u32 {
        0
    }

    pub fn area_end(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn contains(&self, word: u32) -> bool {
        (word as usize) < self.words.len()
    }

    pub fn area_words(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn area_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    // Flag bits.

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::Relaxed);
    }

    pub fn is_evacuation_candidate(&self) -> bool {
        self.has_flag(flags::EVACUATION_CANDIDATE)
    }

    pub fn is_large(&self) -> bool {
        self.has_flag(flags::LARGE_PAGE)
    }

    /// Slots on candidate pages are not recorded: their objects move and are
    /// re-scanned on copy.
    pub fn should_skip_slot_recording(&self) -> bool {
        self.is_evacuation_candidate()
    }

    // Payload access.

    pub fn read_word(&self, word: u32) -> u64 {
        self.words[word as usize].load(Ordering::Relaxed)
    }

    pub fn write_word(&self, word: u32, value: u64) {
        debug_assert!(
            !self.has_flag(flags::EXECUTABLE)
                || self.write_scope_depth.load(Ordering::Relaxed) > 0,
            "write to executable page outside a modification scope"
        );
        self.words[word as usize].store(value, Ordering::Relaxed);
    }

    pub fn compare_exchange_word(&self, word: u32, old: u64, new: u64) -> bool {
        self.words[word as usize]
            .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    // Counters.

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_live_bytes(&self, bytes: usize) {
        self.live_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    pub fn add_allocated_bytes(&self, bytes: usize) {
        self.allocated_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_allocated_bytes(&self, bytes: usize) {
        self.allocated_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn set_allocated_bytes(&self, bytes: usize) {
        self.allocated_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn free_bytes(&self) -> usize {
        self.area_bytes() - self.allocated_bytes()
    }

    /// Free percentage of the page's area (its fragmentation score).
    pub fn fragmentation_pct(&self) -> usize {
        self.free_bytes() * 100 / self.area_bytes()
    }

    // Bump allocation.

    pub fn top(&self) -> u32 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn set_top(&self, top: u32) {
        self.top.store(top, Ordering::Relaxed);
    }

    /// Claim `size` words from the bump cursor, if they fit.
    pub fn try_bump(&self, size: u32) -> Option<u32> {
        let area = self.area_words();
        self.top
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |top| {
                if top + size <= area {
                    Some(top + size)
                } else {
                    None
                }
            })
            .ok()
    }

    // Remembered sets.

    pub fn slot_set(&self, class: RememberedSetClass) -> &SlotSet {
        &self.slot_sets[class]
    }

    pub fn typed_slot_set(&self, class: RememberedSetClass) -> &TypedSlotSet {
        &self.typed_slot_sets[class]
    }

    pub fn has_recorded_slots(&self) -> bool {
        self.slot_sets.values().any(|set| !set.is_empty())
            || self.typed_slot_sets.values().any(|set| !set.is_empty())
    }

    // Sweeping.

    pub fn sweep_state(&self) -> SweepState {
        self.sweep_state.load(Ordering::Acquire)
    }

    pub fn set_sweep_state(&self, state: SweepState) {
        self.sweep_state.store(state, Ordering::Release);
    }

    pub fn try_start_sweeping(&self) -> bool {
        self.sweep_state
            .compare_exchange(
                SweepState::Pending,
                SweepState::InProgress,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // Free list.

    pub fn clear_free_list(&self) {
        self.free_list.lock().unwrap().clear();
    }

    pub fn add_free_region(&self, region: FreeRegion) {
        self.free_list.lock().unwrap().push(region);
    }

    /// First-fit removal of a region with at least `size` words. The caller
    /// re-installs any remainder as a filler.
    pub fn take_free_region(&self, size: u32) -> Option<FreeRegion> {
        let mut list = self.free_list.lock().unwrap();
        let pos = list.iter().position(|r| r.words >= size)?;
        Some(list.swap_remove(pos))
    }

    pub fn free_list_bytes(&self) -> usize {
        self.free_list
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.words as usize * WORD_BYTES)
            .sum()
    }

    // Invalidated objects.

    pub fn register_invalidated_object(&self, region: InvalidatedRegion) {
        self.invalidated.lock().unwrap().push(region);
    }

    pub fn invalidated_objects(&self) -> Vec<InvalidatedRegion> {
        self.invalidated.lock().unwrap().clone()
    }

    pub fn clear_invalidated_objects(&self) {
        self.invalidated.lock().unwrap().clear();
    }

    // Code page write scopes.

    pub(crate) fn enter_write_scope(&self) {
        self.write_scope_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exit_write_scope(&self) {
        let old = self.write_scope_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0);
    }

    // Code object registry.

    pub fn register_code_object(&self, offset: u32) {
        debug_assert!(self.has_flag(flags::EXECUTABLE));
        self.code_objects.lock().unwrap().push(offset);
    }

    pub fn code_object_offsets(&self) -> Vec<u32> {
        self.code_objects.lock().unwrap().clone()
    }

    pub fn clear_code_object_registry(&self) {
        self.code_objects.lock().unwrap().clear();
    }
}
