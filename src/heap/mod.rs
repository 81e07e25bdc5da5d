//! The managed heap: a page-table arena, per-space bookkeeping, object
//! access, slot recording, and raw allocation.

pub mod allocator;
pub mod bitmap;
pub mod factory;
pub mod incremental;
pub mod page;
pub mod remembered_set;
pub mod space;
pub mod sweeper;

use crate::object::map::{self, free_space_layout, InstanceKind};
use crate::object::{MapWord, ObjectRef, PageId, TaggedValue};
use crate::roots::{GlobalHandles, RootSet};
use crate::util::constants::{
    MAX_REGULAR_OBJECT_WORDS, MIN_OBJECT_SIZE_WORDS, WORDS_IN_PAGE, WORD_BYTES,
};
use crate::util::options::Options;
use atomic::Atomic;
use enum_map::EnumMap;
use incremental::IncrementalMarker;
use page::{flags, FreeRegion, Page};
use remembered_set::RememberedSetClass;
use space::{Space, SpaceId, StackState};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Capacity of the page table (1 GiB of regular pages).
const MAX_PAGES: usize = 1 << 15;

/// An append-mostly arena of pages addressed by index.
///
/// Insertion is lock-free (id reuse takes a short lock); `get` dereferences a
/// published pointer. Release only happens on the main thread between
/// parallel phases, while no worker holds a page reference; that phase
/// discipline is what makes the raw dereference sound.
struct PageTable {
    slots: Box<[AtomicPtr<Page>]>,
    len: AtomicUsize,
    free_ids: Mutex<Vec<PageId>>,
}

impl PageTable {
    fn new() -> PageTable {
        let slots = (0..MAX_PAGES)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        PageTable {
            slots,
            // Index 0 is reserved so a zero ObjectRef is never valid.
            len: AtomicUsize::new(1),
            free_ids: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, page: Box<Page>) -> PageId {
        let id = if let Some(id) = self.free_ids.lock().unwrap().pop() {
            id
        } else {
            let id = self.len.fetch_add(1, Ordering::Relaxed);
            assert!(id < MAX_PAGES, "page table exhausted");
            id as PageId
        };
        self.slots[id as usize].store(Box::into_raw(page), Ordering::Release);
        id
    }

    fn get(&self, id: PageId) -> &Page {
        let ptr = self.slots[id as usize].load(Ordering::Acquire);
        assert!(!ptr.is_null(), "access to released page {}", id);
        unsafe { &*ptr }
    }

    fn release(&self, id: PageId) {
        let ptr = self.slots[id as usize].swap(std::ptr::null_mut(), Ordering::AcqRel);
        assert!(!ptr.is_null(), "double release of page {}", id);
        drop(unsafe { Box::from_raw(ptr) });
        self.free_ids.lock().unwrap().push(id);
    }

    fn live_ids(&self) -> Vec<PageId> {
        let len = self.len.load(Ordering::Relaxed);
        (1..len as PageId)
            .filter(|id| !self.slots[*id as usize].load(Ordering::Acquire).is_null())
            .collect()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

/// Well-known always-live objects installed at bootstrap.
pub struct WellKnown {
    pub meta_map: ObjectRef,
    pub kind_maps: HashMap<InstanceKind, ObjectRef>,
    pub undefined: ObjectRef,
    pub the_hole: ObjectRef,
    pub uninitialized: ObjectRef,
    /// The stub flushed functions' code entries are reset to.
    pub lazy_compile_code: ObjectRef,
}

impl WellKnown {
    pub fn map_for(&self, kind: InstanceKind) -> ObjectRef {
        *self
            .kind_maps
            .get(&kind)
            .unwrap_or_else(|| panic!("no bootstrap map for {:?}", kind))
    }

    /// The well-known strong roots, in enumeration order.
    pub fn roots(&self) -> Vec<ObjectRef> {
        let mut roots = vec![
            self.meta_map,
            self.undefined,
            self.the_hole,
            self.uninitialized,
            self.lazy_compile_code,
        ];
        roots.extend(self.kind_maps.values().copied());
        roots
    }
}

/// The internalized string table: fixed bucket array so the clearing job can
/// be partitioned across workers.
pub struct StringTable {
    buckets: Vec<Mutex<Vec<ObjectRef>>>,
}

pub const STRING_TABLE_BUCKETS: usize = 64;

impl StringTable {
    fn new() -> StringTable {
        StringTable {
            buckets: (0..STRING_TABLE_BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> &Mutex<Vec<ObjectRef>> {
        &self.buckets[index]
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn string_hash(bytes: &[u8]) -> u64 {
    // FNV-1a.
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    hash
}

/// A record of a string forwarded during interning.
#[derive(Copy, Clone, Debug)]
pub struct ForwardRecord {
    pub original: ObjectRef,
    pub target: ObjectRef,
    pub dead: bool,
}

/// Registered backing stores of external strings.
pub struct ExternalResources {
    payloads: Mutex<Vec<Option<Vec<u8>>>>,
}

impl ExternalResources {
    fn new() -> ExternalResources {
        ExternalResources {
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, data: Vec<u8>) -> usize {
        let mut payloads = self.payloads.lock().unwrap();
        payloads.push(Some(data));
        payloads.len() - 1
    }

    /// Free the backing store; returns the number of bytes released.
    pub fn finalize(&self, id: usize) -> usize {
        let mut payloads = self.payloads.lock().unwrap();
        payloads[id].take().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_live(&self, id: usize) -> bool {
        self.payloads.lock().unwrap()[id].is_some()
    }
}

#[cfg(feature = "sandbox")]
pub mod external_pointer_table {
    use std::sync::Mutex;

    struct Entry {
        value: u64,
        marked: bool,
        free: bool,
    }

    /// The sandboxed external pointer table: entries carry a mark bit set
    /// while tracing wrappers and are swept as the last clearing step.
    pub struct ExternalPointerTable {
        entries: Mutex<Vec<Entry>>,
    }

    impl ExternalPointerTable {
        pub fn new() -> ExternalPointerTable {
            ExternalPointerTable {
                entries: Mutex::new(Vec::new()),
            }
        }

        pub fn allocate(&self, value: u64) -> usize {
            let mut entries = self.entries.lock().unwrap();
            entries.push(Entry {
                value,
                marked: false,
                free: false,
            });
            entries.len() - 1
        }

        pub fn mark(&self, handle: usize) {
            self.entries.lock().unwrap()[handle].marked = true;
        }

        pub fn get(&self, handle: usize) -> Option<u64> {
            let entries = self.entries.lock().unwrap();
            let entry = &entries[handle];
            (!entry.free).then_some(entry.value)
        }

        /// Free unmarked entries and reset mark bits. Returns the number of
        /// entries released.
        pub fn sweep(&self) -> usize {
            let mut entries = self.entries.lock().unwrap();
            let mut freed = 0;
            for entry in entries.iter_mut() {
                if entry.free {
                    continue;
                }
                if entry.marked {
                    entry.marked = false;
                } else {
                    entry.free = true;
                    freed += 1;
                }
            }
            freed
        }
    }
}

/// Recoverable allocation failure.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

/// Who asked for memory.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum AllocationOrigin {
    Mutator,
    Gc,
}

pub struct Heap {
    pub options: Arc<Options>,
    page_table: PageTable,
    spaces: EnumMap<SpaceId, Space>,
    pub globals: GlobalHandles,
    pub roots: RootSet,
    /// Client isolates' root sets, iterated when collecting a shared heap.
    pub client_roots: Vec<RootSet>,
    well_known: Option<WellKnown>,
    pub string_table: StringTable,
    pub string_forwarding: Mutex<Vec<ForwardRecord>>,
    pub external_strings: Mutex<Vec<ObjectRef>>,
    pub young_external_strings: Mutex<Vec<ObjectRef>>,
    pub external_resources: ExternalResources,
    /// Head of the allocation-site weak list (tagged bits; Smi 0 = empty).
    allocation_sites_head: AtomicU64,
    /// Ephemeron entries with young keys, keyed by table and entry index.
    pub ephemeron_remembered: Mutex<HashMap<ObjectRef, BTreeSet<u32>>>,
    /// Testing: fail the nth allocation in a space (-1 = disabled).
    oom_countdown: EnumMap<SpaceId, AtomicIsize>,
    stack_state: Atomic<StackState>,
    pub incremental_marker: IncrementalMarker,
    /// Promote internalizable strings to the shared old space on evacuation.
    pub shared_string_table: bool,
    #[cfg(feature = "sandbox")]
    pub external_pointer_table: external_pointer_table::ExternalPointerTable,
}

impl Heap {
    pub fn new(options: Arc<Options>) -> Heap {
        let mut heap = Heap {
            options,
            page_table: PageTable::new(),
            spaces: EnumMap::from_fn(Space::new),
            globals: GlobalHandles::new(),
            roots: RootSet::new(),
            client_roots: Vec::new(),
            well_known: None,
            string_table: StringTable::new(),
            string_forwarding: Mutex::new(Vec::new()),
            external_strings: Mutex::new(Vec::new()),
            young_external_strings: Mutex::new(Vec::new()),
            external_resources: ExternalResources::new(),
            allocation_sites_head: AtomicU64::new(TaggedValue::from_smi(0).bits()),
            ephemeron_remembered: Mutex::new(HashMap::new()),
            oom_countdown: EnumMap::from_fn(|_| AtomicIsize::new(-1)),
            stack_state: Atomic::new(StackState::MayContainHeapPointers),
            incremental_marker: IncrementalMarker::new(),
            shared_string_table: false,
            #[cfg(feature = "sandbox")]
            external_pointer_table: external_pointer_table::ExternalPointerTable::new(),
        };
        heap.bootstrap();
        heap
    }

    // Accessors.

    pub fn page(&self, id: PageId) -> &Page {
        self.page_table.get(id)
    }

    pub fn space(&self, id: SpaceId) -> &Space {
        &self.spaces[id]
    }

    pub fn well_known(&self) -> &WellKnown {
        self.well_known.as_ref().expect("heap not bootstrapped")
    }

    pub fn all_page_ids(&self) -> Vec<PageId> {
        self.page_table.live_ids()
    }

    /// Packed `(page << 32) | top` position of the nursery's allocation top.
    pub fn new_space_top_packed(&self) -> u64 {
        match self.space(SpaceId::New).allocation_page() {
            Some(page_id) => ((page_id as u64) << 32) | self.page(page_id).top() as u64,
            None => 0,
        }
    }

    pub fn stack_state(&self) -> StackState {
        self.stack_state.load(Ordering::Relaxed)
    }

    pub fn set_stack_state(&self, state: StackState) {
        self.stack_state.store(state, Ordering::Relaxed);
    }

    // Object access.

    pub fn read_word(&self, obj: ObjectRef, index: u32) -> u64 {
        self.page(obj.page()).read_word(obj.word_index() + index)
    }

    pub fn write_word(&self, obj: ObjectRef, index: u32, value: u64) {
        self.page(obj.page()).write_word(obj.word_index() + index, value)
    }

    pub fn read_slot(&self, obj: ObjectRef, index: u32) -> TaggedValue {
        TaggedValue::from_bits(self.read_word(obj, index))
    }

    /// Store without remembered-set bookkeeping.
    pub fn write_slot_untracked(&self, obj: ObjectRef, index: u32, value: TaggedValue) {
        self.write_word(obj, index, value.bits());
    }

    /// Recording store: keeps the generational and shared remembered sets
    /// consistent when the mutator writes a reference.
    pub fn write_slot(&self, obj: ObjectRef, index: u32, value: TaggedValue) {
        self.write_slot_untracked(obj, index, value);
        if let Some(target) = value.to_object() {
            let host_page = self.page(obj.page());
            let target_space = self.page(target.page()).space();
            if target_space.is_young() && !host_page.space().is_young() {
                host_page
                    .slot_set(RememberedSetClass::OldToNew)
                    .insert(obj.word_index() + index);
            } else if target_space.is_shared() && !host_page.space().is_shared() {
                host_page
                    .slot_set(RememberedSetClass::OldToShared)
                    .insert(obj.word_index() + index);
            }
        }
    }

    pub fn map_word(&self, obj: ObjectRef) -> MapWord {
        MapWord::decode(self.read_word(obj, 0))
    }

    pub fn map_word_bits(&self, obj: ObjectRef) -> u64 {
        self.read_word(obj, 0)
    }

    pub fn set_map(&self, obj: ObjectRef, map: ObjectRef) {
        self.write_word(obj, 0, MapWord::encode_map(map));
    }

    pub fn set_forwarding(&self, obj: ObjectRef, target: ObjectRef) {
        self.write_word(obj, 0, MapWord::encode_forwarding(target));
    }

    pub fn map_of(&self, obj: ObjectRef) -> ObjectRef {
        match self.map_word(obj) {
            MapWord::Map(map) => map,
            MapWord::Forwarded(to) => panic!("map of forwarded object {} -> {}", obj, to),
        }
    }

    pub fn instance_kind(&self, obj: ObjectRef) -> InstanceKind {
        map::map_kind(self, self.map_of(obj))
    }

    pub fn object_size_words(&self, obj: ObjectRef) -> u32 {
        map::object_size(self, obj)
    }

    pub fn space_of(&self, obj: ObjectRef) -> SpaceId {
        self.page(obj.page()).space()
    }

    pub fn in_young(&self, obj: ObjectRef) -> bool {
        self.space_of(obj).is_young()
    }

    pub fn in_shared(&self, obj: ObjectRef) -> bool {
        self.space_of(obj).is_shared()
    }

    /// Follow a forwarding address if one is installed.
    pub fn forwarded(&self, obj: ObjectRef) -> Option<ObjectRef> {
        match self.map_word(obj) {
            MapWord::Forwarded(to) => Some(to),
            MapWord::Map(_) => None,
        }
    }

    // Slot recording (GC-time classification).

    /// Record `host`'s `index`-th slot pointing at `target` into the
    /// appropriate remembered set, unless the host page skips recording.
    pub fn record_slot(&self, host: ObjectRef, index: u32, target: ObjectRef) {
        let host_page = self.page(host.page());
        if host_page.should_skip_slot_recording() {
            return;
        }
        let slot_word = host.word_index() + index;
        let target_page = self.page(target.page());
        let host_space = host_page.space();
        if target_page.space().is_young() && !host_space.is_young() {
            host_page.slot_set(RememberedSetClass::OldToNew).insert(slot_word);
        } else if target_page.is_evacuation_candidate() {
            if target_page.space().is_executable() {
                host_page.slot_set(RememberedSetClass::OldToCode).insert(slot_word);
            } else {
                host_page.slot_set(RememberedSetClass::OldToOld).insert(slot_word);
            }
        } else if target_page.space().is_shared() && !host_space.is_shared() {
            host_page
                .slot_set(RememberedSetClass::OldToShared)
                .insert(slot_word);
        }
    }

    /// Record a typed (code-relocation) slot of `code` pointing at `target`.
    pub fn record_typed_slot(
        &self,
        code: ObjectRef,
        kind: crate::object::map::TypedSlotKind,
        body_offset: u32,
        target: ObjectRef,
    ) {
        let host_page = self.page(code.page());
        if host_page.should_skip_slot_recording() {
            return;
        }
        let target_page = self.page(target.page());
        let page_offset = code.word_index() + self.code_body_start(code) + body_offset;
        if target_page.space().is_young() {
            host_page
                .typed_slot_set(RememberedSetClass::OldToNew)
                .insert(kind, page_offset);
        } else if target_page.is_evacuation_candidate() {
            host_page
                .typed_slot_set(RememberedSetClass::OldToOld)
                .insert(kind, page_offset);
        }
    }

    // Allocation.

    pub fn set_oom_countdown(&self, space: SpaceId, remaining_allocations: isize) {
        self.oom_countdown[space].store(remaining_allocations, Ordering::Relaxed);
    }

    fn check_oom_countdown(&self, space: SpaceId) -> Result<(), AllocError> {
        let countdown = &self.oom_countdown[space];
        loop {
            let value = countdown.load(Ordering::Relaxed);
            if value < 0 {
                return Ok(());
            }
            if value == 0 {
                return Err(AllocError);
            }
            if countdown
                .compare_exchange(value, value - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn new_page(&self, space_id: SpaceId, area_words: usize) -> PageId {
        let page = Box::new(Page::new(space_id, area_words));
        if space_id.is_young() {
            page.set_flag(flags::TO_PAGE);
        }
        let id = self.page_table.insert(page);
        self.space(space_id).adopt_page(id);
        trace!("allocated page {} in {:?}", id, space_id);
        id
    }

    pub fn allocate_next_page(&self, space_id: SpaceId) -> PageId {
        let id = self.new_page(space_id, WORDS_IN_PAGE);
        self.space(space_id).set_allocation_page(id);
        id
    }

    pub fn release_page(&self, id: PageId) {
        let space = self.page(id).space();
        self.space(space).remove_page(id);
        self.page_table.release(id);
        trace!("released page {} from {:?}", id, space);
    }

    fn allocate_large(&self, young: bool, size_words: u32) -> Result<ObjectRef, AllocError> {
        let space = if young { SpaceId::NewLarge } else { SpaceId::Large };
        self.check_oom_countdown(space)?;
        let id = self.new_page(space, size_words as usize);
        let page = self.page(id);
        page.set_top(size_words);
        page.add_allocated_bytes(size_words as usize * WORD_BYTES);
        Ok(ObjectRef::new(id, 0))
    }

    /// Allocate `size_words` in `space_id`. The header word is not yet
    /// initialized; callers install a map before the object becomes visible.
    pub fn allocate_raw(
        &self,
        space_id: SpaceId,
        size_words: u32,
        _origin: AllocationOrigin,
    ) -> Result<ObjectRef, AllocError> {
        debug_assert!(size_words as usize >= MIN_OBJECT_SIZE_WORDS);
        if size_words as usize > MAX_REGULAR_OBJECT_WORDS {
            return self.allocate_large(space_id.is_young(), size_words);
        }
        self.check_oom_countdown(space_id)?;

        // Bump the linear allocation area.
        if let Some(page_id) = self.space(space_id).allocation_page() {
            let page = self.page(page_id);
            if !page.has_flag(flags::NEVER_ALLOCATE_ON_PAGE) {
                if let Some(top) = page.try_bump(size_words) {
                    page.add_allocated_bytes(size_words as usize * WORD_BYTES);
                    return Ok(ObjectRef::new(page_id, top - size_words));
                }
            }
        }

        // Search the free lists rebuilt by the sweeper.
        if !space_id.is_young() {
            for page_id in self.space(space_id).page_ids() {
                let page = self.page(page_id);
                if page.has_flag(flags::NEVER_ALLOCATE_ON_PAGE) || page.is_evacuation_candidate() {
                    continue;
                }
                if let Some(region) = page.take_free_region(size_words) {
                    let remainder = region.words - size_words;
                    if remainder > 0 {
                        let remainder_start = region.start + size_words;
                        self.create_filler(page_id, remainder_start, remainder);
                        if remainder as usize >= MIN_OBJECT_SIZE_WORDS {
                            page.add_free_region(FreeRegion {
                                start: remainder_start,
                                words: remainder,
                            });
                        }
                    }
                    page.add_allocated_bytes(size_words as usize * WORD_BYTES);
                    return Ok(ObjectRef::new(page_id, region.start));
                }
            }
        }

        // Grow the space.
        let page_id = self.allocate_next_page(space_id);
        let page = self.page(page_id);
        let top = page
            .try_bump(size_words)
            .expect("fresh page cannot be full");
        page.add_allocated_bytes(size_words as usize * WORD_BYTES);
        Ok(ObjectRef::new(page_id, top - size_words))
    }

    // Fillers.

    /// Write a filler covering `[start, start + size_words)` on `page_id`.
    pub fn create_filler(&self, page_id: PageId, start: u32, size_words: u32) {
        debug_assert!(size_words > 0);
        let page = self.page(page_id);
        let _write_scope = page::CodePageWriteScope::new(page);
        let well_known = self.well_known();
        if size_words == 1 {
            page.write_word(start, MapWord::encode_map(well_known.map_for(InstanceKind::OneWordFiller)));
        } else {
            page.write_word(start, MapWord::encode_map(well_known.map_for(InstanceKind::FreeSpace)));
            page.write_word(
                start + free_space_layout::SIZE,
                TaggedValue::from_smi(size_words as i64).bits(),
            );
        }
    }

    /// Walk the objects of a page in address order. The callback receives the
    /// object, its map and its size in words; fillers are included.
    pub fn iterate_page_objects(&self, page_id: PageId, mut f: impl FnMut(ObjectRef, ObjectRef, u32)) {
        let page = self.page(page_id);
        let top = page.top();
        let mut word = 0;
        while word < top {
            let obj = ObjectRef::new(page_id, word);
            let map = match self.map_word(obj) {
                MapWord::Map(map) => map,
                MapWord::Forwarded(_) => {
                    panic!("forwarded object during page iteration: {}", obj)
                }
            };
            let size = map::object_size_with_map(self, obj, map);
            f(obj, map, size);
            word += size;
        }
        debug_assert_eq!(word, top, "page {} is not iterable", page_id);
    }

    // Marking helpers shared by both collectors.

    pub fn is_black(&self, obj: ObjectRef) -> bool {
        self.page(obj.page()).bitmap.is_black(obj.word_index())
    }

    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.page(obj.page()).bitmap.is_marked(obj.word_index())
    }

    // Allocation-site weak list.

    pub fn allocation_sites_head(&self) -> TaggedValue {
        TaggedValue::from_bits(self.allocation_sites_head.load(Ordering::Relaxed))
    }

    pub fn set_allocation_sites_head(&self, head: TaggedValue) {
        self.allocation_sites_head.store(head.bits(), Ordering::Relaxed);
    }

    // String interning.

    pub fn string_table_bucket_of(&self, bytes: &[u8]) -> usize {
        (string_hash(bytes) % STRING_TABLE_BUCKETS as u64) as usize
    }

    /// Look up or create the internalized copy of `s`.
    pub fn intern(&self, s: &str) -> ObjectRef {
        let bucket_index = self.string_table_bucket_of(s.as_bytes());
        {
            let bucket = self.string_table.bucket(bucket_index).lock().unwrap();
            for entry in bucket.iter() {
                if self.string_bytes(*entry) == s.as_bytes() {
                    return *entry;
                }
            }
        }
        let interned = self.new_string_of_kind(InstanceKind::InternalizedString, s, SpaceId::Old);
        self.string_table
            .bucket(bucket_index)
            .lock()
            .unwrap()
            .push(interned);
        interned
    }

    /// Bytes of a sequential or internalized string.
    pub fn string_bytes(&self, string: ObjectRef) -> Vec<u8> {
        use crate::object::map::string_layout;
        debug_assert!(self.instance_kind(string).is_internalizable_string());
        let len = self.read_slot(string, string_layout::LENGTH).as_smi() as usize;
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            let word = self.read_word(string, string_layout::DATA_START + (i / WORD_BYTES) as u32);
            bytes.push((word >> ((i % WORD_BYTES) * 8)) as u8);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::options::Options;

    fn test_heap() -> Heap {
        Heap::new(Arc::new(Options::default()))
    }

    #[test]
    fn bump_allocation_is_contiguous_within_a_page() {
        let heap = test_heap();
        let page = heap.allocate_next_page(SpaceId::Old);
        let a = heap.new_fixed_array(2, SpaceId::Old);
        let b = heap.new_fixed_array(2, SpaceId::Old);
        assert_eq!(a.page(), page);
        assert_eq!(b.page(), page);
        assert_eq!(b.word_index(), a.word_index() + 4);
        assert_eq!(heap.page(page).allocated_bytes(), 8 * WORD_BYTES);
    }

    #[test]
    fn oversized_allocations_go_to_the_large_spaces() {
        let heap = test_heap();
        let old_big = heap.new_fixed_array(3000, SpaceId::Old);
        assert_eq!(heap.space_of(old_big), SpaceId::Large);
        let young_big = heap.new_fixed_array(3000, SpaceId::New);
        assert_eq!(heap.space_of(young_big), SpaceId::NewLarge);
        assert!(heap.in_young(young_big));
    }

    #[test]
    fn free_list_allocation_splits_regions_and_installs_fillers() {
        let heap = test_heap();
        let page_id = heap.allocate_next_page(SpaceId::Old);
        let page = heap.page(page_id);
        // Hand-build a swept region and park the bump cursor past it.
        page.set_top(100);
        heap.create_filler(page_id, 20, 50);
        page.add_free_region(page::FreeRegion { start: 20, words: 50 });
        // Park the linear allocation area on a page that refuses allocation,
        // forcing the free-list path.
        let parked = heap.allocate_next_page(SpaceId::Old);
        heap.page(parked).set_flag(page::flags::NEVER_ALLOCATE_ON_PAGE);

        let obj = heap
            .allocate_raw(SpaceId::Old, 10, AllocationOrigin::Mutator)
            .unwrap();
        assert_eq!(obj, ObjectRef::new(page_id, 20));
        // Remainder is a filler and a fresh free region.
        let remainder = ObjectRef::new(page_id, 30);
        assert_eq!(
            map::map_kind(&heap, heap.map_of(remainder)),
            InstanceKind::FreeSpace
        );
        assert_eq!(page.take_free_region(40).unwrap(), page::FreeRegion { start: 30, words: 40 });
    }

    #[test]
    fn oom_countdown_fails_allocation_deterministically() {
        let heap = test_heap();
        heap.allocate_next_page(SpaceId::Old);
        heap.set_oom_countdown(SpaceId::Old, 2);
        assert!(heap.allocate_raw(SpaceId::Old, 4, AllocationOrigin::Gc).is_ok());
        assert!(heap.allocate_raw(SpaceId::Old, 4, AllocationOrigin::Gc).is_ok());
        assert_eq!(
            heap.allocate_raw(SpaceId::Old, 4, AllocationOrigin::Gc),
            Err(AllocError)
        );
        heap.set_oom_countdown(SpaceId::Old, -1);
        assert!(heap.allocate_raw(SpaceId::Old, 4, AllocationOrigin::Gc).is_ok());
    }

    #[test]
    fn recording_store_classifies_generational_and_shared_targets() {
        let heap = test_heap();
        let old = heap.new_fixed_array(3, SpaceId::Old);
        let young = heap.new_fixed_array(1, SpaceId::New);
        let shared = heap.new_fixed_array(1, SpaceId::SharedOld);

        heap.array_set(old, 0, TaggedValue::from_strong(young));
        heap.array_set(old, 1, TaggedValue::from_strong(shared));
        heap.array_set(old, 2, TaggedValue::from_smi(3));

        let page = heap.page(old.page());
        let base = old.word_index() + crate::object::map::array_layout::ELEMENTS_START;
        assert!(page.slot_set(RememberedSetClass::OldToNew).contains(base));
        assert!(page.slot_set(RememberedSetClass::OldToShared).contains(base + 1));
        assert!(!page.slot_set(RememberedSetClass::OldToNew).contains(base + 2));
    }

    #[test]
    fn interning_deduplicates_by_content() {
        let heap = test_heap();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.string_bytes(a), b"hello");
        assert_eq!(heap.string_table.len(), 2);
    }

    #[test]
    fn released_page_ids_are_reused() {
        let heap = test_heap();
        let page = heap.allocate_next_page(SpaceId::Old);
        heap.release_page(page);
        assert!(!heap.all_page_ids().contains(&page));
        let again = heap.allocate_next_page(SpaceId::Old);
        assert_eq!(again, page);
    }

    #[test]
    fn page_iteration_walks_objects_and_fillers_in_order() {
        let heap = test_heap();
        let page = heap.allocate_next_page(SpaceId::Old);
        let a = heap.new_fixed_array(1, SpaceId::Old);
        let b = heap.new_byte_array(5, SpaceId::Old);
        let mut seen = Vec::new();
        heap.iterate_page_objects(page, |obj, _map, size| seen.push((obj, size)));
        assert_eq!(seen, vec![(a, 3), (b, 7)]);
    }
}
