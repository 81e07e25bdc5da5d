//! Space identities and per-space page bookkeeping.

use crate::object::PageId;
use enum_map::Enum;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use strum_macros::EnumIter;

/// The spaces of the managed heap.
#[derive(Enum, EnumIter, Copy, Clone, PartialEq, Eq, Debug, bytemuck::NoUninit)]
#[repr(u8)]
pub enum SpaceId {
    /// The nursery: a semispace with from/to page lists and an age mark.
    New,
    Old,
    /// Maps (object shapes).
    Map,
    /// Executable code.
    Code,
    /// Oversized single-object pages.
    Large,
    /// Oversized objects allocated young; promoted to `Large` eagerly by the
    /// young collector.
    NewLarge,
    /// The process-wide shared old space (shared-GC mode).
    SharedOld,
}

impl SpaceId {
    pub fn is_young(self) -> bool {
        matches!(self, SpaceId::New | SpaceId::NewLarge)
    }

    pub fn is_executable(self) -> bool {
        self == SpaceId::Code
    }

    pub fn is_shared(self) -> bool {
        self == SpaceId::SharedOld
    }

    /// Spaces whose pages may become evacuation candidates.
    pub fn supports_compaction(self) -> bool {
        matches!(self, SpaceId::Old | SpaceId::Map | SpaceId::Code)
    }
}

/// Whether a mutator stack that may refer into the heap is present at the
/// current collection.
#[derive(Copy, Clone, PartialEq, Eq, Debug, bytemuck::NoUninit)]
#[repr(u8)]
pub enum StackState {
    NoHeapPointers,
    MayContainHeapPointers,
}

/// Per-space page bookkeeping. Page storage itself lives in the heap's page
/// table; a space tracks ownership and the linear allocation area.
pub struct Space {
    pub id: SpaceId,
    pages: Mutex<Vec<PageId>>,
    /// The page currently backing the linear allocation area (0 = none).
    allocation_page: AtomicU32,
    /// New space only: packed `(page << 32) | word` position of the
    /// allocation top at the end of the last young collection.
    age_mark: AtomicU64,
    /// Bytes of external backing store accounted to this space.
    external_bytes: AtomicUsize,
}

impl Space {
    pub fn new(id: SpaceId) -> Space {
        Space {
            id,
            pages: Mutex::new(Vec::new()),
            allocation_page: AtomicU32::new(0),
            age_mark: AtomicU64::new(0),
            external_bytes: AtomicUsize::new(0),
        }
    }

    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages.lock().unwrap().clone()
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn adopt_page(&self, page: PageId) {
        self.pages.lock().unwrap().push(page);
    }

    pub fn remove_page(&self, page: PageId) {
        let mut pages = self.pages.lock().unwrap();
        if let Some(pos) = pages.iter().position(|p| *p == page) {
            pages.swap_remove(pos);
        }
        if self.allocation_page.load(Ordering::Relaxed) == page {
            self.allocation_page.store(0, Ordering::Relaxed);
        }
    }

    pub fn allocation_page(&self) -> Option<PageId> {
        match self.allocation_page.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_allocation_page(&self, page: PageId) {
        self.allocation_page.store(page, Ordering::Relaxed);
    }

    // The semispace flip of the nursery is expressed through the page
    // promotion flags: a page either leaves the space, is promoted whole, or
    // stays with its age flag set.

    pub fn age_mark(&self) -> u64 {
        self.age_mark.load(Ordering::Relaxed)
    }

    pub fn set_age_mark(&self, packed: u64) {
        self.age_mark.store(packed, Ordering::Relaxed);
    }

    pub fn external_bytes(&self) -> usize {
        self.external_bytes.load(Ordering::Relaxed)
    }

    pub fn add_external_bytes(&self, bytes: usize) {
        self.external_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sub_external_bytes(&self, bytes: usize) {
        self.external_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}
