//! Crate-wide constants.

/// Bytes per tagged word.
pub const WORD_BYTES: usize = 8;

/// log2 of the number of tagged words in a regular page.
pub const LOG_WORDS_IN_PAGE: usize = 12;

/// Number of tagged words in a regular page (32 KiB of payload).
pub const WORDS_IN_PAGE: usize = 1 << LOG_WORDS_IN_PAGE;

/// Bytes of payload in a regular page.
pub const PAGE_BYTES: usize = WORDS_IN_PAGE * WORD_BYTES;

/// The smallest allocatable object, in tagged words (header plus one word).
///
/// The mark bitmap stores one bit per word and an object's color is the bit
/// pair at its first two word positions, so a smaller object would let a
/// Black pattern collide with the leading bit of its successor.
pub const MIN_OBJECT_SIZE_WORDS: usize = 2;

/// Objects larger than this many words go to the large object space.
pub const MAX_REGULAR_OBJECT_WORDS: usize = WORDS_IN_PAGE / 2;

/// Number of pages each parallel evacuation task aims to process
/// (approximately 1 MiB worth of pages).
pub const EVACUATION_PAGES_PER_TASK: usize = (1 << 20) / PAGE_BYTES;

/// Hard cap on parallel pointer-update tasks.
pub const MAX_POINTER_UPDATE_TASKS: usize = 8;

/// Hard cap on parallel young-generation marking tasks.
pub const MAX_YOUNG_MARKING_TASKS: usize = 8;

/// Minimum page fragmentation (free percent) for a page to become an
/// evacuation candidate.
pub const MIN_CANDIDATE_FRAGMENTATION_PCT: usize = 20;

/// Byte quota of evacuated live data in memory-reducing mode.
pub const MAX_EVACUATED_BYTES_MEMORY_REDUCING: usize = 6 << 20;

/// Byte quota of evacuated live data in the default (adaptive) mode.
pub const MAX_EVACUATED_BYTES: usize = 4 << 20;

/// Target wall-clock cost of evacuating a single page, in microseconds, used
/// by the adaptive candidate-selection mode.
pub const TARGET_PAGE_EVACUATION_MICROS: usize = 500;

/// Size of the bounded newly-discovered buffer used by the linear ephemeron
/// algorithm before it degrades to visiting all pending ephemerons.
pub const EPHEMERON_NEWLY_DISCOVERED_LIMIT: usize = 64;

/// Worklist segment size (entries buffered thread-locally before publishing).
pub const WORKLIST_SEGMENT_SIZE: usize = 64;
