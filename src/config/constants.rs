//! # Pool Configuration Constants
//!
//! This module centralizes the tuning constants of the BAT pool, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located so a change to one is checked against the others at compile
//! time.
//!
//! ## Dependency Graph
//!
//! ```text
//! SLAB_BITS (12)
//!       │
//!       ├─> SLAB_SIZE (1 << SLAB_BITS, slots per slab)
//!       │
//!       └─> N_SLABS * SLAB_SIZE = maximum BAT id + 1
//!             Must stay below 8^PHYSICAL_OCTAL_DIGITS so every id fits in
//!             the octal on-disk path scheme (two digits per directory
//!             level, 64 BATs per directory node).
//!
//! SWAP_SHARD_COUNT (512)
//!       │
//!       └─> swap locks are selected with `id & BAT_MASK`
//!
//! FREE_SHARD_COUNT (1)
//!       │
//!       └─> per-shard free lists; kept as an array so a larger shard
//!           count can be configured without restructuring
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `SLAB_SIZE` is a power of two (`id >> SLAB_BITS` / `id & SLAB_MASK`
//!    must agree with it)
//! 2. `N_SLABS * SLAB_SIZE < 8^PHYSICAL_OCTAL_DIGITS` (id fits the octal
//!    path scheme)
//! 3. `BAT_MASK == SWAP_SHARD_COUNT - 1`

// ============================================================================
// SLOT ARENA
// ============================================================================

/// log2 of the number of slots per slab.
pub const SLAB_BITS: u32 = 12;

/// Number of descriptor slots in one slab allocation.
pub const SLAB_SIZE: usize = 1 << SLAB_BITS;

/// Mask selecting the slot index within a slab.
pub const SLAB_MASK: u32 = (SLAB_SIZE - 1) as u32;

/// Number of entries in the fixed top-level slab table. Slabs are allocated
/// on demand and never moved, so descriptor pointers stay valid while the
/// pool grows.
pub const N_SLABS: usize = 4096;

/// One above the largest representable BAT id.
pub const MAX_BAT_ID: u64 = (N_SLABS as u64) * (SLAB_SIZE as u64);

/// Number of octal digits available for the physical file stem.
pub const PHYSICAL_OCTAL_DIGITS: u32 = 8;

const _: () = assert!(SLAB_SIZE.is_power_of_two(), "SLAB_SIZE must be a power of two");

const _: () = assert!(
    MAX_BAT_ID <= 1u64 << (3 * PHYSICAL_OCTAL_DIGITS),
    "maximum BAT id does not fit the octal physical path scheme"
);

// ============================================================================
// LOCK SHARDING
// ============================================================================

/// Number of swap locks; status and reference counter updates for slot `i`
/// are guarded by swap lock `i & BAT_MASK`.
pub const SWAP_SHARD_COUNT: usize = 512;

/// Mask selecting the swap lock for a BAT id.
pub const BAT_MASK: u32 = (SWAP_SHARD_COUNT - 1) as u32;

/// Number of free-list shards. A single list by default; the stealing logic
/// in the slot arena supports any power of two.
pub const FREE_SHARD_COUNT: usize = 1;

/// A foreign free list must be longer than this before an empty shard
/// steals from it instead of growing the arena.
pub const FREE_STEAL_THRESHOLD: usize = 20;

const _: () = assert!(SWAP_SHARD_COUNT.is_power_of_two());
const _: () = assert!(FREE_SHARD_COUNT.is_power_of_two());

// ============================================================================
// SPIN / TRIM CADENCE
// ============================================================================

/// Sleep between retests of a status bit another thread is about to clear.
pub const SPIN_NAP_MS: u64 = 1;

/// Trimmer sleep quantum; the trimmer sleeps between 1 and
/// [`TRIM_MAX_STEPS`] quanta depending on VM pressure.
pub const TRIM_STEP_MS: u64 = 100;

/// Maximum number of sleep quanta between trim passes (10 s total).
pub const TRIM_MAX_STEPS: usize = 100;

// ============================================================================
// DIRECTORY FILE VERSIONS
// ============================================================================

/// Version written into new `BBP.dir` headers (octal 061044).
pub const GDK_VERSION: u32 = 0o61044;

/// Last version whose string offset heaps were named `.tail` regardless of
/// width (octal 061043). Reading this version plants the tail-rename
/// signal file.
pub const GDK_VERSION_TAILN: u32 = 0o61043;

/// Last version without per-BAT min/max positions; its heap lines carry 12
/// fields instead of 14 (octal 061042).
pub const GDK_VERSION_MINMAX_POS: u32 = 0o61042;

/// Sizes recorded in the second header line and validated on load.
pub const SIZEOF_PTR: u32 = 8;
pub const SIZEOF_OID: u32 = 8;
pub const SIZEOF_MAX_INT: u32 = 8;

// ============================================================================
// ON-DISK LAYOUT
// ============================================================================

/// Data directory under each farm root.
pub const BATDIR: &str = "bat";
/// Commit staging directory.
pub const BAKDIR: &str = "bat/BACKUP";
/// Nested staging directory for subcommits.
pub const SUBDIR: &str = "bat/BACKUP/SUBCOMMIT";
/// Rename target of a published commit; removed best-effort afterwards.
pub const DELDIR: &str = "bat/DELETE_ME";
/// Scratch directory, wiped on startup.
pub const TEMPDIR: &str = "bat/TEMP";
/// Quarantine for unrecognisable files found during recovery.
pub const LEFTDIR: &str = "bat/LEFT";

/// Signal file requesting the post-commit string-tail rename pass.
pub const TAILMOVE_SIGNAL: &str = "needstrbatmove";

/// Maximum number of registered farms.
pub const MAX_FARMS: usize = 32;

// ============================================================================
// DESCRIPTOR LIMITS
// ============================================================================

/// Smallest BAT capacity; counts are rounded up to at least this.
pub const BAT_TINY: u64 = 128;

/// Nil / out-of-range marker for object ids.
pub const OID_NIL: u64 = 1 << 63;

/// Largest valid object id.
pub const OID_MAX: u64 = OID_NIL - 1;

/// Maximum length of a logical BAT name, including the octal directory
/// prefix of the physical stem.
pub const ID_LENGTH: usize = 128;

/// Lower bound applied to the recorded size of a string variable heap.
pub const STR_VHEAP_MIN: usize = 8192 + (BAT_TINY as usize) * 8;
