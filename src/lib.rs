//! # batpool - BAT Buffer Pool
//!
//! `batpool` is the directory and residency manager that backs a
//! column-store engine: every column ("BAT", Binary Association Table) is
//! registered here, addressed by a dense integer id, lazily loaded from
//! disk, evicted under memory pressure, and committed to disk through a
//! crash-safe staging protocol.
//!
//! ## Quick Start
//!
//! ```ignore
//! use batpool::{BatPool, FarmRole, NewBat, PoolOptions};
//!
//! let mut opts = PoolOptions::new();
//! opts.add_farm("./mydb", FarmRole::Persistent.bit() | FarmRole::Transient.bit())?;
//! let pool = BatPool::init(opts)?;
//!
//! let id = pool.insert(NewBat::persistent(4))?;   // an "int" column
//! pool.rename(id, "orders_qty")?;
//! pool.retain(id);                       // make it survive commits
//! pool.set_persistent(id, true);
//! pool.sync(None, None, 1, 1)?;          // commit everything
//! pool.exit();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Engine layers (callers)      │
//! ├─────────────────────────────────────┤
//! │   BatPool: directory + refcounts    │
//! ├──────────────┬──────────────────────┤
//! │  descriptors │  BBP.dir manifest    │
//! ├──────────────┴──────────────────────┤
//! │  heaps (mmap / owned buffers)       │
//! ├─────────────────────────────────────┤
//! │  farms: storage roots on disk       │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! ```text
//! farm_dir/
//! └── bat/
//!     ├── BBP.dir           # text manifest of all persistent BATs
//!     ├── BBP.bak           # previous manifest (fallback)
//!     ├── 11.tail           # payload of BAT 011 (octal naming)
//!     ├── 07/745.tail1      # 64 BATs per directory level
//!     ├── BACKUP/           # commit staging area
//!     │   └── SUBCOMMIT/    # nested staging for partial commits
//!     ├── DELETE_ME/        # published commit awaiting removal
//!     ├── TEMP/             # scratch, wiped on startup
//!     └── LEFT/             # unrecognised files quarantined by recovery
//! ```
//!
//! ## Module Overview
//!
//! - [`pool`]: the pool itself: slots, names, references, load/unload,
//!   commit, recovery, trimming
//! - [`bat`]: BAT descriptors (metadata records)
//! - [`heap`]: file-backed payloads
//! - [`atom`]: element type registry
//! - [`farm`]: storage roots and path resolution
//! - [`memory`]: VM residency budget steering eviction

pub mod atom;
pub mod bat;
pub mod config;
pub mod farm;
pub mod heap;
pub mod memory;
pub mod pool;

pub use atom::{AtomDef, AtomRegistry};
pub use bat::{Access, BatDesc, BatId, BatInner};
pub use farm::{FarmRole, Farms};
pub use heap::{Heap, StorageMode};
pub use memory::VmBudget;
pub use pool::{BatPool, NewBat, PoolOptions, RenameError};
