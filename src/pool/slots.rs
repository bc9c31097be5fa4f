//! # Slot Arena
//!
//! One slot per BAT id, stored in a two-level table: a fixed top array of
//! slab pointers, each slab holding [`SLAB_SIZE`](crate::config::SLAB_SIZE)
//! contiguous slots allocated on demand. Slabs are never moved or freed
//! before pool teardown, so a `&Slot` stays valid while other threads grow
//! the arena. Extension is serialised by the name-index lock.
//!
//! Free ids are kept on per-shard intrusive lists chained through the
//! slots' `next` field (the same field doubles as the name-hash chain for
//! occupied slots). An empty shard first tries to steal from a long foreign
//! list before growing the arena.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use eyre::{bail, Result};
use parking_lot::{Mutex, MutexGuard};

use crate::bat::{BatDesc, BatId};
use crate::config::{
    FREE_SHARD_COUNT, FREE_STEAL_THRESHOLD, N_SLABS, SLAB_BITS, SLAB_MASK, SLAB_SIZE,
};

// ============================================================================
// STATUS BITS
// ============================================================================

/// Payload is resident.
pub const BBPLOADED: u32 = 1;
/// Dirty but not resident; the descriptor still carries uncommitted state.
pub const BBPSWAPPED: u32 = 1 << 1;
/// Transient BAT with files on disk.
pub const BBPTMP: u32 = 1 << 2;
/// Deleted in the running transaction.
pub const BBPDELETED: u32 = 1 << 4;
/// A committed image exists on disk.
pub const BBPEXISTING: u32 = 1 << 5;
/// Created in the running transaction.
pub const BBPNEW: u32 = 1 << 8;
/// Survives commits; appears in the directory file.
pub const BBPPERSISTENT: u32 = 1 << 11;
/// Slot is being created or torn down.
pub const BBPDELETING: u32 = 1 << 13;
/// Payload is on its way out of memory.
pub const BBPUNLOADING: u32 = 1 << 14;
/// Payload is on its way into memory.
pub const BBPLOADING: u32 = 1 << 15;
/// Payload is being written to disk.
pub const BBPSAVING: u32 = 1 << 16;
/// Renamed since the last commit.
pub const BBPRENAMED: u32 = 1 << 17;
/// Part of the commit currently in progress.
pub const BBPSYNCING: u32 = 1 << 18;
/// Recently used; spared by the non-aggressive trimmer.
pub const BBPHOT: u32 = 1 << 19;

/// A state transition is in flight; readers spin until clear.
pub const BBPWAITING: u32 = BBPUNLOADING | BBPLOADING | BBPSAVING;
/// The slot may disappear; fixers spin until clear.
pub const BBPUNSTABLE: u32 = BBPUNLOADING | BBPDELETING;

// ============================================================================
// SLOT
// ============================================================================

/// Logical name of a slot. `Default` stands for the derived `tmp_<octal>`
/// name, which is never stored in the name hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalName {
    /// Slot is empty (on a free list).
    Vacant,
    /// The default `tmp_<octal id>` name.
    Default,
    Named(Box<str>),
}

#[derive(Debug)]
pub struct NameCell {
    pub logical: LogicalName,
    /// Opaque per-BAT options string, persisted verbatim.
    pub options: Option<String>,
}

/// One directory entry. Counters and status are mutated only while holding
/// the slot's swap lock; the atomics make unguarded reads well-defined.
pub struct Slot {
    pub status: AtomicU32,
    /// Memory (pointer) references.
    pub refs: AtomicI32,
    /// Logical references.
    pub lrefs: AtomicI32,
    /// Views currently borrowing this BAT's heaps.
    pub share: AtomicI32,
    /// Free-list link for vacant slots, name-hash chain for occupied ones.
    pub next: AtomicU32,
    /// Creator thread, for debug attribution. `u64::MAX` when vacant.
    pub pid: AtomicU64,
    pub desc: Mutex<Option<Arc<BatDesc>>>,
    pub name: Mutex<NameCell>,
    /// On-disk file stem, derived once from the id and kept forever.
    pub physical: OnceLock<String>,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            status: AtomicU32::new(0),
            refs: AtomicI32::new(0),
            lrefs: AtomicI32::new(0),
            share: AtomicI32::new(0),
            next: AtomicU32::new(0),
            pid: AtomicU64::new(u64::MAX),
            desc: Mutex::new(None),
            name: Mutex::new(NameCell {
                logical: LogicalName::Vacant,
                options: None,
            }),
            physical: OnceLock::new(),
        }
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    pub fn status_on(&self, bits: u32) {
        self.status.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn status_off(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn status_set(&self, bits: u32) {
        self.status.store(bits, Ordering::Release);
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn lrefs(&self) -> i32 {
        self.lrefs.load(Ordering::Acquire)
    }

    pub fn share(&self) -> i32 {
        self.share.load(Ordering::Acquire)
    }

    /// The resolved logical name, materialising the default form.
    pub fn logical_string(&self, id: BatId) -> Option<String> {
        match &self.name.lock().logical {
            LogicalName::Vacant => None,
            LogicalName::Default => Some(default_name(id)),
            LogicalName::Named(s) => Some(s.to_string()),
        }
    }
}

// ============================================================================
// NAMING
// ============================================================================

/// The default logical name of a BAT: `tmp_` followed by the octal id.
pub fn default_name(id: BatId) -> String {
    format!("tmp_{id:o}")
}

/// Parses a `tmp_<octal>` name; returns 0 when the name has another shape.
pub fn tmp_name_id(name: &str) -> BatId {
    match name.strip_prefix("tmp_") {
        Some(rest) if !rest.is_empty() => BatId::from_str_radix(rest, 8).unwrap_or(0),
        _ => 0,
    }
}

/// True for names reserved for the default form.
pub fn is_tmp_name(name: &str) -> bool {
    name.starts_with("tmp_")
}

/// Octal directory prefix for an id: two digits per level, 64 BATs per
/// directory node. Empty for ids below 0o100.
pub fn subdir(id: BatId) -> String {
    let mut segments = Vec::new();
    let mut i = id >> 6;
    while i > 0 {
        segments.push(format!("{:02o}", i & 0o77));
        i >>= 6;
    }
    segments.reverse();
    segments.join("/")
}

/// On-disk file stem for an id: the octal subdir prefix plus the full
/// octal id.
pub fn physical_name(id: BatId) -> String {
    let dir = subdir(id);
    if dir.is_empty() {
        format!("{id:o}")
    } else {
        format!("{dir}/{id:o}")
    }
}

// ============================================================================
// ARENA
// ============================================================================

pub struct FreeShard {
    pub head: BatId,
}

pub struct SlotArena {
    slabs: Box<[OnceLock<Box<[Slot]>>]>,
    /// Slots allocated (slab-granular); never shrinks.
    limit: AtomicU32,
    /// One above the highest id handed out.
    size: AtomicU32,
    free: Vec<Mutex<FreeShard>>,
}

impl SlotArena {
    pub fn new() -> Self {
        let slabs: Vec<OnceLock<Box<[Slot]>>> = (0..N_SLABS).map(|_| OnceLock::new()).collect();
        Self {
            slabs: slabs.into_boxed_slice(),
            limit: AtomicU32::new(0),
            size: AtomicU32::new(0),
            free: (0..FREE_SHARD_COUNT)
                .map(|_| Mutex::new(FreeShard { head: 0 }))
                .collect(),
        }
    }

    pub fn size(&self) -> BatId {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: BatId) {
        self.size.store(size, Ordering::Release);
    }

    pub fn limit(&self) -> BatId {
        self.limit.load(Ordering::Acquire)
    }

    /// Slot for an id below `limit`. The returned reference stays valid for
    /// the arena's lifetime.
    pub fn slot(&self, id: BatId) -> &Slot {
        debug_assert!(id < self.limit());
        let slab = self.slabs[(id >> SLAB_BITS) as usize]
            .get()
            .expect("slab allocated below limit");
        &slab[(id & SLAB_MASK) as usize]
    }

    pub fn get(&self, id: BatId) -> Option<&Slot> {
        if id == 0 || id >= self.size() {
            return None;
        }
        Some(self.slot(id))
    }

    /// Grows the arena so `limit >= newsize`. Existing slabs never move.
    /// The caller holds the name-index lock.
    pub fn extend(&self, newsize: BatId) -> Result<()> {
        if newsize as u64 >= (N_SLABS as u64) * (SLAB_SIZE as u64) {
            bail!(
                "trying to extend BAT pool beyond the limit ({})",
                N_SLABS * SLAB_SIZE
            );
        }
        while self.limit() < newsize {
            let idx = (self.limit() >> SLAB_BITS) as usize;
            let slab: Vec<Slot> = (0..SLAB_SIZE).map(|_| Slot::vacant()).collect();
            self.slabs[idx]
                .set(slab.into_boxed_slice())
                .unwrap_or_else(|_| panic!("slab {idx} allocated twice"));
            self.limit.fetch_add(SLAB_SIZE as u32, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn free_shard(&self, idx: usize) -> MutexGuard<'_, FreeShard> {
        self.free[idx].lock()
    }

    /// Raw access for a thread that already owns the shard lock through
    /// the pool's global guard.
    pub fn free_shard_ptr(&self, idx: usize) -> *mut FreeShard {
        self.free[idx].data_ptr()
    }

    pub fn free_shard_count(&self) -> usize {
        self.free.len()
    }

    /// Pushes a cleared slot onto a shard's free list. Caller holds the
    /// shard lock.
    pub fn push_free(&self, shard: &mut FreeShard, id: BatId) {
        self.slot(id).next.store(shard.head, Ordering::Release);
        shard.head = id;
    }

    /// Pops the shard's head. Caller holds the shard lock.
    pub fn pop_free(&self, shard: &mut FreeShard) -> Option<BatId> {
        let id = shard.head;
        if id == 0 {
            return None;
        }
        shard.head = self.slot(id).next.load(Ordering::Acquire);
        self.slot(id).next.store(0, Ordering::Release);
        Some(id)
    }

    /// Walks a free list, counting at most `cap + 1` entries.
    fn free_len(&self, head: BatId, cap: usize) -> usize {
        let mut n = 0;
        let mut i = head;
        while i != 0 && n <= cap {
            n += 1;
            i = self.slot(i).next.load(Ordering::Acquire);
        }
        n
    }

    /// Refills shard `idx` when its list ran dry: steal one id from a
    /// foreign list longer than the threshold, or grow by one fresh id.
    /// Caller holds shard `idx`'s lock and the name-index lock (the latter
    /// serialises extension).
    pub fn replenish(&self, idx: usize, shard: &mut FreeShard) -> Result<()> {
        if shard.head != 0 {
            return Ok(());
        }
        let mut longest = 0usize;
        let mut longest_idx = idx;
        for t in 0..self.free.len() {
            if t == idx {
                continue;
            }
            let other = self.free[t].lock();
            let n = self.free_len(other.head, FREE_STEAL_THRESHOLD);
            if n > longest {
                longest = n;
                longest_idx = t;
            }
        }
        if longest > FREE_STEAL_THRESHOLD {
            let mut other = self.free[longest_idx].lock();
            if let Some(id) = self.pop_free(&mut other) {
                self.push_free(shard, id);
                return Ok(());
            }
        }
        // leave the longest list alone, take a fresh id
        let size = self.size();
        if size >= self.limit() {
            self.extend(size + 1)?;
        }
        let fresh = if size == 0 { 1 } else { size };
        // id 0 is the reserved nil; the first slab donates ids 1.. only
        self.set_size(fresh + 1);
        self.push_free(shard, fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_subdirs() {
        assert_eq!(subdir(0o10), "");
        assert_eq!(subdir(0o77), "");
        assert_eq!(subdir(0o100), "01");
        assert_eq!(subdir(0o745), "07");
        assert_eq!(subdir(0o123456), "12/34");
    }

    #[test]
    fn physical_names() {
        assert_eq!(physical_name(0o10), "10");
        assert_eq!(physical_name(0o745), "07/745");
        assert_eq!(physical_name(0o123456), "12/34/123456");
    }

    #[test]
    fn tmp_names_resolve_to_ids() {
        assert_eq!(tmp_name_id("tmp_745"), 0o745);
        assert_eq!(tmp_name_id(&default_name(83)), 83);
        assert_eq!(tmp_name_id("users"), 0);
        assert_eq!(tmp_name_id("tmp_"), 0);
        assert!(is_tmp_name("tmp_1"));
        assert!(!is_tmp_name("t1"));
    }

    #[test]
    fn arena_grows_without_moving_slots() {
        let arena = SlotArena::new();
        arena.extend(1).unwrap();
        arena.set_size(2);
        let p1 = arena.slot(1) as *const Slot;

        arena.extend((SLAB_SIZE as u32) * 2 + 1).unwrap();
        assert!(arena.limit() >= (SLAB_SIZE as u32) * 2);
        assert_eq!(arena.slot(1) as *const Slot, p1);
    }

    #[test]
    fn free_list_push_pop() {
        let arena = SlotArena::new();
        arena.extend(16).unwrap();
        arena.set_size(16);

        let mut shard = arena.free_shard(0);
        // build up then drain in LIFO order
        arena.push_free(&mut shard, 3);
        arena.push_free(&mut shard, 7);
        assert_eq!(arena.pop_free(&mut shard), Some(7));
        assert_eq!(arena.pop_free(&mut shard), Some(3));
        assert_eq!(arena.pop_free(&mut shard), None);
    }

    #[test]
    fn replenish_grows_fresh_ids() {
        let arena = SlotArena::new();
        let mut shard = arena.free[0].lock();
        arena.replenish(0, &mut shard).unwrap();
        let first = arena.pop_free(&mut shard).unwrap();
        assert_eq!(first, 1, "id 0 is reserved nil");
        arena.replenish(0, &mut shard).unwrap();
        assert_eq!(arena.pop_free(&mut shard), Some(2));
    }
}
