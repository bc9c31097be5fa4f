//! # BAT Pool
//!
//! The process-wide directory and residency manager for BATs. The pool is
//! the single source of truth for which columns exist, what files they live
//! in, how many memory and logical users they have, whether their payload
//! is resident, and how the on-disk image is kept consistent across
//! crashes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 BatPool API                  │
//! │  insert/fix/unfix/retain/release/share/...   │
//! ├──────────────┬───────────────┬───────────────┤
//! │  slot arena  │  name index   │  ref & status │
//! │  (slots.rs)  │ (namehash.rs) │   (refs.rs)   │
//! ├──────────────┴───────┬───────┴───────────────┤
//! │   loader/unloader    │   directory file      │
//! │      (load.rs)       │    (dirfile.rs)       │
//! ├──────────────────────┼───────────────────────┤
//! │   commit protocol    │  recovery/disk scan   │
//! │     (commit.rs)      │     (recovery.rs)     │
//! ├──────────────────────┴───────────────────────┤
//! │           background trimmer (trim.rs)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! - one *swap lock* per `id & BAT_MASK` guards status bits and reference
//!   counters;
//! - the *name-index lock* guards the logical-name hash and arena growth;
//! - per-shard *free-list locks* guard id allocation;
//! - the *sync lock* serialises commits, recovery, and startup;
//! - [`BatPool::lock_all`] takes everything for global quiescence, after
//!   waiting out in-flight unloads.
//!
//! Acquisition order is swap locks (ascending id), then free-list shard,
//! then name-index. Status-bit waits never hold a lock: release, sleep
//! 1 ms, retest.

pub mod commit;
pub mod dirfile;
pub mod load;
pub mod namehash;
pub mod recovery;
pub mod refs;
pub mod slots;
pub mod trim;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, Result};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::atom::{AtomId, AtomRegistry};
use crate::bat::{BatDesc, BatId, BatInner};
use crate::config::{
    BAT_MASK, DELDIR, GDK_VERSION, GDK_VERSION_TAILN, ID_LENGTH, SPIN_NAP_MS, SWAP_SHARD_COUNT,
    TEMPDIR,
};
use crate::farm::{FarmRole, Farms};
use crate::heap::Heap;
use crate::memory::VmBudget;
use namehash::NameIndex;
use slots::{
    default_name, is_tmp_name, physical_name, subdir, tmp_name_id, FreeShard, LogicalName,
    SlotArena, BBPDELETING, BBPHOT, BBPLOADED, BBPLOADING, BBPRENAMED, BBPSWAPPED, BBPUNLOADING,
};

/// Distinguished rename failures; the name hash is untouched on any of
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RenameError {
    #[error("new BAT name is too long")]
    TooLong,
    #[error("illegal temporary name")]
    Illegal,
    #[error("name is already in use")]
    AlreadyInUse,
    #[error("out of memory while renaming")]
    Nomem,
}

/// Construction parameters for [`BatPool::insert`].
#[derive(Debug, Clone, Copy)]
pub struct NewBat {
    pub ttype: AtomId,
    pub role: FarmRole,
    pub transient: bool,
    /// Borrow the tail heap of this BAT instead of owning one. The caller
    /// pairs this with [`BatPool::share`] on the parent; the share (and the
    /// references it took) is returned when the view is destroyed.
    pub view_of: Option<BatId>,
}

impl NewBat {
    pub fn transient(ttype: AtomId) -> Self {
        Self {
            ttype,
            role: FarmRole::Transient,
            transient: true,
            view_of: None,
        }
    }

    pub fn persistent(ttype: AtomId) -> Self {
        Self {
            ttype,
            role: FarmRole::Persistent,
            transient: false,
            view_of: None,
        }
    }

    pub fn view(parent: BatId) -> Self {
        Self {
            ttype: crate::atom::TYPE_VOID,
            role: FarmRole::Transient,
            transient: true,
            view_of: Some(parent),
        }
    }
}

/// Pool construction options: farms must be registered before `init`.
#[derive(Debug, Default)]
pub struct PoolOptions {
    pub(crate) farms: Farms,
    pub(crate) vm_limit: Option<usize>,
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_farm(&mut self, dir: impl AsRef<std::path::Path>, rolemask: u32) -> Result<usize> {
        self.farms.add(dir, rolemask)
    }

    pub fn vm_limit(&mut self, bytes: usize) -> &mut Self {
        self.vm_limit = Some(bytes);
        self
    }
}

pub(crate) struct BackupCounters {
    /// Per-heap backups staged since the last publish.
    pub files: i32,
    /// 0: no staged BBP.dir, 1: in BACKUP/, 2: in BACKUP/SUBCOMMIT/.
    pub dir: i32,
    pub subdir: i32,
}

pub struct BatPool {
    pub(crate) farms: Farms,
    pub(crate) atoms: AtomRegistry,
    pub(crate) vm: VmBudget,
    pub(crate) arena: SlotArena,
    pub(crate) name_index: Mutex<NameIndex>,
    swap_locks: Vec<Mutex<()>>,
    /// Serialises commits, recovery and startup (the "tm" lock).
    pub(crate) tm_lock: Mutex<()>,
    unload_count: Mutex<i32>,
    locked_by: AtomicU64,
    pub(crate) backup: Mutex<BackupCounters>,
    logno: AtomicI64,
    transid: AtomicI64,
    pub(crate) exiting: Arc<AtomicBool>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

/// Numeric id of the calling thread, for lock-owner bookkeeping and debug
/// attribution.
pub(crate) fn tid() -> u64 {
    use std::sync::atomic::AtomicU64 as A;
    static NEXT: A = A::new(1);
    thread_local! {
        static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}

impl BatPool {
    fn new(options: PoolOptions) -> Self {
        Self {
            farms: options.farms,
            atoms: AtomRegistry::new(),
            vm: options
                .vm_limit
                .map(VmBudget::with_limit)
                .unwrap_or_else(VmBudget::auto_detect),
            arena: SlotArena::new(),
            name_index: Mutex::new(NameIndex::new()),
            swap_locks: (0..SWAP_SHARD_COUNT).map(|_| Mutex::new(())).collect(),
            tm_lock: Mutex::new(()),
            unload_count: Mutex::new(0),
            locked_by: AtomicU64::new(0),
            backup: Mutex::new(BackupCounters {
                files: 0,
                dir: 0,
                subdir: 0,
            }),
            logno: AtomicI64::new(0),
            transid: AtomicI64::new(0),
            exiting: Arc::new(AtomicBool::new(false)),
            manager: Mutex::new(None),
        }
    }

    /// Opens the pool: recovers any interrupted commit, reads the
    /// directory file, verifies heap files, and starts the background
    /// trimmer.
    pub fn init(options: PoolOptions) -> Result<Arc<Self>> {
        ensure!(
            !options.farms.is_empty() && options.farms.select(FarmRole::Persistent).is_some(),
            "no persistent farm registered"
        );
        let pool = Arc::new(Self::new(options));

        let version = {
            let _tm = pool.tm_lock.lock();

            for (farm_id, _) in pool.farms.distinct() {
                let data = pool.farms.dir(farm_id, crate::config::BATDIR);
                std::fs::create_dir_all(&data)?;
            }
            pool.farms.remove_dir(0, TEMPDIR)?;
            pool.farms.remove_dir(0, DELDIR)?;
            pool.recover_subdir()?;

            let file = pool.locate_dir_file()?;
            let version = pool.read_dir(file)?;

            pool.name_index.lock().rebuild(&pool.arena);
            pool.init_free_lists();
            version
        };

        {
            let _tm = pool.tm_lock.lock();
            pool.prepare(false)?;
        }
        pool.check_bats(version)?;

        let signal = pool.tailmove_signal_path();
        if version <= GDK_VERSION_TAILN {
            std::fs::File::create(&signal)?;
        }
        if version < GDK_VERSION {
            let logno = pool.logno();
            let transid = pool.transid();
            pool.sync(None, None, logno, transid)?;
        }
        if signal.exists() {
            pool.move_string_bats()?;
            std::fs::remove_file(&signal)?;
        }

        for (farm_id, _) in pool.farms.distinct() {
            pool.disk_scan(farm_id)?;
        }

        trim::spawn_manager(&pool);
        debug!(size = pool.size(), "pool initialised");
        Ok(pool)
    }

    /// Shuts the pool down: stops the trimmer, then sweeps and frees every
    /// descriptor under the global lock. Persistent state must have been
    /// committed by the caller beforehand.
    pub fn exit(&self) {
        self.exiting.store(true, Ordering::Release);
        if let Some(handle) = self.manager.lock().take() {
            let _ = handle.join();
        }

        let _guard = self.lock_all();
        loop {
            let mut skipped = false;
            for id in 1..self.size() {
                if !self.check_nolock(id) {
                    continue;
                }
                let slot = self.arena.slot(id);
                let desc = slot.desc.lock().clone();
                if let Some(desc) = desc {
                    let (vp, vvp, share) = {
                        let inner = desc.lock();
                        (inner.view_parent, inner.view_vparent, slot.share())
                    };
                    if share > 0 {
                        // a view still borrows from us; sweep again
                        skipped = true;
                        continue;
                    }
                    for parent in [vp, vvp] {
                        if parent != 0 {
                            let pslot = self.arena.slot(parent);
                            pslot.share.fetch_sub(1, Ordering::AcqRel);
                            pslot.lrefs.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                }
                self.uncache(id, true);
                slot.pid.store(0, Ordering::Release);
                let mut name = slot.name.lock();
                name.logical = LogicalName::Vacant;
                name.options = None;
            }
            if !skipped {
                break;
            }
        }
        *self.name_index.lock() = NameIndex::new();
        let mut backup = self.backup.lock();
        backup.files = 0;
        backup.dir = 0;
        backup.subdir = 0;
    }

    // ------------------------------------------------------------------
    // basic accessors
    // ------------------------------------------------------------------

    /// One above the highest BAT id in use.
    pub fn size(&self) -> BatId {
        self.arena.size()
    }

    pub fn farms(&self) -> &Farms {
        &self.farms
    }

    /// Current memory reference count (0 for an invalid id).
    pub fn refs(&self, id: BatId) -> i32 {
        self.arena.get(id).map(|s| s.refs()).unwrap_or(0)
    }

    /// Current logical reference count (0 for an invalid id).
    pub fn lrefs(&self, id: BatId) -> i32 {
        self.arena.get(id).map(|s| s.lrefs()).unwrap_or(0)
    }

    /// Number of views currently borrowing this BAT's heaps.
    pub fn share_count(&self, id: BatId) -> i32 {
        self.arena.get(id).map(|s| s.share()).unwrap_or(0)
    }

    /// True while the BAT's payload is resident.
    pub fn is_loaded(&self, id: BatId) -> bool {
        self.arena
            .get(id)
            .map(|s| s.status() & BBPLOADED != 0)
            .unwrap_or(false)
    }

    /// Log sequence number recorded by the last commit.
    pub fn logno(&self) -> i64 {
        self.logno.load(Ordering::Acquire)
    }

    /// Transaction id recorded by the last commit.
    pub fn transid(&self) -> i64 {
        self.transid.load(Ordering::Acquire)
    }

    pub(crate) fn set_info(&self, logno: i64, transid: i64) {
        self.logno.store(logno, Ordering::Release);
        self.transid.store(transid, Ordering::Release);
    }

    /// True when `id` names an occupied slot.
    pub(crate) fn check(&self, id: BatId) -> bool {
        self.check_nolock(id)
    }

    fn check_nolock(&self, id: BatId) -> bool {
        id > 0
            && id < self.size()
            && !matches!(self.arena.slot(id).name.lock().logical, LogicalName::Vacant)
    }

    // ------------------------------------------------------------------
    // locking helpers
    // ------------------------------------------------------------------

    pub(crate) fn swap_lock(&self, id: BatId) -> &Mutex<()> {
        &self.swap_locks[(id & BAT_MASK) as usize]
    }

    /// False when the calling thread already holds every lock via
    /// [`lock_all`](Self::lock_all); its nested calls must not re-acquire.
    pub(crate) fn should_lock(&self) -> bool {
        let owner = self.locked_by.load(Ordering::Acquire);
        owner == 0 || owner != tid()
    }

    /// Sleeps until the given status bits clear on `id`.
    pub(crate) fn spin(&self, id: BatId, event: u32) {
        if !self.check(id) {
            return;
        }
        let slot = self.arena.slot(id);
        let mut loops = 0u64;
        while slot.status() & event != 0 {
            std::thread::sleep(Duration::from_millis(SPIN_NAP_MS));
            loops += 1;
        }
        if loops > 0 {
            debug!(id, event, loops, "spun on status bits");
        }
    }

    pub(crate) fn unload_inc(&self) {
        *self.unload_count.lock() += 1;
    }

    pub(crate) fn unload_dec(&self) {
        let mut n = self.unload_count.lock();
        *n -= 1;
        debug_assert!(*n >= 0);
    }

    /// Global quiescence: waits for all in-flight unloads, then takes the
    /// sync lock, every free-list shard, and every swap lock in order. The
    /// owning thread's nested pool calls skip re-locking until the guard
    /// drops.
    pub fn lock_all(&self) -> PoolGuard<'_> {
        loop {
            let n = self.unload_count.lock();
            if *n == 0 {
                break;
            }
            drop(n);
            std::thread::sleep(Duration::from_millis(SPIN_NAP_MS));
        }
        let tm = self.tm_lock.lock();
        let free: Vec<_> = (0..self.arena.free_shard_count())
            .map(|i| self.arena.free_shard(i))
            .collect();
        let swap: Vec<_> = self.swap_locks.iter().map(|l| l.lock()).collect();
        self.locked_by.store(tid(), Ordering::Release);
        PoolGuard {
            pool: self,
            _swap: swap,
            _free: free,
            _tm: tm,
        }
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    /// Creates a BAT and returns its id. The new BAT starts with one
    /// memory reference, no logical references, and `DELETING|HOT` status
    /// until it is cached in.
    pub fn insert(&self, new: NewBat) -> Result<BatId> {
        let lock = self.should_lock();
        let shard_idx = (tid() as usize) & (self.arena.free_shard_count() - 1);

        let id = if lock {
            let mut shard = self.arena.free_shard(shard_idx);
            self.take_free(shard_idx, &mut shard)?
        } else {
            // SAFETY: the calling thread owns lock_all, so the shard
            // mutex is held by its guard and direct access is exclusive.
            let shard = unsafe { &mut *self.arena.free_shard_ptr(shard_idx) };
            self.take_free(shard_idx, shard)?
        };

        self.install(id, new)?;
        Ok(id)
    }

    fn take_free(&self, shard_idx: usize, shard: &mut FreeShard) -> Result<BatId> {
        if shard.head == 0 {
            let mut index = self.name_index.lock();
            self.arena.replenish(shard_idx, shard)?;
            if self.arena.limit() > index.capacity() {
                index.rebuild(&self.arena);
            }
        }
        Ok(self.arena.pop_free(shard).expect("replenished shard"))
    }

    fn install(&self, id: BatId, new: NewBat) -> Result<BatId> {
        let farm_id = self
            .farms
            .select(new.role)
            .or_else(|| self.farms.select(FarmRole::Persistent))
            .expect("a persistent farm exists");

        let mut inner = BatInner::new(new.ttype, &self.atoms, new.role, new.transient);
        let physical = physical_name(id);
        if let Some(parent) = new.view_of {
            inner.view_parent = parent;
        } else {
            let tail = crate::bat::tail_extension(inner.ttype, inner.width);
            let mut heap = Heap::new(farm_id, id, format!("{physical}.{tail}"));
            heap.size = (inner.capacity as usize) << inner.shift;
            heap.load(&self.farms)?; // empty payload is resident
            inner.theap = Some(heap);
            if inner.varsized && inner.ttype != crate::atom::TYPE_VOID {
                let mut vheap = Heap::new(farm_id, id, format!("{physical}.theap"));
                vheap.size = if inner.ttype == crate::atom::TYPE_STR {
                    crate::config::STR_VHEAP_MIN
                } else {
                    512
                };
                vheap.load(&self.farms)?;
                inner.tvheap = Some(vheap);
            }
        }
        let desc = Arc::new(BatDesc::new(id, inner));

        let slot = self.arena.slot(id);
        {
            let lock = self.should_lock();
            let guard = lock.then(|| self.swap_lock(id).lock());
            slot.status_set(BBPDELETING | BBPHOT);
            slot.refs.store(1, Ordering::Release);
            slot.lrefs.store(0, Ordering::Release);
            slot.share.store(0, Ordering::Release);
            slot.pid.store(tid(), Ordering::Release);
            *slot.desc.lock() = Some(desc);
            let mut name = slot.name.lock();
            name.logical = LogicalName::Default;
            name.options = None;
            drop(name);
            slot.physical.get_or_init(|| physical.clone());
            drop(guard);
        }

        // cache it in: loaded, stable
        {
            let lock = self.should_lock();
            let guard = lock.then(|| self.swap_lock(id).lock());
            let mode = (slot.status() | BBPLOADED) & !(BBPLOADING | BBPDELETING | BBPSWAPPED);
            slot.status_set(mode);
            drop(guard);
        }
        debug!(id, name = %default_name(id), "new bat");
        Ok(id)
    }

    /// Populates the per-shard free lists from the vacant slots, cycling
    /// shards so the lists start out even. Runs single-threaded at init.
    fn init_free_lists(&self) {
        let mut shard_idx = 0usize;
        for id in (1..self.size()).rev() {
            let vacant = matches!(self.arena.slot(id).name.lock().logical, LogicalName::Vacant);
            if vacant {
                let mut shard = self.arena.free_shard(shard_idx);
                self.arena.push_free(&mut shard, id);
                shard_idx = (shard_idx + 1) & (self.arena.free_shard_count() - 1);
            }
        }
    }

    // ------------------------------------------------------------------
    // name operations
    // ------------------------------------------------------------------

    /// Resolves a logical name to an id; 0 when absent. Default
    /// `tmp_<octal>` names bypass the hash table.
    pub fn index(&self, name: &str) -> BatId {
        self.find(name, true)
    }

    pub(crate) fn find(&self, name: &str, lock: bool) -> BatId {
        let tmpid = tmp_name_id(name);
        if tmpid != 0 {
            if tmpid >= self.size() {
                return 0;
            }
            return match self.arena.slot(tmpid).logical_string(tmpid) {
                Some(s) if s == name => tmpid,
                _ => 0,
            };
        }
        if lock {
            let index = self.name_index.lock();
            index.find(&self.arena, name)
        } else {
            // caller already holds the name-index lock
            let index = unsafe { &*self.name_index.data_ptr() };
            index.find(&self.arena, name)
        }
    }

    /// Renames a BAT. Names of the `tmp_<octal>` form are only valid when
    /// they equal the BAT's own default name. On success a persistent BAT
    /// is flagged RENAMED so the next commit records the change.
    pub fn rename(&self, id: BatId, name: &str) -> Result<(), RenameError> {
        if !self.check(id) {
            return Err(RenameError::Illegal);
        }
        let slot = self.arena.slot(id);
        if slot.logical_string(id).as_deref() == Some(name) {
            return Ok(());
        }

        let tmpid = tmp_name_id(name);
        if (tmpid != 0 || is_tmp_name(name)) && tmpid != id {
            return Err(RenameError::Illegal);
        }
        if subdir(id).len() + name.len() + 1 >= ID_LENGTH {
            return Err(RenameError::TooLong);
        }

        let mut index = self.name_index.lock();
        if self.find(name, false) != 0 {
            return Err(RenameError::AlreadyInUse);
        }

        let was_hashed = {
            let cell = slot.name.lock();
            matches!(&cell.logical, LogicalName::Named(n) if !is_tmp_name(n))
        };
        if was_hashed {
            index.delete(&self.arena, id);
        }
        {
            let mut cell = slot.name.lock();
            cell.logical = if tmpid == id {
                LogicalName::Default
            } else {
                LogicalName::Named(name.into())
            };
        }
        if tmpid == 0 {
            index.insert(&self.arena, id);
        }
        // the name work is complete; release the index before touching
        // status so the lock order stays swap-before-name everywhere else
        drop(index);

        let transient = slot
            .desc
            .lock()
            .as_ref()
            .map(|d| d.lock().transient)
            .unwrap_or(true);
        if !transient {
            let lock = self.should_lock();
            let guard = lock.then(|| self.swap_lock(id).lock());
            slot.status_on(BBPRENAMED);
            drop(guard);
        }
        Ok(())
    }

    /// Flags a BAT persistent (or transient again). Persistence only takes
    /// full effect once the caller also holds a logical reference; the
    /// status bit is what the commit writer selects on.
    pub fn set_persistent(&self, id: BatId, persistent: bool) {
        if !self.check(id) {
            return;
        }
        let slot = self.arena.slot(id);
        if let Some(desc) = slot.desc.lock().as_ref() {
            let mut inner = desc.lock();
            inner.transient = !persistent;
            inner.role = if persistent {
                FarmRole::Persistent
            } else {
                FarmRole::Transient
            };
        }
        let lock = self.should_lock();
        let guard = lock.then(|| self.swap_lock(id).lock());
        if persistent {
            slot.status_on(slots::BBPPERSISTENT | slots::BBPNEW);
            slot.status_off(slots::BBPTMP);
        } else {
            slot.status_off(slots::BBPPERSISTENT | slots::BBPNEW);
        }
        drop(guard);
    }

    // ------------------------------------------------------------------
    // slot teardown
    // ------------------------------------------------------------------

    /// Drops the resident payload marker; with `unload_desc` the
    /// descriptor itself is released too (the BAT is gone forever).
    pub(crate) fn uncache(&self, id: BatId, unload_desc: bool) {
        if !self.check(id) {
            return;
        }
        let slot = self.arena.slot(id);
        let mut desc = slot.desc.lock();
        if desc.is_some() {
            if slot.status() & BBPLOADED != 0 {
                debug!(id, "uncache");
                slot.status_off(BBPLOADED);
            }
            if unload_desc {
                *desc = None;
            }
        }
    }

    /// Removes a BAT from the directory forever: clears the slot, removes
    /// the name-hash entry, and returns the id to the caller's free-list
    /// shard.
    pub(crate) fn clear_slot(&self, id: BatId, lock: bool) {
        if !self.check(id) {
            return;
        }
        let lock = lock && self.should_lock();
        let slot = self.arena.slot(id);
        debug!(id, "clear slot");
        self.uncache(id, true);

        let shard_idx = (tid() as usize) & (self.arena.free_shard_count() - 1);
        let shard = lock.then(|| self.arena.free_shard(shard_idx));
        {
            let guard = lock.then(|| self.swap_lock(id).lock());
            slot.status_set(BBPUNLOADING);
            slot.refs.store(0, Ordering::Release);
            slot.lrefs.store(0, Ordering::Release);
            drop(guard);
        }
        let was_hashed = {
            let cell = slot.name.lock();
            matches!(&cell.logical, LogicalName::Named(n) if !is_tmp_name(n))
        };
        if was_hashed {
            let mut index = self.name_index.lock();
            index.delete(&self.arena, id);
        }
        {
            let mut cell = slot.name.lock();
            cell.logical = LogicalName::Vacant;
            cell.options = None;
        }
        slot.status_set(0);
        slot.pid.store(u64::MAX, Ordering::Release);
        match shard {
            Some(mut shard) => self.arena.push_free(&mut shard, id),
            None => {
                // SAFETY: without `lock` the calling thread owns lock_all
                // (or runs single-threaded teardown); the shard mutex is
                // held by its guard, so direct access is exclusive.
                let shard = unsafe { &mut *self.arena.free_shard_ptr(shard_idx) };
                self.arena.push_free(shard, id);
            }
        }
    }

    fn tailmove_signal_path(&self) -> std::path::PathBuf {
        self.farms
            .path(0, crate::config::BATDIR, crate::config::TAILMOVE_SIGNAL, None)
    }
}

/// Guard of [`BatPool::lock_all`]; everything is released on drop.
pub struct PoolGuard<'a> {
    pool: &'a BatPool,
    _swap: Vec<MutexGuard<'a, ()>>,
    _free: Vec<MutexGuard<'a, FreeShard>>,
    _tm: MutexGuard<'a, ()>,
}

impl Drop for PoolGuard<'_> {
    fn drop(&mut self) {
        self.pool.locked_by.store(0, Ordering::Release);
    }
}
