//! # Reference & Status Core
//!
//! Every BAT carries two independent counters: *memory* references
//! (fix/unfix) pin the payload in memory, *logical* references
//! (retain/release) keep the BAT alive. A BAT with no memory references is
//! an eviction candidate; with neither kind of reference it is destroyed
//! outright.
//!
//! Views complicate the first memory reference: the parents' payloads must
//! be resident before the view is usable, so the parents are acquired with
//! a recursive fix *before* the child's swap lock is taken. While that
//! window is open the child holds its LOADING bit and concurrent readers
//! spin.
//!
//! The unfix/release path is where eviction policy lives: a clean,
//! unshared, persistent, non-hot BAT whose memory references hit zero is
//! unloaded when VM residency is high; a BAT whose last logical reference
//! disappears is destroyed.

use std::sync::atomic::Ordering;

use tracing::{debug, error};

use crate::bat::{Access, BatDesc, BatId};
use crate::pool::slots::{
    BBPDELETED, BBPHOT, BBPLOADED, BBPLOADING, BBPPERSISTENT, BBPSWAPPED, BBPSYNCING, BBPTMP,
    BBPUNLOADING, BBPUNSTABLE,
};
use crate::pool::BatPool;
use std::sync::Arc;

impl BatPool {
    /// Takes a memory reference. Returns the new count, or 0 when the id
    /// is invalid or a view's parents cannot be loaded.
    pub fn fix(&self, id: BatId) -> i32 {
        self.incref(id, false, self.should_lock())
    }

    /// Takes a logical reference. Returns the new count (0 on invalid id).
    pub fn retain(&self, id: BatId) -> i32 {
        self.incref(id, true, self.should_lock())
    }

    /// Releases a memory reference. Returns the remaining count, or -1 on
    /// an invalid id.
    pub fn unfix(&self, id: BatId) -> i32 {
        self.decref(id, false, false, self.should_lock())
    }

    /// Releases a logical reference. Returns the remaining count, or -1 on
    /// an invalid id.
    pub fn release(&self, id: BatId) -> i32 {
        self.decref(id, true, false, self.should_lock())
    }

    /// Registers a view borrowing `parent`'s heaps: one logical reference,
    /// one share, one memory reference.
    pub fn share(&self, parent: BatId) {
        let lock = self.should_lock();
        debug_assert!(parent > 0);
        let _ = self.incref(parent, true, lock);
        {
            let guard = lock.then(|| self.swap_lock(parent).lock());
            self.arena.slot(parent).share.fetch_add(1, Ordering::AcqRel);
            drop(guard);
        }
        let refs = self.incref(parent, false, lock);
        debug_assert!(refs > 0);
    }

    /// Returns a view's borrow of `parent`.
    pub fn unshare(&self, parent: BatId) {
        self.unshare_internal(parent, self.should_lock());
    }

    pub(crate) fn unshare_internal(&self, parent: BatId, lock: bool) {
        let _ = self.decref(parent, false, true, lock);
        let _ = self.decref(parent, true, false, lock);
    }

    /// Converts one memory reference into one logical reference under a
    /// single logical view of the counters. The produced BAT is marked
    /// read-only on its way out.
    pub fn keepref(&self, id: BatId) {
        if !self.check(id) {
            return;
        }
        let lock = self.should_lock();
        let _ = self.incref(id, true, lock);
        if let Some(desc) = self.descriptor(id) {
            desc.lock().restricted = Access::Read;
        }
        debug_assert!(self.arena.slot(id).refs() > 0);
        let _ = self.decref(id, false, false, lock);
    }

    /// Clears the HOT bit of a persistent BAT so the next trim pass may
    /// evict it.
    pub fn cold(&self, id: BatId) {
        if !self.check(id) {
            return;
        }
        let persistent = match self.arena.slot(id).desc.lock().as_ref() {
            Some(desc) => !desc.lock().transient,
            None => true,
        };
        if persistent {
            self.arena.slot(id).status_off(BBPHOT);
        }
    }

    /// Caller-driven unload of a BAT it holds the only memory reference
    /// to. Returns 0 when unloaded, -1 when the BAT has other references,
    /// 1 when writing it out failed.
    pub fn reclaim(&self, id: BatId) -> i32 {
        if !self.check(id) {
            return -1;
        }
        if self.arena.slot(id).refs() != 1 {
            return -1;
        }
        (self.decref(id, false, false, self.should_lock()) < 0) as i32
    }

    // ------------------------------------------------------------------

    fn view_parents(&self, id: BatId) -> (BatId, BatId) {
        match self.arena.slot(id).desc.lock().as_ref() {
            Some(desc) => {
                let inner = desc.lock();
                (
                    if inner.view_parent != 0 { inner.view_parent } else { id },
                    if inner.view_vparent != 0 { inner.view_vparent } else { id },
                )
            }
            None => (id, id),
        }
    }

    /// Fix plus load, the combination a view needs of its parent.
    fn fix_and_load(&self, id: BatId) -> Option<Arc<BatDesc>> {
        if self.fix(id) <= 0 {
            return None;
        }
        match self.descriptor(id) {
            Some(desc) => Some(desc),
            None => {
                let _ = self.unfix(id);
                None
            }
        }
    }

    pub(crate) fn incref(&self, id: BatId, logical: bool, lock: bool) -> i32 {
        if !self.check(id) {
            return 0;
        }
        let slot = self.arena.slot(id);

        // Before taking the lock, make sure a view's parents are loadable.
        // If this turns out not to be the first physical reference the
        // extra parent fixes are undone below.
        let (mut tp, mut tvp) = (id, id);
        if !logical {
            let (p, vp) = self.view_parents(id);
            tp = p;
            tvp = vp;
            if tp != id && self.fix_and_load(tp).is_none() {
                return 0;
            }
            if tvp != id && self.fix_and_load(tvp).is_none() {
                if tp != id {
                    let _ = self.unfix(tp);
                }
                return 0;
            }
        }

        let mut guard: Option<parking_lot::MutexGuard<'_, ()>> = None;
        if lock {
            loop {
                guard = Some(self.swap_lock(id).lock());
                if slot.status() & (BBPUNSTABLE | BBPLOADING) == 0 {
                    break;
                }
                guard = None;
                self.spin(id, BBPUNSTABLE | BBPLOADING);
            }
        }

        if slot.desc.lock().is_none() {
            drop(guard);
            return 0;
        }

        debug_assert!(
            slot.refs() + slot.lrefs() > 0 || slot.status() & (BBPDELETED | BBPSWAPPED) != 0
        );

        let refs;
        let mut load = false;
        if logical {
            refs = slot.lrefs.fetch_add(1, Ordering::AcqRel) + 1;
            slot.pid.store(0, Ordering::Release);
        } else {
            refs = slot.refs.fetch_add(1, Ordering::AcqRel) + 1;
            let mut flag = BBPHOT;
            if refs == 1 && (tp != id || tvp != id) {
                // first physical reference to a view: keep competitors out
                // until the parents are attached
                flag |= BBPLOADING;
                load = true;
            }
            slot.status_on(flag);
        }
        drop(guard);

        if load {
            // the parents are resident and fixed; borrowed payloads are
            // read through the pool, so attachment is just the handshake
            self.arena.slot(id).status_off(BBPLOADING);
        } else if !logical {
            if tp != id {
                let _ = self.unfix(tp);
            }
            if tvp != id {
                let _ = self.unfix(tvp);
            }
        }
        refs
    }

    pub(crate) fn decref(&self, id: BatId, logical: bool, release_share: bool, lock: bool) -> i32 {
        if id == 0 || !self.check(id) {
            return -1;
        }
        let slot = self.arena.slot(id);
        let mut guard = lock.then(|| self.swap_lock(id).lock());

        if release_share {
            debug_assert!(slot.lrefs() > 0);
            if slot.share() == 0 {
                error!(id, "bat does not have any shares");
                debug_assert!(false, "unshare without share");
            } else {
                slot.share.fetch_sub(1, Ordering::AcqRel);
            }
            return 0;
        }

        while slot.status() & BBPUNLOADING != 0 {
            guard = None;
            self.spin(id, BBPUNLOADING);
            if lock {
                guard = Some(self.swap_lock(id).lock());
            }
        }

        let loaded = slot.status() & BBPLOADED != 0;
        let desc = slot.desc.lock().clone();

        let refs;
        let mut tp = 0;
        let mut tvp = 0;
        if logical {
            if slot.lrefs() == 0 {
                error!(id, "bat does not have logical references");
                debug_assert!(false, "release without retain");
                refs = 0;
            } else {
                refs = slot.lrefs.fetch_sub(1, Ordering::AcqRel) - 1;
            }
            debug_assert!(slot.share() == 0 || refs > 0);
        } else {
            if slot.refs() == 0 {
                error!(id, "bat does not have pointer fixes");
                debug_assert!(false, "unfix without fix");
                refs = 0;
            } else {
                refs = slot.refs.fetch_sub(1, Ordering::AcqRel) - 1;
                if loaded && refs == 0 {
                    if let Some(desc) = desc.as_ref() {
                        let inner = desc.lock();
                        tp = inner.view_parent;
                        tvp = inner.view_vparent;
                        if tp != 0 || tvp != 0 {
                            slot.status_on(BBPHOT);
                        }
                    }
                }
            }
        }

        // A (sub)commit running in parallel with an update may have turned
        // the dirty bits off while rows were still uncommitted; redo them.
        let mut heap_bytes = 0usize;
        if let Some(desc) = desc.as_ref() {
            let mut inner = desc.lock();
            if inner.delta_dirty() && !inner.is_view() {
                if let Some(h) = inner.theap.as_mut() {
                    if h.parent_id == id {
                        h.dirty = true;
                    }
                }
                if let Some(h) = inner.tvheap.as_mut() {
                    if h.parent_id == id {
                        h.dirty = true;
                    }
                }
            }
            heap_bytes = inner
                .theap
                .as_ref()
                .map(|h| h.size)
                .unwrap_or(0)
                + inner.tvheap.as_ref().map(|h| h.size).unwrap_or(0);
        }

        // transients are destroyed asap; persistent bats are unloaded only
        // when cold or clean and memory is tight
        let mut chkflag = BBPSYNCING;
        if self.vm.used() < self.vm.limit() && heap_bytes < self.vm.headroom() / 32 {
            chkflag |= BBPHOT;
        }
        let mut swap = false;
        if slot.refs() == 0 {
            let unloadable = if slot.lrefs() == 0 {
                true
            } else if loaded {
                let clean = desc
                    .as_ref()
                    .map(|d| !d.lock().dirty())
                    .unwrap_or(false);
                clean
                    && slot.status() & chkflag == 0
                    && slot.status() & BBPPERSISTENT != 0
                    && slot.share() == 0
            } else {
                slot.status() & BBPTMP != 0
            };
            if unloadable {
                debug_assert!(slot.status() & BBPUNLOADING == 0);
                debug!(id, status = slot.status(), lrefs = slot.lrefs(), "set to unloading");
                slot.status_on(BBPUNLOADING);
                swap = true;
            }
        }
        let lrefs_now = slot.lrefs();

        // saving a dirty persistent bat can take a while; do it unlocked
        drop(guard);

        if swap {
            if let Some(desc) = desc.filter(|_| loaded) {
                if lrefs_now == 0 && slot.status() & BBPDELETED == 0 {
                    // free memory (if loaded) and delete from disk
                    self.destroy_bat(&desc);
                } else {
                    debug!(id, "unload and free bat");
                    if self.free_bat(&desc).is_err() {
                        return -1;
                    }
                }
            } else if lrefs_now == 0 && slot.status() & BBPDELETED == 0 {
                if let Some(desc) = self.arena.slot(id).desc.lock().clone() {
                    let inner = desc.lock();
                    let physical = self.arena.slot(id).physical.get().cloned().unwrap_or_default();
                    let farm_id = inner.theap.as_ref().map(|h| h.farm_id).unwrap_or(0);
                    let _ = inner.delete_files(&self.farms, farm_id, &physical);
                }
                self.clear_slot(id, true);
            } else {
                slot.status_off(BBPUNLOADING);
            }
        }

        if tp != 0 {
            let _ = self.decref(tp, false, false, lock);
        }
        if tvp != 0 {
            let _ = self.decref(tvp, false, false, lock);
        }
        refs
    }
}
