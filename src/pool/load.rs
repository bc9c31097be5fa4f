//! # Loader / Unloader
//!
//! Descriptors are cheap and stay in memory for every known BAT; the heap
//! payloads are lazily materialised on first use and dropped again under
//! memory pressure. The load and save paths communicate through status
//! bits: LOADING and SAVING are set under the swap lock, the slow file
//! work happens unlocked, and competing threads spin until the bit clears.

use eyre::Result;
use tracing::{debug, warn};

use crate::bat::{BatDesc, BatId};
use crate::pool::slots::{
    BBPDELETING, BBPEXISTING, BBPLOADED, BBPLOADING, BBPPERSISTENT, BBPSAVING, BBPSWAPPED, BBPTMP,
    BBPUNLOADING, BBPWAITING,
};
use crate::pool::BatPool;
use std::sync::Arc;

impl BatPool {
    /// The descriptor of `id` with its payload resident, loading it if
    /// necessary. The caller must hold at least one memory reference.
    pub fn descriptor(&self, id: BatId) -> Option<Arc<BatDesc>> {
        self.get_descriptor(id, self.should_lock())
    }

    fn get_descriptor(&self, id: BatId, lock: bool) -> Option<Arc<BatDesc>> {
        if !self.check(id) {
            warn!(id, "descriptor requested for invalid bat id");
            return None;
        }
        debug_assert!(self.arena.slot(id).refs() > 0);
        let slot = self.arena.slot(id);

        let mut load = false;
        {
            let mut guard = lock.then(|| self.swap_lock(id).lock());
            if slot.status() & BBPLOADED == 0 || slot.status() & BBPWAITING != 0 {
                while slot.status() & BBPWAITING != 0 {
                    // wait for the bat to be loaded by the other thread
                    guard = None;
                    self.spin(id, BBPWAITING);
                    if lock {
                        guard = Some(self.swap_lock(id).lock());
                    }
                }
                if self.check(id) && slot.status() & BBPLOADED == 0 {
                    debug!(id, "set to loading");
                    slot.status_on(BBPLOADING);
                    load = true;
                }
            }
            drop(guard);
        }

        if load {
            let res = self.load_bat(id);
            // clearing bits can be done without the lock
            slot.status_off(BBPLOADING);
            if let Err(e) = res {
                warn!(id, error = %e, "load failed");
                return None;
            }
        }
        slot.desc.lock().clone()
    }

    /// Metadata-only descriptor: no heap payload is touched. Resolves
    /// previously unknown atom types against the registry so an upgraded
    /// server sees them again.
    pub fn quickdesc(&self, id: BatId) -> Option<Arc<BatDesc>> {
        if !self.check(id) {
            if id != 0 {
                warn!(id, "called with invalid bat id");
                debug_assert!(false, "quickdesc on invalid id");
            }
            return None;
        }
        let desc = self.arena.slot(id).desc.lock().clone()?;
        {
            let mut inner = desc.lock();
            if inner.ttype < 0 {
                match self.atoms.unknown_name(inner.ttype).and_then(|n| self.atoms.index(&n)) {
                    Some(t) => inner.ttype = t,
                    None => warn!(id, "atom of bat still unknown"),
                }
            }
        }
        Some(desc)
    }

    /// Reads the heap payloads from disk and marks the slot loaded.
    fn load_bat(&self, id: BatId) -> Result<()> {
        let slot = self.arena.slot(id);
        let desc = match slot.desc.lock().clone() {
            Some(d) => d,
            None => eyre::bail!("bat {id} has no descriptor"),
        };
        {
            let mut inner = desc.lock();
            debug!(id, "load");
            if inner.view_parent == 0 {
                if let Some(h) = inner.theap.as_mut() {
                    h.load(&self.farms)?;
                }
            }
            if inner.view_vparent == 0 {
                if let Some(h) = inner.tvheap.as_mut() {
                    h.load(&self.farms)?;
                }
            }
            self.vm.register(inner.resident_bytes());
        }
        {
            let lock = self.should_lock();
            let guard = lock.then(|| self.swap_lock(id).lock());
            let mode = (slot.status() | BBPLOADED) & !(BBPLOADING | BBPDELETING | BBPSWAPPED);
            slot.status_set(mode);
            drop(guard);
        }
        Ok(())
    }

    /// Writes a dirty BAT out. Clean BATs and views only flush a dirty
    /// accelerator hash. Competing savers spin on the SAVING bit.
    pub(crate) fn save_bat(&self, desc: &Arc<BatDesc>) -> Result<()> {
        let id = desc.id();
        let lock = self.should_lock();
        let slot = self.arena.slot(id);

        let (skip, delta, transient) = {
            let inner = desc.lock();
            let data_dirty = inner
                .theap
                .as_ref()
                .map(|h| h.dirty)
                .unwrap_or(false)
                || inner.tvheap.as_ref().map(|h| h.dirty).unwrap_or(false);
            (
                slot.lrefs() == 0 || inner.is_view() || !data_dirty,
                inner.delta_dirty(),
                inner.transient,
            )
        };
        if skip {
            let mut inner = desc.lock();
            let persistent = slot.status() & BBPPERSISTENT != 0;
            let physical = slot.physical.get().cloned().unwrap_or_default();
            let farm_id = inner.theap.as_ref().map(|h| h.farm_id).unwrap_or(0);
            if let Some(hash) = inner.hash.as_mut() {
                if hash.dirty {
                    hash.save(&self.farms, farm_id, &physical, persistent)?;
                }
            }
            return Ok(());
        }

        {
            let guard = lock.then(|| self.swap_lock(id).lock());
            if slot.status() & BBPSAVING != 0 {
                // wait until the save in the other thread completes
                drop(guard);
                self.spin(id, BBPSAVING);
                return Ok(());
            }
            let mut flags = BBPSAVING;
            if delta {
                flags |= BBPSWAPPED;
            }
            if transient {
                flags |= BBPTMP;
            }
            slot.status_on(flags);
            drop(guard);
        }

        debug!(id, "save");
        // the time-consuming work runs unlocked
        let mut ret = Ok(());
        if slot.status() & BBPEXISTING != 0 {
            ret = self.backup(desc, false);
        }
        if ret.is_ok() {
            let mut inner = desc.lock();
            let count = inner.count;
            ret = inner.save(&self.farms, count);
        }
        slot.status_off(BBPSAVING);
        ret
    }

    /// Saves if needed, then drops the resident payload, leaving the
    /// descriptor in place. The inverse of [`descriptor`](Self::descriptor).
    pub(crate) fn free_bat(&self, desc: &Arc<BatDesc>) -> Result<()> {
        let id = desc.id();
        let slot = self.arena.slot(id);
        self.unload_inc();

        // write dirty bats before unloading
        let ret = self.save_bat(desc);
        let mut tp = 0;
        let mut tvp = 0;
        if ret.is_ok() {
            let mut inner = desc.lock();
            tp = inner.view_parent;
            tvp = inner.view_vparent;
            if !inner.is_view() {
                self.vm.release(inner.resident_bytes());
                if let Some(h) = inner.theap.as_mut() {
                    h.unload();
                }
                if let Some(h) = inner.tvheap.as_mut() {
                    h.unload();
                }
            }
            drop(inner);
            self.uncache(id, false);
        }
        debug!(id, "turn off unloading");
        slot.status_off(BBPUNLOADING);
        self.unload_dec();

        // parents are released when completely done with the child
        if ret.is_ok() {
            if tp != 0 {
                self.unshare_internal(tp, self.should_lock());
            }
            if tvp != 0 {
                self.unshare_internal(tvp, self.should_lock());
            }
        }
        ret
    }

    /// Tears a dying BAT down: element unfix hooks run over the resident
    /// tuples, the files are removed, and the slot is cleared.
    pub(crate) fn destroy_bat(&self, desc: &Arc<BatDesc>) {
        let id = desc.id();
        let slot = self.arena.slot(id);
        let (tp, tvp) = {
            let inner = desc.lock();
            (inner.view_parent, inner.view_vparent)
        };

        if tp == 0 {
            // bats that get destroyed must unfix their elements
            let inner = desc.lock();
            if let Some(unfix) = self.atoms.unfix(inner.ttype) {
                debug_assert!(slot.share() == 0);
                if let Some(bytes) = inner.theap.as_ref().and_then(|h| h.bytes()) {
                    let width = inner.width as usize;
                    if width > 0 {
                        for chunk in bytes.chunks_exact(width).take(inner.count as usize) {
                            unfix(chunk);
                        }
                    }
                }
            }
        }

        {
            let inner = desc.lock();
            let physical = slot.physical.get().cloned().unwrap_or_default();
            let farm_id = inner.theap.as_ref().map(|h| h.farm_id).unwrap_or(0);
            if let Err(e) = inner.delete_files(&self.farms, farm_id, &physical) {
                warn!(id, error = %e, "removing bat files failed");
            }
            self.vm.release(inner.resident_bytes());
        }

        self.clear_slot(id, true);

        // parents are released when completely done with the child
        if tp != 0 {
            self.unshare_internal(tp, self.should_lock());
        }
        if tvp != 0 {
            self.unshare_internal(tvp, self.should_lock());
        }
    }
}
