//! # Background Trimmer
//!
//! A detached manager thread evicts cold, clean, unreferenced BATs. Each
//! cycle first demotes HOT BATs that nobody holds a memory reference to,
//! then sleeps (briefly under VM pressure, up to ten seconds when idle)
//! and finally unloads every eligible BAT. Aggressive mode (entered on
//! explicit request) also evicts hot and memory-mapped-dirty BATs.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, error};

use crate::config::{TRIM_MAX_STEPS, TRIM_STEP_MS};
use crate::heap::StorageMode;
use crate::pool::slots::{BBPHOT, BBPLOADED, BBPSAVING, BBPSYNCING, BBPUNLOADING};
use crate::pool::BatPool;

impl BatPool {
    /// One eviction pass. Eligible are loaded BATs with no memory
    /// references but remaining logical references, not shared, not views,
    /// and either clean or (aggressively) entirely memory-mapped.
    pub fn trim(&self, aggressive: bool) {
        let mut n = 0;
        let mut flag = BBPUNLOADING | BBPSYNCING | BBPSAVING;
        if !aggressive {
            flag |= BBPHOT;
        }
        for bid in 1..self.size() {
            // never trim in the middle of a (sub)commit
            let _tm = self.tm_lock.lock();
            let slot = self.arena.slot(bid);
            let mut victim = None;
            {
                let _guard = self.swap_lock(bid).lock();
                if slot.status() & flag == 0
                    && slot.refs() == 0
                    && slot.lrefs() != 0
                    && slot.status() & BBPLOADED != 0
                {
                    if let Some(desc) = slot.desc.lock().clone() {
                        let inner = desc.lock();
                        let mmapped = inner
                            .theap
                            .as_ref()
                            .map(|h| h.storage == StorageMode::Mmap)
                            .unwrap_or(false)
                            && inner
                                .tvheap
                                .as_ref()
                                .map(|h| h.storage == StorageMode::Mmap)
                                .unwrap_or(true);
                        if slot.share() == 0
                            && !inner.is_view()
                            && (!inner.dirty() || (aggressive && mmapped))
                        {
                            slot.status_on(BBPUNLOADING);
                            drop(inner);
                            victim = Some(desc);
                        }
                    }
                }
            }
            if let Some(desc) = victim {
                debug!(bid, "unload and free bat");
                if self.free_bat(&desc).is_err() {
                    error!(bid, "unload failed");
                } else {
                    n += 1;
                }
            }
        }
        debug!(unloaded = n, aggressive, "trim pass done");
    }
}

/// Starts the manager thread. It holds only a weak reference, so dropping
/// the pool (after [`BatPool::exit`]) lets it die.
pub(crate) fn spawn_manager(pool: &Arc<BatPool>) {
    let weak = Arc::downgrade(pool);
    let handle = std::thread::Builder::new()
        .name("bbpmanager".to_string())
        .spawn(move || manager_loop(weak))
        .expect("spawn manager thread");
    *pool.manager.lock() = Some(handle);
}

fn manager_loop(weak: Weak<BatPool>) {
    loop {
        {
            let pool = match weak.upgrade() {
                Some(p) => p,
                None => return,
            };
            if pool.exiting.load(Ordering::Acquire) {
                return;
            }
            // first pass: drop the HOT bit on unreferenced bats
            let mut n = 0;
            for bid in 1..pool.size() {
                let slot = pool.arena.slot(bid);
                let _guard = pool.swap_lock(bid).lock();
                if slot.refs() == 0 && slot.lrefs() != 0 {
                    n += (slot.status() & BBPHOT != 0) as u32;
                    slot.status_off(BBPHOT);
                }
            }
            debug!(n, "cleared HOT bit");
        }

        // sleep between 100 ms and 10 s, shorter under VM pressure
        let steps = {
            let pool = match weak.upgrade() {
                Some(p) => p,
                None => return,
            };
            let cur = pool.vm.used();
            let max = pool.vm.limit();
            if cur > max / 2 {
                1
            } else if cur > max / 4 {
                10
            } else {
                TRIM_MAX_STEPS
            }
        };
        for _ in 0..steps {
            std::thread::sleep(Duration::from_millis(TRIM_STEP_MS));
            match weak.upgrade() {
                Some(p) if !p.exiting.load(Ordering::Acquire) => {}
                _ => return,
            }
        }

        let pool = match weak.upgrade() {
            Some(p) => p,
            None => return,
        };
        pool.trim(false);
        if pool.exiting.load(Ordering::Acquire) {
            return;
        }
    }
}
