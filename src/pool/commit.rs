//! # Atomic Commit Protocol
//!
//! A commit atomically replaces the on-disk image of a set of persistent
//! BATs plus the directory file. The dance:
//!
//! 1. **Prepare**: make sure `BACKUP/` (and `BACKUP/SUBCOMMIT/` for a
//!    subcommit) exists and holds the previous `BBP.dir` as the merge
//!    source.
//! 2. **Safeguard**: for every BAT in the commit, move the committed heap
//!    files into the staging directory. Copy-on-write heaps that have no
//!    file yet get a `<name>.<ext>.new.kill` marker instead, so recovery
//!    knows to delete a half-written `.new` sibling.
//! 3. **Save**: write each dirty BAT's payload (`.new` siblings for
//!    copy-on-write heaps) and stream the new `BBP.dir`, merging forward
//!    old entries not covered by a subcommit.
//! 4. **Publish**: rename `BACKUP/` to `DELETE_ME/`, the single atomic
//!    step that decides the commit, then remove `DELETE_ME/` best-effort.
//!
//! Failure anywhere leaves either `BACKUP/` intact (startup recovery rolls
//! back) or the rename done (the commit counts, `DELETE_ME/` is garbage).

use std::fs;
use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tracing::{debug, warn};

use crate::bat::{tail_extension, BatDesc, BatId};
use crate::config::{BAKDIR, BATDIR, DELDIR, SUBDIR};
use crate::heap::{Heap, StorageMode};
use crate::pool::dirfile::DirWriter;
use crate::pool::slots::{
    BBPDELETED, BBPEXISTING, BBPLOADED, BBPNEW, BBPPERSISTENT, BBPRENAMED, BBPSAVING, BBPSWAPPED,
    BBPSYNCING, BBPUNLOADING,
};
use crate::pool::BatPool;

/// Candidate tail extensions, preferred first: half-saved `.new` siblings
/// win over committed files, wide offsets over narrow ones.
const TAIL_VARIANTS_NEW: [&str; 4] = ["tail.new", "tail4.new", "tail2.new", "tail1.new"];
const TAIL_VARIANTS: [&str; 4] = ["tail", "tail4", "tail2", "tail1"];

impl BatPool {
    /// Makes sure the staging directories exist and hold the previous
    /// manifest. Runs leftover recovery when no backup is in flight. The
    /// caller holds the sync lock.
    pub(crate) fn prepare(&self, subcommit: bool) -> Result<()> {
        let mut counters = self.backup.lock();
        let set = 1 + subcommit as i32;

        let start_subcommit = subcommit && counters.subdir == 0;
        if start_subcommit {
            // starting a subcommit; SUBCOMMIT/ and DELETE_ME/ must be clean
            self.recover_subdir_with(&mut counters)?;
        }
        if counters.files == 0 {
            counters.dir = 0;
            self.recover(0)?;
            let bakdir = self.farms.dir(0, BAKDIR);
            match fs::create_dir(&bakdir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(e)
                        .wrap_err_with(|| format!("cannot create directory {}", bakdir.display()));
                }
            }
        }
        if start_subcommit {
            let subdir = self.farms.dir(0, SUBDIR);
            fs::create_dir(&subdir)
                .wrap_err_with(|| format!("cannot create directory {}", subdir.display()))?;
        }
        if counters.dir != set {
            // a valid backup dir must at least contain a BBP.dir
            let srcdir = if counters.dir != 0 { BAKDIR } else { BATDIR };
            let dstdir = if subcommit { SUBDIR } else { BAKDIR };
            self.farms.move_file(0, srcdir, dstdir, "BBP", Some("dir"))?;
            counters.dir = set;
        }
        counters.subdir += subcommit as i32;
        counters.files += 1;
        Ok(())
    }

    /// Moves one file between staging and data directories, mapping a
    /// missing source to a distinguishable error.
    pub(crate) fn file_move(
        &self,
        farm_id: usize,
        srcdir: &str,
        dstdir: &str,
        name: &str,
        ext: Option<&str>,
    ) -> Result<()> {
        if self.farms.move_file(farm_id, srcdir, dstdir, name, ext).is_ok() {
            return Ok(());
        }
        let src = self.farms.path(farm_id, srcdir, name, ext);
        if !src.exists() {
            // the best recovery is to report the BAT as not saved so that
            // this time it does get saved
            return Err(eyre!("file_move: cannot stat {}", src.display()));
        }
        Err(eyre!("file_move: cannot move {}", src.display()))
    }

    /// Stages one heap file. A destination already holding the committed
    /// state is left alone; a copy-on-write heap without a source file
    /// gets a kill marker so recovery removes its half-written `.new`.
    fn heap_move(
        &self,
        heap: &Heap,
        srcdir: &str,
        dstdir: &str,
        nme: &str,
        ext: &str,
    ) -> Result<()> {
        if self.farms.file_exists(heap.farm_id, dstdir, nme, Some(ext)) {
            // don't overwrite the committed state already staged
            return Ok(());
        }
        if heap.newstorage == StorageMode::Priv
            && !self.farms.file_exists(heap.farm_id, srcdir, nme, Some(ext))
        {
            let kill = self
                .farms
                .path(heap.farm_id, dstdir, nme, Some(&format!("{ext}.kill")));
            debug!(path = %kill.display(), "dropping kill marker");
            fs::File::create(&kill)
                .wrap_err_with(|| format!("heap_move: cannot open file {}", kill.display()))?;
            return Ok(());
        }
        self.file_move(heap.farm_id, srcdir, dstdir, nme, Some(ext))
    }

    /// Safeguards one heap into the staging directory, honouring the
    /// string-tail name variants of older databases.
    fn do_backup(
        &self,
        srcdir: &str,
        nme: &str,
        ext: &str,
        heap: &Heap,
        dirty: bool,
        subcommit: bool,
    ) -> Result<()> {
        if heap.wasempty {
            return Ok(());
        }
        let farm = heap.farm_id;
        let istail = ext.starts_with("tail");

        if subcommit {
            // a backup made earlier (under any tail variant) belongs to
            // this subcommit now
            let mut staged = None;
            if istail {
                for cand in TAIL_VARIANTS {
                    if self.farms.file_exists(farm, BAKDIR, nme, Some(cand)) {
                        staged = Some(cand);
                        break;
                    }
                }
            } else if self.farms.file_exists(farm, BAKDIR, nme, Some(ext)) {
                staged = Some(ext);
            }
            if let Some(cand) = staged {
                self.file_move(farm, BAKDIR, SUBDIR, nme, Some(cand))?;
            }
        }

        if heap.storage != StorageMode::Mmap {
            // Copy-on-write heaps save into X.new files. Either a valid
            // X.new exists (access change or earlier commit) and is backed
            // up as usual, or it doesn't and a kill marker protects us
            // from a half-written one after a crash.
            let exists = if istail {
                TAIL_VARIANTS_NEW
                    .iter()
                    .chain(TAIL_VARIANTS.iter())
                    .copied()
                    .any(|c| self.farms.file_exists(farm, BAKDIR, nme, Some(c)))
            } else {
                self.farms.file_exists(farm, BAKDIR, nme, Some("theap.new"))
                    || self.farms.file_exists(farm, BAKDIR, nme, Some("theap"))
            };
            let extnew = format!("{ext}.new");
            let dstdir = if subcommit { SUBDIR } else { BAKDIR };

            let mut moved = Ok(());
            if dirty && !exists {
                let candidates: Vec<String> = if istail {
                    TAIL_VARIANTS_NEW
                        .iter()
                        .chain(TAIL_VARIANTS.iter())
                        .map(|s| s.to_string())
                        .collect()
                } else {
                    vec![extnew.clone(), ext.to_string()]
                };
                for cand in candidates {
                    if self.farms.file_exists(farm, srcdir, nme, Some(&cand)) {
                        moved = self.heap_move(heap, srcdir, dstdir, nme, &cand);
                        break;
                    }
                }
            } else if subcommit {
                // an already made backup moves from BACKUP/ to SUBCOMMIT/
                if self.farms.file_exists(farm, BAKDIR, nme, Some(&extnew)) {
                    moved = self.file_move(farm, BAKDIR, SUBDIR, nme, Some(&extnew));
                } else if self.farms.file_exists(farm, BAKDIR, nme, Some(ext)) {
                    moved = self.file_move(farm, BAKDIR, SUBDIR, nme, Some(ext));
                }
            }
            // a move may legitimately fail when this heap was not supposed
            // to exist before; only complain when the source is there
            if moved.is_err() && self.farms.file_exists(farm, srcdir, nme, Some(ext)) {
                return moved;
            }
            if subcommit
                && (heap.storage == StorageMode::Priv || heap.newstorage == StorageMode::Priv)
            {
                let kill = format!("{ext}.new.kill");
                if self.farms.file_exists(farm, BAKDIR, nme, Some(&kill)) {
                    self.file_move(farm, BAKDIR, SUBDIR, nme, Some(&kill))?;
                }
            }
        }
        Ok(())
    }

    /// Moves all committed files of a BAT into the staging directory; only
    /// after this succeeds may the BAT be saved, so a failure halfway can
    /// always be rolled back.
    pub(crate) fn backup(&self, desc: &Arc<BatDesc>, subcommit: bool) -> Result<()> {
        self.prepare(subcommit)?;
        let id = desc.id();
        let inner = desc.lock();
        if !inner.copied_to_disk || inner.transient {
            return Ok(());
        }
        let physical = self
            .arena
            .slot(id)
            .physical
            .get()
            .cloned()
            .unwrap_or_default();
        let (dir_part, stem) = match physical.rsplit_once('/') {
            Some((d, s)) => (format!("{BATDIR}/{d}"), s.to_string()),
            None => (BATDIR.to_string(), physical),
        };

        if inner.ttype != crate::atom::TYPE_VOID {
            if let Some(h) = inner.theap.as_ref() {
                self.do_backup(
                    &dir_part,
                    &stem,
                    &tail_extension(inner.ttype, inner.width),
                    h,
                    h.dirty,
                    subcommit,
                )?;
            }
        }
        if let Some(h) = inner.tvheap.as_ref() {
            self.do_backup(&dir_part, &stem, "theap", h, h.dirty, subcommit)?;
        }
        Ok(())
    }

    /// The commit-relevant descriptor of `id`: a loaded, persistent BAT
    /// that is dirty (or part of a subcommit), or the bare descriptor of a
    /// swapped-out dirty BAT. A BAT created in the running transaction has
    /// its heap modes reconciled first; a mode it cannot honour fails the
    /// commit.
    fn dirty_bat(&self, id: BatId, subcommit: bool) -> Result<Option<Arc<BatDesc>>> {
        if !self.check(id) {
            return Ok(None);
        }
        self.spin(id, BBPSAVING);
        let slot = self.arena.slot(id);
        if slot.status() & BBPLOADED != 0 {
            if let Some(desc) = slot.desc.lock().clone() {
                if slot.status() & BBPNEW != 0 {
                    desc.lock()
                        .check_modes()
                        .wrap_err_with(|| format!("invalid heap modes for bat {id}"))?;
                }
                if slot.status() & BBPPERSISTENT != 0 && (subcommit || desc.lock().dirty()) {
                    return Ok(Some(desc));
                }
            }
        } else if slot.status() & BBPSWAPPED != 0 {
            let desc = self.quickdesc(id);
            if subcommit {
                return Ok(desc);
            }
        }
        Ok(None)
    }

    /// Commits the persistent state: all persistent BATs for a full
    /// commit, or exactly the given (ascending) ids for a subcommit, with
    /// optional per-BAT committed row counts. On success the new `logno`
    /// and `transid` are the pool's.
    pub fn sync(
        &self,
        subcommit: Option<&[BatId]>,
        sizes: Option<&[u64]>,
        logno: i64,
        transid: i64,
    ) -> Result<()> {
        let lock = self.should_lock();
        let _tm = lock.then(|| self.tm_lock.lock());
        let is_sub = subcommit.is_some();
        let ids: Vec<BatId> = match subcommit {
            Some(s) => {
                debug_assert!(s.windows(2).all(|w| w[0] < w[1]), "subcommit ids not ascending");
                s.to_vec()
            }
            None => (1..self.size()).collect(),
        };

        let mut ret = self.prepare(is_sub);

        // PHASE 1: safeguard everything in the backup dir
        if ret.is_ok() {
            'phase1: for &i in &ids {
                let slot = match self.arena.get(i) {
                    Some(s) => s,
                    None => continue,
                };
                let mut guard = lock.then(|| self.swap_lock(i).lock());
                // between moving the heap aside and saving the new
                // version the heap may not exist in its usual location
                slot.status_on(BBPSYNCING);
                while slot.status() & BBPUNLOADING != 0 {
                    guard = None;
                    self.spin(i, BBPUNLOADING);
                    if lock {
                        guard = Some(self.swap_lock(i).lock());
                    }
                }
                let b = match self.dirty_bat(i, is_sub) {
                    Ok(b) => b,
                    Err(e) => {
                        drop(guard);
                        ret = Err(e);
                        break 'phase1;
                    }
                };
                if slot.status() & BBPEXISTING != 0 {
                    if let Some(b) = b {
                        if b.lock().inserted > 0 && self.backup(&b, is_sub).is_err() {
                            drop(guard);
                            ret = Err(eyre!("backup of bat {i} failed"));
                            break 'phase1;
                        }
                    }
                } else if is_sub && slot.status() & BBPDELETED != 0 {
                    // a deleted bat's earlier backups belong to this
                    // subcommit
                    if let Some(desc) = slot.desc.lock().clone() {
                        let inner = desc.lock();
                        let o = format!("{i:o}");
                        let tail = tail_extension(inner.ttype, inner.width);
                        let farm = inner.theap.as_ref().map(|h| h.farm_id).unwrap_or(0);
                        for ext in [tail.as_str(), "theap"] {
                            if self.farms.file_exists(farm, BAKDIR, &o, Some(ext)) {
                                let _ = self.file_move(farm, BAKDIR, SUBDIR, &o, Some(ext));
                            }
                        }
                    }
                }
                drop(guard);
            }
        }

        // PHASE 2: save the repository and write the new BBP.dir
        let mut writer = None;
        if ret.is_ok() {
            match DirWriter::first(self, is_sub, logno, transid) {
                Ok(w) => writer = Some(w),
                Err(e) => ret = Err(e),
            }
        }
        if let Some(writer) = writer.as_mut() {
            for (idx, &i) in ids.iter().enumerate() {
                if ret.is_err() {
                    break;
                }
                let slot = match self.arena.get(i) {
                    Some(s) => s,
                    None => continue,
                };
                let mut entry = None;
                if slot.status() & BBPPERSISTENT != 0 {
                    let b = match self.dirty_bat(i, is_sub) {
                        Ok(b) => b,
                        Err(e) => {
                            ret = Err(e);
                            break;
                        }
                    };
                    let desc = slot.desc.lock().clone();
                    if let Some(desc) = desc {
                        let size = {
                            let mut inner = desc.lock();
                            let size = sizes
                                .and_then(|s| s.get(idx).copied())
                                .unwrap_or(u64::MAX)
                                .min(inner.count);
                            debug_assert!(
                                inner.width == 0
                                    || inner.theap.is_none()
                                    || ((size as usize) << inner.shift)
                                        <= inner.theap.as_ref().unwrap().free
                                    || inner.theap.as_ref().unwrap().dirty
                            );
                            inner.inserted = size;
                            size
                        };
                        if size > 0 {
                            if let Some(b) = b.filter(|_| slot.status() & BBPLOADED != 0) {
                                // wait for a competing save or unload, then
                                // claim the SAVING bit ourselves
                                loop {
                                    let guard = lock.then(|| self.swap_lock(i).lock());
                                    if slot.status() & (BBPSAVING | BBPUNLOADING) == 0 {
                                        slot.status_on(BBPSAVING);
                                        drop(guard);
                                        break;
                                    }
                                    drop(guard);
                                    self.spin(i, BBPSAVING | BBPUNLOADING);
                                }
                                let res = b.lock().save(&self.farms, size);
                                slot.status_off(BBPSAVING);
                                if let Err(e) = res {
                                    ret = Err(e);
                                }
                            }
                        }
                        if ret.is_ok() {
                            match self.format_entry(i, size) {
                                Ok(e) => entry = Some(e),
                                Err(e) => ret = Err(e),
                            }
                        }
                    }
                }
                if ret.is_ok() {
                    if let Err(e) = writer.step(i, entry.as_deref()) {
                        ret = Err(e);
                    }
                }
            }
        }
        if ret.is_ok() {
            if let Some(writer) = writer.take() {
                ret = writer.last();
            }
        }

        if ret.is_ok() {
            // the atomic switchover: this rename decides the commit; a
            // subcommit publishes its nested staging dir, leaving BACKUP/
            let stagedir = self.farms.dir(0, if is_sub { SUBDIR } else { BAKDIR });
            let deldir = self.farms.dir(0, DELDIR);
            let renamed = fs::rename(&stagedir, &deldir).or_else(|_| {
                // maybe an old DELETE_ME was in the way
                self.farms.remove_dir(0, DELDIR)?;
                fs::rename(&stagedir, &deldir).wrap_err_with(|| {
                    format!("rename({}, {}) failed", stagedir.display(), deldir.display())
                })
            });
            if let Err(e) = renamed {
                ret = Err(e);
            }
            debug!(ok = ret.is_ok(), "publish rename");
        }

        // AFTERMATH
        if ret.is_ok() {
            self.set_info(logno, transid);
            // committed bats now have a disk image: the next commit must
            // stage their files before overwriting them
            for &i in &ids {
                if let Some(slot) = self.arena.get(i) {
                    if slot.status() & BBPPERSISTENT != 0 {
                        slot.status_on(BBPEXISTING);
                    }
                    slot.status_off(BBPNEW | BBPSWAPPED | BBPDELETED | BBPRENAMED);
                }
            }
            {
                let mut counters = self.backup.lock();
                counters.files = if is_sub {
                    counters.files - counters.subdir
                } else {
                    0
                };
                counters.dir = 0;
                counters.subdir = 0;
            }
            if let Err(e) = self.farms.remove_dir(0, DELDIR) {
                warn!(error = %e, "cannot remove DELETE_ME directory");
            }
            // (try to) set up a fresh BACKUP/ for the next commit
            let _ = self.prepare(false);
            let mut counters = self.backup.lock();
            if counters.files > 1 {
                counters.files = 1;
            }
        }

        // turn SYNCING off for all bats, even when things went wrong
        for &i in &ids {
            if let Some(slot) = self.arena.get(i) {
                slot.status_off(BBPSYNCING);
            }
        }
        ret
    }
}
