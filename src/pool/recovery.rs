//! # Recovery
//!
//! Startup undoes whatever an interrupted commit left behind. The rules
//! are mechanical:
//!
//! - `TEMP/` and `DELETE_ME/` are removed unconditionally;
//! - `BACKUP/SUBCOMMIT/` contents move up into `BACKUP/`;
//! - a `BBP.dir` inside `BACKUP/` wins over the one in the data directory;
//! - every other file in `BACKUP/` moves back to its id-derived subdir,
//!   `.kill` markers delete their half-written `.new` companion instead;
//! - files that belong to no known BAT are quarantined in `LEFT/`.
//!
//! Running recovery twice has the same effect as once: it only moves files
//! out of the staging directory, and an empty staging directory is a
//! no-op.
//!
//! The disk scan that follows walks the whole data tree and deletes files
//! that cannot belong to a persistent BAT. Unknown file names stop the
//! scan of their directory; the policy is "never guess".

use std::fs;
use std::path::Path;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use tracing::{debug, warn};

use crate::atom::{TYPE_STR, TYPE_VOID};
use crate::bat::BatId;
use crate::config::{BAKDIR, BATDIR, GDK_VERSION_TAILN, LEFTDIR, SUBDIR};
use crate::pool::slots::subdir;
use crate::pool::{BackupCounters, BatPool};

/// Leading octal digits of a file stem, 0 when there are none.
fn octal_prefix(stem: &str) -> BatId {
    let digits: String = stem.chars().take_while(|c| ('0'..='7').contains(c)).collect();
    if digits.is_empty() {
        0
    } else {
        BatId::from_str_radix(&digits, 8).unwrap_or(0)
    }
}

impl BatPool {
    /// Finds (or creates) the directory file to boot from. A `BBP.dir`
    /// inside `BACKUP/` takes precedence; a `BBP.bak` is the fallback of
    /// last resort.
    pub(crate) fn locate_dir_file(&self) -> Result<fs::File> {
        let bbpdir = self.farms.path(0, BATDIR, "BBP", Some("dir"));
        let backup = self.farms.path(0, BAKDIR, "BBP", Some("dir"));

        if backup.is_file() {
            // the backup exists; we *must* use it
            self.recover_dir(0, bbpdir.is_file())?;
        } else if !bbpdir.is_file() {
            let bak = self.farms.path(0, BATDIR, "BBP", Some("bak"));
            if bak.is_file() {
                fs::rename(&bak, &bbpdir)?;
                debug!("reverting to dir saved in BBP.bak");
            } else {
                debug!("initializing BBP");
                self.dir_init()?;
            }
        }
        fs::File::open(&bbpdir)
            .wrap_err_with(|| format!("cannot open BBP.dir at {}", bbpdir.display()))
    }

    /// Installs `BACKUP/BBP.dir` as the directory file, moving a current
    /// one aside to `BBP.bak` first.
    pub(crate) fn recover_dir(&self, farm_id: usize, direxists: bool) -> Result<()> {
        let dir = self.farms.path(farm_id, BATDIR, "BBP", Some("dir"));
        let bak = self.farms.path(farm_id, BATDIR, "BBP", Some("bak"));
        if direxists {
            // just try; these files are not vital
            match fs::remove_file(&bak) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(error = %e, "unlink of BBP.bak failed"),
            }
            if let Err(e) = fs::rename(&dir, &bak) {
                warn!(error = %e, "rename of BBP.dir to BBP.bak failed");
            }
        }
        self.farms
            .move_file(farm_id, BAKDIR, BATDIR, "BBP", Some("dir"))
    }

    /// Moves a staged file back to its destination, handling kill markers
    /// and occupied destinations.
    fn force_move(&self, farm_id: usize, srcdir: &str, dstdir: &str, name: &str) -> Result<()> {
        if let Some(target) = name.strip_suffix(".kill") {
            // found an X.new.kill marker: remove the X.new it protects
            // against, then the marker itself
            let dst = self.farms.path(farm_id, dstdir, target, None);
            match fs::remove_file(&dst) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).wrap_err_with(|| format!("force_move: remove {}", dst.display()));
                }
            }
            // the marker must go too, or recovery never finishes
            let marker = self.farms.path(farm_id, srcdir, name, None);
            return fs::remove_file(&marker)
                .wrap_err_with(|| format!("force_move: remove {}", marker.display()));
        }

        if self.farms.move_file(farm_id, srcdir, dstdir, name, None).is_ok() {
            return Ok(());
        }
        // two legal causes: destination occupied, or its directory missing
        let dst = self.farms.path(farm_id, dstdir, name, None);
        let _ = fs::remove_file(&dst);
        crate::farm::create_parent(&dst)?;
        self.farms.move_file(farm_id, srcdir, dstdir, name, None)
    }

    /// Rolls an interrupted commit back by moving every file in `BACKUP/`
    /// to where it belongs. Incremental: a failure leaves the remaining
    /// files staged for a later attempt.
    pub(crate) fn recover(&self, farm_id: usize) -> Result<()> {
        let bakdir = self.farms.dir(farm_id, BAKDIR);
        let entries = match fs::read_dir(&bakdir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()), // nothing to do
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("cannot open directory {}", bakdir.display()));
            }
        };
        let leftdir = self.farms.dir(farm_id, LEFTDIR);
        fs::create_dir_all(&leftdir)
            .wrap_err_with(|| format!("cannot create directory {}", leftdir.display()))?;
        debug!("recovery start");

        let mut ret = Ok(());
        let mut dirseen = false;
        for dent in entries {
            let dent = dent?;
            let name = dent.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                let _ = fs::remove_file(dent.path());
                continue;
            }
            if name == "BBP.dir" {
                dirseen = true;
                continue;
            }
            let stem = name.split('.').next().unwrap_or(&name);
            let id = if stem.starts_with(|c: char| c.is_ascii_digit()) {
                octal_prefix(stem)
            } else {
                self.find(stem, true)
            };
            if id == 0 || id >= self.size() || !self.check(id) {
                let _ = self.force_move(farm_id, BAKDIR, LEFTDIR, &name);
            } else {
                let sub = subdir(id);
                let dstdir = if sub.is_empty() {
                    BATDIR.to_string()
                } else {
                    format!("{BATDIR}/{sub}")
                };
                if self.force_move(farm_id, BAKDIR, &dstdir, &name).is_err() {
                    ret = Err(eyre!("recovery failed"));
                }
            }
        }
        if dirseen && ret.is_ok() {
            // we have a saved BBP.dir; it must be moved back
            let dir = self.farms.path(farm_id, BATDIR, "BBP", Some("dir"));
            ret = self.recover_dir(farm_id, dir.is_file());
        }

        if ret.is_ok() {
            fs::remove_dir(&bakdir)
                .wrap_err_with(|| format!("cannot remove directory {}", bakdir.display()))?;
        }
        debug!("recovery end");
        ret
    }

    /// Moves everything in `BACKUP/SUBCOMMIT/` up into `BACKUP/`.
    pub(crate) fn recover_subdir(&self) -> Result<()> {
        let mut counters = self.backup.lock();
        self.recover_subdir_with(&mut counters)
    }

    pub(crate) fn recover_subdir_with(&self, counters: &mut BackupCounters) -> Result<()> {
        let subdirpath = self.farms.dir(0, SUBDIR);
        let entries = match fs::read_dir(&subdirpath) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()), // nothing to do
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("cannot open directory {}", subdirpath.display()));
            }
        };
        debug!("subdir recovery start");
        for dent in entries {
            let dent = dent?;
            let name = dent.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            self.farms.move_file(0, SUBDIR, BAKDIR, &name, None)?;
            if name == "BBP.dir" {
                counters.dir = 1;
            }
        }
        self.farms.remove_dir(0, SUBDIR)?;
        if counters.dir == 2 {
            debug!("BBP.dir in SUBCOMMIT had disappeared");
            counters.dir = 0;
        }
        debug!("subdir recovery end");
        Ok(())
    }

    // ------------------------------------------------------------------
    // post-recovery verification
    // ------------------------------------------------------------------

    /// Verifies that the files of every persistent BAT exist and are large
    /// enough. With an old-version directory, a narrow string offset heap
    /// may still live under its unwidthed `.tail` name.
    pub(crate) fn check_bats(&self, version: u32) -> Result<()> {
        for bid in 1..self.size() {
            let desc = match self.arena.slot(bid).desc.lock().clone() {
                Some(d) => d,
                None => continue,
            };
            let inner = desc.lock();
            if inner.ttype == TYPE_VOID {
                continue; // no files needed
            }
            if let Some(h) = inner.theap.as_ref().filter(|h| h.free > 0) {
                let path = self.farms.path(0, BATDIR, &h.filename, None);
                let meta = match fs::metadata(&path) {
                    Ok(m) => m,
                    Err(_)
                        if version <= GDK_VERSION_TAILN
                            && inner.ttype == TYPE_STR
                            && inner.width < 8 =>
                    {
                        // pre-rename databases keep the offsets in .tail
                        let legacy = path.with_extension("tail");
                        fs::metadata(&legacy).wrap_err_with(|| {
                            format!(
                                "cannot stat file {} or {} (expected size {})",
                                path.display(),
                                legacy.display(),
                                h.free
                            )
                        })?
                    }
                    Err(e) => {
                        return Err(e).wrap_err_with(|| {
                            format!(
                                "cannot stat file {} (expected size {})",
                                path.display(),
                                h.free
                            )
                        });
                    }
                };
                ensure!(
                    meta.len() as usize >= h.free,
                    "file {} too small (expected {}, actual {})",
                    path.display(),
                    h.free,
                    meta.len()
                );
            }
            if let Some(h) = inner.tvheap.as_ref().filter(|h| h.free > 0) {
                let path = self.farms.path(0, BATDIR, &h.filename, None);
                let meta = fs::metadata(&path)
                    .wrap_err_with(|| format!("cannot stat file {}", path.display()))?;
                ensure!(
                    meta.len() as usize >= h.free,
                    "file {} too small (expected {}, actual {})",
                    path.display(),
                    h.free,
                    meta.len()
                );
            }
        }
        Ok(())
    }

    /// Renames the string offset heaps of narrow string BATs from the old
    /// `.tail` name to the width-carrying one. Nothing is lost if this
    /// fails: the next startup just tries again.
    pub(crate) fn move_string_bats(&self) -> Result<()> {
        for bid in 1..self.size() {
            let desc = match self.arena.slot(bid).desc.lock().clone() {
                Some(d) => d,
                None => continue,
            };
            let inner = desc.lock();
            if inner.ttype != TYPE_STR || inner.width == 8 || inner.count == 0 {
                continue;
            }
            let new_name = match inner.theap.as_ref() {
                Some(h) => h.filename.clone(),
                None => continue,
            };
            let physical = self
                .arena
                .slot(bid)
                .physical
                .get()
                .cloned()
                .unwrap_or_default();
            let old = self.farms.path(0, BATDIR, &format!("{physical}.tail"), None);
            let new = self.farms.path(0, BATDIR, &new_name, None);
            let old_exists = old.is_file();
            let new_exists = new.is_file();
            if new_exists {
                if old_exists {
                    let old_m = fs::metadata(&old)?.modified()?;
                    let new_m = fs::metadata(&new)?.modified()?;
                    if old_m > new_m {
                        bail!(
                            "both {} and {} exist with {} unexpectedly newer: \
                             manual intervention required",
                            old.display(),
                            new.display(),
                            old.display()
                        );
                    }
                    warn!(old = %old.display(), new = %new.display(), "removing old offset heap");
                    fs::remove_file(&old)?;
                }
            } else if old_exists {
                debug!(old = %old.display(), new = %new.display(), "rename offset heap");
                fs::rename(&old, &new)?;
            }
            // neither file: may be fine, checked elsewhere
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // disk scan
    // ------------------------------------------------------------------

    fn persistent_bat(&self, bid: BatId) -> bool {
        if !self.check(bid) {
            return false;
        }
        match self.arena.slot(bid).desc.lock().as_ref() {
            Some(desc) => {
                self.arena.slot(bid).status() & crate::pool::slots::BBPLOADED == 0
                    || desc.lock().copied_to_disk
            }
            None => false,
        }
    }

    fn getdesc(&self, bid: BatId) -> Option<std::sync::Arc<crate::bat::BatDesc>> {
        if bid == 0 || !self.check(bid) {
            return None;
        }
        self.arena.slot(bid).desc.lock().clone()
    }

    /// Deletes leftovers under the data root: files that cannot belong to
    /// a persistent, valid BAT. An unrecognised name stops the scan of its
    /// directory and is preserved.
    pub(crate) fn disk_scan(&self, farm_id: usize) -> Result<()> {
        let root = self.farms.dir(farm_id, BATDIR);
        self.disk_scan_dir(farm_id, &root, &root);
        Ok(())
    }

    /// Returns false when `parent` was a scannable directory.
    fn disk_scan_dir(&self, farm_id: usize, root: &Path, parent: &Path) -> bool {
        let entries = match fs::read_dir(parent) {
            Ok(e) => e,
            Err(_) => return true, // nothing to do
        };
        for dent in entries.flatten() {
            let name = dent.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let rel = parent.strip_prefix(root).unwrap_or(Path::new(""));
            if name.starts_with("BBP.") {
                // manifest files live in the data root and the staging
                // dirs; leave them alone there
                let reldir = rel.to_string_lossy();
                if reldir.is_empty() || reldir == "BACKUP" || reldir == "BACKUP/SUBCOMMIT" {
                    continue;
                }
            }
            let full = dent.path();
            let dot = name.find('.');
            if dot.is_none() && !self.disk_scan_dir(farm_id, root, &full) {
                continue; // it was a directory
            }

            let (mut ok, mut delete);
            let ext = dot.map(|d| &name[d + 1..]);
            if ext == Some("tmp") {
                ok = true;
                delete = true;
            } else {
                let bid = octal_prefix(&name);
                ok = dot.is_some() && bid != 0;
                delete = false;
                let ext = ext.unwrap_or("");
                if !ok || !self.persistent_bat(bid) {
                    delete = true;
                } else if ext.starts_with("tail") {
                    match self.getdesc(bid) {
                        None => delete = true,
                        Some(desc) => {
                            let inner = desc.lock();
                            if inner.ttype == TYPE_VOID || !inner.copied_to_disk {
                                delete = true;
                            } else if inner.ttype == TYPE_STR {
                                let expect = match inner.width {
                                    1 => "tail1",
                                    2 => "tail2",
                                    4 => "tail4",
                                    _ => "tail",
                                };
                                delete = ext != expect;
                            } else {
                                delete = ext != "tail";
                            }
                        }
                    }
                } else if ext.starts_with("theap") {
                    delete = match self.getdesc(bid) {
                        None => true,
                        Some(desc) => {
                            let inner = desc.lock();
                            inner.tvheap.is_none() || !inner.copied_to_disk
                        }
                    };
                } else if ext.starts_with("thashl") || ext.starts_with("thashb") {
                    delete = self.getdesc(bid).is_none();
                } else if ext.starts_with("thash") || ext.starts_with("thsh") {
                    // hash files of older versions; never reused
                    delete = true;
                } else if ext.starts_with("timprints") {
                    delete = self.getdesc(bid).is_none();
                } else if ext.starts_with("torderidx") {
                    delete = self.getdesc(bid).is_none();
                } else if !ext.starts_with("new") {
                    ok = false;
                }
            }
            if !ok {
                // found an unknown file; stop pruning in this subdir
                warn!(file = %name, dir = %parent.display(), "unexpected file, leaving directory");
                break;
            }
            if delete {
                match fs::remove_file(&full) {
                    Ok(()) => debug!(file = %full.display(), "removed leftover"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(file = %full.display(), error = %e, "remove failed"),
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_prefix_parsing() {
        assert_eq!(octal_prefix("745"), 0o745);
        assert_eq!(octal_prefix("10"), 0o10);
        assert_eq!(octal_prefix("BBP"), 0);
        assert_eq!(octal_prefix("9"), 0);
        assert_eq!(octal_prefix(""), 0);
    }
}
