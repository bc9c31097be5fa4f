//! # Farm Registry
//!
//! A *farm* is a storage root on disk associated with a role mask. The
//! persistent farm holds the committed database (the `bat/` tree with
//! `BBP.dir` inside); additional farms can be registered for transient
//! spill space before the pool is initialised.
//!
//! The registry also centralizes path construction: every on-disk file the
//! pool touches is addressed as `(farm, subdir, name, extension)` and
//! resolved here, so the commit and recovery code never concatenates paths
//! by hand.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};

use crate::config::{BAKDIR, BATDIR, MAX_FARMS};

/// Storage role of a BAT, also used as a bit position in a farm role mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmRole {
    Persistent = 0,
    Transient = 1,
}

impl FarmRole {
    pub fn bit(self) -> u32 {
        1u32 << (self as u32)
    }
}

#[derive(Debug, Clone)]
pub struct Farm {
    pub dirname: PathBuf,
    pub roles: u32,
}

/// The set of registered farms. Mutable only before the pool starts; the
/// pool owns a frozen copy afterwards.
#[derive(Debug, Default, Clone)]
pub struct Farms {
    farms: Vec<Farm>,
}

impl Farms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a storage root. The first farm must carry the persistent
    /// role; later farms must not look like an existing database of their
    /// own. Registering the same directory twice is allowed and shares the
    /// farm.
    pub fn add(&mut self, dirname: impl AsRef<Path>, rolemask: u32) -> Result<usize> {
        let dirname = dirname.as_ref();
        ensure!(
            !dirname.to_string_lossy().contains('\n'),
            "no newline allowed in farm directory name"
        );
        ensure!(rolemask != 0, "bad rolemask");
        if rolemask & FarmRole::Persistent.bit() != 0 && !self.farms.is_empty() {
            bail!("bad rolemask: persistent farm already registered");
        }
        if self.farms.is_empty() {
            ensure!(
                rolemask & FarmRole::Persistent.bit() != 0,
                "first farm must be persistent"
            );
        }
        ensure!(self.farms.len() < MAX_FARMS, "too many farms");

        match fs::create_dir(dirname) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                ensure!(dirname.is_dir(), "{}: not a directory", dirname.display());
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("{}: cannot create directory", dirname.display()));
            }
        }

        let idx = self.farms.len();
        let duplicate = self.farms.iter().any(|f| f.dirname == dirname);
        if rolemask & FarmRole::Persistent.bit() == 0 && !duplicate {
            // an extra farm must not hold a BBP.dir that belongs to an
            // existing database
            for dir in [BATDIR, BAKDIR] {
                let bbpdir = dirname.join(dir).join("BBP.dir");
                ensure!(
                    !bbpdir.exists(),
                    "{} is a database",
                    dirname.display()
                );
            }
        }
        self.farms.push(Farm {
            dirname: dirname.to_path_buf(),
            roles: rolemask,
        });
        Ok(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.farms.is_empty()
    }

    pub fn get(&self, farm_id: usize) -> Option<&Farm> {
        self.farms.get(farm_id)
    }

    /// First farm whose role mask covers the given role.
    pub fn select(&self, role: FarmRole) -> Option<usize> {
        self.farms.iter().position(|f| f.roles & role.bit() != 0)
    }

    /// Farms with distinct directories, for per-directory passes like the
    /// startup disk scan.
    pub fn distinct(&self) -> impl Iterator<Item = (usize, &Farm)> {
        self.farms
            .iter()
            .enumerate()
            .filter(|(i, f)| !self.farms[..*i].iter().any(|g| g.dirname == f.dirname))
    }

    /// Resolves `(farm, subdir, name, ext)` to an absolute path.
    pub fn path(&self, farm_id: usize, dir: &str, name: &str, ext: Option<&str>) -> PathBuf {
        let mut p = self.farms[farm_id].dirname.join(dir);
        match ext {
            Some(ext) => p.push(format!("{name}.{ext}")),
            None => p.push(name),
        }
        p
    }

    /// Directory path within a farm.
    pub fn dir(&self, farm_id: usize, dir: &str) -> PathBuf {
        self.farms[farm_id].dirname.join(dir)
    }

    pub fn file_exists(&self, farm_id: usize, dir: &str, name: &str, ext: Option<&str>) -> bool {
        self.path(farm_id, dir, name, ext).is_file()
    }

    /// Renames a file between two subdirs of a farm. Fails without touching
    /// anything when the source does not exist.
    pub fn move_file(
        &self,
        farm_id: usize,
        srcdir: &str,
        dstdir: &str,
        name: &str,
        ext: Option<&str>,
    ) -> Result<()> {
        let src = self.path(farm_id, srcdir, name, ext);
        let dst = self.path(farm_id, dstdir, name, ext);
        fs::rename(&src, &dst)
            .wrap_err_with(|| format!("cannot move {} to {}", src.display(), dst.display()))
    }

    /// Removes a directory tree; missing trees are fine.
    pub fn remove_dir(&self, farm_id: usize, dir: &str) -> Result<()> {
        let p = self.dir(farm_id, dir);
        match fs::remove_dir_all(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrap_err_with(|| format!("cannot remove directory {}", p.display())),
        }
    }
}

/// Creates the parent directory chain of a file path.
pub fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("cannot create directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_farm_must_be_persistent() {
        let dir = tempdir().unwrap();
        let mut farms = Farms::new();
        assert!(farms
            .add(dir.path().join("f"), FarmRole::Transient.bit())
            .is_err());
        assert!(farms
            .add(dir.path().join("f"), FarmRole::Persistent.bit())
            .is_ok());
    }

    #[test]
    fn second_persistent_farm_is_rejected() {
        let dir = tempdir().unwrap();
        let mut farms = Farms::new();
        farms
            .add(dir.path().join("a"), FarmRole::Persistent.bit())
            .unwrap();
        assert!(farms
            .add(dir.path().join("b"), FarmRole::Persistent.bit())
            .is_err());
    }

    #[test]
    fn extra_farm_must_not_be_a_database() {
        let dir = tempdir().unwrap();
        let mut farms = Farms::new();
        farms
            .add(dir.path().join("a"), FarmRole::Persistent.bit())
            .unwrap();

        let foreign = dir.path().join("b");
        fs::create_dir_all(foreign.join(BATDIR)).unwrap();
        fs::write(foreign.join(BATDIR).join("BBP.dir"), b"x").unwrap();
        assert!(farms.add(&foreign, FarmRole::Transient.bit()).is_err());
    }

    #[test]
    fn select_prefers_first_matching_farm() {
        let dir = tempdir().unwrap();
        let mut farms = Farms::new();
        farms
            .add(
                dir.path().join("a"),
                FarmRole::Persistent.bit() | FarmRole::Transient.bit(),
            )
            .unwrap();
        farms
            .add(dir.path().join("b"), FarmRole::Transient.bit())
            .unwrap();
        assert_eq!(farms.select(FarmRole::Persistent), Some(0));
        assert_eq!(farms.select(FarmRole::Transient), Some(0));
    }

    #[test]
    fn path_resolution() {
        let dir = tempdir().unwrap();
        let mut farms = Farms::new();
        farms
            .add(dir.path().join("a"), FarmRole::Persistent.bit())
            .unwrap();
        let p = farms.path(0, BATDIR, "07/0745", Some("tail"));
        assert!(p.ends_with("a/bat/07/0745.tail"));
    }
}
