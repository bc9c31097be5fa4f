//! # Heaps
//!
//! A heap is the byte payload of one BAT column: either the fixed-width
//! tail, the variable-sized value area (`.theap`), or an accelerator file.
//! The pool tracks heap *metadata* (recorded byte count, allocated size,
//! storage mode, dirty flag) even while the payload itself is not resident;
//! residency comes and goes with BAT load/unload.
//!
//! ## Storage modes
//!
//! - `Mem`: payload is read into an owned buffer; save rewrites the file in
//!   place (the commit protocol has already moved the old image aside).
//! - `Mmap`: clean payloads are memory-mapped straight from the file.
//! - `Priv`: copy-on-write; save writes a `<name>.new` sibling which the
//!   commit publish step swings into place. A half-written `.new` left by a
//!   crash is removed by recovery via a kill marker.
//!
//! Dirtying a mapped heap converts it to an owned buffer first; the file
//! underneath stays the committed image until save.

use std::fs;
use std::io::Write;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;

use crate::config::BATDIR;
use crate::farm::{create_parent, Farms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Mem,
    Mmap,
    Priv,
    Invalid,
}

pub enum HeapBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl HeapBytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            HeapBytes::Mapped(m) => m,
            HeapBytes::Owned(v) => v,
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

impl std::fmt::Debug for HeapBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeapBytes::Mapped(m) => write!(f, "Mapped({} bytes)", m.len()),
            HeapBytes::Owned(v) => write!(f, "Owned({} bytes)", v.len()),
        }
    }
}

#[derive(Debug)]
pub struct Heap {
    pub farm_id: usize,
    /// Id of the BAT whose slot owns this heap.
    pub parent_id: u32,
    /// File name relative to the farm's `bat/` directory, extension
    /// included (e.g. `07/0745.tail1`).
    pub filename: String,
    /// Bytes in use; authoritative even when not resident.
    pub free: usize,
    /// Allocated/announced size in bytes; `free <= size`.
    pub size: usize,
    pub storage: StorageMode,
    pub newstorage: StorageMode,
    pub dirty: bool,
    /// True when the heap had no committed bytes at the last commit point.
    pub wasempty: bool,
    /// Legacy flag carried through from old directory versions: the
    /// variable heap still embeds per-value hashes.
    pub hashash: bool,
    base: Option<HeapBytes>,
}

impl Heap {
    pub fn new(farm_id: usize, parent_id: u32, filename: String) -> Self {
        Self {
            farm_id,
            parent_id,
            filename,
            free: 0,
            size: 0,
            storage: StorageMode::Mem,
            newstorage: StorageMode::Mem,
            dirty: false,
            wasempty: true,
            hashash: false,
            base: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.base.is_some()
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.base.as_ref().map(|b| b.as_slice())
    }

    /// Materialises the payload from the heap file. Empty heaps become an
    /// empty owned buffer without touching the filesystem.
    pub fn load(&mut self, farms: &Farms) -> Result<()> {
        if self.base.is_some() {
            return Ok(());
        }
        if self.free == 0 {
            self.base = Some(HeapBytes::Owned(Vec::new()));
            return Ok(());
        }
        let path = farms.path(self.farm_id, BATDIR, &self.filename, None);
        let file = fs::File::open(&path)
            .wrap_err_with(|| format!("cannot open heap file {}", path.display()))?;
        let meta = file.metadata()?;
        ensure!(
            meta.len() as usize >= self.free,
            "heap file {} too small (expected {}, actual {})",
            path.display(),
            self.free,
            meta.len()
        );
        let bytes = match self.storage {
            StorageMode::Mmap => {
                // SAFETY: the committed image is never rewritten in place;
                // updates go through an owned buffer and the commit
                // protocol replaces the file wholesale.
                let map = unsafe { Mmap::map(&file) }
                    .wrap_err_with(|| format!("cannot map heap file {}", path.display()))?;
                HeapBytes::Mapped(map)
            }
            _ => {
                let mut buf = fs::read(&path)
                    .wrap_err_with(|| format!("cannot read heap file {}", path.display()))?;
                buf.truncate(self.free);
                HeapBytes::Owned(buf)
            }
        };
        self.base = Some(bytes);
        Ok(())
    }

    /// Drops the resident payload, keeping the metadata.
    pub fn unload(&mut self) {
        self.base = None;
    }

    /// Number of resident bytes, for VM accounting.
    pub fn resident_bytes(&self) -> usize {
        self.base.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    fn make_owned(&mut self, farms: &Farms) -> Result<&mut Vec<u8>> {
        if self.base.is_none() {
            self.load(farms)?;
        }
        if matches!(self.base, Some(HeapBytes::Mapped(_))) {
            if let Some(HeapBytes::Mapped(m)) = self.base.take() {
                self.base = Some(HeapBytes::Owned(m.to_vec()));
            }
        }
        match self.base.as_mut() {
            Some(HeapBytes::Owned(v)) => Ok(v),
            _ => unreachable!("heap payload just converted to owned"),
        }
    }

    /// Appends raw bytes, marking the heap dirty. The caller is the single
    /// writer of this BAT.
    pub fn append(&mut self, farms: &Farms, data: &[u8]) -> Result<()> {
        let free = self.free;
        let new_len = {
            let buf = self.make_owned(farms)?;
            buf.truncate(free);
            buf.extend_from_slice(data);
            buf.len()
        };
        self.free = new_len;
        if self.size < self.free {
            self.size = self.free;
        }
        self.dirty = true;
        Ok(())
    }

    /// Writes the first `limit` bytes of the payload to disk. `Priv` heaps
    /// write a `.new` sibling; everything else rewrites the heap file. The
    /// file is fsynced before return.
    pub fn save(&mut self, farms: &Farms, limit: usize) -> Result<()> {
        let limit = limit.min(self.free);
        let name = match self.newstorage {
            StorageMode::Priv => format!("{}.new", self.filename),
            _ => self.filename.clone(),
        };
        let path = farms.path(self.farm_id, BATDIR, &name, None);
        create_parent(&path)?;
        let empty = [];
        let data = match self.bytes() {
            Some(b) => &b[..limit.min(b.len())],
            None => &empty[..],
        };
        let mut f = fs::File::create(&path)
            .wrap_err_with(|| format!("cannot create heap file {}", path.display()))?;
        f.write_all(data)?;
        f.sync_all()
            .wrap_err_with(|| format!("cannot sync heap file {}", path.display()))?;
        self.dirty = false;
        self.wasempty = limit == 0;
        Ok(())
    }

    /// Removes the heap file and any `.new` sibling. Missing files are
    /// fine.
    pub fn delete(&self, farms: &Farms) -> Result<()> {
        for name in [self.filename.clone(), format!("{}.new", self.filename)] {
            let path = farms.path(self.farm_id, BATDIR, &name, None);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .wrap_err_with(|| format!("cannot remove {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::farm::FarmRole;
    use tempfile::tempdir;

    fn test_farms(dir: &std::path::Path) -> Farms {
        let mut farms = Farms::new();
        farms.add(dir, FarmRole::Persistent.bit()).unwrap();
        farms
    }

    #[test]
    fn heap_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let farms = test_farms(dir.path());

        let mut h = Heap::new(0, 1, "01.tail".to_string());
        h.append(&farms, &[1, 2, 3, 4]).unwrap();
        assert!(h.dirty);
        h.save(&farms, h.free).unwrap();
        assert!(!h.dirty);

        let mut h2 = Heap::new(0, 1, "01.tail".to_string());
        h2.free = 4;
        h2.load(&farms).unwrap();
        assert_eq!(h2.bytes().unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn priv_heap_saves_to_new_sibling() {
        let dir = tempdir().unwrap();
        let farms = test_farms(dir.path());

        let mut h = Heap::new(0, 1, "01.tail".to_string());
        h.newstorage = StorageMode::Priv;
        h.append(&farms, &[9, 9]).unwrap();
        h.save(&farms, h.free).unwrap();

        assert!(farms.file_exists(0, BATDIR, "01.tail", Some("new")));
        assert!(!farms.file_exists(0, BATDIR, "01", Some("tail")));
    }

    #[test]
    fn load_rejects_short_file() {
        let dir = tempdir().unwrap();
        let farms = test_farms(dir.path());

        let mut h = Heap::new(0, 1, "01.tail".to_string());
        h.append(&farms, &[1, 2]).unwrap();
        h.save(&farms, h.free).unwrap();

        let mut h2 = Heap::new(0, 1, "01.tail".to_string());
        h2.free = 100;
        assert!(h2.load(&farms).is_err());
    }

    #[test]
    fn unload_keeps_metadata() {
        let dir = tempdir().unwrap();
        let farms = test_farms(dir.path());

        let mut h = Heap::new(0, 1, "01.tail".to_string());
        h.append(&farms, &[5; 16]).unwrap();
        h.save(&farms, h.free).unwrap();
        h.unload();
        assert!(!h.is_loaded());
        assert_eq!(h.free, 16);

        h.load(&farms).unwrap();
        assert_eq!(h.bytes().unwrap().len(), 16);
    }

    #[test]
    fn delete_removes_payload_and_new() {
        let dir = tempdir().unwrap();
        let farms = test_farms(dir.path());

        let mut h = Heap::new(0, 1, "01.tail".to_string());
        h.append(&farms, &[1]).unwrap();
        h.save(&farms, h.free).unwrap();
        h.newstorage = StorageMode::Priv;
        h.append(&farms, &[2]).unwrap();
        h.save(&farms, h.free).unwrap();

        h.delete(&farms).unwrap();
        assert!(!farms.file_exists(0, BATDIR, "01", Some("tail")));
        assert!(!farms.file_exists(0, BATDIR, "01.tail", Some("new")));
    }
}
