//! # BAT Descriptors
//!
//! The descriptor is the in-memory metadata record of one BAT: element
//! type, row count and capacity, ordering properties, and the heaps that
//! carry the payload. The pool owns exactly one descriptor per occupied
//! slot, handed to callers as `Arc<BatDesc>`; payload residency is managed
//! separately through the pool's load/unload paths.
//!
//! Mutable state lives behind the descriptor's own lock (`BatDesc::lock`),
//! the per-descriptor heap lock of the locking order. The caller-enforced
//! contract is at most one writer per BAT; the lock exists so readers like
//! the commit writer see consistent metadata, not to serialise updates.

use eyre::Result;
use parking_lot::{Mutex, MutexGuard};

use crate::atom::{elmshift, AtomId, AtomRegistry, TYPE_STR, TYPE_VOID};
use crate::config::{BAT_TINY, OID_NIL};
use crate::farm::{FarmRole, Farms};
use crate::heap::{Heap, StorageMode};

pub type BatId = u32;

/// Update restriction recorded per BAT and persisted in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Write = 0,
    Read = 1,
    Append = 2,
}

impl Access {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Access::Write),
            1 => Some(Access::Read),
            2 => Some(Access::Append),
            _ => None,
        }
    }
}

/// Auxiliary hash accelerator. The pool only cares that a dirty one is
/// flushed alongside its BAT; building and probing it belongs to the index
/// layer.
#[derive(Debug, Default)]
pub struct AccelHash {
    pub dirty: bool,
    pub link: Vec<u8>,
    pub buckets: Vec<u8>,
}

impl AccelHash {
    /// Writes the two hash heap files next to the BAT's payload files.
    pub fn save(
        &mut self,
        farms: &Farms,
        farm_id: usize,
        physical: &str,
        persistent: bool,
    ) -> Result<()> {
        use crate::config::BATDIR;
        use crate::farm::create_parent;
        use std::io::Write;

        for (ext, data) in [("thashl", &self.link), ("thashb", &self.buckets)] {
            let path = farms.path(farm_id, BATDIR, physical, Some(ext));
            create_parent(&path)?;
            let mut f = std::fs::File::create(&path)?;
            f.write_all(data)?;
            if persistent {
                f.sync_all()?;
            }
        }
        self.dirty = false;
        Ok(())
    }
}

/// Extension of the tail heap file. String BATs with narrow offsets carry
/// the width in the name so that readers know the element size without
/// consulting the directory.
pub fn tail_extension(ttype: AtomId, width: u16) -> String {
    if ttype == TYPE_STR && width < 8 {
        format!("tail{width}")
    } else {
        "tail".to_string()
    }
}

#[derive(Debug)]
pub struct BatInner {
    pub ttype: AtomId,
    pub width: u16,
    pub shift: u8,
    pub varsized: bool,

    pub sorted: bool,
    pub revsorted: bool,
    pub key: bool,
    pub nonil: bool,
    pub nil: bool,
    pub nosorted: u64,
    pub norevsorted: u64,
    pub nokey: [u64; 2],

    pub seqbase: u64,
    pub hseqbase: u64,
    pub count: u64,
    pub capacity: u64,
    /// Rows present at the last commit point; `count > inserted` means the
    /// BAT carries uncommitted delta rows.
    pub inserted: u64,
    pub minpos: u64,
    pub maxpos: u64,

    pub role: FarmRole,
    pub transient: bool,
    pub restricted: Access,
    pub copied_to_disk: bool,

    pub theap: Option<Heap>,
    pub tvheap: Option<Heap>,
    /// Nonzero when the tail heap is borrowed from another BAT.
    pub view_parent: BatId,
    /// Nonzero when the variable heap is borrowed from another BAT.
    pub view_vparent: BatId,

    pub hash: Option<AccelHash>,
}

impl BatInner {
    pub fn new(ttype: AtomId, atoms: &AtomRegistry, role: FarmRole, transient: bool) -> Self {
        let width = atoms.size(ttype).unwrap_or(0);
        let varsized = atoms.varsized(ttype).unwrap_or(false);
        Self {
            ttype,
            width,
            shift: elmshift(width),
            varsized,
            sorted: ttype == TYPE_VOID,
            revsorted: ttype == TYPE_VOID,
            key: false,
            nonil: false,
            nil: false,
            nosorted: 0,
            norevsorted: 0,
            nokey: [0, 0],
            seqbase: OID_NIL,
            hseqbase: 0,
            count: 0,
            capacity: BAT_TINY,
            inserted: 0,
            minpos: OID_NIL,
            maxpos: OID_NIL,
            role,
            transient,
            restricted: Access::Write,
            copied_to_disk: false,
            theap: None,
            tvheap: None,
            view_parent: 0,
            view_vparent: 0,
            hash: None,
        }
    }

    pub fn is_view(&self) -> bool {
        self.view_parent != 0 || self.view_vparent != 0
    }

    /// Anything not yet reflected in the committed on-disk image.
    pub fn dirty(&self) -> bool {
        !self.copied_to_disk
            || self.theap.as_ref().map(|h| h.dirty).unwrap_or(false)
            || self.tvheap.as_ref().map(|h| h.dirty).unwrap_or(false)
    }

    /// Rows appended since the last commit point.
    pub fn delta_dirty(&self) -> bool {
        self.count > self.inserted
    }

    /// Storage-mode reconciliation for a BAT born in the running
    /// transaction: heaps still carrying an undecided mode get their
    /// definitive one before the first committed image is written. Fails
    /// when a heap announces a copy-on-write switch it cannot honour.
    pub fn check_modes(&mut self) -> Result<()> {
        for heap in [self.theap.as_mut(), self.tvheap.as_mut()]
            .into_iter()
            .flatten()
        {
            if heap.storage == StorageMode::Invalid {
                heap.storage = StorageMode::Mem;
            }
            if heap.newstorage == StorageMode::Invalid {
                heap.newstorage = heap.storage;
            }
            eyre::ensure!(
                heap.newstorage != StorageMode::Priv || heap.storage != StorageMode::Mmap,
                "heap {} cannot switch a shared mapping to copy-on-write",
                heap.filename
            );
        }
        Ok(())
    }

    /// True when every owned heap payload is resident.
    pub fn heaps_loaded(&self) -> bool {
        let tail = self.view_parent != 0
            || self.theap.as_ref().map(|h| h.is_loaded()).unwrap_or(true);
        let var = self.view_vparent != 0
            || self.tvheap.as_ref().map(|h| h.is_loaded()).unwrap_or(true);
        tail && var
    }

    pub fn resident_bytes(&self) -> usize {
        let mut n = 0;
        if self.view_parent == 0 {
            n += self.theap.as_ref().map(|h| h.resident_bytes()).unwrap_or(0);
        }
        if self.view_vparent == 0 {
            n += self.tvheap.as_ref().map(|h| h.resident_bytes()).unwrap_or(0);
        }
        n
    }

    /// Appends `rows` fixed-width elements to the owned tail heap. The
    /// heap's announced size stays rounded to the capacity, the same
    /// rounding the directory reader applies.
    pub fn append_tail(&mut self, farms: &Farms, data: &[u8], rows: u64) -> Result<()> {
        debug_assert_eq!(data.len() as u64, rows << self.shift);
        if let Some(h) = self.theap.as_mut() {
            h.append(farms, data)?;
        }
        self.count += rows;
        if self.capacity < self.count {
            self.capacity = self.count;
        }
        let size = (self.capacity as usize) << self.shift;
        if let Some(h) = self.theap.as_mut() {
            if h.size < size {
                h.size = size;
            }
        }
        Ok(())
    }

    /// Writes the owned heap payloads for a commit, truncated to `rows`
    /// committed rows. Views save nothing; their parents are committed in
    /// their own right.
    pub fn save(&mut self, farms: &Farms, rows: u64) -> Result<()> {
        let rows = rows.min(self.count);
        if self.view_parent == 0 {
            if let Some(h) = self.theap.as_mut() {
                let bytes = if self.width > 0 {
                    (rows as usize) << self.shift
                } else {
                    0
                };
                h.save(farms, bytes)?;
            }
        }
        if self.view_vparent == 0 {
            if let Some(h) = self.tvheap.as_mut() {
                let bytes = h.free;
                h.save(farms, bytes)?;
            }
        }
        self.copied_to_disk = true;
        Ok(())
    }

    /// Removes every file belonging to this BAT: payload heaps plus the
    /// accelerator files derived from the physical stem.
    pub fn delete_files(&self, farms: &Farms, farm_id: usize, physical: &str) -> Result<()> {
        use crate::config::BATDIR;

        if self.view_parent == 0 {
            if let Some(h) = self.theap.as_ref() {
                h.delete(farms)?;
            }
        }
        if self.view_vparent == 0 {
            if let Some(h) = self.tvheap.as_ref() {
                h.delete(farms)?;
            }
        }
        for ext in ["thashl", "thashb", "timprints", "torderidx"] {
            let path = farms.path(farm_id, BATDIR, physical, Some(ext));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

pub struct BatDesc {
    id: BatId,
    inner: Mutex<BatInner>,
}

impl BatDesc {
    pub fn new(id: BatId, inner: BatInner) -> Self {
        Self {
            id,
            inner: Mutex::new(inner),
        }
    }

    pub fn id(&self) -> BatId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, BatInner> {
        self.inner.lock()
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    pub fn is_view(&self) -> bool {
        self.inner.lock().is_view()
    }
}

impl std::fmt::Debug for BatDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatDesc").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomRegistry;

    #[test]
    fn tail_extension_by_width() {
        assert_eq!(tail_extension(TYPE_STR, 1), "tail1");
        assert_eq!(tail_extension(TYPE_STR, 2), "tail2");
        assert_eq!(tail_extension(TYPE_STR, 4), "tail4");
        assert_eq!(tail_extension(TYPE_STR, 8), "tail");
        assert_eq!(tail_extension(4, 4), "tail");
    }

    #[test]
    fn new_descriptor_defaults() {
        let atoms = AtomRegistry::new();
        let inner = BatInner::new(4, &atoms, FarmRole::Transient, true);
        assert_eq!(inner.width, 4);
        assert_eq!(inner.shift, 2);
        assert!(!inner.varsized);
        assert_eq!(inner.count, 0);
        assert_eq!(inner.capacity, BAT_TINY);
        assert!(!inner.dirty() || !inner.copied_to_disk);
        assert!(!inner.is_view());
    }

    #[test]
    fn delta_dirty_tracks_inserted() {
        let atoms = AtomRegistry::new();
        let mut inner = BatInner::new(4, &atoms, FarmRole::Persistent, false);
        inner.count = 10;
        inner.inserted = 10;
        assert!(!inner.delta_dirty());
        inner.count = 12;
        assert!(inner.delta_dirty());
    }

    #[test]
    fn check_modes_settles_undecided_heaps() {
        let atoms = AtomRegistry::new();
        let mut inner = BatInner::new(4, &atoms, FarmRole::Persistent, false);

        let mut h = Heap::new(0, 1, "1.tail".to_string());
        h.storage = StorageMode::Invalid;
        h.newstorage = StorageMode::Invalid;
        inner.theap = Some(h);
        inner.check_modes().unwrap();
        let h = inner.theap.as_ref().unwrap();
        assert_eq!(h.storage, StorageMode::Mem);
        assert_eq!(h.newstorage, StorageMode::Mem);

        // a shared mapping cannot be switched to copy-on-write
        let mut bad = Heap::new(0, 1, "1.tail".to_string());
        bad.storage = StorageMode::Mmap;
        bad.newstorage = StorageMode::Priv;
        inner.theap = Some(bad);
        assert!(inner.check_modes().is_err());
    }
}
