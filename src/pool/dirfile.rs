//! # Directory File (`BBP.dir`)
//!
//! The pool's manifest is a line-oriented text file enumerating every
//! persistent BAT and its heap metadata:
//!
//! ```text
//! BBP.dir, GDKversion <u32>
//! <pointer-size> <oid-size> <max-int-size>
//! BBPsize=<max-id-plus-one>
//! BBPinfo=<log-seqno> <tx-id>
//! <id> <status> <logical> <physical> <props> <count> <capacity> <hseqbase> \
//!     <type> <width> <var> <flags> <nokey0> <nokey1> <nosorted> <norevsorted> \
//!     <seqbase> <hfree> <hsize> 0 <minpos> <maxpos> [<vhfree> <vhsize> 0] [<options>]
//! ```
//!
//! The reader validates every line and accepts two older versions: one
//! whose heap lines carry 12 fields instead of 14 (pre min/max positions)
//! and one whose string offset heaps were still named `.tail` regardless of
//! width. Reading the latter plants a signal file that requests the rename
//! pass after the next successful commit; apart from that the reader makes
//! no disk-touching side effects.
//!
//! The writer is a merge: for subcommits it copies forward all entries of
//! the previous manifest except those the commit overwrites, preserving
//! strictly ascending id order. The final write is flush + fdatasync.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use tracing::{debug, error};

use crate::atom::{elmshift, AtomId, TYPE_STR, TYPE_VOID};
use crate::bat::{tail_extension, Access, BatDesc, BatId, BatInner};
use crate::config::{
    BAKDIR, BATDIR, BAT_TINY, GDK_VERSION, GDK_VERSION_MINMAX_POS, GDK_VERSION_TAILN, ID_LENGTH,
    MAX_BAT_ID, OID_MAX, OID_NIL, SIZEOF_MAX_INT, SIZEOF_OID, SIZEOF_PTR, STR_VHEAP_MIN, SUBDIR,
};
use crate::farm::FarmRole;
use crate::heap::{Heap, StorageMode};
use crate::pool::slots::{default_name, LogicalName, BBPEXISTING, BBPPERSISTENT};
use crate::pool::BatPool;

/// Whitespace-separated token scanner that keeps track of the byte
/// position, so the verbatim remainder of a line (the options field) can be
/// recovered after the fixed fields.
struct FieldCursor<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> FieldCursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn token(&mut self) -> Option<&'a str> {
        let bytes = self.s.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        let start = self.pos;
        while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.s[start..self.pos])
    }

    fn u64(&mut self) -> Result<u64> {
        let t = self.token().ok_or_else(|| eyre!("missing field"))?;
        t.parse().wrap_err_with(|| format!("bad number {t:?}"))
    }

    fn u16(&mut self) -> Result<u16> {
        let t = self.token().ok_or_else(|| eyre!("missing field"))?;
        t.parse().wrap_err_with(|| format!("bad number {t:?}"))
    }

    /// Everything after the consumed fields, without the leading blank.
    fn rest(&self) -> Option<&'a str> {
        let rest = self.s[self.pos..].trim_end_matches(['\n', '\r']);
        rest.strip_prefix(' ').filter(|r| !r.is_empty())
    }
}

pub(crate) struct DirHeader {
    pub version: u32,
    pub bbpsize: BatId,
    pub logno: i64,
    pub transid: i64,
}

struct ParsedEntry {
    id: BatId,
    logical: String,
    physical: String,
    inner: BatInner,
    options: Option<String>,
}

impl BatPool {
    /// Reads and validates the four header lines.
    pub(crate) fn read_dir_header(
        &self,
        lines: &mut impl Iterator<Item = std::io::Result<String>>,
        lineno: &mut usize,
    ) -> Result<DirHeader> {
        let line = next_line(lines, lineno)?.ok_or_else(|| eyre!("BBP.dir is empty"))?;
        let version: u32 = line
            .strip_prefix("BBP.dir, GDKversion ")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                eyre!(
                    "old BBP without version number; dump the database using a \
                     compatible version, then restore into new database using this version"
                )
            })?;
        if version != GDK_VERSION
            && version != GDK_VERSION_TAILN
            && version != GDK_VERSION_MINMAX_POS
        {
            bail!(
                "incompatible BBP version: expected {:o}, got {:o}. \
                 This database was probably created by a {} version of the server.",
                GDK_VERSION,
                version,
                if version > GDK_VERSION { "newer" } else { "too old" }
            );
        }

        let line = next_line(lines, lineno)?.ok_or_else(|| eyre!("short BBP"))?;
        let mut c = FieldCursor::new(&line);
        let (ptrsize, oidsize, intsize) = (c.u64()? as u32, c.u64()? as u32, c.u64()? as u32);
        ensure!(
            ptrsize == SIZEOF_PTR && oidsize == SIZEOF_OID,
            "database created with incompatible server: expected pointer size {}, got {}, \
             expected OID size {}, got {}",
            SIZEOF_PTR,
            ptrsize,
            SIZEOF_OID,
            oidsize
        );
        ensure!(
            intsize <= SIZEOF_MAX_INT,
            "database created with incompatible server: expected max. integer size {}, got {}",
            SIZEOF_MAX_INT,
            intsize
        );

        let line = next_line(lines, lineno)?.ok_or_else(|| eyre!("short BBP"))?;
        let bbpsize: BatId = line
            .strip_prefix("BBPsize=")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| eyre!("no BBPsize value found"))?;

        let (logno, transid) = if version > GDK_VERSION_MINMAX_POS {
            let line = next_line(lines, lineno)?.ok_or_else(|| eyre!("short BBP"))?;
            let rest = line
                .strip_prefix("BBPinfo=")
                .ok_or_else(|| eyre!("no info value found"))?;
            let mut c = FieldCursor::new(rest);
            (c.u64()? as i64, c.u64()? as i64)
        } else {
            (0, 0)
        };

        Ok(DirHeader {
            version,
            bbpsize,
            logno,
            transid,
        })
    }

    /// Reads the whole directory file into the pool: header, arena sizing,
    /// and every entry. Returns the on-disk version.
    pub(crate) fn read_dir(&self, file: fs::File) -> Result<u32> {
        let mut lines = BufReader::new(file).lines();
        let mut lineno = 0usize;

        let header = self.read_dir_header(&mut lines, &mut lineno)?;
        self.set_info(header.logno, header.transid);

        let size = header.bbpsize.max(1);
        self.arena.extend(size)?;
        self.arena.set_size(size);

        self.read_entries(&mut lines, header.version, &mut lineno)?;
        Ok(header.version)
    }

    /// Reads the BAT entries and inserts them into the pool. Success is
    /// decided inside the loop when the reader hits a clean end of file;
    /// every other way out of the loop is a failure.
    fn read_entries(
        &self,
        lines: &mut impl Iterator<Item = std::io::Result<String>>,
        version: u32,
        lineno: &mut usize,
    ) -> Result<()> {
        loop {
            let entry = match next_line(lines, lineno)? {
                None => return Ok(()), // end of file
                Some(line) => match self.parse_entry(&line, version, *lineno) {
                    Ok(entry) => entry,
                    Err(e) => {
                        error!(line = *lineno, error = %e, "invalid BBP.dir entry");
                        break;
                    }
                },
            };

            if entry.id as u64 >= MAX_BAT_ID {
                error!(line = *lineno, id = entry.id, "bat ID too large to accommodate");
                break;
            }
            if entry.id >= self.size() {
                self.arena.extend(entry.id + 1)?;
                self.arena.set_size(entry.id + 1);
            }
            let slot = self.arena.slot(entry.id);
            if slot.desc.lock().is_some() {
                error!(line = *lineno, id = entry.id, "duplicate entry in BBP.dir");
                break;
            }

            let id = entry.id;
            let desc = Arc::new(BatDesc::new(id, entry.inner));
            *slot.desc.lock() = Some(desc);
            {
                let mut name = slot.name.lock();
                name.logical = if entry.logical == default_name(id) {
                    LogicalName::Default
                } else {
                    LogicalName::Named(entry.logical.into())
                };
                name.options = entry.options;
            }
            slot.physical.get_or_init(|| entry.physical);
            slot.refs.store(0, Ordering::Release);
            // any BAT found here is persistent, so it has a logical
            // reference
            slot.lrefs.store(1, Ordering::Release);
            slot.pid.store(0, Ordering::Release);
            slot.status_set(BBPEXISTING | BBPPERSISTENT);
        }

        bail!("invalid BBP.dir")
    }

    fn parse_entry(&self, line: &str, version: u32, lineno: usize) -> Result<ParsedEntry> {
        let mut c = FieldCursor::new(line);

        let id = c.u64()?;
        let _status = c.u16()?;
        let logical = c
            .token()
            .ok_or_else(|| eyre!("missing logical name"))?
            .to_string();
        ensure!(logical.len() <= ID_LENGTH, "logical name too long");
        let physical = c
            .token()
            .ok_or_else(|| eyre!("missing physical name"))?
            .to_string();
        let properties = c.u64()? as u32;
        let count = c.u64()?;
        let capacity = c.u64()?;
        let base = c.u64()?;

        ensure!(
            id < MAX_BAT_ID,
            "bat ID ({id}) too large to accommodate (max {}), on line {lineno}",
            MAX_BAT_ID - 1
        );
        ensure!(base <= OID_MAX, "head seqbase out of range on line {lineno}");
        let id = id as BatId;

        let restricted = Access::from_bits((properties & 0x06) >> 1)
            .ok_or_else(|| eyre!("incorrect restricted value on line {lineno}"))?;

        let mut inner = BatInner::new(TYPE_VOID, &self.atoms, FarmRole::Persistent, false);
        inner.restricted = restricted;
        inner.copied_to_disk = true;
        inner.count = count;
        inner.inserted = count;
        inner.capacity = count.max(BAT_TINY);
        inner.hseqbase = base;

        let hashash = self.heap_init(&mut inner, &mut c, id, &physical, version, lineno)?;
        self.vheap_init(&mut inner, &mut c, id, &physical, hashash, lineno)?;

        let options = c.rest().map(|s| s.to_string());
        // a leading '~' marks the default name; elsewhere it ends the name
        let logical = match logical.find('~') {
            Some(0) => default_name(id),
            Some(pos) => logical[..pos].to_string(),
            None => logical,
        };

        Ok(ParsedEntry {
            id,
            logical,
            physical,
            inner,
            options,
        })
    }

    /// Parses the tail heap fields and fills in the typed part of the
    /// descriptor. Returns the legacy hash-in-vheap flag.
    fn heap_init(
        &self,
        inner: &mut BatInner,
        c: &mut FieldCursor<'_>,
        id: BatId,
        physical: &str,
        version: u32,
        lineno: usize,
    ) -> Result<bool> {
        let type_name = c.token().ok_or_else(|| eyre!("missing type name"))?.to_string();
        let width = c.u16()?;
        let mut var = c.u16()?;
        let properties = c.u16()?;
        let nokey0 = c.u64()?;
        let nokey1 = c.u64()?;
        let nosorted = c.u64()?;
        let norevsorted = c.u64()?;
        let base = c.u64()?;
        let free = c.u64()?;
        let _size = c.u64()?;
        let _storage = c.u16()?;
        let (minpos, maxpos) = if version <= GDK_VERSION_MINMAX_POS {
            (OID_NIL, OID_NIL)
        } else {
            (c.u64()?, c.u64()?)
        };

        ensure!(
            properties & !0x0F81 == 0,
            "unknown properties are set: incompatible database on line {lineno} of BBP.dir"
        );
        let hashash = var & 2 != 0;
        var &= !2;

        let ttype: AtomId = match self.atoms.index(&type_name) {
            Some(t) => {
                let atom_var = self.atoms.varsized(t).unwrap_or(false);
                ensure!(
                    (var != 0) == atom_var,
                    "inconsistent entry in BBP.dir: tvarsized mismatch for BAT {id} on line {lineno}"
                );
                let atom_size = self.atoms.size(t).unwrap_or(0);
                if var != 0 && t != TYPE_VOID {
                    ensure!(
                        atom_size >= width && matches!(width, 1 | 2 | 4 | 8),
                        "inconsistent entry in BBP.dir: tsize mismatch for BAT {id} on line {lineno}"
                    );
                } else {
                    ensure!(
                        atom_size == width,
                        "inconsistent entry in BBP.dir: tsize mismatch for BAT {id} on line {lineno}"
                    );
                }
                t
            }
            None => self.atoms.unknown_find(&type_name),
        };

        inner.ttype = ttype;
        inner.width = width;
        inner.varsized = var != 0;
        inner.shift = elmshift(width);
        inner.nokey = [nokey0, nokey1];
        inner.sorted = properties & 0x0001 != 0;
        inner.revsorted = properties & 0x0080 != 0;
        inner.key = properties & 0x0100 != 0;
        inner.nonil = properties & 0x0400 != 0;
        inner.nil = properties & 0x0800 != 0;
        inner.nosorted = nosorted;
        inner.norevsorted = norevsorted;
        // 0x0200 is the dense flag
        inner.seqbase = if properties & 0x0200 == 0 || base >= OID_NIL {
            OID_NIL
        } else {
            base
        };
        if minpos < inner.count {
            inner.minpos = minpos;
        }
        if maxpos < inner.count {
            inner.maxpos = maxpos;
        }

        let farm_id = self
            .farms
            .select(FarmRole::Persistent)
            .expect("persistent farm exists");
        let tail = tail_extension(ttype, width);
        let mut heap = Heap::new(farm_id, id, format!("{physical}.{tail}"));
        heap.free = free as usize;
        heap.size = (inner.capacity as usize) << inner.shift;
        heap.storage = StorageMode::Mem;
        heap.newstorage = StorageMode::Mem;
        heap.dirty = false;
        heap.wasempty = free == 0;
        inner.theap = Some(heap);
        Ok(hashash)
    }

    /// Parses the variable heap fields when the type calls for one.
    fn vheap_init(
        &self,
        inner: &mut BatInner,
        c: &mut FieldCursor<'_>,
        id: BatId,
        physical: &str,
        hashash: bool,
        lineno: usize,
    ) -> Result<()> {
        if !inner.varsized || inner.ttype == TYPE_VOID {
            inner.tvheap = None;
            return Ok(());
        }
        let mut free = c.u64().wrap_err_with(|| {
            format!("invalid format for BBP.dir on line {lineno}")
        })?;
        let _size = c.u64()?;
        let _storage = c.u16()?;

        if inner.count == 0 {
            free = 0;
        }
        let size = if inner.ttype == TYPE_STR && (free as usize) < STR_VHEAP_MIN {
            STR_VHEAP_MIN
        } else if free < 512 {
            512
        } else {
            free as usize
        };

        let farm_id = self
            .farms
            .select(FarmRole::Persistent)
            .expect("persistent farm exists");
        let mut heap = Heap::new(farm_id, id, format!("{physical}.theap"));
        heap.free = free as usize;
        heap.size = size;
        heap.storage = StorageMode::Mem;
        heap.newstorage = StorageMode::Mem;
        heap.dirty = false;
        heap.wasempty = free == 0;
        heap.hashash = hashash;
        inner.tvheap = Some(heap);
        Ok(())
    }

    // ------------------------------------------------------------------
    // writer
    // ------------------------------------------------------------------

    /// Formats the directory entry of a persistent BAT, with the committed
    /// row count capped at `size`.
    pub(crate) fn format_entry(&self, id: BatId, size: u64) -> Result<String> {
        let slot = self.arena.slot(id);
        let desc = slot
            .desc
            .lock()
            .clone()
            .ok_or_else(|| eyre!("no descriptor for bat {id}"))?;
        let inner = desc.lock();
        debug_assert!(slot.status() & BBPPERSISTENT != 0);

        let size = size.min(inner.count);
        let logical = slot.logical_string(id).ok_or_else(|| eyre!("bat {id} is vacant"))?;
        let physical = slot.physical.get().cloned().unwrap_or_default();

        let mut line = format!(
            "{} {} {} {} {} {} {} {}",
            id,
            slot.status() & BBPPERSISTENT,
            logical,
            physical,
            (inner.restricted as u32) << 1,
            size,
            inner.capacity,
            inner.hseqbase,
        );

        // tail heap
        let type_name = self
            .atoms
            .name(inner.ttype)
            .ok_or_else(|| eyre!("unknown atom {} for bat {id}", inner.ttype))?;
        let free = if inner.width > 0 {
            (size as usize) << inner.shift
        } else {
            0
        };
        let hsize = inner.theap.as_ref().map(|h| h.size).unwrap_or(0);
        let hashash = inner.tvheap.as_ref().map(|h| h.hashash).unwrap_or(false);
        let properties: u16 = (inner.sorted as u16)
            | ((inner.revsorted as u16) << 7)
            | ((inner.key as u16) << 8)
            | (((inner.seqbase != OID_NIL) as u16) << 9)
            | ((inner.nonil as u16) << 10)
            | ((inner.nil as u16) << 11);
        let nokey0 = if inner.nokey[0] >= size || inner.nokey[1] >= size {
            0
        } else {
            inner.nokey[0]
        };
        let nokey1 = if inner.nokey[0] >= size || inner.nokey[1] >= size {
            0
        } else {
            inner.nokey[1]
        };
        line.push_str(&format!(
            " {} {} {} {} {} {} {} {} {} {} {} 0 {} {}",
            type_name,
            inner.width,
            (inner.varsized as u16) | ((hashash as u16) << 1),
            properties,
            nokey0,
            nokey1,
            if inner.nosorted >= size { 0 } else { inner.nosorted },
            if inner.norevsorted >= size { 0 } else { inner.norevsorted },
            inner.seqbase,
            free,
            hsize,
            if inner.minpos < size { inner.minpos } else { OID_NIL },
            if inner.maxpos < size { inner.maxpos } else { OID_NIL },
        ));

        if let Some(vh) = inner.tvheap.as_ref() {
            let vhfree = if size == 0 { 0 } else { vh.free };
            line.push_str(&format!(" {} {} 0", vhfree, vh.size));
        }
        if let Some(options) = slot.name.lock().options.as_ref() {
            line.push(' ');
            line.push_str(options);
        }
        line.push('\n');
        Ok(line)
    }

    /// Writes an empty directory file (header only).
    pub(crate) fn dir_init(&self) -> Result<()> {
        DirWriter::first(self, false, 0, 0)?.last()
    }
}

fn next_line(
    lines: &mut impl Iterator<Item = std::io::Result<String>>,
    lineno: &mut usize,
) -> Result<Option<String>> {
    match lines.next() {
        None => Ok(None),
        Some(Err(e)) => {
            Err(e).wrap_err_with(|| format!("error reading BBP.dir on line {}", *lineno))
        }
        Some(Ok(line)) => {
            *lineno += 1;
            Ok(Some(line))
        }
    }
}

/// Merge-writer for the directory file. `step` copies forward entries of
/// the old manifest with ids below the one being written, drops the old
/// entry with the same id, and appends the new entry; `last` drains the
/// remainder and makes the file durable.
pub(crate) struct DirWriter {
    new: BufWriter<fs::File>,
    old: Option<BufReader<fs::File>>,
    /// Id of the buffered old line; 0 when consumed, -1 at old EOF.
    cursor: i64,
    buffered: String,
}

impl DirWriter {
    /// Opens the new manifest and, for subcommits, the old one to merge
    /// from, and writes the header.
    pub(crate) fn first(
        pool: &BatPool,
        subcommit: bool,
        logno: i64,
        transid: i64,
    ) -> Result<Self> {
        let new_path = pool.farms.path(0, BATDIR, "BBP", Some("dir"));
        let new = fs::File::create(&new_path)
            .wrap_err_with(|| format!("cannot create {}", new_path.display()))?;
        let mut new = BufWriter::new(new);

        let mut old = None;
        let mut n: BatId = 0;
        if subcommit {
            // the backup BBP.dir is copied to the new one, with the
            // subcommitted entries replaced
            let f = fs::File::open(pool.farms.path(0, SUBDIR, "BBP", Some("dir")))
                .or_else(|_| fs::File::open(pool.farms.path(0, BAKDIR, "BBP", Some("dir"))))
                .wrap_err("subcommit attempted without backup BBP.dir")?;
            let mut reader = BufReader::new(f);
            let mut buf = String::new();
            for _ in 0..3 {
                buf.clear();
                ensure!(
                    reader.read_line(&mut buf)? > 0,
                    "subcommit attempted with invalid backup BBP.dir"
                );
            }
            // third line holds the old BBPsize
            n = buf
                .trim_end()
                .strip_prefix("BBPsize=")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| eyre!("cannot read BBPsize in backup BBP.dir"))?;
            buf.clear();
            ensure!(
                reader.read_line(&mut buf)? > 0 && buf.starts_with("BBPinfo="),
                "cannot read BBPinfo in backup BBP.dir"
            );
            old = Some(reader);
        }

        if n < pool.size() {
            n = pool.size();
        }
        debug!(bats = n, "writing BBP.dir");
        write!(
            new,
            "BBP.dir, GDKversion {}\n{} {} {}\nBBPsize={}\nBBPinfo={} {}\n",
            GDK_VERSION, SIZEOF_PTR, SIZEOF_OID, SIZEOF_MAX_INT, n, logno, transid
        )?;

        Ok(Self {
            new,
            old,
            cursor: if subcommit { 0 } else { -1 },
            buffered: String::new(),
        })
    }

    /// Advances the merge cursor past old entries below `id`, drops the
    /// old entry equal to `id`, and writes `entry` when given.
    pub(crate) fn step(&mut self, id: BatId, entry: Option<&str>) -> Result<()> {
        while self.cursor >= 0 && self.cursor < id as i64 {
            if self.cursor > 0 {
                self.new.write_all(self.buffered.as_bytes())?;
            }
            self.buffered.clear();
            let read = match self.old.as_mut() {
                Some(r) => r.read_line(&mut self.buffered)?,
                None => 0,
            };
            if read == 0 {
                self.cursor = -1;
                self.old = None;
            } else {
                let old_id: i64 = self
                    .buffered
                    .split_ascii_whitespace()
                    .next()
                    .and_then(|t| t.parse().ok())
                    .filter(|&v| v > 0)
                    .ok_or_else(|| eyre!("subcommit attempted with invalid backup BBP.dir"))?;
                self.cursor = old_id;
            }
        }
        if let Some(entry) = entry {
            self.new.write_all(entry.as_bytes())?;
        }
        if self.cursor == id as i64 {
            self.cursor = 0;
        }
        Ok(())
    }

    /// Copies the remaining old entries, then flushes and fdatasyncs the
    /// new manifest.
    pub(crate) fn last(mut self) -> Result<()> {
        if self.cursor > 0 {
            self.new.write_all(self.buffered.as_bytes())?;
        }
        while self.old.is_some() {
            self.buffered.clear();
            let read = match self.old.as_mut() {
                Some(r) => r.read_line(&mut self.buffered)?,
                None => 0,
            };
            if read == 0 {
                self.old = None;
            } else {
                self.new.write_all(self.buffered.as_bytes())?;
            }
        }
        self.new.flush().wrap_err("syncing BBP.dir file failed")?;
        self.new
            .get_ref()
            .sync_data()
            .wrap_err("syncing BBP.dir file failed")?;
        Ok(())
    }
}
