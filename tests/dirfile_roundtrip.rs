//! Manifest writer/reader identity, version gates, and symbolic retention
//! of unknown atom types.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use batpool::atom::{TYPE_INT, TYPE_STR};
use batpool::{BatPool, FarmRole, NewBat, PoolOptions};

fn open_pool(dir: &Path) -> Arc<BatPool> {
    let mut opts = PoolOptions::new();
    opts.add_farm(dir, FarmRole::Persistent.bit() | FarmRole::Transient.bit())
        .unwrap();
    BatPool::init(opts).unwrap()
}

fn try_open(dir: &Path) -> eyre::Result<Arc<BatPool>> {
    let mut opts = PoolOptions::new();
    opts.add_farm(dir, FarmRole::Persistent.bit() | FarmRole::Transient.bit())?;
    BatPool::init(opts)
}

fn entry_lines(manifest: &Path) -> Vec<String> {
    fs::read_to_string(manifest)
        .unwrap()
        .lines()
        .filter(|l| l.split_whitespace().count() > 8)
        .map(|l| l.to_string())
        .collect()
}

#[test]
fn write_then_read_is_identity_on_entries() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("bat/BACKUP/BBP.dir");

    let first = {
        let pool = open_pool(dir.path());
        let a = pool.insert(NewBat::persistent(TYPE_INT)).unwrap();
        let b = pool.insert(NewBat::persistent(TYPE_STR)).unwrap();
        pool.rename(a, "numbers").unwrap();
        pool.rename(b, "labels").unwrap();
        {
            let desc = pool.descriptor(a).unwrap();
            let mut inner = desc.lock();
            let mut bytes = Vec::new();
            for v in [11i32, 22, 33] {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            inner.append_tail(pool.farms(), &bytes, 3).unwrap();
        }
        for id in [a, b] {
            pool.retain(id);
            pool.set_persistent(id, true);
        }
        pool.sync(None, None, 5, 6).unwrap();
        let lines = entry_lines(&manifest);
        pool.exit();
        lines
    };
    assert_eq!(first.len(), 2);

    // reopening parses exactly what was written; rewriting emits the same
    // bytes again
    let pool = open_pool(dir.path());
    pool.sync(None, None, 5, 6).unwrap();
    let second = entry_lines(&manifest);
    pool.exit();

    assert_eq!(first, second);
}

#[test]
fn unknown_atom_names_are_retained() {
    let dir = tempfile::tempdir().unwrap();
    let bat = dir.path().join("bat");
    fs::create_dir_all(&bat).unwrap();
    fs::write(
        bat.join("BBP.dir"),
        "BBP.dir, GDKversion 25124\n8 8 8\nBBPsize=3\nBBPinfo=0 0\n\
         2 2048 exotic 2 0 0 128 0 uuid 16 0 0 0 0 0 0 \
         9223372036854775808 0 2048 0 9223372036854775808 9223372036854775808\n",
    )
    .unwrap();

    let pool = open_pool(dir.path());
    assert_eq!(pool.index("exotic"), 2);
    // the type is unknown to this build but not lost
    let desc = pool.quickdesc(2).unwrap();
    assert!(desc.lock().ttype < 0);

    pool.sync(None, None, 0, 0).unwrap();
    let manifest = fs::read_to_string(dir.path().join("bat/BACKUP/BBP.dir")).unwrap();
    assert!(manifest.contains(" uuid "), "unknown type written back verbatim");

    pool.exit();
}

#[test]
fn options_survive_the_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let bat = dir.path().join("bat");
    fs::create_dir_all(&bat).unwrap();
    fs::write(bat.join("2.tail"), [0u8; 20]).unwrap();
    fs::write(
        bat.join("BBP.dir"),
        "BBP.dir, GDKversion 25124\n8 8 8\nBBPsize=3\nBBPinfo=3 4\n\
         2 2048 withopts 2 0 5 128 0 int 4 0 0 0 0 0 0 \
         9223372036854775808 20 512 0 9223372036854775808 9223372036854775808 ro=1 x\n",
    )
    .unwrap();

    let pool = open_pool(dir.path());
    assert_eq!(pool.index("withopts"), 2);
    assert_eq!(pool.logno(), 3);
    assert_eq!(pool.transid(), 4);

    pool.sync(None, None, 3, 4).unwrap();
    let manifest = fs::read_to_string(dir.path().join("bat/BACKUP/BBP.dir")).unwrap();
    let line = manifest
        .lines()
        .find(|l| l.starts_with("2 "))
        .unwrap();
    assert!(line.ends_with(" ro=1 x"), "options string kept verbatim: {line}");

    pool.exit();
}

#[test]
fn incompatible_versions_are_rejected() {
    for version in ["25121", "99999"] {
        let dir = tempfile::tempdir().unwrap();
        let bat = dir.path().join("bat");
        fs::create_dir_all(&bat).unwrap();
        fs::write(
            bat.join("BBP.dir"),
            format!("BBP.dir, GDKversion {version}\n8 8 8\nBBPsize=1\nBBPinfo=0 0\n"),
        )
        .unwrap();
        assert!(try_open(dir.path()).is_err(), "version {version} must be refused");
    }
}

#[test]
fn pointer_size_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bat = dir.path().join("bat");
    fs::create_dir_all(&bat).unwrap();
    fs::write(
        bat.join("BBP.dir"),
        "BBP.dir, GDKversion 25124\n4 8 8\nBBPsize=1\nBBPinfo=0 0\n",
    )
    .unwrap();
    assert!(try_open(dir.path()).is_err());
}

#[test]
fn old_version_is_upgraded_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let bat = dir.path().join("bat");
    fs::create_dir_all(&bat).unwrap();
    fs::write(bat.join("2.tail"), [0u8; 20]).unwrap();
    // 12-field heap line, no BBPinfo header: the pre-min/max format
    fs::write(
        bat.join("BBP.dir"),
        "BBP.dir, GDKversion 25122\n8 8 8\nBBPsize=3\n\
         2 2048 vintage 2 0 5 128 0 int 4 0 0 0 0 0 0 \
         9223372036854775808 20 512 0\n",
    )
    .unwrap();

    let pool = open_pool(dir.path());
    assert_eq!(pool.index("vintage"), 2);
    assert_eq!(pool.quickdesc(2).unwrap().count(), 5);

    // startup rewrote the manifest in the current format and cleaned up
    // the tail-rename signal file
    let manifest = fs::read_to_string(dir.path().join("bat/BACKUP/BBP.dir")).unwrap();
    assert!(manifest.starts_with("BBP.dir, GDKversion 25124\n"));
    assert!(manifest.contains("BBPinfo="));
    assert!(!bat.join("needstrbatmove").exists());

    pool.exit();
}
