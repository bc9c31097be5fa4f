//! Commit round-trips and crash recovery, driven through the public API
//! with the filesystem rearranged the way an interrupted commit leaves it.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use batpool::atom::TYPE_INT;
use batpool::{BatId, BatPool, FarmRole, NewBat, PoolOptions};

fn open_pool(dir: &Path) -> Arc<BatPool> {
    let mut opts = PoolOptions::new();
    opts.add_farm(dir, FarmRole::Persistent.bit() | FarmRole::Transient.bit())
        .unwrap();
    BatPool::init(opts).unwrap()
}

fn append_ints(pool: &BatPool, id: BatId, values: &[i32]) {
    let desc = pool.descriptor(id).unwrap();
    let mut inner = desc.lock();
    let mut bytes = Vec::new();
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    inner
        .append_tail(pool.farms(), &bytes, values.len() as u64)
        .unwrap();
}

/// Creates the committed baseline used by the recovery tests: BAT "t1"
/// with four ints, committed as logno 7 / transid 42. Returns its id.
fn committed_baseline(dir: &Path) -> BatId {
    let pool = open_pool(dir);
    let id = pool.insert(NewBat::persistent(TYPE_INT)).unwrap();
    pool.rename(id, "t1").unwrap();
    append_ints(&pool, id, &[10, 20, 30, 40]);
    pool.retain(id);
    pool.set_persistent(id, true);
    pool.sync(Some(&[id]), Some(&[4]), 7, 42).unwrap();
    pool.unfix(id);
    pool.exit();
    drop(pool);
    id
}

#[test]
fn persistent_commit_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let id = committed_baseline(dir.path());

    let pool = open_pool(dir.path());
    assert_eq!(pool.index("t1"), id);
    let desc = pool.quickdesc(id).unwrap();
    assert_eq!(desc.count(), 4);
    assert_eq!(pool.logno(), 7);
    assert_eq!(pool.transid(), 42);

    // the payload itself is readable after the restart
    assert!(pool.fix(id) > 0);
    let desc = pool.descriptor(id).unwrap();
    {
        let inner = desc.lock();
        let bytes = inner.theap.as_ref().unwrap().bytes().unwrap();
        assert_eq!(&bytes[4..8], &20i32.to_le_bytes());
    }
    pool.unfix(id);
    pool.exit();
}

#[test]
fn crash_before_publish_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let id = committed_baseline(dir.path());
    let bat = dir.path().join("bat");

    // simulate a second commit that died between staging and publish:
    // the committed heap was moved into BACKUP/, a bigger heap and a new
    // manifest were written, but BACKUP/ was never renamed away
    fs::rename(bat.join("1.tail"), bat.join("BACKUP/1.tail")).unwrap();
    fs::write(bat.join("1.tail"), [9u8; 24]).unwrap();
    fs::write(bat.join("BBP.dir"), b"BBP.dir, GDKversion 25124\ntorn write").unwrap();

    let pool = open_pool(dir.path());

    // the staged state won: pre-commit count, pre-commit payload
    assert_eq!(pool.index("t1"), id);
    assert_eq!(pool.quickdesc(id).unwrap().count(), 4);
    assert_eq!(pool.logno(), 7);
    assert_eq!(fs::metadata(bat.join("1.tail")).unwrap().len(), 16);
    assert!(!bat.join("BACKUP").exists() || !bat.join("BACKUP/1.tail").exists());

    pool.exit();
}

#[test]
fn crash_after_publish_keeps_commit() {
    let dir = tempfile::tempdir().unwrap();
    let id = committed_baseline(dir.path());

    // a real second commit
    {
        let pool = open_pool(dir.path());
        assert!(pool.fix(id) > 0);
        append_ints(&pool, id, &[50, 60]);
        pool.sync(Some(&[id]), Some(&[6]), 8, 43).unwrap();
        pool.unfix(id);
        pool.exit();
    }

    // simulate dying after the publish rename but before the cleanup of
    // DELETE_ME/
    let deldir = dir.path().join("bat/DELETE_ME");
    fs::create_dir_all(&deldir).unwrap();
    fs::write(deldir.join("1.tail"), [0u8; 16]).unwrap();

    let pool = open_pool(dir.path());
    assert_eq!(pool.index("t1"), id);
    assert_eq!(pool.quickdesc(id).unwrap().count(), 6);
    assert_eq!(pool.logno(), 8);
    assert_eq!(pool.transid(), 43);
    assert!(!deldir.exists());

    pool.exit();
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let id = committed_baseline(dir.path());

    for _ in 0..2 {
        let pool = open_pool(dir.path());
        assert_eq!(pool.index("t1"), id);
        assert_eq!(pool.quickdesc(id).unwrap().count(), 4);
        pool.exit();
    }
}

#[test]
fn kill_marker_removes_half_written_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let id = committed_baseline(dir.path());
    let bat = dir.path().join("bat");

    // a crashed copy-on-write save left a torn sibling; the staging dir
    // carries the marker that tells recovery to delete it
    fs::write(bat.join("1.tail.new"), [1u8; 7]).unwrap();
    fs::write(bat.join("BACKUP/1.tail.new.kill"), b"").unwrap();

    let pool = open_pool(dir.path());
    assert!(!bat.join("1.tail.new").exists());
    assert!(!bat.join("BACKUP/1.tail.new.kill").exists());
    assert_eq!(pool.index("t1"), id);
    assert_eq!(pool.quickdesc(id).unwrap().count(), 4);

    pool.exit();
}

#[test]
fn subcommit_preserves_untouched_entries_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let t1 = pool.insert(NewBat::persistent(TYPE_INT)).unwrap();
    let t2 = pool.insert(NewBat::persistent(TYPE_INT)).unwrap();
    pool.rename(t1, "stable").unwrap();
    pool.rename(t2, "changing").unwrap();
    append_ints(&pool, t1, &[1, 2, 3]);
    append_ints(&pool, t2, &[4, 5]);
    for id in [t1, t2] {
        pool.retain(id);
        pool.set_persistent(id, true);
    }
    pool.sync(Some(&[t1, t2]), Some(&[3, 2]), 1, 1).unwrap();

    // after the commit the manifest is staged in BACKUP/
    let manifest = dir.path().join("bat/BACKUP/BBP.dir");
    let before = fs::read_to_string(&manifest).unwrap();
    let line_before = before
        .lines()
        .find(|l| l.starts_with(&format!("{t1} ")))
        .unwrap()
        .to_string();

    // subcommit only t2
    append_ints(&pool, t2, &[6, 7]);
    pool.sync(Some(&[t2]), Some(&[4]), 2, 2).unwrap();

    let after = fs::read_to_string(&manifest).unwrap();
    let line_after = after
        .lines()
        .find(|l| l.starts_with(&format!("{t1} ")))
        .unwrap();
    assert_eq!(line_after, line_before, "untouched entry must be copied verbatim");

    let t2_line = after
        .lines()
        .find(|l| l.starts_with(&format!("{t2} ")))
        .unwrap();
    assert!(t2_line.contains(" changing "));
    assert_ne!(
        t2_line,
        before
            .lines()
            .find(|l| l.starts_with(&format!("{t2} ")))
            .unwrap()
    );

    // and a restart sees both with the right counts
    pool.exit();
    drop(pool);
    let pool = open_pool(dir.path());
    assert_eq!(pool.quickdesc(t1).unwrap().count(), 3);
    assert_eq!(pool.quickdesc(t2).unwrap().count(), 4);
    pool.exit();
}
