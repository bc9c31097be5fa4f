//! Reference counting, naming, and slot lifecycle behaviour of the pool.

use std::path::Path;
use std::sync::Arc;

use batpool::atom::TYPE_INT;
use batpool::{BatPool, FarmRole, NewBat, PoolOptions, RenameError};

fn open_pool(dir: &Path) -> Arc<BatPool> {
    let mut opts = PoolOptions::new();
    opts.add_farm(dir, FarmRole::Persistent.bit() | FarmRole::Transient.bit())
        .unwrap();
    BatPool::init(opts).unwrap()
}

fn data_files(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut stack = vec![dir.join("bat")];
    while let Some(d) = stack.pop() {
        for dent in std::fs::read_dir(&d).unwrap() {
            let dent = dent.unwrap();
            if dent.file_type().unwrap().is_dir() {
                stack.push(dent.path());
            } else {
                let name = dent.file_name().to_string_lossy().into_owned();
                if !name.starts_with("BBP") {
                    files.push(name);
                }
            }
        }
    }
    files.sort();
    files
}

#[test]
fn transient_create_fix_unfix_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let id = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    assert_eq!(pool.refs(id), 1);
    assert_eq!(pool.lrefs(id), 0);

    assert_eq!(pool.fix(id), 2);
    assert_eq!(pool.fix(id), 3);
    assert_eq!(pool.unfix(id), 2);
    assert_eq!(pool.unfix(id), 1);

    // dropping the last memory reference destroys the transient
    assert_eq!(pool.reclaim(id), 0);
    assert_eq!(pool.index(&format!("tmp_{id:o}")), 0);
    assert_eq!(pool.refs(id), 0);

    // the id went back to the free list and is reused
    let id2 = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    assert_eq!(id2, id);
    assert_eq!(pool.reclaim(id2), 0);

    // nothing of the transient ever reached the disk
    assert!(data_files(dir.path()).is_empty());
    pool.exit();
}

#[test]
fn fix_unfix_and_retain_release_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let id = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    pool.retain(id);

    let refs = pool.refs(id);
    let lrefs = pool.lrefs(id);
    assert_eq!(pool.fix(id), refs + 1);
    assert_eq!(pool.unfix(id), refs);
    assert_eq!(pool.retain(id), lrefs + 1);
    assert_eq!(pool.release(id), lrefs);
    assert_eq!(pool.refs(id), refs);
    assert_eq!(pool.lrefs(id), lrefs);

    pool.exit();
}

#[test]
fn keepref_converts_memory_to_logical() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let id = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    pool.keepref(id);
    assert_eq!(pool.refs(id), 0);
    assert_eq!(pool.lrefs(id), 1);
    // the bat survives with only the logical reference
    assert!(pool.quickdesc(id).is_some());

    assert_eq!(pool.release(id), 0);
    assert_eq!(pool.index(&format!("tmp_{id:o}")), 0);
    pool.exit();
}

#[test]
fn rename_collision_leaves_hash_intact() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let a = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    let b = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    pool.rename(a, "a").unwrap();
    pool.rename(b, "b").unwrap();

    assert_eq!(pool.rename(a, "b"), Err(RenameError::AlreadyInUse));
    assert_eq!(pool.index("a"), a);
    assert_eq!(pool.index("b"), b);

    pool.exit();
}

#[test]
fn rename_rules() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let id = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    let other = pool.insert(NewBat::transient(TYPE_INT)).unwrap();

    // renaming to the current name is a no-op
    pool.rename(id, "mine").unwrap();
    pool.rename(id, "mine").unwrap();
    assert_eq!(pool.index("mine"), id);

    // tmp_<octal> names are reserved for the own default
    assert_eq!(
        pool.rename(id, &format!("tmp_{other:o}")),
        Err(RenameError::Illegal)
    );
    pool.rename(id, &format!("tmp_{id:o}")).unwrap();
    assert_eq!(pool.index("mine"), 0);
    assert_eq!(pool.index(&format!("tmp_{id:o}")), id);

    // over-long names are rejected without touching the hash
    let long = "x".repeat(200);
    assert_eq!(pool.rename(id, &long), Err(RenameError::TooLong));

    // renaming an empty slot is a programmer error
    assert_eq!(pool.rename(4095, "nope"), Err(RenameError::Illegal));

    pool.exit();
}

#[test]
fn view_lifecycle_share_blocks_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let p = pool.insert(NewBat::persistent(TYPE_INT)).unwrap();
    pool.rename(p, "parent").unwrap();
    {
        let desc = pool.descriptor(p).unwrap();
        let mut inner = desc.lock();
        let mut bytes = Vec::new();
        for v in [1i32, 2, 3, 4] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        inner.append_tail(pool.farms(), &bytes, 4).unwrap();
    }
    pool.retain(p);
    pool.set_persistent(p, true);

    let v = pool.insert(NewBat::view(p)).unwrap();
    pool.share(p);
    pool.retain(v);
    assert_eq!(pool.share_count(p), 1);

    pool.sync(Some(&[p]), Some(&[4]), 1, 1).unwrap();

    // drop all memory references; the share must keep the parent pinned
    assert_eq!(pool.unfix(v), 0);
    assert_eq!(pool.unfix(p), 0);
    assert_eq!(pool.share_count(p), 1);

    pool.trim(true);
    assert!(pool.is_loaded(p), "shared parent must not be evicted");

    // destroying the view returns the share and its references
    assert_eq!(pool.release(v), 0);
    assert_eq!(pool.share_count(p), 0);
    assert_eq!(pool.lrefs(p), 1);

    pool.trim(true);
    assert!(!pool.is_loaded(p), "clean unshared parent is evictable");

    // and the payload comes back from disk intact
    assert!(pool.fix(p) > 0);
    let desc = pool.descriptor(p).unwrap();
    {
        let inner = desc.lock();
        assert_eq!(inner.count, 4);
        let bytes = inner.theap.as_ref().unwrap().bytes().unwrap();
        assert_eq!(&bytes[0..4], &1i32.to_le_bytes());
    }
    pool.unfix(p);
    pool.exit();
}

#[test]
fn slab_growth_keeps_descriptors_stable() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let first = pool.insert(NewBat::transient(TYPE_INT)).unwrap();
    let desc = pool.descriptor(first).unwrap();

    // push well past one slab of slots
    let count = batpool::config::SLAB_SIZE + 16;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(pool.insert(NewBat::transient(TYPE_INT)).unwrap());
    }
    assert!(pool.size() > batpool::config::SLAB_SIZE as u32);

    // the descriptor handed out before the growth is still the live one
    let again = pool.descriptor(first).unwrap();
    assert!(Arc::ptr_eq(&desc, &again));
    assert_eq!(again.count(), 0);

    for id in ids {
        pool.reclaim(id);
    }
    pool.exit();
}

#[test]
fn cold_marks_persistent_bats_for_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path());

    let id = pool.insert(NewBat::persistent(TYPE_INT)).unwrap();
    {
        let desc = pool.descriptor(id).unwrap();
        let mut inner = desc.lock();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7i32.to_le_bytes());
        bytes.extend_from_slice(&9i32.to_le_bytes());
        inner.append_tail(pool.farms(), &bytes, 2).unwrap();
    }
    pool.retain(id);
    pool.set_persistent(id, true);
    pool.sync(Some(&[id]), Some(&[2]), 1, 1).unwrap();

    assert_eq!(pool.unfix(id), 0);
    pool.cold(id);
    // without the HOT bit even the regular trim pass takes it
    pool.trim(false);
    assert!(!pool.is_loaded(id));

    pool.exit();
}
