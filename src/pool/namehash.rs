//! # Logical Name Index
//!
//! Open-chained hash from logical BAT name to id, with the chain links
//! reused from the slots' `next` field. Only explicitly named BATs live in
//! the table: names of the `tmp_<octal>` form are recognised by prefix and
//! resolved arithmetically, so temporaries never occupy a bucket.
//!
//! All mutation and lookup happens under the pool's name-index lock (the
//! index is the data behind that lock).

use std::sync::atomic::Ordering;

use crate::bat::BatId;
use crate::pool::slots::{tmp_name_id, LogicalName, SlotArena};

/// Bucket count lower bound; buckets grow with the arena limit.
const MIN_BUCKETS: u32 = 1024;

fn name_hash(name: &str) -> u32 {
    name.bytes()
        .fold(0u32, |h, c| (h << 5).wrapping_sub(h).wrapping_add(c as u32))
}

pub struct NameIndex {
    buckets: Vec<BatId>,
    mask: u32,
}

impl NameIndex {
    pub fn new() -> Self {
        Self {
            buckets: vec![0; MIN_BUCKETS as usize],
            mask: MIN_BUCKETS - 1,
        }
    }

    fn bucket(&self, name: &str) -> usize {
        (name_hash(name) & self.mask) as usize
    }

    /// Hashes `id` under its current (non-tmp) logical name.
    pub fn insert(&mut self, arena: &SlotArena, id: BatId) {
        let name = arena
            .slot(id)
            .logical_string(id)
            .expect("hashed slot has a name");
        debug_assert_eq!(tmp_name_id(&name), 0);
        let idx = self.bucket(&name);
        arena
            .slot(id)
            .next
            .store(self.buckets[idx], Ordering::Release);
        self.buckets[idx] = id;
    }

    /// Unhashes `id`, matching by name string as chains may share buckets.
    pub fn delete(&mut self, arena: &SlotArena, id: BatId) {
        let name = match arena.slot(id).logical_string(id) {
            Some(n) => n,
            None => return,
        };
        let idx = self.bucket(&name);
        let mut cur = self.buckets[idx];
        if cur == id {
            self.buckets[idx] = arena.slot(id).next.load(Ordering::Acquire);
            return;
        }
        while cur != 0 {
            let next = arena.slot(cur).next.load(Ordering::Acquire);
            if next == id {
                arena
                    .slot(cur)
                    .next
                    .store(arena.slot(id).next.load(Ordering::Acquire), Ordering::Release);
                return;
            }
            cur = next;
        }
    }

    /// Bucket walk; `tmp_` names are resolved by the caller before getting
    /// here.
    pub fn find(&self, arena: &SlotArena, name: &str) -> BatId {
        let mut cur = self.buckets[self.bucket(name)];
        while cur != 0 {
            if arena.slot(cur).logical_string(cur).as_deref() == Some(name) {
                return cur;
            }
            cur = arena.slot(cur).next.load(Ordering::Acquire);
        }
        0
    }

    /// Rebuilds every bucket from the arena, sizing the table to the next
    /// power of two >= the arena limit. Vacant slots keep their free-list
    /// links; only named slots are re-chained.
    pub fn rebuild(&mut self, arena: &SlotArena) {
        let mut buckets = MIN_BUCKETS;
        while buckets < arena.limit() {
            buckets <<= 1;
        }
        self.buckets = vec![0; buckets as usize];
        self.mask = buckets - 1;
        for id in (1..arena.size()).rev() {
            let named = matches!(
                arena.slot(id).name.lock().logical,
                LogicalName::Named(ref n) if tmp_name_id(n) == 0
            );
            if named {
                self.insert(arena, id);
            }
        }
    }

    pub fn capacity(&self) -> u32 {
        self.buckets.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::slots::NameCell;

    fn arena_with(names: &[(BatId, &str)]) -> SlotArena {
        let arena = SlotArena::new();
        let top = names.iter().map(|(i, _)| *i).max().unwrap_or(0);
        arena.extend(top + 1).unwrap();
        arena.set_size(top + 1);
        for (id, name) in names {
            *arena.slot(*id).name.lock() = NameCell {
                logical: LogicalName::Named((*name).into()),
                options: None,
            };
        }
        arena
    }

    #[test]
    fn insert_find_delete() {
        let arena = arena_with(&[(1, "a"), (2, "b")]);
        let mut idx = NameIndex::new();
        idx.insert(&arena, 1);
        idx.insert(&arena, 2);

        assert_eq!(idx.find(&arena, "a"), 1);
        assert_eq!(idx.find(&arena, "b"), 2);
        assert_eq!(idx.find(&arena, "c"), 0);

        idx.delete(&arena, 1);
        assert_eq!(idx.find(&arena, "a"), 0);
        assert_eq!(idx.find(&arena, "b"), 2);
    }

    #[test]
    fn chained_bucket_delete_middle() {
        // craft names landing in one bucket by brute force
        let arena = arena_with(&[(1, "n1"), (2, "n2"), (3, "n3")]);
        let mut idx = NameIndex::new();
        idx.insert(&arena, 1);
        idx.insert(&arena, 2);
        idx.insert(&arena, 3);
        idx.delete(&arena, 2);
        assert_eq!(idx.find(&arena, "n1"), 1);
        assert_eq!(idx.find(&arena, "n2"), 0);
        assert_eq!(idx.find(&arena, "n3"), 3);
    }

    #[test]
    fn rebuild_restores_named_slots() {
        let arena = arena_with(&[(1, "x"), (3, "y")]);
        let mut idx = NameIndex::new();
        idx.rebuild(&arena);
        assert_eq!(idx.find(&arena, "x"), 1);
        assert_eq!(idx.find(&arena, "y"), 3);
        assert!(idx.capacity() >= arena.limit().min(1024));
    }
}
