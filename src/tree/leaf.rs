//! # Leaf Nodes
//!
//! Leaves hold the actual (key, value) pairs in sorted order plus the slot
//! of the next leaf in the chain. All leaf mutation runs under the node's
//! exclusive lock, driven by the tree-level descent in [`super::ops`].
//!
//! ## File Layout
//!
//! ```text
//! Offset  Size            Field
//! 0       1               discriminator 0x39
//! 1       4               key_count (u32 LE)
//! 5       MAX_KEYS * 8    keys (u64 LE each; entries past key_count are 0)
//! ...     variable        values (exactly key_count, value-type encoding)
//! tail    8               next_leaf_slot (u64 LE; 0 terminates the chain)
//! ```
//!
//! ## Split
//!
//! A put into a full leaf moves the upper `MAX_KEYS / 2` pairs into a new
//! leaf at a freshly allocated slot, stitches the new leaf into the chain,
//! and sends the new leaf's first key up as the promotion. If the full leaf
//! was the root it is first reallocated off slot 1 so the tree level can
//! build the new root there.
//!
//! ## Delete
//!
//! Removal that leaves a non-root leaf under-occupied repairs occupancy in
//! this order: borrow from the left sibling, borrow from the right sibling
//! (donor must hold strictly more than `MIN_KEYS` keys), merge with the
//! left (the survivor inherits the left sibling's slot), merge with the
//! right (the survivor inherits the right's next pointer). The absorbed
//! image is tombstoned and its slot released.

use eyre::{ensure, Result};

use crate::config::{
    LEAF_NODE_TAG, MAX_KEYS, MIN_KEYS, NULL_SLOT, ROOT_SLOT, SPLIT_COPY_COUNT,
};
use crate::encoding::{put_u32, put_u64, ByteReader, Value};
use crate::error::StoreError;

use super::{
    load_node, DeleteOutcome, Key, NodeData, Promotion, SiblingRef, TreeCtx,
};

/// Leaf payload: parallel sorted keys and values, plus the chain link.
#[derive(Debug)]
pub struct LeafNode<V: Value> {
    pub(crate) keys: Vec<Key>,
    pub(crate) values: Vec<V>,
    pub(crate) next_leaf_slot: u64,
}

impl<V: Value> LeafNode<V> {
    pub(crate) fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next_leaf_slot: NULL_SLOT,
        }
    }

    pub fn get(&self, key: Key) -> Option<&V> {
        let index = self.keys.binary_search(&key).ok()?;
        Some(&self.values[index])
    }

    pub fn encode(&self) -> Vec<u8> {
        let values_len: usize = self.values.iter().map(Value::encoded_len).sum();
        let mut buf = Vec::with_capacity(1 + 4 + MAX_KEYS * 8 + values_len + 8);

        buf.push(LEAF_NODE_TAG);
        put_u32(&mut buf, self.keys.len() as u32);
        for index in 0..MAX_KEYS {
            put_u64(&mut buf, self.keys.get(index).copied().unwrap_or(0));
        }
        for value in &self.values {
            value.encode(&mut buf);
        }
        put_u64(&mut buf, self.next_leaf_slot);
        buf
    }

    /// Decodes the payload following the discriminator byte.
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let key_count = reader.read_u32()? as usize;
        ensure!(
            key_count <= MAX_KEYS,
            "leaf key count {} exceeds the {} maximum",
            key_count,
            MAX_KEYS
        );

        let mut keys = Vec::with_capacity(key_count);
        for index in 0..MAX_KEYS {
            let key = reader.read_u64()?;
            if index < key_count {
                keys.push(key);
            }
        }
        ensure!(
            keys.windows(2).all(|pair| pair[0] < pair[1]),
            "leaf keys are not strictly ascending"
        );

        let mut values = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            values.push(V::decode(reader)?);
        }

        let next_leaf_slot = reader.read_u64()?;
        ensure!(
            reader.remaining() == 0,
            "{} trailing bytes after leaf payload",
            reader.remaining()
        );

        Ok(Self {
            keys,
            values,
            next_leaf_slot,
        })
    }
}

impl<V: Value> NodeData<V> {
    /// Inserts `(key, value)` into this leaf, splitting when full.
    ///
    /// Returns the promotion for the parent when a split happened. Fails
    /// with [`StoreError::DuplicateKey`] before any mutation if the key is
    /// already present.
    pub(crate) fn leaf_insert(
        &mut self,
        ctx: TreeCtx<'_, V>,
        key: Key,
        value: V,
    ) -> Result<Option<Promotion>> {
        let leaf = self.as_leaf();
        let position = match leaf.keys.binary_search(&key) {
            Ok(_) => return Err(StoreError::DuplicateKey(key).into()),
            Err(position) => position,
        };

        if leaf.keys.len() == MAX_KEYS {
            return self.leaf_split_insert(ctx, key, value).map(Some);
        }

        let leaf = self.as_leaf_mut();
        leaf.keys.insert(position, key);
        leaf.values.insert(position, value);
        self.meta.dirty = true;
        Ok(None)
    }

    /// Split-and-put for a full leaf. The caller has already ruled out a
    /// duplicate key.
    fn leaf_split_insert(
        &mut self,
        ctx: TreeCtx<'_, V>,
        key: Key,
        value: V,
    ) -> Result<Promotion> {
        // The root must vacate slot 1 before the tree builds the new root
        // over it.
        if self.slot() == ROOT_SLOT {
            self.set_slot(ctx.slots.allocate());
        }

        let new_slot = ctx.slots.allocate();
        let border = MAX_KEYS - SPLIT_COPY_COUNT;

        let leaf = self.as_leaf_mut();
        let upper_keys = leaf.keys.split_off(border);
        let upper_values = leaf.values.split_off(border);
        let first_new_key = upper_keys[0];

        let mut new_leaf = LeafNode {
            keys: upper_keys,
            values: upper_values,
            next_leaf_slot: leaf.next_leaf_slot,
        };
        leaf.next_leaf_slot = new_slot;

        // The inserted pair goes to whichever side covers it.
        if key < first_new_key {
            let position = leaf.keys.binary_search(&key).unwrap_err();
            leaf.keys.insert(position, key);
            leaf.values.insert(position, value);
        } else {
            let position = new_leaf.keys.binary_search(&key).unwrap_err();
            new_leaf.keys.insert(position, key);
            new_leaf.values.insert(position, value);
        }
        self.meta.dirty = true;

        let handle = super::new_handle(NodeData::from_leaf(ctx.dir, new_slot, new_leaf));
        ctx.cache.insert(new_slot, handle)?;

        Ok(Promotion {
            key: first_new_key,
            node_slot: new_slot,
        })
    }

    /// Removes `key` from this leaf and repairs occupancy.
    ///
    /// `is_root` disables all repair: the root leaf may drain to zero keys.
    /// The siblings are the parent-recorded neighbors of this leaf; absent
    /// siblings on a non-root under-occupied leaf are a structural
    /// invariant violation.
    pub(crate) fn leaf_delete(
        &mut self,
        ctx: TreeCtx<'_, V>,
        key: Key,
        left: Option<SiblingRef>,
        right: Option<SiblingRef>,
        is_root: bool,
    ) -> Result<DeleteOutcome> {
        let leaf = self.as_leaf_mut();
        let position = leaf
            .keys
            .binary_search(&key)
            .map_err(|_| StoreError::KeyNotFound(key))?;
        leaf.keys.remove(position);
        leaf.values.remove(position);
        self.meta.dirty = true;

        if is_root || self.key_count() >= MIN_KEYS {
            return Ok(DeleteOutcome::Deleted);
        }

        if let Some(left) = left {
            let donor = load_node(ctx, left.slot)?;
            let mut donor_guard = donor.write_arc();
            if donor_guard.key_count() > MIN_KEYS {
                let donor_leaf = donor_guard.as_leaf_mut();
                let borrowed_key = donor_leaf.keys.pop().expect("donor above minimum");
                let borrowed_value = donor_leaf.values.pop().expect("donor above minimum");
                donor_guard.meta.dirty = true;

                let leaf = self.as_leaf_mut();
                leaf.keys.insert(0, borrowed_key);
                leaf.values.insert(0, borrowed_value);
                return Ok(DeleteOutcome::BorrowedLeft(borrowed_key));
            }
        }

        if let Some(right) = right {
            let donor = load_node(ctx, right.slot)?;
            let mut donor_guard = donor.write_arc();
            if donor_guard.key_count() > MIN_KEYS {
                let donor_leaf = donor_guard.as_leaf_mut();
                let borrowed_key = donor_leaf.keys.remove(0);
                let borrowed_value = donor_leaf.values.remove(0);
                let donor_first = donor_leaf.keys[0];
                donor_guard.meta.dirty = true;

                let leaf = self.as_leaf_mut();
                leaf.keys.push(borrowed_key);
                leaf.values.push(borrowed_value);
                return Ok(DeleteOutcome::BorrowedRight(donor_first));
            }
        }

        if let Some(left) = left {
            // Merge left: adopt the left sibling's pairs in front of ours
            // and take over its slot. The chain predecessor already points
            // at that slot, so no neighbor needs rewriting.
            let absorbed = load_node(ctx, left.slot)?;
            let mut absorbed_guard = absorbed.write_arc();
            let absorbed_leaf = absorbed_guard.as_leaf_mut();

            let leaf = self.as_leaf_mut();
            let mut keys = std::mem::take(&mut absorbed_leaf.keys);
            let mut values = std::mem::take(&mut absorbed_leaf.values);
            keys.append(&mut leaf.keys);
            values.append(&mut leaf.values);
            leaf.keys = keys;
            leaf.values = values;

            absorbed_guard.mark_not_to_be_flushed();
            let vacated = self.slot();
            ctx.cache.erase(vacated);
            ctx.slots.release(vacated)?;
            self.set_slot(left.slot);

            let minimum = self.as_leaf().keys[0];
            return Ok(DeleteOutcome::MergedLeft(minimum));
        }

        if let Some(right) = right {
            // Merge right: concatenate the right sibling into this leaf and
            // inherit its chain link.
            let absorbed = load_node(ctx, right.slot)?;
            let mut absorbed_guard = absorbed.write_arc();
            let absorbed_leaf = absorbed_guard.as_leaf_mut();

            let leaf = self.as_leaf_mut();
            leaf.keys.append(&mut absorbed_leaf.keys);
            leaf.values.append(&mut absorbed_leaf.values);
            leaf.next_leaf_slot = absorbed_leaf.next_leaf_slot;

            absorbed_guard.mark_not_to_be_flushed();
            ctx.cache.erase(right.slot);
            ctx.slots.release(right.slot)?;

            let minimum = self.as_leaf().keys[0];
            return Ok(DeleteOutcome::MergedRight(minimum));
        }

        Err(StoreError::InvariantViolation(format!(
            "under-occupied non-root leaf at slot {} has no siblings",
            self.slot()
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{new_handle, NodeHandle};
    use super::*;
    use crate::error::store_error;
    use crate::storage::{NodeCache, SlotAllocator};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        path: std::path::PathBuf,
        cache: NodeCache<NodeHandle<String>>,
        slots: SlotAllocator,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let path = dir.path().to_path_buf();
            Self {
                _dir: dir,
                cache: NodeCache::new(1024, Box::new(super::super::write_back::<String>)),
                slots: SlotAllocator::new(&path),
                path,
            }
        }

        fn ctx(&self) -> TreeCtx<'_, String> {
            TreeCtx {
                dir: &self.path,
                cache: &self.cache,
                slots: &self.slots,
            }
        }
    }

    fn value_for(key: Key) -> String {
        format!("value{key}")
    }

    fn filled_leaf(fx: &Fixture, slot: u64, keys: &[Key]) -> NodeHandle<String> {
        let leaf = LeafNode {
            keys: keys.to_vec(),
            values: keys.iter().map(|&k| value_for(k)).collect(),
            next_leaf_slot: NULL_SLOT,
        };
        let handle = new_handle(NodeData::from_leaf(&fx.path, slot, leaf));
        fx.cache.insert(slot, Arc::clone(&handle)).unwrap();
        handle
    }

    #[test]
    fn insert_keeps_keys_sorted() {
        let fx = Fixture::new();
        let root = new_handle(NodeData::new_empty_leaf(&fx.path, ROOT_SLOT));
        let mut guard = root.write_arc();

        for key in [33, 44, 30, 1] {
            let promotion = guard.leaf_insert(fx.ctx(), key, value_for(key)).unwrap();
            assert!(promotion.is_none());
        }

        assert_eq!(guard.as_leaf().keys, vec![1, 30, 33, 44]);
        assert_eq!(guard.as_leaf().get(30), Some(&value_for(30)));
        assert_eq!(guard.as_leaf().get(2), None);
    }

    #[test]
    fn duplicate_insert_fails_without_mutation() {
        let fx = Fixture::new();
        let keys: Vec<Key> = (0..MAX_KEYS as Key).collect();
        let full = filled_leaf(&fx, ROOT_SLOT, &keys);
        let mut guard = full.write_arc();

        let err = guard
            .leaf_insert(fx.ctx(), 10, "other".into())
            .unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::DuplicateKey(10))
        ));

        // Still full, still at slot 1, nothing split off.
        assert_eq!(guard.key_count(), MAX_KEYS);
        assert_eq!(guard.slot(), ROOT_SLOT);
        assert_eq!(guard.as_leaf().get(10), Some(&value_for(10)));
    }

    #[test]
    fn split_moves_upper_half_and_links_the_chain() {
        let fx = Fixture::new();
        let keys: Vec<Key> = (0..MAX_KEYS as Key).map(|k| k * 2).collect();
        let full = filled_leaf(&fx, 5, &keys);
        let mut guard = full.write_arc();

        let inserted = (MAX_KEYS as Key) * 2;
        let promotion = guard
            .leaf_insert(fx.ctx(), inserted, value_for(inserted))
            .unwrap()
            .expect("full leaf must split");

        let new_node = fx.cache.get(promotion.node_slot).unwrap();
        let new_guard = new_node.read_arc();
        let (left, right) = (guard.as_leaf(), new_guard.as_leaf());

        assert_eq!(left.keys.len(), MAX_KEYS - SPLIT_COPY_COUNT);
        assert_eq!(right.keys.len(), SPLIT_COPY_COUNT + 1);
        assert_eq!(promotion.key, right.keys[0]);
        assert_eq!(left.next_leaf_slot, promotion.node_slot);
        assert_eq!(right.next_leaf_slot, NULL_SLOT);
        assert!(left.keys.last().unwrap() < &right.keys[0]);
        assert_eq!(right.keys.last(), Some(&inserted));
    }

    #[test]
    fn splitting_root_leaf_vacates_slot_one() {
        let fx = Fixture::new();
        let keys: Vec<Key> = (0..MAX_KEYS as Key).collect();
        let root = filled_leaf(&fx, ROOT_SLOT, &keys);
        let mut guard = root.write_arc();

        guard
            .leaf_insert(fx.ctx(), MAX_KEYS as Key, value_for(MAX_KEYS as Key))
            .unwrap()
            .expect("full root leaf must split");

        assert_ne!(guard.slot(), ROOT_SLOT);
    }

    #[test]
    fn low_side_insert_lands_in_the_original_leaf() {
        let fx = Fixture::new();
        let keys: Vec<Key> = (1..=MAX_KEYS as Key).map(|k| k * 10).collect();
        let full = filled_leaf(&fx, 5, &keys);
        let mut guard = full.write_arc();

        let promotion = guard
            .leaf_insert(fx.ctx(), 5, value_for(5))
            .unwrap()
            .expect("split");

        assert_eq!(guard.as_leaf().keys[0], 5);
        assert!(guard.as_leaf().keys.last().unwrap() < &promotion.key);
    }

    #[test]
    fn delete_from_root_may_drain_it() {
        let fx = Fixture::new();
        let root = filled_leaf(&fx, ROOT_SLOT, &[7]);
        let mut guard = root.write_arc();

        let outcome = guard
            .leaf_delete(fx.ctx(), 7, None, None, true)
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::Deleted);
        assert_eq!(guard.key_count(), 0);
    }

    #[test]
    fn delete_missing_key_is_an_error() {
        let fx = Fixture::new();
        let root = filled_leaf(&fx, ROOT_SLOT, &[1, 2, 3]);
        let mut guard = root.write_arc();

        let err = guard
            .leaf_delete(fx.ctx(), 9, None, None, true)
            .unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::KeyNotFound(9))
        ));
        assert_eq!(guard.key_count(), 3);
    }

    #[test]
    fn underflow_borrows_from_a_rich_left_sibling() {
        let fx = Fixture::new();
        let left_keys: Vec<Key> = (0..=MIN_KEYS as Key).collect(); // MIN_KEYS + 1 keys
        filled_leaf(&fx, 2, &left_keys);
        let self_keys: Vec<Key> = (100..100 + MIN_KEYS as Key).collect();
        let node = filled_leaf(&fx, 3, &self_keys);
        let mut guard = node.write_arc();

        let left = SiblingRef { key: 100, slot: 2 };
        let outcome = guard
            .leaf_delete(fx.ctx(), 100, Some(left), None, false)
            .unwrap();

        let borrowed = MIN_KEYS as Key;
        assert_eq!(outcome, DeleteOutcome::BorrowedLeft(borrowed));
        assert_eq!(guard.as_leaf().keys[0], borrowed);
        assert_eq!(guard.key_count(), MIN_KEYS);

        let donor = fx.cache.get(2).unwrap();
        assert_eq!(donor.read_arc().key_count(), MIN_KEYS);
    }

    #[test]
    fn underflow_borrows_right_when_left_is_poor() {
        let fx = Fixture::new();
        let left_keys: Vec<Key> = (0..MIN_KEYS as Key).collect(); // at minimum, not a donor
        filled_leaf(&fx, 2, &left_keys);
        let right_keys: Vec<Key> = (200..=200 + MIN_KEYS as Key).collect();
        filled_leaf(&fx, 4, &right_keys);
        let self_keys: Vec<Key> = (100..100 + MIN_KEYS as Key).collect();
        let node = filled_leaf(&fx, 3, &self_keys);
        let mut guard = node.write_arc();

        let left = SiblingRef { key: 100, slot: 2 };
        let right = SiblingRef { key: 200, slot: 4 };
        let outcome = guard
            .leaf_delete(fx.ctx(), 105, Some(left), Some(right), false)
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::BorrowedRight(201));
        assert_eq!(guard.as_leaf().keys.last(), Some(&200));
    }

    #[test]
    fn merge_left_inherits_the_left_slot() {
        let fx = Fixture::new();
        let left_keys: Vec<Key> = (0..MIN_KEYS as Key).collect();
        let left_handle = filled_leaf(&fx, 2, &left_keys);
        let self_keys: Vec<Key> = (100..100 + MIN_KEYS as Key).collect();
        let node = filled_leaf(&fx, 3, &self_keys);
        // Give the vacated slot a file so the release is observable.
        std::fs::write(fx.path.join(crate::config::node_file_name(3)), b"x").unwrap();
        let mut guard = node.write_arc();

        let left = SiblingRef { key: 100, slot: 2 };
        let outcome = guard
            .leaf_delete(fx.ctx(), 100, Some(left), None, false)
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::MergedLeft(0));
        assert_eq!(guard.slot(), 2);
        assert_eq!(guard.key_count(), MIN_KEYS + MIN_KEYS - 1);
        assert_eq!(guard.as_leaf().keys[0], 0);
        assert!(!fx.path.join(crate::config::node_file_name(3)).exists());
        assert!(fx.cache.get(3).is_none());
        // The absorbed image must never write itself back.
        assert!(left_handle.read_arc().meta.tombstoned);
    }

    #[test]
    fn merge_right_inherits_the_next_pointer() {
        let fx = Fixture::new();
        let right_keys: Vec<Key> = (200..200 + MIN_KEYS as Key).collect();
        let right_handle = filled_leaf(&fx, 4, &right_keys);
        right_handle.write_arc().as_leaf_mut().next_leaf_slot = 9;

        let self_keys: Vec<Key> = (100..100 + MIN_KEYS as Key).collect();
        let node = filled_leaf(&fx, 3, &self_keys);
        let mut guard = node.write_arc();

        let right = SiblingRef { key: 200, slot: 4 };
        let outcome = guard
            .leaf_delete(fx.ctx(), 100, None, Some(right), false)
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::MergedRight(101));
        assert_eq!(guard.slot(), 3);
        assert_eq!(guard.as_leaf().next_leaf_slot, 9);
        assert_eq!(guard.key_count(), MIN_KEYS + MIN_KEYS - 1);
        assert!(fx.cache.get(4).is_none());
        assert!(right_handle.read_arc().meta.tombstoned);
    }

    #[test]
    fn underflow_with_no_siblings_is_fatal() {
        let fx = Fixture::new();
        let self_keys: Vec<Key> = (100..100 + MIN_KEYS as Key).collect();
        let node = filled_leaf(&fx, 3, &self_keys);
        let mut guard = node.write_arc();

        let err = guard
            .leaf_delete(fx.ctx(), 100, None, None, false)
            .unwrap_err();
        assert!(matches!(
            store_error(&err),
            Some(StoreError::InvariantViolation(_))
        ));
    }

    #[test]
    fn encode_decode_round_trips() {
        let leaf = LeafNode {
            keys: vec![1, 5, 9],
            values: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            next_leaf_slot: 17,
        };
        let bytes = leaf.encode();
        assert_eq!(bytes[0], LEAF_NODE_TAG);

        let mut reader = ByteReader::new(&bytes[1..]);
        let decoded: LeafNode<String> = LeafNode::decode(&mut reader).unwrap();
        assert_eq!(decoded.keys, leaf.keys);
        assert_eq!(decoded.values, leaf.values);
        assert_eq!(decoded.next_leaf_slot, 17);
    }

    #[test]
    fn decode_rejects_unsorted_keys() {
        let leaf = LeafNode {
            keys: vec![5, 1],
            values: vec!["a".to_string(), "b".to_string()],
            next_leaf_slot: NULL_SLOT,
        };
        let bytes = leaf.encode();
        let mut reader = ByteReader::new(&bytes[1..]);
        assert!(LeafNode::<String>::decode(&mut reader).is_err());
    }
}
