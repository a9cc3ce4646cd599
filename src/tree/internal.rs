//! # Internal Nodes
//!
//! Internal nodes hold separator keys and child slot numbers. Separator
//! `keys[i]` bounds the subtree at `children[i + 1]` from below: every key
//! in that subtree is at least `keys[i]`, and every key in `children[i]`'s
//! subtree is smaller. Separators start out as exact subtree minimums; a
//! delete propagating past released ancestor locks may leave one as a plain
//! lower bound, which keeps descent correct.
//!
//! ## File Layout
//!
//! ```text
//! Offset  Size            Field
//! 0       1               discriminator 0x38
//! 1       4               key_count (u32 LE, at least 1 on disk)
//! 5       MAX_KEYS * 8    keys (u64 LE each; entries past key_count are 0)
//! ...     B * 8           children (u64 LE; entries past key_count + 1 are 0)
//! ```
//!
//! ## Delete Propagation
//!
//! After a child's delete returns, [`NodeData::apply_child_outcome`] edits
//! this node's separators and child table per the outcome, and
//! [`NodeData::internal_rebalance`] repairs this node's own occupancy the
//! same way leaves do: borrow from a rich sibling, else merge, pulling the
//! parent-side separator down into the merged key set.

use eyre::{ensure, Result};

use crate::config::{
    B, INTERNAL_NODE_TAG, MAX_KEYS, MIN_KEYS, ROOT_SLOT, SPLIT_COPY_COUNT,
};
use crate::encoding::{put_u32, put_u64, ByteReader, Value};
use crate::error::StoreError;

use super::{
    load_node, min_of_subtree, DeleteOutcome, Key, NodeData, NodeHandle, Promotion,
    SiblingRef, TreeCtx,
};

/// Internal payload: `keys.len() + 1` children bracket the separators.
#[derive(Debug)]
pub struct InternalNode {
    pub(crate) keys: Vec<Key>,
    pub(crate) children: Vec<u64>,
}

impl InternalNode {
    /// Index of the child whose subtree covers `key`: the first `i` with
    /// `key < keys[i]`, or `key_count` when no separator exceeds the key.
    pub(crate) fn locate(&self, key: Key) -> usize {
        self.keys.partition_point(|&separator| separator <= key)
    }

    pub(crate) fn child_for(&self, key: Key) -> u64 {
        self.children[self.locate(key)]
    }

    /// Sibling coordinates of the child at `child_pos`, as seen from this
    /// node: the adjacent separator key plus the sibling's slot.
    pub(crate) fn siblings_of(
        &self,
        child_pos: usize,
    ) -> (Option<SiblingRef>, Option<SiblingRef>) {
        let left = (child_pos > 0).then(|| SiblingRef {
            key: self.keys[child_pos - 1],
            slot: self.children[child_pos - 1],
        });
        let right = (child_pos < self.keys.len()).then(|| SiblingRef {
            key: self.keys[child_pos],
            slot: self.children[child_pos + 1],
        });
        (left, right)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + MAX_KEYS * 8 + B * 8);
        buf.push(INTERNAL_NODE_TAG);
        put_u32(&mut buf, self.keys.len() as u32);
        for index in 0..MAX_KEYS {
            put_u64(&mut buf, self.keys.get(index).copied().unwrap_or(0));
        }
        for index in 0..B {
            put_u64(&mut buf, self.children.get(index).copied().unwrap_or(0));
        }
        buf
    }

    /// Decodes the payload following the discriminator byte.
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let key_count = reader.read_u32()? as usize;
        ensure!(
            (1..=MAX_KEYS).contains(&key_count),
            "internal key count {} outside 1..={}",
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
            "internal separators are not strictly ascending"
        );

        let mut children = Vec::with_capacity(key_count + 1);
        for index in 0..B {
            let slot = reader.read_u64()?;
            if index <= key_count {
                ensure!(slot != 0, "child pointer {} is the null slot", index);
                children.push(slot);
            }
        }
        ensure!(
            reader.remaining() == 0,
            "{} trailing bytes after internal payload",
            reader.remaining()
        );

        Ok(Self { keys, children })
    }
}

impl<V: Value> NodeData<V> {
    /// Files a child split's promotion into this node, splitting this node
    /// in turn when it is already full.
    pub(crate) fn insert_promotion(
        &mut self,
        ctx: TreeCtx<'_, V>,
        promotion: Promotion,
    ) -> Result<Option<Promotion>> {
        if self.key_count() < MAX_KEYS {
            let node = self.as_internal_mut();
            let position = node.keys.partition_point(|&k| k < promotion.key);
            node.keys.insert(position, promotion.key);
            node.children.insert(position + 1, promotion.node_slot);
            self.meta.dirty = true;
            return Ok(None);
        }

        // Full: move the upper half out, then file the promotion into
        // whichever side covers it. The new node's first key moves up as
        // this split's own promotion instead of staying behind.
        if self.slot() == ROOT_SLOT {
            self.set_slot(ctx.slots.allocate());
        }
        let new_slot = ctx.slots.allocate();
        let border = MAX_KEYS - SPLIT_COPY_COUNT;

        let node = self.as_internal_mut();
        let mut upper_keys = node.keys.split_off(border);
        let mut upper_children = node.children.split_off(border + 1);

        if promotion.key < upper_keys[0] {
            let position = node.keys.partition_point(|&k| k < promotion.key);
            node.keys.insert(position, promotion.key);
            node.children.insert(position + 1, promotion.node_slot);
        } else {
            let position = upper_keys.partition_point(|&k| k < promotion.key);
            upper_keys.insert(position, promotion.key);
            // The upper child list is still headless here (its leading
            // child arrives when the first separator is extracted), so the
            // new child sits at the separator's own index.
            upper_children.insert(position, promotion.node_slot);
        }
        self.meta.dirty = true;

        let extracted = upper_keys.remove(0);
        let new_node = InternalNode {
            keys: upper_keys,
            children: upper_children,
        };
        let handle = super::new_handle(NodeData::from_internal(ctx.dir, new_slot, new_node));
        ctx.cache.insert(new_slot, handle)?;

        Ok(Some(Promotion {
            key: extracted,
            node_slot: new_slot,
        }))
    }

    /// Applies a child's delete outcome to this node's separators and child
    /// table. Returns `true` when a child merge removed a separator here,
    /// i.e. when this node's own occupancy now needs checking.
    ///
    /// `child_slot` and `child_handle` describe the surviving child as it
    /// stands now (a merge-left already moved it to the absorbed sibling's
    /// slot); `child_subtree_min` is the current minimum of that child's
    /// subtree, used to refresh a separator equal to the deleted key.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_child_outcome(
        &mut self,
        ctx: TreeCtx<'_, V>,
        outcome: DeleteOutcome,
        child_pos: usize,
        child_slot: u64,
        child_handle: &NodeHandle<V>,
        deleted_key: Key,
        child_subtree_min: Option<Key>,
    ) -> Result<bool> {
        match outcome {
            DeleteOutcome::Deleted => {
                let node = self.as_internal_mut();
                if child_pos > 0 && node.keys[child_pos - 1] == deleted_key {
                    let minimum = child_subtree_min.ok_or_else(|| {
                        StoreError::InvariantViolation(
                            "separator refresh with no child minimum".into(),
                        )
                    })?;
                    node.keys[child_pos - 1] = minimum;
                    self.meta.dirty = true;
                }
                Ok(false)
            }
            DeleteOutcome::BorrowedLeft(new_key) => {
                self.as_internal_mut().keys[child_pos - 1] = new_key;
                self.meta.dirty = true;
                Ok(false)
            }
            DeleteOutcome::BorrowedRight(new_key) => {
                self.as_internal_mut().keys[child_pos] = new_key;
                self.meta.dirty = true;
                Ok(false)
            }
            DeleteOutcome::MergedRight(new_key) => {
                let node = self.as_internal_mut();
                if child_pos > 1 {
                    node.keys[child_pos - 1] = new_key;
                }
                node.keys.remove(child_pos);
                node.children.remove(child_pos + 1);
                self.meta.dirty = true;
                Ok(true)
            }
            DeleteOutcome::MergedLeft(new_key) => {
                // The survivor took over the left sibling's slot; re-key the
                // cache so descents keep finding the live image.
                ctx.cache.insert(child_slot, NodeHandle::clone(child_handle))?;
                let node = self.as_internal_mut();
                if child_pos > 2 {
                    node.keys[child_pos - 2] = new_key;
                }
                node.keys.remove(child_pos - 1);
                node.children.remove(child_pos);
                self.meta.dirty = true;
                Ok(true)
            }
        }
    }

    /// Repairs this under-occupied internal node against its own siblings.
    ///
    /// `child_min` is the minimum carried by the child merge that shrank
    /// this node (it replaces a pulled-down separator that equals the
    /// deleted key); `own_min` is the current minimum of this node's whole
    /// subtree, supplied by the caller so no descent has to re-enter locked
    /// nodes.
    pub(crate) fn internal_rebalance(
        &mut self,
        ctx: TreeCtx<'_, V>,
        left: Option<SiblingRef>,
        right: Option<SiblingRef>,
        deleted_key: Key,
        child_min: Key,
        own_min: Key,
    ) -> Result<DeleteOutcome> {
        if let Some(left) = left {
            let donor = load_node(ctx, left.slot)?;
            let mut donor_guard = donor.write_arc();
            if donor_guard.key_count() > MIN_KEYS {
                let donor_node = donor_guard.as_internal_mut();
                donor_node.keys.pop().expect("donor above minimum");
                let borrowed_child =
                    donor_node.children.pop().expect("donor above minimum");
                donor_guard.meta.dirty = true;

                let node = self.as_internal_mut();
                node.keys.insert(0, left.key);
                node.children.insert(0, borrowed_child);
                self.meta.dirty = true;

                let new_min = min_of_subtree(ctx, borrowed_child)?;
                return Ok(DeleteOutcome::BorrowedLeft(new_min));
            }
        }

        if let Some(right) = right {
            let donor = load_node(ctx, right.slot)?;
            let mut donor_guard = donor.write_arc();
            if donor_guard.key_count() > MIN_KEYS {
                let donor_node = donor_guard.as_internal_mut();
                donor_node.keys.remove(0);
                let moved_child = donor_node.children.remove(0);
                let donor_first_child = donor_node.children[0];
                donor_guard.meta.dirty = true;

                let node = self.as_internal_mut();
                node.keys.push(right.key);
                node.children.push(moved_child);
                self.meta.dirty = true;

                let donor_min = min_of_subtree(ctx, donor_first_child)?;
                return Ok(DeleteOutcome::BorrowedRight(donor_min));
            }
        }

        if let Some(left) = left {
            // Merge left: the separator between the siblings comes down
            // into the merged key set. If that separator is the key being
            // deleted, the child's refreshed minimum stands in for it.
            let pulled = if left.key != deleted_key {
                left.key
            } else {
                child_min
            };

            let absorbed = load_node(ctx, left.slot)?;
            let mut absorbed_guard = absorbed.write_arc();
            let absorbed_node = absorbed_guard.as_internal_mut();

            let node = self.as_internal_mut();
            let mut keys = std::mem::take(&mut absorbed_node.keys);
            let mut children = std::mem::take(&mut absorbed_node.children);
            keys.push(pulled);
            keys.append(&mut node.keys);
            children.append(&mut node.children);
            node.keys = keys;
            node.children = children;

            absorbed_guard.mark_not_to_be_flushed();
            let vacated = self.slot();
            ctx.cache.erase(vacated);
            ctx.slots.release(vacated)?;
            self.set_slot(left.slot);

            let merged_min = min_of_subtree(ctx, self.as_internal().children[0])?;
            return Ok(DeleteOutcome::MergedLeft(merged_min));
        }

        if let Some(right) = right {
            let pulled = if right.key != deleted_key {
                right.key
            } else {
                child_min
            };

            let absorbed = load_node(ctx, right.slot)?;
            let mut absorbed_guard = absorbed.write_arc();
            let absorbed_node = absorbed_guard.as_internal_mut();

            let node = self.as_internal_mut();
            node.keys.push(pulled);
            node.keys.append(&mut absorbed_node.keys);
            node.children.append(&mut absorbed_node.children);

            absorbed_guard.mark_not_to_be_flushed();
            ctx.cache.erase(right.slot);
            ctx.slots.release(right.slot)?;
            self.meta.dirty = true;

            return Ok(DeleteOutcome::MergedRight(own_min));
        }

        Err(StoreError::InvariantViolation(format!(
            "under-occupied non-root internal node at slot {} has no siblings",
            self.slot()
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(keys: Vec<Key>, children: Vec<u64>) -> InternalNode {
        InternalNode { keys, children }
    }

    #[test]
    fn locate_picks_the_covering_child() {
        let n = node(vec![10, 20, 30], vec![2, 3, 4, 5]);
        assert_eq!(n.locate(5), 0);
        assert_eq!(n.locate(10), 1); // equal key lives in the right subtree
        assert_eq!(n.locate(15), 1);
        assert_eq!(n.locate(30), 3);
        assert_eq!(n.locate(99), 3);
        assert_eq!(n.child_for(25), 4);
    }

    #[test]
    fn siblings_of_edges_and_middle() {
        let n = node(vec![10, 20], vec![2, 3, 4]);

        let (left, right) = n.siblings_of(0);
        assert!(left.is_none());
        let right = right.unwrap();
        assert_eq!((right.key, right.slot), (10, 3));

        let (left, right) = n.siblings_of(1);
        let left = left.unwrap();
        assert_eq!((left.key, left.slot), (10, 2));
        let right = right.unwrap();
        assert_eq!((right.key, right.slot), (20, 4));

        let (left, right) = n.siblings_of(2);
        let left = left.unwrap();
        assert_eq!((left.key, left.slot), (20, 3));
        assert!(right.is_none());
    }

    #[test]
    fn encode_decode_round_trips() {
        let n = node(vec![10, 20, 30], vec![2, 3, 4, 5]);
        let bytes = n.encode();
        assert_eq!(bytes[0], INTERNAL_NODE_TAG);
        assert_eq!(bytes.len(), 1 + 4 + MAX_KEYS * 8 + B * 8);

        let mut reader = ByteReader::new(&bytes[1..]);
        let decoded = InternalNode::decode(&mut reader).unwrap();
        assert_eq!(decoded.keys, vec![10, 20, 30]);
        assert_eq!(decoded.children, vec![2, 3, 4, 5]);
    }

    #[test]
    fn decode_rejects_null_child_pointers() {
        let n = node(vec![10], vec![2, 0]);
        let bytes = n.encode();
        let mut reader = ByteReader::new(&bytes[1..]);
        assert!(InternalNode::decode(&mut reader).is_err());
    }

    #[test]
    fn decode_rejects_zero_key_count() {
        let n = node(vec![], vec![2]);
        let bytes = n.encode();
        let mut reader = ByteReader::new(&bytes[1..]);
        assert!(InternalNode::decode(&mut reader).is_err());
    }
}
