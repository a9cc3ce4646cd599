//! # Ordered Enumeration
//!
//! The enumerator walks the leaf chain from the leftmost leaf, yielding
//! `(key, value)` pairs in ascending key order. It holds the volume lock in
//! upgradable mode for its entire lifetime: structural writers acquire the
//! same mode and upgradable guards exclude each other, so the sequence is a
//! snapshot of the tree at construction time, while plain readers stream
//! past unaffected. A second enumerator queues like a writer would.
//!
//! Each leaf's pairs are copied out under a short per-node read lock; the
//! iterator never holds a node lock across a `next` call.

use eyre::Result;
use parking_lot::RwLockUpgradableReadGuard;

use crate::config::NULL_SLOT;
use crate::encoding::Value;

use super::{first_leaf, load_node, Key, NodeHandle, TreeCtx};

pub struct Enumerator<'a, V: Value> {
    ctx: TreeCtx<'a, V>,
    /// Volume lock in upgradable mode, held until the enumerator drops.
    _gate: RwLockUpgradableReadGuard<'a, NodeHandle<V>>,
    batch: Vec<(Key, V)>,
    batch_pos: usize,
    next_slot: u64,
    finished: bool,
}

impl<'a, V: Value> Enumerator<'a, V> {
    pub(crate) fn new(
        ctx: TreeCtx<'a, V>,
        gate: RwLockUpgradableReadGuard<'a, NodeHandle<V>>,
    ) -> Result<Self> {
        let leftmost = first_leaf(ctx, &gate)?;
        let mut enumerator = Self {
            ctx,
            _gate: gate,
            batch: Vec::new(),
            batch_pos: 0,
            next_slot: NULL_SLOT,
            finished: false,
        };
        enumerator.fill_from(&leftmost);
        Ok(enumerator)
    }

    fn fill_from(&mut self, leaf: &NodeHandle<V>) {
        let guard = leaf.read_arc();
        let leaf = guard.as_leaf();
        self.batch = leaf
            .keys
            .iter()
            .copied()
            .zip(leaf.values.iter().cloned())
            .collect();
        self.batch_pos = 0;
        self.next_slot = leaf.next_leaf_slot;
    }

    fn advance(&mut self) -> Result<bool> {
        if self.next_slot == NULL_SLOT {
            return Ok(false);
        }
        let leaf = load_node(self.ctx, self.next_slot)?;
        self.fill_from(&leaf);
        Ok(true)
    }
}

impl<V: Value> Iterator for Enumerator<'_, V> {
    type Item = Result<(Key, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if self.batch_pos < self.batch.len() {
                let pair = self.batch[self.batch_pos].clone();
                self.batch_pos += 1;
                return Some(Ok(pair));
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
