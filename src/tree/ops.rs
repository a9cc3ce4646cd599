//! # Tree-Level Operations
//!
//! Lookup, insert, and delete composed from the node operations plus the
//! hand-over-hand ("crabbing") lock protocol.
//!
//! ## Read Descent
//!
//! Lookups hold the volume lock in shared mode and walk down with per-node
//! shared locks, acquiring the child's before releasing the parent's, so a
//! concurrent writer can never merge or split the path out from under the
//! reader.
//!
//! ## Write Descent
//!
//! Writers hold the volume lock in upgradable mode (upgradable guards
//! serialize among themselves, so one structural writer runs at a time
//! while readers stream past). The descent takes an upgradable guard per
//! node and pushes it on a per-operation stack; the moment the just-locked
//! child turns out to be *safe*, meaning it cannot propagate a split
//! (`key_count < MAX_KEYS`) or an underflow (`key_count > MIN_KEYS`), all
//! retained ancestor guards are dropped. At the leaf, the surviving guards
//! upgrade to exclusive top-down, which cannot deadlock because upgradable
//! guards already exclude each other.
//!
//! ## Root Replacement
//!
//! A root split or root collapse swaps the volume's root handle, which
//! needs the volume lock exclusive. The upgrade happens *before* the node
//! guards go exclusive: once we hold exclusive node locks, a reader could
//! be parked on one of them while keeping the volume lock shared, and
//! upgrading the volume lock behind it would deadlock. The volume lock is
//! upgraded only when the retained path reaches a root that can actually
//! split (full) or collapse (a single separator left).
//!
//! ## Separator Maintenance
//!
//! Delete propagation carries the minimum of the descended child's subtree
//! upward so separators equal to the deleted key can be refreshed without
//! descending into nodes this operation already holds exclusively. Above
//! the retained (unsafe) region nothing is touched: separators there decay
//! from exact minimums to lower bounds, which descent handles fine.

use std::sync::Arc;

use eyre::Result;
use parking_lot::{
    ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard, RwLock, RwLockUpgradableReadGuard,
    RwLockWriteGuard,
};
use smallvec::SmallVec;

use crate::config::{MAX_KEYS, MIN_KEYS, ROOT_SLOT};
use crate::encoding::Value;
use crate::error::StoreError;

use super::{
    load_node, min_of_subtree, new_handle, subtree_get, DeleteOutcome, InternalNode, Key,
    NodeData, NodeHandle, SiblingRef, TreeCtx,
};

/// Expected depth bound for the retained-lock stacks; with B = 150 even
/// billion-key trees stay shallower than this.
const DEPTH_HINT: usize = 8;

type UpgradableGuard<V> = ArcRwLockUpgradableReadGuard<parking_lot::RawRwLock, NodeData<V>>;
type WriteGuard<V> = ArcRwLockWriteGuard<parking_lot::RawRwLock, NodeData<V>>;

/// The volume-level gate: shared while the root cannot change, exclusive
/// around a root replacement.
enum Gate<'a, V: Value> {
    Shared(RwLockUpgradableReadGuard<'a, NodeHandle<V>>),
    Exclusive(RwLockWriteGuard<'a, NodeHandle<V>>),
}

impl<'a, V: Value> Gate<'a, V> {
    fn set_root(&mut self, new_root: NodeHandle<V>) -> Result<()> {
        match self {
            Gate::Exclusive(guard) => {
                **guard = new_root;
                Ok(())
            }
            Gate::Shared(_) => Err(StoreError::InvariantViolation(
                "root replacement attempted without the exclusive volume gate".into(),
            )
            .into()),
        }
    }
}

/// One retained level of a delete descent, after upgrading.
struct DeleteLevel<V: Value> {
    guard: WriteGuard<V>,
    handle: NodeHandle<V>,
    own_left: Option<SiblingRef>,
    own_right: Option<SiblingRef>,
    child_pos: usize,
}

/// The concurrent tree over one volume directory.
pub struct Tree<'a, V: Value> {
    ctx: TreeCtx<'a, V>,
    gate: &'a RwLock<NodeHandle<V>>,
}

impl<'a, V: Value> Tree<'a, V> {
    pub fn new(ctx: TreeCtx<'a, V>, gate: &'a RwLock<NodeHandle<V>>) -> Self {
        Self { ctx, gate }
    }

    pub fn lookup(&self, key: Key) -> Result<Option<V>> {
        let vol_guard = self.gate.read();
        subtree_get(self.ctx, &vol_guard, key)
    }

    pub fn insert(&self, key: Key, value: V) -> Result<()> {
        let ctx = self.ctx;
        let vol_guard = self.gate.upgradable_read();
        let root = Arc::clone(&vol_guard);

        // Descent: upgradable guard per node; ancestors drop as soon as the
        // just-locked child cannot split.
        let mut stack: SmallVec<[(UpgradableGuard<V>, NodeHandle<V>); DEPTH_HINT]> =
            SmallVec::new();
        let mut current_handle = Arc::clone(&root);
        let mut current_guard = current_handle.upgradable_read_arc();

        while !current_guard.is_leaf() {
            let child_slot = current_guard.as_internal().child_for(key);
            let child_handle = load_node(ctx, child_slot)?;
            let child_guard = child_handle.upgradable_read_arc();
            let child_safe = child_guard.key_count() < MAX_KEYS;

            stack.push((current_guard, current_handle));
            if child_safe {
                stack.clear();
            }
            current_guard = child_guard;
            current_handle = child_handle;
        }

        let (root_retained, root_key_count) = match stack.first() {
            Some((guard, handle)) => (Arc::ptr_eq(handle, &root), guard.key_count()),
            None => (Arc::ptr_eq(&current_handle, &root), current_guard.key_count()),
        };
        let mut gate = if root_retained && root_key_count == MAX_KEYS {
            Gate::Exclusive(RwLockUpgradableReadGuard::upgrade(vol_guard))
        } else {
            Gate::Shared(vol_guard)
        };

        // Top-down upgrade of the retained path, leaf last.
        let mut write_stack: SmallVec<[(WriteGuard<V>, NodeHandle<V>); DEPTH_HINT]> =
            SmallVec::new();
        for (guard, handle) in stack.drain(..) {
            write_stack.push((ArcRwLockUpgradableReadGuard::upgrade(guard), handle));
        }
        let mut leaf_guard = ArcRwLockUpgradableReadGuard::upgrade(current_guard);

        let mut promotion = leaf_guard.leaf_insert(ctx, key, value)?;
        for (guard, _) in write_stack.iter_mut().rev() {
            let Some(pending) = promotion.take() else { break };
            promotion = guard.insert_promotion(ctx, pending)?;
        }

        if let Some(pending) = promotion {
            // The promotion escaped the retained stack, which only the root
            // can do: build the new root over slot 1 with the relocated old
            // root on the left and the split-off node on the right.
            let (old_root_slot, old_root_handle) = match write_stack.first() {
                Some((guard, handle)) => (guard.slot(), Arc::clone(handle)),
                None => (leaf_guard.slot(), Arc::clone(&current_handle)),
            };
            let new_root = new_handle(NodeData::from_internal(
                ctx.dir,
                ROOT_SLOT,
                InternalNode {
                    keys: vec![pending.key],
                    children: vec![old_root_slot, pending.node_slot],
                },
            ));
            ctx.cache.insert(old_root_slot, old_root_handle)?;
            ctx.cache.insert(ROOT_SLOT, Arc::clone(&new_root))?;
            gate.set_root(new_root)?;
        }

        Ok(())
    }

    pub fn delete(&self, key: Key) -> Result<()> {
        let ctx = self.ctx;
        let vol_guard = self.gate.upgradable_read();
        let root = Arc::clone(&vol_guard);

        let mut stack: SmallVec<
            [(
                UpgradableGuard<V>,
                NodeHandle<V>,
                Option<SiblingRef>,
                Option<SiblingRef>,
                usize,
            ); DEPTH_HINT],
        > = SmallVec::new();
        // Siblings of the node currently being visited, recorded by its
        // parent on the way down.
        let mut incoming: (Option<SiblingRef>, Option<SiblingRef>) = (None, None);
        let mut current_handle = Arc::clone(&root);
        let mut current_guard = current_handle.upgradable_read_arc();

        while !current_guard.is_leaf() {
            let internal = current_guard.as_internal();
            let child_pos = internal.locate(key);
            let child_slot = internal.children[child_pos];
            let child_siblings = internal.siblings_of(child_pos);

            let child_handle = load_node(ctx, child_slot)?;
            let child_guard = child_handle.upgradable_read_arc();
            let child_safe = child_guard.key_count() > MIN_KEYS;

            stack.push((current_guard, current_handle, incoming.0, incoming.1, child_pos));
            if child_safe {
                stack.clear();
            }
            incoming = child_siblings;
            current_guard = child_guard;
            current_handle = child_handle;
        }

        let (root_retained, root_is_leaf, root_key_count) = match stack.first() {
            Some((guard, handle, ..)) => (Arc::ptr_eq(handle, &root), false, guard.key_count()),
            None => (
                Arc::ptr_eq(&current_handle, &root),
                current_guard.is_leaf(),
                current_guard.key_count(),
            ),
        };
        let mut gate = if root_retained && !root_is_leaf && root_key_count == 1 {
            Gate::Exclusive(RwLockUpgradableReadGuard::upgrade(vol_guard))
        } else {
            Gate::Shared(vol_guard)
        };

        let mut levels: SmallVec<[DeleteLevel<V>; DEPTH_HINT]> = SmallVec::new();
        for (guard, handle, own_left, own_right, child_pos) in stack.drain(..) {
            levels.push(DeleteLevel {
                guard: ArcRwLockUpgradableReadGuard::upgrade(guard),
                handle,
                own_left,
                own_right,
                child_pos,
            });
        }
        let leaf_handle = current_handle;
        let mut leaf_guard = ArcRwLockUpgradableReadGuard::upgrade(current_guard);

        let is_root_leaf = Arc::ptr_eq(&leaf_handle, &root);
        let mut outcome = leaf_guard.leaf_delete(ctx, key, incoming.0, incoming.1, is_root_leaf)?;
        // Minimum of the descended child's subtree, maintained while walking
        // back up; starts as the surviving leaf's first key.
        let mut carried_min = leaf_guard.as_leaf().keys.first().copied();
        let mut new_root: Option<NodeHandle<V>> = None;

        for i in (0..levels.len()).rev() {
            let (child_slot, child_handle) = if i > 0 {
                (levels[i - 1].guard.slot(), Arc::clone(&levels[i - 1].handle))
            } else {
                (leaf_guard.slot(), Arc::clone(&leaf_handle))
            };

            let child_pos = levels[i].child_pos;
            let merged = levels[i].guard.apply_child_outcome(
                ctx,
                outcome,
                child_pos,
                child_slot,
                &child_handle,
                key,
                carried_min,
            )?;

            let slot_now = levels[i].guard.slot();
            let key_count = levels[i].guard.key_count();
            // Where the surviving child sits now: a merge-left slid it into
            // the absorbed sibling's position. Minimum queries must not
            // descend into it (this operation holds it exclusively), so the
            // leftmost-subtree walks below are gated on this position.
            let survivor_pos = match outcome {
                DeleteOutcome::MergedLeft(_) => child_pos - 1,
                _ => child_pos,
            };

            if !merged {
                outcome = DeleteOutcome::Deleted;
                if survivor_pos != 0 && i > 0 {
                    let first_child = levels[i].guard.as_internal().children[0];
                    carried_min = Some(min_of_subtree(ctx, first_child)?);
                }
                continue;
            }

            if slot_now == ROOT_SLOT && key_count == 0 {
                // Root collapse: the sole remaining child moves to slot 1
                // and becomes the root; the drained root image is dead.
                let sole_child = levels[i].guard.as_internal().children[0];
                if sole_child != child_slot {
                    return Err(StoreError::InvariantViolation(format!(
                        "root collapse child mismatch: {sole_child} vs {child_slot}"
                    ))
                    .into());
                }
                ctx.slots.release(child_slot)?;
                ctx.cache.erase(child_slot);
                {
                    let (below, above) = levels.split_at_mut(i);
                    let child_guard = match below.last_mut() {
                        Some(level) => &mut level.guard,
                        None => &mut leaf_guard,
                    };
                    child_guard.set_slot(ROOT_SLOT);
                    above[0].guard.mark_not_to_be_flushed();
                }
                ctx.cache.insert(ROOT_SLOT, Arc::clone(&child_handle))?;
                new_root = Some(child_handle);
                break;
            }

            let underflow = key_count < MIN_KEYS && slot_now != ROOT_SLOT;
            let level_min = if survivor_pos == 0 {
                carried_min
            } else if underflow || i > 0 {
                let first_child = levels[i].guard.as_internal().children[0];
                Some(min_of_subtree(ctx, first_child)?)
            } else {
                None
            };

            if !underflow {
                outcome = DeleteOutcome::Deleted;
                carried_min = level_min;
                continue;
            }

            let child_merge_min = match outcome {
                DeleteOutcome::MergedLeft(min) | DeleteOutcome::MergedRight(min) => min,
                _ => unreachable!("rebalance only follows a child merge"),
            };
            let own_min = level_min.ok_or_else(|| {
                StoreError::InvariantViolation("missing subtree minimum during rebalance".into())
            })?;

            let (own_left, own_right) = (levels[i].own_left, levels[i].own_right);
            outcome = levels[i].guard.internal_rebalance(
                ctx,
                own_left,
                own_right,
                key,
                child_merge_min,
                own_min,
            )?;
            carried_min = Some(match outcome {
                DeleteOutcome::BorrowedLeft(min)
                | DeleteOutcome::MergedLeft(min)
                | DeleteOutcome::MergedRight(min) => min,
                DeleteOutcome::BorrowedRight(_) | DeleteOutcome::Deleted => own_min,
            });
        }

        if let Some(root_handle) = new_root {
            gate.set_root(root_handle)?;
        }

        Ok(())
    }
}
