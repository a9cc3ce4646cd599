//! # Concurrent On-Disk B+ Tree
//!
//! The tree keeps every value in a leaf; internal nodes hold separator keys
//! and child slot numbers. All leaves sit at the same depth and form a
//! singly linked list in ascending key order through their next-leaf slots.
//!
//! ```text
//!                  [internal, slot 1 (root)]
//!                  /          |           \
//!        [leaf 4]      [leaf 2]      [leaf 7]
//!           |------------->|------------->|--> 0   (leaf chain)
//! ```
//!
//! ## Node Images and Handles
//!
//! A node lives in memory as a [`NodeData`]: shared metadata (directory,
//! slot, dirty flag, tombstone flag) plus a [`NodeBody`] that is either a
//! leaf or an internal node. Images are shared as
//! `Arc<RwLock<NodeData<V>>>` ([`NodeHandle`]); the cache, the volume root
//! pointer, and in-flight operations all hold the same `Arc`, so cache
//! eviction never invalidates a live reference.
//!
//! ## Module Layout
//!
//! - [`leaf`]: leaf payload, put/split/delete/get, leaf file codec
//! - [`internal`]: internal payload, promotion insert/split, the
//!   child-delete-result propagation rules, internal file codec
//! - [`ops`]: tree-level lookup/insert/delete with the crabbing protocol
//! - [`iter`]: ordered enumeration over the leaf chain
//!
//! ## Write-Back Lifecycle
//!
//! Mutations only mark images dirty; bytes reach disk when the cache evicts
//! an image, when the volume shuts down, or when the last handle to a dirty
//! image drops. A node absorbed by a merge is tombstoned first so none of
//! those paths can resurrect its file.

pub mod internal;
pub mod iter;
pub mod leaf;
pub mod ops;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use tracing::warn;

use crate::config::{node_file_name, INTERNAL_NODE_TAG, LEAF_NODE_TAG, NULL_SLOT};
use crate::encoding::{ByteReader, Value};
use crate::error::StoreError;
use crate::storage::{NodeCache, SlotAllocator};

pub use internal::InternalNode;
pub use iter::Enumerator;
pub use leaf::LeafNode;
pub use ops::Tree;

/// Keys are unsigned 64-bit integers throughout the store.
pub type Key = u64;

pub type NodeLock<V> = RwLock<NodeData<V>>;

/// Shared, reference-counted handle to an in-memory node image.
pub type NodeHandle<V> = Arc<NodeLock<V>>;

/// Per-operation context: the pieces of the volume a tree walk needs.
///
/// Nodes do not hold references to the cache or allocator; every operation
/// carries this context on its own stack, which keeps node images free of
/// back-references and lets the borrow checker see the ownership clearly.
pub struct TreeCtx<'a, V: Value> {
    pub dir: &'a Path,
    pub cache: &'a NodeCache<NodeHandle<V>>,
    pub slots: &'a SlotAllocator,
}

// Not derived: the context is all references, so it copies regardless of
// whether V does.
impl<V: Value> Clone for TreeCtx<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V: Value> Copy for TreeCtx<'_, V> {}

/// A split's gift to the parent: the slot of the new right-hand node and
/// the separator key to file it under. The split already published the new
/// node through the cache.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Promotion {
    pub key: Key,
    pub node_slot: u64,
}

/// Structural result of a delete at one level, consumed by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeleteOutcome {
    /// Plain removal; no occupancy repair was needed.
    Deleted,
    /// Took the left sibling's last entry; carries this node's new first key.
    BorrowedLeft(Key),
    /// Took the right sibling's first entry; carries the right sibling's new
    /// first key.
    BorrowedRight(Key),
    /// Absorbed the left sibling; the survivor now lives at the left
    /// sibling's slot. Carries the survivor's minimum key.
    MergedLeft(Key),
    /// Absorbed the right sibling and its next pointer. Carries the
    /// survivor's minimum key.
    MergedRight(Key),
}

/// Sibling coordinates recorded during descent: the parent-side separator
/// key adjacent to the child and the sibling's slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SiblingRef {
    pub key: Key,
    pub slot: u64,
}

/// Shared node metadata: identity on disk plus the write-back flags.
#[derive(Debug)]
pub struct NodeMeta {
    pub(crate) dir: PathBuf,
    pub(crate) slot: u64,
    pub(crate) dirty: bool,
    pub(crate) tombstoned: bool,
}

impl NodeMeta {
    fn new(dir: PathBuf, slot: u64) -> Self {
        Self {
            dir,
            slot,
            dirty: false,
            tombstoned: false,
        }
    }

    pub(crate) fn file_path(&self) -> PathBuf {
        self.dir.join(node_file_name(self.slot))
    }
}

#[derive(Debug)]
pub enum NodeBody<V: Value> {
    Internal(InternalNode),
    Leaf(LeafNode<V>),
}

/// One in-memory node image.
#[derive(Debug)]
pub struct NodeData<V: Value> {
    pub(crate) meta: NodeMeta,
    pub(crate) body: NodeBody<V>,
}

impl<V: Value> NodeData<V> {
    pub(crate) fn new_empty_leaf(dir: &Path, slot: u64) -> Self {
        let mut node = Self {
            meta: NodeMeta::new(dir.to_path_buf(), slot),
            body: NodeBody::Leaf(LeafNode::empty()),
        };
        node.meta.dirty = true;
        node
    }

    pub(crate) fn from_leaf(dir: &Path, slot: u64, leaf: LeafNode<V>) -> Self {
        let mut node = Self {
            meta: NodeMeta::new(dir.to_path_buf(), slot),
            body: NodeBody::Leaf(leaf),
        };
        node.meta.dirty = true;
        node
    }

    pub(crate) fn from_internal(dir: &Path, slot: u64, internal: InternalNode) -> Self {
        let mut node = Self {
            meta: NodeMeta::new(dir.to_path_buf(), slot),
            body: NodeBody::Internal(internal),
        };
        node.meta.dirty = true;
        node
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    pub fn slot(&self) -> u64 {
        self.meta.slot
    }

    /// Moves the node to a different slot. Used by root reallocation before
    /// a root split and by merge-left slot inheritance; the caller re-keys
    /// the cache entry.
    pub(crate) fn set_slot(&mut self, slot: u64) {
        self.meta.slot = slot;
        self.meta.dirty = true;
    }

    pub fn key_count(&self) -> usize {
        match &self.body {
            NodeBody::Internal(node) => node.keys.len(),
            NodeBody::Leaf(leaf) => leaf.keys.len(),
        }
    }

    pub fn last_key(&self) -> Option<Key> {
        match &self.body {
            NodeBody::Internal(node) => node.keys.last().copied(),
            NodeBody::Leaf(leaf) => leaf.keys.last().copied(),
        }
    }

    /// Flags the image as merged away: no flush path may write it again.
    pub(crate) fn mark_not_to_be_flushed(&mut self) {
        self.meta.tombstoned = true;
    }

    pub(crate) fn as_leaf(&self) -> &LeafNode<V> {
        match &self.body {
            NodeBody::Leaf(leaf) => leaf,
            NodeBody::Internal(_) => unreachable!("leaf contract called on internal node"),
        }
    }

    pub(crate) fn as_leaf_mut(&mut self) -> &mut LeafNode<V> {
        match &mut self.body {
            NodeBody::Leaf(leaf) => leaf,
            NodeBody::Internal(_) => unreachable!("leaf contract called on internal node"),
        }
    }

    pub(crate) fn as_internal(&self) -> &InternalNode {
        match &self.body {
            NodeBody::Internal(node) => node,
            NodeBody::Leaf(_) => unreachable!("internal contract called on leaf"),
        }
    }

    pub(crate) fn as_internal_mut(&mut self) -> &mut InternalNode {
        match &mut self.body {
            NodeBody::Internal(node) => node,
            NodeBody::Leaf(_) => unreachable!("internal contract called on leaf"),
        }
    }

    /// Writes the image to its node file if dirty; no-op on clean or
    /// tombstoned images, so repeated flush triggers are safe.
    pub fn flush(&mut self) -> Result<()> {
        if !self.meta.dirty || self.meta.tombstoned {
            return Ok(());
        }

        let bytes = match &self.body {
            NodeBody::Internal(node) => node.encode(),
            NodeBody::Leaf(leaf) => leaf.encode(),
        };

        let path = self.meta.file_path();
        fs::write(&path, bytes)
            .wrap_err_with(|| format!("failed to write node file '{}'", path.display()))?;
        self.meta.dirty = false;
        Ok(())
    }
}

impl<V: Value> Drop for NodeData<V> {
    fn drop(&mut self) {
        // Last-handle write-back: an image evicted while an operation still
        // held it flushes here instead of in the cache disposer.
        if self.meta.dirty && !self.meta.tombstoned {
            if let Err(err) = self.flush() {
                warn!(slot = self.meta.slot, error = %err, "dropping dirty node failed to flush");
            }
        }
    }
}

pub(crate) fn new_handle<V: Value>(data: NodeData<V>) -> NodeHandle<V> {
    Arc::new(RwLock::new(data))
}

/// The volume's write-back disposer: flush the image unless an in-flight
/// operation holds its lock, in which case the image flushes when that
/// operation drops its last handle.
pub(crate) fn write_back<V: Value>(handle: &NodeHandle<V>) -> Result<()> {
    match handle.try_write() {
        Some(mut guard) => guard.flush(),
        None => Ok(()),
    }
}

/// Loads the node stored at `slot`, going through the cache.
///
/// On a miss the node file is read whole, decoded by its discriminator
/// byte, and the fresh handle is inserted into the cache before being
/// returned.
pub(crate) fn load_node<V: Value>(ctx: TreeCtx<'_, V>, slot: u64) -> Result<NodeHandle<V>> {
    if let Some(handle) = ctx.cache.get(slot) {
        return Ok(handle);
    }

    let handle = read_node_file(ctx.dir, slot)?;
    ctx.cache.insert(slot, Arc::clone(&handle))?;
    Ok(handle)
}

/// Reads and decodes `batch_<slot>.dat` without touching the cache.
pub(crate) fn read_node_file<V: Value>(dir: &Path, slot: u64) -> Result<NodeHandle<V>> {
    let path = dir.join(node_file_name(slot));
    let bytes = fs::read(&path)
        .wrap_err_with(|| format!("failed to read node file '{}'", path.display()))?;

    let mut reader = ByteReader::new(&bytes);
    let tag = reader
        .read_u8()
        .map_err(|_| StoreError::corruption(slot, "empty node file"))?;

    let body = match tag {
        INTERNAL_NODE_TAG => NodeBody::Internal(
            InternalNode::decode(&mut reader)
                .map_err(|err| StoreError::corruption(slot, err.to_string()))?,
        ),
        LEAF_NODE_TAG => NodeBody::Leaf(
            LeafNode::decode(&mut reader)
                .map_err(|err| StoreError::corruption(slot, err.to_string()))?,
        ),
        other => {
            return Err(StoreError::corruption(
                slot,
                format!("unknown node discriminator 0x{other:02x}"),
            )
            .into())
        }
    };

    Ok(Arc::new(RwLock::new(NodeData {
        meta: NodeMeta::new(dir.to_path_buf(), slot),
        body,
    })))
}

/// Smallest key in the subtree rooted at `node`, walking first children
/// hand-over-hand down to the leftmost leaf.
pub(crate) fn minimum<V: Value>(ctx: TreeCtx<'_, V>, node: &NodeHandle<V>) -> Result<Key> {
    let leaf = first_leaf(ctx, node)?;
    let guard = leaf.read_arc();
    guard.as_leaf().keys.first().copied().ok_or_else(|| {
        StoreError::InvariantViolation("minimum of an empty leaf requested".into()).into()
    })
}

/// Smallest key under the node stored at `slot`.
pub(crate) fn min_of_subtree<V: Value>(ctx: TreeCtx<'_, V>, slot: u64) -> Result<Key> {
    let node = load_node(ctx, slot)?;
    minimum(ctx, &node)
}

/// Handle to the leftmost leaf of the subtree rooted at `node`, descending
/// hand-over-hand through first children.
pub(crate) fn first_leaf<V: Value>(
    ctx: TreeCtx<'_, V>,
    node: &NodeHandle<V>,
) -> Result<NodeHandle<V>> {
    let mut current = Arc::clone(node);
    let mut guard = current.read_arc();
    loop {
        let next_slot = match &guard.body {
            NodeBody::Leaf(_) => {
                drop(guard);
                return Ok(current);
            }
            NodeBody::Internal(internal) => *internal.children.first().ok_or_else(|| {
                StoreError::InvariantViolation("internal node with no children".into())
            })?,
        };
        if next_slot == NULL_SLOT {
            return Err(
                StoreError::InvariantViolation("internal node points at the null slot".into())
                    .into(),
            );
        }
        let child = load_node(ctx, next_slot)?;
        let child_guard = child.read_arc();
        guard = child_guard;
        current = child;
    }
}

/// Point lookup within the subtree rooted at `start`, descending with
/// hand-over-hand shared locks: the child's lock is taken before the
/// parent's is released, so no merge or split can cut the path.
pub(crate) fn subtree_get<V: Value>(
    ctx: TreeCtx<'_, V>,
    start: &NodeHandle<V>,
    key: Key,
) -> Result<Option<V>> {
    let mut guard = start.read_arc();
    loop {
        let child_slot = match &guard.body {
            NodeBody::Leaf(leaf) => return Ok(leaf.get(key).cloned()),
            NodeBody::Internal(internal) => internal.child_for(key),
        };
        let child = load_node(ctx, child_slot)?;
        let child_guard = child.read_arc();
        guard = child_guard;
    }
}
