//! # Volume Façade
//!
//! A [`Volume`] owns one directory of node files and exposes the public
//! API: point put (optionally with a TTL), point get, point delete, ordered
//! enumeration, subtree handles for external aggregation, and explicit
//! shutdown. All methods are safe to call from many threads at once.
//!
//! ## Layering
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │ Volume (public API, expiry worker)    │
//! ├───────────────────────────────────────┤
//! │ Tree (crabbing insert/lookup/delete)  │
//! ├───────────────────────────────────────┤
//! │ Node images (leaf / internal + codec) │
//! ├───────────────────────────────────────┤
//! │ NodeCache (LFU, write-back) · slots   │
//! ├───────────────────────────────────────┤
//! │ One file per node in the directory    │
//! └───────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! Mutations stay in the cache until eviction, `stop_and_flush`, or drop.
//! `stop_and_flush` stops the expiry worker, persists its deadline map,
//! flushes the root, and drains the cache through the write-back disposer;
//! after it returns, a fresh process can open the directory and see every
//! acknowledged write. Dropping the volume does the same on a best-effort
//! basis, logging instead of failing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::config::{DEFAULT_CACHE_CAPACITY, ROOT_SLOT};
use crate::encoding::Value;
use crate::error::StoreError;
use crate::expiry::ExpiryWorker;
use crate::storage::{NodeCache, SlotAllocator};
use crate::tree::{
    self, load_node, new_handle, read_node_file, subtree_get, Enumerator, Key, NodeData,
    NodeHandle, Tree, TreeCtx,
};

/// Everything the tree operations and the expiry worker share; the public
/// [`Volume`] wraps this in an `Arc` so the worker can hold a weak handle.
pub(crate) struct VolumeInner<V: Value> {
    dir: PathBuf,
    cache: NodeCache<NodeHandle<V>>,
    slots: SlotAllocator,
    /// The volume lock: guards the root pointer and gates structural
    /// writers (see `tree::ops`).
    gate: RwLock<NodeHandle<V>>,
}

impl<V: Value> VolumeInner<V> {
    fn ctx(&self) -> TreeCtx<'_, V> {
        TreeCtx {
            dir: &self.dir,
            cache: &self.cache,
            slots: &self.slots,
        }
    }

    fn tree(&self) -> Tree<'_, V> {
        Tree::new(self.ctx(), &self.gate)
    }

    pub(crate) fn delete(&self, key: Key) -> Result<()> {
        self.tree().delete(key)
    }
}

/// An embedded, disk-backed, ordered key–value store over one directory.
///
/// The volume owns an OS resource, so it moves but does not clone.
pub struct Volume<V: Value> {
    inner: Arc<VolumeInner<V>>,
    expiry: Mutex<Option<ExpiryWorker<V>>>,
}

impl<V: Value> Volume<V> {
    /// Opens `dir` with the default cache capacity, creating the directory
    /// and an empty root leaf when the volume does not exist yet.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(dir, DEFAULT_CACHE_CAPACITY)
    }

    /// Opens `dir`, bounding the node cache at `cache_capacity` images.
    pub fn open_with_capacity(dir: impl AsRef<Path>, cache_capacity: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).wrap_err_with(|| {
            format!("failed to create volume directory '{}'", dir.display())
        })?;

        let root_path = dir.join(crate::config::node_file_name(ROOT_SLOT));
        let root = if root_path.exists() {
            read_node_file(&dir, ROOT_SLOT)?
        } else {
            let fresh = new_handle(NodeData::<V>::new_empty_leaf(&dir, ROOT_SLOT));
            fresh.write().flush()?;
            fresh
        };
        debug!("opened volume at '{}'", dir.display());

        let cache: NodeCache<NodeHandle<V>> =
            NodeCache::new(cache_capacity, Box::new(tree::write_back::<V>));
        cache.insert(ROOT_SLOT, Arc::clone(&root))?;

        Ok(Self {
            inner: Arc::new(VolumeInner {
                slots: SlotAllocator::new(&dir),
                dir,
                cache,
                gate: RwLock::new(root),
            }),
            expiry: Mutex::new(None),
        })
    }

    /// Inserts `(key, value)`. Fails with [`StoreError::DuplicateKey`] when
    /// the key is already present, leaving the tree untouched.
    pub fn put(&self, key: Key, value: V) -> Result<()> {
        self.inner.tree().insert(key, value)
    }

    /// [`put`](Self::put), additionally scheduling the key for deletion
    /// `ttl_seconds` from now. The deadline is recorded only while the
    /// expiry worker is running.
    pub fn put_with_ttl(&self, key: Key, value: V, ttl_seconds: u64) -> Result<()> {
        self.inner.tree().insert(key, value)?;
        if let Some(worker) = self.expiry.lock().as_ref() {
            worker.note_put(key, ttl_seconds);
        }
        Ok(())
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: Key) -> Result<Option<V>> {
        self.inner.tree().lookup(key)
    }

    /// Removes `key`. Fails with [`StoreError::KeyNotFound`] when absent;
    /// callers wanting idempotent deletes suppress that kind themselves.
    pub fn delete(&self, key: Key) -> Result<()> {
        self.inner.delete(key)?;
        if let Some(worker) = self.expiry.lock().as_ref() {
            worker.note_delete(key);
        }
        Ok(())
    }

    /// Read-only handle to the subtree rooted at `slot`; slot 1 is the
    /// volume root. This is the composition point for external aggregation
    /// layers, which see only the subtree-get contract.
    pub fn custom_subtree(&self, slot: u64) -> Result<Subtree<V>> {
        let node = if slot == ROOT_SLOT {
            Arc::clone(&self.inner.gate.read())
        } else {
            load_node(self.inner.ctx(), slot)?
        };
        Ok(Subtree {
            inner: Arc::clone(&self.inner),
            node,
        })
    }

    /// Ascending iteration over every pair in the volume.
    ///
    /// The iterator holds the volume lock against writers for its whole
    /// lifetime: the yielded sequence is a snapshot, structural writers
    /// wait until it drops, and point lookups run concurrently.
    pub fn enumerate(&self) -> Result<Enumerator<'_, V>> {
        Enumerator::new(self.inner.ctx(), self.inner.gate.upgradable_read())
    }

    /// Starts the background expiry worker, loading any persisted
    /// deadlines. Fails with [`StoreError::AlreadyStarted`] when running.
    pub fn start_auto_delete(&self) -> Result<()> {
        let mut expiry = self.expiry.lock();
        if expiry.is_some() {
            return Err(StoreError::AlreadyStarted.into());
        }
        *expiry = Some(ExpiryWorker::start(
            &self.inner.dir,
            Arc::downgrade(&self.inner),
        )?);
        Ok(())
    }

    /// Stops the expiry worker (persisting its map) and writes every dirty
    /// node image back to the directory.
    pub fn stop_and_flush(&self) -> Result<()> {
        if let Some(worker) = self.expiry.lock().take() {
            worker.stop()?;
        }

        // Pin the root pointer while flushing so no writer swaps it away
        // between the root flush and the cache drain.
        let gate = self.inner.gate.read();
        gate.write().flush()?;
        self.inner.cache.clear()?;
        debug!("flushed volume at '{}'", self.inner.dir.display());
        Ok(())
    }
}

impl<V: Value> Drop for Volume<V> {
    fn drop(&mut self) {
        if let Err(err) = self.stop_and_flush() {
            error!(error = %err, "volume shutdown flush failed");
        }
    }
}

/// Read-only view of one subtree, kept alive independently of the cache.
pub struct Subtree<V: Value> {
    inner: Arc<VolumeInner<V>>,
    node: NodeHandle<V>,
}

impl<V: Value> Subtree<V> {
    /// Point lookup within this subtree, under the volume's shared lock.
    pub fn get(&self, key: Key) -> Result<Option<V>> {
        let _gate = self.inner.gate.read();
        subtree_get(self.inner.ctx(), &self.node, key)
    }
}
