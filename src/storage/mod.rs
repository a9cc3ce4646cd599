//! # Storage Module
//!
//! The foundational storage layer for a volume directory: slot-numbered node
//! files and the bounded in-memory cache in front of them.
//!
//! ## Directory Layout
//!
//! ```text
//! volume_dir/
//! ├── batch_1.dat      # Current root (slot 1, always)
//! ├── batch_2.dat      # Further nodes, one file per slot
//! ├── batch_5.dat      # Slot numbers may have holes (freed by merges)
//! └── keys_ttls.dat    # Persisted expiry deadlines (only if TTLs were used)
//! ```
//!
//! ## Components
//!
//! - [`slots`]: allocation and release of the dense slot numbers that name
//!   node files. Slot 0 means "none"; slot 1 is reserved for the root.
//! - [`cache`]: bounded slot → node map with approximate least-frequently-
//!   used eviction and a write-back disposer.
//!
//! The cache is generic over the cached handle so this layer stays ignorant
//! of node internals; the volume wires it to the tree's shared node handles
//! and supplies a disposer that flushes dirty images.

pub mod cache;
pub mod slots;

pub use cache::NodeCache;
pub use slots::SlotAllocator;
