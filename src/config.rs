//! # VolKV Configuration Constants
//!
//! This module centralizes the tree geometry and runtime tunables. Constants
//! that depend on each other are co-located and tied together with
//! compile-time assertions so the derived values cannot drift from `B`.
//!
//! ## Dependency Graph
//!
//! ```text
//! B (150, branching factor: max children per internal node)
//!   │
//!   ├─> MAX_KEYS (B - 1)
//!   │     Full-node threshold. A node holding MAX_KEYS keys splits on the
//!   │     next insertion routed into it.
//!   │
//!   └─> MIN_KEYS (B/2 - 1 for even B, (B-1)/2 for odd B)
//!         Minimum-occupancy threshold. A non-root node that drops below
//!         MIN_KEYS after a delete borrows from a sibling when the donor
//!         holds strictly more than MIN_KEYS keys, and merges otherwise.
//!
//! ACCESS_CEILING
//!   │
//!   └─> When a cache entry's access counter reaches this value the cache
//!       rescales every counter by the global minimum instead of letting the
//!       counter saturate (a saturated entry would become immortal).
//! ```
//!
//! ## On-Disk Constants
//!
//! The discriminator bytes and file naming are format-stable: a future
//! process must be able to open a directory written by this one. Changing
//! any of them is a breaking format change.

/// Branching factor: maximum number of children per internal node.
pub const B: usize = 150;

/// Maximum number of keys any node may hold.
pub const MAX_KEYS: usize = B - 1;

/// Minimum-occupancy threshold for non-root nodes.
///
/// A delete that leaves a non-root node below this count triggers borrow or
/// merge; a donor sibling is eligible only while it holds strictly more than
/// this many keys.
pub const MIN_KEYS: usize = if B % 2 == 0 { B / 2 - 1 } else { (B - 1) / 2 };

const _: () = assert!(MAX_KEYS == B - 1, "MAX_KEYS must stay derived from B");
const _: () = assert!(
    MIN_KEYS * 2 < MAX_KEYS + 1,
    "two minimally-occupied nodes must fit in one after a merge"
);
const _: () = assert!(B >= 4, "trees below B=4 cannot satisfy the occupancy rules");

/// Number of key/value pairs moved to the new sibling by a split.
pub const SPLIT_COPY_COUNT: usize = MAX_KEYS / 2;

/// Default bound on the number of node images the cache may hold.
pub const DEFAULT_CACHE_CAPACITY: usize = 200_000;

/// Access-counter ceiling at which the cache rescales all counters.
pub const ACCESS_CEILING: u64 = u64::MAX / 2;

/// Cadence of the expiry worker's scan over the deadlines map.
pub const AUTO_DELETE_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Discriminator byte opening every internal-node file.
pub const INTERNAL_NODE_TAG: u8 = 0x38;

/// Discriminator byte opening every leaf file.
pub const LEAF_NODE_TAG: u8 = 0x39;

/// Slot number permanently reserved for the current root.
pub const ROOT_SLOT: u64 = 1;

/// Slot number meaning "no node" (end of the leaf chain, absent sibling).
pub const NULL_SLOT: u64 = 0;

/// File carrying the persisted key -> expiry-deadline map.
pub const EXPIRY_FILE_NAME: &str = "keys_ttls.dat";

/// Returns the file name storing the node at `slot`.
pub fn node_file_name(slot: u64) -> String {
    format!("batch_{slot}.dat")
}
