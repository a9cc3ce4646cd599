//! # VolKV - Embedded Ordered Key-Value Volumes
//!
//! VolKV is an embedded, disk-backed, ordered key-value store. Keys are
//! `u64`; values are one element type per volume, chosen from u32, u64,
//! f32, f64, UTF-8 strings, and raw byte buffers. A [`Volume`] owns a
//! directory of node files and stays correct under many concurrent
//! threads while bounding its in-memory working set independently of the
//! tree size.
//!
//! ## Quick Start
//!
//! ```ignore
//! use volkv::Volume;
//!
//! let volume: Volume<String> = Volume::open("./data")?;
//! volume.put(33, "ololo".to_string())?;
//! assert_eq!(volume.get(33)?, Some("ololo".to_string()));
//!
//! for pair in volume.enumerate()? {
//!     let (key, value) = pair?;
//!     println!("{key} => {value}");
//! }
//!
//! volume.stop_and_flush()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Public API (Volume, Subtree)     │
//! ├─────────────────────────────────────────┤
//! │  Expiry worker (TTL deletes, 1s cadence)│
//! ├─────────────────────────────────────────┤
//! │  B+ tree ops (crabbing lock protocol)   │
//! ├─────────────────────────────────────────┤
//! │  Node images (leaf / internal + codec)  │
//! ├─────────────────────────────────────────┤
//! │  Node cache (approx-LFU, write-back)    │
//! ├─────────────────────────────────────────┤
//! │  Slot allocator + one file per node     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! volume_dir/
//! ├── batch_1.dat      # Root node (slot 1, always)
//! ├── batch_2.dat      # One file per live node
//! ├── batch_7.dat      # Slot numbers may have holes
//! └── keys_ttls.dat    # Persisted TTL deadlines (if TTLs were used)
//! ```
//!
//! All on-disk integers and floats are little-endian; node files open with
//! a one-byte discriminator (`0x38` internal, `0x39` leaf). The formats
//! are stable: a future process can always reopen an existing directory.
//!
//! ## Concurrency
//!
//! Readers descend with hand-over-hand shared locks and run concurrently
//! with each other and with the single active structural writer, which
//! crab-walks down with upgradable locks and only excludes readers on the
//! short path it actually mutates. Enumeration pins a snapshot by holding
//! the volume's shared lock for the iterator's lifetime.
//!
//! ## Module Overview
//!
//! - [`volume`]: the public façade and subtree handles
//! - [`tree`]: node model, crabbing operations, enumeration
//! - [`storage`]: slot allocation and the write-back node cache
//! - [`encoding`]: little-endian codec and the per-volume value types
//! - [`config`]: tree geometry and tunables
//! - [`error`]: matchable error kinds

pub mod config;
pub mod encoding;
pub mod error;
mod expiry;
pub mod storage;
pub mod tree;
pub mod volume;

pub use encoding::Value;
pub use error::{is_key_not_found, store_error, StoreError};
pub use tree::{Enumerator, Key};
pub use volume::{Subtree, Volume};
