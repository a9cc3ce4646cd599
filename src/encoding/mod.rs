//! # Encoding Module
//!
//! Byte-level encoding for the on-disk node and expiry files:
//!
//! - **Primitive codec**: bounds-checked little-endian readers and writers
//!   for the fixed-width fields of node files
//! - **Value codec**: the per-volume element-type capability set (encode,
//!   decode, exact encoded size) for the six supported value types

pub mod primitive;
pub mod value;

pub use primitive::{put_u32, put_u64, ByteReader};
pub use value::Value;
