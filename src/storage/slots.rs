//! # Slot Allocator
//!
//! Slots are the dense integer identifiers naming per-node files
//! (`batch_<slot>.dat`) in the volume directory. The allocator hands out
//! fresh slots for split-created siblings and unlinks the files of slots
//! vacated by merges.
//!
//! ## Allocation Policy
//!
//! A guarded `next` counter starts at 1 ("last allocated or reserved") and
//! only ever increases within a process lifetime. `allocate` increments it
//! past 0 and 1 (reserved) until it lands on a slot whose file does not
//! exist. Holes left by released slots are not reused in the current
//! process; a restart rescans from 1 and picks them up, which keeps
//! allocation deterministic across restarts without any on-disk free list.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

use crate::config::{node_file_name, ROOT_SLOT};

#[derive(Debug)]
pub struct SlotAllocator {
    dir: PathBuf,
    next: Mutex<u64>,
}

impl SlotAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next: Mutex::new(ROOT_SLOT),
        }
    }

    /// Returns a slot number whose node file does not exist yet.
    ///
    /// The counter is not decremented on [`release`](Self::release); the
    /// returned slot stays claimed until its file is unlinked and the
    /// process restarts.
    pub fn allocate(&self) -> u64 {
        let mut next = self.next.lock();
        loop {
            *next += 1;
            if *next <= ROOT_SLOT {
                continue;
            }
            if !self.dir.join(node_file_name(*next)).exists() {
                return *next;
            }
        }
    }

    /// Unlinks the node file of `slot`. Missing files are not an error: a
    /// merge may race a crashed predecessor that never flushed the loser.
    pub fn release(&self, slot: u64) -> Result<()> {
        let _guard = self.next.lock();
        let path = self.dir.join(node_file_name(slot));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).wrap_err_with(|| {
                format!("failed to remove node file '{}'", path.display())
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
