//! # Expiry Worker
//!
//! A background thread that turns time-to-live puts into deletes. The
//! worker owns a key → absolute-deadline map (whole seconds since the Unix
//! epoch); once per [`AUTO_DELETE_PERIOD`] it collects every key whose
//! deadline has passed and issues a volume delete for it, tolerating keys
//! that were already removed by the application.
//!
//! ## Persistence
//!
//! The map survives restarts through `keys_ttls.dat`:
//!
//! ```text
//! Offset  Size      Field
//! 0       4         count (u32 LE)
//! 4       16 * n    pairs of key (u64 LE), deadline epoch seconds (u64 LE)
//! ```
//!
//! The file is rewritten through a temporary sibling and renamed into
//! place, so a crash mid-flush leaves the previous map intact. Flush runs
//! on stop and is skipped when the map never changed.
//!
//! ## Shutdown
//!
//! `stop` flips the stop flag, wakes the sleeper, joins the thread, and
//! flushes. The worker holds only a weak volume reference so a volume that
//! is being dropped never waits on its own worker keeping it alive.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::{AUTO_DELETE_PERIOD, EXPIRY_FILE_NAME};
use crate::encoding::{put_u32, put_u64, ByteReader, Value};
use crate::error::is_key_not_found;
use crate::tree::Key;
use crate::volume::VolumeInner;

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

struct ExpiryShared<V: Value> {
    file_path: PathBuf,
    volume: Weak<VolumeInner<V>>,
    deadlines: RwLock<HashMap<Key, u64>>,
    dirty: AtomicBool,
    stop: AtomicBool,
    sleeper: Mutex<()>,
    wakeup: Condvar,
}

impl<V: Value> ExpiryShared<V> {
    /// One scan: collect due keys, delete them through the volume, prune
    /// the map. Returns `false` once the volume is gone.
    fn run_once(&self) -> bool {
        let now = epoch_seconds();
        let due: Vec<Key> = {
            let deadlines = self.deadlines.write();
            deadlines
                .iter()
                .filter(|(_, &deadline)| deadline <= now)
                .map(|(&key, _)| key)
                .collect()
        };

        for key in due {
            if self.stop.load(Ordering::Acquire) {
                return true;
            }
            let Some(volume) = self.volume.upgrade() else {
                return false;
            };
            match volume.delete(key) {
                Ok(()) => {}
                // The application may have deleted the key first; the
                // deadline is simply stale.
                Err(err) if is_key_not_found(&err) => {}
                Err(err) => {
                    warn!(key, error = %err, "expiry delete failed");
                }
            }
            self.deadlines.write().remove(&key);
            self.dirty.store(true, Ordering::Release);
        }
        true
    }

    fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let deadlines = self.deadlines.read();
        let mut buf = Vec::with_capacity(4 + deadlines.len() * 16);
        put_u32(&mut buf, deadlines.len() as u32);
        for (&key, &deadline) in deadlines.iter() {
            put_u64(&mut buf, key);
            put_u64(&mut buf, deadline);
        }
        drop(deadlines);

        let tmp_path = self.file_path.with_extension("dat.tmp");
        fs::write(&tmp_path, &buf).wrap_err_with(|| {
            format!("failed to write expiry file '{}'", tmp_path.display())
        })?;
        fs::rename(&tmp_path, &self.file_path).wrap_err_with(|| {
            format!("failed to publish expiry file '{}'", self.file_path.display())
        })?;
        Ok(())
    }
}

pub(crate) struct ExpiryWorker<V: Value> {
    shared: Arc<ExpiryShared<V>>,
    thread: Option<JoinHandle<()>>,
}

impl<V: Value> ExpiryWorker<V> {
    /// Loads any persisted deadlines and starts the scan thread.
    pub(crate) fn start(
        dir: &std::path::Path,
        volume: Weak<VolumeInner<V>>,
    ) -> Result<Self> {
        let file_path = dir.join(EXPIRY_FILE_NAME);
        let deadlines = load_deadlines(&file_path)?;
        debug!(
            deadlines = deadlines.len(),
            "starting expiry worker for '{}'",
            dir.display()
        );

        let shared = Arc::new(ExpiryShared {
            file_path,
            volume,
            deadlines: RwLock::new(deadlines),
            dirty: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            sleeper: Mutex::new(()),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("volkv-expiry".into())
            .spawn(move || worker_loop(worker_shared))
            .wrap_err("failed to spawn the expiry worker thread")?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Records `key` to be deleted `ttl_seconds` from now, overwriting any
    /// earlier deadline for the same key.
    pub(crate) fn note_put(&self, key: Key, ttl_seconds: u64) {
        let deadline = epoch_seconds().saturating_add(ttl_seconds);
        self.shared.deadlines.write().insert(key, deadline);
        self.shared.dirty.store(true, Ordering::Release);
    }

    /// Drops the deadline for an explicitly deleted key.
    pub(crate) fn note_delete(&self, key: Key) {
        if self.shared.deadlines.write().remove(&key).is_some() {
            self.shared.dirty.store(true, Ordering::Release);
        }
    }

    /// Stops the thread and flushes the deadline map.
    pub(crate) fn stop(mut self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);
        {
            let _guard = self.shared.sleeper.lock();
            self.shared.wakeup.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("expiry worker thread panicked before shutdown");
            }
        }
        self.shared.flush()
    }
}

impl<V: Value> Drop for ExpiryWorker<V> {
    fn drop(&mut self) {
        // Normal shutdown goes through `stop`; this is the abandoned-worker
        // path, so the thread is told to stop but not joined.
        self.shared.stop.store(true, Ordering::Release);
        let _guard = self.shared.sleeper.lock();
        self.shared.wakeup.notify_all();
    }
}

fn worker_loop<V: Value>(shared: Arc<ExpiryShared<V>>) {
    loop {
        let started = Instant::now();
        if !shared.run_once() {
            // Volume gone; nothing left to delete for.
            return;
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        let elapsed = started.elapsed();
        let pause = AUTO_DELETE_PERIOD.saturating_sub(elapsed);
        if !pause.is_zero() {
            let mut guard = shared.sleeper.lock();
            if shared.stop.load(Ordering::Acquire) {
                return;
            }
            shared.wakeup.wait_for(&mut guard, pause);
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }
    }
}

fn load_deadlines(path: &std::path::Path) -> Result<HashMap<Key, u64>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HashMap::new());
        }
        Err(err) => {
            return Err(err).wrap_err_with(|| {
                format!("failed to read expiry file '{}'", path.display())
            });
        }
    };

    let mut reader = ByteReader::new(&bytes);
    let count = reader.read_u32()? as usize;
    let mut deadlines = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = reader.read_u64()?;
        let deadline = reader.read_u64()?;
        deadlines.insert(key, deadline);
    }
    Ok(deadlines)
}
