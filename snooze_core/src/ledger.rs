//! Ledger persistence with file locking.
//!
//! The whole ledger lives in one JSON document. Readers take a shared lock
//! and writers an exclusive lock on a sidecar `<file>.lock`. The document
//! itself is replaced by rename, so a reader never sees a half-written file.

use crate::{Error, Ledger, Result};
use chrono::FixedOffset;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Backing store for the ledger
///
/// Every engine operation runs inside [`LedgerStore::transact`], which
/// reloads the ledger, applies the closure and persists the result only if
/// the closure changed something.
pub trait LedgerStore {
    /// Read the full ledger. A store that does not exist yet is empty.
    fn load(&self) -> Result<Ledger>;

    /// Atomically replace the stored ledger
    fn save(&self, ledger: &Ledger) -> Result<()>;

    /// Load, mutate and save as one critical section
    ///
    /// The closure's own return value is passed through untouched, so a
    /// closure may report a domain error while still keeping the changes it
    /// made before failing.
    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Ledger) -> T;
}

// ============================================================================
// JSON file store
// ============================================================================

/// Ledger stored as a single pretty-printed JSON document
pub struct JsonLedgerStore {
    path: PathBuf,
    zone: FixedOffset,
}

impl JsonLedgerStore {
    /// Create a store for the given path, normalising timestamps to `zone`
    pub fn new(path: impl Into<PathBuf>, zone: FixedOffset) -> Self {
        Self {
            path: path.into(),
            zone,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.dir().join(name)
    }

    fn open_lock(&self) -> Result<File> {
        std::fs::create_dir_all(self.dir())?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        Ok(file)
    }

    fn corruption(&self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        tracing::warn!("Ledger {:?} is corrupted: {}", self.path, reason);
        Error::StorageCorruption {
            path: self.path.clone(),
            reason,
        }
    }

    /// Read and validate the document; the caller holds a lock
    fn read_unlocked(&self) -> Result<Ledger> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No ledger at {:?}, starting empty", self.path);
                return Ok(Ledger::new());
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            tracing::debug!("Ledger {:?} is empty, starting empty", self.path);
            return Ok(Ledger::new());
        }

        let mut ledger: Ledger =
            serde_json::from_slice(&bytes).map_err(|e| self.corruption(e.to_string()))?;
        ledger
            .check_invariants()
            .map_err(|reason| self.corruption(reason))?;
        ledger.normalize(&self.zone);

        tracing::debug!("Loaded {} users from {:?}", ledger.len(), self.path);
        Ok(ledger)
    }

    /// Write via temp file and rename; the caller holds the exclusive lock
    fn write_unlocked(&self, ledger: &Ledger) -> Result<()> {
        let temp = NamedTempFile::new_in(self.dir())?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, ledger)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved {} users to {:?}", ledger.len(), self.path);
        Ok(())
    }
}

impl LedgerStore for JsonLedgerStore {
    fn load(&self) -> Result<Ledger> {
        if !self.path.exists() {
            tracing::debug!("No ledger at {:?}, starting empty", self.path);
            return Ok(Ledger::new());
        }

        let lock = self.open_lock()?;
        lock.lock_shared()?;
        let result = self.read_unlocked();
        lock.unlock()?;
        result
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        let lock = self.open_lock()?;
        lock.lock_exclusive()?;
        let result = self.write_unlocked(ledger);
        lock.unlock()?;
        result
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Ledger) -> T,
    {
        let lock = self.open_lock()?;
        lock.lock_exclusive()?;

        let result = self.read_unlocked().and_then(|mut ledger| {
            let before = ledger.clone();
            let out = f(&mut ledger);
            if ledger != before {
                self.write_unlocked(&ledger)?;
            }
            Ok(out)
        });

        lock.unlock()?;
        result
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Mutex-guarded ledger that keeps no files, counting how often it is saved
#[derive(Default)]
pub struct MemoryLedgerStore {
    ledger: Mutex<Ledger>,
    saves: AtomicUsize,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing ledger
    pub fn with_ledger(ledger: Ledger) -> Self {
        Self {
            ledger: Mutex::new(ledger),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of times the ledger has been written
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|_| Error::Other("in-memory ledger lock poisoned".into()))
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Ledger> {
        Ok(self.guard()?.clone())
    }

    fn save(&self, ledger: &Ledger) -> Result<()> {
        *self.guard()? = ledger.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Ledger) -> T,
    {
        let mut guard = self.guard()?;
        let mut ledger = guard.clone();
        let out = f(&mut ledger);
        if ledger != *guard {
            *guard = ledger;
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        Ok(out)
    }
}
