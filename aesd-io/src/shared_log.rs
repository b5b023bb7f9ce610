//! Shared append-only log backed by a single file.
//!
//! One mutex guards the file handle for both appends and snapshots, so a
//! snapshot observes exactly the appends that acquired the lock before it and
//! never a partially written one.

use aesd_core::{AesdError, Result};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
#[cfg(any(test, feature = "fault-injection"))]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct SharedLog {
    path: PathBuf,
    file: Mutex<File>,
    #[cfg(any(test, feature = "fault-injection"))]
    failing_appends: AtomicUsize,
}

impl SharedLog {
    /// Create the log at `path`, discarding any file left over from a
    /// previous run.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        remove_if_exists(&path).map_err(AesdError::Storage)?;

        let file = open_log_file(&path).map_err(AesdError::Storage)?;
        debug!(target: "aesd_io::log", path = %path.display(), "Shared log created");

        Ok(Self {
            path,
            file: Mutex::new(file),
            #[cfg(any(test, feature = "fault-injection"))]
            failing_appends: AtomicUsize::new(0),
        })
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `data` to the end of the log and fsync before releasing the lock.
    ///
    /// Returns the log length after the append.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let mut file = self.lock()?;
        #[cfg(any(test, feature = "fault-injection"))]
        if self.take_injected_failure() {
            return Err(AesdError::Storage(std::io::Error::other("injected append failure")));
        }
        file.write_all(data).map_err(AesdError::Storage)?;
        file.sync_all().map_err(AesdError::Storage)?;
        let len = file.metadata().map_err(AesdError::Storage)?.len();

        debug!(target: "aesd_io::log", bytes = data.len(), len, "Appended to shared log");
        Ok(len)
    }

    /// Read the full contents of the log at a single consistent point.
    pub fn snapshot(&self) -> Result<Bytes> {
        let mut file = self.lock()?;
        let len = file.metadata().map_err(AesdError::Storage)?.len();
        let len = usize::try_from(len).map_err(|_| {
            AesdError::Storage(std::io::Error::new(
                ErrorKind::InvalidData,
                "log too large to snapshot",
            ))
        })?;

        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(0)).map_err(AesdError::Storage)?;
        file.read_exact(&mut buf).map_err(AesdError::Storage)?;

        Ok(Bytes::from(buf))
    }

    /// Current log length in bytes
    pub fn len(&self) -> Result<u64> {
        let file = self.lock()?;
        Ok(file.metadata().map_err(AesdError::Storage)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate the log and delete its backing file.
    pub fn reset(&self) -> Result<()> {
        let file = self.lock()?;
        if let Err(e) = file.set_len(0) {
            warn!(
                target: "aesd_io::log",
                path = %self.path.display(),
                error = %e,
                "Failed to truncate shared log"
            );
        }
        remove_if_exists(&self.path).map_err(AesdError::Storage)?;

        debug!(target: "aesd_io::log", path = %self.path.display(), "Shared log removed");
        Ok(())
    }

    /// Make the next `count` appends fail with a storage error, leaving the
    /// file untouched.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::Release);
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn take_injected_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> Result<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| AesdError::Storage(std::io::Error::other("shared log lock poisoned")))
    }
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .append(true)
        .open(path)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
