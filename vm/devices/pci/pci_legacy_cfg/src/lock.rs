// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Advisory lock serializing configuration transactions between processes.

// UNSAFETY: calling flock.
#![cfg_attr(unix, expect(unsafe_code))]

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from [`TransactionLock`].
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file could not be opened or created.
    #[error("failed to open lock file {}", path.display())]
    Open {
        /// Lock file path.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        err: io::Error,
    },
    /// The lock could not be taken.
    #[error("failed to lock {}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        err: io::Error,
    },
}

/// An exclusive `flock` taken around each CONFIG_ADDRESS/CONFIG_DATA pair.
///
/// Only processes that use the same lock file are excluded. The kernel and
/// its drivers use the ports without consulting it, so this narrows the
/// window for interleaved transactions but does not close it.
#[derive(Debug)]
pub struct TransactionLock {
    file: File,
    path: PathBuf,
}

/// Holds the lock until dropped.
#[must_use]
#[derive(Debug)]
pub struct TransactionGuard<'a> {
    lock: &'a TransactionLock,
}

impl TransactionLock {
    /// Opens `path`, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| LockError::Open {
                path: path.clone(),
                err,
            })?;
        Ok(Self { file, path })
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the lock is held exclusively.
    pub fn acquire(&self) -> Result<TransactionGuard<'_>, LockError> {
        sys::lock_exclusive(&self.file).map_err(|err| LockError::Lock {
            path: self.path.clone(),
            err,
        })?;
        Ok(TransactionGuard { lock: self })
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = sys::unlock(&self.lock.file) {
            tracing::warn!(
                path = %self.lock.path.display(),
                error = &err as &dyn std::error::Error,
                "failed to release transaction lock"
            );
        }
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;

    fn flock(file: &File, operation: i32) -> io::Result<()> {
        loop {
            // SAFETY: the descriptor is owned by `file` and stays open for the call.
            let r = unsafe { libc::flock(file.as_raw_fd(), operation) };
            if r == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn lock_exclusive(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_EX)
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        flock(file, libc::LOCK_UN)
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    pub fn lock_exclusive(_file: &File) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn unlock(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn guard_excludes_second_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.lock");
        let first = TransactionLock::open(&path).unwrap();
        let second = TransactionLock::open(&path).unwrap();

        let guard = first.acquire().unwrap();
        // SAFETY: probing the lock state of an open descriptor.
        let r = unsafe { libc::flock(second.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(r, -1);
        drop(guard);

        let guard = second.acquire().unwrap();
        drop(guard);
        assert_eq!(first.path(), second.path());
    }

    #[test]
    fn open_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("cfg.lock");
        let err = TransactionLock::open(&path).unwrap_err();
        assert!(matches!(err, LockError::Open { .. }));
        assert!(err.to_string().contains("cfg.lock"));
    }
}
