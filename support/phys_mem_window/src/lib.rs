// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded 32-bit access to a page-sized window of physical memory.
//!
//! Every [`RegionAccessor`] operation maps a fresh [`WINDOW_SIZE`] window,
//! performs its accesses, and drops the window before returning. Nothing is
//! cached between calls.

#[cfg(unix)]
mod dev_mem;
#[cfg(any(test, feature = "test_helpers"))]
pub mod ram;

#[cfg(unix)]
pub use dev_mem::DEFAULT_DEV_MEM;
#[cfg(unix)]
pub use dev_mem::DevMem;
#[cfg(unix)]
pub use dev_mem::MappedWindow;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Size of the window mapped for each access.
pub const WINDOW_SIZE: usize = 4096;

/// Largest offset at which a 32-bit access still fits in the window.
pub const MAX_WORD_OFFSET: usize = WINDOW_SIZE - size_of::<u32>();

/// Errors from physical memory access.
#[derive(Debug, Error)]
pub enum RegionError {
    /// The physical memory device could not be opened.
    #[error("failed to open physical memory device {}", path.display())]
    Access {
        /// Device path.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        err: io::Error,
    },
    /// The window could not be mapped.
    #[error("failed to map {len:#x} bytes of physical memory at {base:#x}")]
    Map {
        /// Requested physical base.
        base: u64,
        /// Requested length.
        len: usize,
        /// The underlying OS error.
        #[source]
        err: io::Error,
    },
    /// The access does not fit in the window.
    #[error("offset {offset:#x} is outside the {len:#x} byte window")]
    OutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Window length.
        len: usize,
    },
    /// The access is not naturally aligned.
    ///
    /// Stricter than the 0..=4092 window bound alone: an offset such as 2 is
    /// inside the window but refused, since the word is moved with a single
    /// aligned volatile load or store rather than an unaligned one.
    #[error("physical address {0:#x} is not aligned for a 32-bit access")]
    Misaligned(u64),
}

/// A source of physical memory windows.
pub trait PhysicalMemory {
    /// The mapping type. Dropping it releases the mapping.
    type Window: MemoryWindow;

    /// Maps `len` bytes starting at `physical_base`.
    fn map_window(&self, physical_base: u64, len: usize) -> Result<Self::Window, RegionError>;
}

/// Word access to a mapped window. Offsets are relative to the window base.
pub trait MemoryWindow {
    /// Length of the window in bytes.
    fn len(&self) -> usize;
    /// Reads a `u32` with a single load.
    fn read_u32(&self, offset: usize) -> Result<u32, RegionError>;
    /// Writes a `u32` with a single store.
    fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegionError>;
}

/// Result of [`RegionAccessor::write_word`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The value before the write.
    pub previous: u32,
    /// The value written.
    pub written: u32,
    /// The value read back after the write.
    pub reread: u32,
}

impl WriteOutcome {
    /// Whether the read-back matched the written value.
    ///
    /// Read-only and self-clearing registers legitimately fail this.
    pub fn verified(&self) -> bool {
        self.reread == self.written
    }
}

/// Performs one bounded read, or a read-write-verify, per call.
#[derive(Debug)]
pub struct RegionAccessor<M> {
    memory: M,
}

impl<M: PhysicalMemory> RegionAccessor<M> {
    /// Creates an accessor over `memory`.
    pub fn new(memory: M) -> Self {
        Self { memory }
    }

    /// The physical memory source.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Reads the `u32` at `offset` in the window at `physical_base`.
    pub fn read_word(&self, physical_base: u64, offset: usize) -> Result<u32, RegionError> {
        check_word_access(physical_base, offset)?;
        let window = self.memory.map_window(physical_base, WINDOW_SIZE)?;
        let value = window.read_u32(offset)?;
        tracing::debug!(physical_base, offset, value, "read word");
        Ok(value)
    }

    /// Writes `value` at `offset` in the window at `physical_base`, reading the
    /// word before and after.
    ///
    /// A read-back that differs from `value` is reported, not treated as an
    /// error.
    pub fn write_word(
        &self,
        physical_base: u64,
        offset: usize,
        value: u32,
    ) -> Result<WriteOutcome, RegionError> {
        check_word_access(physical_base, offset)?;
        let window = self.memory.map_window(physical_base, WINDOW_SIZE)?;
        let previous = window.read_u32(offset)?;
        window.write_u32(offset, value)?;
        let reread = window.read_u32(offset)?;
        let outcome = WriteOutcome {
            previous,
            written: value,
            reread,
        };
        tracing::debug!(
            physical_base,
            offset,
            previous,
            value,
            reread,
            verified = outcome.verified(),
            "wrote word"
        );
        Ok(outcome)
    }
}

/// Rejects a 32-bit access at `offset` that would leave the window or be
/// misaligned, before anything is mapped.
pub fn check_word_access(physical_base: u64, offset: usize) -> Result<(), RegionError> {
    if offset > MAX_WORD_OFFSET {
        return Err(RegionError::OutOfBounds {
            offset,
            len: WINDOW_SIZE,
        });
    }
    let address = physical_base
        .checked_add(offset as u64)
        .ok_or(RegionError::OutOfBounds {
            offset,
            len: WINDOW_SIZE,
        })?;
    if address % size_of::<u32>() as u64 != 0 {
        return Err(RegionError::Misaligned(address));
    }
    Ok(())
}
