// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sparse in-memory physical address space, for tests.

use crate::MemoryWindow;
use crate::PhysicalMemory;
use crate::RegionError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;

#[derive(Debug, Default)]
struct RamState {
    dwords: HashMap<u64, u32>,
    read_only: HashSet<u64>,
    limit: Option<u64>,
    live_windows: usize,
    mappings: usize,
}

/// Physical memory backed by a map of double words. Unset words read as zero.
///
/// Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct RamMemory {
    state: Arc<Mutex<RamState>>,
}

impl RamMemory {
    /// Creates an empty, unbounded address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an address space where mapping anything past `limit` fails.
    pub fn with_limit(limit: u64) -> Self {
        let this = Self::new();
        this.state.lock().limit = Some(limit);
        this
    }

    /// Sets the double word at `address`.
    pub fn set_dword(&self, address: u64, value: u32) {
        self.state.lock().dwords.insert(address, value);
    }

    /// Returns the double word at `address`.
    pub fn dword(&self, address: u64) -> u32 {
        self.state.lock().dwords.get(&address).copied().unwrap_or(0)
    }

    /// Makes writes to `address` have no effect.
    pub fn set_read_only(&self, address: u64) {
        self.state.lock().read_only.insert(address);
    }

    /// Number of successful mappings so far.
    pub fn mappings(&self) -> usize {
        self.state.lock().mappings
    }

    /// Number of windows not yet dropped.
    pub fn live_windows(&self) -> usize {
        self.state.lock().live_windows
    }
}

impl PhysicalMemory for RamMemory {
    type Window = RamWindow;

    fn map_window(&self, physical_base: u64, len: usize) -> Result<RamWindow, RegionError> {
        let mut state = self.state.lock();
        let end = physical_base.checked_add(len as u64);
        if let Some(limit) = state.limit
            && end.is_none_or(|end| end > limit)
        {
            return Err(RegionError::Map {
                base: physical_base,
                len,
                err: io::ErrorKind::AddrNotAvailable.into(),
            });
        }
        state.mappings += 1;
        state.live_windows += 1;
        Ok(RamWindow {
            state: self.state.clone(),
            physical_base,
            len,
        })
    }
}

/// A window onto [`RamMemory`].
#[derive(Debug)]
pub struct RamWindow {
    state: Arc<Mutex<RamState>>,
    physical_base: u64,
    len: usize,
}

impl RamWindow {
    fn address(&self, offset: usize) -> Result<u64, RegionError> {
        if self.len < offset || self.len - offset < size_of::<u32>() {
            return Err(RegionError::OutOfBounds {
                offset,
                len: self.len,
            });
        }
        let address = self.physical_base + offset as u64;
        if address % 4 != 0 {
            return Err(RegionError::Misaligned(address));
        }
        Ok(address)
    }
}

impl MemoryWindow for RamWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> Result<u32, RegionError> {
        let address = self.address(offset)?;
        Ok(self
            .state
            .lock()
            .dwords
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegionError> {
        let address = self.address(offset)?;
        let mut state = self.state.lock();
        if !state.read_only.contains(&address) {
            state.dwords.insert(address, value);
        }
        Ok(())
    }
}

impl Drop for RamWindow {
    fn drop(&mut self) {
        self.state.lock().live_windows -= 1;
    }
}
