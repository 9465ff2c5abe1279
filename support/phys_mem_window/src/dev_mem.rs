// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Windows onto the kernel's physical memory device.

// UNSAFETY: mmap/munmap and volatile access to the mapping.
#![expect(unsafe_code)]

use crate::MemoryWindow;
use crate::PhysicalMemory;
use crate::RegionError;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// The physical memory device on Linux. [`DevMem::with_path`] takes it or any
/// file whose offsets stand in for physical addresses.
pub const DEFAULT_DEV_MEM: &str = "/dev/mem";

/// Maps physical memory through a device file such as `/dev/mem`.
///
/// The device is opened per mapping and closed when the mapping is dropped.
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
}

impl DevMem {
    /// Uses the device or file at `path`. The file offset is the physical
    /// address.
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PhysicalMemory for DevMem {
    type Window = MappedWindow;

    fn map_window(&self, physical_base: u64, len: usize) -> Result<MappedWindow, RegionError> {
        // O_SYNC makes /dev/mem hand out an uncached mapping.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)
            .map_err(|err| RegionError::Access {
                path: self.path.clone(),
                err,
            })?;
        MappedWindow::new(file, physical_base, len)
    }
}

/// A shared, read/write mapping of `len` bytes at a physical address.
///
/// The mapping starts at the enclosing page boundary, since mmap offsets must
/// be page aligned; offsets passed to the accessors are relative to the
/// requested base. Unmapped and closed on drop.
#[derive(Debug)]
pub struct MappedWindow {
    mapping: *mut u8,
    mapping_len: usize,
    /// Distance from the start of the mapping to the requested base.
    skew: usize,
    len: usize,
    physical_base: u64,
    _file: File,
}

impl MappedWindow {
    fn new(file: File, physical_base: u64, len: usize) -> Result<Self, RegionError> {
        let map_err = |err| RegionError::Map {
            base: physical_base,
            len,
            err,
        };

        let page_size = page_size();
        let page_base = physical_base & !(page_size as u64 - 1);
        let skew = (physical_base - page_base) as usize;
        let mapping_len = (skew + len).next_multiple_of(page_size);
        let offset = libc::off_t::try_from(page_base).map_err(|_| {
            map_err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "physical address exceeds the file offset range",
            ))
        })?;

        // SAFETY: a fresh shared mapping chosen by the kernel; it does not
        // alias any Rust object.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(map_err(io::Error::last_os_error()));
        }

        tracing::debug!(physical_base, page_base, mapping_len, "mapped window");
        Ok(Self {
            mapping: mapping.cast(),
            mapping_len,
            skew,
            len,
            physical_base,
            _file: file,
        })
    }

    /// The physical address of offset 0.
    pub fn physical_base(&self) -> u64 {
        self.physical_base
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), RegionError> {
        if self.len < offset || self.len - offset < len {
            return Err(RegionError::OutOfBounds {
                offset,
                len: self.len,
            });
        }
        Ok(())
    }

    fn checked_ptr<T>(&self, offset: usize) -> Result<*mut T, RegionError> {
        self.check(offset, size_of::<T>())?;
        // SAFETY: the bounds have been checked above, and skew + len fits in
        // the mapping.
        let ptr = unsafe { self.mapping.add(self.skew + offset) }.cast::<T>();
        if !ptr.is_aligned() {
            return Err(RegionError::Misaligned(
                self.physical_base + offset as u64,
            ));
        }
        Ok(ptr)
    }

    /// Reads a type `T` from `offset` using a single read instruction.
    pub fn read_volatile<T: FromBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
    ) -> Result<T, RegionError> {
        let ptr = self.checked_ptr::<T>(offset)?;
        // SAFETY: in bounds and aligned within a live mapping, and any bit
        // pattern is a valid `T`.
        Ok(unsafe { ptr.read_volatile() })
    }

    /// Writes a type `T` at `offset` using a single write instruction.
    pub fn write_volatile<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
        value: T,
    ) -> Result<(), RegionError> {
        let ptr = self.checked_ptr::<T>(offset)?;
        // SAFETY: in bounds and aligned within a live mapping that no Rust
        // reference covers.
        unsafe { ptr.write_volatile(value) };
        Ok(())
    }
}

impl MemoryWindow for MappedWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> Result<u32, RegionError> {
        self.read_volatile(offset)
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<(), RegionError> {
        self.write_volatile(offset, value)
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region mapped in `new`.
        let r = unsafe { libc::munmap(self.mapping.cast(), self.mapping_len) };
        if r != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(
                physical_base = self.physical_base,
                error = &err as &dyn std::error::Error,
                "failed to unmap window"
            );
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegionAccessor;
    use crate::WINDOW_SIZE;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::io::Write;

    /// A file standing in for `/dev/mem`, where file offset == physical address.
    fn backing_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let bytes: Vec<u8> = (0..len).map(|i| (i / 4) as u8).collect();
        file.write_all(&bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn read_back(file: &tempfile::NamedTempFile, offset: u64) -> u32 {
        let mut f = file.reopen().unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        let mut buf = [0; 4];
        f.read_exact(&mut buf).unwrap();
        u32::from_ne_bytes(buf)
    }

    #[test]
    fn reads_and_writes_file_backed_window() {
        let page = page_size();
        let file = backing_file(page * 3);
        let region = RegionAccessor::new(DevMem::with_path(file.path()));
        let base = page as u64;

        assert_eq!(region.read_word(base, 8).unwrap(), {
            let b = ((page + 8) / 4) as u8;
            u32::from_ne_bytes([b; 4])
        });

        let outcome = region.write_word(base, 0x10, 0x1234_5678).unwrap();
        assert!(outcome.verified());
        assert_eq!(read_back(&file, base + 0x10), 0x1234_5678);
    }

    #[test]
    fn unaligned_base_maps_enclosing_page() {
        let page = page_size();
        let file = backing_file(page * 3);
        let dev = DevMem::with_path(file.path());
        let base = page as u64 + 0x10;

        let window = dev.map_window(base, WINDOW_SIZE).unwrap();
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(window.physical_base(), base);
        window.write_u32(4, 0xaabb_ccdd).unwrap();
        assert_eq!(window.read_u32(4).unwrap(), 0xaabb_ccdd);
        drop(window);

        assert_eq!(read_back(&file, base + 4), 0xaabb_ccdd);
    }

    #[test]
    fn window_checks_its_own_bounds() {
        let page = page_size();
        let file = backing_file(page * 2);
        let window = DevMem::with_path(file.path())
            .map_window(0, WINDOW_SIZE)
            .unwrap();

        assert!(window.read_u32(WINDOW_SIZE - 4).is_ok());
        assert!(matches!(
            window.read_u32(WINDOW_SIZE - 3),
            Err(RegionError::OutOfBounds { .. })
        ));
        assert!(matches!(
            window.read_u32(2),
            Err(RegionError::Misaligned(2))
        ));
        assert_eq!(window.read_volatile::<u8>(3).unwrap(), 0);
    }

    #[test]
    fn missing_device_is_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let region = RegionAccessor::new(DevMem::with_path(dir.path().join("mem")));
        let err = region.read_word(0, 0).unwrap_err();
        assert!(matches!(err, RegionError::Access { .. }));
    }

    #[test]
    fn unmappable_target_is_map_error() {
        // Opens read/write, but refuses mmap.
        let region = RegionAccessor::new(DevMem::with_path("/dev/null"));
        let err = region.read_word(0, 0).unwrap_err();
        assert!(matches!(err, RegionError::Map { .. }), "{err:?}");
    }
}
