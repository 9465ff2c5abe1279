// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Port I/O and the capability that authorizes it.

use std::io;
use std::ops::RangeInclusive;
use thiserror::Error;

/// The chipset ports this crate needs: CONFIG_ADDRESS at 0xCF8 and
/// CONFIG_DATA at 0xCFC, each a double word wide.
pub const CONFIG_PORTS: RangeInclusive<u16> = 0xcf8..=0xcff;

/// Double-word access to x86 I/O space.
///
/// Implemented by [`IoPrivilege`] for real hardware. Tests substitute an
/// emulated chipset.
pub trait PortIo {
    /// Write a double word to a port.
    fn outl(&mut self, port: u16, data: u32);
    /// Read a double word from a port.
    fn inl(&mut self, port: u16) -> u32;
}

impl<T: PortIo + ?Sized> PortIo for &mut T {
    fn outl(&mut self, port: u16, data: u32) {
        (**self).outl(port, data)
    }

    fn inl(&mut self, port: u16) -> u32 {
        (**self).inl(port)
    }
}

/// Failure to obtain permission for port I/O.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    /// The kernel refused to grant access to the ports.
    #[error("failed to enable access to i/o ports {first:#x}-{last:#x}")]
    Denied {
        /// First port of the requested range.
        first: u16,
        /// Last port of the requested range.
        last: u16,
        /// The underlying OS error.
        #[source]
        err: io::Error,
    },
    /// This build has no way to issue port I/O.
    #[error("legacy port i/o is only supported on x86_64 linux")]
    Unsupported,
}

/// Proof that this process may access [`CONFIG_PORTS`].
///
/// Acquire it once at startup and hand it to the code that touches hardware.
/// The grant is process-wide and lasts until exit.
#[derive(Debug)]
pub struct IoPrivilege {
    _private: (),
}

impl IoPrivilege {
    /// Asks the kernel for access to [`CONFIG_PORTS`].
    ///
    /// Typically requires root (`CAP_SYS_RAWIO`).
    pub fn acquire() -> Result<Self, PrivilegeError> {
        let (first, last) = (*CONFIG_PORTS.start(), *CONFIG_PORTS.end());
        sys::enable_ports(first, last - first + 1)
            .map_err(|err| privilege_error(first, last, err))?;
        tracing::debug!(first, last, "enabled port i/o");
        Ok(Self { _private: () })
    }
}

/// `None` means the platform has no port I/O at all.
fn privilege_error(first: u16, last: u16, err: Option<io::Error>) -> PrivilegeError {
    match err {
        Some(err) => PrivilegeError::Denied { first, last, err },
        None => PrivilegeError::Unsupported,
    }
}

impl PortIo for IoPrivilege {
    fn outl(&mut self, port: u16, data: u32) {
        assert!(CONFIG_PORTS.contains(&port), "port {port:#x} not granted");
        sys::outl(port, data)
    }

    fn inl(&mut self, port: u16) -> u32 {
        assert!(CONFIG_PORTS.contains(&port), "port {port:#x} not granted");
        sys::inl(port)
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod sys {
    // UNSAFETY: ioperm and the in/out instructions.
    #![expect(unsafe_code)]

    use core::arch::asm;
    use std::io;

    /// Returns `Some(err)` if the kernel refused the request.
    pub fn enable_ports(first: u16, count: u16) -> Result<(), Option<io::Error>> {
        // SAFETY: ioperm only updates this process's I/O permission bitmap.
        let r = unsafe { libc::ioperm(first.into(), count.into(), 1) };
        if r < 0 {
            return Err(Some(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn outl(port: u16, data: u32) {
        // SAFETY: the port is in the range granted by `enable_ports`, which
        // `IoPrivilege` checks before calling.
        unsafe {
            asm! {
                "out dx, eax",
                in("dx") port,
                in("eax") data,
                options(nostack, preserves_flags),
            }
        }
    }

    pub fn inl(port: u16) -> u32 {
        let mut data;
        // SAFETY: as for `outl`.
        unsafe {
            asm! {
                "in eax, dx",
                in("dx") port,
                out("eax") data,
                options(nostack, preserves_flags),
            }
        }
        data
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
mod sys {
    use std::io;

    pub fn enable_ports(_first: u16, _count: u16) -> Result<(), Option<io::Error>> {
        Err(None)
    }

    pub fn outl(_port: u16, _data: u32) {
        unreachable!("IoPrivilege cannot be acquired on this platform")
    }

    pub fn inl(_port: u16) -> u32 {
        unreachable!("IoPrivilege cannot be acquired on this platform")
    }
}
