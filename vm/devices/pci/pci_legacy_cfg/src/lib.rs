// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI configuration space access through the legacy x86 configuration
//! mechanism: write the target address to CONFIG_ADDRESS (0xCF8), then access
//! the selected double word through CONFIG_DATA (0xCFC).
//!
//! Both phases are always issued by a single call on [`LegacyConfigAccess`];
//! they are never exposed separately, since any access in between retargets
//! the data port.
//!
//! CONFIG_ADDRESS is one register shared by the whole machine. Nothing here
//! can stop the kernel or another process from rewriting it between the two
//! phases. A [`TransactionLock`] keeps cooperating instances of this crate
//! apart, and that is all.

pub mod address;
#[cfg(any(test, feature = "test_helpers"))]
pub mod emulated;
pub mod lock;
pub mod port;
pub mod spec;

pub use address::ConfigAddress;
pub use address::ConfigCoordinate;
pub use address::InvalidBdf;
pub use address::PciBdf;
pub use lock::LockError;
pub use lock::TransactionLock;
pub use port::IoPrivilege;
pub use port::PortIo;
pub use port::PrivilegeError;

use spec::HEADER_TYPE_00_DWORDS;
use spec::HeaderType00;
use thiserror::Error;

/// CONFIG_ADDRESS
pub const CONFIG_ADDRESS_PORT: u16 = 0xcf8;
/// CONFIG_DATA
pub const CONFIG_DATA_PORT: u16 = 0xcfc;

/// Error from a configuration space transaction.
#[derive(Debug, Error)]
pub enum ConfigAccessError {
    /// The transaction lock could not be taken.
    #[error("failed to serialize configuration access")]
    Lock(#[source] LockError),
}

/// Configuration space accessor over a [`PortIo`] implementation.
#[derive(Debug)]
pub struct LegacyConfigAccess<P> {
    ports: P,
    lock: Option<TransactionLock>,
}

impl<P: PortIo> LegacyConfigAccess<P> {
    /// Creates an accessor that issues transactions through `ports`.
    ///
    /// Pass [`IoPrivilege`] for real hardware.
    pub fn new(ports: P) -> Self {
        Self { ports, lock: None }
    }

    /// Holds `lock` across every transaction.
    pub fn with_lock(self, lock: TransactionLock) -> Self {
        tracing::debug!(path = %lock.path().display(), "serializing config transactions");
        Self {
            lock: Some(lock),
            ..self
        }
    }

    /// The underlying port accessor.
    pub fn ports(&self) -> &P {
        &self.ports
    }

    /// Consumes the accessor, returning the port accessor.
    pub fn into_ports(self) -> P {
        self.ports
    }

    /// Reads the double word containing `coordinate.register`.
    ///
    /// The register's low two bits are ignored.
    pub fn read_dword(
        &mut self,
        coordinate: ConfigCoordinate,
    ) -> Result<u32, ConfigAccessError> {
        let address = ConfigAddress::from(coordinate);
        let value = {
            let _guard = acquire(&self.lock)?;
            self.ports.outl(CONFIG_ADDRESS_PORT, address.into_bits());
            self.ports.inl(CONFIG_DATA_PORT)
        };
        tracing::trace!(
            bdf = %coordinate.bdf,
            register = address.dword_index() << 2,
            value,
            "config read"
        );
        Ok(value)
    }

    /// Writes the double word containing `coordinate.register`.
    ///
    /// The register's low two bits are ignored.
    pub fn write_dword(
        &mut self,
        coordinate: ConfigCoordinate,
        value: u32,
    ) -> Result<(), ConfigAccessError> {
        let address = ConfigAddress::from(coordinate);
        {
            let _guard = acquire(&self.lock)?;
            self.ports.outl(CONFIG_ADDRESS_PORT, address.into_bits());
            self.ports.outl(CONFIG_DATA_PORT, value);
        }
        tracing::trace!(
            bdf = %coordinate.bdf,
            register = address.dword_index() << 2,
            value,
            "config write"
        );
        Ok(())
    }

    /// Reads the 64-byte type 00h header of `bdf`, one double word at a time.
    pub fn read_header(
        &mut self,
        bdf: PciBdf,
    ) -> Result<[u32; HEADER_TYPE_00_DWORDS], ConfigAccessError> {
        let mut header = [0; HEADER_TYPE_00_DWORDS];
        for (value, register) in header.iter_mut().zip(HeaderType00::ALL) {
            *value = self.read_dword(ConfigCoordinate::new(bdf, register.0))?;
        }
        tracing::debug!(%bdf, vendor_device = header[0], "read configuration header");
        Ok(header)
    }
}

fn acquire(
    lock_file: &Option<TransactionLock>,
) -> Result<Option<lock::TransactionGuard<'_>>, ConfigAccessError> {
    lock_file
        .as_ref()
        .map(TransactionLock::acquire)
        .transpose()
        .map_err(ConfigAccessError::Lock)
}
