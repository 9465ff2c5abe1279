// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bus/device/function coordinates and the CONFIG_ADDRESS encoding.

use bitfield_struct::bitfield;
use std::fmt;
use thiserror::Error;

/// A validated PCI bus/device/function triple.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciBdf {
    bus: u8,
    device: u8,
    function: u8,
}

/// A bus/device/function triple outside the range the legacy mechanism can encode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidBdf {
    /// Device numbers are 5 bits wide.
    #[error("device number {0} is out of range (0-{max})", max = PciBdf::MAX_DEVICE)]
    Device(u8),
    /// Function numbers are 3 bits wide.
    #[error("function number {0} is out of range (0-{max})", max = PciBdf::MAX_FUNCTION)]
    Function(u8),
}

impl PciBdf {
    /// Highest device number on a bus.
    pub const MAX_DEVICE: u8 = 31;
    /// Highest function number on a device.
    pub const MAX_FUNCTION: u8 = 7;

    /// Validates and builds a bus/device/function triple.
    pub fn new(bus: u8, device: u8, function: u8) -> Result<Self, InvalidBdf> {
        if device > Self::MAX_DEVICE {
            return Err(InvalidBdf::Device(device));
        }
        if function > Self::MAX_FUNCTION {
            return Err(InvalidBdf::Function(function));
        }
        Ok(Self {
            bus,
            device,
            function,
        })
    }

    /// The bus number.
    pub fn bus(&self) -> u8 {
        self.bus
    }

    /// The device number.
    pub fn device(&self) -> u8 {
        self.device
    }

    /// The function number.
    pub fn function(&self) -> u8 {
        self.function
    }
}

/// Formats as `bb:dd.f`, the same form `lspci -s` accepts.
impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// A double word in the configuration space of one function.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfigCoordinate {
    /// The function being addressed.
    pub bdf: PciBdf,
    /// Byte offset of the register. The low two bits are ignored.
    pub register: u8,
}

impl ConfigCoordinate {
    /// Addresses `register` of the function at `bdf`.
    pub fn new(bdf: PciBdf, register: u8) -> Self {
        Self { bdf, register }
    }

    /// The coordinate of the double word that contains this register.
    pub fn aligned(self) -> Self {
        Self {
            register: self.register & !3,
            ..self
        }
    }
}

/// The value written to CONFIG_ADDRESS (0xCF8).
///
/// | Bits  | Field                       |
/// |-------|-----------------------------|
/// | 31    | Enable                      |
/// | 30-24 | Reserved                    |
/// | 23-16 | Bus                         |
/// | 15-11 | Device                      |
/// | 10-8  | Function                    |
/// | 7-2   | Register (double-word index)|
/// | 1-0   | Always zero                 |
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ConfigAddress {
    #[bits(2)]
    _zero: u8,
    /// Register offset divided by four.
    #[bits(6)]
    pub dword_index: u8,
    /// Function number.
    #[bits(3)]
    pub function: u8,
    /// Device number.
    #[bits(5)]
    pub device: u8,
    /// Bus number.
    pub bus: u8,
    #[bits(7)]
    _reserved: u8,
    /// Routes the following CONFIG_DATA access to configuration space.
    pub enable: bool,
}

impl ConfigAddress {
    /// Decodes the coordinate this address selects. The register comes back
    /// double-word aligned.
    pub fn coordinate(&self) -> ConfigCoordinate {
        ConfigCoordinate {
            bdf: PciBdf {
                bus: self.bus(),
                device: self.device(),
                function: self.function(),
            },
            register: self.dword_index() << 2,
        }
    }
}

impl From<ConfigCoordinate> for ConfigAddress {
    fn from(coordinate: ConfigCoordinate) -> Self {
        let ConfigCoordinate { bdf, register } = coordinate;
        Self::new()
            .with_enable(true)
            .with_bus(bdf.bus)
            .with_device(bdf.device)
            .with_function(bdf.function)
            .with_dword_index(register >> 2)
    }
}
