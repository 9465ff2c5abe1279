// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Layout of the legacy type 00h configuration header.
//!
//! Sources: PCI 2.3 Spec - Chapter 6

use bitfield_struct::bitfield;

/// Offsets into the type 00h configuration space header.
///
/// Table pulled from <https://wiki.osdev.org/PCI>
///
/// | Offset | Bits 31-24                 | Bits 23-16  | Bits 15-8           | Bits 7-0             |
/// |--------|----------------------------|-------------|---------------------|--------------------- |
/// | 0x0    | Device ID                  |             | Vendor ID           |                      |
/// | 0x4    | Status                     |             | Command             |                      |
/// | 0x8    | Class code                 |             |                     | Revision ID          |
/// | 0xC    | BIST                       | Header type | Latency Timer       | Cache Line Size      |
/// | 0x10   | Base address #0 (BAR0)     |             |                     |                      |
/// | 0x14   | Base address #1 (BAR1)     |             |                     |                      |
/// | 0x18   | Base address #2 (BAR2)     |             |                     |                      |
/// | 0x1C   | Base address #3 (BAR3)     |             |                     |                      |
/// | 0x20   | Base address #4 (BAR4)     |             |                     |                      |
/// | 0x24   | Base address #5 (BAR5)     |             |                     |                      |
/// | 0x28   | Cardbus CIS Pointer        |             |                     |                      |
/// | 0x2C   | Subsystem ID               |             | Subsystem Vendor ID |                      |
/// | 0x30   | Expansion ROM base address |             |                     |                      |
/// | 0x34   | Reserved                   |             |                     | Capabilities Pointer |
/// | 0x38   | Reserved                   |             |                     |                      |
/// | 0x3C   | Max latency                | Min Grant   | Interrupt PIN       | Interrupt Line       |
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderType00(pub u8);

#[expect(missing_docs)] // self-explanatory offsets
impl HeaderType00 {
    pub const DEVICE_VENDOR: Self = Self(0x00);
    pub const STATUS_COMMAND: Self = Self(0x04);
    pub const CLASS_REVISION: Self = Self(0x08);
    pub const BIST_HEADER: Self = Self(0x0C);
    pub const BAR0: Self = Self(0x10);
    pub const BAR1: Self = Self(0x14);
    pub const BAR2: Self = Self(0x18);
    pub const BAR3: Self = Self(0x1C);
    pub const BAR4: Self = Self(0x20);
    pub const BAR5: Self = Self(0x24);
    pub const CARDBUS_CIS_PTR: Self = Self(0x28);
    pub const SUBSYSTEM_ID: Self = Self(0x2C);
    pub const EXPANSION_ROM_BASE: Self = Self(0x30);
    pub const RESERVED_CAP_PTR: Self = Self(0x34);
    pub const RESERVED: Self = Self(0x38);
    pub const LATENCY_INTERRUPT: Self = Self(0x3C);
}

impl HeaderType00 {
    /// Every double word of the header, in offset order.
    pub const ALL: [Self; HEADER_TYPE_00_DWORDS] = [
        Self::DEVICE_VENDOR,
        Self::STATUS_COMMAND,
        Self::CLASS_REVISION,
        Self::BIST_HEADER,
        Self::BAR0,
        Self::BAR1,
        Self::BAR2,
        Self::BAR3,
        Self::BAR4,
        Self::BAR5,
        Self::CARDBUS_CIS_PTR,
        Self::SUBSYSTEM_ID,
        Self::EXPANSION_ROM_BASE,
        Self::RESERVED_CAP_PTR,
        Self::RESERVED,
        Self::LATENCY_INTERRUPT,
    ];

}

/// Size of the type 00h header in bytes.
pub const HEADER_TYPE_00_SIZE: u8 = 0x40;

/// Number of double words in the type 00h header.
pub const HEADER_TYPE_00_DWORDS: usize = HEADER_TYPE_00_SIZE as usize / 4;

/// Mask selecting the address portion of a memory BAR.
pub const BAR_ADDRESS_MASK: u32 = !0xf;

/// BAR in-band encoding bits.
///
/// The low bits of the BAR are not actually part of the address.
/// Instead, they are used to in-band encode various bits of
/// metadata about the BAR, and are masked off when determining the
/// actual address.
#[bitfield(u32)]
pub struct BarEncodingBits {
    /// The BAR decodes I/O space rather than memory.
    pub use_pio: bool,

    _reserved: bool,

    /// False indicates 32 bit.
    /// Only used in MMIO
    pub type_64_bit: bool,
    /// Reads have no side effects.
    pub prefetchable: bool,

    #[bits(28)]
    _reserved2: u32,
}
