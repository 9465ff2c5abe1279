// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An emulated host bridge answering the 0xCF8/0xCFC protocol.
//!
//! For tests only. It latches CONFIG_ADDRESS writes and serves CONFIG_DATA
//! from per-function register files, the way a chipset does, and records
//! every port access so tests can check the exact sequence issued.

use crate::CONFIG_ADDRESS_PORT;
use crate::CONFIG_DATA_PORT;
use crate::address::ConfigAddress;
use crate::address::PciBdf;
use crate::port::PortIo;
use std::collections::HashMap;

/// Config space size of a conventional PCI function.
const CONFIG_SPACE_DWORDS: usize = 64;

/// One port access seen by [`EmulatedChipset`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortAccess {
    /// `outl(port, value)`
    Out {
        /// Port written.
        port: u16,
        /// Value written.
        value: u32,
    },
    /// `inl(port)` returning `value`
    In {
        /// Port read.
        port: u16,
        /// Value returned.
        value: u32,
    },
}

/// Emulated configuration mechanism #1.
#[derive(Debug, Default)]
pub struct EmulatedChipset {
    functions: HashMap<PciBdf, [u32; CONFIG_SPACE_DWORDS]>,
    address: u32,
    accesses: Vec<PortAccess>,
}

impl EmulatedChipset {
    /// Creates a chipset with no functions present.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function whose configuration space starts with `header`. The
    /// remaining registers read as zero.
    pub fn with_function(mut self, bdf: PciBdf, header: &[u32]) -> Self {
        let mut regs = [0; CONFIG_SPACE_DWORDS];
        regs[..header.len()].copy_from_slice(header);
        self.functions.insert(bdf, regs);
        self
    }

    /// Returns one register of a present function.
    pub fn dword(&self, bdf: PciBdf, register: u8) -> u32 {
        self.functions.get(&bdf).expect("function not present")[usize::from(register >> 2)]
    }

    /// Every port access so far, in order.
    pub fn accesses(&self) -> &[PortAccess] {
        &self.accesses
    }

    fn selected(&mut self) -> Option<&mut u32> {
        let address = ConfigAddress::from_bits(self.address);
        if !address.enable() {
            return None;
        }
        let coordinate = address.coordinate();
        self.functions
            .get_mut(&coordinate.bdf)
            .map(|regs| &mut regs[usize::from(address.dword_index())])
    }
}

impl PortIo for EmulatedChipset {
    fn outl(&mut self, port: u16, value: u32) {
        self.accesses.push(PortAccess::Out { port, value });
        match port {
            CONFIG_ADDRESS_PORT => self.address = value,
            CONFIG_DATA_PORT => {
                if let Some(reg) = self.selected() {
                    *reg = value;
                }
            }
            _ => panic!("unexpected port write {port:#x}"),
        }
    }

    fn inl(&mut self, port: u16) -> u32 {
        let value = match port {
            CONFIG_ADDRESS_PORT => self.address,
            // Master abort: nothing claims the cycle, so all ones float back.
            CONFIG_DATA_PORT => self.selected().map_or(!0, |reg| *reg),
            _ => panic!("unexpected port read {port:#x}"),
        };
        self.accesses.push(PortAccess::In { port, value });
        value
    }
}
