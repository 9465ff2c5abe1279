// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Header dumps and BAR0-relative memory access.

use crate::cli::Operation;
use anyhow::Context as _;
use pci_legacy_cfg::ConfigCoordinate;
use pci_legacy_cfg::LegacyConfigAccess;
use pci_legacy_cfg::PciBdf;
use pci_legacy_cfg::PortIo;
use pci_legacy_cfg::spec::BAR_ADDRESS_MASK;
use pci_legacy_cfg::spec::BarEncodingBits;
use pci_legacy_cfg::spec::HeaderType00;
use phys_mem_window::PhysicalMemory;
use phys_mem_window::RegionAccessor;
use phys_mem_window::WriteOutcome;
use std::io::Write;

/// Stride selected by `-p`.
pub const BAR_PAGE_SIZE: u64 = 0x1000;

/// A resolved BAR0-relative location.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BarTarget {
    /// BAR0 with the encoding bits masked off.
    pub bar_base: u64,
    /// Base of the mapped window: `bar_base` plus the selected page.
    pub physical_base: u64,
    /// Offset of the word inside the window.
    pub offset: usize,
}

impl BarTarget {
    /// Physical address of the word.
    pub fn address(&self) -> u64 {
        self.physical_base + self.offset as u64
    }
}

pub fn execute<P: PortIo, M: PhysicalMemory>(
    op: Operation,
    cfg: &mut LegacyConfigAccess<P>,
    region: &RegionAccessor<M>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match op {
        Operation::DumpHeader { bdf } => {
            let header = cfg
                .read_header(bdf)
                .with_context(|| format!("failed to read configuration header of {bdf}"))?;
            for (register, value) in HeaderType00::ALL.into_iter().zip(header) {
                print_register(out, bdf, register.0, value)?;
            }
        }
        Operation::ReadRegister { bdf, register } => {
            let value = cfg
                .read_dword(ConfigCoordinate::new(bdf, register))
                .with_context(|| format!("failed to read register {register:#x} of {bdf}"))?;
            print_register(out, bdf, register, value)?;
        }
        Operation::ReadBar { bdf, page, offset } => {
            let target = resolve_bar_target(cfg, bdf, page, offset)?;
            print_target(out, &target)?;
            let value = region
                .read_word(target.physical_base, target.offset)
                .with_context(|| format!("failed to read {:#x}", target.address()))?;
            writeln!(out, "The value at {:#x} is {:#x}", target.address(), value)?;
        }
        Operation::WriteBar {
            bdf,
            page,
            offset,
            value,
        } => {
            let target = resolve_bar_target(cfg, bdf, page, offset)?;
            print_target(out, &target)?;
            let outcome = region
                .write_word(target.physical_base, target.offset, value)
                .with_context(|| format!("failed to write {:#x}", target.address()))?;
            print_write(out, &target, &outcome)?;
            if !outcome.verified() {
                tracing::warn!(
                    address = target.address(),
                    written = outcome.written,
                    reread = outcome.reread,
                    "value read back differs from value written"
                );
            }
        }
    }
    Ok(())
}

/// Reads BAR0 of `bdf` (and BAR1 when BAR0 is 64-bit) and locates `offset`
/// within `page` of the region it decodes.
pub fn resolve_bar_target<P: PortIo>(
    cfg: &mut LegacyConfigAccess<P>,
    bdf: PciBdf,
    page: u32,
    offset: u32,
) -> anyhow::Result<BarTarget> {
    let bar0 = cfg
        .read_dword(ConfigCoordinate::new(bdf, HeaderType00::BAR0.0))
        .with_context(|| format!("failed to read BAR0 of {bdf}"))?;
    let bits = BarEncodingBits::from_bits(bar0);
    if bits.use_pio() {
        anyhow::bail!("BAR0 of {bdf} is an I/O space BAR ({bar0:#x}), not memory");
    }

    let high = if bits.type_64_bit() {
        cfg.read_dword(ConfigCoordinate::new(bdf, HeaderType00::BAR1.0))
            .with_context(|| format!("failed to read BAR1 of {bdf}"))?
    } else {
        0
    };
    let bar_base = (u64::from(high) << 32) | u64::from(bar0 & BAR_ADDRESS_MASK);
    let physical_base = bar_base
        .checked_add(u64::from(page) * BAR_PAGE_SIZE)
        .with_context(|| format!("page {page} is past the end of the address space"))?;

    let target = BarTarget {
        bar_base,
        physical_base,
        offset: offset as usize,
    };
    tracing::info!(
        %bdf,
        bar0,
        bar_base,
        physical_base,
        offset,
        prefetchable = bits.prefetchable(),
        "resolved BAR target"
    );
    Ok(target)
}

fn print_register(
    out: &mut impl Write,
    bdf: PciBdf,
    register: u8,
    value: u32,
) -> std::io::Result<()> {
    writeln!(
        out,
        "PCI:Bus {}, DEV {}, FUNC {}, REG {:x}, Value is {:x}",
        bdf.bus(),
        bdf.device(),
        bdf.function(),
        register,
        value
    )
}

fn print_target(out: &mut impl Write, target: &BarTarget) -> std::io::Result<()> {
    writeln!(out, "The base address value is {:#x}", target.bar_base)?;
    writeln!(out, "The offset address value is {:#x}", target.address())
}

fn print_write(
    out: &mut impl Write,
    target: &BarTarget,
    outcome: &WriteOutcome,
) -> std::io::Result<()> {
    let address = target.address();
    writeln!(out, "The value at {:#x} is {:#x}", address, outcome.previous)?;
    writeln!(out, "Write value {:#x} at {:#x}", outcome.written, address)?;
    writeln!(out, "Reread the value at {:#x} is {:#x}", address, outcome.reread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pci_legacy_cfg::CONFIG_ADDRESS_PORT;
    use pci_legacy_cfg::emulated::EmulatedChipset;
    use pci_legacy_cfg::emulated::PortAccess;
    use phys_mem_window::RegionError;
    use phys_mem_window::ram::RamMemory;

    /// 00:19.0, an onboard NIC with a 32-bit memory BAR0.
    const NIC_HEADER: [u32; 16] = [
        0x15bb_8086,
        0x0010_0007,
        0x0200_0010,
        0x0000_0000,
        0xf7d0_0000,
        0x0000_0000,
        0x0000_f080,
        0x0000_0000,
        0x0000_0000,
        0x0000_0000,
        0x0000_0000,
        0x0872_1028,
        0x0000_0000,
        0x0000_00c8,
        0x0000_0000,
        0x0000_010b,
    ];

    fn nic() -> PciBdf {
        PciBdf::new(0, 25, 0).unwrap()
    }

    fn run(
        op: Operation,
        chipset: EmulatedChipset,
        ram: RamMemory,
    ) -> (anyhow::Result<()>, String, EmulatedChipset) {
        let mut cfg = LegacyConfigAccess::new(chipset);
        let region = RegionAccessor::new(ram);
        let mut out = Vec::new();
        let result = execute(op, &mut cfg, &region, &mut out);
        (result, String::from_utf8(out).unwrap(), cfg.into_ports())
    }

    #[test]
    fn dumps_header_of_device_25() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let (result, out, chipset) = run(
            Operation::DumpHeader { bdf: nic() },
            chipset,
            RamMemory::new(),
        );
        result.unwrap();

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 16);
        assert_eq!(lines[0], "PCI:Bus 0, DEV 25, FUNC 0, REG 0, Value is 15bb8086");
        assert_eq!(lines[4], "PCI:Bus 0, DEV 25, FUNC 0, REG 10, Value is f7d00000");
        assert_eq!(lines[15], "PCI:Bus 0, DEV 25, FUNC 0, REG 3c, Value is 10b");

        let addresses: Vec<u32> = chipset
            .accesses()
            .iter()
            .filter_map(|a| match *a {
                PortAccess::Out {
                    port: CONFIG_ADDRESS_PORT,
                    value,
                } => Some(value),
                _ => None,
            })
            .collect();
        let expected: Vec<u32> = (0..16).map(|i| 0x8000_c800 + i * 4).collect();
        assert_eq!(addresses, expected);
    }

    #[test]
    fn reads_single_register() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let (result, out, chipset) = run(
            Operation::ReadRegister {
                bdf: nic(),
                register: 0x2c,
            },
            chipset,
            RamMemory::new(),
        );
        result.unwrap();
        assert_eq!(out, "PCI:Bus 0, DEV 25, FUNC 0, REG 2c, Value is 8721028\n");
        assert_eq!(chipset.accesses().len(), 2);
    }

    #[test]
    fn absent_function_dumps_all_ones() {
        let (result, out, _) = run(
            Operation::DumpHeader {
                bdf: PciBdf::new(4, 0, 0).unwrap(),
            },
            EmulatedChipset::new(),
            RamMemory::new(),
        );
        result.unwrap();
        assert!(out.lines().all(|l| l.ends_with("Value is ffffffff")));
    }

    #[test]
    fn writes_bar_page_one() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let ram = RamMemory::new();
        ram.set_dword(0xf7d0_1010, 0x8000_0000);
        let (result, out, _) = run(
            Operation::WriteBar {
                bdf: nic(),
                page: 1,
                offset: 0x10,
                value: 0x1234,
            },
            chipset,
            ram.clone(),
        );
        result.unwrap();

        assert_eq!(
            out,
            "The base address value is 0xf7d00000\n\
             The offset address value is 0xf7d01010\n\
             The value at 0xf7d01010 is 0x80000000\n\
             Write value 0x1234 at 0xf7d01010\n\
             Reread the value at 0xf7d01010 is 0x1234\n"
        );
        assert_eq!(ram.dword(0xf7d0_1010), 0x1234);
        assert_eq!(ram.live_windows(), 0);
    }

    #[test]
    fn read_only_target_rereads_old_value() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let ram = RamMemory::new();
        ram.set_dword(0xf7d0_1010, 0x0003_0001);
        ram.set_read_only(0xf7d0_1010);
        let (result, out, _) = run(
            Operation::WriteBar {
                bdf: nic(),
                page: 1,
                offset: 0x10,
                value: 0x1234,
            },
            chipset,
            ram.clone(),
        );
        result.unwrap();

        assert!(out.ends_with("Reread the value at 0xf7d01010 is 0x30001\n"));
        assert_eq!(ram.dword(0xf7d0_1010), 0x0003_0001);
    }

    #[test]
    fn reads_bar_word() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let ram = RamMemory::new();
        ram.set_dword(0xf7d0_0008, 0x0018_0240);
        let (result, out, _) = run(
            Operation::ReadBar {
                bdf: nic(),
                page: 0,
                offset: 8,
            },
            chipset,
            ram.clone(),
        );
        result.unwrap();

        assert_eq!(
            out,
            "The base address value is 0xf7d00000\n\
             The offset address value is 0xf7d00008\n\
             The value at 0xf7d00008 is 0x180240\n"
        );
        assert_eq!(ram.mappings(), 1);
    }

    #[test]
    fn resolves_64_bit_bar() {
        let bdf = PciBdf::new(3, 0, 0).unwrap();
        let mut header = [0; 16];
        header[4] = 0xc000_000c;
        header[5] = 0x0000_0004;
        let mut cfg = LegacyConfigAccess::new(EmulatedChipset::new().with_function(bdf, &header));

        let target = resolve_bar_target(&mut cfg, bdf, 2, 0x40).unwrap();
        assert_eq!(
            target,
            BarTarget {
                bar_base: 0x4_c000_0000,
                physical_base: 0x4_c000_2000,
                offset: 0x40,
            }
        );
        assert_eq!(target.address(), 0x4_c000_2040);
    }

    #[test]
    fn rejects_io_bar() {
        let bdf = PciBdf::new(0, 31, 4).unwrap();
        let mut header = [0; 16];
        header[4] = 0x0000_efa1;
        let ram = RamMemory::new();
        let (result, out, _) = run(
            Operation::ReadBar {
                bdf,
                page: 0,
                offset: 0,
            },
            EmulatedChipset::new().with_function(bdf, &header),
            ram.clone(),
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("I/O space BAR"), "{err:#}");
        assert!(out.is_empty());
        assert_eq!(ram.mappings(), 0);
    }

    #[test]
    fn offset_past_window_is_rejected() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let ram = RamMemory::new();
        let (result, _, _) = run(
            Operation::WriteBar {
                bdf: nic(),
                page: 0,
                offset: 0x1000,
                value: 1,
            },
            chipset,
            ram.clone(),
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegionError>(),
            Some(RegionError::OutOfBounds { offset: 0x1000, .. })
        ));
        assert_eq!(ram.mappings(), 0);
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let ram = RamMemory::new();
        let (result, out, _) = run(
            Operation::ReadBar {
                bdf: nic(),
                page: 0,
                offset: 0x2,
            },
            chipset,
            ram.clone(),
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegionError>(),
            Some(RegionError::Misaligned(0xf7d0_0002))
        ));
        assert!(!out.contains("The value at"));
        assert_eq!(ram.mappings(), 0);
    }

    #[test]
    fn map_failure_is_reported() {
        let chipset = EmulatedChipset::new().with_function(nic(), &NIC_HEADER);
        let ram = RamMemory::with_limit(0x1_0000);
        let (result, _, _) = run(
            Operation::ReadBar {
                bdf: nic(),
                page: 0,
                offset: 0,
            },
            chipset,
            ram.clone(),
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegionError>(),
            Some(RegionError::Map { .. })
        ));
        assert_eq!(ram.live_windows(), 0);
    }
}
