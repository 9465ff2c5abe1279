// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command line.

use clap::Parser;
use pci_legacy_cfg::InvalidBdf;
use pci_legacy_cfg::PciBdf;
use std::path::PathBuf;

/// Largest register reachable through the legacy mechanism.
const MAX_REGISTER: u32 = 0xfc;

#[derive(Parser, Debug)]
#[command(
    name = "rw_pci_conf",
    about = "Read a PCI function's configuration header, or read/write a word in its BAR0 region",
    version,
    long_about = None,
    disable_help_flag = true
)]
pub struct Cli {
    /// Offset added to the BAR target (hex)
    #[arg(short = 'a', value_name = "ADDR", default_value = "0", value_parser = parse_hex_u32)]
    pub offset: u32,

    /// PCI bus number
    #[arg(short = 'b', value_name = "BUS", default_value_t = 0)]
    pub bus: u8,

    /// Device number
    #[arg(
        short = 'd',
        value_name = "DEV",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(..=31)
    )]
    pub device: u8,

    /// Function number
    #[arg(
        short = 'f',
        value_name = "FN",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(..=7)
    )]
    pub function: u8,

    /// Read only this configuration register (hex, multiple of 4)
    #[arg(
        short = 'r',
        value_name = "REG",
        value_parser = parse_register,
        conflicts_with_all = ["page", "value"]
    )]
    pub register: Option<u8>,

    /// 4 KiB page within the BAR region; selects BAR access
    #[arg(short = 'p', value_name = "PAGE")]
    pub page: Option<u32>,

    /// Value to write into the BAR region (hex)
    #[arg(short = 'v', value_name = "VALUE", value_parser = parse_hex_u32)]
    pub value: Option<u32>,

    /// Physical memory device
    #[arg(long, value_name = "PATH", default_value = phys_mem_window::DEFAULT_DEV_MEM)]
    pub mem_device: PathBuf,

    /// Serialize configuration transactions with other instances through this
    /// file
    #[arg(long, value_name = "PATH", env = "RW_PCI_CONF_LOCK_FILE")]
    pub lock_file: Option<PathBuf>,

    /// Print this help text
    #[arg(short = 'h', long)]
    pub help: bool,
}

/// What one invocation does.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Print all 16 double words of the type 00h header.
    DumpHeader { bdf: PciBdf },
    /// Print one configuration register.
    ReadRegister { bdf: PciBdf, register: u8 },
    /// Read a word in the BAR0 region.
    ReadBar { bdf: PciBdf, page: u32, offset: u32 },
    /// Write and verify a word in the BAR0 region.
    WriteBar {
        bdf: PciBdf,
        page: u32,
        offset: u32,
        value: u32,
    },
}

impl Cli {
    pub fn operation(&self) -> Result<Operation, InvalidBdf> {
        let bdf = PciBdf::new(self.bus, self.device, self.function)?;
        let op = match (self.register, self.page, self.value) {
            (Some(register), _, _) => Operation::ReadRegister { bdf, register },
            (None, page, Some(value)) => Operation::WriteBar {
                bdf,
                page: page.unwrap_or(0),
                offset: self.offset,
                value,
            },
            (None, Some(page), None) => Operation::ReadBar {
                bdf,
                page,
                offset: self.offset,
            },
            (None, None, None) => Operation::DumpHeader { bdf },
        };
        Ok(op)
    }
}

/// Parses hex digits with an optional `0x` prefix.
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|err| format!("invalid hex value {s:?}: {err}"))
}

fn parse_register(s: &str) -> Result<u8, String> {
    let register = parse_hex_u32(s)?;
    if register > MAX_REGISTER {
        return Err(format!("register {register:#x} is past {MAX_REGISTER:#x}"));
    }
    if register % 4 != 0 {
        return Err(format!("register {register:#x} is not a multiple of 4"));
    }
    Ok(register as u8)
}
