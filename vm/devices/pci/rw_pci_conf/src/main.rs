// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reads a PCI function's type 00h configuration header through the legacy
//! 0xCF8/0xCFC mechanism, or reads/writes one word in the memory region its
//! BAR0 decodes, through `/dev/mem`.
//!
//! `rw_pci_conf -b 0 -d 25` prints the same bytes as `lspci -x -s 00:19.0`.

#![forbid(unsafe_code)]

mod cli;
mod ops;

use anyhow::Context as _;
use clap::CommandFactory;
use clap::Parser;
use clap::error::ErrorKind;
use cli::Cli;
use pci_legacy_cfg::IoPrivilege;
use pci_legacy_cfg::LegacyConfigAccess;
use pci_legacy_cfg::TransactionLock;
use phys_mem_window::DevMem;
use phys_mem_window::RegionAccessor;
use std::io::Write;
use tracing_subscriber::EnvFilter;

/// Exit status for usage errors and `-h`.
const EXIT_USAGE: i32 = -1;
/// Exit status for any failure after the command line was accepted.
const EXIT_FAILURE: i32 = 1;

const LOG_ENV: &str = "RW_PCI_CONF_LOG";

fn main() {
    let parsed = Cli::try_parse();
    if let Some(code) = early_exit(&parsed) {
        match parsed {
            Err(err) => err.print().ok(),
            Ok(_) => Cli::command().print_help().ok(),
        };
        std::process::exit(code);
    }
    let Ok(cli) = parsed else {
        unreachable!("parse errors always exit early")
    };

    init_tracing();

    let result = run(cli);
    if let Err(err) = &result {
        write_error_chain(&mut std::io::stderr().lock(), err).ok();
    }
    std::process::exit(exit_code(&result));
}

/// The exit status if the command line alone decides the outcome: a parse
/// error, `--version`, or `-h`.
fn early_exit(parsed: &Result<Cli, clap::Error>) -> Option<i32> {
    match parsed {
        Err(err) => Some(match err.kind() {
            ErrorKind::DisplayVersion => 0,
            _ => EXIT_USAGE,
        }),
        Ok(cli) if cli.help => Some(EXIT_USAGE),
        Ok(_) => None,
    }
}

fn exit_code(result: &anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(_) => EXIT_FAILURE,
    }
}

fn write_error_chain(out: &mut impl Write, err: &anyhow::Error) -> std::io::Result<()> {
    writeln!(out, "error: {err}")?;
    for inner in err.chain().skip(1) {
        writeln!(out, "caused by: {inner}")?;
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let op = cli.operation()?;
    tracing::debug!(?op, "starting");

    let ports = IoPrivilege::acquire().context("failed to acquire I/O port access")?;
    let mut cfg = LegacyConfigAccess::new(ports);
    if let Some(path) = &cli.lock_file {
        let lock = TransactionLock::open(path)?;
        cfg = cfg.with_lock(lock);
    }
    let region = RegionAccessor::new(DevMem::with_path(&cli.mem_device));

    ops::execute(op, &mut cfg, &region, &mut std::io::stdout().lock())
}
