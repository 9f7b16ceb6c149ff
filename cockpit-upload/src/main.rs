// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware upload tool for cockpit-boot over a serial link.
//!
//! Usage:
//!   cockpit-upload --port /dev/ttyUSB0 info
//!   cockpit-upload --port /dev/ttyUSB0 upload firmware.bin --bank b
//!   cockpit-upload --port /dev/ttyUSB0 read 0x08018000 256 -o dump.bin

mod cli;
mod client;
mod commands;
mod transport;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;

fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let log_level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(args.verbose >= 2)
        .format_timestamp(if args.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
    log::debug!("cockpit-upload v{}", env!("CARGO_PKG_VERSION"));

    cli::run(args)
}
