// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command-line interface definitions.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use cockpit_boot::BankId;

use crate::client::{Client, DEFAULT_SESSION_ATTEMPTS};
use crate::commands;
use crate::transport::{self, DEFAULT_BAUD, DEFAULT_TIMEOUT_MS};

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "cockpit-upload", version)]
#[command(about = "Firmware upload tool for cockpit-boot devices")]
pub struct Cli {
    /// Serial port (e.g., /dev/ttyUSB0)
    #[arg(short, long, env = "COCKPIT_PORT")]
    pub port: String,

    /// Line rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD, env = "COCKPIT_BAUD")]
    pub baud: u32,

    /// Reply timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Whole-session attempts for an upload
    #[arg(long, default_value_t = DEFAULT_SESSION_ATTEMPTS)]
    pub attempts: u32,

    /// Verbose output level (-v, -vv, -vvv for increasing detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flash region selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BankArg {
    A,
    B,
    Scratch,
}

impl From<BankArg> for BankId {
    fn from(bank: BankArg) -> Self {
        match bank {
            BankArg::A => BankId::A,
            BankArg::B => BankId::B,
            BankArg::Scratch => BankId::Scratch,
        }
    }
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show device identity and flash layout
    Info {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show session state and error counters
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Upload firmware to a bank
    Upload {
        /// Firmware binary file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Target region
        #[arg(short = 'B', long, value_enum, default_value = "b")]
        bank: BankArg,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read flash into a file or as a hex dump
    Read {
        /// Start address (decimal or 0x hex)
        #[arg(value_parser = parse_u32)]
        address: u32,

        /// Number of bytes
        #[arg(value_parser = parse_u32)]
        length: u32,

        /// Output file; hex dump on stdout if absent
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// CRC-32 of a flash range
    Checksum {
        /// Start address (decimal or 0x hex)
        #[arg(value_parser = parse_u32)]
        address: u32,

        /// Number of bytes
        #[arg(value_parser = parse_u32)]
        length: u32,

        /// Compare against this file's CRC-32
        #[arg(long, value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Abort whatever the device is doing
    Abort,
}

/// Parse `0x`-prefixed hex or decimal.
pub fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    let transport = transport::open(&cli.port, cli.baud, cli.timeout_ms)?;
    let mut client = Client::new(transport)
        .with_reply_timeout(Duration::from_millis(cli.timeout_ms))
        .with_session_attempts(cli.attempts);
    log::info!(
        "opened {} at {} baud",
        client.transport().port_name(),
        cli.baud
    );

    match cli.command {
        Commands::Info { json } => commands::info(&mut client, json),
        Commands::Status { json } => commands::status(&mut client, json),
        Commands::Upload { file, bank, json } => {
            commands::upload(&mut client, &file, bank.into(), json)
        }
        Commands::Read {
            address,
            length,
            output,
        } => commands::read(&mut client, address, length, output.as_deref()),
        Commands::Checksum {
            address,
            length,
            file,
        } => commands::checksum(&mut client, address, length, file.as_deref()),
        Commands::Abort => commands::abort(&mut client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32_accepts_hex_and_decimal() {
        assert_eq!(parse_u32("0x0801_8000"), Ok(0x0801_8000));
        assert_eq!(parse_u32("0X10"), Ok(16));
        assert_eq!(parse_u32("2048"), Ok(2048));
        assert!(parse_u32("0xZZ").is_err());
        assert!(parse_u32("-1").is_err());
    }

    #[test]
    fn test_cli_upload_defaults() {
        let cli = Cli::try_parse_from(["cockpit-upload", "-p", "/dev/ttyUSB0", "upload", "fw.bin"])
            .unwrap();
        assert_eq!(cli.port, "/dev/ttyUSB0");
        assert_eq!(cli.baud, DEFAULT_BAUD);
        assert_eq!(cli.verbose, 0);
        match cli.command {
            Commands::Upload { file, bank, json } => {
                assert_eq!(file, PathBuf::from("fw.bin"));
                assert_eq!(bank, BankArg::B);
                assert!(!json);
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_cli_read_with_hex_range() {
        let cli = Cli::try_parse_from([
            "cockpit-upload",
            "--port",
            "COM3",
            "-vv",
            "read",
            "0x08010000",
            "0x100",
            "-o",
            "dump.bin",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Read {
                address,
                length,
                output,
            } => {
                assert_eq!(address, 0x0801_0000);
                assert_eq!(length, 256);
                assert_eq!(output, Some(PathBuf::from("dump.bin")));
            }
            _ => panic!("expected read"),
        }
    }

    #[test]
    fn test_bank_arg_maps_to_bank_id() {
        assert_eq!(BankId::from(BankArg::A), BankId::A);
        assert_eq!(BankId::from(BankArg::Scratch), BankId::Scratch);
    }
}
