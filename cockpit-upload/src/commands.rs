// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Command implementations for bootloader operations.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

use cockpit_boot::checksum::crc32;
use cockpit_boot::{BankId, Region};

use crate::client::Client;
use crate::transport::Link;

fn bank_name(bank: Option<BankId>) -> &'static str {
    match bank {
        Some(BankId::A) => "A",
        Some(BankId::B) => "B",
        Some(BankId::Scratch) => "scratch",
        None => "none",
    }
}

fn region_line(label: &str, region: Region) -> String {
    format!(
        "  {:<12} 0x{:08x}..0x{:08x} ({} bytes)",
        label,
        region.base,
        region.end(),
        region.size
    )
}

/// Show device identity and flash layout.
pub fn info<L: Link>(client: &mut Client<L>, json: bool) -> Result<()> {
    let session = client.connect().context("Handshake failed")?;
    let info = client.device_info()?;

    if json {
        let output = serde_json::json!({
            "model": info.model.as_str(),
            "device_id": hex(&info.device_id),
            "version": info.version.as_str(),
            "capabilities": session.capabilities.0,
            "max_chunk": session.max_chunk,
            "flash_base": info.flash_base,
            "flash_size": info.flash_size,
            "page_size": info.page_size,
            "write_align": info.write_align,
            "bank_a": info.bank_a,
            "bank_b": info.bank_b,
            "scratch": info.scratch,
            "active_bank": info.active_bank,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Device:");
    println!("  Model:       {}", info.model);
    println!("  Device ID:   {}", hex(&info.device_id));
    println!("  Bootloader:  {}", info.version);
    println!(
        "  Protocol:    v{}.{} (capabilities 0x{:02x}, chunk {} bytes)",
        session.protocol_major, session.protocol_minor, session.capabilities.0, session.max_chunk
    );
    println!("Flash:");
    println!(
        "  Base:        0x{:08x} ({} bytes, page {}, align {})",
        info.flash_base, info.flash_size, info.page_size, info.write_align
    );
    println!("{}", region_line("Bank A:", info.bank_a));
    println!("{}", region_line("Bank B:", info.bank_b));
    println!("{}", region_line("Scratch:", info.scratch));
    println!("  Active bank: {}", bank_name(info.active_bank));
    Ok(())
}

/// Show session state and counters. Works without a handshake.
pub fn status<L: Link>(client: &mut Client<L>, json: bool) -> Result<()> {
    let status = client.status()?;

    if json {
        let output = serde_json::json!({
            "state": status.state,
            "active_bank": status.active_bank,
            "frames_accepted": status.frames_accepted,
            "frames_rejected": status.frames_rejected,
            "errors": status.errors,
            "last_error": status.last_error,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Bootloader Status:");
    println!("  State:           {:?}", status.state);
    println!("  Active bank:     {}", bank_name(status.active_bank));
    println!("  Frames accepted: {}", status.frames_accepted);
    println!("  Frames rejected: {}", status.frames_rejected);
    println!("  Errors:          {}", status.errors);
    match status.last_error {
        Some(code) => println!("  Last error:      {:?} (0x{:02x})", code, code.code()),
        None => println!("  Last error:      none"),
    }
    Ok(())
}

/// Upload firmware to the specified bank.
pub fn upload<L: Link>(client: &mut Client<L>, file: &Path, bank: BankId, json: bool) -> Result<()> {
    let firmware = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    if firmware.is_empty() {
        bail!("{} is empty", file.display());
    }
    let image_crc = crc32(&firmware);

    if !json {
        println!(
            "Firmware: {} ({} bytes, CRC32: 0x{:08x})",
            file.display(),
            firmware.len(),
            image_crc
        );
        println!("Target:   {}", bank_name(Some(bank)));
        println!();
    }

    let pb = if json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(firmware.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    let result = client.upload(bank, &firmware, |sent, total| {
        pb.set_length(u64::from(total));
        pb.set_position(u64::from(sent));
    });
    let report = match result {
        Ok(report) => {
            pb.finish_with_message("Upload complete");
            report
        }
        Err(e) => {
            pb.abandon();
            return Err(e).context("Upload failed");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!(
        "Programmed {} bytes at 0x{:08x}, readback CRC32 0x{:08x}",
        report.programmed, report.address, report.crc32
    );
    if report.attempts > 1 {
        println!("Needed {} session attempts.", report.attempts);
    }
    if matches!(bank, BankId::A | BankId::B) {
        println!("Bank {} is now active.", bank_name(Some(bank)));
    }
    Ok(())
}

/// Read flash to a file, or hex dump it.
pub fn read<L: Link>(
    client: &mut Client<L>,
    address: u32,
    length: u32,
    output: Option<&Path>,
) -> Result<()> {
    client.connect().context("Handshake failed")?;
    let data = client.read(address, length)?;

    match output {
        Some(path) => {
            fs::write(path, &data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => {
            for (i, line) in data.chunks(16).enumerate() {
                println!("{:08x}  {}", address as usize + i * 16, hex_spaced(line));
            }
        }
    }
    Ok(())
}

/// CRC-32 of a flash range, optionally compared with a file.
pub fn checksum<L: Link>(
    client: &mut Client<L>,
    address: u32,
    length: u32,
    file: Option<&Path>,
) -> Result<()> {
    client.connect().context("Handshake failed")?;
    let crc = client.checksum(address, length)?;
    println!("0x{:08x}..+{}: CRC32 0x{:08x}", address, length, crc);

    if let Some(path) = file {
        let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        if data.len() != length as usize {
            bail!(
                "{} is {} bytes, range is {} bytes",
                path.display(),
                data.len(),
                length
            );
        }
        let expected = crc32(&data);
        if expected != crc {
            bail!("Mismatch: {} has CRC32 0x{:08x}", path.display(), expected);
        }
        println!("Matches {}", path.display());
    }
    Ok(())
}

/// Abort the device session.
pub fn abort<L: Link>(client: &mut Client<L>) -> Result<()> {
    client.abort()?;
    println!("Session aborted; device is idle.");
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
