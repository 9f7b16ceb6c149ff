// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash programming engine.
//!
//! A program operation is one cycle of: erase every page the data touches,
//! write the data in write-alignment units (the last one padded with
//! [`ERASED_BYTE`]), read everything back and compare. When any step fails
//! the whole cycle is repeated, since a half-erased page is not safe to
//! resume writing into. Requests outside the declared regions are rejected
//! before the driver is touched.

use serde::{Deserialize, Serialize};

use crate::checksum::CRC32;
use crate::config::MAX_FLASH_ATTEMPTS;
use crate::error::{FlashError, LayoutError};
use crate::guard::{Clock, Deadline};
use crate::layout::{BankId, FlashLayout, MAX_WRITE_ALIGN};

/// Value of an erased flash byte, used to pad partial write units.
pub const ERASED_BYTE: u8 = 0xFF;

/// Read-back granularity for compare and checksum passes.
const READBACK_CHUNK: usize = 64;

/// Step of a program cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashStep {
    /// Argument checks; no hardware access.
    Validate,
    Unlock,
    Erase,
    Write,
    Read,
    Compare,
}

/// Status reported by the flash driver or the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashStatus {
    /// Address range outside every declared region.
    OutOfRange,
    Misaligned,
    /// Controller refused to unlock, or an operation ran while locked.
    Locked,
    WriteProtected,
    /// Busy flag did not clear within the busy timeout.
    BusyTimeout,
    EraseError,
    ProgramError,
    /// Read-back differs from what was written.
    Mismatch,
    /// The attempt budget was already spent.
    NoAttemptsLeft,
    /// Raw controller status bits.
    Hardware(u32),
}

impl FlashStatus {
    /// A fresh erase/write/verify cycle may succeed after this status.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BusyTimeout
                | Self::EraseError
                | Self::ProgramError
                | Self::Mismatch
                | Self::Hardware(_)
        )
    }
}

/// Platform flash primitives.
///
/// All calls are blocking. Addresses are absolute; `write` receives whole
/// write-alignment units on erased memory.
pub trait FlashDriver {
    fn unlock(&mut self) -> Result<(), FlashStatus>;

    fn lock(&mut self);

    /// Erase the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> Result<(), FlashStatus>;

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashStatus>;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashStatus>;

    /// Controller still busy with the last erase or write.
    fn is_busy(&mut self) -> bool {
        false
    }

    /// Keep interrupt handlers from running code out of flash.
    fn mask_interrupts(&mut self) {}

    fn unmask_interrupts(&mut self) {}
}

impl<F: FlashDriver + ?Sized> FlashDriver for &mut F {
    fn unlock(&mut self) -> Result<(), FlashStatus> {
        (**self).unlock()
    }

    fn lock(&mut self) {
        (**self).lock()
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashStatus> {
        (**self).erase_page(address)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashStatus> {
        (**self).write(address, data)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashStatus> {
        (**self).read(address, buf)
    }

    fn is_busy(&mut self) -> bool {
        (**self).is_busy()
    }

    fn mask_interrupts(&mut self) {
        (**self).mask_interrupts()
    }

    fn unmask_interrupts(&mut self) {
        (**self).unmask_interrupts()
    }
}

/// Outcome of a successful program operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramReport {
    /// Absolute start address.
    pub address: u32,
    /// Bytes written including padding.
    pub written: u32,
    /// Attempt that succeeded (1-based).
    pub attempts: u8,
}

struct StepFailure {
    step: FlashStep,
    status: FlashStatus,
    address: u32,
}

impl StepFailure {
    fn at(step: FlashStep, address: u32) -> impl FnOnce(FlashStatus) -> Self {
        move |status| Self {
            step,
            status,
            address,
        }
    }
}

/// What a busy timeout does to the remaining attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusyPolicy {
    /// Spend them in this call.
    Retry,
    /// Return so the caller can resume on a later poll.
    Yield,
}

/// Bank-aware erase/program/verify sequencer over a [`FlashDriver`].
pub struct FlashEngine<F> {
    driver: F,
    layout: FlashLayout,
    busy_timeout_ms: u32,
}

impl<F: FlashDriver> FlashEngine<F> {
    /// Engine over a validated `layout`.
    pub fn new(driver: F, layout: FlashLayout, busy_timeout_ms: u32) -> Result<Self, LayoutError> {
        layout.validate()?;
        Ok(Self {
            driver,
            layout,
            busy_timeout_ms,
        })
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    pub fn driver(&self) -> &F {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut F {
        &mut self.driver
    }

    pub fn into_driver(self) -> F {
        self.driver
    }

    pub fn unlock(&mut self) -> Result<(), FlashError> {
        self.driver.unlock().map_err(|status| FlashError {
            step: FlashStep::Unlock,
            status,
            address: self.layout.flash_base,
            attempts: 0,
        })
    }

    pub fn lock(&mut self) {
        self.driver.lock();
    }

    pub fn mask_interrupts(&mut self) {
        self.driver.mask_interrupts();
    }

    pub fn unmask_interrupts(&mut self) {
        self.driver.unmask_interrupts();
    }

    /// Validate a program request and return its absolute address.
    ///
    /// Never touches the hardware.
    pub fn check(&self, bank: BankId, offset: u32, len: u32) -> Result<u32, FlashError> {
        let region = self.layout.region(bank);
        let address = region.base.saturating_add(offset);
        let padded = self.layout.align_up(len);
        let fits = offset.checked_add(padded).is_some_and(|end| end <= region.size)
            && address.checked_add(padded).is_some();
        if len == 0 || !fits {
            return Err(FlashError::rejected(FlashStatus::OutOfRange, address));
        }
        if !self.layout.is_page_aligned(address) {
            return Err(FlashError::rejected(FlashStatus::Misaligned, address));
        }
        Ok(address)
    }

    /// Program `bytes` at `offset` inside `bank` with a fresh attempt budget.
    ///
    /// Unlocks the controller and masks interrupts around the operation.
    pub fn program<C: Clock>(
        &mut self,
        clock: &C,
        bank: BankId,
        offset: u32,
        bytes: &[u8],
    ) -> Result<ProgramReport, FlashError> {
        self.check(bank, offset, len_u32(bytes))?;
        self.unlock()?;
        self.driver.mask_interrupts();

        let mut attempts = 0;
        let result = self.run_attempts(
            clock,
            bank,
            offset,
            bytes,
            &mut attempts,
            MAX_FLASH_ATTEMPTS,
            BusyPolicy::Retry,
        );

        self.driver.unmask_interrupts();
        self.driver.lock();
        result
    }

    /// Program with an attempt counter owned by the caller.
    ///
    /// The controller must already be unlocked. `attempts` is incremented
    /// once per cycle and never exceeds `max_attempts`; a busy timeout ends
    /// the call after the current cycle so the caller can decide whether to
    /// continue with the remaining budget.
    pub fn program_with_budget<C: Clock>(
        &mut self,
        clock: &C,
        bank: BankId,
        offset: u32,
        bytes: &[u8],
        attempts: &mut u8,
        max_attempts: u8,
    ) -> Result<ProgramReport, FlashError> {
        self.run_attempts(
            clock,
            bank,
            offset,
            bytes,
            attempts,
            max_attempts,
            BusyPolicy::Yield,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run_attempts<C: Clock>(
        &mut self,
        clock: &C,
        bank: BankId,
        offset: u32,
        bytes: &[u8],
        attempts: &mut u8,
        max_attempts: u8,
        busy: BusyPolicy,
    ) -> Result<ProgramReport, FlashError> {
        let len = len_u32(bytes);
        let address = self.check(bank, offset, len)?;
        if *attempts >= max_attempts {
            return Err(FlashError {
                step: FlashStep::Validate,
                status: FlashStatus::NoAttemptsLeft,
                address,
                attempts: *attempts,
            });
        }
        let padded = self.layout.align_up(len);

        loop {
            *attempts += 1;
            let attempt = *attempts;
            info!(
                "flash: program {:#x} ({} bytes) attempt {}/{}",
                address, len, attempt, max_attempts
            );

            let failure = match self.cycle(clock, address, bytes, padded) {
                Ok(()) => {
                    debug!("flash: {:#x} verified on attempt {}", address, attempt);
                    return Ok(ProgramReport {
                        address,
                        written: padded,
                        attempts: attempt,
                    });
                }
                Err(failure) => failure,
            };

            warn!(
                "flash: {:?} failed at {:#x} on attempt {}: {:?}",
                failure.step, failure.address, attempt, failure.status
            );
            let err = FlashError {
                step: failure.step,
                status: failure.status,
                address: failure.address,
                attempts: attempt,
            };
            let yields = busy == BusyPolicy::Yield && failure.status == FlashStatus::BusyTimeout;
            if yields || !failure.status.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }
        }
    }

    fn cycle<C: Clock>(
        &mut self,
        clock: &C,
        address: u32,
        bytes: &[u8],
        padded: u32,
    ) -> Result<(), StepFailure> {
        let end = address + padded;

        let mut page = address;
        while page < end {
            trace!("flash: erase page {:#x}", page);
            self.driver
                .erase_page(page)
                .map_err(StepFailure::at(FlashStep::Erase, page))?;
            self.wait_ready(clock, FlashStep::Erase, page)?;
            page += self.layout.page_size;
        }

        let align = self.layout.write_align as usize;
        let mut unit = [ERASED_BYTE; MAX_WRITE_ALIGN];
        let unit = &mut unit[..align];
        let mut at = address;
        for chunk in bytes.chunks(align) {
            unit.fill(ERASED_BYTE);
            unit[..chunk.len()].copy_from_slice(chunk);
            self.driver
                .write(at, unit)
                .map_err(StepFailure::at(FlashStep::Write, at))?;
            self.wait_ready(clock, FlashStep::Write, at)?;
            at += align as u32;
        }

        let mut buf = [0u8; READBACK_CHUNK];
        let mut done = 0usize;
        let total = padded as usize;
        while done < total {
            let n = (total - done).min(READBACK_CHUNK);
            let at = address + done as u32;
            self.driver
                .read(at, &mut buf[..n])
                .map_err(StepFailure::at(FlashStep::Read, at))?;
            for (i, &got) in buf[..n].iter().enumerate() {
                let expected = bytes.get(done + i).copied().unwrap_or(ERASED_BYTE);
                if got != expected {
                    return Err(StepFailure {
                        step: FlashStep::Compare,
                        status: FlashStatus::Mismatch,
                        address: at + i as u32,
                    });
                }
            }
            done += n;
        }
        Ok(())
    }

    fn wait_ready<C: Clock>(
        &mut self,
        clock: &C,
        step: FlashStep,
        address: u32,
    ) -> Result<(), StepFailure> {
        if !self.driver.is_busy() {
            return Ok(());
        }
        let deadline = Deadline::set(clock.now_ms(), self.busy_timeout_ms);
        while self.driver.is_busy() {
            if deadline.is_expired(clock.now_ms()) {
                return Err(StepFailure {
                    step,
                    status: FlashStatus::BusyTimeout,
                    address,
                });
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Read flash inside a declared region.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.readable(address, len_u32(buf))?;
        self.driver.read(address, buf).map_err(|status| FlashError {
            step: FlashStep::Read,
            status,
            address,
            attempts: 0,
        })
    }

    /// CRC-32 of `len` bytes at `address`, read in bounded chunks.
    pub fn checksum(&mut self, address: u32, len: u32) -> Result<u32, FlashError> {
        self.readable(address, len)?;
        let mut digest = CRC32.digest();
        self.digest_range(address, len, &mut digest)?;
        Ok(digest.finalize())
    }

    /// Feed `len` bytes at `address` into a running CRC-32.
    pub fn digest_range(
        &mut self,
        address: u32,
        len: u32,
        digest: &mut crc::Digest<'_, u32>,
    ) -> Result<(), FlashError> {
        let mut buf = [0u8; READBACK_CHUNK];
        let mut done = 0u32;
        while done < len {
            let n = (len - done).min(READBACK_CHUNK as u32);
            let buf = &mut buf[..n as usize];
            self.read(address + done, buf)?;
            digest.update(buf);
            done += n;
        }
        Ok(())
    }

    fn readable(&self, address: u32, len: u32) -> Result<(), FlashError> {
        match self.layout.locate(address, len) {
            Some(_) => Ok(()),
            None => Err(FlashError::rejected(FlashStatus::OutOfRange, address)),
        }
    }
}

fn len_u32(bytes: &[u8]) -> u32 {
    u32::try_from(bytes.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(FlashStatus::EraseError.is_retryable());
        assert!(FlashStatus::Mismatch.is_retryable());
        assert!(FlashStatus::Hardware(0x40).is_retryable());
        assert!(!FlashStatus::OutOfRange.is_retryable());
        assert!(!FlashStatus::Locked.is_retryable());
        assert!(!FlashStatus::NoAttemptsLeft.is_retryable());
    }
}
