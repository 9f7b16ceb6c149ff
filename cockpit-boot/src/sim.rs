// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! In-memory flash and a manual clock for host-side tests and tools.

use core::cell::Cell;

use crate::flash::{FlashDriver, FlashStatus, ERASED_BYTE};
use crate::guard::Clock;
use crate::layout::FlashLayout;

/// Clock driven by the test.
///
/// Each `now_ms` call returns the current value and then advances it by
/// `step`, so busy-wait loops make progress without a real timer.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u32>,
    step: Cell<u32>,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self::with_step(start_ms, 0)
    }

    pub fn with_step(start_ms: u32, step_ms: u32) -> Self {
        Self {
            now: Cell::new(start_ms),
            step: Cell::new(step_ms),
        }
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn set_step(&self, step_ms: u32) {
        self.step.set(step_ms);
    }

    /// Current value without advancing.
    pub fn peek(&self) -> u32 {
        self.now.get()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.step.get()));
        now
    }
}

/// Failure modes [`MemFlash`] can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFault {
    UnlockFails,
    EraseFails,
    WriteFails,
    /// Flip one bit in the data returned by a read.
    ReadbackFlip,
    /// Controller reports busy after an erase or write until the next one.
    StuckBusy,
}

/// Inject a fault on every matching operation.
pub const ALWAYS: u32 = u32::MAX;

/// Driver calls made so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounters {
    pub unlocks: u32,
    pub locks: u32,
    pub erases: u32,
    pub writes: u32,
    pub reads: u32,
}

#[derive(Debug, Default)]
struct Faults {
    unlock: u32,
    erase: u32,
    write: u32,
    readback: u32,
    busy: u32,
}

impl Faults {
    fn slot(&mut self, fault: FlashFault) -> &mut u32 {
        match fault {
            FlashFault::UnlockFails => &mut self.unlock,
            FlashFault::EraseFails => &mut self.erase,
            FlashFault::WriteFails => &mut self.write,
            FlashFault::ReadbackFlip => &mut self.readback,
            FlashFault::StuckBusy => &mut self.busy,
        }
    }

    fn fire(&mut self, fault: FlashFault) -> bool {
        let slot = self.slot(fault);
        match *slot {
            0 => false,
            ALWAYS => true,
            _ => {
                *slot -= 1;
                true
            }
        }
    }
}

/// NOR flash model over a caller-provided byte slice.
///
/// Erase sets a page to `0xFF`; write can only clear bits and needs the
/// controller unlocked and write-alignment units.
#[derive(Debug)]
pub struct MemFlash<'a> {
    base: u32,
    page_size: u32,
    write_align: u32,
    cells: &'a mut [u8],
    locked: bool,
    masked: bool,
    busy: bool,
    faults: Faults,
    counters: AccessCounters,
}

impl<'a> MemFlash<'a> {
    /// Flash starting at `layout.flash_base`, erased.
    pub fn new(layout: &FlashLayout, cells: &'a mut [u8]) -> Self {
        cells.fill(ERASED_BYTE);
        Self {
            base: layout.flash_base,
            page_size: layout.page_size,
            write_align: layout.write_align,
            cells,
            locked: true,
            masked: false,
            busy: false,
            faults: Faults::default(),
            counters: AccessCounters::default(),
        }
    }

    /// Make the next `times` matching operations fail ([`ALWAYS`] for all).
    pub fn inject(&mut self, fault: FlashFault, times: u32) {
        *self.faults.slot(fault) = times;
    }

    pub fn clear_faults(&mut self) {
        self.faults = Faults::default();
        self.busy = false;
    }

    pub fn counters(&self) -> AccessCounters {
        self.counters
    }

    /// Total driver calls that touch the controller or the array.
    pub fn hardware_accesses(&self) -> u32 {
        let c = self.counters;
        c.unlocks + c.erases + c.writes + c.reads
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn interrupts_masked(&self) -> bool {
        self.masked
    }

    pub fn contents(&self) -> &[u8] {
        self.cells
    }

    /// Bytes at an absolute address, bypassing the counters.
    pub fn peek(&self, address: u32, len: usize) -> Option<&[u8]> {
        let start = address.checked_sub(self.base)? as usize;
        self.cells.get(start..start.checked_add(len)?)
    }

    /// Overwrite bytes directly, as if programmed earlier.
    pub fn preload(&mut self, address: u32, data: &[u8]) -> Result<(), FlashStatus> {
        let range = self.range(address, data.len())?;
        self.cells[range].copy_from_slice(data);
        Ok(())
    }

    fn range(&self, address: u32, len: usize) -> Result<core::ops::Range<usize>, FlashStatus> {
        let start = address
            .checked_sub(self.base)
            .ok_or(FlashStatus::OutOfRange)? as usize;
        let end = start.checked_add(len).ok_or(FlashStatus::OutOfRange)?;
        if end > self.cells.len() {
            return Err(FlashStatus::OutOfRange);
        }
        Ok(start..end)
    }

    fn start_operation(&mut self) {
        self.busy = self.faults.fire(FlashFault::StuckBusy);
    }
}

impl FlashDriver for MemFlash<'_> {
    fn unlock(&mut self) -> Result<(), FlashStatus> {
        self.counters.unlocks += 1;
        if self.faults.fire(FlashFault::UnlockFails) {
            return Err(FlashStatus::Locked);
        }
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) {
        self.counters.locks += 1;
        self.locked = true;
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashStatus> {
        self.counters.erases += 1;
        if self.locked {
            return Err(FlashStatus::Locked);
        }
        if address.wrapping_sub(self.base) % self.page_size != 0 {
            return Err(FlashStatus::Misaligned);
        }
        let range = self.range(address, self.page_size as usize)?;
        self.start_operation();
        if self.faults.fire(FlashFault::EraseFails) {
            return Err(FlashStatus::EraseError);
        }
        self.cells[range].fill(ERASED_BYTE);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashStatus> {
        self.counters.writes += 1;
        if self.locked {
            return Err(FlashStatus::Locked);
        }
        if address % self.write_align != 0 || data.len() % self.write_align as usize != 0 {
            return Err(FlashStatus::Misaligned);
        }
        let range = self.range(address, data.len())?;
        self.start_operation();
        if self.faults.fire(FlashFault::WriteFails) {
            return Err(FlashStatus::ProgramError);
        }
        for (cell, byte) in self.cells[range].iter_mut().zip(data) {
            *cell &= *byte;
        }
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashStatus> {
        self.counters.reads += 1;
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.cells[range]);
        if !buf.is_empty() && self.faults.fire(FlashFault::ReadbackFlip) {
            buf[0] ^= 0x01;
        }
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        self.busy
    }

    fn mask_interrupts(&mut self) {
        self.masked = true;
    }

    fn unmask_interrupts(&mut self) {
        self.masked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: FlashLayout = FlashLayout {
        flash_base: 0x1000,
        flash_size: 0x400,
        page_size: 0x100,
        write_align: 8,
        bank_a: crate::layout::Region::new(0x1000, 0x100),
        bank_b: crate::layout::Region::new(0x1100, 0x100),
        scratch: crate::layout::Region::new(0x1300, 0x100),
    };

    #[test]
    fn test_write_needs_unlock() {
        let mut cells = [0u8; 0x400];
        let mut flash = MemFlash::new(&SMALL, &mut cells);
        assert_eq!(flash.write(0x1000, &[0; 8]), Err(FlashStatus::Locked));
        flash.unlock().unwrap();
        assert_eq!(flash.write(0x1000, &[0; 8]), Ok(()));
    }

    #[test]
    fn test_write_only_clears_bits() {
        let mut cells = [0u8; 0x400];
        let mut flash = MemFlash::new(&SMALL, &mut cells);
        flash.unlock().unwrap();
        flash.write(0x1000, &[0xF0; 8]).unwrap();
        flash.write(0x1000, &[0x0F; 8]).unwrap();
        assert_eq!(flash.peek(0x1000, 8), Some(&[0u8; 8][..]));
        flash.erase_page(0x1000).unwrap();
        assert_eq!(flash.peek(0x1000, 8), Some(&[0xFFu8; 8][..]));
    }

    #[test]
    fn test_out_of_range_read() {
        let mut cells = [0u8; 0x400];
        let mut flash = MemFlash::new(&SMALL, &mut cells);
        let mut buf = [0u8; 4];
        assert_eq!(flash.read(0x0FFE, &mut buf), Err(FlashStatus::OutOfRange));
        assert_eq!(flash.read(0x13FE, &mut buf), Err(FlashStatus::OutOfRange));
    }

    #[test]
    fn test_fault_counts_down() {
        let mut cells = [0u8; 0x400];
        let mut flash = MemFlash::new(&SMALL, &mut cells);
        flash.unlock().unwrap();
        flash.inject(FlashFault::EraseFails, 1);
        assert_eq!(flash.erase_page(0x1000), Err(FlashStatus::EraseError));
        assert_eq!(flash.erase_page(0x1000), Ok(()));
    }

    #[test]
    fn test_manual_clock_steps() {
        let clock = ManualClock::with_step(u32::MAX, 1);
        assert_eq!(clock.now_ms(), u32::MAX);
        assert_eq!(clock.now_ms(), 0);
        clock.advance(10);
        assert_eq!(clock.peek(), 11);
    }
}
