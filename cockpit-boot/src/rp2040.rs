// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! RP2040 flash driver and timer clock.
//!
//! Erase and program go through the boot ROM. While they run XIP is off, so
//! every instruction executed between `connect_internal_flash` and
//! `flash_enter_cmd_xip` must come from RAM: the wrappers live in `.data`
//! and call ROM entry points resolved once by [`RomFlash::new`].

use rp2040_hal::Timer;

use crate::flash::{FlashDriver, FlashStatus};
use crate::guard::Clock;
use crate::layout::{FlashLayout, Region};

/// XIP base of the external QSPI flash.
pub const FLASH_BASE: u32 = 0x1000_0000;
/// Erase unit.
pub const SECTOR_SIZE: u32 = 4096;
/// Program unit.
pub const PROGRAM_SIZE: u32 = 256;

/// 2 MB flash: bootloader, two 768 KB banks and a scratch sector.
pub const RP2040_LAYOUT: FlashLayout = FlashLayout {
    flash_base: FLASH_BASE,
    flash_size: 2 * 1024 * 1024,
    page_size: SECTOR_SIZE,
    write_align: PROGRAM_SIZE,
    bank_a: Region::new(0x1001_0000, 768 * 1024),
    bank_b: Region::new(0x100D_0000, 768 * 1024),
    scratch: Region::new(0x1019_0000, SECTOR_SIZE),
};

const SECTOR_ERASE_CMD: u8 = 0x20;

type RomFnVoid = unsafe extern "C" fn();
type RomFnErase = unsafe extern "C" fn(u32, usize, u32, u8);
type RomFnProgram = unsafe extern "C" fn(u32, *const u8, usize);

/// ROM entry points copied to RAM.
#[derive(Clone, Copy)]
struct RomTable {
    connect_internal_flash: RomFnVoid,
    flash_exit_xip: RomFnVoid,
    flash_range_erase: RomFnErase,
    flash_range_program: RomFnProgram,
    flash_flush_cache: RomFnVoid,
    flash_enter_cmd_xip: RomFnVoid,
}

/// Look up a ROM function by its two-character tag.
///
/// # Safety
/// Reads the RP2040 boot ROM table; only valid on that chip.
unsafe fn rom_func_lookup(tag: &[u8; 2]) -> usize {
    let fn_table = *(0x14 as *const u16) as *const u16;
    let lookup: unsafe extern "C" fn(*const u16, u32) -> usize =
        core::mem::transmute::<usize, unsafe extern "C" fn(*const u16, u32) -> usize>(
            *(0x18 as *const u16) as usize,
        );
    lookup(fn_table, u16::from_le_bytes(*tag) as u32)
}

impl RomTable {
    /// # Safety
    /// Must run on an RP2040 with XIP active.
    unsafe fn resolve() -> Self {
        Self {
            connect_internal_flash: core::mem::transmute::<usize, RomFnVoid>(rom_func_lookup(
                b"IF",
            )),
            flash_exit_xip: core::mem::transmute::<usize, RomFnVoid>(rom_func_lookup(b"EX")),
            flash_range_erase: core::mem::transmute::<usize, RomFnErase>(rom_func_lookup(b"RE")),
            flash_range_program: core::mem::transmute::<usize, RomFnProgram>(rom_func_lookup(
                b"RP",
            )),
            flash_flush_cache: core::mem::transmute::<usize, RomFnVoid>(rom_func_lookup(b"FC")),
            flash_enter_cmd_xip: core::mem::transmute::<usize, RomFnVoid>(rom_func_lookup(b"CX")),
        }
    }
}

#[link_section = ".data"]
#[inline(never)]
unsafe fn rom_erase(rom: &RomTable, offset: u32, size: u32) {
    (rom.connect_internal_flash)();
    (rom.flash_exit_xip)();
    (rom.flash_range_erase)(offset, size as usize, SECTOR_SIZE, SECTOR_ERASE_CMD);
    (rom.flash_flush_cache)();
    (rom.flash_enter_cmd_xip)();
}

#[link_section = ".data"]
#[inline(never)]
unsafe fn rom_program(rom: &RomTable, offset: u32, data: *const u8, len: usize) {
    (rom.connect_internal_flash)();
    (rom.flash_exit_xip)();
    (rom.flash_range_program)(offset, data, len);
    (rom.flash_flush_cache)();
    (rom.flash_enter_cmd_xip)();
}

/// On-chip flash through the boot ROM.
///
/// The ROM has no lock; `unlock`/`lock` gate the driver in software so
/// nothing erases or programs outside `Programming`.
pub struct RomFlash {
    rom: RomTable,
    unlocked: bool,
    masked: bool,
}

impl RomFlash {
    /// # Safety
    /// Must be called on an RP2040 with XIP active, and the caller must
    /// ensure no other code erases or programs flash.
    pub unsafe fn new() -> Self {
        Self {
            rom: RomTable::resolve(),
            unlocked: false,
            masked: false,
        }
    }

    fn offset(address: u32) -> Result<u32, FlashStatus> {
        address
            .checked_sub(FLASH_BASE)
            .filter(|offset| *offset < RP2040_LAYOUT.flash_size)
            .ok_or(FlashStatus::OutOfRange)
    }

    /// Run `f` with interrupts off unless the session already masked them.
    fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.masked {
            f()
        } else {
            cortex_m::interrupt::free(|_| f())
        }
    }
}

impl FlashDriver for RomFlash {
    fn unlock(&mut self) -> Result<(), FlashStatus> {
        self.unlocked = true;
        Ok(())
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn erase_page(&mut self, address: u32) -> Result<(), FlashStatus> {
        if !self.unlocked {
            return Err(FlashStatus::Locked);
        }
        let offset = Self::offset(address)?;
        if offset % SECTOR_SIZE != 0 {
            return Err(FlashStatus::Misaligned);
        }
        let rom = self.rom;
        self.critical(|| unsafe { rom_erase(&rom, offset, SECTOR_SIZE) });
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashStatus> {
        if !self.unlocked {
            return Err(FlashStatus::Locked);
        }
        let offset = Self::offset(address)?;
        if offset % PROGRAM_SIZE != 0 || data.len() % PROGRAM_SIZE as usize != 0 {
            return Err(FlashStatus::Misaligned);
        }
        let rom = self.rom;
        self.critical(|| unsafe { rom_program(&rom, offset, data.as_ptr(), data.len()) });
        Ok(())
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashStatus> {
        Self::offset(address)?;
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = unsafe { ((address + i as u32) as *const u8).read_volatile() };
        }
        Ok(())
    }

    fn mask_interrupts(&mut self) {
        cortex_m::interrupt::disable();
        self.masked = true;
    }

    fn unmask_interrupts(&mut self) {
        self.masked = false;
        unsafe { cortex_m::interrupt::enable() };
    }
}

/// Millisecond clock over the 1 MHz RP2040 timer; wraps every ~49.7 days.
pub struct TimerClock {
    timer: Timer,
}

impl TimerClock {
    pub fn new(timer: Timer) -> Self {
        Self { timer }
    }
}

impl Clock for TimerClock {
    fn now_ms(&self) -> u32 {
        (self.timer.get_counter().ticks() / 1000) as u32
    }
}
