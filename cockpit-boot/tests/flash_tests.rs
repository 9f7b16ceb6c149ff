// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash engine tests against the in-memory NOR model.

use cockpit_boot::checksum::crc32;
use cockpit_boot::flash::{FlashEngine, FlashStatus, FlashStep};
use cockpit_boot::sim::{FlashFault, ManualClock, MemFlash, ALWAYS};
use cockpit_boot::{BankId, FlashLayout, LayoutError, Region};

const LAYOUT: FlashLayout = FlashLayout::REFERENCE;
const BUSY_TIMEOUT_MS: u32 = 250;

fn cells() -> Vec<u8> {
    vec![0u8; LAYOUT.flash_size as usize]
}

fn engine(cells: &mut [u8]) -> FlashEngine<MemFlash<'_>> {
    FlashEngine::new(MemFlash::new(&LAYOUT, cells), LAYOUT, BUSY_TIMEOUT_MS).unwrap()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 1) as u8).collect()
}

// =============================================================================
// Successful programming
// =============================================================================

#[test]
fn test_program_pads_to_write_alignment() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    let data = image(13);

    let report = flash.program(&clock, BankId::Scratch, 0, &data).unwrap();
    assert_eq!(report.address, LAYOUT.scratch.base);
    assert_eq!(report.written, 16);
    assert_eq!(report.attempts, 1);

    let mem = flash.driver();
    assert_eq!(mem.peek(LAYOUT.scratch.base, 13), Some(&data[..]));
    assert_eq!(mem.peek(LAYOUT.scratch.base + 13, 3), Some(&[0xFF; 3][..]));
    assert!(mem.is_locked());
    assert!(!mem.interrupts_masked());
}

#[test]
fn test_program_spanning_two_pages_erases_both() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    let data = image(LAYOUT.page_size as usize + 100);

    let report = flash.program(&clock, BankId::B, 0, &data).unwrap();
    assert_eq!(report.written, LAYOUT.page_size + 104);
    assert_eq!(flash.driver().counters().erases, 2);
    assert_eq!(flash.checksum(LAYOUT.bank_b.base, data.len() as u32), Ok(crc32(&data)));
}

#[test]
fn test_reprogram_replaces_previous_contents() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);

    flash.program(&clock, BankId::A, 0, &[0x00; 64]).unwrap();
    flash.program(&clock, BankId::A, 0, &[0xA5; 64]).unwrap();
    assert_eq!(flash.driver().peek(LAYOUT.bank_a.base, 64), Some(&[0xA5; 64][..]));
}

// =============================================================================
// Retry budget
// =============================================================================

#[test]
fn test_erase_failure_exhausts_three_attempts() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    flash.driver_mut().inject(FlashFault::EraseFails, ALWAYS);

    let err = flash.program(&clock, BankId::A, 0, &image(32)).unwrap_err();
    assert_eq!(err.step, FlashStep::Erase);
    assert_eq!(err.status, FlashStatus::EraseError);
    assert_eq!(err.attempts, 3);
    assert_eq!(flash.driver().counters().erases, 3);
    assert_eq!(flash.driver().counters().writes, 0);
    assert!(flash.driver().is_locked());
}

#[test]
fn test_transient_erase_failure_recovers_on_second_attempt() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    flash.driver_mut().inject(FlashFault::EraseFails, 1);

    let report = flash.program(&clock, BankId::A, 0, &image(32)).unwrap();
    assert_eq!(report.attempts, 2);
}

#[test]
fn test_readback_mismatch_is_retried() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    flash.driver_mut().inject(FlashFault::ReadbackFlip, 1);

    let data = image(40);
    let report = flash.program(&clock, BankId::A, 0, &data).unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(flash.driver().peek(LAYOUT.bank_a.base, 40), Some(&data[..]));
}

#[test]
fn test_persistent_mismatch_reports_compare_step() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    flash.driver_mut().inject(FlashFault::ReadbackFlip, ALWAYS);

    let err = flash.program(&clock, BankId::A, 0, &image(40)).unwrap_err();
    assert_eq!(err.step, FlashStep::Compare);
    assert_eq!(err.status, FlashStatus::Mismatch);
    assert_eq!(err.address, LAYOUT.bank_a.base);
    assert_eq!(err.attempts, 3);
}

#[test]
fn test_spent_budget_makes_no_attempt() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    flash.unlock().unwrap();

    let mut attempts = 3;
    let err = flash
        .program_with_budget(&clock, BankId::A, 0, &image(8), &mut attempts, 3)
        .unwrap_err();
    assert_eq!(err.status, FlashStatus::NoAttemptsLeft);
    assert_eq!(attempts, 3);
    assert_eq!(flash.driver().counters().erases, 0);
}

#[test]
fn test_unlock_failure_touches_nothing_else() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    flash.driver_mut().inject(FlashFault::UnlockFails, 1);

    let err = flash.program(&clock, BankId::A, 0, &image(8)).unwrap_err();
    assert_eq!(err.step, FlashStep::Unlock);
    assert_eq!(flash.driver().counters().erases, 0);
    assert_eq!(flash.driver().counters().writes, 0);
}

// =============================================================================
// Busy timeout
// =============================================================================

#[test]
fn test_transient_busy_stall_is_retried_in_the_same_call() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::with_step(0, 10);
    flash.driver_mut().inject(FlashFault::StuckBusy, 1);
    let data = image(16);

    let report = flash.program(&clock, BankId::A, 0, &data).unwrap();
    assert_eq!(report.attempts, 2);
    assert!(clock.peek() >= BUSY_TIMEOUT_MS);
    assert_eq!(flash.driver().peek(LAYOUT.bank_a.base, 16), Some(&data[..]));
    assert!(flash.driver().is_locked());
}

#[test]
fn test_busy_on_every_attempt_spends_the_budget() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::with_step(0, 10);
    flash.driver_mut().inject(FlashFault::StuckBusy, ALWAYS);

    let err = flash.program(&clock, BankId::A, 0, &image(16)).unwrap_err();
    assert_eq!(err.status, FlashStatus::BusyTimeout);
    assert_eq!(err.step, FlashStep::Erase);
    assert_eq!(err.attempts, 3);
    assert_eq!(flash.driver().counters().erases, 3);
    assert!(clock.peek() >= 3 * BUSY_TIMEOUT_MS);
    assert!(!flash.driver().interrupts_masked());
}

#[test]
fn test_budgeted_program_yields_on_busy_and_resumes() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::with_step(0, 10);
    flash.driver_mut().inject(FlashFault::StuckBusy, 1);
    flash.unlock().unwrap();

    let mut attempts = 0;
    let err = flash
        .program_with_budget(&clock, BankId::A, 0, &image(16), &mut attempts, 3)
        .unwrap_err();
    assert_eq!(err.status, FlashStatus::BusyTimeout);
    assert_eq!(attempts, 1);

    // The next poll continues with what is left of the budget.
    let report = flash
        .program_with_budget(&clock, BankId::A, 0, &image(16), &mut attempts, 3)
        .unwrap();
    assert_eq!(report.attempts, 2);
}

#[test]
fn test_busy_deadline_survives_clock_wrap() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::with_step(u32::MAX - 100, 10);
    flash.driver_mut().inject(FlashFault::StuckBusy, 1);

    let report = flash.program(&clock, BankId::A, 0, &image(16)).unwrap();
    assert_eq!(report.attempts, 2);
    assert!(clock.peek() < u32::MAX - 100);
}

// =============================================================================
// Validation happens before any hardware access
// =============================================================================

#[test]
fn test_out_of_region_touches_no_hardware() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);

    let tail = LAYOUT.bank_a.size - 8;
    let err = flash.program(&clock, BankId::A, tail, &image(16)).unwrap_err();
    assert_eq!(err.status, FlashStatus::OutOfRange);
    assert_eq!(err.attempts, 0);

    let err = flash.program(&clock, BankId::A, 0, &[]).unwrap_err();
    assert_eq!(err.status, FlashStatus::OutOfRange);

    assert_eq!(flash.driver().hardware_accesses(), 0);
}

#[test]
fn test_unaligned_offset_rejected() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);

    let err = flash.program(&clock, BankId::B, 8, &image(16)).unwrap_err();
    assert_eq!(err.status, FlashStatus::Misaligned);
    assert_eq!(flash.driver().hardware_accesses(), 0);
}

#[test]
fn test_invalid_layout_rejected_at_construction() {
    let mut cells = cells();
    let layout = FlashLayout {
        write_align: 3,
        ..LAYOUT
    };
    assert!(FlashEngine::new(MemFlash::new(&layout, &mut cells), layout, 250).is_err());
}

#[test]
fn test_layout_ending_at_top_of_address_space_rejected() {
    let top = FlashLayout {
        flash_base: 0xFFFE_0000,
        bank_a: Region::new(0xFFFF_0000, 0x7800),
        bank_b: Region::new(0xFFFF_8000, 0x7800),
        scratch: Region::new(0xFFFE_0000, 0x0800),
        ..LAYOUT
    };
    assert_eq!(
        top.validate(),
        Err(LayoutError::AddressSpace {
            base: 0xFFFE_0000,
            size: LAYOUT.flash_size,
        })
    );

    // One page lower it fits.
    let below = FlashLayout {
        flash_base: 0xFFFD_F800,
        ..top
    };
    assert_eq!(below.validate(), Ok(()));
}

// =============================================================================
// Read and checksum
// =============================================================================

#[test]
fn test_read_and_checksum_inside_regions() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);
    let clock = ManualClock::new(0);
    let data = image(300);
    flash.program(&clock, BankId::A, 0, &data).unwrap();

    let mut buf = [0u8; 300];
    flash.read(LAYOUT.bank_a.base, &mut buf).unwrap();
    assert_eq!(&buf[..], &data[..]);
    assert_eq!(flash.checksum(LAYOUT.bank_a.base, 300), Ok(crc32(&data)));
    // Erased flash past the image.
    assert_eq!(
        flash.checksum(LAYOUT.bank_a.base + 304, 16),
        Ok(crc32(&[0xFF; 16]))
    );
}

#[test]
fn test_read_outside_regions_rejected() {
    let mut cells = cells();
    let mut flash = engine(&mut cells);

    let mut buf = [0u8; 16];
    let err = flash.read(LAYOUT.flash_base, &mut buf).unwrap_err();
    assert_eq!(err.status, FlashStatus::OutOfRange);

    // Spans the gap after bank A.
    let err = flash.checksum(LAYOUT.bank_a.base + LAYOUT.bank_a.size - 8, 16).unwrap_err();
    assert_eq!(err.status, FlashStatus::OutOfRange);
    assert_eq!(flash.driver().counters().reads, 0);
}
