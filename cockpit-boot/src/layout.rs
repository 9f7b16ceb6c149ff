// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Flash memory map: two equal program banks plus a scratch region.

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// Largest erase page the staging buffer can hold.
pub const MAX_PAGE_SIZE: usize = 4096;
/// Largest programming unit supported by the flash engine.
pub const MAX_WRITE_ALIGN: usize = 256;

/// Flash region selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BankId {
    A = 0,
    B = 1,
    /// Small region for validation and test writes.
    Scratch = 2,
}

impl BankId {
    pub const ALL: [BankId; 3] = [BankId::A, BankId::B, BankId::Scratch];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::A),
            1 => Some(Self::B),
            2 => Some(Self::Scratch),
            _ => None,
        }
    }

    /// The other program bank; the scratch region has none.
    pub fn counterpart(self) -> Option<Self> {
        match self {
            Self::A => Some(Self::B),
            Self::B => Some(Self::A),
            Self::Scratch => None,
        }
    }

    pub fn is_program_bank(self) -> bool {
        !matches!(self, Self::Scratch)
    }
}

/// Role of a region relative to the currently active bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BankRole {
    Active,
    Fallback,
    Scratch,
}

/// Contiguous address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(base: u32, size: u32) -> Self {
        Self { base, size }
    }

    /// One past the last address, widened so the top of the address space fits.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    /// `[address, address + len)` lies entirely inside the region.
    pub fn contains(&self, address: u32, len: u32) -> bool {
        let start = address as u64;
        start >= self.base as u64 && start + len as u64 <= self.end()
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        (self.base as u64) < other.end() && (other.base as u64) < self.end()
    }
}

/// Bank map and programming geometry of one flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    pub flash_base: u32,
    pub flash_size: u32,
    /// Erase granularity.
    pub page_size: u32,
    /// Minimum programming unit.
    pub write_align: u32,
    pub bank_a: Region,
    pub bank_b: Region,
    pub scratch: Region,
}

impl FlashLayout {
    /// Reference platform: 128 KiB flash, 2 KiB pages, 64-bit programming.
    /// The scratch page takes the top page, so both banks are one page short
    /// of 32 KiB and a page is left unused after bank A.
    pub const REFERENCE: Self = Self {
        flash_base: 0x0800_0000,
        flash_size: 0x0002_0000,
        page_size: 2048,
        write_align: 8,
        bank_a: Region::new(0x0801_0000, 0x7800),
        bank_b: Region::new(0x0801_8000, 0x7800),
        scratch: Region::new(0x0801_F800, 0x0800),
    };

    /// Check geometry, alignment and that no two regions overlap.
    ///
    /// Flash must end below the top of the address space so every region
    /// end fits in a `u32`.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if !self.page_size.is_power_of_two() || self.page_size as usize > MAX_PAGE_SIZE {
            return Err(LayoutError::PageSize {
                page_size: self.page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        if !self.write_align.is_power_of_two()
            || self.write_align as usize > MAX_WRITE_ALIGN
            || self.page_size % self.write_align != 0
        {
            return Err(LayoutError::WriteAlign {
                align: self.write_align,
            });
        }

        let flash = Region::new(self.flash_base, self.flash_size);
        if flash.end() > u64::from(u32::MAX) {
            return Err(LayoutError::AddressSpace {
                base: self.flash_base,
                size: self.flash_size,
            });
        }
        for bank in BankId::ALL {
            let region = self.region(bank);
            if region.size == 0
                || !self.is_page_aligned(region.base)
                || region.size % self.page_size != 0
            {
                return Err(LayoutError::Misaligned { bank });
            }
            if !flash.contains(region.base, region.size) {
                return Err(LayoutError::OutsideFlash { bank });
            }
        }

        for (i, first) in BankId::ALL.iter().enumerate() {
            for second in &BankId::ALL[i + 1..] {
                if self.region(*first).overlaps(&self.region(*second)) {
                    return Err(LayoutError::Overlap {
                        first: *first,
                        second: *second,
                    });
                }
            }
        }

        if self.bank_a.size != self.bank_b.size {
            return Err(LayoutError::UnequalBanks);
        }
        Ok(())
    }

    pub fn region(&self, bank: BankId) -> Region {
        match bank {
            BankId::A => self.bank_a,
            BankId::B => self.bank_b,
            BankId::Scratch => self.scratch,
        }
    }

    /// Region holding `[address, address + len)`, if any single one does.
    pub fn locate(&self, address: u32, len: u32) -> Option<BankId> {
        BankId::ALL
            .into_iter()
            .find(|bank| self.region(*bank).contains(address, len.max(1)))
    }

    pub fn role(&self, bank: BankId, active: BankId) -> BankRole {
        match bank {
            BankId::Scratch => BankRole::Scratch,
            b if b == active => BankRole::Active,
            _ => BankRole::Fallback,
        }
    }

    pub fn is_page_aligned(&self, address: u32) -> bool {
        address % self.page_size == 0
    }

    /// Round `len` up to whole programming units.
    pub fn align_up(&self, len: u32) -> u32 {
        len.div_ceil(self.write_align) * self.write_align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_layout_is_valid() {
        assert_eq!(FlashLayout::REFERENCE.validate(), Ok(()));
    }

    #[test]
    fn test_overlapping_regions_rejected() {
        let layout = FlashLayout {
            bank_b: Region::new(0x0801_7000, 0x7800),
            ..FlashLayout::REFERENCE
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Overlap {
                first: BankId::A,
                second: BankId::B
            })
        );
    }

    #[test]
    fn test_misaligned_scratch_rejected() {
        let layout = FlashLayout {
            scratch: Region::new(0x0801_F900, 0x0800),
            ..FlashLayout::REFERENCE
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Misaligned {
                bank: BankId::Scratch
            })
        );
    }

    #[test]
    fn test_unequal_banks_rejected() {
        let layout = FlashLayout {
            bank_b: Region::new(0x0801_8000, 0x7000),
            ..FlashLayout::REFERENCE
        };
        assert_eq!(layout.validate(), Err(LayoutError::UnequalBanks));
    }

    #[test]
    fn test_locate_rejects_range_spanning_two_regions() {
        let layout = FlashLayout::REFERENCE;
        assert_eq!(layout.locate(0x0801_0000, 16), Some(BankId::A));
        assert_eq!(layout.locate(0x0801_F800, 0x800), Some(BankId::Scratch));
        assert_eq!(layout.locate(0x0801_77F0, 0x20), None);
        assert_eq!(layout.locate(0x0800_0000, 4), None);
    }

    #[test]
    fn test_roles_follow_active_bank() {
        let layout = FlashLayout::REFERENCE;
        assert_eq!(layout.role(BankId::A, BankId::A), BankRole::Active);
        assert_eq!(layout.role(BankId::B, BankId::A), BankRole::Fallback);
        assert_eq!(layout.role(BankId::Scratch, BankId::B), BankRole::Scratch);
    }

    #[test]
    fn test_align_up_to_write_unit() {
        let layout = FlashLayout::REFERENCE;
        assert_eq!(layout.align_up(0), 0);
        assert_eq!(layout.align_up(1), 8);
        assert_eq!(layout.align_up(256), 256);
        assert_eq!(layout.align_up(257), 264);
    }
}
