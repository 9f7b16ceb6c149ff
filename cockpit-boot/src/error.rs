// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Error types for the codecs, the flash engine and the byte links.
//!
//! Session-level failures are carried by [`crate::state::Fault`], which wraps
//! an [`crate::state::ErrorCode`] together with the state of origin.

use thiserror::Error;

use crate::flash::{FlashStatus, FlashStep};
use crate::layout::BankId;

/// Frame encoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: usize, max: usize },

    #[error("output buffer of {capacity} bytes cannot hold a {needed} byte frame")]
    BufferTooSmall { needed: usize, capacity: usize },
}

/// Message encoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    #[error("message does not fit in {capacity} bytes")]
    BufferFull { capacity: usize },

    #[error("field {id:#04x} value of {len} bytes is too long")]
    FieldTooLong { id: u8, len: usize },
}

/// Why a message body was rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Malformation {
    #[error("empty body")]
    Empty,

    #[error("field {id:#04x} truncated")]
    Truncated { id: u8 },

    #[error("required field {id:#04x} missing")]
    MissingField { id: u8 },

    #[error("field {id:#04x} is {len} bytes wide, expected {expected}")]
    BadWidth { id: u8, len: usize, expected: usize },

    #[error("field {id:#04x} holds an invalid value")]
    BadValue { id: u8 },

    #[error("field {id:#04x} of {len} bytes exceeds its {max} byte limit")]
    TooLong { id: u8, len: usize, max: usize },
}

/// Message decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The body cannot be parsed; rejected and reported as a communication fault.
    #[error("malformed message: {0}")]
    Malformed(#[from] Malformation),

    /// The body parses but its tag is not handled here; answered with
    /// `Response(Unsupported)`.
    #[error("unsupported message tag {tag:#04x}")]
    Unsupported { tag: u8, sequence: Option<u32> },
}

/// A flash operation that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("flash {step:?} at {address:#010x} failed after {attempts} attempt(s): {status:?}")]
pub struct FlashError {
    /// Step of the last attempt that failed.
    pub step: FlashStep,
    /// Last hardware status reported by the driver.
    pub status: FlashStatus,
    /// Address the failing step was working on.
    pub address: u32,
    /// Attempts consumed, including the failing one.
    pub attempts: u8,
}

impl FlashError {
    /// Rejected before any hardware access.
    pub(crate) fn rejected(status: FlashStatus, address: u32) -> Self {
        Self {
            step: FlashStep::Validate,
            status,
            address,
            attempts: 0,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status.is_retryable()
    }
}

/// Invalid flash layout description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LayoutError {
    #[error("page size {page_size} is not a power of two or exceeds the {max} byte staging buffer")]
    PageSize { page_size: u32, max: usize },

    #[error("write alignment {align} does not divide the page size")]
    WriteAlign { align: u32 },

    #[error("{bank:?} region is not page aligned")]
    Misaligned { bank: BankId },

    #[error("{bank:?} region lies outside flash")]
    OutsideFlash { bank: BankId },

    #[error("flash at {base:#x}+{size:#x} ends past the 32-bit address space")]
    AddressSpace { base: u32, size: u32 },

    #[error("{first:?} and {second:?} regions overlap")]
    Overlap { first: BankId, second: BankId },

    #[error("banks A and B differ in size")]
    UnequalBanks,
}

/// Outgoing byte link errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    #[error("transmit buffer full")]
    BufferFull,

    #[error("link write failed")]
    Write,
}
