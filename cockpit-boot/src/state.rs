// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Session states, error taxonomy and the fault record carried by error states.

use core::fmt::{self, Write};

use heapless::String;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::FlashError;
use crate::flash::{FlashStatus, FlashStep};
use crate::guard::{Resource, ResourceSet};

/// Longest diagnostic kept in a fault.
pub const MAX_DIAGNOSTIC_LEN: usize = 64;

/// Short human-readable text captured where a failure happened.
pub type Diagnostic = String<MAX_DIAGNOSTIC_LEN>;

struct Truncating<'a>(&'a mut Diagnostic);

impl Write for Truncating<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if self.0.push(c).is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// Format a diagnostic, truncating at [`MAX_DIAGNOSTIC_LEN`] bytes.
pub fn diagnostic(args: fmt::Arguments<'_>) -> Diagnostic {
    let mut text = Diagnostic::new();
    let _ = Truncating(&mut text).write_fmt(args);
    text
}

const LISTENING: ResourceSet = ResourceSet::EMPTY.with(Resource::RxBuffer);
const RECEIVING: ResourceSet = LISTENING.with(Resource::Transfer);
const PROGRAMMING: ResourceSet = LISTENING
    .with(Resource::FlashUnlock)
    .with(Resource::InterruptMask);

/// Normal (non-error) session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Handshake = 1,
    Ready = 2,
    ReceivingData = 3,
    Verifying = 4,
    Programming = 5,
    BankSwitch = 6,
    Complete = 7,
}

impl Phase {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Idle,
            1 => Self::Handshake,
            2 => Self::Ready,
            3 => Self::ReceivingData,
            4 => Self::Verifying,
            5 => Self::Programming,
            6 => Self::BankSwitch,
            7 => Self::Complete,
            _ => return None,
        })
    }

    /// Where to resume listening after a communication fault in this phase.
    pub fn listening(self) -> Phase {
        match self {
            Self::Handshake => Self::Idle,
            Self::Programming => Self::Ready,
            Self::BankSwitch => Self::Complete,
            other => other,
        }
    }

    /// Resources a session in this phase holds.
    pub fn resources(self) -> ResourceSet {
        match self {
            Self::Idle => ResourceSet::EMPTY,
            Self::ReceivingData => RECEIVING,
            Self::Programming => PROGRAMMING,
            Self::Handshake | Self::Ready | Self::Verifying | Self::BankSwitch | Self::Complete => {
                LISTENING
            }
        }
    }

    /// A transfer and its staged bytes survive this phase.
    pub fn keeps_transfer(self) -> bool {
        matches!(
            self,
            Self::ReceivingData | Self::Verifying | Self::Programming | Self::BankSwitch
        )
    }
}

/// Error state families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorKind {
    /// Malformed message, timeout with no data, link failure.
    Communication = 1,
    /// Erase, write or verify failure, invalid target.
    FlashOperation = 2,
    /// Payload arrived but is wrong.
    DataCorruption = 3,
    /// Buffer or memory limits hit.
    ResourceExhaustion = 4,
}

impl ErrorKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Communication,
            2 => Self::FlashOperation,
            3 => Self::DataCorruption,
            4 => Self::ResourceExhaustion,
            _ => return None,
        })
    }
}

/// Specific failure; the high nibble selects the [`ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorCode {
    Timeout = 0x01,
    MalformedMessage = 0x02,
    TransportWrite = 0x03,

    InvalidRegion = 0x10,
    InvalidLength = 0x11,
    Misaligned = 0x12,
    ActiveBankProtected = 0x13,
    FlashLocked = 0x14,
    EraseFailed = 0x15,
    WriteFailed = 0x16,
    VerifyFailed = 0x17,
    ReadFailed = 0x18,
    BusyTimeout = 0x19,

    ChunkCrcMismatch = 0x20,
    ImageCrcMismatch = 0x21,

    RxOverflow = 0x30,
    TransferOverflow = 0x31,
    StagingOverflow = 0x32,
}

impl ErrorCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::Timeout,
            0x02 => Self::MalformedMessage,
            0x03 => Self::TransportWrite,
            0x10 => Self::InvalidRegion,
            0x11 => Self::InvalidLength,
            0x12 => Self::Misaligned,
            0x13 => Self::ActiveBankProtected,
            0x14 => Self::FlashLocked,
            0x15 => Self::EraseFailed,
            0x16 => Self::WriteFailed,
            0x17 => Self::VerifyFailed,
            0x18 => Self::ReadFailed,
            0x19 => Self::BusyTimeout,
            0x20 => Self::ChunkCrcMismatch,
            0x21 => Self::ImageCrcMismatch,
            0x30 => Self::RxOverflow,
            0x31 => Self::TransferOverflow,
            0x32 => Self::StagingOverflow,
            _ => return None,
        })
    }

    pub fn kind(self) -> ErrorKind {
        match self.code() >> 4 {
            0 => ErrorKind::Communication,
            1 => ErrorKind::FlashOperation,
            2 => ErrorKind::DataCorruption,
            _ => ErrorKind::ResourceExhaustion,
        }
    }

    /// Hardware failures where repeating the whole cycle may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::EraseFailed | Self::WriteFailed | Self::VerifyFailed | Self::BusyTimeout
        )
    }

    /// Classify a flash engine failure.
    pub fn from_flash(err: &FlashError) -> Self {
        match (err.step, err.status) {
            (_, FlashStatus::BusyTimeout) => Self::BusyTimeout,
            (_, FlashStatus::Misaligned) => Self::Misaligned,
            (_, FlashStatus::OutOfRange) => Self::InvalidRegion,
            (_, FlashStatus::Locked) | (FlashStep::Unlock, _) => Self::FlashLocked,
            (FlashStep::Validate, _) => Self::InvalidRegion,
            (FlashStep::Erase, _) => Self::EraseFailed,
            (FlashStep::Write, _) => Self::WriteFailed,
            (FlashStep::Read, _) => Self::ReadFailed,
            (FlashStep::Compare, _) => Self::VerifyFailed,
        }
    }
}

/// Wire code of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StateCode {
    Idle = 0,
    Handshake = 1,
    Ready = 2,
    ReceivingData = 3,
    Verifying = 4,
    Programming = 5,
    BankSwitch = 6,
    Complete = 7,
    ErrorCommunication = 0x10,
    ErrorFlashOperation = 0x11,
    ErrorDataCorruption = 0x12,
    ErrorResourceExhaustion = 0x13,
}

impl StateCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        if let Some(phase) = Phase::from_code(code) {
            return Some(phase.into());
        }
        Some(match code {
            0x10 => Self::ErrorCommunication,
            0x11 => Self::ErrorFlashOperation,
            0x12 => Self::ErrorDataCorruption,
            0x13 => Self::ErrorResourceExhaustion,
            _ => return None,
        })
    }
}

impl From<Phase> for StateCode {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Idle => Self::Idle,
            Phase::Handshake => Self::Handshake,
            Phase::Ready => Self::Ready,
            Phase::ReceivingData => Self::ReceivingData,
            Phase::Verifying => Self::Verifying,
            Phase::Programming => Self::Programming,
            Phase::BankSwitch => Self::BankSwitch,
            Phase::Complete => Self::Complete,
        }
    }
}

/// A failure as captured at its origin.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code:?} in {origin:?} (attempt {attempts}): {diagnostic}")]
pub struct Fault {
    pub code: ErrorCode,
    /// State that was active when the failure happened.
    pub origin: Phase,
    /// Flash attempts or communication faults so far; 0 where not relevant.
    pub attempts: u8,
    /// Sequence id of the request being handled, 0 if unknown.
    pub sequence: u32,
    pub diagnostic: Diagnostic,
}

impl Fault {
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

/// Current state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Handshake,
    Ready,
    ReceivingData,
    Verifying,
    Programming,
    BankSwitch,
    Complete,
    ErrorCommunication(Fault),
    ErrorFlashOperation(Fault),
    ErrorDataCorruption(Fault),
    ErrorResourceExhaustion(Fault),
}

impl State {
    /// Error state matching the fault's kind.
    pub fn failed(fault: Fault) -> Self {
        match fault.kind() {
            ErrorKind::Communication => Self::ErrorCommunication(fault),
            ErrorKind::FlashOperation => Self::ErrorFlashOperation(fault),
            ErrorKind::DataCorruption => Self::ErrorDataCorruption(fault),
            ErrorKind::ResourceExhaustion => Self::ErrorResourceExhaustion(fault),
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::ErrorCommunication(f)
            | Self::ErrorFlashOperation(f)
            | Self::ErrorDataCorruption(f)
            | Self::ErrorResourceExhaustion(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.fault().is_some()
    }

    /// The normal phase, or `None` in an error state.
    pub fn phase(&self) -> Option<Phase> {
        Some(match self {
            Self::Idle => Phase::Idle,
            Self::Handshake => Phase::Handshake,
            Self::Ready => Phase::Ready,
            Self::ReceivingData => Phase::ReceivingData,
            Self::Verifying => Phase::Verifying,
            Self::Programming => Phase::Programming,
            Self::BankSwitch => Phase::BankSwitch,
            Self::Complete => Phase::Complete,
            _ => return None,
        })
    }

    pub fn code(&self) -> StateCode {
        match self {
            Self::ErrorCommunication(_) => StateCode::ErrorCommunication,
            Self::ErrorFlashOperation(_) => StateCode::ErrorFlashOperation,
            Self::ErrorDataCorruption(_) => StateCode::ErrorDataCorruption,
            Self::ErrorResourceExhaustion(_) => StateCode::ErrorResourceExhaustion,
            normal => normal.phase().map_or(StateCode::Idle, StateCode::from),
        }
    }

    /// Resources a session in this state holds; none in error states.
    pub fn resources(&self) -> ResourceSet {
        self.phase().map_or(ResourceSet::EMPTY, Phase::resources)
    }
}

impl From<Phase> for State {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Idle => Self::Idle,
            Phase::Handshake => Self::Handshake,
            Phase::Ready => Self::Ready,
            Phase::ReceivingData => Self::ReceivingData,
            Phase::Verifying => Self::Verifying,
            Phase::Programming => Self::Programming,
            Phase::BankSwitch => Self::BankSwitch,
            Phase::Complete => Self::Complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_kinds() {
        assert_eq!(ErrorCode::Timeout.kind(), ErrorKind::Communication);
        assert_eq!(ErrorCode::BusyTimeout.kind(), ErrorKind::FlashOperation);
        assert_eq!(ErrorCode::ChunkCrcMismatch.kind(), ErrorKind::DataCorruption);
        assert_eq!(ErrorCode::RxOverflow.kind(), ErrorKind::ResourceExhaustion);
    }

    #[test]
    fn test_error_code_wire_roundtrip() {
        for code in 0u8..=0xFF {
            if let Some(parsed) = ErrorCode::from_code(code) {
                assert_eq!(parsed.code(), code);
            }
        }
        assert_eq!(ErrorCode::from_code(0x04), None);
    }

    #[test]
    fn test_diagnostic_truncates() {
        let long = [b'x'; 100];
        let long = core::str::from_utf8(&long).unwrap();
        let text = diagnostic(format_args!("{}{}", long, long));
        assert_eq!(text.len(), MAX_DIAGNOSTIC_LEN);
    }

    #[test]
    fn test_error_states_hold_no_resources() {
        let fault = Fault {
            code: ErrorCode::WriteFailed,
            origin: Phase::Programming,
            attempts: 3,
            sequence: 9,
            diagnostic: Diagnostic::new(),
        };
        let state = State::failed(fault);
        assert_eq!(state.code(), StateCode::ErrorFlashOperation);
        assert!(state.resources().is_empty());
        assert!(State::Programming.resources().contains(Resource::FlashUnlock));
    }

    #[test]
    fn test_state_code_roundtrip() {
        for code in [0u8, 3, 7, 0x10, 0x13] {
            assert_eq!(StateCode::from_code(code).map(StateCode::code), Some(code));
        }
        assert_eq!(StateCode::from_code(8), None);
    }
}
