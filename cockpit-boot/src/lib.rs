// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Bootloader protocol engine for CockpitVM devices.
//!
//! The crate turns a serial byte stream into CRC-protected frames, decodes
//! them into typed messages, drives the update session state machine and
//! programs dual-banked flash with retry and read-back verification.
//!
//! This crate supports both `no_std` (embedded) and `std` (host) environments:
//! - Default: `no_std` mode, no allocation
//! - `std` feature: `Vec` based helpers for host tools
//! - `defmt` feature: log through `defmt` instead of the `log` facade
//! - `embedded` feature: RP2040 flash driver and timer clock (rp2040-hal)
//! - `sim` feature: in-memory flash and manual clock for tests

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate alloc;

#[macro_use]
mod fmt;

pub mod bootloader;
pub mod checksum;
pub mod config;
pub mod error;
pub mod flash;
pub mod frame;
pub mod guard;
pub mod layout;
pub mod message;
mod query;
pub mod recovery;
pub mod ring;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod state;
pub mod tlv;

// RP2040 platform support (requires embedded feature)
#[cfg(feature = "embedded")]
pub mod rp2040;

// Re-export commonly used types
pub use bootloader::{Bootloader, ByteSink};
pub use config::{DeviceIdentity, SessionConfig};
pub use error::{DecodeError, EncodeError, FlashError, FrameError, LayoutError, TransportError};
pub use flash::{FlashDriver, FlashEngine, FlashStatus};
pub use frame::{Frame, FrameDecoder, FRAME_MARKER, MAX_FRAME_BODY};
pub use guard::{Clock, Deadline, Resource, ResourceGuard, ResourceSet};
pub use layout::{BankId, BankRole, FlashLayout, Region};
pub use message::{Capabilities, Message, ResultCode, MAX_CHUNK_SIZE};
pub use recovery::Recovery;
pub use ring::{ByteSource, RxRing};
pub use session::{LoadedImage, Outbox, SessionContext, SessionMachine};
pub use state::{ErrorCode, ErrorKind, Fault, Phase, State, StateCode};
