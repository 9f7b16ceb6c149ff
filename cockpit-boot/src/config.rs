// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Session tuning and device identity.

use serde::{Deserialize, Serialize};

/// Protocol major version; a handshake with a different major is refused.
pub const PROTOCOL_MAJOR: u8 = 1;
/// Protocol minor version; informational only.
pub const PROTOCOL_MINOR: u8 = 0;

/// Version string reported in handshake and device info replies.
pub const BOOTLOADER_VERSION: &str = concat!("cockpit-boot ", env!("CARGO_PKG_VERSION"));

/// Attempts of the erase-program-verify cycle before a flash fault is final.
pub const MAX_FLASH_ATTEMPTS: u8 = 3;

/// Timeouts and retry bounds of one session.
///
/// Defaults follow the per-state table of the reference bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed to finish negotiation once a handshake started.
    pub handshake_timeout_ms: u32,
    /// Idle time allowed in `Ready` and `Complete`.
    pub session_timeout_ms: u32,
    /// Silence allowed between chunks while receiving data.
    pub transfer_timeout_ms: u32,
    /// Time allowed between the last chunk and `FlashVerify`.
    pub verify_timeout_ms: u32,
    /// Silence allowed inside a partially received frame.
    pub frame_timeout_ms: u32,
    /// Bound on a single flash busy wait.
    pub busy_timeout_ms: u32,
    pub max_flash_attempts: u8,
    /// Communication faults tolerated per connection; the last one aborts.
    pub max_comm_retries: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            session_timeout_ms: 30_000,
            transfer_timeout_ms: 60_000,
            verify_timeout_ms: 5_000,
            frame_timeout_ms: 500,
            busy_timeout_ms: 250,
            max_flash_attempts: MAX_FLASH_ATTEMPTS,
            max_comm_retries: 3,
        }
    }
}

impl SessionConfig {
    /// Clamp retry bounds so at least one attempt is always made.
    pub fn sanitized(self) -> Self {
        Self {
            max_flash_attempts: self.max_flash_attempts.max(1),
            max_comm_retries: self.max_comm_retries.max(1),
            ..self
        }
    }
}

/// Identity reported by `DeviceInfoResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub model: &'static str,
    /// Factory-programmed unique id (96 bits on the reference part).
    pub unique_id: [u8; 12],
    pub bootloader_version: &'static str,
}

impl DeviceIdentity {
    pub const fn new(model: &'static str, unique_id: [u8; 12]) -> Self {
        Self {
            model,
            unique_id,
            bootloader_version: BOOTLOADER_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = SessionConfig::default();
        assert_eq!(config.session_timeout_ms, 30_000);
        assert_eq!(config.frame_timeout_ms, 500);
        assert_eq!(config.max_flash_attempts, 3);
    }

    #[test]
    fn test_sanitized_clamps_zero_bounds() {
        let config = SessionConfig {
            max_flash_attempts: 0,
            max_comm_retries: 0,
            ..SessionConfig::default()
        }
        .sanitized();
        assert_eq!(config.max_flash_attempts, 1);
        assert_eq!(config.max_comm_retries, 1);
    }
}
