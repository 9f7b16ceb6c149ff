// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Recovery policy for error states.
//!
//! The policy is a pure function of the captured fault and the session
//! limits, applied once per error state by the session machine:
//!
//! | Error kind         | Strategy                        | Next                      |
//! |--------------------|---------------------------------|---------------------------|
//! | Communication      | resume listening, bounded       | state that was active     |
//! | FlashOperation     | rerun the program cycle, bounded| `Programming` or `Ready`  |
//! | DataCorruption     | drop the transfer               | `Ready`                   |
//! | ResourceExhaustion | release everything              | `Idle`                    |

use crate::config::SessionConfig;
use crate::state::{ErrorKind, Fault, Phase};

/// What to do with a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recovery {
    /// Resume in `resume` and try again.
    Retry { resume: Phase },
    /// Give up on the current operation and continue from `to`.
    Abort { to: Phase },
}

impl Recovery {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }

    /// Phase the session moves to.
    pub fn next(&self) -> Phase {
        match *self {
            Self::Retry { resume } => resume,
            Self::Abort { to } => to,
        }
    }
}

/// Decide how to leave the error state holding `fault`.
///
/// For communication faults `fault.attempts` counts faults on this
/// connection; for flash faults it counts program cycles of the current
/// operation.
pub fn decide(fault: &Fault, config: &SessionConfig) -> Recovery {
    match fault.kind() {
        ErrorKind::Communication => {
            if fault.attempts < config.max_comm_retries {
                Recovery::Retry {
                    resume: fault.origin.listening(),
                }
            } else {
                Recovery::Abort { to: Phase::Idle }
            }
        }
        ErrorKind::FlashOperation => {
            let in_cycle = fault.origin == Phase::Programming;
            if in_cycle && fault.code.is_retryable() && fault.attempts < config.max_flash_attempts {
                Recovery::Retry {
                    resume: Phase::Programming,
                }
            } else {
                Recovery::Abort { to: Phase::Ready }
            }
        }
        ErrorKind::DataCorruption => Recovery::Abort { to: Phase::Ready },
        ErrorKind::ResourceExhaustion => Recovery::Abort { to: Phase::Idle },
    }
}
