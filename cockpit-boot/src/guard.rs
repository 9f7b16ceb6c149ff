// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Wraparound-safe deadlines and hardware resource bookkeeping.
//!
//! Tick values are `u32` milliseconds from a free-running counter. All
//! arithmetic is done modulo 2^32, so a deadline armed just before the
//! counter wraps still expires exactly `timeout_ms` later.

/// Monotonic millisecond tick source (monotonic modulo wraparound).
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// Milliseconds elapsed from `start` to `now`, across wraparound.
pub fn elapsed_ms(start: u32, now: u32) -> u32 {
    now.wrapping_sub(start)
}

/// A wait that expires `timeout_ms` after it was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    /// Arm a deadline at tick `now`.
    pub fn set(now: u32, timeout_ms: u32) -> Self {
        Self {
            start: now,
            timeout_ms,
        }
    }

    pub fn is_expired(&self, now: u32) -> bool {
        elapsed_ms(self.start, now) >= self.timeout_ms
    }

    pub fn remaining(&self, now: u32) -> u32 {
        self.timeout_ms.saturating_sub(elapsed_ms(self.start, now))
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }
}

/// Hardware resources a session can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Resource {
    /// Receive buffer reservation for the serial link.
    RxBuffer = 1 << 0,
    /// Bulk transfer channel used while chunks stream in.
    Transfer = 1 << 1,
    /// Flash controller unlocked for erase and program.
    FlashUnlock = 1 << 2,
    /// Interrupts masked around flash operations.
    InterruptMask = 1 << 3,
}

impl Resource {
    pub const ALL: [Resource; 4] = [
        Resource::RxBuffer,
        Resource::Transfer,
        Resource::FlashUnlock,
        Resource::InterruptMask,
    ];

    fn bit(self) -> u8 {
        self as u8
    }
}

/// Set of [`Resource`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSet(u8);

impl ResourceSet {
    pub const EMPTY: Self = Self(0);

    pub const fn with(self, resource: Resource) -> Self {
        Self(self.0 | resource as u8)
    }

    pub fn contains(&self, resource: Resource) -> bool {
        self.0 & resource.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members of `self` missing from `other`.
    pub fn difference(&self, other: ResourceSet) -> ResourceSet {
        Self(self.0 & !other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Resource> + '_ {
        Resource::ALL.into_iter().filter(|r| self.contains(*r))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl FromIterator<Resource> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, |set, r| set.with(r))
    }
}

/// Resources held by one session context.
///
/// `acquire` and `release` are idempotent: they report whether the call
/// changed anything so side effects run exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceGuard {
    held: ResourceSet,
}

impl ResourceGuard {
    pub const fn new() -> Self {
        Self {
            held: ResourceSet::EMPTY,
        }
    }

    /// Returns `true` if the resource was not held before.
    pub fn acquire(&mut self, resource: Resource) -> bool {
        let fresh = !self.held.contains(resource);
        self.held = self.held.with(resource);
        fresh
    }

    /// Returns `true` if the resource was held before.
    pub fn release(&mut self, resource: Resource) -> bool {
        let held = self.held.contains(resource);
        self.held = ResourceSet(self.held.0 & !resource.bit());
        held
    }

    /// Release everything; returns what was held.
    pub fn release_all(&mut self) -> ResourceSet {
        core::mem::take(&mut self.held)
    }

    pub fn held(&self) -> ResourceSet {
        self.held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_expires_after_timeout() {
        let deadline = Deadline::set(1_000, 500);
        assert!(!deadline.is_expired(1_000));
        assert!(!deadline.is_expired(1_499));
        assert!(deadline.is_expired(1_500));
        assert_eq!(deadline.remaining(1_200), 300);
        assert_eq!(deadline.remaining(9_999), 0);
    }

    #[test]
    fn test_deadline_across_wraparound() {
        let deadline = Deadline::set(u32::MAX - 9, 20);
        assert!(!deadline.is_expired(u32::MAX));
        assert!(!deadline.is_expired(0));
        assert!(!deadline.is_expired(9));
        assert!(deadline.is_expired(10));
        assert!(deadline.is_expired(11));
    }

    #[test]
    fn test_zero_timeout_is_expired_immediately() {
        assert!(Deadline::set(42, 0).is_expired(42));
    }

    #[test]
    fn test_acquire_release_idempotent() {
        let mut guard = ResourceGuard::new();
        assert!(guard.acquire(Resource::FlashUnlock));
        assert!(!guard.acquire(Resource::FlashUnlock));
        assert!(guard.release(Resource::FlashUnlock));
        assert!(!guard.release(Resource::FlashUnlock));
        assert!(guard.held().is_empty());
    }

    #[test]
    fn test_release_all_reports_held() {
        let mut guard = ResourceGuard::new();
        guard.acquire(Resource::RxBuffer);
        guard.acquire(Resource::InterruptMask);
        let released = guard.release_all();
        assert!(released.contains(Resource::RxBuffer));
        assert!(released.contains(Resource::InterruptMask));
        assert!(!released.contains(Resource::Transfer));
        assert!(guard.held().is_empty());
    }

    #[test]
    fn test_set_difference() {
        let a: ResourceSet = [Resource::RxBuffer, Resource::FlashUnlock].into_iter().collect();
        let b = ResourceSet::EMPTY.with(Resource::RxBuffer);
        let diff: ResourceSet = a.difference(b);
        assert_eq!(diff.iter().count(), 1);
        assert!(diff.contains(Resource::FlashUnlock));
    }
}
