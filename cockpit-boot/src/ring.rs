// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Lock-free byte intake between the receive interrupt and the poll loop.
//!
//! The interrupt handler owns an [`RxProducer`] and pushes one byte per
//! interrupt; the poll loop owns the matching [`RxConsumer`]. The queue and
//! an overflow flag are the only state the two sides share.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heapless::spsc::{Consumer, Producer, Queue};

/// Source of received bytes drained by the poll loop.
pub trait ByteSource {
    fn next_byte(&mut self) -> Option<u8>;

    /// Whether bytes were lost since the last call; clears the condition.
    fn take_overflow(&mut self) -> bool {
        false
    }
}

/// Single-producer single-consumer receive ring holding `N - 1` bytes.
pub struct RxRing<const N: usize> {
    queue: Queue<u8, N>,
    overflow: AtomicBool,
    dropped: AtomicU32,
}

impl<const N: usize> RxRing<N> {
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
            overflow: AtomicBool::new(false),
            dropped: AtomicU32::new(0),
        }
    }

    /// Split into the interrupt-side and poll-side halves.
    pub fn split(&mut self) -> (RxProducer<'_, N>, RxConsumer<'_, N>) {
        let (producer, consumer) = self.queue.split();
        (
            RxProducer {
                inner: producer,
                overflow: &self.overflow,
                dropped: &self.dropped,
            },
            RxConsumer {
                inner: consumer,
                overflow: &self.overflow,
                dropped: &self.dropped,
            },
        )
    }
}

impl<const N: usize> Default for RxRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-side half.
pub struct RxProducer<'a, const N: usize> {
    inner: Producer<'a, u8, N>,
    overflow: &'a AtomicBool,
    dropped: &'a AtomicU32,
}

impl<const N: usize> RxProducer<'_, N> {
    /// Enqueue one byte. A full ring drops the byte and flags the overflow.
    pub fn push(&mut self, byte: u8) -> bool {
        match self.inner.enqueue(byte) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.overflow.store(true, Ordering::Release);
                false
            }
        }
    }
}

/// Poll-side half.
pub struct RxConsumer<'a, const N: usize> {
    inner: Consumer<'a, u8, N>,
    overflow: &'a AtomicBool,
    dropped: &'a AtomicU32,
}

impl<const N: usize> RxConsumer<'_, N> {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Total bytes dropped since the ring was created.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<const N: usize> ByteSource for RxConsumer<'_, N> {
    fn next_byte(&mut self) -> Option<u8> {
        self.inner.dequeue()
    }

    fn take_overflow(&mut self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }
}

/// Byte source over an in-memory slice.
pub struct SliceSource<'a> {
    bytes: core::slice::Iter<'a, u8>,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes: bytes.iter(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        self.bytes.next().copied()
    }
}
