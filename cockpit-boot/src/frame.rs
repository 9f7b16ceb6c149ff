// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Frame codec: `0x7E | len_hi | len_lo | body | crc_hi | crc_lo`.
//!
//! `len` counts the body only and the CRC-16/CCITT trailer covers the body
//! only. The decoder keeps every byte taken in since the current marker.
//! When a length or CRC check fails it rescans those bytes for the next
//! marker and replays from there, so a marker hidden inside a rejected
//! frame still starts a frame.

#[cfg(feature = "std")]
use alloc::vec::Vec;

use heapless::{Deque, Vec as HeaplessVec};

use crate::checksum::crc16;
use crate::error::FrameError;

/// Start-of-frame marker.
pub const FRAME_MARKER: u8 = 0x7E;
/// Largest accepted body.
pub const MAX_FRAME_BODY: usize = 512;
/// Marker, length and CRC bytes around the body.
pub const FRAME_OVERHEAD: usize = 5;
/// Largest encoded frame.
pub const MAX_FRAME_LEN: usize = MAX_FRAME_BODY + FRAME_OVERHEAD;

const BODY_START: usize = 3;

/// A received frame whose CRC matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub body: &'a [u8],
    pub crc: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitMarker,
    LengthHigh,
    LengthLow { high: u8 },
    Body,
    CrcHigh,
    CrcLow { high: u8 },
}

/// Frame counters since the decoder was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub accepted: u32,
    pub crc_errors: u32,
    pub oversize: u32,
    /// Partial frames abandoned after an inter-byte timeout.
    pub abandoned: u32,
}

impl FrameStats {
    pub fn rejected(&self) -> u32 {
        self.crc_errors + self.oversize + self.abandoned
    }
}

/// Byte-at-a-time frame decoder.
///
/// `raw` holds the bytes of the frame in progress, marker included. Bytes
/// waiting to be scanned (fresh input, or bytes handed back by a rejected
/// frame) sit in `pending`. Together they never exceed one full frame: a
/// full `raw` always resolves, and every resolution gives back fewer bytes
/// than it took.
pub struct FrameDecoder {
    state: RxState,
    len: usize,
    raw: [u8; MAX_FRAME_LEN],
    raw_len: usize,
    pending: Deque<u8, MAX_FRAME_LEN>,
    stats: FrameStats,
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: RxState::WaitMarker,
            len: 0,
            raw: [0u8; MAX_FRAME_LEN],
            raw_len: 0,
            pending: Deque::new(),
            stats: FrameStats {
                accepted: 0,
                crc_errors: 0,
                oversize: 0,
                abandoned: 0,
            },
        }
    }

    /// Queue one received byte. Call [`next_frame`](Self::next_frame)
    /// until it returns `None` to collect what it completes.
    pub fn push(&mut self, byte: u8) {
        if self.pending.push_back(byte).is_err() {
            warn!("frame decoder backlog full, dropping partial frame");
            self.drop_partial();
            self.pending.clear();
            let _ = self.pending.push_back(byte);
        }
    }

    /// Scan queued bytes up to the next frame whose CRC matched.
    pub fn next_frame(&mut self) -> Option<Frame<'_>> {
        while let Some(byte) = self.pending.pop_front() {
            if self.step(byte) {
                let body = &self.raw[BODY_START..BODY_START + self.len];
                let crc = u16::from_be_bytes([
                    self.raw[BODY_START + self.len],
                    self.raw[BODY_START + self.len + 1],
                ]);
                return Some(Frame { body, crc });
            }
        }
        None
    }

    /// Feed one byte; returns the first frame it completes.
    ///
    /// A byte that closes a rejected frame can complete more than one
    /// frame on replay; the rest are returned by `next_frame`.
    pub fn feed(&mut self, byte: u8) -> Option<Frame<'_>> {
        self.push(byte);
        self.next_frame()
    }

    /// Advance by one byte; true when `raw` holds a complete valid frame.
    fn step(&mut self, byte: u8) -> bool {
        if self.state == RxState::WaitMarker {
            if byte == FRAME_MARKER {
                self.raw[0] = byte;
                self.raw_len = 1;
                self.state = RxState::LengthHigh;
            }
            return false;
        }

        self.raw[self.raw_len] = byte;
        self.raw_len += 1;

        match self.state {
            RxState::WaitMarker => {}
            RxState::LengthHigh => self.state = RxState::LengthLow { high: byte },
            RxState::LengthLow { high } => {
                let len = u16::from_be_bytes([high, byte]) as usize;
                if len > MAX_FRAME_BODY {
                    warn!("frame length {} exceeds {}, resyncing", len, MAX_FRAME_BODY);
                    self.stats.oversize += 1;
                    self.resync();
                } else {
                    self.len = len;
                    self.state = if len == 0 {
                        RxState::CrcHigh
                    } else {
                        RxState::Body
                    };
                }
            }
            RxState::Body => {
                if self.raw_len == BODY_START + self.len {
                    self.state = RxState::CrcHigh;
                }
            }
            RxState::CrcHigh => self.state = RxState::CrcLow { high: byte },
            RxState::CrcLow { high } => {
                let received = u16::from_be_bytes([high, byte]);
                let computed = crc16(&self.raw[BODY_START..BODY_START + self.len]);
                if received != computed {
                    warn!(
                        "frame CRC mismatch: received {:#x}, computed {:#x} ({} byte body)",
                        received,
                        computed,
                        self.len
                    );
                    self.stats.crc_errors += 1;
                    self.resync();
                    return false;
                }
                self.state = RxState::WaitMarker;
                self.stats.accepted += 1;
                trace!("frame accepted ({} bytes)", self.len);
                return true;
            }
        }
        false
    }

    /// Hand the bytes after the rejected marker back for rescanning,
    /// starting at the next marker among them.
    fn resync(&mut self) {
        self.state = RxState::WaitMarker;
        let taken = self.raw_len;
        self.raw_len = 0;
        let next = match self.raw[1..taken].iter().position(|&b| b == FRAME_MARKER) {
            Some(offset) => offset + 1,
            None => return,
        };
        for &b in self.raw[next..taken].iter().rev() {
            if self.pending.push_front(b).is_err() {
                break;
            }
        }
    }

    fn drop_partial(&mut self) {
        self.state = RxState::WaitMarker;
        self.raw_len = 0;
    }

    /// No frame is partially received and nothing waits to be scanned.
    pub fn is_idle(&self) -> bool {
        self.state == RxState::WaitMarker && self.pending.is_empty()
    }

    /// Give up on a partial frame after the link went quiet mid-frame.
    ///
    /// Bytes after its marker are rescanned, so drain
    /// [`next_frame`](Self::next_frame) afterwards.
    pub fn abandon(&mut self) {
        if self.state != RxState::WaitMarker {
            debug!("abandoning partial frame ({} bytes)", self.raw_len);
            self.stats.abandoned += 1;
            self.resync();
        }
    }

    /// Drop the partial frame and everything queued.
    pub fn clear(&mut self) {
        self.drop_partial();
        self.pending.clear();
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `body` as a frame into `out`; returns the frame length.
pub fn encode_into(body: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
    if body.len() > MAX_FRAME_BODY {
        return Err(FrameError::BodyTooLarge {
            len: body.len(),
            max: MAX_FRAME_BODY,
        });
    }
    let total = body.len() + FRAME_OVERHEAD;
    if out.len() < total {
        return Err(FrameError::BufferTooSmall {
            needed: total,
            capacity: out.len(),
        });
    }

    out[0] = FRAME_MARKER;
    out[1..3].copy_from_slice(&(body.len() as u16).to_be_bytes());
    out[3..3 + body.len()].copy_from_slice(body);
    out[3 + body.len()..total].copy_from_slice(&crc16(body).to_be_bytes());
    Ok(total)
}

/// Encode `body` as a frame into a heapless Vec (for no_std).
pub fn encode<const N: usize>(body: &[u8]) -> Result<HeaplessVec<u8, N>, FrameError> {
    let mut out = HeaplessVec::new();
    out.resize(body.len() + FRAME_OVERHEAD, 0)
        .map_err(|_| FrameError::BufferTooSmall {
            needed: body.len() + FRAME_OVERHEAD,
            capacity: N,
        })?;
    let len = encode_into(body, &mut out)?;
    out.truncate(len);
    Ok(out)
}

/// Encode `body` as a frame into a Vec (for std).
#[cfg(feature = "std")]
pub fn encode_vec(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = alloc::vec![0u8; body.len() + FRAME_OVERHEAD];
    encode_into(body, &mut out)?;
    Ok(out)
}
