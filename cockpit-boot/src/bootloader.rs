// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Main-loop driver: receive ring → frame decoder → session → frame encoder
//! → byte sink.
//!
//! [`Bootloader::poll`] drains every byte available, handles each decoded
//! message to completion before reading further, and then lets the session
//! check its deadlines.

use crate::error::TransportError;
use crate::flash::FlashDriver;
use crate::frame::{self, FrameDecoder, MAX_FRAME_BODY, MAX_FRAME_LEN};
use crate::guard::{elapsed_ms, Clock};
use crate::message::Message;
use crate::ring::ByteSource;
use crate::session::{LoadedImage, Outbox, SessionContext, SessionMachine};
use crate::state::{ErrorCode, State};

/// Outgoing byte link.
pub trait ByteSink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

impl<const N: usize> ByteSink for heapless::Vec<u8, N> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.extend_from_slice(bytes)
            .map_err(|_| TransportError::BufferFull)
    }
}

#[cfg(feature = "std")]
impl ByteSink for alloc::vec::Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Outbox that frames each reply straight into a sink.
struct FrameWriter<'a, T> {
    sink: &'a mut T,
    error: Option<TransportError>,
}

impl<T: ByteSink> Outbox for FrameWriter<'_, T> {
    fn emit(&mut self, message: Message) {
        let mut body = [0u8; MAX_FRAME_BODY];
        let len = match message.encode_into(&mut body) {
            Ok(len) => len,
            Err(err) => {
                error!("reply tag {:#x} not encodable: {}", message.tag(), err);
                return;
            }
        };
        let mut wire = [0u8; MAX_FRAME_LEN];
        let n = match frame::encode_into(&body[..len], &mut wire) {
            Ok(n) => n,
            Err(err) => {
                error!("reply tag {:#x} not framable: {}", message.tag(), err);
                return;
            }
        };
        if let Err(err) = self.sink.write_all(&wire[..n]) {
            warn!("reply tag {:#x} not sent: {}", message.tag(), err);
            self.error = Some(err);
        }
    }
}

/// Bootloader protocol engine for one serial link.
pub struct Bootloader<F, C> {
    machine: SessionMachine<F, C>,
    ctx: SessionContext,
    decoder: FrameDecoder,
    last_rx_ms: u32,
}

impl<F: FlashDriver, C: Clock> Bootloader<F, C> {
    pub fn new(machine: SessionMachine<F, C>) -> Self {
        let ctx = machine.new_context();
        let last_rx_ms = machine.clock().now_ms();
        Self {
            machine,
            ctx,
            decoder: FrameDecoder::new(),
            last_rx_ms,
        }
    }

    /// Drain `rx`, handle every complete frame and write replies to `tx`.
    pub fn poll<S: ByteSource, T: ByteSink>(&mut self, rx: &mut S, tx: &mut T) {
        let mut out = FrameWriter {
            sink: tx,
            error: None,
        };

        if rx.take_overflow() {
            self.machine.fail(
                &mut self.ctx,
                ErrorCode::RxOverflow,
                diag!("receive ring overflowed"),
                &mut out,
            );
            self.decoder.clear();
        }

        let now = self.machine.clock().now_ms();
        while let Some(byte) = rx.next_byte() {
            self.last_rx_ms = now;
            self.decoder.push(byte);
            self.dispatch_frames(&mut out);
        }

        let frame_timeout = self.machine.config().frame_timeout_ms;
        if !self.decoder.is_idle() && elapsed_ms(self.last_rx_ms, now) >= frame_timeout {
            self.decoder.abandon();
            self.dispatch_frames(&mut out);
        }
        self.ctx.set_frames(self.decoder.stats());

        self.machine
            .poll(&mut self.ctx, self.decoder.is_idle(), &mut out);
        self.check_link(&mut out);
    }

    fn dispatch_frames<T: ByteSink>(&mut self, out: &mut FrameWriter<'_, T>) {
        while let Some(frame) = self.decoder.next_frame() {
            let decoded = Message::decode(frame.body);
            self.ctx.set_frames(self.decoder.stats());

            match decoded {
                Ok(message) => self.machine.handle(&mut self.ctx, message, out),
                Err(err) => {
                    debug!("frame body rejected: {}", err);
                    self.machine.reject(&mut self.ctx, err, out);
                }
            }
            self.check_link(out);
        }
    }

    fn check_link<T: ByteSink>(&mut self, out: &mut FrameWriter<'_, T>) {
        if let Some(err) = out.error.take() {
            self.machine.fail(
                &mut self.ctx,
                ErrorCode::TransportWrite,
                diag!("reply lost: {}", err),
                out,
            );
            out.error = None;
        }
    }

    pub fn state(&self) -> &State {
        self.ctx.state()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn machine(&self) -> &SessionMachine<F, C> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut SessionMachine<F, C> {
        &mut self.machine
    }

    pub fn loaded_image(&self) -> Option<LoadedImage> {
        self.machine.loaded_image()
    }

    /// Abort the session from outside the protocol (reset line, disconnect).
    pub fn abort(&mut self) {
        self.machine.abort(&mut self.ctx);
        self.decoder.clear();
    }

    /// Start a fresh connection: new context, empty decoder.
    pub fn reset(&mut self) {
        self.machine.abort(&mut self.ctx);
        self.ctx = self.machine.new_context();
        self.decoder = FrameDecoder::new();
    }
}
