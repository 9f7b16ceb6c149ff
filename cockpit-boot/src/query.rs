// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Read-only request handlers: device info, flash readback, checksums and
//! status. None of them enters `Programming`.

use heapless::Vec;

use crate::flash::FlashDriver;
use crate::guard::Clock;
use crate::message::{
    truncated_text, Capabilities, ChecksumRequest, ChecksumResponse, DeviceInfoResponse,
    FlashReadRequest, FlashReadResponse, Message, Payload, ResultCode, StatusResponse,
    MAX_CHUNK_SIZE, READ_RESPONSE_OVERHEAD,
};
use crate::session::{Outbox, SessionContext, SessionMachine};
use crate::state::{ErrorCode, State};

impl<F: FlashDriver, C: Clock> SessionMachine<F, C> {
    fn queries_allowed(ctx: &SessionContext) -> bool {
        matches!(ctx.state(), State::Ready | State::Complete)
    }

    pub(crate) fn on_device_info<O: Outbox>(&mut self, ctx: &mut SessionContext, out: &mut O) {
        if !Self::queries_allowed(ctx) {
            return self.invalid_state(ctx, out);
        }
        let layout = self.flash.layout();
        let mut device_id = Vec::new();
        // 12 id bytes always fit the 16 byte field.
        let _ = device_id.extend_from_slice(&self.identity.unique_id);

        out.emit(Message::DeviceInfoResponse(DeviceInfoResponse {
            sequence: ctx.sequence(),
            model: truncated_text(self.identity.model),
            device_id,
            version: truncated_text(self.identity.bootloader_version),
            flash_base: layout.flash_base,
            flash_size: layout.flash_size,
            page_size: layout.page_size,
            write_align: layout.write_align,
            bank_a: layout.bank_a,
            bank_b: layout.bank_b,
            scratch: layout.scratch,
            active_bank: self.active_bank,
        }));
    }

    /// Stream `[address, address + length)` as a run of responses; the
    /// last one has `has_more == false`.
    pub(crate) fn on_flash_read<O: Outbox>(
        &mut self,
        ctx: &mut SessionContext,
        m: FlashReadRequest,
        out: &mut O,
    ) {
        if !Self::queries_allowed(ctx) {
            return self.invalid_state(ctx, out);
        }
        if !self.negotiated(ctx, Capabilities::READBACK, out) {
            return;
        }
        let end = match m.address.checked_add(m.length) {
            Some(end) if self.flash.layout().locate(m.address, m.length).is_some() => end,
            _ => {
                debug!("query: read {:#x}+{} outside regions", m.address, m.length);
                return self.reply(ctx, out, ResultCode::InvalidArgument, Some(m.address), Some(m.length));
            }
        };

        let room = usize::from(ctx.max_frame()).saturating_sub(READ_RESPONSE_OVERHEAD);
        let chunk = room.clamp(1, MAX_CHUNK_SIZE) as u32;
        let mut at = m.address;
        let mut buf = [0u8; MAX_CHUNK_SIZE];

        loop {
            let n = (end - at).min(chunk);
            let data = &mut buf[..n as usize];
            if let Err(err) = self.flash.read(at, data) {
                return self.fail(
                    ctx,
                    ErrorCode::from_flash(&err),
                    diag!("readback at {:#x}: {:?}", at, err.status),
                    out,
                );
            }
            let Ok(payload) = Payload::from_slice(data) else {
                return;
            };
            let next = at + n;
            out.emit(Message::FlashReadResponse(FlashReadResponse {
                sequence: ctx.sequence(),
                address: at,
                payload,
                has_more: next < end,
            }));
            if next >= end {
                break;
            }
            at = next;
        }
        trace!("query: read {} bytes at {:#x}", m.length, m.address);
    }

    pub(crate) fn on_checksum<O: Outbox>(
        &mut self,
        ctx: &mut SessionContext,
        m: ChecksumRequest,
        out: &mut O,
    ) {
        if !Self::queries_allowed(ctx) {
            return self.invalid_state(ctx, out);
        }
        if !self.negotiated(ctx, Capabilities::CHECKSUM, out) {
            return;
        }
        if self.flash.layout().locate(m.address, m.length).is_none() {
            return self.reply(ctx, out, ResultCode::InvalidArgument, Some(m.address), Some(m.length));
        }
        match self.flash.checksum(m.address, m.length) {
            Ok(crc32) => out.emit(Message::ChecksumResponse(ChecksumResponse {
                sequence: ctx.sequence(),
                address: m.address,
                length: m.length,
                crc32,
            })),
            Err(err) => self.fail(
                ctx,
                ErrorCode::from_flash(&err),
                diag!("checksum at {:#x}: {:?}", err.address, err.status),
                out,
            ),
        }
    }

    /// Valid in every state.
    pub(crate) fn on_status<O: Outbox>(&mut self, ctx: &mut SessionContext, out: &mut O) {
        let frames = ctx.frames();
        out.emit(Message::StatusResponse(StatusResponse {
            sequence: ctx.sequence(),
            state: ctx.state().code(),
            active_bank: self.active_bank,
            frames_accepted: frames.accepted,
            frames_rejected: frames.rejected(),
            errors: ctx.errors(),
            last_error: ctx.last_error().map(|fault| fault.code),
        }));
    }
}
