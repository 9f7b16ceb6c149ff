// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Update session state machine.
//!
//! [`SessionMachine`] holds what outlives a connection (flash engine, clock,
//! limits, active bank). Everything that belongs to one connection lives in
//! a [`SessionContext`] owned by the caller and passed into every call, so
//! independent sessions never share state.
//!
//! Every state change goes through one transition function that acquires
//! and releases the resources of the target state, re-arms the deadline and
//! resets per-operation counters. A failure is captured as a [`Fault`] in
//! one of the error states and reported at once; the recovery policy is
//! applied on the next call into the machine.

use heapless::Vec;

use crate::checksum::{crc32, CRC32};
use crate::config::{DeviceIdentity, SessionConfig, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use crate::error::{DecodeError, LayoutError};
use crate::flash::{FlashDriver, FlashEngine};
use crate::frame::{FrameStats, MAX_FRAME_BODY};
use crate::guard::{Clock, Deadline, Resource, ResourceGuard, ResourceSet};
use crate::layout::{BankId, FlashLayout, MAX_PAGE_SIZE};
use crate::message::{
    truncated_text, Capabilities, DataChunk, ErrorReport, FlashPrepare, FlashVerify, Handshake,
    HandshakeResponse, Message, Response, ResultCode, MAX_CHUNK_SIZE,
};
use crate::recovery::{self, Recovery};
use crate::state::{Diagnostic, ErrorCode, ErrorKind, Fault, Phase, State};

/// Capabilities this device offers during the handshake.
pub const DEVICE_CAPABILITIES: Capabilities = Capabilities::ALL;

/// Smallest frame body a host may negotiate.
pub const MIN_HOST_FRAME: u16 = 256;

/// Receiver of reply messages.
pub trait Outbox {
    fn emit(&mut self, message: Message);
}

impl<const N: usize> Outbox for Vec<Message, N> {
    fn emit(&mut self, message: Message) {
        if self.push(message).is_err() {
            warn!("outbox full, reply dropped");
        }
    }
}

#[cfg(feature = "std")]
impl Outbox for alloc::vec::Vec<Message> {
    fn emit(&mut self, message: Message) {
        self.push(message);
    }
}

/// Image handed to the program loader once a bank switch completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LoadedImage {
    pub bank: BankId,
    /// Absolute start address.
    pub base: u32,
    pub length: u32,
    pub crc32: u32,
}

/// Transfer prepared by `FlashPrepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub bank: BankId,
    /// Absolute start address.
    pub address: u32,
    /// Offset of `address` inside the bank.
    pub bank_offset: u32,
    pub length: u32,
    pub received: u32,
    /// Bytes already programmed; always whole pages.
    pub committed: u32,
    /// The staged page is the last one; finish the image after it.
    finishing: bool,
    image_crc: u32,
}

/// Per-connection session state.
#[derive(Debug)]
pub struct SessionContext {
    state: State,
    resources: ResourceGuard,
    deadline: Option<Deadline>,
    attempt_counter: u8,
    comm_failures: u8,
    staging: Vec<u8, MAX_PAGE_SIZE>,
    transfer: Option<Transfer>,
    last_error: Option<Fault>,
    capabilities: Capabilities,
    max_frame: u16,
    errors: u32,
    frames: FrameStats,
    sequence: u32,
}

impl SessionContext {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            resources: ResourceGuard::new(),
            deadline: None,
            attempt_counter: 0,
            comm_failures: 0,
            staging: Vec::new(),
            transfer: None,
            last_error: None,
            capabilities: Capabilities::NONE,
            max_frame: MAX_FRAME_BODY as u16,
            errors: 0,
            frames: FrameStats::default(),
            sequence: 0,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn resources(&self) -> ResourceSet {
        self.resources.held()
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Program cycles spent on the current flash operation.
    pub fn attempt_counter(&self) -> u8 {
        self.attempt_counter
    }

    /// Communication faults seen on this connection.
    pub fn comm_failures(&self) -> u8 {
        self.comm_failures
    }

    pub fn staged(&self) -> &[u8] {
        &self.staging
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.transfer.as_ref()
    }

    /// Most recent fault, kept after recovery.
    pub fn last_error(&self) -> Option<&Fault> {
        self.last_error.as_ref()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Largest frame body the host accepts.
    pub fn max_frame(&self) -> u16 {
        self.max_frame
    }

    /// Faults raised on this connection.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn frames(&self) -> FrameStats {
        self.frames
    }

    /// Sequence id of the request being handled.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn set_frames(&mut self, frames: FrameStats) {
        self.frames = frames;
    }

    /// Held resources match the state, and transfer data only exists
    /// where the state keeps it.
    pub fn is_consistent(&self) -> bool {
        let transfer_allowed = match &self.state {
            State::ErrorCommunication(_) | State::ErrorFlashOperation(_) => true,
            state => state.phase().is_some_and(Phase::keeps_transfer),
        };
        self.resources.held() == self.state.resources()
            && self.staging.len() <= MAX_PAGE_SIZE
            && (transfer_allowed || (self.transfer.is_none() && self.staging.is_empty()))
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Session state machine driving the flash engine.
pub struct SessionMachine<F, C> {
    pub(crate) flash: FlashEngine<F>,
    pub(crate) clock: C,
    pub(crate) config: SessionConfig,
    pub(crate) identity: DeviceIdentity,
    pub(crate) active_bank: Option<BankId>,
    loaded: Option<LoadedImage>,
}

impl<F: FlashDriver, C: Clock> SessionMachine<F, C> {
    pub fn new(
        driver: F,
        clock: C,
        layout: FlashLayout,
        config: SessionConfig,
        identity: DeviceIdentity,
    ) -> Result<Self, LayoutError> {
        let config = config.sanitized();
        Ok(Self {
            flash: FlashEngine::new(driver, layout, config.busy_timeout_ms)?,
            clock,
            config,
            identity,
            active_bank: None,
            loaded: None,
        })
    }

    /// Start with `bank` as the bank holding the running image.
    pub fn with_active_bank(mut self, bank: BankId) -> Self {
        if bank.is_program_bank() {
            self.active_bank = Some(bank);
        }
        self
    }

    pub fn new_context(&self) -> SessionContext {
        SessionContext::new()
    }

    pub fn layout(&self) -> &FlashLayout {
        self.flash.layout()
    }

    pub fn flash(&self) -> &FlashEngine<F> {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut FlashEngine<F> {
        &mut self.flash
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn active_bank(&self) -> Option<BankId> {
        self.active_bank
    }

    /// Image committed by the last completed bank switch.
    pub fn loaded_image(&self) -> Option<LoadedImage> {
        self.loaded
    }

    /// Apply one decoded message.
    pub fn handle<O: Outbox>(&mut self, ctx: &mut SessionContext, message: Message, out: &mut O) {
        self.recover(ctx, out);
        ctx.sequence = message.sequence();
        trace!("session: tag {:#x} seq {} in {:?}", message.tag(), ctx.sequence, ctx.state.code());

        match message {
            Message::Handshake(m) => self.on_handshake(ctx, m, out),
            Message::FlashPrepare(m) => self.on_prepare(ctx, m, out),
            Message::DataChunk(m) => self.on_chunk(ctx, m, out),
            Message::FlashVerify(m) => self.on_verify(ctx, m, out),
            Message::DeviceInfoQuery(_) => self.on_device_info(ctx, out),
            Message::FlashReadRequest(m) => self.on_flash_read(ctx, m, out),
            Message::ChecksumRequest(m) => self.on_checksum(ctx, m, out),
            Message::StatusQuery(_) => self.on_status(ctx, out),
            Message::Abort(_) => {
                self.abort(ctx);
                self.reply(ctx, out, ResultCode::Ok, None, None);
            }
            Message::Response(_)
            | Message::HandshakeResponse(_)
            | Message::ErrorReport(_)
            | Message::DeviceInfoResponse(_)
            | Message::FlashReadResponse(_)
            | Message::ChecksumResponse(_)
            | Message::StatusResponse(_) => {
                self.reply(ctx, out, ResultCode::Unsupported, None, None);
            }
        }

        if !ctx.state.is_error() {
            ctx.deadline = self.deadline_for(&ctx.state);
        }
    }

    /// Account for a frame body that did not decode.
    pub fn reject<O: Outbox>(&mut self, ctx: &mut SessionContext, err: DecodeError, out: &mut O) {
        self.recover(ctx, out);
        match err {
            DecodeError::Malformed(reason) => {
                ctx.sequence = 0;
                self.fail(ctx, ErrorCode::MalformedMessage, diag!("{}", reason), out);
            }
            DecodeError::Unsupported { tag, sequence } => {
                debug!("session: unsupported tag {:#x}", tag);
                ctx.sequence = sequence.unwrap_or(0);
                self.reply(ctx, out, ResultCode::Unsupported, None, None);
            }
        }
    }

    /// Time-driven work: recovery of a pending fault and deadline checks.
    ///
    /// `link_idle` is false while a frame is partially received, which
    /// suspends the session deadline.
    pub fn poll<O: Outbox>(&mut self, ctx: &mut SessionContext, link_idle: bool, out: &mut O) {
        if ctx.state.is_error() {
            self.recover(ctx, out);
            return;
        }
        let Some(deadline) = ctx.deadline else {
            return;
        };
        if link_idle && deadline.is_expired(self.clock.now_ms()) {
            let state = ctx.state.code();
            let timeout = deadline.timeout_ms();
            self.fail(
                ctx,
                ErrorCode::Timeout,
                diag!("no data for {} ms in {:?}", timeout, state),
                out,
            );
        }
    }

    /// Leave a pending error state according to the recovery policy.
    pub fn recover<O: Outbox>(&mut self, ctx: &mut SessionContext, out: &mut O) {
        let Some(fault) = ctx.state.fault() else {
            return;
        };
        let recovery = recovery::decide(fault, &self.config);
        info!("session: recovering from {:?}: {:?}", fault.code, recovery);
        match recovery {
            Recovery::Retry {
                resume: Phase::Programming,
            } => {
                if self.enter_programming(ctx, out) {
                    self.run_program(ctx, out);
                }
            }
            other => self.enter(ctx, other.next().into()),
        }
    }

    /// Raise a fault and enter its error state.
    ///
    /// Ignored while an error state is pending, so the first fault of a
    /// failure is the one reported and recovered from.
    pub fn fail<O: Outbox>(
        &mut self,
        ctx: &mut SessionContext,
        code: ErrorCode,
        diagnostic: Diagnostic,
        out: &mut O,
    ) {
        let Some(origin) = ctx.state.phase() else {
            debug!("session: {:?} while a fault is pending, keeping the first", code);
            return;
        };
        let attempts = match code.kind() {
            ErrorKind::Communication => {
                ctx.comm_failures = ctx.comm_failures.saturating_add(1);
                ctx.comm_failures
            }
            ErrorKind::FlashOperation => ctx.attempt_counter,
            ErrorKind::DataCorruption | ErrorKind::ResourceExhaustion => 0,
        };
        let fault = Fault {
            code,
            origin,
            attempts,
            sequence: ctx.sequence,
            diagnostic,
        };
        error!(
            "session: {:?} in {:?} (attempt {}): {}",
            code,
            origin,
            attempts,
            fault.diagnostic.as_str()
        );

        let recovery = recovery::decide(&fault, &self.config);
        out.emit(Message::ErrorReport(ErrorReport::from_fault(&fault, recovery)));
        ctx.errors = ctx.errors.saturating_add(1);
        ctx.last_error = Some(fault.clone());
        self.enter(ctx, State::failed(fault));
    }

    /// Drop the session: release everything and return to `Idle`.
    pub fn abort(&mut self, ctx: &mut SessionContext) {
        info!("session: abort from {:?}", ctx.state.code());
        self.enter(ctx, State::Idle);
    }

    /// The single transition path.
    ///
    /// Interrupt masking follows the resource sets; the flash unlock is
    /// acquired by [`Self::enter_programming`] before it gets here.
    fn enter(&mut self, ctx: &mut SessionContext, next: State) {
        let held = ctx.resources.held();
        let wanted = next.resources();
        if wanted.difference(held).contains(Resource::InterruptMask) {
            self.flash.mask_interrupts();
        }
        self.release_hardware(held.difference(wanted));
        self.commit(ctx, next);
    }

    /// Unlock the controller and enter `Programming`.
    ///
    /// A refused unlock raises `FlashLocked` instead; a pending fault is
    /// dropped first so the new one is reported.
    fn enter_programming<O: Outbox>(&mut self, ctx: &mut SessionContext, out: &mut O) -> bool {
        if let Err(err) = self.flash.unlock() {
            if ctx.state.is_error() {
                self.enter(ctx, State::Ready);
            }
            self.fail(
                ctx,
                ErrorCode::FlashLocked,
                diag!("unlock refused: {:?}", err.status),
                out,
            );
            return false;
        }
        self.enter(ctx, State::Programming);
        true
    }

    fn release_hardware(&mut self, lost: ResourceSet) {
        if lost.contains(Resource::InterruptMask) {
            self.flash.unmask_interrupts();
        }
        if lost.contains(Resource::FlashUnlock) {
            self.flash.lock();
        }
    }

    /// Update every context field that depends on the state in one step.
    fn commit(&mut self, ctx: &mut SessionContext, next: State) {
        let from = ctx.state.code();
        let wanted = next.resources();
        for resource in ctx.resources.held().difference(wanted).iter() {
            ctx.resources.release(resource);
        }
        for resource in wanted.iter() {
            ctx.resources.acquire(resource);
        }

        let retrying = matches!(next, State::Programming | State::ErrorFlashOperation(_));
        if !retrying {
            ctx.attempt_counter = 0;
        }
        let keeps_transfer = match &next {
            State::ErrorCommunication(_) | State::ErrorFlashOperation(_) => true,
            state => state.phase().is_some_and(Phase::keeps_transfer),
        };
        if !keeps_transfer {
            ctx.transfer = None;
            ctx.staging.clear();
        }
        if next == State::Idle {
            ctx.comm_failures = 0;
            ctx.capabilities = Capabilities::NONE;
            ctx.max_frame = MAX_FRAME_BODY as u16;
        }
        ctx.deadline = self.deadline_for(&next);
        ctx.state = next;
        debug!("session: {:?} -> {:?}", from, ctx.state.code());
    }

    fn deadline_for(&self, state: &State) -> Option<Deadline> {
        let timeout = match state {
            State::Handshake => self.config.handshake_timeout_ms,
            State::Ready | State::Complete => self.config.session_timeout_ms,
            State::ReceivingData => self.config.transfer_timeout_ms,
            State::Verifying => self.config.verify_timeout_ms,
            _ => return None,
        };
        Some(Deadline::set(self.clock.now_ms(), timeout))
    }

    pub(crate) fn reply<O: Outbox>(
        &self,
        ctx: &SessionContext,
        out: &mut O,
        result: ResultCode,
        value: Option<u32>,
        length: Option<u32>,
    ) {
        out.emit(Message::Response(Response {
            sequence: ctx.sequence,
            result,
            state: ctx.state.code(),
            value,
            length,
        }));
    }

    pub(crate) fn invalid_state<O: Outbox>(&self, ctx: &SessionContext, out: &mut O) {
        debug!("session: request not valid in {:?}", ctx.state.code());
        self.reply(ctx, out, ResultCode::InvalidState, None, None);
    }

    fn on_handshake<O: Outbox>(&mut self, ctx: &mut SessionContext, m: Handshake, out: &mut O) {
        if !matches!(ctx.state, State::Idle | State::Ready | State::Complete) {
            return self.invalid_state(ctx, out);
        }

        let agreed = m.capabilities.intersection(DEVICE_CAPABILITIES);
        let success = m.protocol_major == PROTOCOL_MAJOR
            && !agreed.is_empty()
            && m.max_frame >= MIN_HOST_FRAME;

        self.enter(ctx, State::Handshake);
        if success {
            self.enter(ctx, State::Ready);
            ctx.capabilities = agreed;
            ctx.max_frame = m.max_frame.min(MAX_FRAME_BODY as u16);
            info!(
                "session: handshake v{}.{} caps {:#x}",
                m.protocol_major, m.protocol_minor, agreed.0
            );
        } else {
            warn!(
                "session: handshake refused (v{}.{}, caps {:#x}, frame {})",
                m.protocol_major, m.protocol_minor, m.capabilities.0, m.max_frame
            );
            self.enter(ctx, State::Idle);
        }

        let layout = self.flash.layout();
        out.emit(Message::HandshakeResponse(HandshakeResponse {
            sequence: ctx.sequence,
            success,
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            capabilities: if success { agreed } else { DEVICE_CAPABILITIES },
            max_chunk: MAX_CHUNK_SIZE as u16,
            page_size: layout.page_size,
            write_align: layout.write_align,
            version: truncated_text(self.identity.bootloader_version),
        }));
    }

    pub(crate) fn negotiated<O: Outbox>(
        &self,
        ctx: &SessionContext,
        capability: Capabilities,
        out: &mut O,
    ) -> bool {
        let ok = ctx.capabilities.contains(capability);
        if !ok {
            debug!("session: capability {:#x} not negotiated", capability.0);
            self.reply(ctx, out, ResultCode::Unsupported, None, None);
        }
        ok
    }

    fn on_prepare<O: Outbox>(&mut self, ctx: &mut SessionContext, m: FlashPrepare, out: &mut O) {
        if !matches!(ctx.state, State::Ready | State::Complete) {
            return self.invalid_state(ctx, out);
        }
        if !self.negotiated(ctx, Capabilities::FLASH_PROGRAM, out) {
            return;
        }
        if m.length == 0 {
            return self.fail(ctx, ErrorCode::InvalidLength, diag!("empty transfer"), out);
        }

        let layout = *self.flash.layout();
        let Some(bank) = layout.locate(m.address, m.length) else {
            return self.fail(
                ctx,
                ErrorCode::InvalidRegion,
                diag!("{:#x}+{} outside every region", m.address, m.length),
                out,
            );
        };
        if bank.is_program_bank() && !self.negotiated(ctx, Capabilities::DUAL_BANK, out) {
            return;
        }
        if Some(bank) == self.active_bank {
            return self.fail(
                ctx,
                ErrorCode::ActiveBankProtected,
                diag!("bank {:?} holds the running image", bank),
                out,
            );
        }
        let bank_offset = m.address - layout.region(bank).base;
        if let Err(err) = self.flash.check(bank, bank_offset, m.length) {
            return self.fail(
                ctx,
                ErrorCode::from_flash(&err),
                diag!("{:#x}+{}: {:?}", m.address, m.length, err.status),
                out,
            );
        }

        self.enter(ctx, State::ReceivingData);
        ctx.transfer = Some(Transfer {
            bank,
            address: m.address,
            bank_offset,
            length: m.length,
            received: 0,
            committed: 0,
            finishing: false,
            image_crc: 0,
        });
        info!(
            "session: receiving {} bytes for {:?} at {:#x}",
            m.length, bank, m.address
        );
        self.reply(ctx, out, ResultCode::Ok, Some(m.address), Some(m.length));
    }

    fn on_chunk<O: Outbox>(&mut self, ctx: &mut SessionContext, m: DataChunk, out: &mut O) {
        let Some(mut transfer) = ctx.transfer.filter(|_| ctx.state == State::ReceivingData) else {
            return self.invalid_state(ctx, out);
        };
        if m.offset != transfer.received {
            debug!(
                "session: chunk offset {} but {} received",
                m.offset, transfer.received
            );
            return self.reply(ctx, out, ResultCode::SequenceError, Some(transfer.received), None);
        }

        let len = m.payload.len() as u32;
        if len == 0 {
            return self.reply(ctx, out, ResultCode::InvalidArgument, Some(transfer.received), None);
        }
        if transfer.received + len > transfer.length {
            return self.fail(
                ctx,
                ErrorCode::TransferOverflow,
                diag!(
                    "chunk ends at {} past {}",
                    transfer.received + len,
                    transfer.length
                ),
                out,
            );
        }
        let page = self.flash.layout().page_size as usize;
        if ctx.staging.len() + m.payload.len() > page {
            debug!("session: chunk at {} straddles a page boundary", m.offset);
            return self.reply(ctx, out, ResultCode::InvalidArgument, Some(transfer.received), None);
        }
        let actual = crc32(&m.payload);
        if actual != m.crc32 {
            return self.fail(
                ctx,
                ErrorCode::ChunkCrcMismatch,
                diag!("chunk {} crc {:#x} != {:#x}", m.offset, actual, m.crc32),
                out,
            );
        }
        if ctx.staging.extend_from_slice(&m.payload).is_err() {
            return self.fail(
                ctx,
                ErrorCode::StagingOverflow,
                diag!("staging full at {}", ctx.staging.len()),
                out,
            );
        }

        transfer.received += len;
        ctx.transfer = Some(transfer);
        trace!("session: {}/{} bytes", transfer.received, transfer.length);

        if transfer.received == transfer.length {
            self.enter(ctx, State::Verifying);
            self.reply(ctx, out, ResultCode::Ok, Some(transfer.received), None);
        } else if ctx.staging.len() == page {
            if self.enter_programming(ctx, out) {
                self.run_program(ctx, out);
            }
        } else {
            self.reply(ctx, out, ResultCode::Ok, Some(transfer.received), None);
        }
    }

    fn on_verify<O: Outbox>(&mut self, ctx: &mut SessionContext, m: FlashVerify, out: &mut O) {
        let Some(mut transfer) = ctx.transfer.filter(|_| ctx.state == State::Verifying) else {
            return self.invalid_state(ctx, out);
        };
        if m.image_crc32.is_some() && !self.negotiated(ctx, Capabilities::VERIFY, out) {
            return;
        }

        let mut digest = CRC32.digest();
        if let Err(err) =
            self.flash
                .digest_range(transfer.address, transfer.committed, &mut digest)
        {
            return self.fail(
                ctx,
                ErrorCode::from_flash(&err),
                diag!("reading committed pages: {:?}", err.status),
                out,
            );
        }
        digest.update(&ctx.staging);
        let image_crc = digest.finalize();

        if let Some(expected) = m.image_crc32 {
            if expected != image_crc {
                return self.fail(
                    ctx,
                    ErrorCode::ImageCrcMismatch,
                    diag!("image crc {:#x} != {:#x}", image_crc, expected),
                    out,
                );
            }
        }
        if !m.commit {
            return self.reply(ctx, out, ResultCode::Ok, Some(image_crc), Some(transfer.length));
        }

        transfer.finishing = true;
        transfer.image_crc = image_crc;
        ctx.transfer = Some(transfer);
        if self.enter_programming(ctx, out) {
            self.run_program(ctx, out);
        }
    }

    /// Program the staged page. Runs in `Programming`.
    fn run_program<O: Outbox>(&mut self, ctx: &mut SessionContext, out: &mut O) {
        let Some(mut transfer) = ctx.transfer else {
            return self.fail(ctx, ErrorCode::InvalidLength, diag!("no transfer"), out);
        };
        let offset = transfer.bank_offset + transfer.committed;
        let result = self.flash.program_with_budget(
            &self.clock,
            transfer.bank,
            offset,
            &ctx.staging,
            &mut ctx.attempt_counter,
            self.config.max_flash_attempts,
        );
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                return self.fail(
                    ctx,
                    ErrorCode::from_flash(&err),
                    diag!("{:?} at {:#x}: {:?}", err.step, err.address, err.status),
                    out,
                );
            }
        };

        debug!(
            "session: page {:#x} programmed on attempt {}",
            report.address, report.attempts
        );
        transfer.committed += report.written;
        ctx.staging.clear();
        ctx.transfer = Some(transfer);

        if transfer.finishing {
            self.finish(ctx, transfer, out);
        } else {
            self.enter(ctx, State::ReceivingData);
            self.reply(ctx, out, ResultCode::Ok, Some(transfer.received), None);
        }
    }

    fn finish<O: Outbox>(&mut self, ctx: &mut SessionContext, transfer: Transfer, out: &mut O) {
        let readback = match self.flash.checksum(transfer.address, transfer.length) {
            Ok(crc) => crc,
            Err(err) => {
                return self.fail(
                    ctx,
                    ErrorCode::from_flash(&err),
                    diag!("image readback: {:?}", err.status),
                    out,
                );
            }
        };
        if readback != transfer.image_crc {
            return self.fail(
                ctx,
                ErrorCode::ImageCrcMismatch,
                diag!("readback crc {:#x} != {:#x}", readback, transfer.image_crc),
                out,
            );
        }

        if transfer.bank.is_program_bank() {
            self.enter(ctx, State::BankSwitch);
            self.active_bank = Some(transfer.bank);
            self.loaded = Some(LoadedImage {
                bank: transfer.bank,
                base: transfer.address,
                length: transfer.length,
                crc32: readback,
            });
            info!(
                "session: bank {:?} active, {} bytes crc {:#x}",
                transfer.bank, transfer.length, readback
            );
        }
        self.enter(ctx, State::Complete);

        let programmed = self.flash.layout().align_up(transfer.length);
        self.reply(ctx, out, ResultCode::Ok, Some(readback), Some(programmed));
    }
}
