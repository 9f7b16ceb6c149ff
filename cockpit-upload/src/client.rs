// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Protocol client: request/reply matching and the host side of the
//! recovery policy.
//!
//! Every request carries a fresh sequence id. Replies with another id are
//! stale and skipped. An `ErrorReport` is acted on according to its advice:
//!
//! - `AwaitRetry`: the device retries on its own, keep waiting
//! - `ResendRequest`: send the request again, bounded
//! - `RestartTransfer`: prepare the transfer again, bounded
//! - `RestartSession`: abort, handshake and start over, bounded
//! - `Abort`: give up and report

use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use cockpit_boot::checksum::crc32;
use cockpit_boot::message::{
    Abort, ChecksumRequest, DataChunk, DeviceInfoQuery, DeviceInfoResponse, ErrorReport,
    FlashPrepare, FlashReadRequest, FlashVerify, Handshake, HandshakeResponse, HostAction,
    Payload, Response, StatusQuery, StatusResponse,
};
use cockpit_boot::{
    BankId, Capabilities, EncodeError, FrameError, Message, ResultCode, StateCode,
    MAX_CHUNK_SIZE,
};

use crate::transport::{Link, Transport, DEFAULT_TIMEOUT_MS};

/// Whole-session attempts of an upload.
pub const DEFAULT_SESSION_ATTEMPTS: u32 = 3;
/// Resends of one request after a recoverable communication fault.
const MAX_RESENDS: u32 = 3;
/// Re-prepares of one transfer after corrupted data.
const MAX_TRANSFER_RESTARTS: u32 = 2;

/// Errors seen by the host side of the protocol.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("serial I/O: {0}")]
    Io(#[from] io::Error),

    #[error("no reply from the device")]
    Timeout,

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("device reported {:?} in {:?} after {} attempt(s): {}", .0.code, .0.origin, .0.attempts, .0.diagnostic)]
    Device(Box<ErrorReport>),

    #[error("device answered {result:?} in {state:?}")]
    Refused {
        result: ResultCode,
        state: StateCode,
        value: Option<u32>,
    },

    #[error("unexpected reply with tag {tag:#04x}")]
    Unexpected { tag: u8 },

    #[error("handshake refused; device offers capabilities {0:#x}")]
    HandshakeRefused(u32),

    #[error("no session; connect first")]
    NotConnected,

    #[error("image of {len} bytes does not fit {bank:?} ({size} bytes)")]
    ImageTooLarge { bank: BankId, len: usize, size: u32 },

    #[error("empty image")]
    EmptyImage,

    #[error("device readback crc {actual:#010x} != image crc {expected:#010x}")]
    ReadbackMismatch { expected: u32, actual: u32 },
}

impl ClientError {
    /// Whether starting a fresh session may get past this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Device(report) => report.advice() != HostAction::Abort,
            Self::Refused { result, .. } => {
                matches!(result, ResultCode::InvalidState | ResultCode::SequenceError)
            }
            _ => false,
        }
    }

    fn device_advice(&self) -> Option<HostAction> {
        match self {
            Self::Device(report) => Some(report.advice()),
            _ => None,
        }
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub bank: BankId,
    pub address: u32,
    pub length: u32,
    pub crc32: u32,
    /// Bytes programmed, rounded up to the write alignment.
    pub programmed: u32,
    /// Session attempts used.
    pub attempts: u32,
}

/// Bootloader client over a framed link.
pub struct Client<L> {
    transport: Transport<L>,
    sequence: u32,
    session: Option<HandshakeResponse>,
    reply_timeout: Duration,
    session_attempts: u32,
}

impl<L: Link> Client<L> {
    pub fn new(transport: Transport<L>) -> Self {
        Self {
            transport,
            sequence: 0,
            session: None,
            reply_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            session_attempts: DEFAULT_SESSION_ATTEMPTS,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_session_attempts(mut self, attempts: u32) -> Self {
        self.session_attempts = attempts.max(1);
        self
    }

    pub fn transport(&self) -> &Transport<L> {
        &self.transport
    }

    /// Handshake offering every capability this client knows.
    pub fn connect(&mut self) -> Result<HandshakeResponse, ClientError> {
        self.session = None;
        let reply = self.request(|sequence| {
            Message::Handshake(Handshake::new(sequence, Capabilities::ALL))
        })?;
        let response = match reply {
            Message::HandshakeResponse(r) => r,
            other => return Err(unexpected(other)),
        };
        if !response.success {
            return Err(ClientError::HandshakeRefused(response.capabilities.0));
        }
        log::info!(
            "connected: {} v{}.{}, caps {:#x}, chunk {}, page {}",
            response.version,
            response.protocol_major,
            response.protocol_minor,
            response.capabilities.0,
            response.max_chunk,
            response.page_size
        );
        self.session = Some(response.clone());
        Ok(response)
    }

    /// Drop whatever the device is doing and negotiate again.
    pub fn reconnect(&mut self) -> Result<HandshakeResponse, ClientError> {
        match self.abort() {
            Ok(()) | Err(ClientError::Timeout) => {}
            Err(e) => log::debug!("abort before reconnect: {}", e),
        }
        self.transport.drain_rx();
        self.connect()
    }

    pub fn abort(&mut self) -> Result<(), ClientError> {
        let reply = self.request(|sequence| Message::Abort(Abort { sequence }))?;
        self.session = None;
        expect_ok(reply).map(|_| ())
    }

    pub fn device_info(&mut self) -> Result<DeviceInfoResponse, ClientError> {
        match self.request(|sequence| Message::DeviceInfoQuery(DeviceInfoQuery { sequence }))? {
            Message::DeviceInfoResponse(info) => Ok(info),
            other => Err(refusal_or_unexpected(other)),
        }
    }

    pub fn status(&mut self) -> Result<StatusResponse, ClientError> {
        match self.request(|sequence| Message::StatusQuery(StatusQuery { sequence }))? {
            Message::StatusResponse(status) => Ok(status),
            other => Err(refusal_or_unexpected(other)),
        }
    }

    /// Read `length` bytes of flash starting at `address`.
    pub fn read(&mut self, address: u32, length: u32) -> Result<Vec<u8>, ClientError> {
        let mut reply = self.request(|sequence| {
            Message::FlashReadRequest(FlashReadRequest {
                sequence,
                address,
                length,
            })
        })?;
        let mut data = Vec::with_capacity(length as usize);

        loop {
            let part = match reply {
                Message::FlashReadResponse(part) => part,
                other => return Err(refusal_or_unexpected(other)),
            };
            if part.address != address.wrapping_add(data.len() as u32) {
                log::warn!(
                    "readback part at {:#x}, expected {:#x}",
                    part.address,
                    address.wrapping_add(data.len() as u32)
                );
                return Err(ClientError::Unexpected {
                    tag: cockpit_boot::message::tag::FLASH_READ_RESPONSE,
                });
            }
            data.extend_from_slice(&part.payload);
            if !part.has_more {
                break;
            }
            reply = self.await_reply(self.sequence)?;
        }
        Ok(data)
    }

    pub fn checksum(&mut self, address: u32, length: u32) -> Result<u32, ClientError> {
        let reply = self.request(|sequence| {
            Message::ChecksumRequest(ChecksumRequest {
                sequence,
                address,
                length,
            })
        })?;
        match reply {
            Message::ChecksumResponse(r) => Ok(r.crc32),
            other => Err(refusal_or_unexpected(other)),
        }
    }

    /// Program `image` at the start of `bank`.
    ///
    /// `progress` is called with `(sent, total)` after every accepted chunk.
    /// Retryable failures start a fresh session, up to the session attempt
    /// bound.
    pub fn upload<F>(
        &mut self,
        bank: BankId,
        image: &[u8],
        mut progress: F,
    ) -> Result<UploadReport, ClientError>
    where
        F: FnMut(u32, u32),
    {
        if image.is_empty() {
            return Err(ClientError::EmptyImage);
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let fresh = attempt > 1 || self.session.is_none();
            let result = self
                .start_session(fresh)
                .and_then(|_| self.upload_once(bank, image, &mut progress));
            match result {
                Ok(mut report) => {
                    report.attempts = attempt;
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt < self.session_attempts => {
                    log::warn!("upload attempt {} failed: {}; restarting session", attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn start_session(&mut self, fresh: bool) -> Result<(), ClientError> {
        if fresh {
            if self.sequence == 0 {
                self.connect()?;
            } else {
                self.reconnect()?;
            }
        }
        Ok(())
    }

    fn upload_once<F>(
        &mut self,
        bank: BankId,
        image: &[u8],
        progress: &mut F,
    ) -> Result<UploadReport, ClientError>
    where
        F: FnMut(u32, u32),
    {
        let session = self.session.clone().ok_or(ClientError::NotConnected)?;
        let info = self.device_info()?;
        let region = info.region(bank);
        if image.len() as u64 > u64::from(region.size) {
            return Err(ClientError::ImageTooLarge {
                bank,
                len: image.len(),
                size: region.size,
            });
        }

        let length = image.len() as u32;
        let expected = crc32(image);
        let chunk_max = u32::from(session.max_chunk).clamp(1, MAX_CHUNK_SIZE as u32);
        let page = session.page_size.max(1);
        let check_crc = session.capabilities.contains(Capabilities::VERIFY);
        log::info!(
            "uploading {} bytes to {:?} at {:#x}, crc {:#010x}",
            length,
            bank,
            region.base,
            expected
        );

        let mut restarts = 0;
        loop {
            match self.transfer(region.base, image, chunk_max, page, check_crc, progress) {
                Ok(done) => {
                    let readback = done.value.unwrap_or_default();
                    if readback != expected {
                        return Err(ClientError::ReadbackMismatch {
                            expected,
                            actual: readback,
                        });
                    }
                    return Ok(UploadReport {
                        bank,
                        address: region.base,
                        length,
                        crc32: readback,
                        programmed: done.length.unwrap_or(length),
                        attempts: 1,
                    });
                }
                Err(e)
                    if e.device_advice() == Some(HostAction::RestartTransfer)
                        && restarts < MAX_TRANSFER_RESTARTS =>
                {
                    restarts += 1;
                    log::warn!("transfer restart {}: {}", restarts, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Prepare, stream and commit one transfer; returns the final response.
    fn transfer<F>(
        &mut self,
        address: u32,
        image: &[u8],
        chunk_max: u32,
        page: u32,
        check_crc: bool,
        progress: &mut F,
    ) -> Result<Response, ClientError>
    where
        F: FnMut(u32, u32),
    {
        let length = image.len() as u32;
        let reply = self.request(|sequence| {
            Message::FlashPrepare(FlashPrepare {
                sequence,
                address,
                length,
            })
        })?;
        expect_ok(reply)?;
        progress(0, length);

        let mut offset = 0u32;
        while offset < length {
            let room = page - offset % page;
            let n = chunk_max.min(room).min(length - offset);
            let data = &image[offset as usize..(offset + n) as usize];
            let payload = Payload::from_slice(data).map_err(|_| EncodeError::FieldTooLong {
                id: cockpit_boot::message::field::PAYLOAD,
                len: data.len(),
            })?;
            let crc = crc32(data);

            let reply = self.request(|sequence| {
                Message::DataChunk(DataChunk {
                    sequence,
                    offset,
                    payload: payload.clone(),
                    crc32: crc,
                })
            })?;
            let accepted = expect_ok(reply)?;
            offset += n;
            if accepted.value != Some(offset) {
                log::warn!("device acknowledged {:?}, expected {}", accepted.value, offset);
            }
            progress(offset, length);
        }

        let image_crc32 = check_crc.then(|| crc32(image));
        let reply = self.request(|sequence| {
            Message::FlashVerify(FlashVerify {
                sequence,
                commit: true,
                image_crc32,
            })
        })?;
        expect_ok(reply)
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence = self.sequence.wrapping_add(1);
        if self.sequence == 0 {
            self.sequence = 1;
        }
        self.sequence
    }

    /// Send a request built for a fresh sequence id and wait for its reply.
    fn request(&mut self, mut build: impl FnMut(u32) -> Message) -> Result<Message, ClientError> {
        let mut resends = 0;
        loop {
            let sequence = self.next_sequence();
            self.transport.send(&build(sequence))?;
            match self.await_reply(sequence) {
                Err(e)
                    if e.device_advice() == Some(HostAction::ResendRequest)
                        && resends < MAX_RESENDS =>
                {
                    resends += 1;
                    log::warn!("resending request {} ({})", sequence, e);
                }
                other => return other,
            }
        }
    }

    fn await_reply(&mut self, sequence: u32) -> Result<Message, ClientError> {
        loop {
            let reply = self.transport.receive(self.reply_timeout)?;
            if let Message::ErrorReport(report) = reply {
                // A body the device could not parse is reported with id 0.
                if report.sequence != sequence && report.sequence != 0 {
                    log::debug!("stale error report {:?} for {}", report.code, report.sequence);
                    continue;
                }
                if report.advice() == HostAction::AwaitRetry {
                    log::info!(
                        "device retrying after {:?} (attempt {})",
                        report.code,
                        report.attempts
                    );
                    continue;
                }
                return Err(ClientError::Device(Box::new(report)));
            }
            if reply.sequence() != sequence {
                log::debug!("stale reply tag {:#04x} for {}", reply.tag(), reply.sequence());
                continue;
            }
            return Ok(reply);
        }
    }
}

fn unexpected(message: Message) -> ClientError {
    ClientError::Unexpected { tag: message.tag() }
}

fn refusal_or_unexpected(message: Message) -> ClientError {
    match message {
        Message::Response(r) => ClientError::Refused {
            result: r.result,
            state: r.state,
            value: r.value,
        },
        other => unexpected(other),
    }
}

fn expect_ok(message: Message) -> Result<Response, ClientError> {
    match message {
        Message::Response(r) if r.result == ResultCode::Ok => Ok(r),
        other => Err(refusal_or_unexpected(other)),
    }
}
