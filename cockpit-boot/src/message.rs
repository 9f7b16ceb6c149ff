// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Protocol messages and their tagged TLV encoding.
//!
//! A body is one tag byte followed by TLV fields (see [`crate::tlv`]).
//! Field ids are global across messages, unknown ids are skipped, and the
//! last occurrence of a repeated id wins. Field [`field::SEQUENCE`] is
//! present in every message and echoed by every reply.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::config::{PROTOCOL_MAJOR, PROTOCOL_MINOR};
use crate::error::{DecodeError, EncodeError, Malformation};
use crate::frame::MAX_FRAME_BODY;
use crate::layout::{BankId, Region};
use crate::recovery::Recovery;
use crate::state::{Diagnostic, ErrorCode, ErrorKind, Fault, Phase, StateCode};
use crate::tlv::{Field, TlvReader, TlvWriter};

/// Largest `DataChunk` / `FlashReadResponse` payload.
pub const MAX_CHUNK_SIZE: usize = 256;
/// Longest model or version string.
pub const MAX_TEXT_LEN: usize = 32;
/// Longest unique device id.
pub const MAX_DEVICE_ID_LEN: usize = 16;
/// Bytes of a `FlashReadResponse` body besides its payload.
pub const READ_RESPONSE_OVERHEAD: usize = 20;

pub type Payload = Vec<u8, MAX_CHUNK_SIZE>;
pub type Text = String<MAX_TEXT_LEN>;

/// Message tags.
pub mod tag {
    pub const HANDSHAKE: u8 = 0x01;
    pub const FLASH_PREPARE: u8 = 0x02;
    pub const DATA_CHUNK: u8 = 0x03;
    pub const FLASH_VERIFY: u8 = 0x04;
    pub const DEVICE_INFO_QUERY: u8 = 0x05;
    pub const FLASH_READ_REQUEST: u8 = 0x06;
    pub const CHECKSUM_REQUEST: u8 = 0x07;
    pub const STATUS_QUERY: u8 = 0x08;
    pub const ABORT: u8 = 0x09;

    pub const RESPONSE: u8 = 0x80;
    pub const HANDSHAKE_RESPONSE: u8 = 0x81;
    pub const ERROR_REPORT: u8 = 0x82;
    pub const DEVICE_INFO_RESPONSE: u8 = 0x83;
    pub const FLASH_READ_RESPONSE: u8 = 0x84;
    pub const CHECKSUM_RESPONSE: u8 = 0x85;
    pub const STATUS_RESPONSE: u8 = 0x86;
}

/// Field ids.
pub mod field {
    pub const SEQUENCE: u8 = 0x01;
    pub const ADDRESS: u8 = 0x02;
    pub const LENGTH: u8 = 0x03;
    pub const OFFSET: u8 = 0x04;
    pub const PAYLOAD: u8 = 0x05;
    pub const CRC32: u8 = 0x06;
    pub const COMMIT: u8 = 0x07;
    pub const SUCCESS: u8 = 0x08;
    pub const RESULT: u8 = 0x09;
    pub const STATE: u8 = 0x0A;
    pub const VALUE: u8 = 0x0B;
    pub const HAS_MORE: u8 = 0x0C;
    pub const PROTOCOL: u8 = 0x0D;
    pub const CAPABILITIES: u8 = 0x0E;
    pub const MAX_FRAME: u8 = 0x0F;
    pub const MAX_CHUNK: u8 = 0x10;
    pub const PAGE_SIZE: u8 = 0x11;
    pub const WRITE_ALIGN: u8 = 0x12;
    pub const VERSION: u8 = 0x13;
    pub const MODEL: u8 = 0x14;
    pub const DEVICE_ID: u8 = 0x15;
    pub const FLASH_BASE: u8 = 0x16;
    pub const FLASH_SIZE: u8 = 0x17;
    pub const BANK_A: u8 = 0x18;
    pub const BANK_B: u8 = 0x19;
    pub const SCRATCH: u8 = 0x1A;
    pub const ACTIVE_BANK: u8 = 0x1B;
    pub const ERROR_KIND: u8 = 0x1C;
    pub const ERROR_CODE: u8 = 0x1D;
    pub const ORIGIN: u8 = 0x1E;
    pub const ATTEMPTS: u8 = 0x1F;
    pub const RECOVERABLE: u8 = 0x20;
    pub const NEXT_STATE: u8 = 0x21;
    pub const DIAGNOSTIC: u8 = 0x22;
    pub const FRAMES_ACCEPTED: u8 = 0x23;
    pub const FRAMES_REJECTED: u8 = 0x24;
    pub const ERRORS: u8 = 0x25;
    pub const LAST_ERROR: u8 = 0x26;

    /// Ids at or above this value are unknown to this implementation.
    pub const KNOWN_LIMIT: usize = 0x27;
}

/// Capability bit set exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const FLASH_PROGRAM: Self = Self(1 << 0);
    pub const VERIFY: Self = Self(1 << 1);
    pub const DUAL_BANK: Self = Self(1 << 2);
    pub const READBACK: Self = Self(1 << 3);
    pub const CHECKSUM: Self = Self(1 << 4);
    pub const ALL: Self = Self(0x1F);

    pub fn contains(&self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersection(&self, other: Capabilities) -> Capabilities {
        Self(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Outcome carried by [`Response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    /// Well-formed request not valid in the current state; nothing changed.
    InvalidState = 1,
    /// Unknown tag, reply-type message, or capability not negotiated.
    Unsupported = 2,
    InvalidArgument = 3,
    /// Chunk offset does not continue the transfer.
    SequenceError = 4,
}

impl ResultCode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::InvalidState,
            2 => Self::Unsupported,
            3 => Self::InvalidArgument,
            4 => Self::SequenceError,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub sequence: u32,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub capabilities: Capabilities,
    /// Largest frame body the host accepts.
    pub max_frame: u16,
}

impl Handshake {
    /// Handshake for this protocol version.
    pub fn new(sequence: u32, capabilities: Capabilities) -> Self {
        Self {
            sequence,
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            capabilities,
            max_frame: MAX_FRAME_BODY as u16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub sequence: u32,
    pub success: bool,
    pub protocol_major: u8,
    pub protocol_minor: u8,
    /// Agreed set on success, the device's full set otherwise.
    pub capabilities: Capabilities,
    pub max_chunk: u16,
    pub page_size: u32,
    pub write_align: u32,
    pub version: Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashPrepare {
    pub sequence: u32,
    pub address: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    pub sequence: u32,
    /// Offset from the start of the prepared transfer.
    pub offset: u32,
    pub payload: Payload,
    /// CRC-32 of `payload`.
    pub crc32: u32,
}

impl DataChunk {
    /// Chunk with its CRC computed; `None` if `data` exceeds [`MAX_CHUNK_SIZE`].
    pub fn new(sequence: u32, offset: u32, data: &[u8]) -> Option<Self> {
        Some(Self {
            sequence,
            offset,
            payload: Vec::from_slice(data).ok()?,
            crc32: crate::checksum::crc32(data),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashVerify {
    pub sequence: u32,
    /// Program after verification; `false` only checks.
    pub commit: bool,
    /// Expected CRC-32 of the whole image.
    pub image_crc32: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub sequence: u32,
    pub result: ResultCode,
    /// Device state after handling the request.
    pub state: StateCode,
    pub value: Option<u32>,
    pub length: Option<u32>,
}

/// What the host should do after an [`ErrorReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostAction {
    /// The device resumed listening; send the request again.
    ResendRequest,
    /// The device retries on its own; wait for the final reply.
    AwaitRetry,
    /// The transfer was dropped; start again from `FlashPrepare`.
    RestartTransfer,
    /// The session was dropped; start again from `Handshake`.
    RestartSession,
    /// Not recoverable by retrying; report to a human.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub sequence: u32,
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub origin: Phase,
    pub attempts: u8,
    /// The device retries or resumes on its own.
    pub recoverable: bool,
    /// Phase the device is heading to.
    pub next: Phase,
    pub diagnostic: Diagnostic,
}

impl ErrorReport {
    pub fn from_fault(fault: &Fault, recovery: Recovery) -> Self {
        Self {
            sequence: fault.sequence,
            kind: fault.kind(),
            code: fault.code,
            origin: fault.origin,
            attempts: fault.attempts,
            recoverable: recovery.is_retry(),
            next: recovery.next(),
            diagnostic: fault.diagnostic.clone(),
        }
    }

    pub fn advice(&self) -> HostAction {
        match (self.kind, self.recoverable) {
            (ErrorKind::Communication, true) => HostAction::ResendRequest,
            (ErrorKind::Communication, false) | (ErrorKind::ResourceExhaustion, _) => {
                HostAction::RestartSession
            }
            (ErrorKind::FlashOperation, true) => HostAction::AwaitRetry,
            (ErrorKind::FlashOperation, false) => HostAction::Abort,
            (ErrorKind::DataCorruption, _) => HostAction::RestartTransfer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoQuery {
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoResponse {
    pub sequence: u32,
    pub model: Text,
    pub device_id: Vec<u8, MAX_DEVICE_ID_LEN>,
    pub version: Text,
    pub flash_base: u32,
    pub flash_size: u32,
    pub page_size: u32,
    pub write_align: u32,
    pub bank_a: Region,
    pub bank_b: Region,
    pub scratch: Region,
    /// Bank holding the committed image, if any.
    pub active_bank: Option<BankId>,
}

impl DeviceInfoResponse {
    pub fn region(&self, bank: BankId) -> Region {
        match bank {
            BankId::A => self.bank_a,
            BankId::B => self.bank_b,
            BankId::Scratch => self.scratch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashReadRequest {
    pub sequence: u32,
    pub address: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashReadResponse {
    pub sequence: u32,
    pub address: u32,
    pub payload: Payload,
    /// More responses follow for the same request.
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumRequest {
    pub sequence: u32,
    pub address: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumResponse {
    pub sequence: u32,
    pub address: u32,
    pub length: u32,
    pub crc32: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQuery {
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub sequence: u32,
    pub state: StateCode,
    pub active_bank: Option<BankId>,
    pub frames_accepted: u32,
    pub frames_rejected: u32,
    pub errors: u32,
    pub last_error: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abort {
    pub sequence: u32,
}

/// Every message of the protocol, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Handshake(Handshake),
    FlashPrepare(FlashPrepare),
    DataChunk(DataChunk),
    FlashVerify(FlashVerify),
    DeviceInfoQuery(DeviceInfoQuery),
    FlashReadRequest(FlashReadRequest),
    ChecksumRequest(ChecksumRequest),
    StatusQuery(StatusQuery),
    Abort(Abort),

    Response(Response),
    HandshakeResponse(HandshakeResponse),
    ErrorReport(ErrorReport),
    DeviceInfoResponse(DeviceInfoResponse),
    FlashReadResponse(FlashReadResponse),
    ChecksumResponse(ChecksumResponse),
    StatusResponse(StatusResponse),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Handshake(_) => tag::HANDSHAKE,
            Self::FlashPrepare(_) => tag::FLASH_PREPARE,
            Self::DataChunk(_) => tag::DATA_CHUNK,
            Self::FlashVerify(_) => tag::FLASH_VERIFY,
            Self::DeviceInfoQuery(_) => tag::DEVICE_INFO_QUERY,
            Self::FlashReadRequest(_) => tag::FLASH_READ_REQUEST,
            Self::ChecksumRequest(_) => tag::CHECKSUM_REQUEST,
            Self::StatusQuery(_) => tag::STATUS_QUERY,
            Self::Abort(_) => tag::ABORT,
            Self::Response(_) => tag::RESPONSE,
            Self::HandshakeResponse(_) => tag::HANDSHAKE_RESPONSE,
            Self::ErrorReport(_) => tag::ERROR_REPORT,
            Self::DeviceInfoResponse(_) => tag::DEVICE_INFO_RESPONSE,
            Self::FlashReadResponse(_) => tag::FLASH_READ_RESPONSE,
            Self::ChecksumResponse(_) => tag::CHECKSUM_RESPONSE,
            Self::StatusResponse(_) => tag::STATUS_RESPONSE,
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Self::Handshake(m) => m.sequence,
            Self::FlashPrepare(m) => m.sequence,
            Self::DataChunk(m) => m.sequence,
            Self::FlashVerify(m) => m.sequence,
            Self::DeviceInfoQuery(m) => m.sequence,
            Self::FlashReadRequest(m) => m.sequence,
            Self::ChecksumRequest(m) => m.sequence,
            Self::StatusQuery(m) => m.sequence,
            Self::Abort(m) => m.sequence,
            Self::Response(m) => m.sequence,
            Self::HandshakeResponse(m) => m.sequence,
            Self::ErrorReport(m) => m.sequence,
            Self::DeviceInfoResponse(m) => m.sequence,
            Self::FlashReadResponse(m) => m.sequence,
            Self::ChecksumResponse(m) => m.sequence,
            Self::StatusResponse(m) => m.sequence,
        }
    }

    /// Host-to-device messages have tags below 0x80.
    pub fn is_request(&self) -> bool {
        self.tag() < tag::RESPONSE
    }

    /// Encode into `out`; returns the body length.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        let mut w = TlvWriter::new(out);
        w.tag(self.tag())?;
        w.u32(field::SEQUENCE, self.sequence())?;

        match self {
            Self::Handshake(m) => {
                w.u16(field::PROTOCOL, protocol_word(m.protocol_major, m.protocol_minor))?;
                w.u32(field::CAPABILITIES, m.capabilities.0)?;
                w.u16(field::MAX_FRAME, m.max_frame)?;
            }
            Self::FlashPrepare(m) => {
                w.u32(field::ADDRESS, m.address)?;
                w.u32(field::LENGTH, m.length)?;
            }
            Self::DataChunk(m) => {
                w.u32(field::OFFSET, m.offset)?;
                w.bytes(field::PAYLOAD, &m.payload)?;
                w.u32(field::CRC32, m.crc32)?;
            }
            Self::FlashVerify(m) => {
                w.bool(field::COMMIT, m.commit)?;
                w.opt_u32(field::CRC32, m.image_crc32)?;
            }
            Self::DeviceInfoQuery(_) | Self::StatusQuery(_) | Self::Abort(_) => {}
            Self::FlashReadRequest(FlashReadRequest {
                address, length, ..
            })
            | Self::ChecksumRequest(ChecksumRequest {
                address, length, ..
            }) => {
                w.u32(field::ADDRESS, *address)?;
                w.u32(field::LENGTH, *length)?;
            }
            Self::Response(m) => {
                w.u8(field::RESULT, m.result as u8)?;
                w.u8(field::STATE, m.state.code())?;
                w.opt_u32(field::VALUE, m.value)?;
                w.opt_u32(field::LENGTH, m.length)?;
            }
            Self::HandshakeResponse(m) => {
                w.bool(field::SUCCESS, m.success)?;
                w.u16(field::PROTOCOL, protocol_word(m.protocol_major, m.protocol_minor))?;
                w.u32(field::CAPABILITIES, m.capabilities.0)?;
                w.u16(field::MAX_CHUNK, m.max_chunk)?;
                w.u32(field::PAGE_SIZE, m.page_size)?;
                w.u32(field::WRITE_ALIGN, m.write_align)?;
                w.str(field::VERSION, &m.version)?;
            }
            Self::ErrorReport(m) => {
                w.u8(field::ERROR_KIND, m.kind as u8)?;
                w.u8(field::ERROR_CODE, m.code.code())?;
                w.u8(field::ORIGIN, m.origin.code())?;
                w.u8(field::ATTEMPTS, m.attempts)?;
                w.bool(field::RECOVERABLE, m.recoverable)?;
                w.u8(field::NEXT_STATE, m.next.code())?;
                w.str(field::DIAGNOSTIC, &m.diagnostic)?;
            }
            Self::DeviceInfoResponse(m) => {
                w.str(field::MODEL, &m.model)?;
                w.bytes(field::DEVICE_ID, &m.device_id)?;
                w.str(field::VERSION, &m.version)?;
                w.u32(field::FLASH_BASE, m.flash_base)?;
                w.u32(field::FLASH_SIZE, m.flash_size)?;
                w.u32(field::PAGE_SIZE, m.page_size)?;
                w.u32(field::WRITE_ALIGN, m.write_align)?;
                w.bytes(field::BANK_A, &region_bytes(m.bank_a))?;
                w.bytes(field::BANK_B, &region_bytes(m.bank_b))?;
                w.bytes(field::SCRATCH, &region_bytes(m.scratch))?;
                if let Some(bank) = m.active_bank {
                    w.u8(field::ACTIVE_BANK, bank.code())?;
                }
            }
            Self::FlashReadResponse(m) => {
                w.u32(field::ADDRESS, m.address)?;
                w.bytes(field::PAYLOAD, &m.payload)?;
                w.bool(field::HAS_MORE, m.has_more)?;
            }
            Self::ChecksumResponse(m) => {
                w.u32(field::ADDRESS, m.address)?;
                w.u32(field::LENGTH, m.length)?;
                w.u32(field::CRC32, m.crc32)?;
            }
            Self::StatusResponse(m) => {
                w.u8(field::STATE, m.state.code())?;
                if let Some(bank) = m.active_bank {
                    w.u8(field::ACTIVE_BANK, bank.code())?;
                }
                w.u32(field::FRAMES_ACCEPTED, m.frames_accepted)?;
                w.u32(field::FRAMES_REJECTED, m.frames_rejected)?;
                w.u32(field::ERRORS, m.errors)?;
                if let Some(code) = m.last_error {
                    w.u8(field::LAST_ERROR, code.code())?;
                }
            }
        }
        Ok(w.finish())
    }

    /// Encode into a body buffer sized for one frame.
    pub fn encode(&self) -> Result<Vec<u8, MAX_FRAME_BODY>, EncodeError> {
        let mut buf = [0u8; MAX_FRAME_BODY];
        let len = self.encode_into(&mut buf)?;
        Vec::from_slice(&buf[..len]).map_err(|_| EncodeError::BufferFull {
            capacity: MAX_FRAME_BODY,
        })
    }

    /// Encode into a Vec (for std).
    #[cfg(feature = "std")]
    pub fn encode_vec(&self) -> Result<alloc::vec::Vec<u8>, EncodeError> {
        Ok(self.encode()?.to_vec())
    }

    /// Decode a frame body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let (&code, rest) = body.split_first().ok_or(Malformation::Empty)?;
        let f = Fields::parse(rest)?;

        let sequence = match f.field(field::SEQUENCE) {
            Some(seq) => seq.as_u32()?,
            None if is_known_tag(code) => return Err(Malformation::MissingField { id: field::SEQUENCE }.into()),
            None => 0,
        };

        let message = match code {
            tag::HANDSHAKE => {
                let (protocol_major, protocol_minor) = split_protocol(f.u16(field::PROTOCOL)?);
                Self::Handshake(Handshake {
                    sequence,
                    protocol_major,
                    protocol_minor,
                    capabilities: Capabilities(f.u32(field::CAPABILITIES)?),
                    max_frame: f.u16(field::MAX_FRAME)?,
                })
            }
            tag::FLASH_PREPARE => Self::FlashPrepare(FlashPrepare {
                sequence,
                address: f.u32(field::ADDRESS)?,
                length: f.u32(field::LENGTH)?,
            }),
            tag::DATA_CHUNK => Self::DataChunk(DataChunk {
                sequence,
                offset: f.u32(field::OFFSET)?,
                payload: f.bytes(field::PAYLOAD)?,
                crc32: f.u32(field::CRC32)?,
            }),
            tag::FLASH_VERIFY => Self::FlashVerify(FlashVerify {
                sequence,
                commit: f.bool(field::COMMIT)?,
                image_crc32: f.opt_u32(field::CRC32)?,
            }),
            tag::DEVICE_INFO_QUERY => Self::DeviceInfoQuery(DeviceInfoQuery { sequence }),
            tag::FLASH_READ_REQUEST => Self::FlashReadRequest(FlashReadRequest {
                sequence,
                address: f.u32(field::ADDRESS)?,
                length: f.u32(field::LENGTH)?,
            }),
            tag::CHECKSUM_REQUEST => Self::ChecksumRequest(ChecksumRequest {
                sequence,
                address: f.u32(field::ADDRESS)?,
                length: f.u32(field::LENGTH)?,
            }),
            tag::STATUS_QUERY => Self::StatusQuery(StatusQuery { sequence }),
            tag::ABORT => Self::Abort(Abort { sequence }),
            tag::RESPONSE => Self::Response(Response {
                sequence,
                result: f.code(field::RESULT, ResultCode::from_code)?,
                state: f.code(field::STATE, StateCode::from_code)?,
                value: f.opt_u32(field::VALUE)?,
                length: f.opt_u32(field::LENGTH)?,
            }),
            tag::HANDSHAKE_RESPONSE => {
                let (protocol_major, protocol_minor) = split_protocol(f.u16(field::PROTOCOL)?);
                Self::HandshakeResponse(HandshakeResponse {
                    sequence,
                    success: f.bool(field::SUCCESS)?,
                    protocol_major,
                    protocol_minor,
                    capabilities: Capabilities(f.u32(field::CAPABILITIES)?),
                    max_chunk: f.u16(field::MAX_CHUNK)?,
                    page_size: f.u32(field::PAGE_SIZE)?,
                    write_align: f.u32(field::WRITE_ALIGN)?,
                    version: f.text(field::VERSION)?,
                })
            }
            tag::ERROR_REPORT => {
                let kind = f.code(field::ERROR_KIND, ErrorKind::from_code)?;
                let code = f.code(field::ERROR_CODE, ErrorCode::from_code)?;
                if code.kind() != kind {
                    return Err(Malformation::BadValue {
                        id: field::ERROR_KIND,
                    }
                    .into());
                }
                Self::ErrorReport(ErrorReport {
                    sequence,
                    kind,
                    code,
                    origin: f.code(field::ORIGIN, Phase::from_code)?,
                    attempts: f.u8(field::ATTEMPTS)?,
                    recoverable: f.bool(field::RECOVERABLE)?,
                    next: f.code(field::NEXT_STATE, Phase::from_code)?,
                    diagnostic: f.text(field::DIAGNOSTIC)?,
                })
            }
            tag::DEVICE_INFO_RESPONSE => Self::DeviceInfoResponse(DeviceInfoResponse {
                sequence,
                model: f.text(field::MODEL)?,
                device_id: f.bytes(field::DEVICE_ID)?,
                version: f.text(field::VERSION)?,
                flash_base: f.u32(field::FLASH_BASE)?,
                flash_size: f.u32(field::FLASH_SIZE)?,
                page_size: f.u32(field::PAGE_SIZE)?,
                write_align: f.u32(field::WRITE_ALIGN)?,
                bank_a: f.region(field::BANK_A)?,
                bank_b: f.region(field::BANK_B)?,
                scratch: f.region(field::SCRATCH)?,
                active_bank: f.opt_code(field::ACTIVE_BANK, BankId::from_code)?,
            }),
            tag::FLASH_READ_RESPONSE => Self::FlashReadResponse(FlashReadResponse {
                sequence,
                address: f.u32(field::ADDRESS)?,
                payload: f.bytes(field::PAYLOAD)?,
                has_more: f.bool(field::HAS_MORE)?,
            }),
            tag::CHECKSUM_RESPONSE => Self::ChecksumResponse(ChecksumResponse {
                sequence,
                address: f.u32(field::ADDRESS)?,
                length: f.u32(field::LENGTH)?,
                crc32: f.u32(field::CRC32)?,
            }),
            tag::STATUS_RESPONSE => Self::StatusResponse(StatusResponse {
                sequence,
                state: f.code(field::STATE, StateCode::from_code)?,
                active_bank: f.opt_code(field::ACTIVE_BANK, BankId::from_code)?,
                frames_accepted: f.u32(field::FRAMES_ACCEPTED)?,
                frames_rejected: f.u32(field::FRAMES_REJECTED)?,
                errors: f.u32(field::ERRORS)?,
                last_error: f.opt_code(field::LAST_ERROR, ErrorCode::from_code)?,
            }),
            other => {
                return Err(DecodeError::Unsupported {
                    tag: other,
                    sequence: f.field(field::SEQUENCE).and_then(|s| s.as_u32().ok()),
                })
            }
        };
        Ok(message)
    }
}

/// Copy `s` into a [`Text`], truncated at a character boundary.
pub fn truncated_text(s: &str) -> Text {
    let mut out = Text::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

fn is_known_tag(t: u8) -> bool {
    matches!(t, tag::HANDSHAKE..=tag::ABORT | tag::RESPONSE..=tag::STATUS_RESPONSE)
}

fn protocol_word(major: u8, minor: u8) -> u16 {
    u16::from_be_bytes([major, minor])
}

fn split_protocol(word: u16) -> (u8, u8) {
    let [major, minor] = word.to_be_bytes();
    (major, minor)
}

fn region_bytes(region: Region) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&region.base.to_be_bytes());
    out[4..].copy_from_slice(&region.size.to_be_bytes());
    out
}

/// Known fields of one body, indexed by id.
struct Fields<'a> {
    slots: [Option<&'a [u8]>; field::KNOWN_LIMIT],
}

impl<'a> Fields<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, Malformation> {
        let mut slots = [None; field::KNOWN_LIMIT];
        for entry in TlvReader::new(data) {
            let entry = entry?;
            if let Some(slot) = slots.get_mut(entry.id as usize) {
                *slot = Some(entry.value);
            }
        }
        Ok(Self { slots })
    }

    fn field(&self, id: u8) -> Option<Field<'a>> {
        self.slots
            .get(id as usize)
            .copied()
            .flatten()
            .map(|value| Field { id, value })
    }

    fn required(&self, id: u8) -> Result<Field<'a>, Malformation> {
        self.field(id).ok_or(Malformation::MissingField { id })
    }

    fn u8(&self, id: u8) -> Result<u8, Malformation> {
        self.required(id)?.as_u8()
    }

    fn u16(&self, id: u8) -> Result<u16, Malformation> {
        self.required(id)?.as_u16()
    }

    fn u32(&self, id: u8) -> Result<u32, Malformation> {
        self.required(id)?.as_u32()
    }

    fn bool(&self, id: u8) -> Result<bool, Malformation> {
        self.required(id)?.as_bool()
    }

    fn opt_u32(&self, id: u8) -> Result<Option<u32>, Malformation> {
        self.field(id).map(|f| f.as_u32()).transpose()
    }

    fn code<T>(&self, id: u8, parse: fn(u8) -> Option<T>) -> Result<T, Malformation> {
        parse(self.u8(id)?).ok_or(Malformation::BadValue { id })
    }

    fn opt_code<T>(&self, id: u8, parse: fn(u8) -> Option<T>) -> Result<Option<T>, Malformation> {
        match self.field(id) {
            Some(_) => self.code(id, parse).map(Some),
            None => Ok(None),
        }
    }

    fn bytes<const N: usize>(&self, id: u8) -> Result<Vec<u8, N>, Malformation> {
        let value = self.required(id)?.value;
        Vec::from_slice(value).map_err(|_| Malformation::TooLong {
            id,
            len: value.len(),
            max: N,
        })
    }

    fn text<const N: usize>(&self, id: u8) -> Result<String<N>, Malformation> {
        let text = self.required(id)?.as_str()?;
        String::try_from(text).map_err(|_| Malformation::TooLong {
            id,
            len: text.len(),
            max: N,
        })
    }

    fn region(&self, id: u8) -> Result<Region, Malformation> {
        let raw = self.required(id)?.value;
        if raw.len() != 8 {
            return Err(Malformation::BadWidth {
                id,
                len: raw.len(),
                expected: 8,
            });
        }
        Ok(Region::new(
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
            u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_wire_bytes() {
        let msg = Message::FlashPrepare(FlashPrepare {
            sequence: 1,
            address: 0x0801_F800,
            length: 256,
        });
        let body = msg.encode().unwrap();
        assert_eq!(
            &body[..],
            &[
                0x02, 0x01, 4, 0, 0, 0, 1, 0x02, 4, 0x08, 0x01, 0xF8, 0x00, 0x03, 4, 0, 0, 1, 0
            ]
        );
    }

    #[test]
    fn test_missing_sequence_is_malformed() {
        assert_eq!(
            Message::decode(&[tag::ABORT]),
            Err(DecodeError::Malformed(Malformation::MissingField {
                id: field::SEQUENCE
            }))
        );
    }

    #[test]
    fn test_capabilities_intersection() {
        let host = Capabilities(Capabilities::FLASH_PROGRAM.0 | Capabilities::READBACK.0 | 0x8000);
        let agreed = host.intersection(Capabilities::ALL);
        assert!(agreed.contains(Capabilities::FLASH_PROGRAM));
        assert!(agreed.contains(Capabilities::READBACK));
        assert!(!agreed.contains(Capabilities::CHECKSUM));
        assert_eq!(agreed.0 & 0x8000, 0);
    }
}
