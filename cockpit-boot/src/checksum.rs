// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! CRC helpers shared by the frame codec, the message handlers and the host.

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

/// CRC-16/CCITT: polynomial 0x1021, initial value 0xFFFF, no reflection.
pub static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-32 (ISO-HDLC, reflected 0xEDB88320) used for payloads and images.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-16 over a frame body.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-32 over a chunk payload or image.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
