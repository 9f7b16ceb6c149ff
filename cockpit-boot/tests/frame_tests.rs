// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Frame codec tests over byte streams.

use cockpit_boot::checksum::crc16;
use cockpit_boot::frame::{encode, encode_into, FrameDecoder, FRAME_OVERHEAD, MAX_FRAME_BODY, MAX_FRAME_LEN};

fn frame_bytes(body: &[u8]) -> Vec<u8> {
    encode::<MAX_FRAME_LEN>(body).unwrap().to_vec()
}

fn drain(decoder: &mut FrameDecoder, frames: &mut Vec<Vec<u8>>) {
    while let Some(frame) = decoder.next_frame() {
        frames.push(frame.body.to_vec());
    }
}

fn decode_stream(decoder: &mut FrameDecoder, stream: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for &b in stream {
        decoder.push(b);
        drain(decoder, &mut frames);
    }
    frames
}

/// Decode `stream`, then let the link go quiet until the decoder is idle.
fn decode_then_quiet(decoder: &mut FrameDecoder, stream: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = decode_stream(decoder, stream);
    while !decoder.is_idle() {
        decoder.abandon();
        drain(decoder, &mut frames);
    }
    frames
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// =============================================================================
// Round trip
// =============================================================================

#[test]
fn test_roundtrip_every_body_length() {
    let mut decoder = FrameDecoder::new();
    for len in 0..=MAX_FRAME_BODY {
        let body = pattern(len, len as u8);
        let frames = decode_stream(&mut decoder, &frame_bytes(&body));
        assert_eq!(frames, vec![body], "length {len}");
    }
    assert_eq!(decoder.stats().accepted as usize, MAX_FRAME_BODY + 1);
    assert_eq!(decoder.stats().rejected(), 0);
}

#[test]
fn test_back_to_back_frames_in_one_stream() {
    let bodies: Vec<Vec<u8>> = (0..10).map(|i| pattern(i * 17, i as u8)).collect();
    let stream: Vec<u8> = bodies.iter().flat_map(|b| frame_bytes(b)).collect();
    let mut decoder = FrameDecoder::new();
    assert_eq!(decode_stream(&mut decoder, &stream), bodies);
}

#[test]
fn test_wire_layout_is_marker_length_body_crc() {
    let body = pattern(300, 7);
    let wire = frame_bytes(&body);
    assert_eq!(wire.len(), body.len() + FRAME_OVERHEAD);
    assert_eq!(wire[0], 0x7E);
    assert_eq!(u16::from_be_bytes([wire[1], wire[2]]), 300);
    assert_eq!(&wire[3..303], &body[..]);
    assert_eq!(u16::from_be_bytes([wire[303], wire[304]]), crc16(&body));
}

#[test]
fn test_encode_into_small_buffer_fails() {
    let mut out = [0u8; 8];
    assert!(encode_into(&[0u8; 4], &mut out).is_err());
    assert_eq!(encode_into(&[0u8; 3], &mut out), Ok(8));
}

// =============================================================================
// Corruption and recovery
// =============================================================================

#[test]
fn test_bit_flips_in_body_and_crc_never_yield_a_frame() {
    let body = pattern(64, 3);
    let good = frame_bytes(&body);
    let mut decoder = FrameDecoder::new();

    for idx in 3..good.len() {
        for bit in 0..8 {
            let mut bad = good.clone();
            bad[idx] ^= 1 << bit;
            assert!(
                decode_then_quiet(&mut decoder, &bad).is_empty(),
                "flip at byte {idx} bit {bit} accepted"
            );
            // The next valid frame still decodes.
            assert_eq!(decode_stream(&mut decoder, &good), vec![body.clone()]);
        }
    }
}

#[test]
fn test_truncated_frame_followed_by_valid_frames() {
    let body = pattern(40, 9);
    let good = frame_bytes(&body);

    // The cut frame takes the start of the next one as its body; both
    // frames after the cut must still decode.
    let mut stream = good[..20].to_vec();
    stream.extend_from_slice(&good);
    stream.extend_from_slice(&good);

    let mut decoder = FrameDecoder::new();
    assert_eq!(decode_stream(&mut decoder, &stream), vec![body.clone(), body]);
    assert_eq!(decoder.stats().crc_errors, 1);
    assert_eq!(decoder.stats().accepted, 2);
    assert!(decoder.is_idle());
}

#[test]
fn test_stray_marker_before_frames() {
    let body = pattern(12, 1);
    let good = frame_bytes(&body);
    let mut stream = vec![0x7E];
    stream.extend_from_slice(&good);
    stream.extend_from_slice(&good);

    let mut decoder = FrameDecoder::new();
    assert_eq!(decode_stream(&mut decoder, &stream), vec![body.clone(), body]);
    assert_eq!(decoder.stats().oversize, 1);
    assert_eq!(decoder.stats().accepted, 2);
}

#[test]
fn test_frame_inside_rejected_frame_is_recovered() {
    // A false header claims 64 body bytes; a whole frame and filler follow.
    let body = pattern(15, 1);
    let mut stream = vec![0x7E, 0x00, 0x40];
    stream.extend_from_slice(&frame_bytes(&body));
    stream.resize(3 + 64 + 2, 0x00);

    let mut decoder = FrameDecoder::new();
    assert_eq!(decode_stream(&mut decoder, &stream), vec![body]);
    assert_eq!(decoder.stats().crc_errors, 1);
    assert!(decoder.is_idle());
}

#[test]
fn test_quiet_link_rescans_abandoned_bytes() {
    // A false header claims more bytes than ever arrive; the frame behind
    // it decodes once the partial frame is abandoned.
    let body = pattern(10, 4);
    let mut stream = vec![0x7E, 0x01, 0x00];
    stream.extend_from_slice(&frame_bytes(&body));

    let mut decoder = FrameDecoder::new();
    assert!(decode_stream(&mut decoder, &stream).is_empty());
    assert!(!decoder.is_idle());

    assert_eq!(decode_then_quiet(&mut decoder, &[]), vec![body]);
    assert_eq!(decoder.stats().abandoned, 1);
}

#[test]
fn test_oversize_length_is_corruption() {
    let mut stream = vec![0x7E, 0xFF, 0xFF];
    let body = pattern(12, 1);
    stream.extend_from_slice(&frame_bytes(&body));

    let mut decoder = FrameDecoder::new();
    assert_eq!(decode_stream(&mut decoder, &stream), vec![body]);
    assert_eq!(decoder.stats().oversize, 1);
}
