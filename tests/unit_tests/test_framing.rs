// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use hex_literal::hex;
use soulseek_client_rs::{
    error::SlskError,
    messages::framing::{MessageBuilder, MessageReader, deflate, inflate},
};

#[test]
fn test_frame_layout_is_length_code_payload() {
    // code 1, payload = u32 7 | string "ab"
    let frame = MessageBuilder::new(1)
        .write_uint(7)
        .write_string("ab")
        .into_frame();

    // length = 4 (code) + 4 (u32) + 4 + 2 (string) = 14
    assert_eq!(
        frame.as_ref(),
        hex!("0e000000 01000000 07000000 02000000 6162")
    );
}

#[test]
fn test_raw_frame_uses_single_byte_code() {
    let frame = MessageBuilder::raw(0).write_uint(42).into_frame();
    // length = 1 (code) + 4 = 5
    assert_eq!(frame.as_ref(), hex!("05000000 00 2a000000"));
}

#[test]
fn test_builder_reader_round_trip() -> Result<()> {
    let msg = MessageBuilder::new(40)
        .write_byte(0xfe)
        .write_bool(true)
        .write_int(-5)
        .write_uint(0xdead_beef)
        .write_long(-1_000_000_000_000)
        .write_string("snow, forest, lake")
        .write_bytes(&[9, 9, 9])
        .into_message();

    let frame = msg.to_frame();
    let mut r = MessageReader::from_frame(frame.slice(4..))?;
    assert_eq!(r.code(), 40);
    assert_eq!(r.read_byte()?, 0xfe);
    assert!(r.read_bool()?);
    assert_eq!(r.read_int()?, -5);
    assert_eq!(r.read_uint()?, 0xdead_beef);
    assert_eq!(r.read_long()?, -1_000_000_000_000);
    assert_eq!(r.read_string()?, "snow, forest, lake");
    assert_eq!(r.read_bytes(3)?.as_ref(), &[9, 9, 9]);
    assert!(!r.has_remaining());
    Ok(())
}

#[test]
fn test_underrun_preserves_code() {
    let msg = MessageBuilder::new(3).write_uint(100).into_message();
    let mut r = MessageReader::from_frame(msg.to_frame().slice(4..)).expect("frame");
    // A string length prefix needs 4 bytes of payload plus data.
    r.read_uint().expect("first read fits");
    let err = r.read_string().expect_err("must underrun");
    match err {
        SlskError::MessageRead { code, .. } => assert_eq!(code, Some(3)),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_empty_frame_rejected() {
    assert!(MessageReader::from_frame(Bytes::new()).is_err());
    assert!(MessageReader::from_raw_frame(Bytes::new()).is_err());
}

#[test]
fn test_compress_inflate_round_trip() -> Result<()> {
    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let deflated = deflate(&payload)?;
    assert_ne!(deflated, payload);
    assert_eq!(inflate(&deflated)?, payload);
    Ok(())
}

#[test]
fn test_builder_compress_reader_decompress() -> Result<()> {
    let msg = MessageBuilder::new(5)
        .write_string("a directory listing")
        .write_uint(12345)
        .compress()?
        .into_message();

    let mut r = MessageReader::from_frame(msg.to_frame().slice(4..))?;
    r.decompress()?;
    assert_eq!(r.read_string()?, "a directory listing");
    assert_eq!(r.read_uint()?, 12345);
    Ok(())
}

#[test]
fn test_decompress_garbage_fails() {
    let mut r = MessageReader::from_frame(Bytes::from_static(&[5, 0, 0, 0, 1, 2, 3]))
        .expect("frame");
    assert!(matches!(
        r.decompress(),
        Err(SlskError::MessageCompression(_))
    ));
}
