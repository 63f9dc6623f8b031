// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed message framing.
//!
//! Wire form is `u32 LE length | code | payload`, where `code` is a `u32 LE`
//! for every message except the two peer-initiation messages, which carry a
//! single byte and are built/parsed "raw". All integers are little-endian;
//! strings are `u32 LE length + UTF-8 bytes`; booleans are a single `0`/`1`
//! byte.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::error::{Result, SlskError};

/// A decoded-from-the-wire or ready-for-the-wire message: a numeric code and
/// the payload that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    /// Raw messages serialize their code as a single byte.
    pub raw: bool,
    pub payload: Bytes,
}

impl Message {
    /// Serializes the full frame including the length prefix.
    pub fn to_frame(&self) -> Bytes {
        let code_len = if self.raw { 1 } else { 4 };
        let mut out = BytesMut::with_capacity(4 + code_len + self.payload.len());
        out.put_u32_le((code_len + self.payload.len()) as u32);
        if self.raw {
            out.put_u8(self.code as u8);
        } else {
            out.put_u32_le(self.code);
        }
        out.put_slice(&self.payload);
        out.freeze()
    }
}

/// Incrementally writes primitives into a message payload.
///
/// `compress()` replaces the payload written so far with its zlib-deflated
/// form; used by the browse and search response bodies.
#[derive(Debug)]
pub struct MessageBuilder {
    code: u32,
    raw: bool,
    payload: BytesMut,
}

impl MessageBuilder {
    pub fn new(code: u32) -> Self {
        Self { code, raw: false, payload: BytesMut::new() }
    }

    /// Builder for the peer-initiation messages whose code is a single byte.
    pub fn raw(code: u8) -> Self {
        Self { code: code as u32, raw: true, payload: BytesMut::new() }
    }

    pub fn write_byte(mut self, v: u8) -> Self {
        self.payload.put_u8(v);
        self
    }

    pub fn write_bool(self, v: bool) -> Self {
        self.write_byte(v as u8)
    }

    pub fn write_int(mut self, v: i32) -> Self {
        self.payload.put_i32_le(v);
        self
    }

    pub fn write_uint(mut self, v: u32) -> Self {
        self.payload.put_u32_le(v);
        self
    }

    pub fn write_long(mut self, v: i64) -> Self {
        self.payload.put_i64_le(v);
        self
    }

    pub fn write_string(mut self, v: &str) -> Self {
        self.payload.put_u32_le(v.len() as u32);
        self.payload.put_slice(v.as_bytes());
        self
    }

    pub fn write_bytes(mut self, v: &[u8]) -> Self {
        self.payload.put_slice(v);
        self
    }

    /// Replaces the payload with its zlib-deflated form.
    pub fn compress(mut self) -> Result<Self> {
        let deflated = deflate(&self.payload)?;
        self.payload = BytesMut::from(&deflated[..]);
        Ok(self)
    }

    pub fn into_message(self) -> Message {
        Message {
            code: self.code,
            raw: self.raw,
            payload: self.payload.freeze(),
        }
    }

    /// Convenience: build and serialize in one step.
    pub fn into_frame(self) -> Bytes {
        self.into_message().to_frame()
    }
}

/// Cursor over a received payload, symmetric to [`MessageBuilder`].
///
/// Every read checks the remaining length first and fails with a
/// message-read error that preserves the code and the unread bytes for
/// diagnostics.
#[derive(Debug)]
pub struct MessageReader {
    code: u32,
    buf: Bytes,
}

impl MessageReader {
    /// Parses a frame body (length prefix already stripped) that begins with
    /// a `u32 LE` code.
    pub fn from_frame(mut body: Bytes) -> Result<Self> {
        if body.len() < 4 {
            return Err(SlskError::message_read(
                None,
                format!("frame too short for a message code: {} bytes", body.len()),
            ));
        }
        let code = body.get_u32_le();
        Ok(Self { code, buf: body })
    }

    /// Parses a frame body that begins with a single-byte code
    /// (`PeerInit` / `PierceFirewall`).
    pub fn from_raw_frame(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Err(SlskError::message_read(None, "empty raw frame"));
        }
        let code = body.get_u8() as u32;
        Ok(Self { code, buf: body })
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }

    fn underrun(&self, wanted: usize) -> SlskError {
        SlskError::message_read(
            Some(self.code),
            format!(
                "payload underrun: wanted {wanted} more bytes, have {} (tail: {})",
                self.buf.len(),
                hex::encode(&self.buf[..self.buf.len().min(16)]),
            ),
        )
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        if self.buf.is_empty() {
            return Err(self.underrun(1));
        }
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    pub fn read_int(&mut self) -> Result<i32> {
        if self.buf.len() < 4 {
            return Err(self.underrun(4));
        }
        Ok(self.buf.get_i32_le())
    }

    pub fn read_uint(&mut self) -> Result<u32> {
        if self.buf.len() < 4 {
            return Err(self.underrun(4));
        }
        Ok(self.buf.get_u32_le())
    }

    pub fn read_long(&mut self) -> Result<i64> {
        if self.buf.len() < 8 {
            return Err(self.underrun(8));
        }
        Ok(self.buf.get_i64_le())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_uint()? as usize;
        if self.buf.len() < len {
            return Err(self.underrun(len));
        }
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|e| {
            SlskError::message_read(Some(self.code), format!("invalid UTF-8 string: {e}"))
        })
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        if self.buf.len() < n {
            return Err(self.underrun(n));
        }
        Ok(self.buf.split_to(n))
    }

    /// Replaces the unread remainder with its zlib-inflated form.
    pub fn decompress(&mut self) -> Result<()> {
        let inflated = inflate(&self.buf)?;
        self.buf = Bytes::from(inflated);
        Ok(())
    }
}

pub fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    enc.write_all(data).map_err(SlskError::MessageCompression)?;
    enc.finish().map_err(SlskError::MessageCompression)
}

pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(SlskError::MessageCompression)?;
    Ok(out)
}
