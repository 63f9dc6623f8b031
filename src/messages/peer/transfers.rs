// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The two-phase transfer negotiation messages. Both travel in both
//! directions: we send a `TransferRequest` to start a download, and a peer
//! sends one back when a previously queued file becomes ready.

use crate::{
    error::Result,
    messages::{
        ToMessage, TransferDirection,
        codes::PeerCode,
        framing::{Message, MessageBuilder, MessageReader},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub token: u32,
    pub filename: String,
    /// Present when the sender already knows the file size (upload
    /// direction, and the unsolicited ready notification for a queued
    /// download).
    pub size: Option<u64>,
}

impl TransferRequest {
    pub fn new_download(token: u32, filename: impl Into<String>) -> Self {
        Self {
            direction: TransferDirection::Download,
            token,
            filename: filename.into(),
            size: None,
        }
    }

    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let direction = TransferDirection::from_wire(r.read_uint()?)?;
        let token = r.read_uint()?;
        let filename = r.read_string()?;
        // Peers disagree on whether the download direction carries a size;
        // trust the frame length over the direction flag.
        let size = if r.remaining() >= 8 { Some(r.read_long()? as u64) } else { None };
        Ok(Self { direction, token, filename, size })
    }
}

impl ToMessage for TransferRequest {
    fn to_message(&self) -> Message {
        let mut b = MessageBuilder::new(PeerCode::TransferRequest as u32)
            .write_uint(self.direction as u32)
            .write_uint(self.token)
            .write_string(&self.filename);
        if let Some(size) = self.size {
            b = b.write_long(size as i64);
        }
        b.into_message()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResponse {
    /// The transfer may begin; `size` is the sender's view of the byte count
    /// (our resume offset when we are the one allowing).
    Allowed { token: u32, size: u64 },
    /// The transfer may not begin now; the reason text distinguishes a hard
    /// rejection from queueing.
    Rejected { token: u32, message: String },
}

impl TransferResponse {
    pub fn token(&self) -> u32 {
        match self {
            TransferResponse::Allowed { token, .. } => *token,
            TransferResponse::Rejected { token, .. } => *token,
        }
    }

    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let token = r.read_uint()?;
        let allowed = r.read_bool()?;
        if allowed {
            let size = if r.remaining() >= 8 { r.read_long()? as u64 } else { 0 };
            Ok(TransferResponse::Allowed { token, size })
        } else {
            let message = r.read_string()?;
            Ok(TransferResponse::Rejected { token, message })
        }
    }
}

impl ToMessage for TransferResponse {
    fn to_message(&self) -> Message {
        match self {
            TransferResponse::Allowed { token, size } => {
                MessageBuilder::new(PeerCode::TransferResponse as u32)
                    .write_uint(*token)
                    .write_bool(true)
                    .write_long(*size as i64)
                    .into_message()
            },
            TransferResponse::Rejected { token, message } => {
                MessageBuilder::new(PeerCode::TransferResponse as u32)
                    .write_uint(*token)
                    .write_bool(false)
                    .write_string(message)
                    .into_message()
            },
        }
    }
}

/// Exact rejection text that means the file will never be served.
pub const REJECTION_FILE_NOT_SHARED: &str = "File not shared";
