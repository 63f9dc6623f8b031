// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Requests written to a peer message connection.

use enum_dispatch::enum_dispatch;

use crate::{
    error::Result,
    messages::{
        ToMessage,
        codes::PeerCode,
        framing::{Message, MessageBuilder, MessageReader},
    },
};

/// Asks the peer for its full shared-file listing. No payload.
#[derive(Debug, Clone, Copy)]
pub struct BrowseRequest;

impl ToMessage for BrowseRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::BrowseRequest as u32).into_message()
    }
}

/// Asks the peer for its self-description. No payload.
#[derive(Debug, Clone, Copy)]
pub struct InfoRequest;

impl ToMessage for InfoRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::InfoRequest as u32).into_message()
    }
}

/// Asks the peer to enqueue a file for upload to us.
#[derive(Debug, Clone)]
pub struct QueueDownloadRequest {
    pub filename: String,
}

impl QueueDownloadRequest {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { filename: r.read_string()? })
    }
}

impl ToMessage for QueueDownloadRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::QueueDownload as u32)
            .write_string(&self.filename)
            .into_message()
    }
}

/// Asks where a queued file currently sits in the peer's upload queue.
#[derive(Debug, Clone)]
pub struct PlaceInQueueRequest {
    pub filename: String,
}

impl PlaceInQueueRequest {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { filename: r.read_string()? })
    }
}

impl ToMessage for PlaceInQueueRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(PeerCode::PlaceInQueueRequest as u32)
            .write_string(&self.filename)
            .into_message()
    }
}

#[enum_dispatch(ToMessage)]
#[derive(Debug, Clone)]
pub enum PeerRequest {
    Browse(BrowseRequest),
    Info(InfoRequest),
    QueueDownload(QueueDownloadRequest),
    PlaceInQueue(PlaceInQueueRequest),
}
