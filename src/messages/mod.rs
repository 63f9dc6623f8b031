// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod codes;
pub mod distributed;
pub mod framing;
pub mod peer;
pub mod server;

use std::fmt;

use enum_dispatch::enum_dispatch;

use crate::{
    error::{Result, SlskError},
    messages::{
        distributed::{
            DistributedBranchLevel, DistributedBranchRoot, DistributedChildDepth,
            DistributedMessage, DistributedPing, DistributedSearchRequest,
        },
        framing::Message,
        peer::requests::{
            BrowseRequest, InfoRequest, PeerRequest, PlaceInQueueRequest,
            QueueDownloadRequest,
        },
        server::requests::{
            AcceptChildrenRequest, AcknowledgePrivateMessageRequest,
            BranchLevelRequest, BranchRootRequest, ChildDepthRequest,
            ConnectToPeerRequest, FileSearchRequest, GetPeerAddressRequest,
            HaveNoParentRequest, LoginRequest, PingRequest, ServerRequest,
            SetListenPortRequest,
        },
    },
};

/// Implemented by every outgoing message payload; the request enums in
/// `server`, `peer` and `distributed` dispatch through it.
#[enum_dispatch]
pub trait ToMessage {
    fn to_message(&self) -> Message;
}

/// Connection kind exchanged during the peer handshake.
///
/// `P` carries framed peer messages, `F` carries raw transfer bytes, `D`
/// carries distributed overlay messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    Peer,
    Transfer,
    Distributed,
}

impl ConnectionType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ConnectionType::Peer => "P",
            ConnectionType::Transfer => "F",
            ConnectionType::Distributed => "D",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self> {
        match s {
            "P" => Ok(ConnectionType::Peer),
            "F" => Ok(ConnectionType::Transfer),
            "D" => Ok(ConnectionType::Distributed),
            other => Err(SlskError::message_read(
                None,
                format!("unknown connection type {other:?}"),
            )),
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Direction of a file transfer as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferDirection {
    Download = 0,
    Upload = 1,
}

impl TransferDirection {
    pub fn from_wire(v: u32) -> Result<Self> {
        match v {
            0 => Ok(TransferDirection::Download),
            1 => Ok(TransferDirection::Upload),
            other => Err(SlskError::message_read(
                None,
                format!("unknown transfer direction {other}"),
            )),
        }
    }
}
