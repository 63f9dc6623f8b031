// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Numeric message codes fixed by the network.
//!
//! Server and distributed messages carry a `u32` code; the two
//! peer-initiation messages (`PierceFirewall`, `PeerInit`) carry a single
//! byte and are framed "raw".

/// Messages exchanged over the long-lived server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ServerCode {
    Login = 1,
    SetListenPort = 2,
    GetPeerAddress = 3,
    ConnectToPeer = 18,
    PrivateMessages = 22,
    AcknowledgePrivateMessage = 23,
    FileSearch = 26,
    Ping = 32,
    RoomList = 64,
    PrivilegedUsers = 69,
    HaveNoParent = 71,
    ParentMinSpeed = 83,
    ParentSpeedRatio = 84,
    SearchInactivityTimeout = 87,
    AcceptChildren = 100,
    NetInfo = 102,
    WishlistInterval = 104,
    BranchLevel = 126,
    BranchRoot = 127,
    ChildDepth = 129,
}

impl ServerCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => ServerCode::Login,
            2 => ServerCode::SetListenPort,
            3 => ServerCode::GetPeerAddress,
            18 => ServerCode::ConnectToPeer,
            22 => ServerCode::PrivateMessages,
            23 => ServerCode::AcknowledgePrivateMessage,
            26 => ServerCode::FileSearch,
            32 => ServerCode::Ping,
            64 => ServerCode::RoomList,
            69 => ServerCode::PrivilegedUsers,
            71 => ServerCode::HaveNoParent,
            83 => ServerCode::ParentMinSpeed,
            84 => ServerCode::ParentSpeedRatio,
            87 => ServerCode::SearchInactivityTimeout,
            100 => ServerCode::AcceptChildren,
            102 => ServerCode::NetInfo,
            104 => ServerCode::WishlistInterval,
            126 => ServerCode::BranchLevel,
            127 => ServerCode::BranchRoot,
            129 => ServerCode::ChildDepth,
            _ => return None,
        })
    }
}

/// Messages exchanged over a peer message connection (type `P`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PeerCode {
    BrowseRequest = 4,
    BrowseResponse = 5,
    SearchResponse = 9,
    InfoRequest = 15,
    InfoResponse = 16,
    TransferRequest = 40,
    TransferResponse = 41,
    QueueDownload = 43,
    PlaceInQueueResponse = 44,
    UploadFailed = 46,
    QueueFailed = 50,
    PlaceInQueueRequest = 51,
}

impl PeerCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            4 => PeerCode::BrowseRequest,
            5 => PeerCode::BrowseResponse,
            9 => PeerCode::SearchResponse,
            15 => PeerCode::InfoRequest,
            16 => PeerCode::InfoResponse,
            40 => PeerCode::TransferRequest,
            41 => PeerCode::TransferResponse,
            43 => PeerCode::QueueDownload,
            44 => PeerCode::PlaceInQueueResponse,
            46 => PeerCode::UploadFailed,
            50 => PeerCode::QueueFailed,
            51 => PeerCode::PlaceInQueueRequest,
            _ => return None,
        })
    }
}

/// Single-byte codes of the peer-initiation messages; these frames carry a
/// `u8` code instead of a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InitCode {
    PierceFirewall = 0,
    PeerInit = 1,
}

impl InitCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(InitCode::PierceFirewall),
            1 => Some(InitCode::PeerInit),
            _ => None,
        }
    }
}

/// Messages exchanged over a distributed connection (type `D`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DistributedCode {
    Ping = 0,
    SearchRequest = 3,
    BranchLevel = 4,
    BranchRoot = 5,
    ChildDepth = 7,
}

impl DistributedCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => DistributedCode::Ping,
            3 => DistributedCode::SearchRequest,
            4 => DistributedCode::BranchLevel,
            5 => DistributedCode::BranchRoot,
            7 => DistributedCode::ChildDepth,
            _ => return None,
        })
    }
}
