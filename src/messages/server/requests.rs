// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Requests written to the central server.

use enum_dispatch::enum_dispatch;

use crate::{
    messages::{
        ConnectionType, ToMessage,
        codes::ServerCode,
        framing::{Message, MessageBuilder},
    },
    utils::credential_hash,
};

/// Protocol revision reported during login.
pub const LOGIN_VERSION: i32 = 181;
pub const LOGIN_MINOR_VERSION: i32 = 1;

/// Credentials plus the version/hash block the server expects.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

impl ToMessage for LoginRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::Login as u32)
            .write_string(&self.username)
            .write_string(&self.password)
            .write_int(LOGIN_VERSION)
            .write_string(&credential_hash(&self.username, &self.password))
            .write_int(LOGIN_MINOR_VERSION)
            .into_message()
    }
}

/// Announces the dial-back listener port after login.
#[derive(Debug, Clone, Copy)]
pub struct SetListenPortRequest {
    pub port: u16,
}

impl ToMessage for SetListenPortRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::SetListenPort as u32)
            .write_uint(self.port as u32)
            .into_message()
    }
}

#[derive(Debug, Clone)]
pub struct GetPeerAddressRequest {
    pub username: String,
}

impl ToMessage for GetPeerAddressRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::GetPeerAddress as u32)
            .write_string(&self.username)
            .into_message()
    }
}

/// Asks the server to relay a connect solicitation to a peer that we could
/// not reach directly.
#[derive(Debug, Clone)]
pub struct ConnectToPeerRequest {
    pub token: u32,
    pub username: String,
    pub kind: ConnectionType,
}

impl ToMessage for ConnectToPeerRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::ConnectToPeer as u32)
            .write_uint(self.token)
            .write_string(&self.username)
            .write_string(self.kind.as_wire())
            .into_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcknowledgePrivateMessageRequest {
    pub id: u32,
}

impl ToMessage for AcknowledgePrivateMessageRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::AcknowledgePrivateMessage as u32)
            .write_uint(self.id)
            .into_message()
    }
}

/// Starts a network-wide file search identified by `token`.
#[derive(Debug, Clone)]
pub struct FileSearchRequest {
    pub token: u32,
    pub query: String,
}

impl ToMessage for FileSearchRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::FileSearch as u32)
            .write_uint(self.token)
            .write_string(&self.query)
            .into_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PingRequest;

impl ToMessage for PingRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::Ping as u32).into_message()
    }
}

/// `true` while we are looking for a distributed parent.
#[derive(Debug, Clone, Copy)]
pub struct HaveNoParentRequest {
    pub have_no_parent: bool,
}

impl ToMessage for HaveNoParentRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::HaveNoParent as u32)
            .write_bool(self.have_no_parent)
            .into_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AcceptChildrenRequest {
    pub accept: bool,
}

impl ToMessage for AcceptChildrenRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::AcceptChildren as u32)
            .write_bool(self.accept)
            .into_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BranchLevelRequest {
    pub level: u32,
}

impl ToMessage for BranchLevelRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::BranchLevel as u32)
            .write_uint(self.level)
            .into_message()
    }
}

#[derive(Debug, Clone)]
pub struct BranchRootRequest {
    pub root: String,
}

impl ToMessage for BranchRootRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::BranchRoot as u32)
            .write_string(&self.root)
            .into_message()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChildDepthRequest {
    pub depth: u32,
}

impl ToMessage for ChildDepthRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(ServerCode::ChildDepth as u32)
            .write_uint(self.depth)
            .into_message()
    }
}

/// Everything the client ever writes to the server session.
#[enum_dispatch(ToMessage)]
#[derive(Debug, Clone)]
pub enum ServerRequest {
    Login(LoginRequest),
    SetListenPort(SetListenPortRequest),
    GetPeerAddress(GetPeerAddressRequest),
    ConnectToPeer(ConnectToPeerRequest),
    AcknowledgePrivateMessage(AcknowledgePrivateMessageRequest),
    FileSearch(FileSearchRequest),
    Ping(PingRequest),
    HaveNoParent(HaveNoParentRequest),
    AcceptChildren(AcceptChildrenRequest),
    BranchLevel(BranchLevelRequest),
    BranchRoot(BranchRootRequest),
    ChildDepth(ChildDepthRequest),
}
