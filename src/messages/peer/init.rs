// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The two handshake messages that open every peer-initiated connection.
//!
//! Both are framed with a single-byte code. `PeerInit` opens a direct
//! outbound connection; `PierceFirewall` opens a dial-back that answers one
//! of our `ConnectToPeer` solicitations and carries only the solicitation
//! token.

use crate::{
    error::{Result, SlskError},
    messages::{
        ConnectionType, ToMessage,
        codes::InitCode,
        framing::{Message, MessageBuilder, MessageReader},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInit {
    pub username: String,
    pub kind: ConnectionType,
    pub token: u32,
}

impl PeerInit {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let username = r.read_string()?;
        let kind = ConnectionType::from_wire(&r.read_string()?)?;
        let token = r.read_uint()?;
        Ok(Self { username, kind, token })
    }
}

impl ToMessage for PeerInit {
    fn to_message(&self) -> Message {
        MessageBuilder::raw(InitCode::PeerInit as u8)
            .write_string(&self.username)
            .write_string(self.kind.as_wire())
            .write_uint(self.token)
            .into_message()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PierceFirewall {
    pub token: u32,
}

impl PierceFirewall {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { token: r.read_uint()? })
    }
}

impl ToMessage for PierceFirewall {
    fn to_message(&self) -> Message {
        MessageBuilder::raw(InitCode::PierceFirewall as u8)
            .write_uint(self.token)
            .into_message()
    }
}

/// First message read off an inbound socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundInit {
    PeerInit(PeerInit),
    PierceFirewall(PierceFirewall),
}

impl InboundInit {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        match InitCode::from_u8(r.code() as u8) {
            Some(InitCode::PeerInit) => Ok(InboundInit::PeerInit(PeerInit::parse(r)?)),
            Some(InitCode::PierceFirewall) => {
                Ok(InboundInit::PierceFirewall(PierceFirewall::parse(r)?))
            },
            None => Err(SlskError::message_read(
                Some(r.code()),
                "unknown peer-initiation code",
            )),
        }
    }
}
