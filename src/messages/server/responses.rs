// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Messages received from the central server.

use std::net::Ipv4Addr;

use crate::{
    error::Result,
    messages::{ConnectionType, framing::MessageReader},
    utils::ipv4_from_wire,
};

fn read_ipv4(r: &mut MessageReader) -> Result<Ipv4Addr> {
    let raw = r.read_bytes(4)?;
    Ok(ipv4_from_wire([raw[0], raw[1], raw[2], raw[3]]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    pub succeeded: bool,
    pub message: String,
    /// Our externally visible address, present on success.
    pub ip: Option<Ipv4Addr>,
}

impl LoginResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let succeeded = r.read_bool()?;
        let message = r.read_string()?;
        let ip = if succeeded && r.remaining() >= 4 {
            Some(read_ipv4(r)?)
        } else {
            None
        };
        Ok(Self { succeeded, message, ip })
    }
}

/// Endpoint of a peer, or the offline marker (`0.0.0.0:0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPeerAddressResponse {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

impl GetPeerAddressResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let username = r.read_string()?;
        let ip = read_ipv4(r)?;
        let port = r.read_uint()?;
        Ok(Self { username, ip, port })
    }

    pub fn is_offline(&self) -> bool {
        self.ip.is_unspecified() || self.port == 0
    }
}

/// A peer we solicited (or that solicited us) wants a connection; dial them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToPeerResponse {
    pub username: String,
    pub kind: ConnectionType,
    pub ip: Ipv4Addr,
    pub port: u32,
    pub token: u32,
}

impl ConnectToPeerResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let username = r.read_string()?;
        let kind = ConnectionType::from_wire(&r.read_string()?)?;
        let ip = read_ipv4(r)?;
        let port = r.read_uint()?;
        let token = r.read_uint()?;
        Ok(Self { username, kind, ip, port, token })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: u32,
    pub timestamp: u32,
    pub username: String,
    pub message: String,
    pub replayed: bool,
}

impl PrivateMessage {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let id = r.read_uint()?;
        let timestamp = r.read_uint()?;
        let username = r.read_string()?;
        let message = r.read_string()?;
        // Older servers omit the replay marker.
        let replayed = if r.has_remaining() { r.read_bool()? } else { false };
        Ok(Self { id, timestamp, username, message, replayed })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomListResponse {
    /// Room name with its member count.
    pub rooms: Vec<(String, u32)>,
}

impl RoomListResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let name_count = r.read_uint()? as usize;
        let mut names = Vec::with_capacity(name_count);
        for _ in 0..name_count {
            names.push(r.read_string()?);
        }
        let count_count = r.read_uint()? as usize;
        let mut rooms = Vec::with_capacity(name_count);
        for (i, name) in names.into_iter().enumerate() {
            let users = if i < count_count { r.read_uint()? } else { 0 };
            rooms.push((name, users));
        }
        Ok(Self { rooms })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedUsersResponse {
    pub usernames: Vec<String>,
}

impl PrivilegedUsersResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let count = r.read_uint()? as usize;
        let mut usernames = Vec::with_capacity(count);
        for _ in 0..count {
            usernames.push(r.read_string()?);
        }
        Ok(Self { usernames })
    }
}

/// Candidate distributed parents nominated by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfoResponse {
    pub parents: Vec<ParentCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentCandidate {
    pub username: String,
    pub ip: Ipv4Addr,
    pub port: u32,
}

impl NetInfoResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        let count = r.read_uint()? as usize;
        let mut parents = Vec::with_capacity(count);
        for _ in 0..count {
            let username = r.read_string()?;
            let ip = read_ipv4(r)?;
            let port = r.read_uint()?;
            parents.push(ParentCandidate { username, ip, port });
        }
        Ok(Self { parents })
    }
}

/// Single-integer server directives share one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerResponse(pub u32);

impl IntegerResponse {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self(r.read_uint()?))
    }
}
