// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Messages carried over distributed (type `D`) connections: the branch
//! bookkeeping a parent pushes down and the search requests the overlay
//! exists to spread.

use enum_dispatch::enum_dispatch;

use crate::{
    error::Result,
    messages::{
        ToMessage,
        codes::DistributedCode,
        framing::{Message, MessageBuilder, MessageReader},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedPing;

impl ToMessage for DistributedPing {
    fn to_message(&self) -> Message {
        MessageBuilder::new(DistributedCode::Ping as u32).into_message()
    }
}

/// A search traveling down the tree. Rebroadcast verbatim to every child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedSearchRequest {
    /// Reserved field the network writes as zero.
    pub unknown: u32,
    pub username: String,
    pub token: u32,
    pub query: String,
}

impl DistributedSearchRequest {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self {
            unknown: r.read_uint()?,
            username: r.read_string()?,
            token: r.read_uint()?,
            query: r.read_string()?,
        })
    }
}

impl ToMessage for DistributedSearchRequest {
    fn to_message(&self) -> Message {
        MessageBuilder::new(DistributedCode::SearchRequest as u32)
            .write_uint(self.unknown)
            .write_string(&self.username)
            .write_uint(self.token)
            .write_string(&self.query)
            .into_message()
    }
}

/// Our depth in the tree, pushed to children whenever it changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedBranchLevel {
    pub level: u32,
}

impl DistributedBranchLevel {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { level: r.read_uint()? })
    }
}

impl ToMessage for DistributedBranchLevel {
    fn to_message(&self) -> Message {
        MessageBuilder::new(DistributedCode::BranchLevel as u32)
            .write_uint(self.level)
            .into_message()
    }
}

/// Username of the tree's root, pushed alongside the level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedBranchRoot {
    pub root: String,
}

impl DistributedBranchRoot {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { root: r.read_string()? })
    }
}

impl ToMessage for DistributedBranchRoot {
    fn to_message(&self) -> Message {
        MessageBuilder::new(DistributedCode::BranchRoot as u32)
            .write_string(&self.root)
            .into_message()
    }
}

/// Reported upward by children; forwarded to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedChildDepth {
    pub depth: u32,
}

impl DistributedChildDepth {
    pub fn parse(r: &mut MessageReader) -> Result<Self> {
        Ok(Self { depth: r.read_uint()? })
    }
}

impl ToMessage for DistributedChildDepth {
    fn to_message(&self) -> Message {
        MessageBuilder::new(DistributedCode::ChildDepth as u32)
            .write_uint(self.depth)
            .into_message()
    }
}

#[enum_dispatch(ToMessage)]
#[derive(Debug, Clone)]
pub enum DistributedMessage {
    Ping(DistributedPing),
    SearchRequest(DistributedSearchRequest),
    BranchLevel(DistributedBranchLevel),
    BranchRoot(DistributedBranchRoot),
    ChildDepth(DistributedChildDepth),
}
