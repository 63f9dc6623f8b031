// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatch for messages arriving on a distributed connection, parent or
//! child.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::{
    client::client::SoulseekClient,
    error::Result,
    messages::{
        codes::DistributedCode,
        distributed::{
            DistributedBranchLevel, DistributedBranchRoot, DistributedChildDepth,
            DistributedSearchRequest,
        },
        framing::MessageReader,
    },
};

pub async fn handle(client: &Arc<SoulseekClient>, username: &str, body: Bytes) -> Result<()> {
    let mut r = MessageReader::from_frame(body)?;
    let raw_code = r.code();
    let Some(code) = DistributedCode::from_u32(raw_code) else {
        trace!(username, code = raw_code, "unhandled distributed message");
        return Ok(());
    };

    let distributed = client.distributed();
    match code {
        DistributedCode::BranchLevel => {
            let msg = DistributedBranchLevel::parse(&mut r)?;
            distributed.on_branch_level(username, msg.level).await;
        },
        DistributedCode::BranchRoot => {
            let msg = DistributedBranchRoot::parse(&mut r)?;
            distributed.on_branch_root(username, msg.root).await;
        },
        DistributedCode::SearchRequest => {
            let msg = DistributedSearchRequest::parse(&mut r)?;
            distributed.on_search_request(username, msg).await;
        },
        DistributedCode::ChildDepth => {
            let msg = DistributedChildDepth::parse(&mut r)?;
            distributed.on_child_depth(username, msg.depth).await;
        },
        DistributedCode::Ping => {
            distributed.on_ping(username).await;
        },
    }
    Ok(())
}
