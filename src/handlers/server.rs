// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatch for messages arriving on the server session.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::{
    client::client::SoulseekClient,
    error::Result,
    messages::{
        ConnectionType,
        codes::ServerCode,
        framing::MessageReader,
        server::{
            requests::{AcknowledgePrivateMessageRequest, PingRequest, ServerRequest},
            responses::{
                ConnectToPeerResponse, GetPeerAddressResponse, IntegerResponse,
                LoginResponse, NetInfoResponse, PrivateMessage, PrivilegedUsersResponse,
                RoomListResponse,
            },
        },
    },
    waiter::WaitKey,
};

pub async fn handle(client: &Arc<SoulseekClient>, body: Bytes) -> Result<()> {
    let mut r = MessageReader::from_frame(body)?;
    let raw_code = r.code();
    let Some(code) = ServerCode::from_u32(raw_code) else {
        trace!(code = raw_code, "unhandled server message");
        return Ok(());
    };

    match code {
        ServerCode::Login => {
            let response = LoginResponse::parse(&mut r)?;
            client
                .waiter()
                .complete(&WaitKey::new(ServerCode::Login as u32), response);
        },
        ServerCode::GetPeerAddress => {
            let response = GetPeerAddressResponse::parse(&mut r)?;
            let key = WaitKey::new(ServerCode::GetPeerAddress as u32)
                .with(&response.username);
            client.waiter().complete(&key, response);
        },
        ServerCode::ConnectToPeer => {
            let response = ConnectToPeerResponse::parse(&mut r)?;
            dispatch_connect_to_peer(client, response);
        },
        ServerCode::PrivateMessages => {
            let pm = PrivateMessage::parse(&mut r)?;
            info!(from = %pm.username, "private message received");
            client
                .send_server(ServerRequest::AcknowledgePrivateMessage(
                    AcknowledgePrivateMessageRequest { id: pm.id },
                ))
                .await?;
        },
        ServerCode::RoomList => {
            let rooms = RoomListResponse::parse(&mut r)?;
            debug!(rooms = rooms.rooms.len(), "room list received");
        },
        ServerCode::PrivilegedUsers => {
            let users = PrivilegedUsersResponse::parse(&mut r)?;
            debug!(count = users.usernames.len(), "privileged users received");
        },
        ServerCode::ParentMinSpeed => {
            let v = IntegerResponse::parse(&mut r)?.0;
            client.distributed().set_parent_min_speed(v);
        },
        ServerCode::ParentSpeedRatio => {
            let v = IntegerResponse::parse(&mut r)?.0;
            client.distributed().set_parent_speed_ratio(v);
        },
        ServerCode::WishlistInterval => {
            let v = IntegerResponse::parse(&mut r)?.0;
            client.set_wishlist_interval(v);
        },
        ServerCode::SearchInactivityTimeout => {
            let v = IntegerResponse::parse(&mut r)?.0;
            client.set_search_inactivity_timeout(v);
        },
        ServerCode::NetInfo => {
            let info = NetInfoResponse::parse(&mut r)?;
            debug!(candidates = info.parents.len(), "parent candidates received");
            client.distributed().handle_net_info(info).await;
        },
        ServerCode::Ping => {
            trace!("server ping");
            client.send_server(ServerRequest::Ping(PingRequest)).await?;
        },
        other => {
            trace!(?other, "server message ignored");
        },
    }
    Ok(())
}

/// The server relays a peer's wish to connect; the type selects which
/// subsystem the resulting connection belongs to.
fn dispatch_connect_to_peer(client: &Arc<SoulseekClient>, response: ConnectToPeerResponse) {
    let client = Arc::clone(client);
    tokio::spawn(async move {
        let username = response.username.clone();
        let res = match response.kind {
            ConnectionType::Peer => {
                client
                    .peers()
                    .add_solicited_message_connection(&response)
                    .await
            },
            ConnectionType::Transfer => {
                client.peers().handle_transfer_solicitation(&response).await
            },
            ConnectionType::Distributed => {
                match client
                    .peers()
                    .add_solicited_distributed_connection(&response)
                    .await
                {
                    Ok(conn) => {
                        client.distributed().add_child(&username, conn).await;
                        Ok(())
                    },
                    Err(e) => Err(e),
                }
            },
        };
        if let Err(e) = res {
            warn!(username = %username, kind = %response.kind, "connect-to-peer handling failed: {e}");
        }
    });
}
