// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Ipv4Addr;

use anyhow::Result;
use soulseek_client_rs::{
    messages::{
        ConnectionType, ToMessage,
        codes::ServerCode,
        framing::{MessageBuilder, MessageReader},
        server::{
            requests::{
                ConnectToPeerRequest, GetPeerAddressRequest, LoginRequest,
                SetListenPortRequest,
            },
            responses::{
                ConnectToPeerResponse, GetPeerAddressResponse, LoginResponse,
                NetInfoResponse, PrivateMessage, RoomListResponse,
            },
        },
    },
    utils::{credential_hash, ipv4_to_wire},
};

fn reader_for(msg: &soulseek_client_rs::messages::framing::Message) -> MessageReader {
    MessageReader::from_frame(msg.to_frame().slice(4..)).expect("frame")
}

#[test]
fn test_login_request_payload() -> Result<()> {
    let msg = LoginRequest::new("alice", "wonderland").to_message();
    assert_eq!(msg.code, ServerCode::Login as u32);

    let mut r = reader_for(&msg);
    assert_eq!(r.read_string()?, "alice");
    assert_eq!(r.read_string()?, "wonderland");
    assert_eq!(r.read_int()?, 181);
    assert_eq!(r.read_string()?, credential_hash("alice", "wonderland"));
    assert_eq!(r.read_int()?, 1);
    assert!(!r.has_remaining());
    Ok(())
}

#[test]
fn test_set_listen_port_payload() -> Result<()> {
    let msg = SetListenPortRequest { port: 2234 }.to_message();
    assert_eq!(msg.code, ServerCode::SetListenPort as u32);
    let mut r = reader_for(&msg);
    assert_eq!(r.read_uint()?, 2234);
    Ok(())
}

#[test]
fn test_get_peer_address_round_trip() -> Result<()> {
    let msg = GetPeerAddressRequest { username: "bob".into() }.to_message();
    let mut r = reader_for(&msg);
    assert_eq!(r.read_string()?, "bob");

    // Response: username, reversed-octet ip, port.
    let built = MessageBuilder::new(ServerCode::GetPeerAddress as u32)
        .write_string("bob")
        .write_bytes(&ipv4_to_wire(Ipv4Addr::new(192, 168, 7, 9)))
        .write_uint(2235)
        .into_message();
    let mut r = reader_for(&built);
    let resp = GetPeerAddressResponse::parse(&mut r)?;
    assert_eq!(resp.username, "bob");
    assert_eq!(resp.ip, Ipv4Addr::new(192, 168, 7, 9));
    assert_eq!(resp.port, 2235);
    assert!(!resp.is_offline());
    Ok(())
}

#[test]
fn test_get_peer_address_offline_marker() -> Result<()> {
    let built = MessageBuilder::new(ServerCode::GetPeerAddress as u32)
        .write_string("ghost")
        .write_bytes(&[0, 0, 0, 0])
        .write_uint(0)
        .into_message();
    let mut r = reader_for(&built);
    assert!(GetPeerAddressResponse::parse(&mut r)?.is_offline());
    Ok(())
}

#[test]
fn test_login_response_success_and_failure() -> Result<()> {
    let ok = MessageBuilder::new(ServerCode::Login as u32)
        .write_bool(true)
        .write_string("Welcome to the network")
        .write_bytes(&ipv4_to_wire(Ipv4Addr::new(10, 0, 0, 5)))
        .into_message();
    let parsed = LoginResponse::parse(&mut reader_for(&ok))?;
    assert!(parsed.succeeded);
    assert_eq!(parsed.ip, Some(Ipv4Addr::new(10, 0, 0, 5)));

    let bad = MessageBuilder::new(ServerCode::Login as u32)
        .write_bool(false)
        .write_string("INVALIDPASS")
        .into_message();
    let parsed = LoginResponse::parse(&mut reader_for(&bad))?;
    assert!(!parsed.succeeded);
    assert_eq!(parsed.message, "INVALIDPASS");
    assert_eq!(parsed.ip, None);
    Ok(())
}

#[test]
fn test_connect_to_peer_round_trip() -> Result<()> {
    let req = ConnectToPeerRequest {
        token: 77,
        username: "carol".into(),
        kind: ConnectionType::Transfer,
    }
    .to_message();
    let mut r = reader_for(&req);
    assert_eq!(r.read_uint()?, 77);
    assert_eq!(r.read_string()?, "carol");
    assert_eq!(r.read_string()?, "F");

    let inbound = MessageBuilder::new(ServerCode::ConnectToPeer as u32)
        .write_string("carol")
        .write_string("P")
        .write_bytes(&ipv4_to_wire(Ipv4Addr::new(172, 16, 0, 3)))
        .write_uint(2240)
        .write_uint(918)
        .into_message();
    let resp = ConnectToPeerResponse::parse(&mut reader_for(&inbound))?;
    assert_eq!(resp.username, "carol");
    assert_eq!(resp.kind, ConnectionType::Peer);
    assert_eq!(resp.ip, Ipv4Addr::new(172, 16, 0, 3));
    assert_eq!(resp.port, 2240);
    assert_eq!(resp.token, 918);
    Ok(())
}

#[test]
fn test_net_info_parse() -> Result<()> {
    let built = MessageBuilder::new(ServerCode::NetInfo as u32)
        .write_uint(2)
        .write_string("p1")
        .write_bytes(&ipv4_to_wire(Ipv4Addr::new(1, 2, 3, 4)))
        .write_uint(101)
        .write_string("p2")
        .write_bytes(&ipv4_to_wire(Ipv4Addr::new(5, 6, 7, 8)))
        .write_uint(202)
        .into_message();
    let info = NetInfoResponse::parse(&mut reader_for(&built))?;
    assert_eq!(info.parents.len(), 2);
    assert_eq!(info.parents[0].username, "p1");
    assert_eq!(info.parents[1].ip, Ipv4Addr::new(5, 6, 7, 8));
    assert_eq!(info.parents[1].port, 202);
    Ok(())
}

#[test]
fn test_room_list_parse() -> Result<()> {
    let built = MessageBuilder::new(ServerCode::RoomList as u32)
        .write_uint(2)
        .write_string("indie")
        .write_string("jazz")
        .write_uint(2)
        .write_uint(14)
        .write_uint(3)
        .into_message();
    let rooms = RoomListResponse::parse(&mut reader_for(&built))?;
    assert_eq!(rooms.rooms, vec![("indie".into(), 14), ("jazz".into(), 3)]);
    Ok(())
}

#[test]
fn test_private_message_parse_without_replay_marker() -> Result<()> {
    let built = MessageBuilder::new(ServerCode::PrivateMessages as u32)
        .write_uint(501)
        .write_uint(1_700_000_000)
        .write_string("dave")
        .write_string("hey, got that album?")
        .into_message();
    let pm = PrivateMessage::parse(&mut reader_for(&built))?;
    assert_eq!(pm.id, 501);
    assert_eq!(pm.username, "dave");
    assert!(!pm.replayed);
    Ok(())
}
