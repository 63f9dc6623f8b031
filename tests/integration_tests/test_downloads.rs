// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    error::SlskError,
    messages::framing::MessageBuilder,
    transfers::{TransferOptions, TransferStates},
};
use tokio::sync::mpsc;

use crate::integration_tests::common::{
    TEST_PASS, TEST_USER, WireConn, expect_peer_init, recv_conn, serve_login,
    serve_peer_address, spawn_fake_peer, spawn_fake_server, test_config,
};

const PEER: &str = "bob";
const FILE: &str = "@@shared\\album\\track.mp3";

async fn connected_client(
    server_rx: &mut mpsc::UnboundedReceiver<WireConn>,
    port: u16,
) -> Result<(Arc<SoulseekClient>, WireConn)> {
    let client = SoulseekClient::new(test_config(port));
    client.connect().await?;
    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(TEST_USER, TEST_PASS).await })
    };
    let mut server = recv_conn(server_rx, "server connection").await?;
    serve_login(&mut server).await?;
    login.await??;
    Ok((client, server))
}

/// Peer side of the message-connection handshake: accept, check `PeerInit`,
/// return the socket for scripting.
async fn accept_message_connection(
    peer_rx: &mut mpsc::UnboundedReceiver<WireConn>,
) -> Result<WireConn> {
    let mut peer = recv_conn(peer_rx, "peer message connection").await?;
    let (username, kind, _token) = expect_peer_init(&mut peer).await?;
    assert_eq!(username, TEST_USER);
    assert_eq!(kind, "P");
    Ok(peer)
}

/// Opens the transfer connection toward the client's listener, announces
/// the token, honors the offset handshake, and streams `data`.
async fn serve_transfer_connection(
    listen_port: u16,
    token: u32,
    expected_offset: i64,
    data: Vec<u8>,
) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", listen_port)).await?;
    let mut wire = WireConn::new(stream);

    // PeerInit with kind F, then the 4-byte remote token.
    let init = MessageBuilder::raw(1)
        .write_string(PEER)
        .write_string("F")
        .write_uint(0)
        .into_message();
    wire.write_msg(&init).await?;
    wire.write_bytes(&token.to_le_bytes()).await?;

    let offset = wire.read_exact(8).await?;
    assert_eq!(i64::from_le_bytes(offset.try_into().expect("8 bytes")), expected_offset);

    wire.write_bytes(&data).await?;
    // The client closes the connection once it has drained everything.
    let _ = wire.read_exact(1).await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_allowed_download_end_to_end() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let (peer_port, mut peer_rx) = spawn_fake_peer().await?;
    let (client, mut server) = connected_client(&mut server_rx, server_port).await?;
    let listen_port = client.listen_port();

    let states: Arc<Mutex<Vec<TransferStates>>> = Arc::new(Mutex::new(Vec::new()));
    let states_seen = Arc::clone(&states);
    let options = TransferOptions {
        state_changed: Some(Arc::new(move |_prev, snapshot| {
            states_seen.lock().expect("states lock").push(snapshot.state);
        })),
        ..TransferOptions::default()
    };

    let download = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut sink: Vec<u8> = Vec::new();
            let transfer = client
                .download(PEER, FILE, &mut sink, 0, Some(7), options)
                .await?;
            Ok::<_, SlskError>((transfer, sink))
        })
    };

    serve_peer_address(&mut server, PEER, peer_port).await?;
    let mut peer = accept_message_connection(&mut peer_rx).await?;

    // Phase one: the transfer request comes in and is allowed.
    let mut r = peer.expect_code(40).await?;
    assert_eq!(r.read_uint()?, 0, "direction must be download");
    assert_eq!(r.read_uint()?, 7, "token must be the caller's");
    assert_eq!(r.read_string()?, FILE);

    peer.write_msg(
        &MessageBuilder::new(41)
            .write_uint(7)
            .write_bool(true)
            .write_long(4)
            .into_message(),
    )
    .await?;

    // Phase two: the data connection.
    let serve = tokio::spawn(serve_transfer_connection(
        listen_port,
        7,
        0,
        vec![0x00, 0x01, 0x02, 0x03],
    ));

    let (transfer, sink) = download.await??;
    serve.await??;
    assert_eq!(sink, vec![0x00, 0x01, 0x02, 0x03]);
    assert_eq!(transfer.bytes_transferred, 4);
    assert_eq!(
        transfer.state,
        TransferStates::SUCCEEDED | TransferStates::COMPLETED
    );

    let seen = states.lock().expect("states lock").clone();
    assert_eq!(
        seen,
        vec![
            TransferStates::REQUESTED,
            TransferStates::INITIALIZING,
            TransferStates::IN_PROGRESS,
            TransferStates::SUCCEEDED,
            TransferStates::SUCCEEDED | TransferStates::COMPLETED,
        ]
    );

    client.disconnect("test done").await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_queued_download_comes_alive_later() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let (peer_port, mut peer_rx) = spawn_fake_peer().await?;
    let (client, mut server) = connected_client(&mut server_rx, server_port).await?;
    let listen_port = client.listen_port();

    let download = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut sink: Vec<u8> = Vec::new();
            let transfer = client
                .download(PEER, FILE, &mut sink, 0, Some(5), TransferOptions::default())
                .await?;
            Ok::<_, SlskError>((transfer, sink))
        })
    };

    serve_peer_address(&mut server, PEER, peer_port).await?;
    let mut peer = accept_message_connection(&mut peer_rx).await?;

    // Not now, but soon.
    peer.expect_code(40).await?;
    peer.write_msg(
        &MessageBuilder::new(41)
            .write_uint(5)
            .write_bool(false)
            .write_string("Queued")
            .into_message(),
    )
    .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    // The unsolicited ready notification carries the peer's token and size.
    peer.write_msg(
        &MessageBuilder::new(40)
            .write_uint(1)
            .write_uint(5)
            .write_string(FILE)
            .write_long(1024)
            .into_message(),
    )
    .await?;

    // The client grants it, echoing our token with its resume offset.
    let mut r = peer.expect_code(41).await?;
    assert_eq!(r.read_uint()?, 5);
    assert!(r.read_bool()?);
    assert_eq!(r.read_long()?, 0);

    let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
    let serve = tokio::spawn(serve_transfer_connection(listen_port, 5, 0, payload.clone()));

    let (transfer, sink) = download.await??;
    serve.await??;
    assert_eq!(sink, payload);
    assert_eq!(transfer.size, 1024);
    assert_eq!(
        transfer.state,
        TransferStates::SUCCEEDED | TransferStates::COMPLETED
    );

    client.disconnect("test done").await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_duplicate_token_and_file_rejected_before_io() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let (peer_port, mut peer_rx) = spawn_fake_peer().await?;
    let (client, mut server) = connected_client(&mut server_rx, server_port).await?;

    // First download parks at the transfer-response wait; the peer stays
    // silent on purpose.
    let first = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut sink: Vec<u8> = Vec::new();
            client
                .download(PEER, FILE, &mut sink, 0, Some(1), TransferOptions::default())
                .await
        })
    };
    serve_peer_address(&mut server, PEER, peer_port).await?;
    let mut peer = accept_message_connection(&mut peer_rx).await?;
    peer.expect_code(40).await?;

    // Same token, different file: rejected before any I/O.
    let mut other_sink: Vec<u8> = Vec::new();
    let err = client
        .download(PEER, "another\\file.mp3", &mut other_sink, 0, Some(1), TransferOptions::default())
        .await
        .expect_err("duplicate token");
    assert!(matches!(err, SlskError::DuplicateToken(1)));

    // Same file, any token: also rejected.
    let err = client
        .download(PEER, FILE, &mut other_sink, 0, None, TransferOptions::default())
        .await
        .expect_err("duplicate transfer");
    assert!(matches!(err, SlskError::DuplicateTransfer { .. }));

    // The silent peer ultimately times the first download out.
    let err = first.await?.expect_err("must time out");
    assert!(matches!(err, SlskError::Timeout(_)));

    client.disconnect("test done").await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_hard_rejection_fails_with_transfer_rejected() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let (peer_port, mut peer_rx) = spawn_fake_peer().await?;
    let (client, mut server) = connected_client(&mut server_rx, server_port).await?;

    let download = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut sink: Vec<u8> = Vec::new();
            client
                .download(PEER, FILE, &mut sink, 0, Some(9), TransferOptions::default())
                .await
        })
    };
    serve_peer_address(&mut server, PEER, peer_port).await?;
    let mut peer = accept_message_connection(&mut peer_rx).await?;

    peer.expect_code(40).await?;
    peer.write_msg(
        &MessageBuilder::new(41)
            .write_uint(9)
            .write_bool(false)
            .write_string("File not shared")
            .into_message(),
    )
    .await?;

    let err = download.await?.expect_err("hard rejection");
    assert!(matches!(err, SlskError::TransferRejected(_)));

    client.disconnect("test done").await;
    Ok(())
}
