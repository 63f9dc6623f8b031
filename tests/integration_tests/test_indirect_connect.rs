// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    messages::framing::{MessageBuilder, MessageReader},
    messages::peer::responses::{BrowseResponse, Directory, FileAttribute, FileEntry},
};
use tokio::net::{TcpListener, TcpStream};

use crate::integration_tests::common::{
    TEST_PASS, TEST_USER, WireConn, peer_address_msg, recv_conn, serve_login,
    spawn_fake_server, test_config,
};

/// A loopback port that refuses connections: bind, note the port, drop.
async fn dead_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// The direct attempt dials a dead endpoint; the server-mediated dial-back
/// must win the race, and the adopted inbound socket then carries the
/// browse exchange.
#[tokio::test]
#[serial]
async fn test_indirect_establishment_beats_failed_direct() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let client = SoulseekClient::new(test_config(server_port));
    client.connect().await?;
    let listen_port = client.listen_port();

    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(TEST_USER, TEST_PASS).await })
    };
    let mut server = recv_conn(&mut server_rx, "server connection").await?;
    serve_login(&mut server).await?;
    login.await??;

    let browse = {
        let client = client.clone();
        tokio::spawn(async move { client.browse("bob").await })
    };

    // Hand out an endpoint nobody listens on.
    let dead = dead_port().await?;
    let mut r = server.expect_code(3).await?;
    assert_eq!(r.read_string()?, "bob");
    server.write_msg(&peer_address_msg("bob", dead)).await?;

    // The client falls back to soliciting a dial-back through us.
    let mut r = server.expect_code(18).await?;
    let token = r.read_uint()?;
    assert_eq!(r.read_string()?, "bob");
    assert_eq!(r.read_string()?, "P");

    // Dial back as the peer would: pierce with the solicitation token.
    let stream = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    let mut peer = WireConn::new(stream);
    peer.write_msg(&MessageBuilder::raw(0).write_uint(token).into_message())
        .await?;

    // The adopted socket is now the message connection; serve the browse.
    let body = peer.read_frame().await?;
    let browse_req = MessageReader::from_frame(body)?;
    assert_eq!(browse_req.code(), 4);

    let listing = BrowseResponse {
        directories: vec![Directory {
            name: "@@music".into(),
            files: vec![FileEntry {
                code: 1,
                filename: "@@music\\one.flac".into(),
                size: 9000,
                extension: "flac".into(),
                attributes: vec![FileAttribute { kind: 0, value: 1411 }],
            }],
        }],
    };
    peer.write_msg(&listing.encode()?).await?;

    let result = browse.await??;
    assert_eq!(result, listing);

    client.disconnect("test done").await;
    Ok(())
}
