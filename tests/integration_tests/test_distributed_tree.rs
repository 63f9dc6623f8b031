// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::SoulseekClient,
    messages::framing::MessageBuilder,
    utils::ipv4_to_wire,
};
use tokio::sync::mpsc;

use crate::integration_tests::common::{
    TEST_PASS, TEST_USER, WireConn, expect_peer_init, recv_conn, serve_login,
    spawn_fake_peer, spawn_fake_server, test_config, wait_until,
};

const PARENT: &str = "parent1";

async fn qualify_as_parent(
    peer_rx: &mut mpsc::UnboundedReceiver<WireConn>,
    level: u32,
    root: &str,
) -> Result<WireConn> {
    let mut candidate = recv_conn(peer_rx, "distributed connection").await?;
    let (username, kind, _token) = expect_peer_init(&mut candidate).await?;
    assert_eq!(username, TEST_USER);
    assert_eq!(kind, "D");

    // A candidate qualifies with branch level + root + a first search.
    candidate
        .write_msg(&MessageBuilder::new(4).write_uint(level).into_message())
        .await?;
    candidate
        .write_msg(&MessageBuilder::new(5).write_string(root).into_message())
        .await?;
    candidate
        .write_msg(
            &MessageBuilder::new(3)
                .write_uint(0)
                .write_string("searcher")
                .write_uint(4242)
                .write_string("ambient")
                .into_message(),
        )
        .await?;
    Ok(candidate)
}

/// Spec scenario: the selected parent goes silent; the watchdog drops it
/// and the branch info reverts to the orphaned defaults.
#[tokio::test]
#[serial]
async fn test_parent_adoption_and_watchdog_orphaning() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let (peer_port, mut peer_rx) = spawn_fake_peer().await?;

    let client = SoulseekClient::new(test_config(server_port));
    client.connect().await?;
    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(TEST_USER, TEST_PASS).await })
    };
    let mut server = recv_conn(&mut server_rx, "server connection").await?;
    serve_login(&mut server).await?;
    login.await??;

    // Freshly logged in: an orphan announcing itself.
    assert!(!client.distributed().has_parent().await);
    assert_eq!(client.distributed().branch_level(), 0);

    // Nominate one candidate.
    let net_info = MessageBuilder::new(102)
        .write_uint(1)
        .write_string(PARENT)
        .write_bytes(&ipv4_to_wire(std::net::Ipv4Addr::new(127, 0, 0, 1)))
        .write_uint(peer_port as u32)
        .into_message();
    server.write_msg(&net_info).await?;

    let _candidate = qualify_as_parent(&mut peer_rx, 5, "rootuser").await?;

    wait_until("parent adopted", Duration::from_secs(3), || {
        let client = client.clone();
        async move { client.distributed().has_parent().await }
    })
    .await?;
    assert_eq!(client.distributed().branch_level(), 6);
    assert_eq!(client.distributed().branch_root().await, "rootuser");

    // Silence. The watchdog (1s in the test config) must orphan us.
    wait_until("parent dropped", Duration::from_secs(5), || {
        let client = client.clone();
        async move { !client.distributed().has_parent().await }
    })
    .await?;
    assert_eq!(client.distributed().branch_level(), 0);
    assert_eq!(client.distributed().branch_root().await, "");

    client.disconnect("test done").await;
    Ok(())
}

/// A second candidate that qualifies after a parent is already held is
/// disposed, never adopted.
#[tokio::test]
#[serial]
async fn test_candidate_list_ignored_while_parented() -> Result<()> {
    let (server_port, mut server_rx) = spawn_fake_server().await?;
    let (peer_port, mut peer_rx) = spawn_fake_peer().await?;

    let client = SoulseekClient::new(test_config(server_port));
    client.connect().await?;
    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(TEST_USER, TEST_PASS).await })
    };
    let mut server = recv_conn(&mut server_rx, "server connection").await?;
    serve_login(&mut server).await?;
    login.await??;

    let net_info = MessageBuilder::new(102)
        .write_uint(1)
        .write_string(PARENT)
        .write_bytes(&ipv4_to_wire(std::net::Ipv4Addr::new(127, 0, 0, 1)))
        .write_uint(peer_port as u32)
        .into_message();
    server.write_msg(&net_info).await?;
    let mut candidate = qualify_as_parent(&mut peer_rx, 2, "rootuser").await?;

    wait_until("parent adopted", Duration::from_secs(3), || {
        let client = client.clone();
        async move { client.distributed().has_parent().await }
    })
    .await?;
    assert_eq!(client.distributed().branch_level(), 3);

    // A fresh nomination while parented must not trigger a new round.
    server.write_msg(&net_info).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.distributed().has_parent().await);
    assert_eq!(client.distributed().branch_level(), 3);

    // Keep the parent alive past the check by feeding the watchdog.
    candidate
        .write_msg(&MessageBuilder::new(4).write_uint(2).into_message())
        .await?;

    client.disconnect("test done").await;
    Ok(())
}
