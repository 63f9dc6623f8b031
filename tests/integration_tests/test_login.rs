// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;
use soulseek_client_rs::{
    client::client::{ClientStates, SoulseekClient},
    error::SlskError,
    messages::framing::MessageBuilder,
};

use crate::integration_tests::common::{
    TEST_PASS, TEST_USER, recv_conn, serve_login, spawn_fake_server, test_config,
};

#[tokio::test]
#[serial]
async fn test_login_happy_path() -> Result<()> {
    let (port, mut server_rx) = spawn_fake_server().await?;
    let client = SoulseekClient::new(test_config(port));

    client.connect().await?;
    assert_eq!(client.state(), ClientStates::CONNECTED);

    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(TEST_USER, TEST_PASS).await })
    };
    let mut server = recv_conn(&mut server_rx, "server connection").await?;
    serve_login(&mut server).await?;
    login.await??;

    assert_eq!(
        client.state(),
        ClientStates::CONNECTED | ClientStates::LOGGED_IN
    );
    assert_eq!(client.username()?, TEST_USER);

    // The listener was announced with its real (ephemeral) port.
    let mut r = server.expect_code(2).await?;
    assert_eq!(r.read_uint()?, client.listen_port() as u32);
    assert_ne!(client.listen_port(), 0);

    client.disconnect("test done").await;
    assert_eq!(client.state(), ClientStates::empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_login_rejection_disconnects() -> Result<()> {
    let (port, mut server_rx) = spawn_fake_server().await?;
    let client = SoulseekClient::new(test_config(port));
    client.connect().await?;

    let login = {
        let client = client.clone();
        tokio::spawn(async move { client.login(TEST_USER, "wrong").await })
    };
    let mut server = recv_conn(&mut server_rx, "server connection").await?;
    server.expect_code(1).await?;
    server
        .write_msg(
            &MessageBuilder::new(1)
                .write_bool(false)
                .write_string("INVALIDPASS")
                .into_message(),
        )
        .await?;

    let err = login.await?.expect_err("login must fail");
    assert!(matches!(err, SlskError::InvalidOperation(_)));
    // A failed login tears the whole session down.
    assert_eq!(client.state(), ClientStates::empty());
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_operations_require_login() -> Result<()> {
    let (port, _server_rx) = spawn_fake_server().await?;
    let client = SoulseekClient::new(test_config(port));

    // Not even connected yet.
    assert!(matches!(
        client.browse("bob").await,
        Err(SlskError::InvalidOperation(_))
    ));

    client.connect().await?;
    // Connected but not logged in.
    assert!(matches!(
        client.search("test").await,
        Err(SlskError::InvalidOperation(_))
    ));
    client.disconnect("test done").await;
    Ok(())
}
