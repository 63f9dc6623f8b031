// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-process wire harness: a scripted "server" and scripted "peers" built
//! from plain loopback sockets, speaking the real framing.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use soulseek_client_rs::{
    cfg::config::Config,
    messages::framing::{Message, MessageBuilder, MessageReader},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

pub const TEST_USER: &str = "alice";
pub const TEST_PASS: &str = "letmein";

/// One raw framed socket driven imperatively by a test script.
pub struct WireConn {
    stream: TcpStream,
}

impl WireConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Reads one frame body (length prefix stripped, code still in front).
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }

    /// Reads frames until one carries the wanted `u32` code, skipping the
    /// client's housekeeping traffic.
    pub async fn expect_code(&mut self, code: u32) -> Result<MessageReader> {
        for _ in 0..64 {
            let body = self.read_frame().await?;
            let r = MessageReader::from_frame(body)?;
            if r.code() == code {
                return Ok(r);
            }
        }
        bail!("code {code} never arrived");
    }

    pub async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        self.stream.write_all(&msg.to_frame()).await?;
        Ok(())
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Binds a fake server; every accepted socket is handed back as a
/// [`WireConn`].
pub async fn spawn_fake_server() -> Result<(u16, mpsc::UnboundedReceiver<WireConn>)> {
    spawn_accept_loop().await
}

/// Same shape as the fake server; used for scripted peers.
pub async fn spawn_fake_peer() -> Result<(u16, mpsc::UnboundedReceiver<WireConn>)> {
    spawn_accept_loop().await
}

async fn spawn_accept_loop() -> Result<(u16, mpsc::UnboundedReceiver<WireConn>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if tx.send(WireConn::new(stream)).is_err() {
                        return;
                    }
                },
                Err(_) => return,
            }
        }
    });
    Ok((port, rx))
}

/// Test configuration pointed at the fake server, with short timeouts and
/// an ephemeral listener port.
pub fn test_config(server_port: u16) -> Config {
    let mut cfg = Config::default();
    cfg.server_address = "127.0.0.1".to_string();
    cfg.server_port = server_port;
    cfg.message_timeout = Duration::from_secs(2);
    cfg.listen_port = 0;
    cfg.connection.connect_timeout = Duration::from_secs(2);
    cfg.connection.inactivity_timeout = Duration::from_secs(30);
    cfg.distributed.parent_watchdog = Duration::from_secs(1);
    cfg
}

pub fn login_ok_msg() -> Message {
    MessageBuilder::new(1)
        .write_bool(true)
        .write_string("Welcome")
        .write_bytes(&[1, 0, 0, 127])
        .into_message()
}

/// Drives the server side of a successful login handshake.
pub async fn serve_login(server: &mut WireConn) -> Result<()> {
    let mut r = server.expect_code(1).await?;
    let username = r.read_string()?;
    if username != TEST_USER {
        bail!("unexpected login username {username}");
    }
    server.write_msg(&login_ok_msg()).await
}

/// Server-side reply to `GetPeerAddress` pointing at a loopback port.
pub fn peer_address_msg(username: &str, port: u16) -> Message {
    MessageBuilder::new(3)
        .write_string(username)
        .write_bytes(&[1, 0, 0, 127])
        .write_uint(port as u32)
        .into_message()
}

/// Answers `GetPeerAddress` requests for `username` with `port`, skipping
/// everything else, until one has been answered.
pub async fn serve_peer_address(server: &mut WireConn, username: &str, port: u16) -> Result<()> {
    let mut r = server.expect_code(3).await?;
    let asked = r.read_string()?;
    if asked != username {
        bail!("asked for address of {asked}, expected {username}");
    }
    server.write_msg(&peer_address_msg(username, port)).await
}

/// Peer-side: read the raw `PeerInit` a direct connection opens with.
pub async fn expect_peer_init(peer: &mut WireConn) -> Result<(String, String, u32)> {
    let body = peer.read_frame().await?;
    let mut r = MessageReader::from_raw_frame(body)?;
    if r.code() != 1 {
        bail!("expected PeerInit, got raw code {}", r.code());
    }
    let username = r.read_string()?;
    let kind = r.read_string()?;
    let token = r.read_uint()?;
    Ok((username, kind, token))
}

pub async fn recv_conn(
    rx: &mut mpsc::UnboundedReceiver<WireConn>,
    what: &str,
) -> Result<WireConn> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .with_context(|| format!("timed out waiting for {what}"))?
        .with_context(|| format!("accept loop for {what} is gone"))
}

/// Polls an async predicate until it holds or the deadline passes.
pub async fn wait_until<F, Fut>(what: &str, deadline: Duration, mut cond: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bail!("condition never held: {what}")
}
