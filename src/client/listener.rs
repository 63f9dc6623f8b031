// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Accepts inbound peer dial-backs.
//!
//! Every inbound socket must identify itself with one raw-coded message
//! (`PeerInit` or `PierceFirewall`) before anything else; sockets that stay
//! silent past the message timeout are dropped.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use tokio::{io::AsyncReadExt, net::{TcpListener, TcpStream}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{Result, SlskError},
    messages::{framing::MessageReader, peer::init::InboundInit},
};

/// Handler invoked with the parsed initiation message and the socket, which
/// still holds any bytes the peer wrote after it.
pub type InboundHandler = Arc<
    dyn Fn(InboundInit, TcpStream, SocketAddr) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(port: u16) -> Result<Self> {
        let inner = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| SlskError::connection(format!("failed to bind listener: {e}")))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| SlskError::connection(format!("listener has no local addr: {e}")))?;
        Ok(Self { inner, local_addr })
    }

    /// Actual bound port; differs from the requested one when binding port 0
    /// in tests.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Consumes the listener and runs the accept loop until cancelled.
    pub fn spawn(self, handler: InboundHandler, init_timeout: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            debug!(port = self.local_addr.port(), "listener started");
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = self.inner.accept() => res,
                };
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    },
                };
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let init = tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = tokio::time::timeout(init_timeout, read_init(stream)) => res,
                    };
                    match init {
                        Ok(Ok((init, stream))) => handler(init, stream, remote).await,
                        Ok(Err(e)) => debug!(%remote, "dropping inbound socket: {e}"),
                        Err(_) => debug!(%remote, "inbound socket sent no initiation in time"),
                    }
                });
            }
        });
    }
}

/// Reads the single raw-coded initiation frame off a fresh inbound socket.
async fn read_init(mut stream: TcpStream) -> Result<(InboundInit, TcpStream)> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(SlskError::ConnectionRead)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    // PeerInit is small; anything oversized here is not a handshake.
    if len == 0 || len > 4096 {
        return Err(SlskError::message_read(
            None,
            format!("implausible initiation frame length {len}"),
        ));
    }
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(SlskError::ConnectionRead)?;

    let mut reader = MessageReader::from_raw_frame(body.into())?;
    let init = InboundInit::parse(&mut reader)?;
    Ok((init, stream))
}
