// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single TCP session with length-prefixed message framing.
//!
//! One `Connection` owns its socket halves outright. Message connections run
//! a frame loop that feeds `on_message`; transfer connections skip the loop
//! and read raw bytes through [`Connection::read`] /
//! [`Connection::read_to_stream`].

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    cfg::config::ConnectionConfig,
    client::common::{Governor, io_with_timeout},
    error::{Result, SlskError},
    messages::framing::Message,
};

/// Upper bound on a single frame; anything larger is treated as a framing
/// desync rather than a genuine message.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// How often the liveness probe pokes an otherwise idle socket.
const LIVENESS_TICK: Duration = Duration::from_millis(250);

/// What a connection is for; part of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Server,
    Peer,
    Distributed,
    Transfer,
}

/// Identity of a connection: who, where, and what for. Server connections
/// use an empty username.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub username: Option<String>,
    pub ip: IpAddr,
    pub port: u16,
    pub role: ConnectionRole,
}

impl ConnectionKey {
    pub fn server(ip: IpAddr, port: u16) -> Self {
        Self { username: None, ip, port, role: ConnectionRole::Server }
    }

    pub fn peer(username: &str, ip: IpAddr, port: u16, role: ConnectionRole) -> Self {
        Self { username: Some(username.to_string()), ip, port, role }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Pending = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Disconnected = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Pending,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

type ConnectedFn = dyn Fn() + Send + Sync;
type DisconnectedFn = dyn Fn(&str) + Send + Sync;
type MessageFn = dyn Fn(Bytes) + Send + Sync;
type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Callbacks registered at construction; all are invoked from the
/// connection's own tasks.
#[derive(Default, Clone)]
pub struct ConnectionEvents {
    pub on_connected: Option<Arc<ConnectedFn>>,
    pub on_disconnected: Option<Arc<DisconnectedFn>>,
    pub on_message: Option<Arc<MessageFn>>,
    pub on_data_read: Option<Arc<ProgressFn>>,
    pub on_data_written: Option<Arc<ProgressFn>>,
}

impl std::fmt::Debug for ConnectionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEvents")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_message", &self.on_message.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    cfg: ConnectionConfig,
    /// `None` disables the inactivity watchdog (server session).
    inactivity: Option<Duration>,
    state: AtomicU8,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Messages submitted before the socket reached `Connected`; flushed in
    /// order on connect completion.
    deferred: Mutex<VecDeque<Bytes>>,
    /// Milliseconds since connect of the last successful read or write.
    last_activity_ms: AtomicU64,
    epoch: Instant,
    events: ConnectionEvents,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        key: ConnectionKey,
        cfg: ConnectionConfig,
        events: ConnectionEvents,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let inactivity = match key.role {
            ConnectionRole::Server => None,
            _ => Some(cfg.inactivity_timeout),
        };
        Arc::new(Self {
            key,
            cfg,
            inactivity,
            state: AtomicU8::new(ConnectionState::Pending as u8),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            deferred: Mutex::new(VecDeque::new()),
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            events,
            cancel,
        })
    }

    /// Adopts an already-established inbound socket; the connection starts
    /// out `Connected` and its watchdogs running.
    pub fn from_stream(
        key: ConnectionKey,
        cfg: ConnectionConfig,
        events: ConnectionEvents,
        cancel: CancellationToken,
        stream: TcpStream,
    ) -> Arc<Self> {
        let conn = Self::new(key, cfg, events, cancel);
        let (r, w) = stream.into_split();
        // No await points between construction and here, the locks are free.
        *conn.reader.try_lock().expect("fresh connection") = Some(r);
        *conn.writer.try_lock().expect("fresh connection") = Some(w);
        conn.state
            .store(ConnectionState::Connected as u8, Ordering::SeqCst);
        conn.touch();
        conn.spawn_watchdogs();
        if let Some(cb) = &conn.events.on_connected {
            cb();
        }
        conn
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        self.epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(last))
    }

    /// Opens the TCP session. Legal only from `Pending` or `Disconnected`.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let prev = self.state.load(Ordering::SeqCst);
        match ConnectionState::from_u8(prev) {
            ConnectionState::Pending | ConnectionState::Disconnected => {},
            other => {
                return Err(SlskError::InvalidOperation(format!(
                    "connect is not legal from state {other:?}"
                )));
            },
        }
        self.state
            .store(ConnectionState::Connecting as u8, Ordering::SeqCst);

        let addr = (self.key.ip, self.key.port);
        let stream = match io_with_timeout(
            "connect",
            TcpStream::connect(addr),
            self.cfg.connect_timeout,
            &self.cancel,
            |e| SlskError::connection_caused(
                "TCP connect failed",
                SlskError::ConnectionRead(e),
            ),
        )
        .await
        {
            Ok(s) => s,
            Err(e) => {
                self.state
                    .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
                return Err(match e {
                    SlskError::Timeout(_) | SlskError::Cancelled(_) => e,
                    other => SlskError::connection_caused(
                        format!("failed to connect to {}:{}", self.key.ip, self.key.port),
                        other,
                    ),
                });
            },
        };
        stream.set_nodelay(true).map_err(SlskError::ConnectionWrite)?;

        let (r, w) = stream.into_split();
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
        self.state
            .store(ConnectionState::Connected as u8, Ordering::SeqCst);
        self.touch();
        debug!(key = ?self.key, "connected");

        self.spawn_watchdogs();
        if let Some(cb) = &self.events.on_connected {
            cb();
        }
        self.flush_deferred().await?;
        Ok(())
    }

    async fn flush_deferred(self: &Arc<Self>) -> Result<()> {
        loop {
            let next = self.deferred.lock().await.pop_front();
            match next {
                Some(frame) => self.write(&frame).await?,
                None => return Ok(()),
            }
        }
    }

    /// Tears the session down and fires `on_disconnected` exactly once.
    pub async fn disconnect(&self, reason: &str) {
        let prev = self.state.swap(ConnectionState::Disconnecting as u8, Ordering::SeqCst);
        match ConnectionState::from_u8(prev) {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                self.state
                    .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
                return;
            },
            _ => {},
        }

        self.cancel.cancel();
        if let Ok(mut guard) = self.writer.try_lock()
            && let Some(w) = guard.as_mut()
        {
            let _ = w.shutdown().await;
        }
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
        debug!(key = ?self.key, reason, "disconnected");
        if let Some(cb) = &self.events.on_disconnected {
            cb(reason);
        }
    }

    /// Relinquishes the socket; the instance becomes inert. Used when an
    /// inbound socket read by the listener is promoted to a different
    /// connection kind.
    pub async fn handoff_tcp_client(&self) -> Result<TcpStream> {
        let r = self.reader.lock().await.take();
        let w = self.writer.lock().await.take();
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
        self.cancel.cancel();
        match (r, w) {
            (Some(r), Some(w)) => r.reunite(w).map_err(|e| {
                SlskError::connection(format!("socket halves did not match: {e}"))
            }),
            _ => Err(SlskError::InvalidOperation(
                "connection no longer owns a socket".into(),
            )),
        }
    }

    /// Writes a full byte slice. Writes submitted while the connection is
    /// still `Pending`/`Connecting` are deferred and flushed in order once
    /// connected.
    pub async fn write(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(SlskError::argument("bytes", "must not be empty"));
        }
        match self.state() {
            ConnectionState::Connected => {},
            ConnectionState::Pending | ConnectionState::Connecting => {
                self.deferred
                    .lock()
                    .await
                    .push_back(Bytes::copy_from_slice(bytes));
                trace!(key = ?self.key, n = bytes.len(), "write deferred until connect");
                return Ok(());
            },
            other => {
                return Err(SlskError::ConnectionWrite(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("connection is {other:?}"),
                )));
            },
        }

        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or_else(|| {
            SlskError::InvalidOperation("connection no longer owns a socket".into())
        })?;
        let res = io_with_timeout(
            "write",
            w.write_all(bytes),
            self.cfg.connect_timeout,
            &self.cancel,
            SlskError::ConnectionWrite,
        )
        .await;
        drop(guard);

        match res {
            Ok(()) => {
                self.touch();
                if let Some(cb) = &self.events.on_data_written {
                    cb(bytes.len() as u64, bytes.len() as u64);
                }
                Ok(())
            },
            Err(e) => {
                self.disconnect("write failed").await;
                Err(e)
            },
        }
    }

    /// Frames and writes one message.
    pub async fn write_message(self: &Arc<Self>, msg: &Message) -> Result<()> {
        self.write(&msg.to_frame()).await
    }

    /// Reads exactly `n` bytes. A remote close mid-read surfaces as a read
    /// error after the state transition.
    pub async fn read(self: &Arc<Self>, n: usize) -> Result<Bytes> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        if !self.is_connected() {
            return Err(SlskError::ConnectionRead(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("connection is {:?}", self.state()),
            )));
        }

        let mut buf = BytesMut::zeroed(n);
        let mut guard = self.reader.lock().await;
        let r = guard.as_mut().ok_or_else(|| {
            SlskError::InvalidOperation("connection no longer owns a socket".into())
        })?;

        let mut filled = 0usize;
        while filled < n {
            let got = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(SlskError::Cancelled("read".into()));
                },
                res = r.read(&mut buf[filled..]) => res.map_err(SlskError::ConnectionRead),
            };
            match got {
                Ok(0) => {
                    drop(guard);
                    self.disconnect("remote connection closed").await;
                    return Err(SlskError::ConnectionRead(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "remote connection closed",
                    )));
                },
                Ok(m) => {
                    filled += m;
                    self.touch();
                },
                Err(e) => {
                    drop(guard);
                    self.disconnect("read failed").await;
                    return Err(e);
                },
            }
        }
        Ok(buf.freeze())
    }

    /// Streams exactly `n` bytes into `sink` in read-buffer-sized chunks,
    /// awaiting the governor before each chunk and reporting progress after
    /// each.
    pub async fn read_to_stream<W>(
        self: &Arc<Self>,
        n: u64,
        sink: &mut W,
        governor: Option<&Governor>,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let chunk = self.cfg.read_buffer_size.max(1) as u64;
        let mut transferred = 0u64;
        while transferred < n {
            if cancel.is_cancelled() {
                return Err(SlskError::Cancelled("transfer read".into()));
            }
            if let Some(g) = governor {
                g(cancel.clone()).await;
            }
            let want = chunk.min(n - transferred) as usize;
            let bytes = self.read(want).await?;
            sink.write_all(&bytes)
                .await
                .map_err(SlskError::ConnectionWrite)?;
            transferred += bytes.len() as u64;
            if let Some(cb) = &self.events.on_data_read {
                cb(transferred, n);
            }
        }
        sink.flush().await.map_err(SlskError::ConnectionWrite)?;
        Ok(transferred)
    }

    /// Runs the message frame loop until the connection dies; each complete
    /// frame body (code included, length prefix stripped) is handed to
    /// `on_message`.
    pub async fn run_message_loop(self: Arc<Self>) {
        loop {
            let header = match self.read(4).await {
                Ok(b) => b,
                Err(e) => {
                    trace!(key = ?self.key, "message loop exiting: {e}");
                    return;
                },
            };
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len == 0 || len > MAX_FRAME_LEN {
                warn!(key = ?self.key, len, "invalid frame length, dropping connection");
                self.disconnect("invalid frame length").await;
                return;
            }
            let body = match self.read(len).await {
                Ok(b) => b,
                Err(e) => {
                    trace!(key = ?self.key, "message loop exiting: {e}");
                    return;
                },
            };
            if let Some(cb) = &self.events.on_message {
                cb(body);
            }
        }
    }

    fn spawn_watchdogs(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn.cancel.cancelled() => return,
                    _ = sleep(LIVENESS_TICK) => {},
                }
                if conn.state() != ConnectionState::Connected {
                    return;
                }
                if let Some(limit) = conn.inactivity
                    && conn.idle_for() > limit
                {
                    conn.disconnect("inactivity timeout").await;
                    return;
                }
                if conn.probe_remote_closed().await {
                    conn.disconnect("remote connection closed").await;
                    return;
                }
            }
        });
    }

    /// Best-effort liveness probe: peeks the socket when no reader is
    /// active. EOF means the remote side is gone.
    async fn probe_remote_closed(&self) -> bool {
        let Ok(mut guard) = self.reader.try_lock() else {
            // A read is in flight; it will notice the close itself.
            return false;
        };
        let Some(r) = guard.as_mut() else {
            return false;
        };
        let mut probe = [0u8; 1];
        matches!(
            tokio::time::timeout(Duration::from_millis(10), r.peek(&mut probe)).await,
            Ok(Ok(0))
        )
    }
}
