// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Owns every peer connection.
//!
//! Message connections (one per username) are acquired on demand and shared
//! by concurrent callers; establishment races a direct dial against a
//! server-mediated dial-back and keeps whichever becomes readable first.
//! Transfer connections are raw, unshared, and live only as long as one
//! download.

use std::{
    net::IpAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::{
        client::SoulseekClient,
        connection::{
            Connection, ConnectionEvents, ConnectionKey, ConnectionRole,
        },
    },
    error::{Result, SlskError},
    handlers,
    messages::{
        ConnectionType, ToMessage,
        codes::ServerCode,
        peer::init::{PeerInit, PierceFirewall},
        server::{
            requests::{ConnectToPeerRequest, GetPeerAddressRequest, ServerRequest},
            responses::{ConnectToPeerResponse, GetPeerAddressResponse},
        },
    },
    utils::next_token,
    waiter::{WaitKey, Waiter, local},
};

/// Key under which a transfer connection is handed from the manager to the
/// download waiting for it. The token is the one the peer echoes in the
/// first 4 bytes of the connection.
pub fn transfer_wait_key(username: &str, token: u32) -> WaitKey {
    WaitKey::new(local::TRANSFER_CONNECTION)
        .with(username)
        .with(token)
}

/// One slot per username; callers serialize through `gate` so concurrent
/// demand shares a single establishment attempt.
#[derive(Debug)]
struct PeerConnectionRecord {
    gate: Semaphore,
    held: Mutex<Option<HeldConnection>>,
}

#[derive(Debug)]
struct HeldConnection {
    conn: Arc<Connection>,
    /// Keeps the global concurrency slot for as long as the connection
    /// lives.
    _permit: Option<OwnedSemaphorePermit>,
}

impl PeerConnectionRecord {
    fn new() -> Arc<Self> {
        Arc::new(Self { gate: Semaphore::new(1), held: Mutex::new(None) })
    }
}

#[derive(Debug)]
pub struct PeerConnectionManager {
    cfg: Config,
    waiter: Arc<Waiter>,
    client: OnceCell<Weak<SoulseekClient>>,
    records: DashMap<String, Arc<PeerConnectionRecord>>,
    /// Global bound on live message connections.
    slots: Arc<Semaphore>,
    /// `token -> username` while an indirect attempt is in flight.
    pending_solicitations: DashMap<u32, String>,
    queued: AtomicUsize,
    cancel: CancellationToken,
}

impl PeerConnectionManager {
    pub fn new(cfg: Config, waiter: Arc<Waiter>, cancel: CancellationToken) -> Arc<Self> {
        let limit = cfg.concurrent_peer_message_connection_limit;
        Arc::new(Self {
            cfg,
            waiter,
            client: OnceCell::new(),
            records: DashMap::new(),
            slots: Arc::new(Semaphore::new(limit)),
            pending_solicitations: DashMap::new(),
            queued: AtomicUsize::new(0),
            cancel,
        })
    }

    /// Must be called once, right after the owning client is built.
    pub fn bind_client(&self, client: Weak<SoulseekClient>) {
        let _ = self.client.set(client);
    }

    fn client(&self) -> Result<Arc<SoulseekClient>> {
        self.client
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SlskError::InvalidOperation("client is shutting down".into()))
    }

    /// Live message connections.
    pub fn active(&self) -> usize {
        self.records.len()
    }

    /// Callers parked on the global concurrency semaphore.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Indirect solicitations still waiting for a dial-back.
    pub fn waiting(&self) -> usize {
        self.pending_solicitations.len()
    }

    /// Returns the message connection for `username`, establishing one if
    /// none is live. Concurrent callers for the same username share one
    /// attempt; the per-username map never holds more than one entry.
    pub async fn get_or_add_message_connection(
        self: &Arc<Self>,
        username: &str,
        endpoint: Option<(IpAddr, u16)>,
    ) -> Result<Arc<Connection>> {
        let record = self
            .records
            .entry(username.to_string())
            .or_insert_with(PeerConnectionRecord::new)
            .clone();

        let _gate = record
            .gate
            .acquire()
            .await
            .map_err(|_| SlskError::Cancelled("connection acquisition".into()))?;

        if let Some(held) = record.held.lock().await.as_ref()
            && held.conn.is_connected()
        {
            return Ok(Arc::clone(&held.conn));
        }

        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = Arc::clone(&self.slots).acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        let permit = permit
            .map_err(|_| SlskError::Cancelled("connection acquisition".into()))?;

        let endpoint = match endpoint {
            Some(e) => e,
            None => self.resolve_endpoint(username).await?,
        };
        let conn = self
            .establish(username, endpoint, ConnectionType::Peer)
            .await?;

        let mut slot = record.held.lock().await;
        if let Some(old) = slot.take() {
            old.conn.disconnect("superseded by a newer connection").await;
        }
        *slot = Some(HeldConnection { conn: Arc::clone(&conn), _permit: Some(permit) });
        Ok(conn)
    }

    /// Resolves a peer's listening endpoint through the server.
    pub async fn resolve_endpoint(&self, username: &str) -> Result<(IpAddr, u16)> {
        let client = self.client()?;
        let key = WaitKey::new(ServerCode::GetPeerAddress as u32).with(username);
        let fut = self
            .waiter
            .wait::<GetPeerAddressResponse>(key, None, &self.cancel);
        client
            .send_server(ServerRequest::GetPeerAddress(GetPeerAddressRequest {
                username: username.to_string(),
            }))
            .await?;
        let resp = fut.await?;
        if resp.is_offline() {
            return Err(SlskError::UserOffline(username.to_string()));
        }
        Ok((IpAddr::V4(resp.ip), resp.port as u16))
    }

    /// Opens a distributed message connection to a parent candidate. The
    /// caller (the distributed manager) owns the result.
    pub async fn establish_distributed(
        self: &Arc<Self>,
        username: &str,
        endpoint: Option<(IpAddr, u16)>,
    ) -> Result<Arc<Connection>> {
        let endpoint = match endpoint {
            Some(e) => e,
            None => self.resolve_endpoint(username).await?,
        };
        self.establish(username, endpoint, ConnectionType::Distributed)
            .await
    }

    /// Races the direct and indirect attempts; first readable connection
    /// wins, the loser is cancelled and disposed.
    async fn establish(
        self: &Arc<Self>,
        username: &str,
        endpoint: (IpAddr, u16),
        kind: ConnectionType,
    ) -> Result<Arc<Connection>> {
        let direct_cancel = self.cancel.child_token();
        let indirect_cancel = self.cancel.child_token();

        let mut direct = {
            let mgr = Arc::clone(self);
            let username = username.to_string();
            let cancel = direct_cancel.clone();
            tokio::spawn(async move {
                mgr.establish_direct(&username, endpoint, kind, cancel).await
            })
        };
        let mut indirect = {
            let mgr = Arc::clone(self);
            let username = username.to_string();
            let cancel = indirect_cancel.clone();
            tokio::spawn(
                async move { mgr.establish_indirect(&username, kind, cancel).await },
            )
        };

        let flatten = |r: std::result::Result<Result<Arc<Connection>>, tokio::task::JoinError>| {
            r.unwrap_or_else(|e| Err(SlskError::connection(format!("attempt panicked: {e}"))))
        };

        let winner = tokio::select! {
            d = &mut direct => match flatten(d) {
                Ok(conn) => {
                    indirect_cancel.cancel();
                    if let Ok(loser) = flatten(indirect.await) {
                        loser.disconnect("lost establishment race").await;
                    }
                    Ok(conn)
                },
                Err(e) => {
                    debug!(username, "direct connection failed: {e}");
                    flatten(indirect.await)
                },
            },
            i = &mut indirect => match flatten(i) {
                Ok(conn) => {
                    direct_cancel.cancel();
                    if let Ok(loser) = flatten(direct.await) {
                        loser.disconnect("lost establishment race").await;
                    }
                    Ok(conn)
                },
                Err(e) => {
                    debug!(username, "indirect connection failed: {e}");
                    flatten(direct.await)
                },
            },
        };

        winner.map_err(|cause| {
            SlskError::connection_caused(
                format!("failed to establish connection to {username}"),
                cause,
            )
        })
    }

    async fn establish_direct(
        self: &Arc<Self>,
        username: &str,
        endpoint: (IpAddr, u16),
        kind: ConnectionType,
        cancel: CancellationToken,
    ) -> Result<Arc<Connection>> {
        let client = self.client()?;
        let local_username = client.username()?;

        let conn = self.new_message_connection(username, endpoint, kind, cancel);
        conn.connect().await?;
        tokio::spawn(Arc::clone(&conn).run_message_loop());

        // Identify ourselves; this must be the first frame on the socket.
        let init = PeerInit {
            username: local_username,
            kind,
            token: next_token(),
        };
        conn.write_message(&init.to_message()).await?;
        Ok(conn)
    }

    async fn establish_indirect(
        self: &Arc<Self>,
        username: &str,
        kind: ConnectionType,
        cancel: CancellationToken,
    ) -> Result<Arc<Connection>> {
        let token = next_token();
        self.pending_solicitations
            .insert(token, username.to_string());

        let res: Result<TcpStream> = async {
            let key = WaitKey::new(local::INDIRECT_CONNECTION).with(token);
            let fut = self.waiter.wait::<TcpStream>(key, None, &cancel);
            let client = self.client()?;
            client
                .send_server(ServerRequest::ConnectToPeer(ConnectToPeerRequest {
                    token,
                    username: username.to_string(),
                    kind,
                }))
                .await?;
            fut.await
        }
        .await;
        self.pending_solicitations.remove(&token);

        let stream = res?;
        let conn = self.adopt_message_stream(username, kind, stream)?;
        Ok(conn)
    }

    fn role_for(kind: ConnectionType) -> ConnectionRole {
        match kind {
            ConnectionType::Peer => ConnectionRole::Peer,
            ConnectionType::Distributed => ConnectionRole::Distributed,
            ConnectionType::Transfer => ConnectionRole::Transfer,
        }
    }

    fn new_message_connection(
        self: &Arc<Self>,
        username: &str,
        endpoint: (IpAddr, u16),
        kind: ConnectionType,
        cancel: CancellationToken,
    ) -> Arc<Connection> {
        let role = Self::role_for(kind);
        let key = ConnectionKey::peer(username, endpoint.0, endpoint.1, role);
        let (events, rx) = self.message_events(username, role);
        let conn = Connection::new(key, self.cfg.connection.clone(), events, cancel);
        self.spawn_dispatcher(username, role, rx, Arc::clone(&conn));
        conn
    }

    /// Promotes an already-connected inbound socket to a message
    /// connection and starts its frame loop.
    fn adopt_message_stream(
        self: &Arc<Self>,
        username: &str,
        kind: ConnectionType,
        stream: TcpStream,
    ) -> Result<Arc<Connection>> {
        let role = Self::role_for(kind);
        let remote = stream
            .peer_addr()
            .map_err(SlskError::ConnectionRead)?;
        let key = ConnectionKey::peer(username, remote.ip(), remote.port(), role);
        let (events, rx) = self.message_events(username, role);
        let conn = Connection::from_stream(
            key,
            self.cfg.connection.clone(),
            events,
            self.cancel.child_token(),
            stream,
        );
        self.spawn_dispatcher(username, role, rx, Arc::clone(&conn));
        tokio::spawn(Arc::clone(&conn).run_message_loop());
        Ok(conn)
    }

    fn message_events(
        self: &Arc<Self>,
        username: &str,
        role: ConnectionRole,
    ) -> (ConnectionEvents, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        let uname = username.to_string();

        let events = ConnectionEvents {
            on_message: Some(Arc::new(move |body: Bytes| {
                let _ = tx.send(body);
            })),
            on_disconnected: Some(Arc::new(move |reason: &str| {
                let Some(mgr) = weak.upgrade() else { return };
                let uname = uname.clone();
                let reason = reason.to_string();
                tokio::spawn(async move {
                    mgr.on_connection_closed(&uname, role, &reason).await;
                });
            })),
            ..ConnectionEvents::default()
        };
        (events, rx)
    }

    /// Sequentially drains one connection's inbound messages, preserving
    /// their arrival order.
    fn spawn_dispatcher(
        self: &Arc<Self>,
        username: &str,
        role: ConnectionRole,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        conn: Arc<Connection>,
    ) {
        let weak = Arc::downgrade(self);
        let username = username.to_string();
        tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    _ = conn.cancel_token().cancelled() => return,
                    msg = rx.recv() => match msg {
                        Some(b) => b,
                        None => return,
                    },
                };
                let Some(mgr) = weak.upgrade() else { return };
                let Ok(client) = mgr.client() else { return };
                let res = match role {
                    ConnectionRole::Peer => {
                        handlers::peer::handle(&client, &username, &conn, body).await
                    },
                    ConnectionRole::Distributed => {
                        handlers::distributed::handle(&client, &username, body).await
                    },
                    _ => Ok(()),
                };
                if let Err(e) = res {
                    warn!(username = %username, "failed to handle peer message: {e}");
                }
            }
        });
    }

    async fn on_connection_closed(
        self: &Arc<Self>,
        username: &str,
        role: ConnectionRole,
        reason: &str,
    ) {
        // Everything waiting on this peer is doomed; fail it now rather
        // than letting it ride out the timeout.
        self.waiter.throw_matching(username, || {
            SlskError::connection(format!("connection to {username} closed: {reason}"))
        });

        match role {
            ConnectionRole::Peer => {
                if let Some(record) = self.records.get(username).map(|r| Arc::clone(r.value())) {
                    let mut slot = record.held.lock().await;
                    let dead = slot
                        .as_ref()
                        .map(|h| !h.conn.is_connected())
                        .unwrap_or(false);
                    if dead {
                        *slot = None;
                        drop(slot);
                        self.records.remove(username);
                    }
                }
            },
            ConnectionRole::Distributed => {
                if let Ok(client) = self.client() {
                    client
                        .distributed()
                        .handle_peer_disconnected(username, reason)
                        .await;
                }
            },
            _ => {},
        }
    }

    /// Inbound `PeerInit("P")`: the peer reached us first; adopt its socket
    /// as the message connection, superseding any prior one.
    pub async fn add_inbound_message_connection(
        self: &Arc<Self>,
        username: &str,
        stream: TcpStream,
    ) {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            warn!(username, "rejecting inbound message connection: no slots free");
            return;
        };
        let conn = match self.adopt_message_stream(username, ConnectionType::Peer, stream) {
            Ok(c) => c,
            Err(e) => {
                warn!(username, "failed to adopt inbound connection: {e}");
                return;
            },
        };
        let record = self
            .records
            .entry(username.to_string())
            .or_insert_with(PeerConnectionRecord::new)
            .clone();
        let mut slot = record.held.lock().await;
        if let Some(old) = slot.take() {
            old.conn.disconnect("superseded by a newer connection").await;
        }
        *slot = Some(HeldConnection { conn, _permit: Some(permit) });
        debug!(username, "adopted inbound message connection");
    }

    /// Inbound `PeerInit("D")`: a peer wants to become our distributed
    /// child; adopt the socket as a distributed message connection.
    pub fn adopt_distributed_inbound(
        self: &Arc<Self>,
        username: &str,
        stream: TcpStream,
    ) -> Result<Arc<Connection>> {
        self.adopt_message_stream(username, ConnectionType::Distributed, stream)
    }

    /// Server-relayed `ConnectToPeer("P")`: the peer could not reach us
    /// directly, so we dial them and answer their solicitation with a
    /// pierce. The result becomes their message connection.
    pub async fn add_solicited_message_connection(
        self: &Arc<Self>,
        response: &ConnectToPeerResponse,
    ) -> Result<()> {
        let conn = self.new_message_connection(
            &response.username,
            (IpAddr::V4(response.ip), response.port as u16),
            ConnectionType::Peer,
            self.cancel.child_token(),
        );
        conn.connect().await?;
        tokio::spawn(Arc::clone(&conn).run_message_loop());
        conn.write_message(&PierceFirewall { token: response.token }.to_message())
            .await?;

        let record = self
            .records
            .entry(response.username.clone())
            .or_insert_with(PeerConnectionRecord::new)
            .clone();
        let mut slot = record.held.lock().await;
        if let Some(old) = slot.take() {
            old.conn.disconnect("superseded by a newer connection").await;
        }
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok();
        *slot = Some(HeldConnection { conn, _permit: permit });
        Ok(())
    }

    /// Server-relayed `ConnectToPeer("D")`: a prospective child behind a
    /// firewall; dial them and pierce, then hand the connection to the
    /// distributed manager.
    pub async fn add_solicited_distributed_connection(
        self: &Arc<Self>,
        response: &ConnectToPeerResponse,
    ) -> Result<Arc<Connection>> {
        let conn = self.new_message_connection(
            &response.username,
            (IpAddr::V4(response.ip), response.port as u16),
            ConnectionType::Distributed,
            self.cancel.child_token(),
        );
        conn.connect().await?;
        tokio::spawn(Arc::clone(&conn).run_message_loop());
        conn.write_message(&PierceFirewall { token: response.token }.to_message())
            .await?;
        Ok(conn)
    }

    /// Inbound `PierceFirewall(token)`: hand the socket to whichever
    /// establishment attempt solicited it.
    pub async fn handle_pierce_firewall(&self, token: u32, stream: TcpStream) {
        if self.pending_solicitations.contains_key(&token) {
            let key = WaitKey::new(local::INDIRECT_CONNECTION).with(token);
            if self.waiter.complete(&key, stream) {
                debug!(token, "indirect dial-back matched");
                return;
            }
        }
        debug!(token, "dropping unsolicited pierce-firewall connection");
    }

    /// Inbound `PeerInit("F")`: a transfer connection. The 4-byte remote
    /// token that follows selects the download waiting for it; a token
    /// nobody waits for closes this socket and nothing else.
    pub async fn add_inbound_transfer_connection(
        self: &Arc<Self>,
        username: &str,
        mut stream: TcpStream,
    ) {
        let mut raw = [0u8; 4];
        let read = tokio::time::timeout(
            self.cfg.message_timeout,
            stream.read_exact(&mut raw),
        )
        .await;
        if !matches!(read, Ok(Ok(_))) {
            debug!(username, "transfer connection sent no token; dropping");
            return;
        }
        let remote_token = u32::from_le_bytes(raw);
        self.hand_off_transfer(username, remote_token, stream).await;
    }

    /// Server-relayed `ConnectToPeer("F")`: the peer cannot reach our
    /// listener, so we dial them, pierce, and read the token back.
    pub async fn handle_transfer_solicitation(
        self: &Arc<Self>,
        response: &ConnectToPeerResponse,
    ) -> Result<()> {
        let key = ConnectionKey::peer(
            &response.username,
            IpAddr::V4(response.ip),
            response.port as u16,
            ConnectionRole::Transfer,
        );
        let conn = Connection::new(
            key,
            self.cfg.connection.clone(),
            ConnectionEvents::default(),
            self.cancel.child_token(),
        );
        conn.connect().await?;
        conn.write_message(&PierceFirewall { token: response.token }.to_message())
            .await?;
        let raw = conn.read(4).await?;
        let remote_token = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

        let stream = conn.handoff_tcp_client().await?;
        self.hand_off_transfer(&response.username, remote_token, stream)
            .await;
        Ok(())
    }

    async fn hand_off_transfer(self: &Arc<Self>, username: &str, token: u32, stream: TcpStream) {
        let remote = match stream.peer_addr() {
            Ok(a) => a,
            Err(e) => {
                debug!(username, "transfer socket has no peer address: {e}");
                return;
            },
        };
        let key = ConnectionKey::peer(username, remote.ip(), remote.port(), ConnectionRole::Transfer);
        let conn = Connection::from_stream(
            key,
            self.cfg.connection.clone(),
            ConnectionEvents::default(),
            self.cancel.child_token(),
            stream,
        );
        let wkey = transfer_wait_key(username, token);
        if !self.waiter.complete(&wkey, Arc::clone(&conn)) {
            // A token nobody asked for must not fail an unrelated download.
            warn!(username, token, "transfer connection token matches no waiting download");
            conn.disconnect("unmatched transfer token").await;
        }
    }

    /// Registers interest in a transfer connection before the peer opens
    /// it. Resolution is unbounded; the download's own cancellation guards
    /// it.
    pub fn await_transfer_connection<'a>(
        &'a self,
        username: &str,
        token: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Arc<Connection>>> + 'a {
        self.waiter
            .wait_indefinitely::<Arc<Connection>>(transfer_wait_key(username, token), cancel)
    }

    /// Disconnects and forgets every held connection.
    pub async fn remove_all(&self) {
        let usernames: Vec<String> =
            self.records.iter().map(|e| e.key().clone()).collect();
        for username in usernames {
            if let Some((_, record)) = self.records.remove(&username) {
                let mut slot = record.held.lock().await;
                if let Some(held) = slot.take() {
                    held.conn.disconnect("client disconnected").await;
                }
            }
        }
        self.pending_solicitations.clear();
    }
}
