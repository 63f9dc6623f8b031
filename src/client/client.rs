// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client façade: one long-lived server session plus the managers that
//! hang off it.
//!
//! All heavy lifting lives in the peer connection manager, the distributed
//! manager and the transfer engine; this type wires them together, owns the
//! server connection, and exposes the public operations.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU16, AtomicU32, Ordering},
    },
};

use bitflags::bitflags;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::AsyncWrite,
    net::lookup_host,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        connection::{Connection, ConnectionEvents, ConnectionKey},
        listener::{InboundHandler, Listener},
    },
    error::{Result, SlskError},
    handlers,
    messages::{
        ConnectionType, ToMessage,
        codes::{PeerCode, ServerCode},
        peer::{
            init::InboundInit,
            requests::{BrowseRequest, InfoRequest},
            responses::{BrowseResponse, InfoResponse, SearchResponse},
        },
        server::requests::{
            FileSearchRequest, LoginRequest, ServerRequest, SetListenPortRequest,
        },
        server::responses::LoginResponse,
    },
    peers::{distributed::DistributedManager, manager::PeerConnectionManager},
    transfers::{Transfer, TransferOptions, download::TransferEngine},
    utils::next_token,
    waiter::{WaitKey, Waiter},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientStates: u32 {
        const CONNECTED = 1 << 0;
        const LOGGED_IN = 1 << 1;
    }
}

/// A running search: responses stream out through the receiver handed to
/// the caller.
#[derive(Debug)]
pub struct Search {
    pub token: u32,
    pub responses: mpsc::UnboundedReceiver<SearchResponse>,
}

#[derive(Debug)]
pub struct SoulseekClient {
    cfg: Config,
    waiter: Arc<Waiter>,
    peers: Arc<PeerConnectionManager>,
    distributed: Arc<DistributedManager>,
    transfers: Arc<TransferEngine>,

    server: Mutex<Option<Arc<Connection>>>,
    state: AtomicU32,
    username: std::sync::Mutex<Option<String>>,
    /// Port the listener actually bound (differs from config when 0).
    bound_listen_port: AtomicU16,

    searches: DashMap<u32, mpsc::UnboundedSender<SearchResponse>>,

    /// Server directives recorded as they arrive.
    wishlist_interval: AtomicU32,
    search_inactivity_timeout: AtomicU32,

    /// Cancelled and replaced on every disconnect; every session-scoped
    /// task and wait hangs off it.
    session_cancel: std::sync::Mutex<CancellationToken>,
    root_cancel: CancellationToken,
}

impl SoulseekClient {
    pub fn new(cfg: Config) -> Arc<Self> {
        let waiter = Arc::new(Waiter::new(cfg.message_timeout));
        let root_cancel = CancellationToken::new();
        let peers = PeerConnectionManager::new(
            cfg.clone(),
            Arc::clone(&waiter),
            root_cancel.child_token(),
        );
        let distributed = DistributedManager::new(
            cfg.clone(),
            Arc::clone(&waiter),
            Arc::clone(&peers),
            root_cancel.child_token(),
        );
        let transfers = TransferEngine::new(
            cfg.clone(),
            Arc::clone(&waiter),
            Arc::clone(&peers),
        );

        let client = Arc::new(Self {
            cfg,
            waiter,
            peers,
            distributed,
            transfers,
            server: Mutex::new(None),
            state: AtomicU32::new(ClientStates::empty().bits()),
            username: std::sync::Mutex::new(None),
            bound_listen_port: AtomicU16::new(0),
            searches: DashMap::new(),
            wishlist_interval: AtomicU32::new(0),
            search_inactivity_timeout: AtomicU32::new(0),
            session_cancel: std::sync::Mutex::new(root_cancel.child_token()),
            root_cancel,
        });
        client.peers.bind_client(Arc::downgrade(&client));
        client.distributed.bind_client(Arc::downgrade(&client));
        client
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    pub fn peers(&self) -> &Arc<PeerConnectionManager> {
        &self.peers
    }

    pub fn distributed(&self) -> &Arc<DistributedManager> {
        &self.distributed
    }

    pub fn transfers(&self) -> &Arc<TransferEngine> {
        &self.transfers
    }

    pub fn state(&self) -> ClientStates {
        ClientStates::from_bits_truncate(self.state.load(Ordering::SeqCst))
    }

    /// Username we logged in with.
    pub fn username(&self) -> Result<String> {
        self.username
            .lock()
            .expect("username lock poisoned")
            .clone()
            .ok_or_else(|| SlskError::InvalidOperation("client is not logged in".into()))
    }

    pub fn listen_port(&self) -> u16 {
        self.bound_listen_port.load(Ordering::SeqCst)
    }

    pub fn wishlist_interval(&self) -> u32 {
        self.wishlist_interval.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wishlist_interval(&self, v: u32) {
        self.wishlist_interval.store(v, Ordering::Relaxed);
    }

    pub fn search_inactivity_timeout(&self) -> u32 {
        self.search_inactivity_timeout.load(Ordering::Relaxed)
    }

    pub(crate) fn set_search_inactivity_timeout(&self, v: u32) {
        self.search_inactivity_timeout.store(v, Ordering::Relaxed);
    }

    fn session_token(&self) -> CancellationToken {
        self.session_cancel
            .lock()
            .expect("session token lock poisoned")
            .clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.state().contains(ClientStates::CONNECTED) {
            return Err(SlskError::InvalidOperation("client is not connected".into()));
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if !state.contains(ClientStates::CONNECTED | ClientStates::LOGGED_IN) {
            return Err(SlskError::InvalidOperation(
                "client must be connected and logged in".into(),
            ));
        }
        Ok(())
    }

    // ─── session lifecycle ───────────────────────────────────────────────

    /// Opens the server session and starts the dial-back listener.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state().contains(ClientStates::CONNECTED) {
            return Err(SlskError::InvalidOperation("client is already connected".into()));
        }

        let session = self.root_cancel.child_token();
        *self
            .session_cancel
            .lock()
            .expect("session token lock poisoned") = session.clone();

        let addr = self.resolve_server_addr().await?;
        let (events, rx) = self.server_events();
        let conn = Connection::new(
            ConnectionKey::server(addr, self.cfg.server_port),
            self.cfg.connection.clone(),
            events,
            session.child_token(),
        );
        conn.connect().await?;
        tokio::spawn(Arc::clone(&conn).run_message_loop());
        self.spawn_server_dispatcher(rx, session.clone());

        if self.cfg.listener_enabled {
            let listener = Listener::bind(self.cfg.listen_port).await?;
            self.bound_listen_port
                .store(listener.local_port(), Ordering::SeqCst);
            listener.spawn(
                self.inbound_handler(),
                self.cfg.message_timeout,
                session.clone(),
            );
        }

        *self.server.lock().await = Some(conn);
        self.state
            .store(ClientStates::CONNECTED.bits(), Ordering::SeqCst);
        info!(server = %addr, port = self.cfg.server_port, "connected to server");
        Ok(())
    }

    async fn resolve_server_addr(&self) -> Result<IpAddr> {
        let host = (self.cfg.server_address.as_str(), self.cfg.server_port);
        let mut addrs = lookup_host(host).await.map_err(|e| {
            SlskError::connection(format!(
                "failed to resolve {}: {e}",
                self.cfg.server_address
            ))
        })?;
        addrs
            .find(|a| a.is_ipv4())
            .map(|a| a.ip())
            .ok_or_else(|| {
                SlskError::connection(format!(
                    "no IPv4 address for {}",
                    self.cfg.server_address
                ))
            })
    }

    fn server_events(self: &Arc<Self>) -> (ConnectionEvents, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);
        let events = ConnectionEvents {
            on_message: Some(Arc::new(move |body: Bytes| {
                let _ = tx.send(body);
            })),
            on_disconnected: Some(Arc::new(move |reason: &str| {
                let Some(client) = weak.upgrade() else { return };
                let reason = reason.to_string();
                tokio::spawn(async move {
                    client.handle_server_disconnected(&reason).await;
                });
            })),
            ..ConnectionEvents::default()
        };
        (events, rx)
    }

    fn spawn_server_dispatcher(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        session: CancellationToken,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    _ = session.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Some(b) => b,
                        None => return,
                    },
                };
                let Some(client) = weak.upgrade() else { return };
                if let Err(e) = handlers::server::handle(&client, body).await {
                    warn!("failed to handle server message: {e}");
                }
            }
        });
    }

    fn inbound_handler(self: &Arc<Self>) -> InboundHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |init, stream, remote| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(client) = weak.upgrade() else { return };
                debug!(%remote, ?init, "inbound peer connection");
                match init {
                    InboundInit::PeerInit(pi) => match pi.kind {
                        ConnectionType::Peer => {
                            client
                                .peers
                                .add_inbound_message_connection(&pi.username, stream)
                                .await;
                        },
                        ConnectionType::Transfer => {
                            client
                                .peers
                                .add_inbound_transfer_connection(&pi.username, stream)
                                .await;
                        },
                        ConnectionType::Distributed => {
                            match client.peers.adopt_distributed_inbound(&pi.username, stream) {
                                Ok(conn) => {
                                    client.distributed.add_child(&pi.username, conn).await;
                                },
                                Err(e) => {
                                    warn!(username = %pi.username, "failed to adopt child: {e}");
                                },
                            }
                        },
                    },
                    InboundInit::PierceFirewall(pf) => {
                        client.peers.handle_pierce_firewall(pf.token, stream).await;
                    },
                }
            })
        })
    }

    async fn handle_server_disconnected(self: &Arc<Self>, reason: &str) {
        if !self.state().contains(ClientStates::CONNECTED) {
            return;
        }
        warn!(reason, "server connection lost");
        self.disconnect(reason).await;
    }

    /// Tears the whole session down: server connection, peer connections,
    /// the distributed tree, every pending wait.
    pub async fn disconnect(self: &Arc<Self>, reason: &str) {
        let prev = self
            .state
            .swap(ClientStates::empty().bits(), Ordering::SeqCst);
        if ClientStates::from_bits_truncate(prev).is_empty() {
            return;
        }
        info!(reason, "disconnecting");

        self.session_token().cancel();
        self.waiter.cancel_all();
        self.transfers.shutdown();
        self.distributed.stop().await;
        self.peers.remove_all().await;
        self.searches.clear();

        if let Some(conn) = self.server.lock().await.take() {
            conn.disconnect(reason).await;
        }
        *self.username.lock().expect("username lock poisoned") = None;
    }

    // ─── server requests ─────────────────────────────────────────────────

    /// Writes one request on the server session.
    pub async fn send_server(&self, req: ServerRequest) -> Result<()> {
        let conn = self
            .server
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SlskError::InvalidOperation("client is not connected".into()))?;
        conn.write_message(&req.to_message()).await
    }

    /// Authenticates the session. A rejected login tears the connection
    /// down; the server stops talking to us afterwards.
    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> Result<()> {
        self.ensure_connected()?;
        if self.state().contains(ClientStates::LOGGED_IN) {
            return Err(SlskError::InvalidOperation("client is already logged in".into()));
        }
        if username.trim().is_empty() {
            return Err(SlskError::argument("username", "must not be blank"));
        }
        if password.is_empty() {
            return Err(SlskError::argument("password", "must not be empty"));
        }

        let session = self.session_token();
        let fut = self.waiter.wait::<LoginResponse>(
            WaitKey::new(ServerCode::Login as u32),
            None,
            &session,
        );
        self.send_server(ServerRequest::Login(LoginRequest::new(username, password)))
            .await?;
        let response = fut.await?;

        if !response.succeeded {
            let message = response.message;
            self.disconnect("login rejected").await;
            return Err(SlskError::InvalidOperation(format!(
                "login rejected: {message}"
            )));
        }

        *self.username.lock().expect("username lock poisoned") =
            Some(username.to_string());
        self.state
            .store((ClientStates::CONNECTED | ClientStates::LOGGED_IN).bits(), Ordering::SeqCst);
        info!(username, ip = ?response.ip, "logged in");

        let port = if self.cfg.listener_enabled {
            self.listen_port()
        } else {
            self.cfg.listen_port
        };
        self.send_server(ServerRequest::SetListenPort(SetListenPortRequest { port }))
            .await?;
        self.distributed.start().await?;
        Ok(())
    }

    // ─── peer operations ─────────────────────────────────────────────────

    /// Fetches the peer's shared-file listing.
    pub async fn browse(self: &Arc<Self>, username: &str) -> Result<BrowseResponse> {
        self.ensure_ready()?;
        if username.trim().is_empty() {
            return Err(SlskError::argument("username", "must not be blank"));
        }
        let session = self.session_token();
        let res: Result<BrowseResponse> = async {
            let conn = self
                .peers
                .get_or_add_message_connection(username, None)
                .await?;
            let fut = self.waiter.wait::<BrowseResponse>(
                WaitKey::new(PeerCode::BrowseResponse as u32).with(username),
                None,
                &session,
            );
            conn.write_message(&BrowseRequest.to_message()).await?;
            fut.await
        }
        .await;
        res.map_err(|e| {
            if e.is_terminal_signal() {
                e
            } else {
                SlskError::Browse { username: username.to_string(), source: Box::new(e) }
            }
        })
    }

    /// Fetches the peer's self-description.
    pub async fn user_info(self: &Arc<Self>, username: &str) -> Result<InfoResponse> {
        self.ensure_ready()?;
        if username.trim().is_empty() {
            return Err(SlskError::argument("username", "must not be blank"));
        }
        let session = self.session_token();
        let res: Result<InfoResponse> = async {
            let conn = self
                .peers
                .get_or_add_message_connection(username, None)
                .await?;
            let fut = self.waiter.wait::<InfoResponse>(
                WaitKey::new(PeerCode::InfoResponse as u32).with(username),
                None,
                &session,
            );
            conn.write_message(&InfoRequest.to_message()).await?;
            fut.await
        }
        .await;
        res.map_err(|e| {
            if e.is_terminal_signal() {
                e
            } else {
                SlskError::UserStatus { username: username.to_string(), source: Box::new(e) }
            }
        })
    }

    /// Starts a network-wide search; responses stream into the returned
    /// receiver until the search is stopped.
    pub async fn search(self: &Arc<Self>, query: &str) -> Result<Search> {
        self.ensure_ready()?;
        if query.trim().is_empty() {
            return Err(SlskError::argument("query", "must not be blank"));
        }
        let token = next_token();
        let (tx, rx) = mpsc::unbounded_channel();
        self.searches.insert(token, tx);

        let sent = self
            .send_server(ServerRequest::FileSearch(FileSearchRequest {
                token,
                query: query.to_string(),
            }))
            .await;
        if let Err(e) = sent {
            self.searches.remove(&token);
            return Err(SlskError::Search { token, source: Box::new(e) });
        }
        Ok(Search { token, responses: rx })
    }

    /// Forgets a running search; late responses are dropped.
    pub fn stop_search(&self, token: u32) {
        self.searches.remove(&token);
    }

    pub(crate) fn deliver_search_response(&self, response: SearchResponse) {
        let token = response.token;
        if let Some(tx) = self.searches.get(&token) {
            // A closed receiver just means the caller stopped listening.
            let _ = tx.send(response);
        } else {
            debug!(token, "search response for unknown token");
        }
    }

    /// Downloads `filename` from `username` into `sink`.
    pub async fn download<W>(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        sink: &mut W,
        start_offset: u64,
        token: Option<u32>,
        options: TransferOptions,
    ) -> Result<Transfer>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.ensure_ready()?;
        let cancel = self.session_token().child_token();
        self.transfers
            .download(username, filename, sink, start_offset, token, options, cancel)
            .await
    }

    /// Asks where a queued download sits in the peer's upload queue.
    pub async fn place_in_queue(self: &Arc<Self>, username: &str, filename: &str) -> Result<u32> {
        self.ensure_ready()?;
        let session = self.session_token();
        self.transfers
            .place_in_queue(username, filename, &session)
            .await
    }
}
