// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The download engine: two-phase negotiation, transfer-connection
//! handoff, and the governed data phase.

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::SystemTime,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    client::connection::Connection,
    error::{Result, SlskError},
    messages::{
        ToMessage, TransferDirection,
        codes::PeerCode,
        peer::{
            requests::PlaceInQueueRequest,
            transfers::{
                REJECTION_FILE_NOT_SHARED, TransferRequest, TransferResponse,
            },
        },
    },
    peers::manager::{PeerConnectionManager, transfer_wait_key},
    transfers::{Transfer, TransferOptions, TransferStates},
    utils::next_token,
    waiter::{WaitKey, Waiter},
};

type SharedTransfer = Arc<Mutex<Transfer>>;

#[derive(Debug)]
pub struct TransferEngine {
    cfg: Config,
    waiter: Arc<Waiter>,
    peers: Arc<PeerConnectionManager>,
    /// Active downloads by token.
    downloads: DashMap<u32, SharedTransfer>,
    /// `(username, filename) -> token`, enforcing one active transfer per
    /// file per peer.
    by_file: DashMap<(String, String), u32>,
}

impl TransferEngine {
    pub fn new(
        cfg: Config,
        waiter: Arc<Waiter>,
        peers: Arc<PeerConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            waiter,
            peers,
            downloads: DashMap::new(),
            by_file: DashMap::new(),
        })
    }

    /// Snapshots of every active download.
    pub fn active_transfers(&self) -> Vec<Transfer> {
        self.downloads
            .iter()
            .map(|e| e.value().lock().expect("transfer lock poisoned").clone())
            .collect()
    }

    pub fn is_token_active(&self, token: u32) -> bool {
        self.downloads.contains_key(&token)
    }

    /// Downloads `filename` from `username` into `sink`, resuming from
    /// `start_offset`. Returns the final transfer snapshot once the data
    /// phase completes.
    #[allow(clippy::too_many_arguments)]
    pub async fn download<W>(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        sink: &mut W,
        start_offset: u64,
        token: Option<u32>,
        options: TransferOptions,
        cancel: CancellationToken,
    ) -> Result<Transfer>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if username.trim().is_empty() {
            return Err(SlskError::argument("username", "must not be blank"));
        }
        if filename.trim().is_empty() {
            return Err(SlskError::argument("filename", "must not be blank"));
        }

        let token = token.unwrap_or_else(next_token);
        let file_key = (username.to_string(), filename.to_string());

        // Uniqueness checks happen before any I/O.
        match self.by_file.entry(file_key.clone()) {
            Entry::Occupied(_) => {
                return Err(SlskError::DuplicateTransfer {
                    username: username.to_string(),
                    filename: filename.to_string(),
                });
            },
            Entry::Vacant(v) => {
                v.insert(token);
            },
        }
        let shared: SharedTransfer = Arc::new(Mutex::new(Transfer::new(
            TransferDirection::Download,
            username,
            filename,
            token,
            start_offset,
        )));
        match self.downloads.entry(token) {
            Entry::Occupied(_) => {
                self.by_file.remove(&file_key);
                return Err(SlskError::DuplicateToken(token));
            },
            Entry::Vacant(v) => {
                v.insert(Arc::clone(&shared));
            },
        }

        let res = self
            .run_download(&shared, username, filename, sink, start_offset, token, &options, &cancel)
            .await;

        self.by_file.remove(&file_key);
        self.downloads.remove(&token);

        match res {
            Ok(()) => Ok(shared.lock().expect("transfer lock poisoned").clone()),
            Err(e) => {
                let terminal = match &e {
                    SlskError::Timeout(_) => TransferStates::TIMED_OUT,
                    SlskError::Cancelled(_) => TransferStates::CANCELLED,
                    SlskError::TransferRejected(_) => TransferStates::REJECTED,
                    _ => TransferStates::ERRORED,
                };
                self.transition(&shared, &options, terminal);
                self.transition(&shared, &options, terminal | TransferStates::COMPLETED);
                match e {
                    SlskError::Timeout(_)
                    | SlskError::Cancelled(_)
                    | SlskError::TransferRejected(_) => Err(e),
                    cause => Err(SlskError::Transfer {
                        username: username.to_string(),
                        filename: filename.to_string(),
                        source: Box::new(cause),
                    }),
                }
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_download<W>(
        self: &Arc<Self>,
        shared: &SharedTransfer,
        username: &str,
        filename: &str,
        sink: &mut W,
        start_offset: u64,
        token: u32,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let conn = self
            .peers
            .get_or_add_message_connection(username, None)
            .await?;

        // Both waits go in before the request leaves, so neither the
        // response nor an eager transfer connection can slip past us.
        let response_key = WaitKey::new(PeerCode::TransferResponse as u32)
            .with(username)
            .with(token);
        let response_fut =
            self.waiter
                .wait::<TransferResponse>(response_key, None, cancel);
        let conn_fut = self
            .waiter
            .wait_indefinitely::<Arc<Connection>>(transfer_wait_key(username, token), cancel);

        conn.write_message(&TransferRequest::new_download(token, filename).to_message())
            .await?;
        self.transition(shared, options, TransferStates::REQUESTED);

        // An abandoned `conn_fut` unregisters itself when dropped.
        let response = response_fut.await?;

        let (transfer_conn, size) = match response {
            TransferResponse::Allowed { size, .. } => {
                self.update(shared, |t| t.size = size);
                self.transition(shared, options, TransferStates::INITIALIZING);
                let tc = conn_fut.await?;
                (tc, size)
            },
            TransferResponse::Rejected { message, .. } => {
                drop(conn_fut);
                if message == REJECTION_FILE_NOT_SHARED {
                    return Err(SlskError::TransferRejected(message));
                }
                debug!(username, filename, reason = %message, "download queued by peer");
                self.transition(shared, options, TransferStates::QUEUED);
                self.queued_handoff(shared, username, filename, start_offset, options, cancel)
                    .await?
            },
        };

        // Data phase. The resume offset is the first thing on the wire.
        transfer_conn
            .write(&(start_offset as i64).to_le_bytes())
            .await?;
        let expected = size.saturating_sub(start_offset);
        self.update(shared, |t| {
            t.started_at = Some(SystemTime::now());
        });
        self.transition(shared, options, TransferStates::IN_PROGRESS);

        let started = Instant::now();
        let progress_shared = Arc::clone(shared);
        let progress_cb = options.progress_updated.clone();
        let mut progress_sink = ProgressSink {
            inner: sink,
            on_chunk: move |n: u64| {
                let snapshot = {
                    let mut t = progress_shared.lock().expect("transfer lock poisoned");
                    t.bytes_transferred += n;
                    let secs = started.elapsed().as_secs_f64();
                    if secs > 0.0 {
                        t.average_speed = t.bytes_transferred as f64 / secs;
                    }
                    t.clone()
                };
                if let Some(cb) = &progress_cb {
                    cb(&snapshot);
                }
            },
        };

        let res = transfer_conn
            .read_to_stream(expected, &mut progress_sink, options.governor.as_ref(), cancel)
            .await;
        transfer_conn.disconnect("transfer finished").await;
        let received = res?;

        if options.dispose_sink_on_completion {
            sink.shutdown().await.map_err(SlskError::ConnectionWrite)?;
        }

        debug!(username, filename, received, "download complete");
        self.transition(shared, options, TransferStates::SUCCEEDED);
        self.transition(
            shared,
            options,
            TransferStates::SUCCEEDED | TransferStates::COMPLETED,
        );
        Ok(())
    }

    /// Queued path: wait (indefinitely) for the peer's unsolicited
    /// `TransferRequest`, grant it with our resume offset, and collect the
    /// transfer connection keyed by the peer's token.
    async fn queued_handoff(
        self: &Arc<Self>,
        shared: &SharedTransfer,
        username: &str,
        filename: &str,
        start_offset: u64,
        options: &TransferOptions,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Connection>, u64)> {
        let ready_key = WaitKey::new(PeerCode::TransferRequest as u32)
            .with(username)
            .with(filename);
        let ready: TransferRequest = self
            .waiter
            .wait_indefinitely(ready_key, cancel)
            .await?;

        let remote_token = ready.token;
        let size = ready.size.unwrap_or(0);
        self.update(shared, |t| t.size = size);
        self.transition(shared, options, TransferStates::INITIALIZING);

        // Register before granting; the peer may connect immediately.
        let conn_fut = self
            .waiter
            .wait_indefinitely::<Arc<Connection>>(transfer_wait_key(username, remote_token), cancel);

        // The message connection may have died during a long queue wait.
        let conn = self
            .peers
            .get_or_add_message_connection(username, None)
            .await?;
        let grant = TransferResponse::Allowed { token: remote_token, size: start_offset };
        conn.write_message(&grant.to_message()).await?;

        let tc = conn_fut.await?;
        Ok((tc, size))
    }

    fn update<F: FnOnce(&mut Transfer)>(&self, shared: &SharedTransfer, f: F) {
        f(&mut shared.lock().expect("transfer lock poisoned"));
    }

    /// Applies a state transition and fires the caller's callback with the
    /// previous state and the fresh snapshot.
    fn transition(&self, shared: &SharedTransfer, options: &TransferOptions, new: TransferStates) {
        let (prev, snapshot) = {
            let mut t = shared.lock().expect("transfer lock poisoned");
            let prev = t.state;
            if prev == new {
                return;
            }
            t.state = new;
            (prev, t.clone())
        };
        debug!(
            token = snapshot.token,
            from = ?prev,
            to = ?new,
            "transfer state changed"
        );
        if let Some(cb) = &options.state_changed {
            cb(prev, &snapshot);
        }
    }

    /// Asks the peer where a queued download sits in its upload queue.
    pub async fn place_in_queue(
        self: &Arc<Self>,
        username: &str,
        filename: &str,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let conn = self
            .peers
            .get_or_add_message_connection(username, None)
            .await?;
        let key = WaitKey::new(PeerCode::PlaceInQueueResponse as u32)
            .with(username)
            .with(filename);
        let fut = self
            .waiter
            .wait::<crate::messages::peer::responses::PlaceInQueueResponse>(key, None, cancel);
        conn.write_message(
            &PlaceInQueueRequest { filename: filename.to_string() }.to_message(),
        )
        .await?;
        Ok(fut.await?.place)
    }

    /// Clears the books on client disconnect. Running downloads are
    /// already failing through their session-scoped cancellation tokens.
    pub fn shutdown(&self) {
        if !self.downloads.is_empty() {
            warn!(active = self.downloads.len(), "abandoning active downloads");
        }
        self.downloads.clear();
        self.by_file.clear();
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }
}

/// Wraps the caller's sink to account bytes and fire progress callbacks as
/// chunks land.
struct ProgressSink<'a, W, F> {
    inner: &'a mut W,
    on_chunk: F,
}

impl<W, F> AsyncWrite for ProgressSink<'_, W, F>
where
    W: AsyncWrite + Unpin,
    F: FnMut(u64) + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut *this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                (this.on_chunk)(n as u64);
                Poll::Ready(Ok(n))
            },
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
