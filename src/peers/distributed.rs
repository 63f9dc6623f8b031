// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Participation in the distributed search-propagation tree.
//!
//! The manager keeps at most one parent connection and a bounded set of
//! children. Branch info learned from the parent is pushed to every child;
//! search requests from the parent are rebroadcast verbatim. When the parent
//! goes away the branch info reverts to its defaults, the children are told,
//! and the server is asked for fresh candidates.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    net::IpAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinSet,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::Config,
    client::{client::SoulseekClient, connection::Connection},
    error::{Result, SlskError},
    messages::{
        ToMessage,
        codes::DistributedCode,
        distributed::{
            DistributedBranchLevel, DistributedBranchRoot, DistributedPing,
            DistributedSearchRequest,
        },
        server::{
            requests::{
                AcceptChildrenRequest, BranchLevelRequest, BranchRootRequest,
                ChildDepthRequest, HaveNoParentRequest, ServerRequest,
            },
            responses::{NetInfoResponse, ParentCandidate},
        },
    },
    peers::manager::PeerConnectionManager,
    waiter::{WaitKey, Waiter},
};

#[derive(Debug, Clone)]
struct Parent {
    username: String,
    conn: Arc<Connection>,
}

/// What a qualifying candidate hands back: its identity, the live
/// connection, and the three handshake messages.
type CandidateHandshake = (
    ParentCandidate,
    Arc<Connection>,
    u32,
    String,
    DistributedSearchRequest,
);

#[derive(Debug)]
pub struct DistributedManager {
    cfg: Config,
    waiter: Arc<Waiter>,
    peers: Arc<PeerConnectionManager>,
    client: OnceCell<Weak<SoulseekClient>>,

    parent: Mutex<Option<Parent>>,
    children: DashMap<String, Arc<Connection>>,
    branch_level: AtomicU32,
    branch_root: Mutex<String>,
    max_child_depth: AtomicU32,

    /// Server directives; retained for diagnostics and future candidacy
    /// decisions.
    parent_min_speed: AtomicU32,
    parent_speed_ratio: AtomicU32,

    /// Hash of the last status written to the server; unchanged status is
    /// not re-sent.
    last_status_hash: AtomicU64,
    /// Milliseconds since `epoch` of the last message from the parent.
    last_parent_activity_ms: AtomicU64,
    epoch: Instant,

    /// Serializes parent-selection rounds.
    selection_gate: Semaphore,
    cancel: CancellationToken,
}

impl DistributedManager {
    pub fn new(
        cfg: Config,
        waiter: Arc<Waiter>,
        peers: Arc<PeerConnectionManager>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            waiter,
            peers,
            client: OnceCell::new(),
            parent: Mutex::new(None),
            children: DashMap::new(),
            branch_level: AtomicU32::new(0),
            branch_root: Mutex::new(String::new()),
            max_child_depth: AtomicU32::new(0),
            parent_min_speed: AtomicU32::new(0),
            parent_speed_ratio: AtomicU32::new(0),
            last_status_hash: AtomicU64::new(0),
            last_parent_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            selection_gate: Semaphore::new(1),
            cancel,
        })
    }

    pub fn bind_client(&self, client: Weak<SoulseekClient>) {
        let _ = self.client.set(client);
    }

    fn client(&self) -> Result<Arc<SoulseekClient>> {
        self.client
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SlskError::InvalidOperation("client is shutting down".into()))
    }

    pub fn branch_level(&self) -> u32 {
        self.branch_level.load(Ordering::SeqCst)
    }

    pub async fn branch_root(&self) -> String {
        self.branch_root.lock().await.clone()
    }

    pub async fn has_parent(&self) -> bool {
        self.parent.lock().await.is_some()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn set_parent_min_speed(&self, v: u32) {
        self.parent_min_speed.store(v, Ordering::Relaxed);
    }

    pub fn set_parent_speed_ratio(&self, v: u32) {
        self.parent_speed_ratio.store(v, Ordering::Relaxed);
    }

    fn touch_parent(&self) {
        self.last_parent_activity_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn parent_idle_for(&self) -> Duration {
        let last = self.last_parent_activity_ms.load(Ordering::Relaxed);
        self.epoch
            .elapsed()
            .saturating_sub(Duration::from_millis(last))
    }

    /// Announces the initial "orphan looking for a parent" status after
    /// login.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.update_status().await
    }

    pub async fn stop(&self) {
        if let Some(parent) = self.parent.lock().await.take() {
            parent.conn.disconnect("client disconnected").await;
        }
        let children: Vec<(String, Arc<Connection>)> = self
            .children
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        self.children.clear();
        for (_, conn) in children {
            conn.disconnect("client disconnected").await;
        }
        self.branch_level.store(0, Ordering::SeqCst);
        self.branch_root.lock().await.clear();
        self.last_status_hash.store(0, Ordering::SeqCst);
    }

    // ─── parent selection ────────────────────────────────────────────────

    /// Server candidate list; triggers a selection round unless a parent is
    /// already held.
    pub async fn handle_net_info(self: &Arc<Self>, info: NetInfoResponse) {
        if self.has_parent().await {
            debug!("ignoring candidate list: parent already held");
            return;
        }
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = mgr.select_parent(info.parents).await {
                warn!("parent selection failed: {e}");
            }
        });
    }

    /// Attempts candidates concurrently up to the configured fan-out; the
    /// first to deliver branch level, branch root and an initial search
    /// request is adopted. Everyone else is disposed.
    async fn select_parent(self: &Arc<Self>, candidates: Vec<ParentCandidate>) -> Result<()> {
        let _round = self
            .selection_gate
            .acquire()
            .await
            .map_err(|_| SlskError::Cancelled("parent selection".into()))?;
        if self.has_parent().await {
            return Ok(());
        }

        let fanout = self.cfg.distributed.parent_candidate_fanout;
        let attempt_cancel = self.cancel.child_token();
        let mut set: JoinSet<Result<CandidateHandshake>> = JoinSet::new();

        for cand in candidates.into_iter().take(fanout) {
            let mgr = Arc::clone(self);
            let cancel = attempt_cancel.clone();
            set.spawn(async move { mgr.attempt_candidate(cand, cancel).await });
        }

        while let Some(joined) = set.join_next().await {
            let attempt = match joined {
                Ok(res) => res,
                Err(e) => {
                    warn!("candidate attempt panicked: {e}");
                    continue;
                },
            };
            match attempt {
                Ok((cand, conn, level, root, first_search)) => {
                    attempt_cancel.cancel();
                    self.adopt_parent(&cand.username, conn, level, root).await;
                    self.on_search_request(&cand.username, first_search).await;
                    // Dispose the stragglers.
                    while let Some(other) = set.join_next().await {
                        if let Ok(Ok((_, c, ..))) = other {
                            c.disconnect("parent already selected").await;
                        }
                    }
                    return Ok(());
                },
                Err(e) => debug!("parent candidate rejected: {e}"),
            }
        }

        info!("no parent candidate qualified; remaining orphaned");
        self.update_status().await
    }

    /// A candidate qualifies only by delivering all three of branch level,
    /// branch root, and a first search request within the message timeout.
    async fn attempt_candidate(
        self: &Arc<Self>,
        cand: ParentCandidate,
        cancel: CancellationToken,
    ) -> Result<CandidateHandshake> {
        let level_fut = self.waiter.wait::<u32>(
            WaitKey::new(DistributedCode::BranchLevel as u32).with(&cand.username),
            None,
            &cancel,
        );
        let root_fut = self.waiter.wait::<String>(
            WaitKey::new(DistributedCode::BranchRoot as u32).with(&cand.username),
            None,
            &cancel,
        );
        let search_fut = self.waiter.wait::<DistributedSearchRequest>(
            WaitKey::new(DistributedCode::SearchRequest as u32).with(&cand.username),
            None,
            &cancel,
        );

        let conn = self
            .peers
            .establish_distributed(
                &cand.username,
                Some((IpAddr::V4(cand.ip), cand.port as u16)),
            )
            .await?;

        match tokio::try_join!(level_fut, root_fut, search_fut) {
            Ok((level, root, search)) => Ok((cand, conn, level, root, search)),
            Err(e) => {
                conn.disconnect("candidate handshake incomplete").await;
                Err(e)
            },
        }
    }

    async fn adopt_parent(
        self: &Arc<Self>,
        username: &str,
        conn: Arc<Connection>,
        level: u32,
        root: String,
    ) {
        // A username can be a parent or a child, never both.
        if let Some((_, stale)) = self.children.remove(username) {
            stale.disconnect("promoted to parent").await;
        }

        *self.parent.lock().await = Some(Parent {
            username: username.to_string(),
            conn,
        });
        self.branch_level.store(level + 1, Ordering::SeqCst);
        info!(parent = username, level = level + 1, root = %root, "adopted distributed parent");
        *self.branch_root.lock().await = root;
        self.touch_parent();

        self.spawn_parent_watchdog();
        self.broadcast_branch_info().await;
        if let Err(e) = self.update_status().await {
            warn!("status update after adoption failed: {e}");
        }
    }

    fn spawn_parent_watchdog(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let limit = mgr.cfg.distributed.parent_watchdog;
            loop {
                tokio::select! {
                    _ = mgr.cancel.cancelled() => return,
                    _ = sleep(limit / 4) => {},
                }
                let Some(parent) = mgr.parent.lock().await.clone() else {
                    return;
                };
                if mgr.parent_idle_for() > limit {
                    warn!(parent = %parent.username, "parent went silent; dropping it");
                    parent.conn.disconnect("parent watchdog expired").await;
                    // The disconnect callback performs the orphaning.
                    return;
                }
            }
        });
    }

    /// Resets branch info, tells the children, and asks the server for new
    /// candidates.
    async fn orphan(&self, reason: &str) {
        info!(reason, "lost distributed parent");
        *self.parent.lock().await = None;
        self.branch_level.store(0, Ordering::SeqCst);
        self.branch_root.lock().await.clear();

        // Children must hear the reverted values before re-selection.
        self.broadcast_branch_info().await;
        if let Err(e) = self.update_status().await {
            warn!("status update after orphaning failed: {e}");
        }
    }

    // ─── children ────────────────────────────────────────────────────────

    fn has_child_slots(&self) -> bool {
        self.children.len() < self.cfg.concurrent_distributed_children_limit
    }

    /// Adopts an inbound child connection, pushing our current branch info
    /// to it immediately.
    pub async fn add_child(self: &Arc<Self>, username: &str, conn: Arc<Connection>) {
        if !self.has_child_slots() {
            conn.disconnect("no child slots free").await;
            return;
        }
        if let Some(parent) = self.parent.lock().await.as_ref()
            && parent.username == username
        {
            conn.disconnect("already our parent").await;
            return;
        }
        if let Some(old) = self.children.insert(username.to_string(), Arc::clone(&conn)) {
            old.disconnect("superseded by a newer connection").await;
        }
        debug!(username, children = self.children.len(), "added distributed child");

        let level = self.branch_level();
        let root = self.branch_root().await;
        if Self::send_branch_info(&conn, level, &root).await.is_err() {
            self.drop_child(username, "failed to send branch info").await;
        }
        if let Err(e) = self.update_status().await {
            warn!("status update after adding child failed: {e}");
        }
    }

    async fn drop_child(&self, username: &str, reason: &str) {
        if let Some((_, conn)) = self.children.remove(username) {
            conn.disconnect(reason).await;
        }
    }

    async fn send_branch_info(conn: &Arc<Connection>, level: u32, root: &str) -> Result<()> {
        conn.write_message(&DistributedBranchLevel { level }.to_message())
            .await?;
        conn.write_message(
            &DistributedBranchRoot { root: root.to_string() }.to_message(),
        )
        .await
    }

    /// Pushes the current branch info to every child; a child that cannot
    /// be written is disposed, nothing propagates.
    async fn broadcast_branch_info(&self) {
        let level = self.branch_level();
        let root = self.branch_root().await;
        let children: Vec<(String, Arc<Connection>)> = self
            .children
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (username, conn) in children {
            if Self::send_branch_info(&conn, level, &root).await.is_err() {
                self.drop_child(&username, "failed to send branch info").await;
            }
        }
    }

    // ─── inbound distributed messages ────────────────────────────────────

    pub async fn on_branch_level(&self, username: &str, level: u32) {
        if self.is_parent(username).await {
            self.touch_parent();
            self.branch_level.store(level + 1, Ordering::SeqCst);
            self.broadcast_branch_info().await;
            return;
        }
        let key = WaitKey::new(DistributedCode::BranchLevel as u32).with(username);
        self.waiter.complete(&key, level);
    }

    pub async fn on_branch_root(&self, username: &str, root: String) {
        if self.is_parent(username).await {
            self.touch_parent();
            *self.branch_root.lock().await = root;
            self.broadcast_branch_info().await;
            return;
        }
        let key = WaitKey::new(DistributedCode::BranchRoot as u32).with(username);
        self.waiter.complete(&key, root);
    }

    pub async fn on_search_request(&self, username: &str, req: DistributedSearchRequest) {
        if self.is_parent(username).await {
            self.touch_parent();
            self.rebroadcast_search(req).await;
            return;
        }
        // A candidate proving itself; failing that, a stray request.
        let key = WaitKey::new(DistributedCode::SearchRequest as u32).with(username);
        if !self.waiter.complete(&key, req) {
            debug!(username, "search request from a peer that is not our parent");
        }
    }

    async fn rebroadcast_search(&self, req: DistributedSearchRequest) {
        let msg = req.to_message();
        let children: Vec<(String, Arc<Connection>)> = self
            .children
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        for (username, conn) in children {
            if conn.write_message(&msg).await.is_err() {
                self.drop_child(&username, "failed to forward search").await;
            }
        }
    }

    pub async fn on_child_depth(&self, username: &str, depth: u32) {
        if !self.children.contains_key(username) {
            return;
        }
        self.max_child_depth.fetch_max(depth, Ordering::SeqCst);
        if let Err(e) = self.update_status().await {
            warn!("status update after child depth change failed: {e}");
        }
    }

    pub async fn on_ping(&self, username: &str) {
        if let Some(conn) = self.children.get(username).map(|e| Arc::clone(e.value())) {
            let _ = conn.write_message(&DistributedPing.to_message()).await;
        }
    }

    async fn is_parent(&self, username: &str) -> bool {
        self.parent
            .lock()
            .await
            .as_ref()
            .map(|p| p.username == username)
            .unwrap_or(false)
    }

    /// Distributed connection died; orphan or forget the child.
    pub async fn handle_peer_disconnected(&self, username: &str, reason: &str) {
        let was_parent = {
            let mut guard = self.parent.lock().await;
            match guard.as_ref() {
                Some(p) if p.username == username => {
                    *guard = None;
                    true
                },
                _ => false,
            }
        };
        if was_parent {
            // `orphan` re-locks, so the parent slot is cleared above.
            self.orphan(reason).await;
        } else if self.children.remove(username).is_some() {
            debug!(username, "distributed child disconnected");
            if let Err(e) = self.update_status().await {
                warn!("status update after losing child failed: {e}");
            }
        }
    }

    // ─── server status ───────────────────────────────────────────────────

    /// Writes the distributed status block to the server, but only when it
    /// materially changed since the last write.
    pub async fn update_status(&self) -> Result<()> {
        let has_parent = self.has_parent().await;
        let level = self.branch_level();
        let root = self.branch_root().await;
        let child_count = self.children.len();
        let accepting = has_parent && self.has_child_slots();
        let depth = if child_count == 0 {
            0
        } else {
            self.max_child_depth.load(Ordering::SeqCst) + 1
        };

        let mut hasher = DefaultHasher::new();
        (has_parent, level, &root, child_count, accepting, depth).hash(&mut hasher);
        let digest = hasher.finish();
        if self.last_status_hash.swap(digest, Ordering::SeqCst) == digest {
            return Ok(());
        }

        let client = self.client()?;
        client
            .send_server(ServerRequest::HaveNoParent(HaveNoParentRequest {
                have_no_parent: !has_parent,
            }))
            .await?;
        client
            .send_server(ServerRequest::BranchLevel(BranchLevelRequest { level }))
            .await?;
        client
            .send_server(ServerRequest::BranchRoot(BranchRootRequest { root }))
            .await?;
        client
            .send_server(ServerRequest::ChildDepth(ChildDepthRequest { depth }))
            .await?;
        client
            .send_server(ServerRequest::AcceptChildren(AcceptChildrenRequest {
                accept: accepting,
            }))
            .await?;
        debug!(has_parent, level, child_count, accepting, "distributed status written");
        Ok(())
    }
}
