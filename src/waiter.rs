// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Correlates in-flight requests with asynchronous results.
//!
//! A wait is registered under a [`WaitKey`] before the request is written;
//! whoever decodes the matching inbound message later resolves it with
//! [`Waiter::complete`] (or [`Waiter::throw`] on failure). Multiple waiters
//! on the same key form a FIFO; one `complete` resolves exactly the head.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, SlskError};

/// A `Duration::ZERO` bound disables the timeout entirely.
async fn maybe_timeout<F: Future>(
    bound: Duration,
    fut: F,
) -> std::result::Result<F::Output, tokio::time::error::Elapsed> {
    if bound.is_zero() {
        Ok(fut.await)
    } else {
        tokio::time::timeout(bound, fut).await
    }
}

/// Wait identifiers for results that are not themselves wire messages
/// (connection handoffs). Kept far above the protocol code space.
pub mod local {
    /// A transfer connection handed off by the listener or the manager.
    pub const TRANSFER_CONNECTION: u32 = 0xF000_0001;
    /// An inbound dial-back answering one of our solicitations.
    pub const INDIRECT_CONNECTION: u32 = 0xF000_0002;
}

/// Ordered composite key: a message code plus zero or more string
/// discriminators (typically username and/or filename/token).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    code: u32,
    parts: Vec<String>,
}

impl WaitKey {
    pub fn new(code: u32) -> Self {
        Self { code, parts: Vec::new() }
    }

    pub fn with(mut self, part: impl ToString) -> Self {
        self.parts.push(part.to_string());
        self
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    /// True when any discriminator equals `part`; used to fail all waits
    /// tied to a peer when its connection dies.
    pub fn mentions(&self, part: &str) -> bool {
        self.parts.iter().any(|p| p == part)
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        for p in &self.parts {
            write!(f, ":{p}")?;
        }
        Ok(())
    }
}

type WaitValue = Box<dyn Any + Send>;

struct Resolver {
    id: u64,
    tx: oneshot::Sender<Result<WaitValue>>,
}

/// Unregisters a pending resolver when its wait future goes away, whatever
/// the reason: timeout, cancellation, or the future being dropped outright.
/// Removal after a normal resolution finds nothing and is a no-op.
struct SlotGuard<'w> {
    waiter: &'w Waiter,
    key: WaitKey,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.waiter.remove(&self.key, self.id);
    }
}

/// Thread-safe pending-result table. Enqueuing and resolving are
/// lock-protected at key granularity by the map's shards plus the per-key
/// queue.
pub struct Waiter {
    default_timeout: Duration,
    slots: DashMap<WaitKey, VecDeque<Resolver>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("default_timeout", &self.default_timeout)
            .field("pending_keys", &self.slots.len())
            .finish()
    }
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            slots: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of keys with at least one pending wait.
    pub fn pending_keys(&self) -> usize {
        self.slots.len()
    }

    fn enqueue(&self, key: &WaitKey) -> (u64, oneshot::Receiver<Result<WaitValue>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots
            .entry(key.clone())
            .or_default()
            .push_back(Resolver { id, tx });
        (id, rx)
    }

    /// Removes one specific pending resolver; used when a wait gives up on
    /// its own (timeout, cancellation) so the slot does not leak.
    fn remove(&self, key: &WaitKey, id: u64) {
        if let Some(mut entry) = self.slots.get_mut(key) {
            entry.retain(|r| r.id != id);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.slots.remove_if(key, |_, q| q.is_empty());
            }
        }
    }

    /// Waits for a result under `key`, bounded by `timeout` (the configured
    /// default when `None`, disabled when zero).
    ///
    /// The slot is registered before this returns, so the caller may write
    /// its request after calling `wait` and await the future later without
    /// racing the response. Dropping the returned future unregisters the
    /// slot; no orphan slots survive an abandoned wait.
    pub fn wait<T: Any + Send>(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<T>> + '_ {
        let bound = timeout.unwrap_or(self.default_timeout);
        let cancel = cancel.clone();
        let (id, rx) = self.enqueue(&key);
        trace!(%key, id, "wait registered");
        let guard = SlotGuard { waiter: self, key, id };

        async move {
            let key = &guard.key;
            tokio::select! {
                _ = cancel.cancelled() => {
                    Err(SlskError::Cancelled(format!("wait for {key}")))
                },
                res = maybe_timeout(bound, rx) => match res {
                    Ok(inner) => Self::unbox::<T>(key, inner),
                    Err(_) => Err(SlskError::Timeout(format!("wait for {key}"))),
                },
            }
        }
    }

    /// Waits with no time bound; resolution, cancellation or an explicit
    /// `throw` are the only exits.
    pub fn wait_indefinitely<T: Any + Send>(
        &self,
        key: WaitKey,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<T>> + '_ {
        self.wait(key, Some(Duration::ZERO), cancel)
    }

    fn unbox<T: Any + Send>(
        key: &WaitKey,
        inner: std::result::Result<Result<WaitValue>, oneshot::error::RecvError>,
    ) -> Result<T> {
        match inner {
            Ok(Ok(boxed)) => boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                SlskError::message_read(
                    Some(key.code()),
                    format!("wait for {key} resolved with an unexpected value type"),
                )
            }),
            Ok(Err(e)) => Err(e),
            // The resolver was dropped without sending: the waiter was
            // drained by cancel_all.
            Err(_) => Err(SlskError::Cancelled(format!("wait for {key}"))),
        }
    }

    /// Resolves the head waiter on `key`. A `complete` on an unknown key is
    /// a no-op: the message simply arrived after everyone gave up.
    pub fn complete<T: Any + Send>(&self, key: &WaitKey, value: T) -> bool {
        self.pop_head(key)
            .map(|r| r.tx.send(Ok(Box::new(value))).is_ok())
            .unwrap_or(false)
    }

    /// Fails the head waiter on `key` with `err`.
    pub fn throw(&self, key: &WaitKey, err: SlskError) -> bool {
        self.pop_head(key)
            .map(|r| r.tx.send(Err(err)).is_ok())
            .unwrap_or(false)
    }

    fn pop_head(&self, key: &WaitKey) -> Option<Resolver> {
        let mut entry = self.slots.get_mut(key)?;
        let head = entry.pop_front();
        let empty = entry.is_empty();
        drop(entry);
        if empty {
            self.slots.remove_if(key, |_, q| q.is_empty());
        }
        head
    }

    /// Fails every pending wait whose key mentions `part` (used when a peer
    /// connection dies: every wait keyed on that username is doomed).
    pub fn throw_matching(&self, part: &str, make_err: impl Fn() -> SlskError) {
        let doomed: Vec<WaitKey> = self
            .slots
            .iter()
            .filter(|e| e.key().mentions(part))
            .map(|e| e.key().clone())
            .collect();
        for key in doomed {
            if let Some((_, queue)) = self.slots.remove(&key) {
                for r in queue {
                    let _ = r.tx.send(Err(make_err()));
                }
            }
        }
    }

    /// Drains every pending wait tied to a specific key; all of them fail
    /// with `Cancelled`.
    pub fn cancel_key(&self, key: &WaitKey) {
        if let Some((k, queue)) = self.slots.remove(key) {
            for r in queue {
                let _ = r.tx.send(Err(SlskError::Cancelled(format!("wait for {k}"))));
            }
        }
    }

    /// Drains every pending wait; each fails with `Cancelled`.
    pub fn cancel_all(&self) {
        let keys: Vec<WaitKey> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((k, queue)) = self.slots.remove(&key) {
                for r in queue {
                    let _ = r.tx.send(Err(SlskError::Cancelled(format!("wait for {k}"))));
                }
            }
        }
    }
}
