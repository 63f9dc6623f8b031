// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod download;

use std::{sync::Arc, time::SystemTime};

use bitflags::bitflags;

use crate::{client::common::Governor, messages::TransferDirection};

bitflags! {
    /// Composite transfer state. Exactly one phase flag is set while the
    /// transfer is live; a terminal flag is combined with `COMPLETED` once
    /// the transfer is finished.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferStates: u32 {
        const REQUESTED = 1 << 0;
        const QUEUED = 1 << 1;
        const INITIALIZING = 1 << 2;
        const IN_PROGRESS = 1 << 3;
        const COMPLETED = 1 << 4;
        const SUCCEEDED = 1 << 5;
        const CANCELLED = 1 << 6;
        const TIMED_OUT = 1 << 7;
        const ERRORED = 1 << 8;
        const REJECTED = 1 << 9;
    }
}

impl TransferStates {
    pub fn is_terminal(&self) -> bool {
        self.intersects(
            TransferStates::SUCCEEDED
                | TransferStates::CANCELLED
                | TransferStates::TIMED_OUT
                | TransferStates::ERRORED
                | TransferStates::REJECTED,
        )
    }
}

/// Point-in-time view of a transfer, cheap to clone and safe to hand to
/// callbacks.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub direction: TransferDirection,
    pub username: String,
    pub filename: String,
    pub token: u32,
    /// Total file size; zero until the peer has told us.
    pub size: u64,
    /// Resume offset the data phase starts from.
    pub start_offset: u64,
    pub state: TransferStates,
    pub bytes_transferred: u64,
    pub started_at: Option<SystemTime>,
    /// Bytes per second over the data phase so far.
    pub average_speed: f64,
}

impl Transfer {
    pub fn new(
        direction: TransferDirection,
        username: &str,
        filename: &str,
        token: u32,
        start_offset: u64,
    ) -> Self {
        Self {
            direction,
            username: username.to_string(),
            filename: filename.to_string(),
            token,
            size: 0,
            start_offset,
            state: TransferStates::empty(),
            bytes_transferred: 0,
            started_at: None,
            average_speed: 0.0,
        }
    }

    /// Bytes that still have to arrive; meaningful once `size` is known.
    pub fn remaining(&self) -> u64 {
        (self.size.saturating_sub(self.start_offset))
            .saturating_sub(self.bytes_transferred)
    }
}

pub type StateChangedFn = dyn Fn(TransferStates, &Transfer) + Send + Sync;
pub type ProgressFn = dyn Fn(&Transfer) + Send + Sync;

/// Per-download knobs supplied by the caller.
#[derive(Default, Clone)]
pub struct TransferOptions {
    /// Shut the sink down once the transfer completes.
    pub dispose_sink_on_completion: bool,
    /// Fired on every state transition with `(previous, snapshot)`.
    pub state_changed: Option<Arc<StateChangedFn>>,
    /// Fired after every data chunk.
    pub progress_updated: Option<Arc<ProgressFn>>,
    /// Awaited before every data chunk; the pacing hook.
    pub governor: Option<Governor>,
}

impl std::fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferOptions")
            .field("dispose_sink_on_completion", &self.dispose_sink_on_completion)
            .field("state_changed", &self.state_changed.is_some())
            .field("progress_updated", &self.progress_updated.is_some())
            .field("governor", &self.governor.is_some())
            .finish()
    }
}
