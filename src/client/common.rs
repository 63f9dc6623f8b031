// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SlskError};

/// Races an I/O future against its timeout and the connection's cancel
/// token. `map_err` converts the underlying I/O error into the right
/// taxonomy kind for the call site (read vs write vs connect).
pub(crate) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
    map_err: fn(std::io::Error) -> SlskError,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SlskError::Cancelled(label.to_string())),
        res = timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(map_err(e)),
                Err(_) => Err(SlskError::Timeout(label.to_string())),
            }
        }
    }
}

/// Caller-supplied pacing hook awaited before every data chunk a transfer
/// reads or writes.
pub type Governor =
    Arc<dyn Fn(CancellationToken) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
