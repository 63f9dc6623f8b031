// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Failure modes of the client core.
///
/// Operation-scope wrappers (`Browse`, `Search`, `Transfer`, ...) preserve
/// the underlying cause; `Timeout` and `Cancelled` always propagate unwrapped
/// so callers can tell "gave up" apart from "went wrong".
#[derive(Debug, Error)]
pub enum SlskError {
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<SlskError>>,
    },

    #[error("connection read error: {0}")]
    ConnectionRead(#[source] std::io::Error),

    #[error("connection write error: {0}")]
    ConnectionWrite(#[source] std::io::Error),

    #[error("malformed message (code {code:?}): {message}")]
    MessageRead {
        code: Option<u32>,
        message: String,
    },

    #[error("message compression error: {0}")]
    MessageCompression(#[source] std::io::Error),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("{0} cancelled")]
    Cancelled(String),

    #[error("user {0} is offline")]
    UserOffline(String),

    #[error("failed to browse user {username}")]
    Browse {
        username: String,
        #[source]
        source: Box<SlskError>,
    },

    #[error("failed to fetch info for user {username}")]
    UserStatus {
        username: String,
        #[source]
        source: Box<SlskError>,
    },

    #[error("search {token} failed")]
    Search {
        token: u32,
        #[source]
        source: Box<SlskError>,
    },

    #[error("transfer of {filename} from {username} failed")]
    Transfer {
        username: String,
        filename: String,
        #[source]
        source: Box<SlskError>,
    },

    #[error("transfer rejected by peer: {0}")]
    TransferRejected(String),

    #[error("token {0} is already in use by an active transfer")]
    DuplicateToken(u32),

    #[error("an active transfer of {filename} from {username} already exists")]
    DuplicateTransfer { username: String, filename: String },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid argument {name}: {reason}")]
    Argument { name: &'static str, reason: String },
}

impl SlskError {
    pub fn connection(message: impl Into<String>) -> Self {
        SlskError::Connection { message: message.into(), source: None }
    }

    pub fn connection_caused(message: impl Into<String>, cause: SlskError) -> Self {
        SlskError::Connection {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn message_read(code: Option<u32>, message: impl Into<String>) -> Self {
        SlskError::MessageRead { code, message: message.into() }
    }

    pub fn argument(name: &'static str, reason: impl Into<String>) -> Self {
        SlskError::Argument { name, reason: reason.into() }
    }

    /// True for the two kinds that must never be re-wrapped by
    /// operation-scope error mapping.
    pub fn is_terminal_signal(&self) -> bool {
        matches!(self, SlskError::Timeout(_) | SlskError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, SlskError>;
