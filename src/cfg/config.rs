// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::logger::LogConfig;

/// Well-known address of the central server. Overridable per config.
pub const DEFAULT_SERVER_ADDRESS: &str = "vps.slsknet.org";
pub const DEFAULT_SERVER_PORT: u16 = 2271;

/// Client configuration. The recognized keys are flat at the top level,
/// with one block each for socket behavior, the distributed tree, and the
/// logger; anything unrecognized is rejected rather than silently ignored.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_server_address")]
    pub server_address: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// TCP port announced to the server during login; peers behind our
    /// solicitations dial back here.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Disabling the listener makes indirect establishment impossible but is
    /// useful in tests.
    #[serde(default = "default_true")]
    pub listener_enabled: bool,
    /// Bound on every request/response wait against the server or a peer.
    #[serde(default = "default_message_timeout", with = "serde_secs")]
    pub message_timeout: Duration,
    /// Global bound on live peer message connections; excess demand queues.
    #[serde(default = "default_peer_connection_limit")]
    pub concurrent_peer_message_connection_limit: usize,
    /// How many distributed children we are willing to feed.
    #[serde(default = "default_children_limit")]
    pub concurrent_distributed_children_limit: usize,
    /// Per-connection socket behavior.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Distributed parent/child tree parameters.
    #[serde(default)]
    pub distributed: DistributedConfig,
    /// Logger section consumed by `cfg::logger`; carried here so one YAML
    /// file can hold the whole configuration.
    #[serde(default)]
    pub logger: Option<LogConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "default_connect_timeout", with = "serde_secs")]
    pub connect_timeout: Duration,
    /// A connection with no read or write activity for this long is torn
    /// down. The server connection ignores it.
    #[serde(default = "default_inactivity_timeout", with = "serde_secs")]
    pub inactivity_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DistributedConfig {
    /// How many parent candidates are raced concurrently.
    #[serde(default = "default_parent_fanout")]
    pub parent_candidate_fanout: usize,
    /// Silence from the parent longer than this triggers re-selection.
    #[serde(default = "default_parent_watchdog", with = "serde_secs")]
    pub parent_watchdog: Duration,
}

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}
fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}
fn default_message_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_listen_port() -> u16 {
    2234
}
fn default_true() -> bool {
    true
}
fn default_peer_connection_limit() -> usize {
    500
}
fn default_children_limit() -> usize {
    25
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_parent_fanout() -> usize {
    5
}
fn default_parent_watchdog() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_port: default_server_port(),
            listen_port: default_listen_port(),
            listener_enabled: true,
            message_timeout: default_message_timeout(),
            concurrent_peer_message_connection_limit: default_peer_connection_limit(),
            concurrent_distributed_children_limit: default_children_limit(),
            connection: ConnectionConfig::default(),
            distributed: DistributedConfig::default(),
            logger: None,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            connect_timeout: default_connect_timeout(),
            inactivity_timeout: default_inactivity_timeout(),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            parent_candidate_fanout: default_parent_fanout(),
            parent_watchdog: default_parent_watchdog(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.server_address.is_empty(),
            "server_address must not be empty"
        );
        ensure!(self.server_port != 0, "server_port must not be 0");
        ensure!(
            self.message_timeout >= Duration::from_secs(1),
            "message_timeout must be >= 1s"
        );
        ensure!(
            self.connection.connect_timeout >= Duration::from_secs(1),
            "connection.connect_timeout must be >= 1s"
        );
        ensure!(
            self.concurrent_peer_message_connection_limit >= 1,
            "concurrent_peer_message_connection_limit must be >= 1"
        );
        ensure!(
            self.concurrent_distributed_children_limit >= 1,
            "concurrent_distributed_children_limit must be >= 1"
        );
        ensure!(
            self.distributed.parent_candidate_fanout >= 1,
            "distributed.parent_candidate_fanout must be >= 1"
        );

        // Buffers below one frame header are useless; round them up quietly.
        self.connection.read_buffer_size = self.connection.read_buffer_size.max(1024);
        self.connection.write_buffer_size = self.connection.write_buffer_size.max(1024);

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
