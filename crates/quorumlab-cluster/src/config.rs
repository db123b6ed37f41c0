//! Cluster configuration.

use std::path::PathBuf;
use std::time::Duration;

use quorumlab_store::{NodeId, TlsInfo};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ClusterError, Result};

/// Largest cluster that can be started.
pub const MAX_SIZE: usize = 7;

/// Default dial and request timeout for member clients.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default period of the background status refresh.
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Host every member listens on.
pub const MEMBER_HOST: &str = "127.0.0.1";

/// Configuration for a local cluster.
///
/// Member `n` (1-based) gets client port `root_port + 2(n-1)` and the next
/// port for peer traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of members to start.
    pub size: usize,

    /// Directory holding every member's data directory.
    pub root_dir: PathBuf,

    /// First client port.
    pub root_port: u16,

    /// Manual TLS for client listeners.
    #[serde(default)]
    pub client_tls: TlsInfo,

    /// Generate client certificates automatically.
    #[serde(default)]
    pub client_auto_tls: bool,

    /// Manual TLS for peer listeners.
    #[serde(default)]
    pub peer_tls: TlsInfo,

    /// Generate peer certificates automatically.
    #[serde(default)]
    pub peer_auto_tls: bool,

    /// Member clients call the node in-process instead of over its socket.
    #[serde(default)]
    pub embedded_client: bool,

    /// Dial and request timeout for member clients.
    pub dial_timeout: Duration,

    /// Period of the background status refresh.
    pub status_interval: Duration,

    /// Raft heartbeat interval for every member.
    pub heartbeat_interval_ms: u64,

    /// Raft election timeout range for every member.
    pub election_timeout_ms: (u64, u64),

    /// Root token; canceling it aborts waits and stops the status loop.
    #[serde(skip)]
    pub root: Option<CancellationToken>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            size: 3,
            root_dir: PathBuf::from("./quorumlab"),
            root_port: 2379,
            client_tls: TlsInfo::default(),
            client_auto_tls: false,
            peer_tls: TlsInfo::default(),
            peer_auto_tls: false,
            embedded_client: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            status_interval: DEFAULT_STATUS_INTERVAL,
            heartbeat_interval_ms: 100,
            election_timeout_ms: (300, 600),
            root: None,
        }
    }
}

impl ClusterConfig {
    /// Create a configuration for `size` members under `root_dir`.
    pub fn new(size: usize, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            size,
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    /// Set the first client port.
    pub fn with_root_port(mut self, port: u16) -> Self {
        self.root_port = port;
        self
    }

    /// Set manual client TLS.
    pub fn with_client_tls(mut self, tls: TlsInfo) -> Self {
        self.client_tls = tls;
        self
    }

    /// Request automatic client TLS.
    pub fn with_client_auto_tls(mut self, enabled: bool) -> Self {
        self.client_auto_tls = enabled;
        self
    }

    /// Set manual peer TLS.
    pub fn with_peer_tls(mut self, tls: TlsInfo) -> Self {
        self.peer_tls = tls;
        self
    }

    /// Request automatic peer TLS.
    pub fn with_peer_auto_tls(mut self, enabled: bool) -> Self {
        self.peer_auto_tls = enabled;
        self
    }

    /// Use in-process member clients.
    pub fn with_embedded_client(mut self, enabled: bool) -> Self {
        self.embedded_client = enabled;
        self
    }

    /// Set the member client dial timeout. Zero keeps the default.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = if timeout.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Set the background status refresh period.
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Set raft timings for every member.
    pub fn with_raft_timing(
        mut self,
        heartbeat_ms: u64,
        election_min_ms: u64,
        election_max_ms: u64,
    ) -> Self {
        self.heartbeat_interval_ms = heartbeat_ms;
        self.election_timeout_ms = (election_min_ms, election_max_ms);
        self
    }

    /// Scope the cluster to an existing root token.
    pub fn with_root(mut self, root: CancellationToken) -> Self {
        self.root = Some(root);
        self
    }

    /// Check size and TLS settings.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size > MAX_SIZE {
            return Err(ClusterError::Config(format!(
                "cluster size must be between 1 and {}, got {}",
                MAX_SIZE, self.size
            )));
        }
        check_tls("client", &self.client_tls, self.client_auto_tls)?;
        check_tls("peer", &self.peer_tls, self.peer_auto_tls)?;
        self.ports(self.size as NodeId)?;
        if self.status_interval.is_zero() {
            return Err(ClusterError::Config(
                "status interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Client and peer ports of member `id` (1-based).
    pub fn ports(&self, id: NodeId) -> Result<(u16, u16)> {
        let client = u64::from(self.root_port) + 2 * id.saturating_sub(1);
        let peer = client + 1;
        if peer > u64::from(u16::MAX) {
            return Err(ClusterError::Config(format!(
                "member {} does not fit in the port range starting at {}",
                id, self.root_port
            )));
        }
        Ok((client as u16, peer as u16))
    }
}

fn check_tls(channel: &str, manual: &TlsInfo, auto: bool) -> Result<()> {
    if !manual.is_empty() && auto {
        return Err(ClusterError::Config(format!(
            "choose either auto TLS or manual {} TLS",
            channel
        )));
    }
    // The nng crate builds its C library with NNG_ENABLE_TLS=OFF, so
    // tls+tcp:// listeners and TLS socket options always fail.
    if auto || !manual.is_empty() {
        return Err(ClusterError::Config(format!(
            "{} TLS is not supported: the nng transport is built without TLS",
            channel
        )));
    }
    Ok(())
}
