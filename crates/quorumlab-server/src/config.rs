//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use quorumlab_cluster::ClusterConfig;
use quorumlab_store::TlsInfo;

use crate::error::{Error, Result};

/// Default number of members.
pub const DEFAULT_SIZE: usize = 5;

/// Default first client port.
pub const DEFAULT_ROOT_PORT: u16 = 2379;

/// Default seconds between admitted stop or restart requests.
pub const DEFAULT_STOP_RESTART_INTERVAL_SECS: u64 = 3;

/// Default seconds between admitted add or remove requests.
pub const DEFAULT_MEMBERSHIP_INTERVAL_SECS: u64 = 5;

/// Default milliseconds between admitted writes.
pub const DEFAULT_WRITE_INTERVAL_MS: u64 = 500;

/// Default seconds between status reports in the log.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;

/// Minimum spacing of guarded requests, per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Between stop or restart requests.
    pub stop_restart: Duration,
    /// Between add or remove requests.
    pub membership: Duration,
    /// Between put or delete requests.
    pub write: Duration,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            stop_restart: Duration::from_secs(DEFAULT_STOP_RESTART_INTERVAL_SECS),
            membership: Duration::from_secs(DEFAULT_MEMBERSHIP_INTERVAL_SECS),
            write: Duration::from_millis(DEFAULT_WRITE_INTERVAL_MS),
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The cluster to run.
    pub cluster: ClusterConfig,

    /// Rate limits of disruptive operations.
    pub limits: LimitConfig,

    /// Period of the status report in the log. None disables it.
    pub report_interval: Option<Duration>,

    /// Read commands from stdin.
    pub console: bool,
}

impl ServerConfig {
    /// Create a configuration running `cluster`.
    pub fn new(cluster: ClusterConfig) -> Self {
        Self {
            cluster,
            limits: LimitConfig::default(),
            report_interval: Some(Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS)),
            console: true,
        }
    }

    /// Set the rate limits.
    pub fn with_limits(mut self, limits: LimitConfig) -> Self {
        self.limits = limits;
        self
    }

    /// Disable the stdin console.
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Disable the periodic status report.
    pub fn without_report(mut self) -> Self {
        self.report_interval = None;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            ClusterConfig::new(DEFAULT_SIZE, "./quorumlab-data").with_root_port(DEFAULT_ROOT_PORT),
        )
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "quorumlab-server")]
#[command(version, about = "Run a local quorumlab demo cluster", long_about = None)]
pub struct Args {
    /// Number of members (at most 7).
    #[arg(short, long, default_value_t = DEFAULT_SIZE)]
    pub size: usize,

    /// Directory for member data. Wiped on start and on shutdown.
    #[arg(short, long, default_value = "./quorumlab-data")]
    pub root_dir: PathBuf,

    /// First client port; member n uses root-port + 2(n-1) and the next port.
    #[arg(long, default_value_t = DEFAULT_ROOT_PORT)]
    pub root_port: u16,

    /// Call members in-process instead of over their client sockets.
    #[arg(long)]
    pub embedded_client: bool,

    /// Member client dial timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub dial_timeout_ms: u64,

    /// Status refresh period in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub status_interval_ms: u64,

    /// Client listener certificate.
    #[arg(long, requires = "client_key")]
    pub client_cert: Option<PathBuf>,

    /// Client listener private key.
    #[arg(long, requires = "client_cert")]
    pub client_key: Option<PathBuf>,

    /// CA used to verify clients.
    #[arg(long)]
    pub client_ca: Option<PathBuf>,

    /// Generate client certificates.
    #[arg(long)]
    pub client_auto_tls: bool,

    /// Peer listener certificate.
    #[arg(long, requires = "peer_key")]
    pub peer_cert: Option<PathBuf>,

    /// Peer listener private key.
    #[arg(long, requires = "peer_cert")]
    pub peer_key: Option<PathBuf>,

    /// CA used to verify peers.
    #[arg(long)]
    pub peer_ca: Option<PathBuf>,

    /// Generate peer certificates.
    #[arg(long)]
    pub peer_auto_tls: bool,

    /// Seconds between admitted stop or restart requests.
    #[arg(long, default_value_t = DEFAULT_STOP_RESTART_INTERVAL_SECS)]
    pub stop_restart_interval: u64,

    /// Seconds between admitted add or remove requests.
    #[arg(long, default_value_t = DEFAULT_MEMBERSHIP_INTERVAL_SECS)]
    pub membership_interval: u64,

    /// Milliseconds between admitted writes.
    #[arg(long, default_value_t = DEFAULT_WRITE_INTERVAL_MS)]
    pub write_interval_ms: u64,

    /// Seconds between status reports in the log. Set to 0 to disable.
    #[arg(long, default_value_t = DEFAULT_REPORT_INTERVAL_SECS)]
    pub report_interval: u64,

    /// Do not read commands from stdin.
    #[arg(long)]
    pub no_console: bool,
}

fn tls_info(
    channel: &str,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    ca: Option<PathBuf>,
) -> Result<TlsInfo> {
    match (cert, key) {
        (Some(cert), Some(key)) => {
            let tls = TlsInfo::new(cert, key);
            Ok(match ca {
                Some(ca) => tls.with_ca(ca),
                None => tls,
            })
        }
        (None, None) if ca.is_none() => Ok(TlsInfo::default()),
        _ => Err(Error::Config(format!(
            "{} TLS needs both a certificate and a key",
            channel
        ))),
    }
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> Result<ServerConfig> {
        let client_tls = tls_info("client", self.client_cert, self.client_key, self.client_ca)?;
        let peer_tls = tls_info("peer", self.peer_cert, self.peer_key, self.peer_ca)?;

        let cluster = ClusterConfig::new(self.size, self.root_dir)
            .with_root_port(self.root_port)
            .with_client_tls(client_tls)
            .with_client_auto_tls(self.client_auto_tls)
            .with_peer_tls(peer_tls)
            .with_peer_auto_tls(self.peer_auto_tls)
            .with_embedded_client(self.embedded_client)
            .with_dial_timeout(Duration::from_millis(self.dial_timeout_ms))
            .with_status_interval(Duration::from_millis(self.status_interval_ms));
        cluster.validate()?;

        let report_interval = if self.report_interval == 0 {
            None
        } else {
            Some(Duration::from_secs(self.report_interval))
        };

        Ok(ServerConfig {
            cluster,
            limits: LimitConfig {
                stop_restart: Duration::from_secs(self.stop_restart_interval),
                membership: Duration::from_secs(self.membership_interval),
                write: Duration::from_millis(self.write_interval_ms),
            },
            report_interval,
            console: !self.no_console,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["quorumlab-server"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.cluster.size, DEFAULT_SIZE);
        assert_eq!(config.cluster.root_port, DEFAULT_ROOT_PORT);
        assert!(config.cluster.client_tls.is_empty());
        assert_eq!(config.limits, LimitConfig::default());
        assert_eq!(
            config.report_interval,
            Some(Duration::from_secs(DEFAULT_REPORT_INTERVAL_SECS))
        );
        assert!(config.console);
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "quorumlab-server",
            "--size",
            "3",
            "--root-dir",
            "/tmp/lab",
            "--root-port",
            "3000",
            "--report-interval",
            "0",
            "--no-console",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.cluster.size, 3);
        assert_eq!(config.cluster.root_dir, PathBuf::from("/tmp/lab"));
        assert_eq!(config.cluster.root_port, 3000);
        assert!(config.cluster.peer_tls.is_empty());
        assert!(config.report_interval.is_none());
        assert!(!config.console);
    }

    #[test]
    fn test_tls_is_rejected() {
        let args = Args::parse_from([
            "quorumlab-server",
            "--peer-cert",
            "peer.pem",
            "--peer-key",
            "peer-key.pem",
            "--peer-ca",
            "ca.pem",
        ]);
        match args.into_config() {
            Err(Error::Cluster(e)) => assert!(e.to_string().contains("peer TLS is not supported")),
            other => panic!("expected a TLS refusal, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_conflicting_tls_is_rejected() {
        let args = Args::parse_from([
            "quorumlab-server",
            "--client-cert",
            "c.pem",
            "--client-key",
            "k.pem",
            "--client-auto-tls",
        ]);
        assert!(matches!(args.into_config(), Err(Error::Cluster(_))));

        let args = Args::parse_from(["quorumlab-server", "--client-ca", "ca.pem"]);
        assert!(matches!(args.into_config(), Err(Error::Config(_))));

        let args = Args::parse_from(["quorumlab-server", "--size", "9"]);
        assert!(args.into_config().is_err());
    }
}
