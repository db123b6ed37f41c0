//! Runs a cluster until the operator or a signal asks it to stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use quorumlab_cluster::{Cluster, MemberState};

use crate::config::ServerConfig;
use crate::console::{Command, CommandResult};
use crate::control::ControlPlane;
use crate::error::Result;

/// Owns the cluster, its control plane and the background tasks around it.
pub struct Supervisor {
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor for `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`Supervisor::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the cluster, serve until shutdown is requested, then tear down.
    pub async fn run(self) -> Result<()> {
        let signal = spawn_signal_handler(self.shutdown.clone());

        let cluster_config = self
            .config
            .cluster
            .clone()
            .with_root(self.shutdown.child_token());
        let cluster = match Cluster::start(cluster_config).await {
            Ok(cluster) => cluster,
            Err(e) => {
                signal.abort();
                return Err(e.into());
            }
        };
        let control = Arc::new(ControlPlane::new(cluster.clone(), &self.config.limits));

        for (i, endpoint) in cluster.all_endpoints(true).iter().enumerate() {
            tracing::info!(index = i, endpoint = %endpoint, "member ready");
        }

        let mut tasks = vec![signal];
        if let Some(period) = self.config.report_interval {
            tasks.push(spawn_reporter(cluster.clone(), period, self.shutdown.clone()));
        }
        if self.config.console {
            tasks.push(spawn_console(control.clone(), self.shutdown.clone()));
        }

        self.shutdown.cancelled().await;
        tracing::info!("shutting down cluster");

        let result = cluster.shutdown().await;
        for task in tasks {
            task.abort();
        }
        result?;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => tracing::info!("received shutdown signal"),
                    Err(e) => tracing::error!(error = %e, "failed to listen for ctrl+c"),
                }
                shutdown.cancel();
            }
        }
    })
}

fn spawn_reporter(
    cluster: Arc<Cluster>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => report(&cluster),
            }
        }
    })
}

fn report(cluster: &Cluster) {
    let statuses = cluster.all_member_status();
    let leader = statuses
        .iter()
        .find(|s| s.state == MemberState::Leader)
        .map(|s| s.name.as_str())
        .unwrap_or("none");
    let active = cluster.active_node_n();
    let quorum = cluster.quorum();
    if active < quorum {
        tracing::warn!(size = cluster.size(), active, quorum, leader, "cluster lost quorum");
    } else {
        tracing::info!(size = cluster.size(), active, quorum, leader, "cluster status");
    }
    for status in &statuses {
        tracing::debug!(
            member = %status.name,
            state = %status.state,
            db_size = %status.db_size_txt,
            hash = status.hash,
            "member status"
        );
    }
}

fn spawn_console(control: Arc<ControlPlane>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Type 'help' for commands.");
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::debug!("console input closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read console input");
                    break;
                }
            };

            let command = match Command::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(msg) => {
                    println!("{}", msg);
                    continue;
                }
            };
            match command.execute(&control).await {
                CommandResult::Continue => {}
                CommandResult::Output(out) => println!("{}", out),
                CommandResult::Exit => {
                    shutdown.cancel();
                    break;
                }
            }
        }
    })
}
