//! quorumlab server - run a local demo cluster.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quorumlab_server::{Args, Supervisor};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorumlab_server=info,quorumlab_cluster=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting quorumlab server");

    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    tracing::info!(
        size = config.cluster.size,
        root_dir = %config.cluster.root_dir.display(),
        root_port = config.cluster.root_port,
        embedded_client = config.cluster.embedded_client,
        "configuration loaded"
    );

    // The console task may be parked in a blocking stdin read, so exit
    // without waiting for the runtime to drain it.
    let code = match Supervisor::new(config).run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            1
        }
    };
    std::process::exit(code);
}
