use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};

use unitd_agent::config::{config_file_path, AgentConfig};
use unitd_agent::handler::{apply_push, SharedReconciler};
use unitd_agent::reconciler::{Reconciler, SYSTEMD_UNIT_DIR};
use unitd_agent::store::UnitStore;
use unitd_agent::systemd::Systemctl;
use unitd_protocol::protocol::KeyDiff;
use unitd_protocol::{tls, Server};

/// unitd - remote systemd reconciliation agent
#[derive(Parser)]
#[command(name = "unitd", about = "Agent that reconciles systemd units against a remotely pushed desired state")]
struct Args {
    /// Configuration file (overrides the UNITD_CONFIG_FILE environment variable)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config_file_path(args.config);
    let config = AgentConfig::load(&config_path)
        .with_context(|| format!("cannot load configuration from {:?}", config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log_level().into()),
        )
        .init();

    info!("Starting unitd agent");

    let store = UnitStore::load(config.units_config_path.clone())
        .context("cannot load units manifest")?;
    let reconciler: SharedReconciler = Arc::new(Mutex::new(Reconciler::new(
        store,
        PathBuf::from(SYSTEMD_UNIT_DIR),
        Arc::new(Systemctl),
    )));

    let tls = tls::server_config(
        &config.server.tls.ca_cert,
        &config.server.tls.server_cert,
        &config.server.tls.server_key,
    )
    .context("cannot build server TLS configuration")?;

    let addr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {:?}", config.bind_addr()))?;

    let handler = move |diff: KeyDiff| {
        let reconciler = Arc::clone(&reconciler);
        async move { apply_push(reconciler, diff).await }
    };

    let server = Server::bind(addr, tls, handler)
        .await
        .context("cannot start listener")?;
    info!("Listening on {}", server.local_addr());

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = sigterm.recv() => warn!("Caught SIGTERM. Terminating."),
            _ = tokio::signal::ctrl_c() => warn!("Caught SIGINT. Terminating."),
        }
        let _ = shutdown.send(()).await;
    });

    server.run().await.context("listener failed")?;
    info!("Shutdown complete");
    Ok(())
}
