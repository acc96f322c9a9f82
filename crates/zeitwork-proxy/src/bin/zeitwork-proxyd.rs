use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use zeitwork_core::logging::{self, LogFormat};
use zeitwork_db::cert_store::CertStore;
use zeitwork_proxy::config::ProxyConfig;
use zeitwork_proxy::routes::{self, RouteTable};
use zeitwork_proxy::server::{self, ProxyState};
use zeitwork_proxy::tls::StoreCertResolver;

#[derive(Parser)]
#[command(name = "zeitwork-proxyd", about = "zeitwork edge proxy daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the TLS edge and peer listeners.
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LogFormat::Json);

    match cli.command {
        Command::Serve => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(serve())
        }
    }
}

async fn serve() -> Result<()> {
    // Pin the crypto provider: dependencies enable more than one rustls
    // backend, and an ambiguous process default fails at handshake time.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("TLS crypto provider already installed"))?;

    let config = ProxyConfig::from_env()?;
    let pool = zeitwork_db::connect(&config.database_url).await?;
    info!(server = %config.server_id, "Edge proxy starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Routing table: initial build, then notification-driven refresh.
    let table = Arc::new(RouteTable::new());
    routes::rebuild(&pool, &table, config.server_id).await?;
    tokio::spawn(routes::refresh_loop(
        pool.clone(),
        Arc::clone(&table),
        config.server_id,
        shutdown_rx.clone(),
    ));

    // Certificate cache: initial load, then notification-driven refresh.
    let resolver = Arc::new(StoreCertResolver::new(config.base_domain.clone()));
    resolver.refresh(&CertStore::new(pool.clone())).await?;
    tokio::spawn(zeitwork_proxy::tls::refresh_loop(
        pool.clone(),
        Arc::clone(&resolver),
        shutdown_rx.clone(),
    ));

    let state = ProxyState::new(config, table);

    let tls_task = tokio::spawn(server::serve_tls(
        Arc::clone(&state),
        resolver,
        shutdown_rx.clone(),
    ));
    let peer_task = tokio::spawn(server::serve_peer(Arc::clone(&state), shutdown_rx.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = tls_task.await;
    let _ = peer_task.await;

    Ok(())
}
