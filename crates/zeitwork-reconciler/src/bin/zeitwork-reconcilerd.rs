use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use zeitwork_core::logging::{self, LogFormat};
use zeitwork_reconciler::certs::{CertManager, SelfSignedIssuer};
use zeitwork_reconciler::config::ReconcilerConfig;
use zeitwork_reconciler::deployment::DeploymentReconciler;
use zeitwork_reconciler::domain::{DnsTxtResolver, DomainReconciler};
use zeitwork_reconciler::kernel::{self, KernelConfig};
use zeitwork_reconciler::registry::FailoverWorker;

/// Cadence of the seed scans re-discovering rows that need reconciling.
const SEED_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "zeitwork-reconcilerd",
    about = "zeitwork control-plane reconciler daemon"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the deployment/domain reconcilers, failover worker, and
    /// certificate manager.
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
    let config = ReconcilerConfig::from_env()?;
    let pool = zeitwork_db::connect(&config.database_url).await?;
    info!(base_domain = %config.base_domain, "Reconciler starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Deployment FSM driver.
    let deployments = kernel::start(DeploymentReconciler::new(pool.clone()), KernelConfig::default());
    {
        let handle = deployments.clone();
        let store = zeitwork_db::deployments::DeploymentStore::new(pool.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SEED_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => return,
                }
                match store.active_ids().await {
                    Ok(ids) => {
                        for id in ids {
                            handle.schedule_if_untracked(id, Duration::ZERO).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Deployment seed scan failed"),
                }
            }
        });
    }

    // Domain verification driver.
    let resolver = DnsTxtResolver::from_system()?;
    let domains = kernel::start(
        DomainReconciler::new(
            pool.clone(),
            resolver,
            config.base_domain.clone(),
            config.platform_secret.clone(),
        ),
        KernelConfig::default(),
    );
    {
        let handle = domains.clone();
        let store = zeitwork_db::domains::DomainStore::new(pool.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SEED_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => return,
                }
                match store.unverified_ids().await {
                    Ok(ids) => {
                        for id in ids {
                            handle.schedule_if_untracked(id, Duration::ZERO).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "Domain seed scan failed"),
                }
            }
        });
    }

    // Dead-server detection, gated by its advisory lock.
    tokio::spawn(FailoverWorker::new(pool.clone()).run(shutdown_rx.clone()));

    // Wildcard + custom-domain certificates.
    let cert_manager = CertManager::new(
        pool.clone(),
        SelfSignedIssuer::default(),
        config.base_domain.clone(),
        config.cert_renew_before_days,
    );
    tokio::spawn(cert_manager.run(shutdown_rx.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    deployments.shutdown();
    domains.shutdown();

    Ok(())
}
