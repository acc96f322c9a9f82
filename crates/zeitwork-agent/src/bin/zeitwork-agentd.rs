use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use zeitwork_agent::config::AgentConfig;
use zeitwork_agent::logs::{self, LogRegistry};
use zeitwork_agent::reconcile::{self, NodeAgent};
use zeitwork_core::logging::{self, LogFormat};
use zeitwork_db::builds::BuildStore;
use zeitwork_db::servers::ServerStore;
use zeitwork_reconciler::build::BuildReconciler;
use zeitwork_reconciler::builder::ProcessBuildRunner;
use zeitwork_reconciler::kernel::{self, KernelConfig};
use zeitwork_reconciler::registry::{self, ServerIdentity};

/// Cadence of the build seed scan.
const BUILD_SEED_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "zeitwork-agentd", about = "zeitwork per-node microVM agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Register this server and run the VM and build reconcilers.
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
    let config = AgentConfig::from_env()?;
    let pool = zeitwork_db::connect(&config.database_url).await?;

    // Stable identity + registration (allocates this server's /20 on first
    // run).
    let identity =
        ServerIdentity::load_or_create(&config.state_dir, &config.hostname, config.internal_ip)?;
    let servers = ServerStore::new(pool.clone());
    let server = registry::register(&servers, &identity).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Heartbeat keeps this server eligible for placement.
    tokio::spawn(registry::heartbeat_loop(
        servers.clone(),
        server.id,
        shutdown_rx.clone(),
    ));

    // VM reconciler: rows with our server_id become running microVMs.
    let log_registry = LogRegistry::new();
    let agent = NodeAgent::new(pool.clone(), config.clone(), server.id, log_registry.clone());
    let vm_kernel = kernel::start(agent.clone(), KernelConfig::default());
    tokio::spawn(reconcile::watch_loop(
        agent.clone(),
        vm_kernel.clone(),
        shutdown_rx.clone(),
    ));

    // Build reconciler: claims unbuilt images fleet-wide and runs the
    // builder locally.
    let runner = Arc::new(ProcessBuildRunner::new(config.builder_bin.clone()));
    let build_kernel = kernel::start(
        BuildReconciler::new(pool.clone(), server.id, config.registry.clone(), runner),
        KernelConfig::default(),
    );
    {
        let handle = build_kernel.clone();
        let store = BuildStore::new(pool.clone());
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BUILD_SEED_INTERVAL);
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
                    Err(e) => warn!(error = %e, "Build seed scan failed"),
                }
            }
        });
    }

    // Log shipping to the external sink, when configured.
    if let Some(sink) = config.log_sink_url.clone() {
        tokio::spawn(logs::ship_loop(
            log_registry.clone(),
            sink,
            shutdown_rx.clone(),
        ));
    }

    // Admin socket: list/logs/attach.
    {
        let agent = agent.clone();
        let socket = config.admin_socket.clone();
        tokio::spawn(async move {
            if let Err(e) = zeitwork_agent::admin::serve(agent, &socket).await {
                warn!(error = %e, "Admin socket failed");
            }
        });
    }

    info!(server = %server.id, ip_range = %server.ip_range, "Agent ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    vm_kernel.shutdown();
    build_kernel.shutdown();

    Ok(())
}
