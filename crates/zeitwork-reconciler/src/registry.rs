use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use zeitwork_core::ids;
use zeitwork_db::servers::{Server, ServerStore};
use zeitwork_db::status::{ServerStatus, VmStatus};
use zeitwork_db::vms::VmStore;
use zeitwork_db::{LOCK_SERVER_FAILOVER, notify, try_advisory_lock};

/// Heartbeat cadence. Must stay comfortably under the 30-second liveness
/// window.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Failover sweep cadence.
pub const FAILOVER_INTERVAL: Duration = Duration::from_secs(15);

/// Stable identity of this physical server.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub id: Uuid,
    pub hostname: String,
    pub internal_ip: IpNetwork,
}

impl ServerIdentity {
    /// Load the persisted server id (or mint and persist a new one) and
    /// combine it with the configured hostname and internal address.
    pub fn load_or_create(state_dir: &Path, hostname: &str, internal_ip: IpNetwork) -> Result<Self> {
        let id_path = state_dir.join("server_id");
        let id = match std::fs::read_to_string(&id_path) {
            Ok(content) => content
                .trim()
                .parse()
                .with_context(|| format!("Corrupt server id file: {}", id_path.display()))?,
            Err(_) => {
                std::fs::create_dir_all(state_dir).with_context(|| {
                    format!("Failed to create state dir: {}", state_dir.display())
                })?;
                let id = ids::new_id();
                std::fs::write(&id_path, id.to_string())
                    .with_context(|| format!("Failed to persist server id: {}", id_path.display()))?;
                id
            }
        };

        Ok(Self {
            id,
            hostname: hostname.to_string(),
            internal_ip,
        })
    }
}

/// Register this server and return its row (with the allocated ip_range).
pub async fn register(store: &ServerStore, identity: &ServerIdentity) -> Result<Server> {
    let server = store
        .register(identity.id, &identity.hostname, identity.internal_ip)
        .await?;
    info!(
        server = %server.id,
        hostname = %server.hostname,
        ip_range = %server.ip_range,
        "Server registered"
    );
    Ok(server)
}

/// Run the heartbeat loop until shutdown. A missed beat makes the server
/// ineligible for placement after 30 s and a failover candidate after 60 s,
/// so failures here are logged and retried, never fatal.
pub async fn heartbeat_loop(
    store: ServerStore,
    server_id: Uuid,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                info!(server = %server_id, "Heartbeat loop stopping");
                return;
            }
        }
        if let Err(e) = store.heartbeat(server_id).await {
            warn!(server = %server_id, error = %e, "Heartbeat update failed");
        }
    }
}

/// Dead-server detection and VM evacuation.
///
/// One logical instance runs fleet-wide: each sweep takes the failover
/// advisory lock, so extra control-plane replicas reduce to hot standbys.
pub struct FailoverWorker {
    pool: PgPool,
    servers: ServerStore,
    vms: VmStore,
}

impl FailoverWorker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            servers: ServerStore::new(pool.clone()),
            vms: VmStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(FAILOVER_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    info!("Failover worker stopping");
                    return;
                }
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Failover sweep failed");
            }
        }
    }

    /// One sweep: under the advisory lock, mark lapsed servers dead and
    /// evacuate their VMs to live hosts.
    pub async fn sweep(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if !try_advisory_lock(&mut tx, LOCK_SERVER_FAILOVER).await? {
            // Another replica is sweeping.
            return Ok(());
        }

        let candidates = self.servers.failover_candidates().await?;
        let mut moved_any = false;

        for server in candidates {
            warn!(
                server = %server.id,
                hostname = %server.hostname,
                last_heartbeat = %server.last_heartbeat_at,
                "Server heartbeat lapsed, marking dead"
            );
            self.servers.set_status(server.id, ServerStatus::Dead).await?;

            for vm in self.vms.list_for_server(server.id).await? {
                if vm.status.is_terminal() {
                    continue;
                }
                match self.vms.reassign_with_placement(vm.id).await? {
                    Some(moved) => {
                        moved_any = true;
                        info!(
                            vm = %moved.id,
                            from = %server.id,
                            to = %moved.server_id,
                            ip = %moved.ip_address,
                            "VM evacuated"
                        );
                    }
                    None => {
                        warn!(
                            vm = %vm.id,
                            from = %server.id,
                            "No live server available for evacuation; VM marked failed"
                        );
                        self.vms.set_status(vm.id, VmStatus::Failed).await?;
                    }
                }
            }
        }

        // Holds until commit; sweeps are short.
        tx.commit().await?;

        if moved_any {
            notify::publish(&self.pool, notify::ROUTES_CHANNEL).await?;
        }
        Ok(())
    }
}
