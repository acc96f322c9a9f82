use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use zeitwork_core::{ids, ipv4, protocol::ConfigResponse};
use zeitwork_db::images::ImageStore;
use zeitwork_db::notify;
use zeitwork_db::status::VmStatus;
use zeitwork_db::vms::{Vm, VmStore};
use zeitwork_reconciler::kernel::{KernelHandle, Reconcile};

use crate::config::AgentConfig;
use crate::logs::LogRegistry;
use crate::{disk, machine, netns, vsock_host};

/// Local cap on time from launch to the guest's ready signal.
const BOOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace between Ctrl-Alt-Del and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Fast poll while a VM is transitioning.
const TRANSITION_POLL: Duration = Duration::from_secs(2);

/// Liveness poll for running VMs.
const RUNNING_POLL: Duration = Duration::from_secs(10);

/// Everything the agent tracks about one materialized microVM.
struct MachineState {
    machine: machine::Machine,
    guest_ip: Ipv4Addr,
    ready: Arc<AtomicBool>,
    rpc_task: JoinHandle<()>,
    stop_requested_at: Option<Instant>,
}

/// The per-node agent: reconciles VM rows owned by this server against
/// actual local microVM state. All host state (TAP devices, working
/// directories, processes) is derivable from the database; losing it just
/// triggers re-materialization on the next reconcile.
#[derive(Clone)]
pub struct NodeAgent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    server_id: Uuid,
    pool: PgPool,
    vms: VmStore,
    images: ImageStore,
    logs: LogRegistry,
    machines: Mutex<HashMap<Uuid, MachineState>>,
}

impl NodeAgent {
    pub fn new(pool: PgPool, config: AgentConfig, server_id: Uuid, logs: LogRegistry) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                vms: VmStore::new(pool.clone()),
                images: ImageStore::new(pool.clone()),
                pool,
                config,
                server_id,
                logs,
                machines: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn logs(&self) -> &LogRegistry {
        &self.inner.logs
    }

    pub fn server_id(&self) -> Uuid {
        self.inner.server_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Summaries for the admin socket.
    pub async fn local_vms(&self) -> Result<Vec<Vm>> {
        self.inner.vms.list_for_server(self.inner.server_id).await
    }

    /// pending → starting: materialize the whole local footprint and boot.
    async fn start_vm(&self, vm: &Vm) -> Result<()> {
        let inner = &self.inner;
        let guest_ip = vm.guest_ipv4()?;
        let vm_dir = inner.config.vm_dir(&vm.id);

        let image = inner
            .images
            .get(vm.image_id)
            .await?
            .with_context(|| format!("Image {} not found for VM {}", vm.image_id, vm.id))?;
        let disk_image_key = image
            .disk_image_key
            .with_context(|| format!("Image {} has no disk image yet", image.id))?;

        tokio::fs::create_dir_all(&vm_dir).await?;

        // Host side of the guest RPC must be listening before boot;
        // Firecracker refuses guest connects to ports nobody owns.
        let ready = Arc::new(AtomicBool::new(false));
        let rpc_task = vsock_host::serve(
            vsock_host::VmRpc {
                vm_id: vm.id,
                config: ConfigResponse {
                    env: vm.env_variables.0.clone(),
                    ip_addr: ipv4::guest_cidr(guest_ip),
                    ip_gw: ipv4::host_peer_ip(guest_ip).to_string(),
                    hostname: format!("vm-{}", ids::short_id(&vm.id)),
                },
                logs: inner.logs.clone(),
                ready: Arc::clone(&ready),
            },
            &vm_dir,
        )
        .await?;

        let result: Result<machine::Machine> = async {
            netns::setup_vm_link(&vm.id, guest_ip).await?;
            let rootfs = disk::materialize(&inner.config.image_store, &disk_image_key, &vm_dir).await?;
            let manifest =
                machine::write_manifest(vm, &vm_dir, &rootfs, &machine::default_kernel()).await?;
            machine::launch(&inner.config.firecracker_bin, vm.id, &vm_dir, &manifest).await
        }
        .await;

        match result {
            Ok(m) => {
                inner.machines.lock().await.insert(
                    vm.id,
                    MachineState {
                        machine: m,
                        guest_ip,
                        ready,
                        rpc_task,
                        stop_requested_at: None,
                    },
                );
                inner.vms.transition(vm.id, VmStatus::Pending, VmStatus::Starting).await?;
                Ok(())
            }
            Err(e) => {
                rpc_task.abort();
                let _ = netns::teardown_vm_link(&vm.id, guest_ip).await;
                let _ = disk::cleanup(&vm_dir).await;
                Err(e)
            }
        }
    }

    /// Remove every host-side trace of a VM: process, RPC listener, TAP,
    /// NAT rules, working directory, log buffers.
    pub async fn teardown(&self, vm_id: Uuid, guest_ip: Option<Ipv4Addr>) {
        let inner = &self.inner;
        let state = inner.machines.lock().await.remove(&vm_id);

        let guest_ip = match (&state, guest_ip) {
            (Some(s), _) => Some(s.guest_ip),
            (None, ip) => ip,
        };

        if let Some(state) = state {
            state.rpc_task.abort();
            if state.machine.alive() {
                machine::kill(&state.machine);
            }
        }

        if let Some(ip) = guest_ip {
            if let Err(e) = netns::teardown_vm_link(&vm_id, ip).await {
                warn!(vm = %vm_id, error = %e, "TAP teardown failed");
            }
        }

        if let Err(e) = disk::cleanup(&inner.config.vm_dir(&vm_id)).await {
            warn!(vm = %vm_id, error = %e, "Workdir cleanup failed");
        }
        inner.logs.remove(vm_id).await;
    }

    /// Kill machines whose rows are gone or moved elsewhere (failover
    /// reassignment, soft delete).
    pub async fn sweep_orphans(&self) -> Result<()> {
        let rows = self.local_vms().await?;
        let owned: std::collections::HashSet<Uuid> = rows.iter().map(|vm| vm.id).collect();

        let stale: Vec<Uuid> = {
            let machines = self.inner.machines.lock().await;
            machines.keys().filter(|id| !owned.contains(id)).copied().collect()
        };

        for vm_id in stale {
            info!(vm = %vm_id, "Tearing down orphaned microVM");
            self.teardown(vm_id, None).await;
        }
        Ok(())
    }

    async fn publish_routes_changed(&self) {
        if let Err(e) = notify::publish(&self.inner.pool, notify::ROUTES_CHANNEL).await {
            warn!(error = %e, "Route change notification failed");
        }
    }
}

impl Reconcile for NodeAgent {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn reconcile(&self, id: Uuid) -> Result<Option<Duration>> {
        let inner = &self.inner;

        let row = inner.vms.get(id).await?;
        let Some(vm) = row.filter(|v| v.deleted_at.is_none() && v.server_id == inner.server_id)
        else {
            // Deleted or reassigned: leave no residue.
            self.teardown(id, None).await;
            return Ok(None);
        };

        match vm.status {
            VmStatus::Pending => {
                // A leftover footprint from a previous attempt (or a
                // failover re-run) is torn down before re-materializing.
                self.teardown(id, Some(vm.guest_ipv4()?)).await;
                self.start_vm(&vm).await?;
                Ok(Some(TRANSITION_POLL))
            }

            VmStatus::Starting => {
                let snapshot = {
                    let machines = inner.machines.lock().await;
                    machines.get(&id).map(|state| {
                        (
                            state.ready.load(Ordering::SeqCst),
                            state.machine.alive(),
                            state.machine.launched_at.elapsed() > BOOT_TIMEOUT,
                        )
                    })
                };
                let Some((ready, alive, expired)) = snapshot else {
                    // Agent restarted mid-boot: re-materialize.
                    inner.vms.transition(id, VmStatus::Starting, VmStatus::Pending).await?;
                    return Ok(Some(TRANSITION_POLL));
                };

                if ready {
                    if inner.vms.transition(id, VmStatus::Starting, VmStatus::Running).await? {
                        info!(vm = %id, "microVM is running");
                        self.publish_routes_changed().await;
                    }
                    Ok(Some(RUNNING_POLL))
                } else if !alive {
                    warn!(vm = %id, "microVM exited during boot");
                    inner.vms.transition(id, VmStatus::Starting, VmStatus::Failed).await?;
                    self.teardown(id, Some(vm.guest_ipv4()?)).await;
                    Ok(None)
                } else if expired {
                    warn!(vm = %id, "microVM boot timed out");
                    inner.vms.transition(id, VmStatus::Starting, VmStatus::Failed).await?;
                    self.teardown(id, Some(vm.guest_ipv4()?)).await;
                    Ok(None)
                } else {
                    Ok(Some(TRANSITION_POLL))
                }
            }

            VmStatus::Running => {
                let healthy = {
                    let machines = inner.machines.lock().await;
                    machines
                        .get(&id)
                        .map(|state| state.machine.alive() && netns::tap_exists(&id))
                        .unwrap_or(false)
                };
                if healthy {
                    Ok(Some(RUNNING_POLL))
                } else {
                    warn!(vm = %id, "Running microVM lost its process or TAP");
                    inner.vms.transition(id, VmStatus::Running, VmStatus::Failed).await?;
                    self.teardown(id, Some(vm.guest_ipv4()?)).await;
                    self.publish_routes_changed().await;
                    Ok(None)
                }
            }

            VmStatus::Stopping => {
                enum StopStep {
                    Finished,
                    SendShutdown(machine::Machine),
                    Kill(machine::Machine),
                    Wait,
                }

                // Decide under the lock, act after releasing it.
                let step = {
                    let mut machines = inner.machines.lock().await;
                    match machines.get_mut(&id) {
                        None => StopStep::Finished,
                        Some(state) if !state.machine.alive() => StopStep::Finished,
                        Some(state) => match state.stop_requested_at {
                            None => {
                                state.stop_requested_at = Some(Instant::now());
                                StopStep::SendShutdown(state.machine.clone())
                            }
                            Some(at) if at.elapsed() > STOP_GRACE => {
                                StopStep::Kill(state.machine.clone())
                            }
                            Some(_) => StopStep::Wait,
                        },
                    }
                };

                match step {
                    StopStep::Finished => {
                        self.teardown(id, Some(vm.guest_ipv4()?)).await;
                        if inner.vms.transition(id, VmStatus::Stopping, VmStatus::Stopped).await? {
                            info!(vm = %id, "microVM stopped");
                            self.publish_routes_changed().await;
                        }
                        Ok(None)
                    }
                    StopStep::SendShutdown(m) => {
                        if let Err(e) = machine::shutdown_graceful(&m).await {
                            warn!(vm = %id, error = %e, "Graceful shutdown failed, will kill");
                        }
                        Ok(Some(TRANSITION_POLL))
                    }
                    StopStep::Kill(m) => {
                        machine::kill(&m);
                        Ok(Some(TRANSITION_POLL))
                    }
                    StopStep::Wait => Ok(Some(TRANSITION_POLL)),
                }
            }

            VmStatus::Stopped | VmStatus::Failed => {
                // Terminal rows must leave no host residue.
                let has_state = inner.machines.lock().await.contains_key(&id);
                if has_state || netns::tap_exists(&id) {
                    self.teardown(id, Some(vm.guest_ipv4()?)).await;
                }
                Ok(None)
            }
        }
    }
}

/// Seed and re-seed the VM kernel from this server's rows, and clean up
/// orphans, until shutdown.
pub async fn watch_loop(
    agent: NodeAgent,
    handle: KernelHandle<NodeAgent>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(15));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }

        match agent.local_vms().await {
            Ok(rows) => {
                for vm in rows {
                    handle.schedule_if_untracked(vm.id, Duration::ZERO).await;
                }
            }
            Err(e) => warn!(error = %e, "VM row scan failed"),
        }

        if let Err(e) = agent.sweep_orphans().await {
            warn!(error = %e, "Orphan sweep failed");
        }
    }
}
