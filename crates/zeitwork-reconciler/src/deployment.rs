use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use zeitwork_db::builds::{Build, BuildStore};
use zeitwork_db::deployments::{Deployment, DeploymentStore, STAGE_TIMEOUT_SECS};
use zeitwork_db::images::ImageStore;
use zeitwork_db::notify;
use zeitwork_db::status::{BuildStatus, DeploymentStatus, VmStatus};
use zeitwork_db::vms::{NewVm, Vm, VmStore};

use crate::kernel::Reconcile;

/// Poll cadence while a deployment is moving through its pipeline.
const ACTIVE_POLL: Duration = Duration::from_secs(5);

/// Cadence of the supersession self-check while running.
const RUNNING_POLL: Duration = Duration::from_secs(60);

/// The single next step for one deployment, decided from a consistent
/// snapshot of its rows. Pure so every branch is directly testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// pending: create the build row and enter building.
    CreateBuild,
    /// building/starting/stopping: nothing to do yet, poll again.
    Await,
    /// building, build successful: allocate a VM and enter starting.
    AllocateVm { image_id: Uuid },
    /// starting, VM running: enter running and supersede older deployments.
    PromoteRunning,
    /// running, a newer deployment took over: enter stopping.
    BeginStopping,
    /// stopping, VM gone or stopped: finish.
    CompleteStopped,
    /// Any stage: convert to failed with a user-visible reason.
    Fail { reason: String },
    /// running with no successor yet: keep watching at a slow cadence.
    Watch,
    /// Terminal; nothing left to do.
    Done,
}

fn stage_expired(entered: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match entered {
        Some(at) => (now - at).num_seconds() > STAGE_TIMEOUT_SECS,
        // No recorded entry time means the stage was entered this tick.
        None => false,
    }
}

/// Decide the next transition for a deployment. The caller supplies the
/// row snapshot; this function never touches the database.
pub fn decide(
    deployment: &Deployment,
    build: Option<&Build>,
    image_built: bool,
    vm: Option<&Vm>,
    superseded: bool,
    now: DateTime<Utc>,
) -> Action {
    match deployment.status {
        DeploymentStatus::Pending => Action::CreateBuild,

        DeploymentStatus::Building => {
            let Some(build) = build else {
                return Action::Fail {
                    reason: "build row disappeared".to_string(),
                };
            };
            match build.status {
                BuildStatus::Successful => match build.image_id {
                    Some(image_id) if image_built => Action::AllocateVm { image_id },
                    // Successful build with the disk key not yet visible is
                    // a transient read; the timeout still bounds it.
                    _ if stage_expired(deployment.building_at, now) => Action::Fail {
                        reason: "build produced no bootable image in time".to_string(),
                    },
                    _ => Action::Await,
                },
                BuildStatus::Failed => Action::Fail {
                    reason: build
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "build failed".to_string()),
                },
                BuildStatus::Pending | BuildStatus::Building => {
                    if stage_expired(deployment.building_at, now) {
                        Action::Fail {
                            reason: "build timed out".to_string(),
                        }
                    } else {
                        Action::Await
                    }
                }
            }
        }

        DeploymentStatus::Starting => {
            let Some(vm) = vm else {
                return Action::Fail {
                    reason: "vm row disappeared".to_string(),
                };
            };
            match vm.status {
                VmStatus::Running => Action::PromoteRunning,
                VmStatus::Failed | VmStatus::Stopped => Action::Fail {
                    reason: "vm failed to start".to_string(),
                },
                VmStatus::Pending | VmStatus::Starting | VmStatus::Stopping => {
                    if stage_expired(deployment.starting_at, now) {
                        Action::Fail {
                            reason: "vm boot timed out".to_string(),
                        }
                    } else {
                        Action::Await
                    }
                }
            }
        }

        DeploymentStatus::Running => {
            if superseded {
                Action::BeginStopping
            } else {
                Action::Watch
            }
        }

        DeploymentStatus::Stopping => match vm {
            None => Action::CompleteStopped,
            Some(vm) if vm.status == VmStatus::Stopped => Action::CompleteStopped,
            Some(_) => Action::Await,
        },

        DeploymentStatus::Stopped | DeploymentStatus::Failed => Action::Done,
    }
}

/// Drives the deployment FSM. One control-plane instance covers the fleet;
/// every transition is an optimistic compare-and-update, so a second
/// instance only produces harmless no-op updates.
pub struct DeploymentReconciler {
    pool: PgPool,
    deployments: DeploymentStore,
    builds: BuildStore,
    images: ImageStore,
    vms: VmStore,
}

impl DeploymentReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            deployments: DeploymentStore::new(pool.clone()),
            builds: BuildStore::new(pool.clone()),
            images: ImageStore::new(pool.clone()),
            vms: VmStore::new(pool.clone()),
            pool,
        }
    }

    async fn snapshot(
        &self,
        deployment: &Deployment,
    ) -> Result<(Option<Build>, bool, Option<Vm>, bool)> {
        let build = match deployment.build_id {
            Some(id) => self.builds.get(id).await?,
            None => None,
        };
        let image_built = match build.as_ref().and_then(|b| b.image_id) {
            Some(id) => self
                .images
                .get(id)
                .await?
                .map(|i| i.is_built())
                .unwrap_or(false),
            None => false,
        };
        let vm = match deployment.vm_id {
            Some(id) => self.vms.get(id).await?,
            None => None,
        };
        let superseded = if deployment.status == DeploymentStatus::Running {
            self.deployments
                .superseded_by_newer(deployment.project_id, deployment.id)
                .await?
        } else {
            false
        };
        Ok((build, image_built, vm, superseded))
    }

    /// Push a deployment's VM toward stopped, whatever state it is in.
    async fn stop_vm(&self, vm_id: Uuid) -> Result<()> {
        if let Some(vm) = self.vms.get(vm_id).await?
            && !vm.status.is_terminal()
            && vm.status != VmStatus::Stopping
        {
            self.vms.set_status(vm_id, VmStatus::Stopping).await?;
        }
        Ok(())
    }

    async fn apply(&self, deployment: &Deployment, action: Action) -> Result<Option<Duration>> {
        match action {
            Action::CreateBuild => {
                // Reuse a build left behind by an earlier partial attempt,
                // otherwise the retried transition would orphan it.
                let build = match deployment.build_id {
                    Some(id) => self.builds.get(id).await?,
                    None => None,
                };
                let build = match build {
                    Some(b) => b,
                    None => {
                        self.builds
                            .create(
                                deployment.organisation_id,
                                deployment.project_id,
                                &deployment.github_commit,
                                None,
                            )
                            .await?
                    }
                };
                self.deployments
                    .mark_building(deployment.id, build.id)
                    .await?;
                info!(deployment = %deployment.id, build = %build.id, "Deployment entered building");
                Ok(Some(ACTIVE_POLL))
            }

            Action::AllocateVm { image_id } => {
                let new = NewVm {
                    organisation_id: deployment.organisation_id,
                    image_id,
                    port: 8080,
                    vcpus: 1,
                    memory_mib: 512,
                    env_variables: vec!["PORT=8080".to_string()],
                };
                let Some(vm) = self.vms.allocate(&new).await? else {
                    // No live server right now: transient, retried by the
                    // kernel's error path.
                    anyhow::bail!("No live server available for VM placement");
                };
                let advanced = self
                    .deployments
                    .mark_starting(deployment.id, image_id, vm.id)
                    .await?;
                if !advanced {
                    // A concurrent actor moved the row first; release the
                    // VM we just allocated.
                    warn!(deployment = %deployment.id, vm = %vm.id, "Lost starting transition, releasing VM");
                    self.vms.set_status(vm.id, VmStatus::Stopping).await?;
                    self.vms.soft_delete(vm.id).await?;
                } else {
                    info!(deployment = %deployment.id, vm = %vm.id, server = %vm.server_id, "Deployment entered starting");
                }
                Ok(Some(ACTIVE_POLL))
            }

            Action::PromoteRunning => {
                if self.deployments.mark_running(deployment.id).await? {
                    info!(deployment = %deployment.id, "Deployment entered running");
                    // Supersede every older running deployment of the same
                    // project; higher id wins.
                    let older = self
                        .deployments
                        .older_running_ids(deployment.project_id, deployment.id)
                        .await?;
                    for old_id in older {
                        if self.deployments.mark_stopping(old_id).await? {
                            info!(deployment = %old_id, superseded_by = %deployment.id, "Deployment superseded");
                            if let Some(old) = self.deployments.get(old_id).await?
                                && let Some(vm_id) = old.vm_id
                            {
                                self.stop_vm(vm_id).await?;
                            }
                        }
                    }
                    notify::publish(&self.pool, notify::ROUTES_CHANNEL).await?;
                }
                Ok(Some(RUNNING_POLL))
            }

            Action::BeginStopping => {
                if self.deployments.mark_stopping(deployment.id).await? {
                    info!(deployment = %deployment.id, "Deployment entered stopping");
                    if let Some(vm_id) = deployment.vm_id {
                        self.stop_vm(vm_id).await?;
                    }
                    notify::publish(&self.pool, notify::ROUTES_CHANNEL).await?;
                }
                Ok(Some(ACTIVE_POLL))
            }

            Action::CompleteStopped => {
                if let Some(vm_id) = deployment.vm_id {
                    self.vms.soft_delete(vm_id).await?;
                }
                if self.deployments.mark_stopped(deployment.id).await? {
                    info!(deployment = %deployment.id, "Deployment stopped");
                }
                Ok(None)
            }

            Action::Fail { reason } => {
                if self.deployments.mark_failed(deployment.id, &reason).await? {
                    warn!(deployment = %deployment.id, reason = %reason, "Deployment failed");
                    if let Some(vm_id) = deployment.vm_id {
                        self.stop_vm(vm_id).await?;
                        self.vms.soft_delete(vm_id).await?;
                    }
                    notify::publish(&self.pool, notify::ROUTES_CHANNEL).await?;
                }
                Ok(None)
            }

            Action::Await => Ok(Some(ACTIVE_POLL)),
            Action::Watch => Ok(Some(RUNNING_POLL)),
            Action::Done => Ok(None),
        }
    }
}

impl Reconcile for DeploymentReconciler {
    fn name(&self) -> &'static str {
        "deployment"
    }

    async fn reconcile(&self, id: Uuid) -> Result<Option<Duration>> {
        let Some(deployment) = self.deployments.get(id).await? else {
            // Row gone: a concurrent actor removed it.
            return Ok(None);
        };
        if deployment.deleted_at.is_some() {
            return Ok(None);
        }

        let (build, image_built, vm, superseded) = self.snapshot(&deployment).await?;
        let action = decide(
            &deployment,
            build.as_ref(),
            image_built,
            vm.as_ref(),
            superseded,
            Utc::now(),
        );
        self.apply(&deployment, action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use zeitwork_core::ids;

    fn deployment(status: DeploymentStatus) -> Deployment {
        let now = Utc::now();
        Deployment {
            id: ids::new_id(),
            organisation_id: ids::new_id(),
            project_id: ids::new_id(),
            github_commit: "deadbeef".to_string(),
            status,
            build_id: None,
            image_id: None,
            vm_id: None,
            error_message: None,
            building_at: None,
            starting_at: None,
            running_at: None,
            stopping_at: None,
            stopped_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn build(status: BuildStatus, image_id: Option<Uuid>) -> Build {
        let now = Utc::now();
        Build {
            id: ids::new_id(),
            organisation_id: ids::new_id(),
            project_id: ids::new_id(),
            github_commit: "deadbeef".to_string(),
            github_branch: None,
            status,
            image_id,
            error_message: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn vm(status: VmStatus) -> Vm {
        let now = Utc::now();
        Vm {
            id: ids::new_id(),
            organisation_id: ids::new_id(),
            image_id: ids::new_id(),
            server_id: ids::new_id(),
            ip_address: "10.1.0.3/31".parse().unwrap(),
            port: 8080,
            vcpus: 1,
            memory_mib: 512,
            env_variables: sqlx::types::Json(vec![]),
            metadata: sqlx::types::Json(serde_json::json!({})),
            status,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_pending_creates_build() {
        let d = deployment(DeploymentStatus::Pending);
        assert_eq!(decide(&d, None, false, None, false, Utc::now()), Action::CreateBuild);
    }

    #[test]
    fn test_building_waits_while_build_runs() {
        let mut d = deployment(DeploymentStatus::Building);
        d.building_at = Some(Utc::now());
        let b = build(BuildStatus::Building, None);
        assert_eq!(
            decide(&d, Some(&b), false, None, false, Utc::now()),
            Action::Await
        );
    }

    #[test]
    fn test_building_advances_when_image_ready() {
        let mut d = deployment(DeploymentStatus::Building);
        d.building_at = Some(Utc::now());
        let image_id = ids::new_id();
        let b = build(BuildStatus::Successful, Some(image_id));
        assert_eq!(
            decide(&d, Some(&b), true, None, false, Utc::now()),
            Action::AllocateVm { image_id }
        );
    }

    #[test]
    fn test_building_fails_on_build_failure() {
        let mut d = deployment(DeploymentStatus::Building);
        d.building_at = Some(Utc::now());
        let mut b = build(BuildStatus::Failed, None);
        b.error_message = Some("compile error".to_string());
        let action = decide(&d, Some(&b), false, None, false, Utc::now());
        assert_eq!(
            action,
            Action::Fail {
                reason: "compile error".to_string()
            }
        );
    }

    #[test]
    fn test_building_times_out_after_stage_cap() {
        let mut d = deployment(DeploymentStatus::Building);
        let now = Utc::now();
        d.building_at = Some(now - TimeDelta::seconds(STAGE_TIMEOUT_SECS + 1));
        let b = build(BuildStatus::Building, None);
        assert_eq!(
            decide(&d, Some(&b), false, None, false, now),
            Action::Fail {
                reason: "build timed out".to_string()
            }
        );
    }

    #[test]
    fn test_building_not_timed_out_at_boundary() {
        let mut d = deployment(DeploymentStatus::Building);
        let now = Utc::now();
        d.building_at = Some(now - TimeDelta::seconds(STAGE_TIMEOUT_SECS));
        let b = build(BuildStatus::Building, None);
        assert_eq!(decide(&d, Some(&b), false, None, false, now), Action::Await);
    }

    #[test]
    fn test_building_fails_when_build_row_gone() {
        let d = deployment(DeploymentStatus::Building);
        assert!(matches!(
            decide(&d, None, false, None, false, Utc::now()),
            Action::Fail { .. }
        ));
    }

    #[test]
    fn test_starting_promotes_on_running_vm() {
        let mut d = deployment(DeploymentStatus::Starting);
        d.starting_at = Some(Utc::now());
        let v = vm(VmStatus::Running);
        assert_eq!(
            decide(&d, None, false, Some(&v), false, Utc::now()),
            Action::PromoteRunning
        );
    }

    #[test]
    fn test_starting_fails_on_vm_failure() {
        let mut d = deployment(DeploymentStatus::Starting);
        d.starting_at = Some(Utc::now());
        let v = vm(VmStatus::Failed);
        assert!(matches!(
            decide(&d, None, false, Some(&v), false, Utc::now()),
            Action::Fail { .. }
        ));
    }

    #[test]
    fn test_starting_times_out_on_stuck_vm() {
        let mut d = deployment(DeploymentStatus::Starting);
        let now = Utc::now();
        d.starting_at = Some(now - TimeDelta::seconds(STAGE_TIMEOUT_SECS + 1));
        let v = vm(VmStatus::Pending);
        assert_eq!(
            decide(&d, None, false, Some(&v), false, now),
            Action::Fail {
                reason: "vm boot timed out".to_string()
            }
        );
    }

    #[test]
    fn test_running_watches_without_successor() {
        let d = deployment(DeploymentStatus::Running);
        assert_eq!(decide(&d, None, false, None, false, Utc::now()), Action::Watch);
    }

    #[test]
    fn test_running_stops_when_superseded() {
        let d = deployment(DeploymentStatus::Running);
        assert_eq!(
            decide(&d, None, false, None, true, Utc::now()),
            Action::BeginStopping
        );
    }

    #[test]
    fn test_stopping_waits_for_vm() {
        let d = deployment(DeploymentStatus::Stopping);
        let v = vm(VmStatus::Stopping);
        assert_eq!(decide(&d, None, false, Some(&v), false, Utc::now()), Action::Await);
    }

    #[test]
    fn test_stopping_completes_on_stopped_vm() {
        let d = deployment(DeploymentStatus::Stopping);
        let v = vm(VmStatus::Stopped);
        assert_eq!(
            decide(&d, None, false, Some(&v), false, Utc::now()),
            Action::CompleteStopped
        );
    }

    #[test]
    fn test_stopping_completes_with_no_vm() {
        let d = deployment(DeploymentStatus::Stopping);
        assert_eq!(
            decide(&d, None, false, None, false, Utc::now()),
            Action::CompleteStopped
        );
    }

    #[test]
    fn test_terminal_states_are_done() {
        for status in [DeploymentStatus::Stopped, DeploymentStatus::Failed] {
            let d = deployment(status);
            assert_eq!(decide(&d, None, false, None, false, Utc::now()), Action::Done);
        }
    }

    #[test]
    fn test_decide_is_idempotent_without_external_change() {
        // Round-trip law: same snapshot, same decision.
        let mut d = deployment(DeploymentStatus::Building);
        d.building_at = Some(Utc::now());
        let b = build(BuildStatus::Building, None);
        let now = Utc::now();
        let first = decide(&d, Some(&b), false, None, false, now);
        let second = decide(&d, Some(&b), false, None, false, now);
        assert_eq!(first, second);
    }
}
