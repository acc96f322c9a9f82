use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use sqlx::PgPool;
use zeitwork_db::builds::{BUILD_TIMEOUT_SECS, BuildStore};
use zeitwork_db::images::ImageStore;
use zeitwork_db::projects::ProjectStore;
use zeitwork_db::status::BuildStatus;

use crate::builder::{BuildInput, BuildRunner};
use crate::kernel::Reconcile;

/// Poll cadence while waiting on a claim or an in-progress build.
const BUILD_POLL: Duration = Duration::from_secs(10);

/// Whether a build has exceeded the 30-minute hard cap.
pub fn building_timed_out(started_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match started_at {
        Some(at) => (now - at).num_seconds() > BUILD_TIMEOUT_SECS,
        None => false,
    }
}

/// Drives the build FSM on one server. Every server in the fleet runs one
/// of these; the atomic image claim decides who actually builds.
pub struct BuildReconciler<R: BuildRunner> {
    server_id: Uuid,
    registry: String,
    builds: BuildStore,
    images: ImageStore,
    projects: ProjectStore,
    runner: Arc<R>,
}

impl<R: BuildRunner> BuildReconciler<R> {
    pub fn new(pool: PgPool, server_id: Uuid, registry: String, runner: Arc<R>) -> Self {
        Self {
            server_id,
            registry,
            builds: BuildStore::new(pool.clone()),
            images: ImageStore::new(pool.clone()),
            projects: ProjectStore::new(pool),
            runner,
        }
    }

    /// Launch the claimed build in the background. The task, not the
    /// reconcile tick, owns the (up to 30-minute) builder invocation;
    /// reconciliation keeps observing row state meanwhile.
    fn spawn_builder(&self, build_id: Uuid, image_id: Uuid, input: BuildInput) {
        let builds = self.builds.clone();
        let images = self.images.clone();
        let runner = Arc::clone(&self.runner);
        let server_id = self.server_id;

        tokio::spawn(async move {
            let cap = Duration::from_secs(BUILD_TIMEOUT_SECS as u64);
            let outcome = tokio::time::timeout(cap, runner.build(&input)).await;

            let result: Result<()> = async {
                match outcome {
                    Ok(Ok(disk_image_key)) => {
                        images.complete(image_id, server_id, &disk_image_key).await?;
                        builds.mark_successful(build_id).await?;
                        info!(build = %build_id, key = %disk_image_key, "Build successful");
                    }
                    Ok(Err(e)) => {
                        images.release_claim(image_id, server_id).await?;
                        builds
                            .mark_failed(build_id, &format!("build failed: {}", e))
                            .await?;
                        warn!(build = %build_id, error = %e, "Build failed");
                    }
                    Err(_) => {
                        images.release_claim(image_id, server_id).await?;
                        builds
                            .mark_failed(build_id, "build timed out after 30 minutes")
                            .await?;
                        warn!(build = %build_id, "Build timed out");
                    }
                }
                Ok(())
            }
            .await;

            if let Err(e) = result {
                warn!(build = %build_id, error = %e, "Failed to record build outcome");
            }
        });
    }
}

impl<R: BuildRunner> Reconcile for BuildReconciler<R> {
    fn name(&self) -> &'static str {
        "build"
    }

    async fn reconcile(&self, id: Uuid) -> Result<Option<Duration>> {
        let Some(build) = self.builds.get(id).await? else {
            return Ok(None);
        };
        if build.deleted_at.is_some() {
            return Ok(None);
        }

        match build.status {
            BuildStatus::Pending => {
                let Some(project) = self.projects.get(build.project_id).await? else {
                    self.builds.mark_failed(id, "project no longer exists").await?;
                    return Ok(None);
                };

                let image = self
                    .images
                    .ensure(
                        build.organisation_id,
                        &self.registry,
                        &project.github_repository,
                        &build.github_commit,
                    )
                    .await?;

                if image.is_built() {
                    // Another build of the same commit already produced the
                    // disk image; nothing to run.
                    self.builds.mark_building(id, image.id).await?;
                    self.builds.mark_successful(id).await?;
                    info!(build = %id, image = %image.id, "Image already built, skipping");
                    return Ok(None);
                }

                if self.images.try_claim(image.id, self.server_id).await? {
                    if self.builds.mark_building(id, image.id).await? {
                        info!(build = %id, image = %image.id, "Claimed image, starting builder");
                        self.spawn_builder(
                            id,
                            image.id,
                            BuildInput {
                                repository: project.github_repository.clone(),
                                commit: build.github_commit.clone(),
                                tag: build.github_commit.clone(),
                                registry: self.registry.clone(),
                            },
                        );
                    } else {
                        // Row left pending under us; release so the actual
                        // owner can claim.
                        self.images.release_claim(image.id, self.server_id).await?;
                    }
                } else {
                    // Lost the claim race: sleep until the next tick and
                    // observe the winner's progress.
                    info!(build = %id, image = %image.id, "Image claimed elsewhere, waiting");
                }
                Ok(Some(BUILD_POLL))
            }

            BuildStatus::Building => {
                if let Some(image_id) = build.image_id
                    && let Some(image) = self.images.get(image_id).await?
                    && image.is_built()
                {
                    self.builds.mark_successful(id).await?;
                    return Ok(None);
                }

                if building_timed_out(build.started_at, Utc::now()) {
                    if let Some(image_id) = build.image_id {
                        self.images.release_claim(image_id, self.server_id).await?;
                    }
                    self.builds
                        .mark_failed(id, "build timed out after 30 minutes")
                        .await?;
                    return Ok(None);
                }

                Ok(Some(BUILD_POLL))
            }

            BuildStatus::Successful | BuildStatus::Failed => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_building_timeout_boundary() {
        let now = Utc::now();
        assert!(!building_timed_out(None, now));
        assert!(!building_timed_out(Some(now), now));
        assert!(!building_timed_out(
            Some(now - TimeDelta::seconds(BUILD_TIMEOUT_SECS)),
            now
        ));
        assert!(building_timed_out(
            Some(now - TimeDelta::seconds(BUILD_TIMEOUT_SECS + 1)),
            now
        ));
    }
}
