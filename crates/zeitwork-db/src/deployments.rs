use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use zeitwork_core::ids;

use crate::status::DeploymentStatus;

/// Per-stage cap: a deployment stuck in building or starting longer than
/// this is failed.
pub const STAGE_TIMEOUT_SECS: i64 = 10 * 60;

#[derive(Debug, Clone, FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub github_commit: String,
    pub status: DeploymentStatus,
    pub build_id: Option<Uuid>,
    pub image_id: Option<Uuid>,
    pub vm_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub building_at: Option<DateTime<Utc>>,
    pub starting_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub stopping_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const DEPLOYMENT_COLUMNS: &str = "id, organisation_id, project_id, github_commit, status, build_id, image_id, vm_id, \
     error_message, building_at, starting_at, running_at, stopping_at, stopped_at, failed_at, \
     created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct DeploymentStore {
    pool: PgPool,
}

impl DeploymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        organisation_id: Uuid,
        project_id: Uuid,
        github_commit: &str,
    ) -> Result<Deployment> {
        let deployment = sqlx::query_as::<_, Deployment>(&format!(
            r#"
            INSERT INTO deployments (id, organisation_id, project_id, github_commit)
            VALUES ($1, $2, $3, $4)
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(ids::new_id())
        .bind(organisation_id)
        .bind(project_id)
        .bind(github_commit)
        .fetch_one(&self.pool)
        .await?;
        Ok(deployment)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Deployment>> {
        let deployment = sqlx::query_as::<_, Deployment>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(deployment)
    }

    /// pending → building, attaching the created build row.
    pub async fn mark_building(&self, id: Uuid, build_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'building', build_id = $2, building_at = now(), \
             updated_at = now() WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(build_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// building → starting, attaching the built image and the allocated VM.
    pub async fn mark_starting(&self, id: Uuid, image_id: Uuid, vm_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'starting', image_id = $2, vm_id = $3, \
             starting_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'building' AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(image_id)
        .bind(vm_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// starting → running.
    pub async fn mark_running(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'running', running_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'starting' AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// running → stopping (supersession).
    pub async fn mark_stopping(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'stopping', stopping_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'running' AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// stopping → stopped.
    pub async fn mark_stopped(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'stopped', stopped_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'stopping' AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Any non-terminal state → failed, with the user-visible reason.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'failed', error_message = $2, failed_at = now(), \
             updated_at = now() \
             WHERE id = $1 AND status NOT IN ('stopped', 'failed') AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether a newer deployment of the same project has reached running.
    /// Row ids are time-ordered, so "newer" is an id comparison.
    pub async fn superseded_by_newer(&self, project_id: Uuid, id: Uuid) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS ( \
                SELECT 1 FROM deployments \
                WHERE project_id = $1 AND id > $2 AND status = 'running' \
                  AND deleted_at IS NULL)",
        )
        .bind(project_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Older deployments of the same project still in running: the rows a
    /// freshly running deployment supersedes.
    pub async fn older_running_ids(&self, project_id: Uuid, than: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM deployments \
             WHERE project_id = $1 AND id < $2 AND status = 'running' \
               AND deleted_at IS NULL ORDER BY id",
        )
        .bind(project_id)
        .bind(than)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Ids of deployments a reconciler should be watching (everything
    /// non-terminal, including running rows that may be superseded).
    pub async fn active_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM deployments \
             WHERE status NOT IN ('stopped', 'failed') AND deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Deployment>> {
        let deployments = sqlx::query_as::<_, Deployment>(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments \
             WHERE project_id = $1 AND deleted_at IS NULL ORDER BY id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(deployments)
    }
}
