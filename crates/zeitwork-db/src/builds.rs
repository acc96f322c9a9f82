use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use zeitwork_core::ids;

use crate::status::BuildStatus;

/// Hard cap on time spent in `building` before the build is forced failed.
pub const BUILD_TIMEOUT_SECS: i64 = 30 * 60;

#[derive(Debug, Clone, FromRow)]
pub struct Build {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub github_commit: String,
    pub github_branch: Option<String>,
    pub status: BuildStatus,
    pub image_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

const BUILD_COLUMNS: &str = "id, organisation_id, project_id, github_commit, github_branch, \
     status, image_id, error_message, started_at, finished_at, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct BuildStore {
    pool: PgPool,
}

impl BuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        organisation_id: Uuid,
        project_id: Uuid,
        github_commit: &str,
        github_branch: Option<&str>,
    ) -> Result<Build> {
        let build = sqlx::query_as::<_, Build>(&format!(
            r#"
            INSERT INTO builds (id, organisation_id, project_id, github_commit, github_branch)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {BUILD_COLUMNS}
            "#
        ))
        .bind(ids::new_id())
        .bind(organisation_id)
        .bind(project_id)
        .bind(github_commit)
        .bind(github_branch)
        .fetch_one(&self.pool)
        .await?;
        Ok(build)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Build>> {
        let build = sqlx::query_as::<_, Build>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(build)
    }

    /// pending → building, recording the target image and start time.
    pub async fn mark_building(&self, id: Uuid, image_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'building', image_id = $2, started_at = now(), \
             updated_at = now() WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(image_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// building → successful.
    pub async fn mark_successful(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'successful', finished_at = now(), updated_at = now() \
             WHERE id = $1 AND status = 'building' AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Any non-terminal state → failed, with the user-visible reason.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'failed', error_message = $2, finished_at = now(), \
             updated_at = now() \
             WHERE id = $1 AND status IN ('pending', 'building') AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Ids of builds a reconciler should be watching.
    pub async fn active_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM builds \
             WHERE status IN ('pending', 'building') AND deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
