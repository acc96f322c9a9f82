use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use zeitwork_core::ids;

/// Minutes after which an unfinished build claim becomes stealable.
pub const CLAIM_EXPIRY_MINS: i64 = 15;

#[derive(Debug, Clone, FromRow)]
pub struct Image {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub disk_image_key: Option<String>,
    pub building_by: Option<Uuid>,
    pub building_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Image {
    /// An image is bootable once its disk image exists in the blob store.
    pub fn is_built(&self) -> bool {
        self.disk_image_key.is_some()
    }
}

const IMAGE_COLUMNS: &str = "id, organisation_id, registry, repository, tag, disk_image_key, \
     building_by, building_started_at, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct ImageStore {
    pool: PgPool,
}

impl ImageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get or create the image row for an address. The (registry,
    /// repository, tag) triple is the content address; concurrent callers
    /// converge on one row.
    pub async fn ensure(
        &self,
        organisation_id: Uuid,
        registry: &str,
        repository: &str,
        tag: &str,
    ) -> Result<Image> {
        let image = sqlx::query_as::<_, Image>(&format!(
            r#"
            INSERT INTO images (id, organisation_id, registry, repository, tag)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (registry, repository, tag)
                DO UPDATE SET updated_at = now()
            RETURNING {IMAGE_COLUMNS}
            "#
        ))
        .bind(ids::new_id())
        .bind(organisation_id)
        .bind(registry)
        .bind(repository)
        .bind(tag)
        .fetch_one(&self.pool)
        .await?;
        Ok(image)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Image>> {
        let image = sqlx::query_as::<_, Image>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(image)
    }

    /// Atomically claim an image for building. At most one server across
    /// the fleet succeeds; the losers observe false and treat it as a
    /// concurrent actor's success.
    ///
    /// A stale claim (older than [`CLAIM_EXPIRY_MINS`]) is stealable; an
    /// already-built image is never claimable until its disk_image_key is
    /// explicitly nulled.
    pub async fn try_claim(&self, id: Uuid, server_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET building_by = $2, building_started_at = now(), updated_at = now()
            WHERE id = $1
              AND disk_image_key IS NULL
              AND (building_by IS NULL
                   OR building_started_at < now() - make_interval(mins => $3))
            "#,
        )
        .bind(id)
        .bind(server_id)
        .bind(CLAIM_EXPIRY_MINS as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a successful build: sets the disk image key and clears the
    /// claim in one statement. Only the claim holder may complete.
    pub async fn complete(&self, id: Uuid, server_id: Uuid, disk_image_key: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET disk_image_key = $3, building_by = NULL, building_started_at = NULL,
                updated_at = now()
            WHERE id = $1 AND building_by = $2 AND disk_image_key IS NULL
            "#,
        )
        .bind(id)
        .bind(server_id)
        .bind(disk_image_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give up a claim after a failed build so another server can retry.
    pub async fn release_claim(&self, id: Uuid, server_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE images SET building_by = NULL, building_started_at = NULL, \
             updated_at = now() \
             WHERE id = $1 AND building_by = $2 AND disk_image_key IS NULL",
        )
        .bind(id)
        .bind(server_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Explicitly discard a built disk image so a forced re-push can
    /// rebuild it. Rebuild claims are rejected unless this ran first.
    pub async fn reset_for_rebuild(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE images SET disk_image_key = NULL, building_by = NULL, \
             building_started_at = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
