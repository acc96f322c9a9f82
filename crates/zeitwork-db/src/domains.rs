use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use zeitwork_core::ids;

#[derive(Debug, Clone, FromRow)]
pub struct Domain {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub project_id: Uuid,
    pub deployment_id: Option<Uuid>,
    pub name: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub txt_verification_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Domain {
    /// Whether this name is a subdomain of the platform base domain and
    /// therefore auto-verified under the wildcard certificate.
    pub fn is_platform_subdomain(&self, base_domain: &str) -> bool {
        self.name
            .strip_suffix(base_domain)
            .and_then(|prefix| prefix.strip_suffix('.'))
            .is_some_and(|label| !label.is_empty())
    }
}

const DOMAIN_COLUMNS: &str = "id, organisation_id, project_id, deployment_id, name, verified_at, \
     txt_verification_required, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct DomainStore {
    pool: PgPool,
}

impl DomainStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a domain row. Platform subdomains are verified at creation;
    /// custom domains start unverified and require the TXT challenge.
    pub async fn create(
        &self,
        organisation_id: Uuid,
        project_id: Uuid,
        deployment_id: Option<Uuid>,
        name: &str,
        auto_verified: bool,
    ) -> Result<Domain> {
        let domain = sqlx::query_as::<_, Domain>(&format!(
            r#"
            INSERT INTO domains (id, organisation_id, project_id, deployment_id, name,
                                 verified_at, txt_verification_required)
            VALUES ($1, $2, $3, $4, $5,
                    CASE WHEN $6 THEN now() ELSE NULL END, NOT $6)
            RETURNING {DOMAIN_COLUMNS}
            "#
        ))
        .bind(ids::new_id())
        .bind(organisation_id)
        .bind(project_id)
        .bind(deployment_id)
        .bind(name)
        .bind(auto_verified)
        .fetch_one(&self.pool)
        .await?;
        Ok(domain)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Domain>> {
        let domain = sqlx::query_as::<_, Domain>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(domain)
    }

    /// Ids of live domains still awaiting TXT verification.
    pub async fn unverified_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM domains \
             WHERE verified_at IS NULL AND deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Record a successful verification. verified_at is monotonic: the
    /// guard means a repeat check can never clear or move it.
    pub async fn mark_verified(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE domains SET verified_at = now(), updated_at = now() \
             WHERE id = $1 AND verified_at IS NULL AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Verified custom domains that need their own certificate (everything
    /// not covered by the platform wildcard).
    pub async fn verified_custom_names(&self, base_domain: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM domains \
             WHERE verified_at IS NOT NULL AND deleted_at IS NULL \
               AND name NOT LIKE '%.' || $1 ORDER BY name",
        )
        .bind(base_domain)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE domains SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(name: &str) -> Domain {
        Domain {
            id: ids::new_id(),
            organisation_id: ids::new_id(),
            project_id: ids::new_id(),
            deployment_id: None,
            name: name.to_string(),
            verified_at: None,
            txt_verification_required: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn test_platform_subdomain_detection() {
        assert!(domain("myapp.zeitwork.app").is_platform_subdomain("zeitwork.app"));
        assert!(domain("a.b.zeitwork.app").is_platform_subdomain("zeitwork.app"));
        assert!(!domain("example.com").is_platform_subdomain("zeitwork.app"));
        // The bare base domain is not a tenant subdomain.
        assert!(!domain("zeitwork.app").is_platform_subdomain("zeitwork.app"));
        // Suffix match must respect label boundaries.
        assert!(!domain("evilzeitwork.app").is_platform_subdomain("zeitwork.app"));
    }
}
