use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct CertRecord {
    pub key: String,
    pub pem: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Key-value PEM storage shared by the certificate manager and every edge
/// proxy. Keys are directory-style (`certs/wildcard/cert.pem`) so callers
/// can list by prefix.
#[derive(Clone)]
pub struct CertStore {
    pool: PgPool,
}

impl CertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn put(
        &self,
        key: &str,
        pem: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cert_store (key, pem, expires_at, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (key)
                DO UPDATE SET pem = EXCLUDED.pem, expires_at = EXCLUDED.expires_at,
                              updated_at = now()
            "#,
        )
        .bind(key)
        .bind(pem)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<CertRecord>> {
        let record = sqlx::query_as::<_, CertRecord>(
            "SELECT key, pem, expires_at, updated_at FROM cert_store WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<CertRecord>> {
        let records = sqlx::query_as::<_, CertRecord>(
            "SELECT key, pem, expires_at, updated_at FROM cert_store \
             WHERE key LIKE $1 || '%' ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cert_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// TTL lock table serializing certificate issuance across control-plane
/// replicas. A lock is stealable once expired, and re-entrant for its
/// current holder (renewal extends the TTL).
#[derive(Clone)]
pub struct CertLockStore {
    pool: PgPool,
}

impl CertLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Try to take (or extend) the lock. Returns false while another live
    /// holder has it.
    pub async fn try_acquire(&self, key: &str, holder: Uuid, ttl_secs: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO cert_locks (key, holder, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE cert_locks.expires_at < now() OR cert_locks.holder = EXCLUDED.holder
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(ttl_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self, key: &str, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM cert_locks WHERE key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
