// zeitwork-db: Postgres pool, advisory locks, and typed per-entity stores.
// The database is the single source of truth; every store method is one
// short statement or transaction, never held across external I/O.

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub mod builds;
pub mod cert_store;
pub mod deployments;
pub mod domains;
pub mod images;
pub mod notify;
pub mod projects;
pub mod routes;
pub mod servers;
pub mod status;
pub mod vms;

/// Embedded migrations (crates/zeitwork-db/migrations).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Connect to the control-plane database and run pending migrations.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await
        .with_context(|| "Failed to connect to database")?;

    MIGRATOR
        .run(&pool)
        .await
        .with_context(|| "Failed to run database migrations")?;

    Ok(pool)
}

/// Acquire a transaction-scoped advisory lock, blocking until granted.
///
/// The lock is keyed by `hashtext(key)` and released automatically at
/// transaction end.
pub async fn advisory_lock(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    key: &str,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to acquire advisory lock {}", key))?;
    Ok(())
}

/// Try to acquire a transaction-scoped advisory lock without blocking.
///
/// Returns false when another session holds it; used for leader-election
/// style gating (failover worker, certificate renewal).
pub async fn try_advisory_lock(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    key: &str,
) -> Result<bool> {
    let (granted,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .fetch_one(&mut **tx)
        .await
        .with_context(|| format!("Failed to try advisory lock {}", key))?;
    Ok(granted)
}

/// Advisory lock key for server IP-range carve-out.
pub const LOCK_SERVER_IP_RANGE: &str = "server_ip_range_allocation";

/// Advisory lock key gating the failover worker.
pub const LOCK_SERVER_FAILOVER: &str = "server_failover";

/// Advisory lock key for per-server VM /31 allocation.
pub fn lock_vm_ip_allocation(server_id: &uuid::Uuid) -> String {
    format!("vm_ip_allocation_{}", server_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_ip_lock_key_is_server_scoped() {
        let a = uuid::Uuid::from_u128(1);
        let b = uuid::Uuid::from_u128(2);
        assert_ne!(lock_vm_ip_allocation(&a), lock_vm_ip_allocation(&b));
        assert!(lock_vm_ip_allocation(&a).starts_with("vm_ip_allocation_"));
    }
}
