use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use zeitwork_core::{ids, ipv4};

use crate::servers::{self, Server};
use crate::status::VmStatus;
use crate::{advisory_lock, lock_vm_ip_allocation};

#[derive(Debug, Clone, FromRow)]
pub struct Vm {
    pub id: Uuid,
    pub organisation_id: Uuid,
    pub image_id: Uuid,
    pub server_id: Uuid,
    pub ip_address: IpNetwork,
    pub port: i32,
    pub vcpus: i32,
    pub memory_mib: i32,
    pub env_variables: Json<Vec<String>>,
    pub metadata: Json<serde_json::Value>,
    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Vm {
    pub fn guest_ipv4(&self) -> Result<std::net::Ipv4Addr> {
        match self.ip_address.ip() {
            std::net::IpAddr::V4(ip) => Ok(ip),
            std::net::IpAddr::V6(_) => anyhow::bail!("VM {} has an IPv6 address", self.id),
        }
    }
}

/// Parameters for a new VM row; placement and addressing are decided by
/// the store.
#[derive(Debug, Clone)]
pub struct NewVm {
    pub organisation_id: Uuid,
    pub image_id: Uuid,
    pub port: i32,
    pub vcpus: i32,
    pub memory_mib: i32,
    pub env_variables: Vec<String>,
}

const VM_COLUMNS: &str = "id, organisation_id, image_id, server_id, ip_address, port, vcpus, \
     memory_mib, env_variables, metadata, status, created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct VmStore {
    pool: PgPool,
}

impl VmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a VM row: pick the emptiest live server and allocate the next
    /// /31 in its range, all in one transaction.
    ///
    /// Returns None when no live server is available for placement.
    pub async fn allocate(&self, new: &NewVm) -> Result<Option<Vm>> {
        let mut tx = self.pool.begin().await?;

        let Some(server) = servers::placement_target(&mut tx).await? else {
            return Ok(None);
        };

        let guest_ip = next_guest_ip(&mut tx, &server).await?;

        let vm = sqlx::query_as::<_, Vm>(&format!(
            r#"
            INSERT INTO vms (id, organisation_id, image_id, server_id, ip_address,
                             port, vcpus, memory_mib, env_variables, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
            RETURNING {VM_COLUMNS}
            "#
        ))
        .bind(ids::new_id())
        .bind(new.organisation_id)
        .bind(new.image_id)
        .bind(server.id)
        .bind(IpNetwork::new(guest_ip.into(), ipv4::VM_PREFIX)?)
        .bind(new.port)
        .bind(new.vcpus)
        .bind(new.memory_mib)
        .bind(Json(&new.env_variables))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(vm))
    }

    /// Move a VM off a dead server: pick a live placement target and a
    /// fresh /31 in its range, reset to pending so the target node agent
    /// materializes it. Selection and update share one transaction.
    ///
    /// Returns None when no live server can take the VM.
    pub async fn reassign_with_placement(&self, vm_id: Uuid) -> Result<Option<Vm>> {
        let mut tx = self.pool.begin().await?;

        let Some(target) = servers::placement_target(&mut tx).await? else {
            return Ok(None);
        };

        let guest_ip = next_guest_ip(&mut tx, &target).await?;

        let vm = sqlx::query_as::<_, Vm>(&format!(
            r#"
            UPDATE vms
            SET server_id = $2, ip_address = $3, status = 'pending', updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {VM_COLUMNS}
            "#
        ))
        .bind(vm_id)
        .bind(target.id)
        .bind(IpNetwork::new(guest_ip.into(), ipv4::VM_PREFIX)?)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(vm))
    }

    /// Move a VM to a specific server with a fresh /31 in its range.
    pub async fn reassign(&self, vm_id: Uuid, target: &Server) -> Result<Vm> {
        let mut tx = self.pool.begin().await?;

        let guest_ip = next_guest_ip(&mut tx, target).await?;

        let vm = sqlx::query_as::<_, Vm>(&format!(
            r#"
            UPDATE vms
            SET server_id = $2, ip_address = $3, status = 'pending', updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING {VM_COLUMNS}
            "#
        ))
        .bind(vm_id)
        .bind(target.id)
        .bind(IpNetwork::new(guest_ip.into(), ipv4::VM_PREFIX)?)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(vm)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Vm>> {
        let vm =
            sqlx::query_as::<_, Vm>(&format!("SELECT {VM_COLUMNS} FROM vms WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(vm)
    }

    /// All live VM rows owned by one server.
    pub async fn list_for_server(&self, server_id: Uuid) -> Result<Vec<Vm>> {
        let vms = sqlx::query_as::<_, Vm>(&format!(
            "SELECT {VM_COLUMNS} FROM vms \
             WHERE server_id = $1 AND deleted_at IS NULL ORDER BY id"
        ))
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(vms)
    }

    /// Transition a VM from an expected status. Returns false when the row
    /// was no longer in the expected state (a concurrent actor won).
    pub async fn transition(&self, id: Uuid, from: VmStatus, to: VmStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE vms SET status = $3, updated_at = now() \
             WHERE id = $1 AND status = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Force a VM's status regardless of its current state (teardown paths).
    pub async fn set_status(&self, id: Uuid, status: VmStatus) -> Result<()> {
        sqlx::query(
            "UPDATE vms SET status = $2, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn soft_delete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE vms SET deleted_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count of non-terminal live VMs on a server (resource accounting).
    pub async fn live_count_for_server(&self, server_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM vms \
             WHERE server_id = $1 AND deleted_at IS NULL \
               AND status NOT IN ('stopped', 'failed')",
        )
        .bind(server_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

/// Allocate the next guest /31 in a server's range, serialized by the
/// server-scoped advisory lock.
async fn next_guest_ip(
    tx: &mut Transaction<'_, Postgres>,
    server: &Server,
) -> Result<std::net::Ipv4Addr> {
    advisory_lock(tx, &lock_vm_ip_allocation(&server.id)).await?;

    let range = server.ip_range_v4()?;

    let highest: Option<(IpNetwork,)> = sqlx::query_as(
        "SELECT max(ip_address) FROM vms \
         WHERE server_id = $1 AND deleted_at IS NULL \
         HAVING max(ip_address) IS NOT NULL",
    )
    .bind(server.id)
    .fetch_optional(&mut **tx)
    .await?;

    let guest_ip = match highest {
        None => ipv4::first_guest_ip(range),
        Some((net,)) => {
            let std::net::IpAddr::V4(prev) = net.ip() else {
                anyhow::bail!("Unexpected IPv6 VM address on server {}", server.id);
            };
            ipv4::next_guest_ip(range, prev)
                .with_context(|| format!("VM address allocation on server {}", server.id))?
        }
    };

    Ok(guest_ip)
}
