use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use zeitwork_core::ipv4;

use crate::status::ServerStatus;
use crate::{LOCK_SERVER_IP_RANGE, advisory_lock};

/// Seconds after the last heartbeat during which a server counts as live.
pub const LIVE_WINDOW_SECS: i64 = 30;

/// Seconds after the last heartbeat at which a server becomes a failover
/// candidate.
pub const FAILOVER_THRESHOLD_SECS: i64 = 60;

#[derive(Debug, Clone, FromRow)]
pub struct Server {
    pub id: Uuid,
    pub hostname: String,
    pub internal_ip: IpNetwork,
    pub ip_range: IpNetwork,
    pub status: ServerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Server {
    /// The server's /20 as an IPv4 network.
    pub fn ip_range_v4(&self) -> Result<Ipv4Network> {
        match self.ip_range {
            IpNetwork::V4(net) => Ok(net),
            IpNetwork::V6(_) => anyhow::bail!("Server {} has an IPv6 ip_range", self.id),
        }
    }

    pub fn internal_ipv4(&self) -> Result<std::net::Ipv4Addr> {
        match self.internal_ip.ip() {
            std::net::IpAddr::V4(ip) => Ok(ip),
            std::net::IpAddr::V6(_) => anyhow::bail!("Server {} has an IPv6 internal_ip", self.id),
        }
    }
}

const SERVER_COLUMNS: &str = "id, hostname, internal_ip, ip_range, status, last_heartbeat_at, \
     created_at, updated_at, deleted_at";

#[derive(Clone)]
pub struct ServerStore {
    pool: PgPool,
}

impl ServerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register this server, carving out the next free /20 on first
    /// registration.
    ///
    /// Range allocation runs under the platform-wide advisory lock so two
    /// servers starting at once cannot receive overlapping ranges. A
    /// re-registration keeps the existing range and only refreshes
    /// identity, status, and heartbeat.
    pub async fn register(
        &self,
        id: Uuid,
        hostname: &str,
        internal_ip: IpNetwork,
    ) -> Result<Server> {
        let mut tx = self.pool.begin().await?;
        advisory_lock(&mut tx, LOCK_SERVER_IP_RANGE).await?;

        let existing: Option<Server> = sqlx::query_as(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let server = if existing.is_some() {
            sqlx::query_as::<_, Server>(&format!(
                r#"
                UPDATE servers
                SET hostname = $2, internal_ip = $3, status = 'active',
                    last_heartbeat_at = now(), updated_at = now(), deleted_at = NULL
                WHERE id = $1
                RETURNING {SERVER_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(hostname)
            .bind(internal_ip)
            .fetch_one(&mut *tx)
            .await?
        } else {
            // Highest range across all rows, deleted included: a retired
            // server's range is never reissued.
            let highest: Option<(IpNetwork,)> =
                sqlx::query_as("SELECT ip_range FROM servers ORDER BY ip_range DESC LIMIT 1")
                    .fetch_optional(&mut *tx)
                    .await?;

            let range = match highest {
                Some((IpNetwork::V4(net),)) => ipv4::next_server_range(net)
                    .with_context(|| "Failed to allocate server ip_range")?,
                Some((IpNetwork::V6(_),)) => anyhow::bail!("Unexpected IPv6 server range"),
                None => ipv4::first_server_range(),
            };

            sqlx::query_as::<_, Server>(&format!(
                r#"
                INSERT INTO servers (id, hostname, internal_ip, ip_range, status, last_heartbeat_at)
                VALUES ($1, $2, $3, $4, 'active', now())
                RETURNING {SERVER_COLUMNS}
                "#
            ))
            .bind(id)
            .bind(hostname)
            .bind(internal_ip)
            .bind(IpNetwork::V4(range))
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(server)
    }

    /// Refresh this server's heartbeat timestamp.
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE servers SET last_heartbeat_at = now(), updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Server>> {
        let server = sqlx::query_as::<_, Server>(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(server)
    }

    /// Servers past the failover threshold that are not already dead.
    pub async fn failover_candidates(&self) -> Result<Vec<Server>> {
        let servers = sqlx::query_as::<_, Server>(&format!(
            r#"
            SELECT {SERVER_COLUMNS} FROM servers
            WHERE deleted_at IS NULL
              AND status IN ('active', 'draining')
              AND last_heartbeat_at < now() - make_interval(secs => $1)
            ORDER BY id
            "#
        ))
        .bind(FAILOVER_THRESHOLD_SECS as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(servers)
    }

    /// Transition a server's status, guarded against repeat transitions.
    pub async fn set_status(&self, id: Uuid, status: ServerStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE servers SET status = $2, updated_at = now() \
             WHERE id = $1 AND status != $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list(&self) -> Result<Vec<Server>> {
        let servers = sqlx::query_as::<_, Server>(&format!(
            "SELECT {SERVER_COLUMNS} FROM servers WHERE deleted_at IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(servers)
    }
}

/// Pick the placement target for a new VM inside the caller's transaction:
/// the live server with the fewest non-terminal VMs, tie-broken by id.
///
/// Running the selection and the VM insert in one transaction keeps two
/// concurrent placements from both seeing the same "emptiest" server
/// count.
pub async fn placement_target(tx: &mut Transaction<'_, Postgres>) -> Result<Option<Server>> {
    let server = sqlx::query_as::<_, Server>(&format!(
        r#"
        SELECT {SERVER_COLUMNS} FROM servers s
        WHERE s.status = 'active' AND s.deleted_at IS NULL
          AND s.last_heartbeat_at > now() - make_interval(secs => $1)
        ORDER BY (
            SELECT count(*) FROM vms v
            WHERE v.server_id = s.id
              AND v.deleted_at IS NULL
              AND v.status NOT IN ('stopped', 'failed')
        ) ASC, s.id ASC
        LIMIT 1
        "#
    ))
    .bind(LIVE_WINDOW_SECS as f64)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(server)
}
