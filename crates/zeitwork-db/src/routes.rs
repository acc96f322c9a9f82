use anyhow::Result;
use ipnetwork::IpNetwork;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One active route: a verified domain whose deployment and VM are both
/// running, joined to the server that owns the VM.
#[derive(Debug, Clone, FromRow)]
pub struct RouteRecord {
    pub hostname: String,
    pub vm_ip: IpNetwork,
    pub vm_port: i32,
    pub server_id: Uuid,
    pub server_internal_ip: IpNetwork,
}

/// The single join query every edge proxy rebuilds its table from.
pub async fn active_routes(pool: &PgPool) -> Result<Vec<RouteRecord>> {
    let routes = sqlx::query_as::<_, RouteRecord>(
        r#"
        SELECT d.name AS hostname,
               v.ip_address AS vm_ip,
               v.port AS vm_port,
               s.id AS server_id,
               s.internal_ip AS server_internal_ip
        FROM domains d
        INNER JOIN deployments dep
            ON dep.id = d.deployment_id AND dep.deleted_at IS NULL
        INNER JOIN vms v
            ON v.id = dep.vm_id AND v.deleted_at IS NULL
        INNER JOIN servers s
            ON s.id = v.server_id
        WHERE d.verified_at IS NOT NULL
          AND d.deleted_at IS NULL
          AND dep.status = 'running'
          AND v.status = 'running'
        ORDER BY d.name
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(routes)
}
