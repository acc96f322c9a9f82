use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};
use uuid::Uuid;

use zeitwork_db::notify;
use zeitwork_db::routes::{RouteRecord, active_routes};

use crate::config::PEER_PORT;

/// Fallback rebuild cadence when no notifications arrive.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// One routing decision, precomputed at table build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    /// Direct upstream (the VM itself).
    pub vm_addr: SocketAddr,
    /// The owning server's peer proxy.
    pub peer_addr: SocketAddr,
    /// Whether the VM lives on this server.
    pub is_local: bool,
    pub server_id: Uuid,
}

/// Hostname → route, swapped atomically on rebuild.
///
/// Lookups clone the Arc, so a request keeps one consistent snapshot even
/// if the table is swapped mid-flight.
pub struct RouteTable {
    inner: RwLock<Arc<HashMap<String, Route>>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub async fn lookup(&self, hostname: &str) -> Option<Route> {
        let snapshot = self.snapshot().await;
        snapshot.get(hostname).cloned()
    }

    pub async fn snapshot(&self) -> Arc<HashMap<String, Route>> {
        Arc::clone(&*self.inner.read().await)
    }

    pub async fn swap(&self, table: HashMap<String, Route>) {
        *self.inner.write().await = Arc::new(table);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Turn the join-query result into a lookup table for this server.
pub fn build_table(records: &[RouteRecord], own_server_id: Uuid) -> HashMap<String, Route> {
    let mut table = HashMap::with_capacity(records.len());
    for record in records {
        let vm_ip: IpAddr = record.vm_ip.ip();
        let peer_ip: IpAddr = record.server_internal_ip.ip();
        table.insert(
            record.hostname.clone(),
            Route {
                hostname: record.hostname.clone(),
                vm_addr: SocketAddr::new(vm_ip, record.vm_port as u16),
                peer_addr: SocketAddr::new(peer_ip, PEER_PORT),
                is_local: record.server_id == own_server_id,
                server_id: record.server_id,
            },
        );
    }
    table
}

/// Rebuild the table now.
pub async fn rebuild(pool: &PgPool, table: &RouteTable, own_server_id: Uuid) -> Result<()> {
    let records = active_routes(pool).await?;
    let built = build_table(&records, own_server_id);
    let count = built.len();
    table.swap(built).await;
    info!(routes = count, "Routing table rebuilt");
    Ok(())
}

/// Keep the table fresh: rebuild on database notifications, with a slow
/// poll as a safety net, until shutdown.
pub async fn refresh_loop(
    pool: PgPool,
    table: Arc<RouteTable>,
    own_server_id: Uuid,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut listener = match notify::subscribe(&pool, &[notify::ROUTES_CHANNEL]).await {
        Ok(l) => Some(l),
        Err(e) => {
            warn!(error = %e, "Route notifications unavailable, polling only");
            None
        }
    };

    let mut tick = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            notification = async {
                match listener.as_mut() {
                    Some(l) => l.recv().await.map(|_| ()),
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = notification {
                    warn!(error = %e, "Notification stream broke, falling back to polling");
                    listener = None;
                }
            }
            _ = shutdown.changed() => return,
        }

        if let Err(e) = rebuild(&pool, &table, own_server_id).await {
            warn!(error = %e, "Routing table rebuild failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hostname: &str, vm_ip: &str, server: Uuid, server_ip: &str) -> RouteRecord {
        RouteRecord {
            hostname: hostname.to_string(),
            vm_ip: vm_ip.parse().unwrap(),
            vm_port: 8080,
            server_id: server,
            server_internal_ip: server_ip.parse().unwrap(),
        }
    }

    #[test]
    fn test_build_table_marks_local_routes() {
        let local = Uuid::from_u128(1);
        let remote = Uuid::from_u128(2);
        let records = vec![
            record("a.zeitwork.app", "10.1.0.3/31", local, "192.168.1.10/32"),
            record("b.zeitwork.app", "10.1.16.5/31", remote, "192.168.1.11/32"),
        ];

        let table = build_table(&records, local);
        assert_eq!(table.len(), 2);

        let a = &table["a.zeitwork.app"];
        assert!(a.is_local);
        assert_eq!(a.vm_addr, "10.1.0.3:8080".parse().unwrap());

        let b = &table["b.zeitwork.app"];
        assert!(!b.is_local);
        assert_eq!(b.peer_addr, format!("192.168.1.11:{}", PEER_PORT).parse().unwrap());
    }

    #[tokio::test]
    async fn test_swap_replaces_whole_table() {
        let table = RouteTable::new();
        let s1 = Uuid::from_u128(1);
        table
            .swap(build_table(
                &[record("old.zeitwork.app", "10.1.0.3/31", s1, "192.168.1.10/32")],
                s1,
            ))
            .await;
        assert!(table.lookup("old.zeitwork.app").await.is_some());

        table
            .swap(build_table(
                &[record("new.zeitwork.app", "10.1.0.5/31", s1, "192.168.1.10/32")],
                s1,
            ))
            .await;
        assert!(table.lookup("old.zeitwork.app").await.is_none());
        assert!(table.lookup("new.zeitwork.app").await.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_swaps() {
        let table = RouteTable::new();
        let s1 = Uuid::from_u128(1);
        table
            .swap(build_table(
                &[record("keep.zeitwork.app", "10.1.0.3/31", s1, "192.168.1.10/32")],
                s1,
            ))
            .await;

        let snapshot = table.snapshot().await;
        table.swap(HashMap::new()).await;

        // The old snapshot still answers consistently.
        assert!(snapshot.contains_key("keep.zeitwork.app"));
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_lookup_unknown_host_is_none() {
        let table = RouteTable::new();
        assert!(table.lookup("nobody.example.com").await.is_none());
    }
}
