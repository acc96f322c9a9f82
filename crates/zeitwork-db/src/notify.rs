use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgListener;

/// Channel fired after any mutation that can change the routing join.
pub const ROUTES_CHANNEL: &str = "zeitwork_routes";

/// Channel fired after certificate store writes.
pub const CERTS_CHANNEL: &str = "zeitwork_certs";

/// Fire a change notification. Payloads are intentionally empty: the
/// receiver re-reads the database rather than trusting the message.
pub async fn publish(pool: &PgPool, channel: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(channel)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to notify channel {}", channel))?;
    Ok(())
}

/// Subscribe to one or more notification channels.
pub async fn subscribe(pool: &PgPool, channels: &[&str]) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .with_context(|| "Failed to open notification listener")?;
    listener
        .listen_all(channels.iter().copied())
        .await
        .with_context(|| "Failed to subscribe to notification channels")?;
    Ok(listener)
}
