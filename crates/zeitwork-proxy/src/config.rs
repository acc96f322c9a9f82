use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use uuid::Uuid;

use zeitwork_core::env;

/// Well-known port peers forward foreign-VM traffic to.
pub const PEER_PORT: u16 = 8081;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub database_url: String,
    /// Public TLS listener.
    pub https_addr: SocketAddr,
    /// Plaintext peer-forward listener on the internal network.
    pub peer_addr: SocketAddr,
    /// Platform base domain covered by the wildcard certificate.
    pub base_domain: String,
    /// Identity of the server this proxy runs on, for local-vs-peer
    /// routing decisions. Shared with the node agent's identity file.
    pub server_id: Uuid,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let state_dir = PathBuf::from(env::optional("ZEITWORK_STATE_DIR", "/var/lib/zeitwork"));

        // The agent writes the identity file at registration; the proxy
        // rides on it. An explicit env var wins for split deployments.
        let server_id = match std::env::var("ZEITWORK_SERVER_ID") {
            Ok(v) if !v.trim().is_empty() => v
                .trim()
                .parse()
                .with_context(|| "ZEITWORK_SERVER_ID is not a valid UUID")?,
            _ => {
                let path = state_dir.join("server_id");
                std::fs::read_to_string(&path)
                    .with_context(|| {
                        format!(
                            "Cannot determine server identity: set ZEITWORK_SERVER_ID or run the agent first ({})",
                            path.display()
                        )
                    })?
                    .trim()
                    .parse()
                    .with_context(|| format!("Corrupt server id file: {}", path.display()))?
            }
        };

        Ok(Self {
            database_url: env::required("DATABASE_URL")?,
            https_addr: env::optional("ZEITWORK_HTTPS_ADDR", "0.0.0.0:443")
                .parse()
                .with_context(|| "ZEITWORK_HTTPS_ADDR is not a valid address")?,
            peer_addr: env::optional("ZEITWORK_PEER_ADDR", &format!("0.0.0.0:{}", PEER_PORT))
                .parse()
                .with_context(|| "ZEITWORK_PEER_ADDR is not a valid address")?,
            base_domain: env::required("ZEITWORK_BASE_DOMAIN")?,
            server_id,
        })
    }
}
