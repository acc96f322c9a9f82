use std::path::PathBuf;

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;

use zeitwork_core::env;

/// Node agent configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database_url: String,
    /// Address peers reach this server on (edge-proxy peer forwarding,
    /// registry row).
    pub internal_ip: IpNetwork,
    pub hostname: String,
    /// Root of all per-VM working directories and the server identity file.
    pub state_dir: PathBuf,
    /// Directory disk images are materialized from, keyed by
    /// `disk_image_key`.
    pub image_store: PathBuf,
    /// Firecracker binary.
    pub firecracker_bin: PathBuf,
    /// External builder binary (spawned per claimed build).
    pub builder_bin: PathBuf,
    /// Registry new images are addressed under.
    pub registry: String,
    /// Optional HTTP endpoint log batches are shipped to.
    pub log_sink_url: Option<String>,
    /// Admin socket path (attach/logs/list).
    pub admin_socket: PathBuf,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let internal_ip: IpNetwork = env::required("ZEITWORK_INTERNAL_IP")?
            .parse()
            .with_context(|| "ZEITWORK_INTERNAL_IP is not a valid address")?;

        let hostname = match std::env::var("ZEITWORK_HOSTNAME") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        };

        Ok(Self {
            database_url: env::required("DATABASE_URL")?,
            internal_ip,
            hostname,
            state_dir: PathBuf::from(env::optional("ZEITWORK_STATE_DIR", "/var/lib/zeitwork")),
            image_store: PathBuf::from(env::optional(
                "ZEITWORK_IMAGE_STORE",
                "/var/lib/zeitwork/images",
            )),
            firecracker_bin: PathBuf::from(env::optional("ZEITWORK_FIRECRACKER_BIN", "firecracker")),
            builder_bin: PathBuf::from(env::optional(
                "ZEITWORK_BUILDER_BIN",
                "/usr/local/bin/zeitwork-builder",
            )),
            registry: env::optional("ZEITWORK_REGISTRY", "registry.zeitwork.com"),
            log_sink_url: match env::optional("ZEITWORK_LOG_SINK_URL", "") {
                s if s.is_empty() => None,
                s => Some(s),
            },
            admin_socket: PathBuf::from(env::optional(
                "ZEITWORK_ADMIN_SOCKET",
                "/run/zeitwork/agentd.sock",
            )),
        })
    }

    /// Working directory of one microVM.
    pub fn vm_dir(&self, vm_id: &uuid::Uuid) -> PathBuf {
        self.state_dir.join("vms").join(vm_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_dir_layout() {
        let config = AgentConfig {
            database_url: "postgres://localhost/zw".to_string(),
            internal_ip: "192.168.1.10/32".parse().unwrap(),
            hostname: "worker-1".to_string(),
            state_dir: PathBuf::from("/var/lib/zeitwork"),
            image_store: PathBuf::from("/var/lib/zeitwork/images"),
            firecracker_bin: PathBuf::from("firecracker"),
            builder_bin: PathBuf::from("/usr/local/bin/zeitwork-builder"),
            registry: "registry.zeitwork.com".to_string(),
            log_sink_url: None,
            admin_socket: PathBuf::from("/run/zeitwork/agentd.sock"),
        };
        let id = uuid::Uuid::from_u128(7);
        assert_eq!(
            config.vm_dir(&id),
            PathBuf::from(format!("/var/lib/zeitwork/vms/{}", id))
        );
    }
}
