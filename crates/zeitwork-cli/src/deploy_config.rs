use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Services rolled out when `--services` is not given.
pub const DEFAULT_SERVICES: &[&str] = &["builder", "edge-proxy", "reconciler"];

/// `config/deploy.yaml`: hosts, SSH settings, and the service → binary
/// mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    pub ssh: SshConfig,
    pub hosts: Vec<HostEntry>,
    pub services: BTreeMap<String, ServiceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub user: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    /// Locally built binary shipped to the hosts.
    pub binary: String,
    /// Host names (from `hosts`) this service runs on.
    pub hosts: Vec<String>,
    /// systemd unit restarted after upload; defaults to
    /// `zeitwork-<service>`.
    #[serde(default)]
    pub unit: Option<String>,
}

impl DeployConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read deploy config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Malformed deploy config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("Deploy config needs at least one host");
        }
        if self.services.is_empty() {
            bail!("Deploy config needs at least one service");
        }
        for (name, service) in &self.services {
            if service.hosts.is_empty() {
                bail!("Service {:?} has no hosts", name);
            }
            for host in &service.hosts {
                if !self.hosts.iter().any(|h| &h.name == host) {
                    bail!("Service {:?} references unknown host {:?}", name, host);
                }
            }
        }
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Resolve the requested service names against the config, rejecting
    /// unknown names before any host is touched.
    pub fn select_services(&self, requested: &[String]) -> Result<Vec<(String, &ServiceEntry)>> {
        let mut selected = Vec::new();
        for name in requested {
            match self.services.get(name) {
                Some(service) => selected.push((name.clone(), service)),
                None => bail!(
                    "Unknown service {:?} (configured: {})",
                    name,
                    self.services.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            }
        }
        Ok(selected)
    }
}

impl ServiceEntry {
    pub fn unit_name(&self, service: &str) -> String {
        self.unit
            .clone()
            .unwrap_or_else(|| format!("zeitwork-{}", service))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
ssh:
  user: deploy
  key: ~/.ssh/zeitwork

hosts:
  - name: worker-1
    address: 192.168.1.10
  - name: worker-2
    address: 192.168.1.11

services:
  builder:
    binary: target/release/zeitwork-agentd
    hosts: [worker-1, worker-2]
  edge-proxy:
    binary: target/release/zeitwork-proxyd
    hosts: [worker-1, worker-2]
  reconciler:
    binary: target/release/zeitwork-reconcilerd
    hosts: [worker-1]
"#;

    #[test]
    fn test_parse_sample() {
        let config = DeployConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.ssh.user, "deploy");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.services.len(), 3);
        assert_eq!(
            config.services["reconciler"].binary,
            "target/release/zeitwork-reconcilerd"
        );
    }

    #[test]
    fn test_default_services_resolve() {
        let config = DeployConfig::parse(SAMPLE).unwrap();
        let requested: Vec<String> = DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect();
        let selected = config.select_services(&requested).unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn test_unknown_service_rejected() {
        let config = DeployConfig::parse(SAMPLE).unwrap();
        let err = config
            .select_services(&["database".to_string()])
            .unwrap_err();
        assert!(format!("{}", err).contains("Unknown service"));
    }

    #[test]
    fn test_unknown_host_rejected() {
        let bad = r#"
ssh:
  user: deploy
hosts:
  - name: worker-1
    address: 192.168.1.10
services:
  builder:
    binary: bin/agentd
    hosts: [worker-9]
"#;
        assert!(DeployConfig::parse(bad).is_err());
    }

    #[test]
    fn test_unit_name_default_and_override() {
        let config = DeployConfig::parse(SAMPLE).unwrap();
        assert_eq!(
            config.services["edge-proxy"].unit_name("edge-proxy"),
            "zeitwork-edge-proxy"
        );

        let with_unit = r#"
ssh:
  user: deploy
hosts:
  - name: h
    address: 10.0.0.1
services:
  builder:
    binary: bin/agentd
    hosts: [h]
    unit: custom-agent
"#;
        let config = DeployConfig::parse(with_unit).unwrap();
        assert_eq!(config.services["builder"].unit_name("builder"), "custom-agent");
    }
}
