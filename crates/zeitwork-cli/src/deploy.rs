use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::info;

use crate::deploy_config::{DEFAULT_SERVICES, DeployConfig, HostEntry, ServiceEntry, SshConfig};
use crate::envfile;

/// `zeitwork deploy` flags.
#[derive(Debug, Args)]
pub struct DeployArgs {
    /// Environment file shipped to every service.
    #[arg(long, default_value = ".env.prod")]
    pub env_file: PathBuf,

    /// Deploy configuration (hosts, SSH, service mapping).
    #[arg(long, default_value = "config/deploy.yaml")]
    pub config: PathBuf,

    /// Comma-separated services to roll out.
    #[arg(long, value_delimiter = ',')]
    pub services: Vec<String>,
}

/// Roll the requested services out to their hosts. Any sub-step failure
/// aborts with a non-zero exit and the reason logged.
pub fn run(args: &DeployArgs) -> Result<()> {
    let config = DeployConfig::from_file(&args.config)?;
    let env_vars = envfile::load(&args.env_file)?;

    let requested: Vec<String> = if args.services.is_empty() {
        DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
    } else {
        args.services.clone()
    };
    let selected = config.select_services(&requested)?;

    info!(
        services = %requested.join(","),
        env_file = %args.env_file.display(),
        "Starting deploy"
    );

    for (name, service) in &selected {
        let binary = Path::new(&service.binary);
        if !binary.exists() {
            bail!(
                "Service {:?}: binary {} not found (build it first)",
                name,
                binary.display()
            );
        }

        for host_name in &service.hosts {
            let host = config
                .host(host_name)
                .with_context(|| format!("Unknown host {:?}", host_name))?;
            deploy_service(&config.ssh, host, name, service, &env_vars)
                .with_context(|| format!("Deploy of {:?} to {:?} failed", name, host_name))?;
        }
    }

    info!("Deploy complete");
    Ok(())
}

/// Ship one service to one host: binary, env file, restart.
fn deploy_service(
    ssh: &SshConfig,
    host: &HostEntry,
    name: &str,
    service: &ServiceEntry,
    env_vars: &[(String, String)],
) -> Result<()> {
    let unit = service.unit_name(name);
    let remote = format!("{}@{}", ssh.user, host.address);
    let binary_name = Path::new(&service.binary)
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Service {:?} has a pathless binary", name))?;

    info!(service = name, host = %host.name, "Uploading");

    // Upload to a staging path, then move into place atomically so a
    // running binary is never truncated mid-write.
    scp(ssh, &service.binary, &format!("{}:/tmp/{}", remote, binary_name))?;
    run_ssh(
        ssh,
        &remote,
        &format!(
            "sudo install -m 0755 /tmp/{bin} /usr/local/bin/{bin} && rm -f /tmp/{bin}",
            bin = binary_name
        ),
    )?;

    let env_content = envfile::render(env_vars);
    run_ssh(
        ssh,
        &remote,
        &format!(
            "sudo mkdir -p /etc/zeitwork && printf '%s' '{}' | sudo tee /etc/zeitwork/{}.env > /dev/null",
            env_content.replace('\'', r"'\''"),
            unit
        ),
    )?;

    info!(service = name, host = %host.name, unit = %unit, "Restarting");
    run_ssh(ssh, &remote, &format!("sudo systemctl restart {}", unit))?;
    Ok(())
}

fn ssh_base(ssh: &SshConfig, program: &str) -> Command {
    let mut cmd = Command::new(program);
    if let Some(key) = &ssh.key {
        cmd.arg("-i").arg(key);
    }
    cmd.arg("-o").arg("StrictHostKeyChecking=accept-new");
    cmd
}

fn scp(ssh: &SshConfig, source: &str, target: &str) -> Result<()> {
    let output = ssh_base(ssh, "scp")
        .arg(source)
        .arg(target)
        .output()
        .with_context(|| "Failed to spawn scp")?;
    if !output.status.success() {
        bail!(
            "scp {} -> {} failed: {}",
            source,
            target,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn run_ssh(ssh: &SshConfig, remote: &str, script: &str) -> Result<()> {
    let output = ssh_base(ssh, "ssh")
        .arg(remote)
        .arg(script)
        .output()
        .with_context(|| "Failed to spawn ssh")?;
    if !output.status.success() {
        bail!(
            "Remote command failed on {}: {}",
            remote,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_fails_with_path() {
        let args = DeployArgs {
            env_file: PathBuf::from(".env.prod"),
            config: PathBuf::from("/definitely/missing/deploy.yaml"),
            services: vec![],
        };
        let err = run(&args).unwrap_err();
        assert!(format!("{:#}", err).contains("deploy.yaml"));
    }

    #[test]
    fn test_missing_env_file_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("deploy.yaml");
        std::fs::write(
            &config_path,
            r#"
ssh:
  user: deploy
hosts:
  - name: h
    address: 10.0.0.1
services:
  builder:
    binary: bin/agentd
    hosts: [h]
"#,
        )
        .unwrap();

        let args = DeployArgs {
            env_file: dir.path().join("nope.env"),
            config: config_path,
            services: vec![],
        };
        let err = run(&args).unwrap_err();
        assert!(format!("{:#}", err).contains("nope.env"));
    }

    #[test]
    fn test_unknown_service_fails_before_any_host_work() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("deploy.yaml");
        std::fs::write(
            &config_path,
            r#"
ssh:
  user: deploy
hosts:
  - name: h
    address: 10.0.0.1
services:
  builder:
    binary: bin/agentd
    hosts: [h]
"#,
        )
        .unwrap();
        let env_path = dir.path().join(".env.prod");
        std::fs::write(&env_path, "DATABASE_URL=postgres://db/zw\n").unwrap();

        let args = DeployArgs {
            env_file: env_path,
            config: config_path,
            services: vec!["mystery".to_string()],
        };
        let err = run(&args).unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown service"));
    }

    #[test]
    fn test_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("deploy.yaml");
        std::fs::write(
            &config_path,
            r#"
ssh:
  user: deploy
hosts:
  - name: h
    address: 10.0.0.1
services:
  builder:
    binary: /definitely/missing/zeitwork-agentd
    hosts: [h]
"#,
        )
        .unwrap();
        let env_path = dir.path().join(".env.prod");
        std::fs::write(&env_path, "A=1\n").unwrap();

        let args = DeployArgs {
            env_file: env_path,
            config: config_path,
            services: vec!["builder".to_string()],
        };
        let err = run(&args).unwrap_err();
        assert!(format!("{:#}", err).contains("not found"));
    }
}
