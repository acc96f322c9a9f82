use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

/// Everything a builder runtime needs to produce a bootable disk image.
#[derive(Debug, Clone)]
pub struct BuildInput {
    /// Source repository (`owner/name`).
    pub repository: String,
    pub commit: String,
    /// Image tag; the commit hash, making the output content-addressed.
    pub tag: String,
    pub registry: String,
}

/// A builder runtime capability. The contract: given a repository, commit,
/// tag, and registry, produce a bootable disk image in the blob store and
/// return its key. How (container build, VM-in-VM) is the runtime's
/// business.
#[async_trait]
pub trait BuildRunner: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn build(&self, input: &BuildInput) -> Result<String>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Production runtime: shells out to the external builder binary.
///
/// The binary receives the input as arguments and prints the disk image
/// key as its last stdout line on success; any non-zero exit is a build
/// failure with stderr as the user-visible reason.
pub struct ProcessBuildRunner {
    program: PathBuf,
}

impl ProcessBuildRunner {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl BuildRunner for ProcessBuildRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn build(&self, input: &BuildInput) -> Result<String> {
        info!(
            repository = %input.repository,
            commit = %input.commit,
            "Invoking builder"
        );

        let output = tokio::process::Command::new(&self.program)
            .arg("--repository")
            .arg(&input.repository)
            .arg("--commit")
            .arg(&input.commit)
            .arg("--tag")
            .arg(&input.tag)
            .arg("--registry")
            .arg(&input.registry)
            .output()
            .await
            .with_context(|| format!("Failed to spawn builder: {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Builder exited with {}: {}",
                output.status,
                stderr.trim().lines().last().unwrap_or("no output")
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let key = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("Builder produced no disk image key"))?;

        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_process_runner_reads_last_stdout_line() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-builder.sh");
        std::fs::write(&script, "#!/bin/sh\necho progress line\necho disk/abc123.img\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runner = ProcessBuildRunner::new(script);
        let key = runner
            .build(&BuildInput {
                repository: "acme/app".to_string(),
                commit: "deadbeef".to_string(),
                tag: "deadbeef".to_string(),
                registry: "registry.zeitwork.com".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(key, "disk/abc123.img");
    }

    #[tokio::test]
    async fn test_process_runner_surfaces_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing-builder.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'clone failed: no such commit' >&2\nexit 1\n")
            .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runner = ProcessBuildRunner::new(script);
        let err = runner
            .build(&BuildInput {
                repository: "acme/app".to_string(),
                commit: "nope".to_string(),
                tag: "nope".to_string(),
                registry: "registry.zeitwork.com".to_string(),
            })
            .await
            .unwrap_err();
        assert!(format!("{}", err).contains("clone failed"));
    }
}
