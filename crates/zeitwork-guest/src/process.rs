use std::path::Path;

use anyhow::{Context, Result};

use zeitwork_core::protocol::ProcessSpec;

/// Load the OCI-style process descriptor the builder baked into the root
/// image.
pub fn load_spec(path: &Path) -> Result<ProcessSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read process descriptor {}", path.display()))?;
    let spec: ProcessSpec = serde_json::from_str(&content)
        .with_context(|| format!("Malformed process descriptor {}", path.display()))?;
    anyhow::ensure!(!spec.args.is_empty(), "Process descriptor has no args");
    Ok(spec)
}

/// Drop to the target uid/gid.
///
/// Ordering is the invariant: supplementary groups are cleared first, then
/// the gid, then the uid — once the uid drops, the other two calls would
/// no longer be permitted.
#[cfg(target_os = "linux")]
pub fn drop_privileges(uid: u32, gid: u32) -> Result<()> {
    // SAFETY: straight-line syscalls, checked in order.
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "setgroups failed");
        }
        if libc::setgid(gid) != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("setgid({}) failed", gid));
        }
        if libc::setuid(uid) != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("setuid({}) failed", uid));
        }
    }
    Ok(())
}

/// Merge the image's baked-in environment with the host-provided runtime
/// environment; runtime values win on key collision.
pub fn merge_env(image_env: &[String], runtime_env: &[String]) -> Vec<String> {
    let runtime_keys: Vec<&str> = runtime_env
        .iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, _)| k))
        .collect();

    let mut merged: Vec<String> = image_env
        .iter()
        .filter(|kv| {
            kv.split_once('=')
                .map(|(k, _)| !runtime_keys.contains(&k))
                .unwrap_or(true)
        })
        .cloned()
        .collect();
    merged.extend_from_slice(runtime_env);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_spec_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.json");
        std::fs::write(
            &path,
            r#"{"args": ["/app/server", "--port", "8080"], "env": ["A=1"], "cwd": "/app", "uid": 1000, "gid": 1000}"#,
        )
        .unwrap();

        let spec = load_spec(&path).unwrap();
        assert_eq!(spec.args[0], "/app/server");
        assert_eq!(spec.cwd, "/app");
        assert_eq!(spec.uid, 1000);
    }

    #[test]
    fn test_load_spec_rejects_empty_args() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.json");
        std::fs::write(&path, r#"{"args": [], "uid": 0, "gid": 0}"#).unwrap();
        assert!(load_spec(&path).is_err());
    }

    #[test]
    fn test_merge_env_runtime_wins() {
        let merged = merge_env(
            &["PATH=/bin".to_string(), "PORT=3000".to_string()],
            &["PORT=8080".to_string(), "EXTRA=x".to_string()],
        );
        assert!(merged.contains(&"PATH=/bin".to_string()));
        assert!(merged.contains(&"PORT=8080".to_string()));
        assert!(merged.contains(&"EXTRA=x".to_string()));
        assert!(!merged.contains(&"PORT=3000".to_string()));
    }

    #[test]
    fn test_merge_env_keeps_malformed_entries() {
        let merged = merge_env(&["JUSTAFLAG".to_string()], &[]);
        assert_eq!(merged, vec!["JUSTAFLAG"]);
    }
}
