use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use serde::Serialize;
use tokio::net::UnixStream;
use tracing::{info, warn};
use uuid::Uuid;

use zeitwork_db::vms::Vm;

use crate::netns;

/// Kernel image shipped alongside the agent. Every customer VM boots the
/// same kernel; its built-in initramfs carries the init agent, which
/// mounts the customer root from the virtio disk.
const KERNEL_PATH: &str = "/var/lib/zeitwork/vmlinux";

/// Boot args: serial console for early output, immediate reboot-on-panic
/// so a crashed guest terminates instead of hanging, init agent as PID 1.
const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 rdinit=/init";

/// Guest-side vsock context id (Firecracker convention).
const GUEST_CID: u32 = 3;

// ============================================================================
// Boot manifest (Firecracker --config-file format)
// ============================================================================

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    guest_mac: String,
    host_dev_name: String,
}

#[derive(Debug, Serialize)]
struct MachineCfg {
    vcpu_count: u32,
    mem_size_mib: u32,
}

#[derive(Debug, Serialize)]
struct VsockCfg {
    guest_cid: u32,
    uds_path: String,
}

#[derive(Debug, Serialize)]
struct BootManifest {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,
    drives: Vec<Drive>,
    #[serde(rename = "network-interfaces")]
    network_interfaces: Vec<NetworkInterface>,
    #[serde(rename = "machine-config")]
    machine_config: MachineCfg,
    vsock: VsockCfg,
}

/// Deterministic locally-administered MAC derived from the VM's guest IP,
/// so a re-materialized VM keeps its address mapping.
pub fn guest_mac(guest_ip: std::net::Ipv4Addr) -> String {
    let o = guest_ip.octets();
    format!("06:00:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

/// Write the boot manifest for a VM into its working directory.
pub async fn write_manifest(vm: &Vm, vm_dir: &Path, rootfs: &Path, kernel: &Path) -> Result<PathBuf> {
    let manifest = BootManifest {
        boot_source: BootSource {
            kernel_image_path: kernel.display().to_string(),
            boot_args: BOOT_ARGS.to_string(),
        },
        drives: vec![Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: rootfs.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        }],
        network_interfaces: vec![NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: guest_mac(vm.guest_ipv4()?),
            host_dev_name: netns::tap_name(&vm.id),
        }],
        machine_config: MachineCfg {
            vcpu_count: vm.vcpus.max(1) as u32,
            mem_size_mib: vm.memory_mib.max(128) as u32,
        },
        vsock: VsockCfg {
            guest_cid: GUEST_CID,
            uds_path: zeitwork_core::protocol::vsock_uds_path(&vm_dir.display().to_string()),
        },
    };

    let path = vm_dir.join("config.json");
    let json = serde_json::to_vec_pretty(&manifest)?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write boot manifest {}", path.display()))?;
    Ok(path)
}

/// Default kernel path (overridable for tests).
pub fn default_kernel() -> PathBuf {
    PathBuf::from(KERNEL_PATH)
}

// ============================================================================
// Process lifecycle
// ============================================================================

/// A launched microVM process.
#[derive(Debug, Clone)]
pub struct Machine {
    pub vm_id: Uuid,
    pub pid: i32,
    pub vm_dir: PathBuf,
    pub launched_at: std::time::Instant,
    /// Set by the reaper task once the process has been waited on.
    pub exited: Arc<AtomicBool>,
}

impl Machine {
    /// Whether the hypervisor process is still alive.
    pub fn alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
            && std::path::Path::new(&format!("/proc/{}", self.pid)).exists()
    }

    pub fn api_socket(&self) -> PathBuf {
        self.vm_dir.join("fc.sock")
    }
}

/// Launch Firecracker for a VM: boot manifest + API socket, console output
/// captured into the working directory.
pub async fn launch(firecracker: &Path, vm_id: Uuid, vm_dir: &Path, manifest: &Path) -> Result<Machine> {
    let api_sock = vm_dir.join("fc.sock");
    let _ = tokio::fs::remove_file(&api_sock).await;

    let console_log = std::fs::File::create(vm_dir.join("console.log"))
        .with_context(|| "Failed to create console log")?;
    let console_err = console_log.try_clone()?;

    let mut child = tokio::process::Command::new(firecracker)
        .arg("--api-sock")
        .arg(&api_sock)
        .arg("--config-file")
        .arg(manifest)
        .stdin(Stdio::null())
        .stdout(Stdio::from(console_log))
        .stderr(Stdio::from(console_err))
        .spawn()
        .with_context(|| format!("Failed to spawn {}", firecracker.display()))?;

    let pid = child
        .id()
        .ok_or_else(|| anyhow::anyhow!("Firecracker exited before reporting a pid"))?
        as i32;

    let exited = Arc::new(AtomicBool::new(false));
    {
        let exited = Arc::clone(&exited);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(vm = %vm_id, %status, "microVM process exited"),
                Err(e) => warn!(vm = %vm_id, error = %e, "Failed to reap microVM process"),
            }
            exited.store(true, Ordering::SeqCst);
        });
    }

    info!(vm = %vm_id, pid, "microVM launched");
    Ok(Machine {
        vm_id,
        pid,
        vm_dir: vm_dir.to_path_buf(),
        launched_at: std::time::Instant::now(),
        exited,
    })
}

/// Ask the guest to power down via the Firecracker API (Ctrl-Alt-Del).
pub async fn shutdown_graceful(machine: &Machine) -> Result<()> {
    api_put(
        &machine.api_socket(),
        "/actions",
        r#"{"action_type": "SendCtrlAltDel"}"#,
    )
    .await
}

/// Kill the hypervisor process outright.
pub fn kill(machine: &Machine) {
    // SAFETY: plain signal send; stale pids at worst EPERM/ESRCH.
    unsafe {
        libc::kill(machine.pid, libc::SIGKILL);
    }
}

/// One PUT against the Firecracker API socket.
async fn api_put(socket: &Path, path: &str, body: &str) -> Result<()> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("Failed to connect to API socket {}", socket.display()))?;
    let io = hyper_util::rt::TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .with_context(|| "API handshake failed")?;
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method(hyper::Method::PUT)
        .uri(path)
        .header(hyper::header::HOST, "localhost")
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))?;

    let response = sender
        .send_request(request)
        .await
        .with_context(|| format!("API PUT {} failed", path))?;

    anyhow::ensure!(
        response.status().is_success() || response.status().is_informational(),
        "API PUT {} returned {}",
        path,
        response.status()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;

    fn vm() -> Vm {
        let now = chrono::Utc::now();
        Vm {
            id: zeitwork_core::ids::new_id(),
            organisation_id: zeitwork_core::ids::new_id(),
            image_id: zeitwork_core::ids::new_id(),
            server_id: zeitwork_core::ids::new_id(),
            ip_address: "10.1.0.5/31".parse().unwrap(),
            port: 8080,
            vcpus: 2,
            memory_mib: 512,
            env_variables: Json(vec![]),
            metadata: Json(serde_json::json!({})),
            status: zeitwork_db::status::VmStatus::Pending,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_guest_mac_is_deterministic_and_local() {
        let mac = guest_mac("10.1.0.5".parse().unwrap());
        assert_eq!(mac, "06:00:0a:01:00:05");
        // Locally administered, unicast.
        assert!(mac.starts_with("06:"));
    }

    #[tokio::test]
    async fn test_manifest_contains_expected_sections() {
        let dir = tempfile::tempdir().unwrap();
        let vm = vm();
        let rootfs = dir.path().join("rootfs.ext4");
        let kernel = PathBuf::from("/var/lib/zeitwork/vmlinux");

        let path = write_manifest(&vm, dir.path(), &rootfs, &kernel).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();

        assert_eq!(parsed["boot-source"]["kernel_image_path"], "/var/lib/zeitwork/vmlinux");
        assert_eq!(parsed["drives"][0]["is_root_device"], true);
        assert_eq!(parsed["machine-config"]["vcpu_count"], 2);
        assert_eq!(parsed["machine-config"]["mem_size_mib"], 512);
        assert_eq!(parsed["vsock"]["guest_cid"], 3);
        assert_eq!(
            parsed["network-interfaces"][0]["host_dev_name"],
            netns::tap_name(&vm.id)
        );
        assert!(
            parsed["vsock"]["uds_path"]
                .as_str()
                .unwrap()
                .ends_with("/v.sock")
        );
    }
}
