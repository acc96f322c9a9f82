use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use uuid::Uuid;

use zeitwork_core::{ids, ipv4};

/// TAP device name for a VM. Kernel interface names cap at 15 chars, so
/// the VM id is truncated to its first 8 hex digits.
pub fn tap_name(vm_id: &Uuid) -> String {
    format!("zt{}", ids::short_id(vm_id))
}

/// Run a shell snippet on the host, failing with its stderr.
async fn run_script(script: &str) -> Result<String> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .output()
        .await
        .with_context(|| "Failed to spawn shell")?;

    if !output.status.success() {
        anyhow::bail!(
            "Host network command failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Create and address the host side of a VM's /31 point-to-point link.
///
/// The guest holds the odd address of the pair, the host side sits on the
/// TAP device itself; no shared bridge is needed because every VM is a
/// network-isolated peer of its host. Idempotent: rules are checked before
/// being appended.
pub async fn setup_vm_link(vm_id: &Uuid, guest_ip: Ipv4Addr) -> Result<()> {
    let tap = tap_name(vm_id);
    let host_ip = ipv4::host_peer_ip(guest_ip);

    run_script(&format!(
        r#"
        echo 1 > /proc/sys/net/ipv4/ip_forward 2>/dev/null || true

        if ! ip link show {tap} >/dev/null 2>&1; then
            ip tuntap add dev {tap} mode tap
        fi
        ip addr replace {host_ip}/{prefix} dev {tap}
        ip link set {tap} up

        iptables -t nat -C POSTROUTING -s {guest_ip}/32 ! -o {tap} -j MASQUERADE 2>/dev/null || \
            iptables -t nat -A POSTROUTING -s {guest_ip}/32 ! -o {tap} -j MASQUERADE

        iptables -C FORWARD -i {tap} ! -o {tap} -j ACCEPT 2>/dev/null || \
            iptables -A FORWARD -i {tap} ! -o {tap} -j ACCEPT

        iptables -C FORWARD ! -i {tap} -o {tap} -m state --state RELATED,ESTABLISHED -j ACCEPT 2>/dev/null || \
            iptables -A FORWARD ! -i {tap} -o {tap} -m state --state RELATED,ESTABLISHED -j ACCEPT
        "#,
        tap = tap,
        host_ip = host_ip,
        guest_ip = guest_ip,
        prefix = ipv4::VM_PREFIX,
    ))
    .await?;

    Ok(())
}

/// Tear down a VM's TAP device and its NAT/forwarding rules.
pub async fn teardown_vm_link(vm_id: &Uuid, guest_ip: Ipv4Addr) -> Result<()> {
    let tap = tap_name(vm_id);

    run_script(&format!(
        r#"
        ip link set {tap} down 2>/dev/null || true
        ip link del {tap} 2>/dev/null || true

        iptables -t nat -D POSTROUTING -s {guest_ip}/32 ! -o {tap} -j MASQUERADE 2>/dev/null || true
        iptables -D FORWARD -i {tap} ! -o {tap} -j ACCEPT 2>/dev/null || true
        iptables -D FORWARD ! -i {tap} -o {tap} -m state --state RELATED,ESTABLISHED -j ACCEPT 2>/dev/null || true
        "#,
        tap = tap,
        guest_ip = guest_ip,
    ))
    .await?;

    Ok(())
}

/// Whether a VM's TAP device currently exists (liveness checks).
pub fn tap_exists(vm_id: &Uuid) -> bool {
    std::path::Path::new(&format!("/sys/class/net/{}", tap_name(vm_id))).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_fits_interface_limit() {
        let name = tap_name(&ids::new_id());
        assert!(name.len() <= 15, "{} too long", name);
        assert!(name.starts_with("zt"));
    }

    #[test]
    fn test_tap_name_is_stable_per_vm() {
        let id = ids::new_id();
        assert_eq!(tap_name(&id), tap_name(&id));
        assert_ne!(tap_name(&id), tap_name(&ids::new_id()));
    }
}
