//! Early-boot plumbing for PID 1: pseudo-filesystem mounts, NIC
//! configuration via ioctl, the pivot into the customer root. Everything
//! here runs before the customer process exists.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result, bail};

fn cstr(s: &str) -> Result<CString> {
    CString::new(s).with_context(|| format!("Embedded NUL in {}", s))
}

/// mount(2) wrapper.
pub fn mount(source: &str, target: &str, fstype: &str, flags: libc::c_ulong, data: Option<&str>) -> Result<()> {
    let source = cstr(source)?;
    let target_c = cstr(target)?;
    let fstype = cstr(fstype)?;
    let data_c = data.map(cstr).transpose()?;

    // SAFETY: all pointers are live CStrings for the duration of the call.
    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target_c.as_ptr(),
            fstype.as_ptr(),
            flags,
            data_c
                .as_ref()
                .map(|d| d.as_ptr() as *const libc::c_void)
                .unwrap_or(std::ptr::null()),
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Re-running over an existing mount is fine.
        if err.raw_os_error() == Some(libc::EBUSY) {
            return Ok(());
        }
        return Err(err).with_context(|| format!("mount {} failed", target));
    }
    Ok(())
}

/// Mount proc, sys, and devtmpfs in the current root.
pub fn mount_pseudo_filesystems() -> Result<()> {
    std::fs::create_dir_all("/proc").ok();
    std::fs::create_dir_all("/sys").ok();
    std::fs::create_dir_all("/dev").ok();
    mount("proc", "/proc", "proc", 0, None)?;
    mount("sysfs", "/sys", "sysfs", 0, None)?;
    mount("devtmpfs", "/dev", "devtmpfs", 0, None)?;
    Ok(())
}

/// Mount the customer root image from the virtio block device.
pub fn mount_customer_root(device: &str, target: &str) -> Result<()> {
    std::fs::create_dir_all(target)
        .with_context(|| format!("Failed to create {}", target))?;
    mount(device, target, "ext4", 0, None)
}

/// Move a pseudo-filesystem mount into the customer root.
pub fn move_mount(from: &str, to: &str) -> Result<()> {
    std::fs::create_dir_all(to).ok();
    mount(from, to, "", libc::MS_MOVE, None)
}

/// Bind a single file from the initramfs into the customer root. Used for
/// the exec shim, the only host binary that crosses into the customer
/// filesystem.
pub fn bind_file(source: &str, target: &str) -> Result<()> {
    if let Some(parent) = Path::new(target).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if !Path::new(target).exists() {
        std::fs::write(target, b"").with_context(|| format!("Failed to create {}", target))?;
    }
    mount(source, target, "", libc::MS_BIND, None)
}

/// chroot into the customer root and chdir to /.
pub fn enter_root(root: &str) -> Result<()> {
    let root_c = cstr(root)?;
    // SAFETY: chroot/chdir with a live CString.
    unsafe {
        if libc::chroot(root_c.as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("chroot {} failed", root));
        }
        if libc::chdir(c"/".as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "chdir / failed");
        }
    }
    Ok(())
}

/// sethostname(2).
pub fn set_hostname(hostname: &str) -> Result<()> {
    // SAFETY: pointer + length of a live str.
    let rc = unsafe { libc::sethostname(hostname.as_ptr() as *const libc::c_char, hostname.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("sethostname {} failed", hostname));
    }
    Ok(())
}

/// Minimal resolver config for the customer root.
pub fn write_resolv_conf(path: &str) -> Result<()> {
    std::fs::write(path, "nameserver 1.1.1.1\nnameserver 8.8.8.8\n")
        .with_context(|| format!("Failed to write {}", path))
}

// ============================================================================
// NIC configuration (ioctl; the initramfs carries no `ip` binary)
// ============================================================================

/// Parse "a.b.c.d/31" into address and prefix length.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        bail!("Not a CIDR: {}", cidr);
    };
    let addr: Ipv4Addr = addr.parse().with_context(|| format!("Bad address in {}", cidr))?;
    let prefix: u8 = prefix.parse().with_context(|| format!("Bad prefix in {}", cidr))?;
    anyhow::ensure!(prefix <= 32, "Prefix out of range in {}", cidr);
    Ok((addr, prefix))
}

/// Netmask for a prefix length.
pub fn netmask(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::from(u32::MAX << (32 - prefix as u32))
    }
}

fn sockaddr_in(addr: Ipv4Addr) -> libc::sockaddr_in {
    // SAFETY: zeroed POD struct.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sa
}

fn ifreq_with_name(name: &str) -> Result<libc::ifreq> {
    anyhow::ensure!(name.len() < libc::IFNAMSIZ, "Interface name too long: {}", name);
    // SAFETY: zeroed POD struct.
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, b) in name.bytes().enumerate() {
        req.ifr_name[i] = b as libc::c_char;
    }
    Ok(req)
}

/// Address, netmask, and UP flag for one interface.
pub fn configure_interface(name: &str, addr: Ipv4Addr, prefix: u8) -> Result<()> {
    // SAFETY: ioctl calls over a scratch AF_INET socket; all request
    // structs are stack-local.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "socket for ioctl failed");
        }

        let mut req = ifreq_with_name(name)?;
        req.ifr_ifru.ifru_addr = std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sockaddr_in(addr));
        if libc::ioctl(fd, libc::SIOCSIFADDR, &req) < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(e).with_context(|| format!("SIOCSIFADDR {} failed", name));
        }

        let mut req = ifreq_with_name(name)?;
        req.ifr_ifru.ifru_netmask =
            std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sockaddr_in(netmask(prefix)));
        if libc::ioctl(fd, libc::SIOCSIFNETMASK, &req) < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(e).with_context(|| format!("SIOCSIFNETMASK {} failed", name));
        }

        let mut req = ifreq_with_name(name)?;
        if libc::ioctl(fd, libc::SIOCGIFFLAGS, &req) < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(e).with_context(|| format!("SIOCGIFFLAGS {} failed", name));
        }
        req.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        if libc::ioctl(fd, libc::SIOCSIFFLAGS, &req) < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(e).with_context(|| format!("SIOCSIFFLAGS {} failed", name));
        }

        libc::close(fd);
    }
    Ok(())
}

/// Default route via the host side of the /31.
pub fn set_default_route(gateway: Ipv4Addr) -> Result<()> {
    // SAFETY: SIOCADDRT with a stack-local rtentry.
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| "socket for route failed");
        }

        let mut route: libc::rtentry = std::mem::zeroed();
        route.rt_dst = std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sockaddr_in(Ipv4Addr::UNSPECIFIED));
        route.rt_genmask =
            std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sockaddr_in(Ipv4Addr::UNSPECIFIED));
        route.rt_gateway = std::mem::transmute::<libc::sockaddr_in, libc::sockaddr>(sockaddr_in(gateway));
        route.rt_flags = libc::RTF_UP | libc::RTF_GATEWAY;

        if libc::ioctl(fd, libc::SIOCADDRT, &route) < 0 {
            let e = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(e).with_context(|| format!("SIOCADDRT via {} failed", gateway));
        }
        libc::close(fd);
    }
    Ok(())
}

/// Bring up loopback and the primary NIC with the /31 from the host
/// config.
pub fn configure_network(ip_cidr: &str, gateway: &str) -> Result<()> {
    let (addr, prefix) = parse_cidr(ip_cidr)?;
    let gateway: Ipv4Addr = gateway
        .parse()
        .with_context(|| format!("Bad gateway {}", gateway))?;

    configure_interface("lo", Ipv4Addr::LOCALHOST, 8)?;
    configure_interface("eth0", addr, prefix)?;
    set_default_route(gateway)?;
    Ok(())
}

/// sync + power off. The host treats power-off as the end of the VM
/// lifecycle.
pub fn power_off() -> ! {
    // SAFETY: final syscalls of PID 1.
    unsafe {
        libc::sync();
        libc::reboot(libc::RB_POWER_OFF);
    }
    // reboot(2) does not return on success; if it somehow did, parking
    // beats returning into a dead init.
    loop {
        std::thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cidr() {
        let (addr, prefix) = parse_cidr("10.1.0.3/31").unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 1, 0, 3));
        assert_eq!(prefix, 31);
        assert!(parse_cidr("10.1.0.3").is_err());
        assert!(parse_cidr("10.1.0.3/33").is_err());
        assert!(parse_cidr("banana/31").is_err());
    }

    #[test]
    fn test_netmask() {
        assert_eq!(netmask(31), Ipv4Addr::new(255, 255, 255, 254));
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(8), Ipv4Addr::new(255, 0, 0, 0));
        assert_eq!(netmask(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(netmask(32), Ipv4Addr::new(255, 255, 255, 255));
    }
}
