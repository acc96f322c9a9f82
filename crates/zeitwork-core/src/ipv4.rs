use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use thiserror::Error;

/// Base of the platform address pool. The first registered server gets this
/// range; each subsequent server gets the next contiguous /20.
pub const PLATFORM_POOL_BASE: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 0);

/// Prefix length of a per-server range.
pub const SERVER_PREFIX: u8 = 20;

/// Prefix length of a per-VM point-to-point link.
pub const VM_PREFIX: u8 = 31;

/// Upper bound of the platform pool. Server ranges are carved out of
/// 10.0.0.0/8; running past it is a hard allocation failure, not a wrap.
const POOL_CEILING: Ipv4Addr = Ipv4Addr::new(11, 0, 0, 0);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpAllocError {
    #[error("platform address pool exhausted (last range {0})")]
    PoolExhausted(Ipv4Network),
    #[error("no free /31 left in server range {0}")]
    RangeExhausted(Ipv4Network),
    #[error("address {0} lies outside server range {1}")]
    OutOfRange(Ipv4Addr, Ipv4Network),
}

/// The range assigned to the first server of the platform.
pub fn first_server_range() -> Ipv4Network {
    Ipv4Network::new(PLATFORM_POOL_BASE, SERVER_PREFIX).expect("static /20 is valid")
}

/// The next /20 after the highest allocated server range: previous high end
/// + 1, re-masked to /20.
pub fn next_server_range(highest: Ipv4Network) -> Result<Ipv4Network, IpAllocError> {
    let next_base = u32::from(highest.broadcast()).wrapping_add(1);
    if next_base >= u32::from(POOL_CEILING) || next_base == 0 {
        return Err(IpAllocError::PoolExhausted(highest));
    }
    Ipv4Network::new(Ipv4Addr::from(next_base), SERVER_PREFIX)
        .map_err(|_| IpAllocError::PoolExhausted(highest))
}

/// First guest address of a server range. base+0 is reserved for the host
/// side of the first pair, so the first guest lands on base+1.
pub fn first_guest_ip(range: Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(range.network()) + 1)
}

/// Next guest /31 slot after the highest allocated guest address: +2,
/// staying on the odd (guest) side of each pair.
///
/// Walks base+1, base+3, ... up to the top of the range; a full range is a
/// typed `RangeExhausted` error and never wraps into a neighbour's range.
pub fn next_guest_ip(range: Ipv4Network, highest: Ipv4Addr) -> Result<Ipv4Addr, IpAllocError> {
    if !range.contains(highest) {
        return Err(IpAllocError::OutOfRange(highest, range));
    }
    let candidate = u32::from(highest) + 2;
    if candidate > u32::from(range.broadcast()) {
        return Err(IpAllocError::RangeExhausted(range));
    }
    Ok(Ipv4Addr::from(candidate))
}

/// Host-side peer of a guest address (the even half of the /31 pair).
pub fn host_peer_ip(guest: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(guest) & !1)
}

/// Render a guest address as the /31 CIDR handed to the init agent.
pub fn guest_cidr(guest: Ipv4Addr) -> String {
    format!("{}/{}", guest, VM_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_first_server_range() {
        assert_eq!(first_server_range(), range("10.1.0.0/20"));
    }

    #[test]
    fn test_next_server_range_is_contiguous() {
        let next = next_server_range(range("10.1.0.0/20")).unwrap();
        assert_eq!(next, range("10.1.16.0/20"));
        let after = next_server_range(next).unwrap();
        assert_eq!(after, range("10.1.32.0/20"));
    }

    #[test]
    fn test_next_server_range_crosses_octet() {
        let next = next_server_range(range("10.1.240.0/20")).unwrap();
        assert_eq!(next, range("10.2.0.0/20"));
    }

    #[test]
    fn test_next_server_range_pool_exhaustion() {
        let last = range("10.255.240.0/20");
        assert_eq!(
            next_server_range(last),
            Err(IpAllocError::PoolExhausted(last))
        );
    }

    #[test]
    fn test_first_guest_ip_skips_host_side() {
        assert_eq!(
            first_guest_ip(range("10.1.0.0/20")),
            "10.1.0.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_next_guest_ip_steps_by_two() {
        let r = range("10.1.0.0/20");
        let second = next_guest_ip(r, "10.1.0.1".parse().unwrap()).unwrap();
        assert_eq!(second, "10.1.0.3".parse::<Ipv4Addr>().unwrap());
        let third = next_guest_ip(r, second).unwrap();
        assert_eq!(third, "10.1.0.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_guest_allocation_walks_entire_range_then_fails() {
        let r = range("10.1.0.0/20");
        let mut ip = first_guest_ip(r);
        let mut count = 1u32;
        loop {
            match next_guest_ip(r, ip) {
                Ok(next) => {
                    ip = next;
                    count += 1;
                }
                Err(e) => {
                    assert_eq!(e, IpAllocError::RangeExhausted(r));
                    break;
                }
            }
        }
        // A /20 holds 2048 /31 pairs; the last guest address sits at the top
        // of the range and the next allocation fails instead of wrapping.
        assert_eq!(count, 2048);
        assert_eq!(ip, "10.1.15.255".parse::<Ipv4Addr>().unwrap());
        assert!(r.contains(ip));
    }

    #[test]
    fn test_next_guest_ip_rejects_foreign_address() {
        let r = range("10.1.0.0/20");
        let foreign: Ipv4Addr = "10.9.0.1".parse().unwrap();
        assert_eq!(
            next_guest_ip(r, foreign),
            Err(IpAllocError::OutOfRange(foreign, r))
        );
    }

    #[test]
    fn test_host_peer_ip() {
        assert_eq!(
            host_peer_ip("10.1.0.1".parse().unwrap()),
            "10.1.0.0".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            host_peer_ip("10.1.0.7".parse().unwrap()),
            "10.1.0.6".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_guest_cidr_format() {
        assert_eq!(guest_cidr("10.1.0.3".parse().unwrap()), "10.1.0.3/31");
    }
}
