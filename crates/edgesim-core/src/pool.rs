//! IPv4 address pools used by the allocator.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// First host offset handed out by fallback L2 pools.
pub const FALLBACK_FIRST_HOST: u32 = 10;

/// A sequential pool of host addresses inside one prefix.
///
/// The pool never hands out its own gateway, and it skips every address
/// already present in the shared `issued` set passed to [`IpPool::allocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPool {
    network: Ipv4Net,
    gateway: Option<Ipv4Addr>,
    next: u32,
    last: u32,
    exhausted: bool,
}

impl IpPool {
    /// Builds a pool from an IRB prefix such as `10.20.1.254/24`.
    ///
    /// The host part of the prefix is the gateway; every other usable host in
    /// the subnet is allocatable.
    pub fn from_gateway_prefix(prefix: &str) -> Result<Self> {
        let net = Ipv4Net::from_str(prefix.trim())
            .map_err(|e| Error::parse(format!("invalid IRB prefix '{prefix}': {e}")))?;
        let gateway = net.addr();
        let (first, last) = host_bounds(&net.trunc());
        Ok(Self {
            network: net.trunc(),
            gateway: Some(gateway),
            next: first,
            last,
            exhausted: false,
        })
    }

    /// Builds the fallback pool for a VLAN without an IRB:
    /// `172.(16 + id / 256).(id % 256).0/24`, hosts from `.10`, no gateway.
    pub fn fallback_for_vlan(vlan_id: u16) -> Result<Self> {
        if !(1..=4094).contains(&vlan_id) {
            return Err(Error::parse(format!("VLAN id {vlan_id} out of range")));
        }
        let second = 16 + (vlan_id / 256) as u8;
        let third = (vlan_id % 256) as u8;
        let network = Ipv4Addr::new(172, second, third, 0);
        let net = Ipv4Net::new(network, 24).map_err(|e| Error::parse(e.to_string()))?;
        let (_, last) = host_bounds(&net);
        Ok(Self {
            network: net,
            gateway: None,
            next: u32::from(network) + FALLBACK_FIRST_HOST,
            last,
            exhausted: false,
        })
    }

    /// The subnet this pool allocates from.
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// The gateway address, if any.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    /// Hands out the next free address as `a.b.c.d/len`, recording it in
    /// `issued`. Returns `None` when the pool is exhausted.
    pub fn allocate(&mut self, issued: &mut BTreeSet<Ipv4Addr>) -> Option<String> {
        while !self.exhausted && self.next <= self.last {
            let candidate = Ipv4Addr::from(self.next);
            match self.next.checked_add(1) {
                Some(next) => self.next = next,
                None => self.exhausted = true,
            }
            if Some(candidate) == self.gateway || issued.contains(&candidate) {
                continue;
            }
            issued.insert(candidate);
            return Some(format!("{candidate}/{}", self.network.prefix_len()));
        }
        None
    }
}

fn host_bounds(net: &Ipv4Net) -> (u32, u32) {
    let first = u32::from(net.network());
    let last = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        (first, last)
    } else {
        (first + 1, last - 1)
    }
}

/// Parses the gateway address out of an IRB prefix, ignoring malformed input.
pub fn gateway_of(prefix: &str) -> Option<Ipv4Addr> {
    Ipv4Net::from_str(prefix.trim()).ok().map(|net| net.addr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irb_pool_skips_gateway() {
        let mut pool = IpPool::from_gateway_prefix("10.0.0.1/24").unwrap();
        let mut issued = BTreeSet::new();
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("10.0.0.2/24"));
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("10.0.0.3/24"));
        assert_eq!(pool.gateway(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_irb_pool_with_high_gateway_starts_at_first_host() {
        let mut pool = IpPool::from_gateway_prefix("10.20.1.254/24").unwrap();
        let mut issued = BTreeSet::new();
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("10.20.1.1/24"));
    }

    #[test]
    fn test_shared_issued_set_is_respected() {
        let mut pool = IpPool::from_gateway_prefix("10.0.0.1/24").unwrap();
        let mut issued = BTreeSet::from([Ipv4Addr::new(10, 0, 0, 2)]);
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("10.0.0.3/24"));
        assert!(issued.contains(&Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = IpPool::from_gateway_prefix("192.168.0.1/30").unwrap();
        let mut issued = BTreeSet::new();
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("192.168.0.2/30"));
        assert_eq!(pool.allocate(&mut issued), None);
    }

    #[test]
    fn test_pool_ending_at_top_of_address_space() {
        let mut pool = IpPool::from_gateway_prefix("255.255.255.254/31").unwrap();
        let mut issued = BTreeSet::new();
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("255.255.255.255/31"));
        assert_eq!(pool.allocate(&mut issued), None);
        assert_eq!(pool.allocate(&mut issued), None);
    }

    #[test]
    fn test_fallback_pool_layout() {
        let mut pool = IpPool::fallback_for_vlan(1001).unwrap();
        let mut issued = BTreeSet::new();
        assert_eq!(pool.network().to_string(), "172.19.233.0/24");
        assert_eq!(pool.gateway(), None);
        assert_eq!(pool.allocate(&mut issued).as_deref(), Some("172.19.233.10/24"));

        let mut low = IpPool::fallback_for_vlan(10).unwrap();
        assert_eq!(low.allocate(&mut issued).as_deref(), Some("172.16.10.10/24"));
    }

    #[test]
    fn test_invalid_prefix() {
        assert!(IpPool::from_gateway_prefix("not-a-prefix").is_err());
        assert!(IpPool::fallback_for_vlan(0).is_err());
        assert_eq!(gateway_of("10.1.1.1/24"), Some(Ipv4Addr::new(10, 1, 1, 1)));
        assert_eq!(gateway_of("bogus"), None);
    }
}
