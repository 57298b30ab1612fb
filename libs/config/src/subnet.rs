//! Subnet shapes and the address pool drawn from them
use std::{fmt, net::Ipv4Addr};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// problems found while building a [`Subnet`] or [`Pool`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubnetError {
    #[error("network mask {0} is not contiguous")]
    NonContiguousMask(Ipv4Addr),
    #[error("{role} address {ip} is outside of {network}")]
    OutsideNetwork {
        role: &'static str,
        ip: Ipv4Addr,
        network: Ipv4Net,
    },
    #[error("pool {start}..={end} does not fit the host range of {network}")]
    BadPool {
        start: u32,
        end: u32,
        network: Ipv4Net,
    },
}

/// The shape of a network a device resolves against: which mask it gets,
/// who answers DHCP, and which gateway/DNS it is handed.
///
/// Subnets compare structurally, two subnets with the same four addresses are
/// the same subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subnet {
    network_mask: Ipv4Addr,
    dhcp_server_ip: Ipv4Addr,
    router_ip: Ipv4Addr,
    dns_ip: Ipv4Addr,
}

impl Subnet {
    /// validates the mask is contiguous and every role sits in the
    /// router's network
    pub fn new(
        network_mask: Ipv4Addr,
        dhcp_server_ip: Ipv4Addr,
        router_ip: Ipv4Addr,
        dns_ip: Ipv4Addr,
    ) -> Result<Self, SubnetError> {
        let bits = u32::from(network_mask);
        if bits.leading_ones() + bits.trailing_zeros() != 32 {
            return Err(SubnetError::NonContiguousMask(network_mask));
        }
        let subnet = Self {
            network_mask,
            dhcp_server_ip,
            router_ip,
            dns_ip,
        };
        for (role, ip) in [("dhcp server", dhcp_server_ip), ("dns", dns_ip)] {
            if !subnet.contains(ip) {
                return Err(SubnetError::OutsideNetwork {
                    role,
                    ip,
                    network: subnet.network(),
                });
            }
        }
        Ok(subnet)
    }

    pub fn network_mask(&self) -> Ipv4Addr {
        self.network_mask
    }

    pub fn dhcp_server_ip(&self) -> Ipv4Addr {
        self.dhcp_server_ip
    }

    pub fn router_ip(&self) -> Ipv4Addr {
        self.router_ip
    }

    pub fn dns_ip(&self) -> Ipv4Addr {
        self.dns_ip
    }

    /// router, server and dns, never handed out to a dynamic device
    pub fn reserved(&self) -> [Ipv4Addr; 3] {
        [self.router_ip, self.dhcp_server_ip, self.dns_ip]
    }

    /// same subnet handing out a different gateway
    pub fn with_router(self, router_ip: Ipv4Addr) -> Self {
        Self { router_ip, ..self }
    }

    pub fn prefix_len(&self) -> u8 {
        u32::from(self.network_mask).leading_ones() as u8
    }

    /// `router_ip & network_mask`
    pub fn prefix(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.router_ip) & u32::from(self.network_mask))
    }

    pub fn network(&self) -> Ipv4Net {
        // prefix_len is at most 32
        Ipv4Net::new(self.prefix(), self.prefix_len())
            .unwrap_or_else(|_| Ipv4Net::from(self.prefix()))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.prefix()) | !u32::from(self.network_mask))
    }

    /// suffix of the broadcast address, the largest suffix in the network
    pub fn max_suffix(&self) -> u32 {
        !u32::from(self.network_mask)
    }

    /// address with host part `suffix` in this network
    pub fn host(&self, suffix: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.prefix()) | (suffix & self.max_suffix()))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & u32::from(self.network_mask) == u32::from(self.prefix())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (server {}, router {}, dns {})",
            self.network(),
            self.dhcp_server_ip,
            self.router_ip,
            self.dns_ip
        )
    }
}

/// Which of the two configured subnets a device resolves against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Ungated,
    Gated,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Ungated => f.write_str("ungated"),
            Policy::Gated => f.write_str("gated"),
        }
    }
}

/// The small set of subnets this deployment knows about. Lookups are
/// structural so a `Subnet` read back from storage resolves to the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetTable {
    ungated: Subnet,
    gated: Subnet,
}

impl SubnetTable {
    pub fn new(ungated: Subnet, gated: Subnet) -> Self {
        Self { ungated, gated }
    }

    pub fn get(&self, policy: Policy) -> Subnet {
        match policy {
            Policy::Ungated => self.ungated,
            Policy::Gated => self.gated,
        }
    }

    /// which policy a subnet value corresponds to, if any
    pub fn policy_of(&self, subnet: &Subnet) -> Option<Policy> {
        if *subnet == self.ungated {
            Some(Policy::Ungated)
        } else if *subnet == self.gated {
            Some(Policy::Gated)
        } else {
            None
        }
    }

    pub fn is_known(&self, subnet: &Subnet) -> bool {
        self.policy_of(subnet).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Policy, Subnet)> {
        [
            (Policy::Ungated, self.ungated),
            (Policy::Gated, self.gated),
        ]
        .into_iter()
    }
}

/// Host suffixes handed out to dynamic devices, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub start: u32,
    pub end: u32,
}

impl Default for Pool {
    fn default() -> Self {
        Self { start: 1, end: 253 }
    }
}

impl Pool {
    /// the pool must sit strictly between the network and broadcast suffixes
    pub fn validate(&self, subnet: &Subnet) -> Result<(), SubnetError> {
        if self.start == 0 || self.start > self.end || self.end >= subnet.max_suffix() {
            return Err(SubnetError::BadPool {
                start: self.start,
                end: self.end,
                network: subnet.network(),
            });
        }
        Ok(())
    }

    /// number of suffixes in the pool
    pub fn len(&self) -> u32 {
        (self.end + 1).saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// addresses of the pool in `subnet`, ascending, without the subnet's
    /// own router, server and dns
    pub fn addrs(&self, subnet: &Subnet) -> impl Iterator<Item = Ipv4Addr> {
        let subnet = *subnet;
        let reserved = subnet.reserved();
        (self.start..=self.end)
            .map(move |suffix| subnet.host(suffix))
            .filter(move |ip| !reserved.contains(ip))
    }

    pub fn contains(&self, subnet: &Subnet, ip: Ipv4Addr) -> bool {
        let suffix = u32::from(ip) & subnet.max_suffix();
        subnet.contains(ip) && (self.start..=self.end).contains(&suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> Subnet {
        Subnet::new(
            [255, 255, 255, 0].into(),
            [192, 168, 1, 2].into(),
            [192, 168, 1, 1].into(),
            [192, 168, 1, 2].into(),
        )
        .unwrap()
    }

    #[test]
    fn test_derived_addrs() {
        let subnet = home();
        assert_eq!(subnet.prefix(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(subnet.prefix_len(), 24);
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        assert_eq!(subnet.host(3), Ipv4Addr::new(192, 168, 1, 3));
        assert_eq!(subnet.network().to_string(), "192.168.1.0/24");
        assert!(subnet.contains([192, 168, 1, 77].into()));
        assert!(!subnet.contains([192, 168, 2, 77].into()));
    }

    #[test]
    fn test_structural_eq() {
        let gated = home().with_router([192, 168, 1, 2].into());
        assert_ne!(home(), gated);
        assert_eq!(gated, home().with_router([192, 168, 1, 2].into()));
        let table = SubnetTable::new(home(), gated);
        assert_eq!(table.policy_of(&gated), Some(Policy::Gated));
        assert_eq!(table.policy_of(&home()), Some(Policy::Ungated));
        assert!(!table.is_known(&home().with_router([192, 168, 1, 9].into())));
    }

    #[test]
    fn test_bad_mask() {
        let err = Subnet::new(
            [255, 0, 255, 0].into(),
            [192, 168, 1, 2].into(),
            [192, 168, 1, 1].into(),
            [192, 168, 1, 2].into(),
        )
        .unwrap_err();
        assert_eq!(err, SubnetError::NonContiguousMask([255, 0, 255, 0].into()));
    }

    #[test]
    fn test_role_outside_network() {
        let err = Subnet::new(
            [255, 255, 255, 0].into(),
            [10, 0, 0, 2].into(),
            [192, 168, 1, 1].into(),
            [192, 168, 1, 2].into(),
        )
        .unwrap_err();
        assert!(matches!(err, SubnetError::OutsideNetwork { role: "dhcp server", .. }));
    }

    #[test]
    fn test_pool_bounds() {
        let subnet = home();
        assert!(Pool::default().validate(&subnet).is_ok());
        assert!(Pool { start: 0, end: 10 }.validate(&subnet).is_err());
        assert!(Pool { start: 1, end: 255 }.validate(&subnet).is_err());
        assert!(Pool { start: 9, end: 8 }.validate(&subnet).is_err());

        let pool = Pool { start: 3, end: 5 };
        assert_eq!(pool.len(), 3);
        assert_eq!(
            pool.addrs(&subnet).collect::<Vec<_>>(),
            vec![
                Ipv4Addr::new(192, 168, 1, 3),
                Ipv4Addr::new(192, 168, 1, 4),
                Ipv4Addr::new(192, 168, 1, 5)
            ]
        );
        assert!(pool.contains(&subnet, [192, 168, 1, 4].into()));
        assert!(!pool.contains(&subnet, [192, 168, 1, 6].into()));
    }

    #[test]
    fn test_pool_skips_reserved() {
        let subnet = Subnet::new(
            [255, 255, 255, 0].into(),
            [192, 168, 1, 2].into(),
            [192, 168, 1, 1].into(),
            [192, 168, 1, 5].into(),
        )
        .unwrap();
        let addrs = Pool { start: 1, end: 6 }.addrs(&subnet).collect::<Vec<_>>();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(192, 168, 1, 3),
                Ipv4Addr::new(192, 168, 1, 4),
                Ipv4Addr::new(192, 168, 1, 6)
            ]
        );
    }
}
