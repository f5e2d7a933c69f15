//! Overlay address pool

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{ControlError, ControlResult};

/// Host addresses of the account range.
///
/// Network and broadcast addresses are excluded for IPv4 prefixes shorter
/// than /31.
#[derive(Debug, Clone, Copy)]
pub struct IpPool {
    range: IpNet,
}

impl IpPool {
    pub fn new(range: IpNet) -> Self {
        Self { range: range.trunc() }
    }

    pub fn range(&self) -> IpNet {
        self.range
    }

    /// Whether `ip` is an assignable host address of the range
    pub fn contains(&self, ip: &IpAddr) -> bool {
        if !self.range.contains(ip) {
            return false;
        }
        match self.range {
            IpNet::V4(net) if net.prefix_len() < 31 => {
                *ip != IpAddr::V4(net.network()) && *ip != IpAddr::V4(net.broadcast())
            }
            _ => true,
        }
    }

    /// First host address not in `used`
    pub fn allocate(&self, used: &HashSet<IpAddr>) -> ControlResult<IpAddr> {
        self.range
            .hosts()
            .find(|ip| !used.contains(ip))
            .ok_or(ControlError::PoolExhausted(self.range))
    }

    /// Check an explicitly requested address
    pub fn validate(&self, ip: IpAddr) -> ControlResult<()> {
        if self.contains(&ip) {
            Ok(())
        } else {
            Err(ControlError::AddressOutOfRange { ip, range: self.range })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str) -> IpPool {
        IpPool::new(cidr.parse().unwrap())
    }

    #[test]
    fn test_first_free_skips_network_address() {
        let ip = pool("100.64.0.0/24").allocate(&HashSet::new()).unwrap();
        assert_eq!(ip, "100.64.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_allocate_skips_used() {
        let used: HashSet<IpAddr> = ["100.64.0.1".parse().unwrap(), "100.64.0.2".parse().unwrap()].into();
        let ip = pool("100.64.0.0/24").allocate(&used).unwrap();
        assert_eq!(ip, "100.64.0.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_slash_30_has_two_hosts() {
        let pool = pool("10.0.0.0/30");
        let mut used = HashSet::new();
        used.insert(pool.allocate(&used).unwrap());
        used.insert(pool.allocate(&used).unwrap());

        assert!(matches!(pool.allocate(&used), Err(ControlError::PoolExhausted(_))));
        assert!(!pool.contains(&"10.0.0.3".parse().unwrap()));
    }

    #[test]
    fn test_validate_rejects_outside_and_broadcast() {
        let pool = pool("100.64.0.0/24");
        assert!(pool.validate("100.64.0.77".parse().unwrap()).is_ok());
        assert!(matches!(
            pool.validate("10.0.0.1".parse().unwrap()),
            Err(ControlError::AddressOutOfRange { .. })
        ));
        assert!(pool.validate("100.64.0.255".parse().unwrap()).is_err());
    }
}
