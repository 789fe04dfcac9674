use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Context;

/// An IP network given as an address plus prefix length, e.g. `10.0.0.0/8`.
///
/// A bare address parses as a single-host network (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpNet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> anyhow::Result<Self> {
        let max = Self::max_prefix_len(&addr);
        if prefix_len > max {
            bail!("prefix length {prefix_len} exceeds {max} for {addr}");
        }
        Ok(Self {
            addr: Self::mask(addr, prefix_len),
            prefix_len,
        })
    }

    fn max_prefix_len(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
        match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V4((bits & mask).into())
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(prefix_len))
                    .unwrap_or(0);
                IpAddr::V6((bits & mask).into())
            }
        }
    }

    /// Whether `ip` falls inside this network. IPv4-mapped IPv6 addresses are
    /// compared as IPv4.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(*ip),
            IpAddr::V4(_) => *ip,
        };
        if ip.is_ipv4() != self.addr.is_ipv4() {
            return false;
        }
        Self::mask(ip, self.prefix_len) == self.addr
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpNet {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once('/') {
            Some((addr, prefix_len)) => {
                let addr: IpAddr = addr
                    .parse()
                    .with_context(|| format!("invalid whitelist address {input}"))?;
                let prefix_len: u8 = prefix_len
                    .parse()
                    .with_context(|| format!("invalid whitelist prefix length {input}"))?;
                Self::new(addr, prefix_len)
            }
            None => {
                let addr: IpAddr = input
                    .parse()
                    .with_context(|| format!("invalid whitelist address {input}"))?;
                Self::new(addr, Self::max_prefix_len(&addr))
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::net::Ipv4Addr;
    use std::net::Ipv6Addr;

    use proptest::prop_assert;
    use test_strategy::proptest;

    use super::*;

    #[test]
    fn cidr_contains_members_only() {
        let net: IpNet = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(&"192.168.1.77".parse().unwrap()));
        assert!(!net.contains(&"192.168.2.1".parse().unwrap()));
        assert!(!net.contains(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn bare_address_is_single_host() {
        let net: IpNet = "10.1.2.3".parse().unwrap();
        assert_eq!("10.1.2.3/32", net.to_string());
        assert!(net.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!net.contains(&"10.1.2.4".parse().unwrap()));
    }

    #[test]
    fn ipv4_mapped_address_matches_ipv4_net() {
        let net: IpNet = "127.0.0.0/8".parse().unwrap();
        let mapped = IpAddr::V6(Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped());
        assert!(net.contains(&mapped));
    }

    #[test]
    fn invalid_input_is_rejected() {
        assert!("1.2.3.4/33".parse::<IpNet>().is_err());
        assert!("not-an-ip".parse::<IpNet>().is_err());
        assert!("::1/129".parse::<IpNet>().is_err());
    }

    #[proptest]
    fn zero_prefix_contains_everything(ip: Ipv4Addr) {
        let net = IpNet::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).unwrap();
        prop_assert!(net.contains(&IpAddr::V4(ip)));
    }
}
