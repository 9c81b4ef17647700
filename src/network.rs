use std::net::IpAddr;

use ipnet::IpNet;

/// 有序的 CIDR 列表 / Ordered list of CIDR ranges, compiled once from config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetList {
    nets: Vec<IpNet>,
}

impl NetList {
    /// Parse every entry with [`parse_net`]. The first malformed entry aborts the whole list.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, NetParseError> {
        let mut nets = Vec::with_capacity(entries.len());
        for entry in entries {
            nets.push(parse_net(entry.as_ref())?);
        }
        Ok(Self { nets })
    }

    #[inline]
    pub fn contains(&self, addr: IpAddr) -> bool {
        contains(addr, &self.nets)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.nets.iter()
    }
}

/// True iff `addr` falls inside at least one of `nets`.
/// Family mismatch (v4 address against a v6 range and vice versa) is never a match.
#[inline]
pub fn contains(addr: IpAddr, nets: &[IpNet]) -> bool {
    nets.iter().any(|net| net.contains(&addr))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid network '{entry}': {reason}")]
pub struct NetParseError {
    pub entry: String,
    pub reason: String,
}

/// 解析 CIDR 或单个地址 / Parse `addr/len` or a bare address.
/// A bare address becomes a single-host range (/32 for IPv4, /128 for IPv6).
/// Host bits below the prefix are cleared.
pub fn parse_net(entry: &str) -> Result<IpNet, NetParseError> {
    let s = entry.trim();
    let err = |reason: String| NetParseError {
        entry: entry.to_string(),
        reason,
    };
    if s.contains('/') {
        let net = s.parse::<IpNet>().map_err(|e| err(e.to_string()))?;
        Ok(net.trunc())
    } else {
        let addr = s.parse::<IpAddr>().map_err(|e| err(e.to_string()))?;
        let host_len = if addr.is_ipv4() { 32 } else { 128 };
        IpNet::new(addr, host_len).map_err(|e| err(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn bare_addresses_become_host_routes() {
        assert_eq!(parse_net("10.1.2.3").unwrap().prefix_len(), 32);
        assert_eq!(parse_net("2001:db8::1").unwrap().prefix_len(), 128);
        assert_eq!(parse_net(" 8.8.8.8 ").unwrap(), "8.8.8.8/32".parse().unwrap());
    }

    #[test]
    fn host_bits_are_truncated() {
        let net = parse_net("10.1.2.3/8").unwrap();
        assert_eq!(net, "10.0.0.0/8".parse().unwrap());
        assert!(net.contains(&ip("10.200.0.1")));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        for bad in ["10.0.0.0/33", "not-an-ip", "10.0.0/8", "", "::1/129", "1.2.3.4/"] {
            let err = parse_net(bad).unwrap_err();
            assert_eq!(err.entry, bad);
        }
    }

    #[test]
    fn list_parse_stops_at_first_bad_entry() {
        let err = NetList::parse(&["10.0.0.0/8", "bogus", "192.168.0.0/16"]).unwrap_err();
        assert_eq!(err.entry, "bogus");
    }

    #[test]
    fn contains_uses_or_semantics() {
        let list = NetList::parse(&["10.0.0.0/8", "192.168.1.0/24"]).unwrap();
        assert!(list.contains(ip("10.9.9.9")));
        assert!(list.contains(ip("192.168.1.77")));
        assert!(!list.contains(ip("192.168.2.1")));
        assert!(!list.contains(ip("172.16.0.1")));
    }

    #[test]
    fn address_family_mismatch_is_not_a_match() {
        let v4 = NetList::parse(&["0.0.0.0/0"]).unwrap();
        let v6 = NetList::parse(&["::/0"]).unwrap();
        assert!(!v4.contains(ip("2001:db8::1")));
        assert!(!v4.contains(ip("::ffff:10.0.0.1")));
        assert!(!v6.contains(ip("10.0.0.1")));
        assert!(v6.contains(ip("2001:db8::1")));
    }

    #[test]
    fn empty_list_matches_nothing() {
        let list = NetList::default();
        assert_eq!(list.iter().count(), 0);
        assert!(!list.contains(ip("0.0.0.0")));
    }
}
