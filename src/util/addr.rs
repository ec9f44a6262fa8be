use std::net::{IpAddr, SocketAddr};

/// An address is usable as a hole-punched P2P endpoint if it names exactly one host and one port:
///  no unspecified / broadcast / multicast IP, no port 0.
pub fn is_unicast_endpoint(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast()),
        IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
    }
}

/// `addr` with its port replaced - used to spread probes over neighbouring ports
pub fn with_port(addr: &SocketAddr, port: u16) -> SocketAddr {
    let mut result = *addr;
    result.set_port(port);
    result
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::regular("1.2.3.4:5000", true)]
    #[case::loopback("127.0.0.1:5000", true)]
    #[case::zero_port("1.2.3.4:0", false)]
    #[case::unspecified("0.0.0.0:5000", false)]
    #[case::broadcast("255.255.255.255:5000", false)]
    #[case::multicast("224.0.0.1:5000", false)]
    #[case::v6_regular("[2001:db8::1]:5000", true)]
    #[case::v6_unspecified("[::]:5000", false)]
    #[case::v6_multicast("[ff02::1]:5000", false)]
    fn test_is_unicast_endpoint(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(is_unicast_endpoint(&SocketAddr::from_str(addr).unwrap()), expected);
    }
}
