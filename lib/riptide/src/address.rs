use crate::support::{ErrorType, NetworkError, NetworkResult};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address family selection at bind time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FamilyMode {
    V4,
    V6,
    /// V6 socket accepting v4-mapped traffic where the platform allows it.
    Dual,
}

/// Protocol-agnostic endpoint address. IPv4 addresses are stored v4-mapped in the 16 byte
/// host field, so one value type covers both families.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Address {
    pub host: [u8; 16],
    pub port: u16,
    pub scope: u32,
}

const V4_MAPPED_PREFIX: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff];

impl Address {
    /// The v4 wildcard address with the given port.
    #[inline]
    pub fn any_v4(port: u16) -> Address {
        Address::from_v4(Ipv4Addr::UNSPECIFIED, port)
    }

    /// The v6 wildcard address with the given port.
    #[inline]
    pub fn any_v6(port: u16) -> Address {
        Address::from_v6(Ipv6Addr::UNSPECIFIED, port, 0)
    }

    /// The v4 loopback address with the given port.
    #[inline]
    pub fn loopback_v4(port: u16) -> Address {
        Address::from_v4(Ipv4Addr::LOCALHOST, port)
    }

    #[inline]
    pub fn from_v4(ip: Ipv4Addr, port: u16) -> Address {
        let octets = ip.octets();
        let mut host = [0u8; 16];
        host[..12].copy_from_slice(&V4_MAPPED_PREFIX);
        host[12..].copy_from_slice(&octets);

        Address { host, port, scope: 0 }
    }

    #[inline]
    pub fn from_v6(ip: Ipv6Addr, port: u16, scope: u32) -> Address {
        Address {
            host: ip.octets(),
            port,
            scope,
        }
    }

    /// True when the host field carries a v4-mapped address.
    #[inline]
    pub fn is_v4(&self) -> bool {
        self.host[..12] == V4_MAPPED_PREFIX
    }

    /// Parses `ip:port` in either family. Hostnames are not accepted here; those go
    /// through `Network::resolve`.
    pub fn parse(text: &str) -> NetworkResult<Address> {
        let socket_addr = text.parse::<SocketAddr>()?;
        Ok(Address::from(socket_addr))
    }

    /// Converts to a std socket address, preferring the v4 form for mapped hosts.
    #[inline]
    pub fn to_socket_addr(&self) -> SocketAddr {
        if self.is_v4() {
            let ip = Ipv4Addr::new(self.host[12], self.host[13], self.host[14], self.host[15]);
            SocketAddr::V4(SocketAddrV4::new(ip, self.port))
        } else {
            let ip = Ipv6Addr::from(self.host);
            SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, self.scope))
        }
    }

    /// Checks the address against a bind family. A v4-mapped address is acceptable to
    /// both `V4` and `Dual` sockets.
    #[inline]
    pub fn matches_family(&self, mode: FamilyMode) -> bool {
        match mode {
            FamilyMode::V4 => self.is_v4(),
            FamilyMode::V6 => !self.is_v4(),
            FamilyMode::Dual => true,
        }
    }

    /// Family mode implied by this address on its own.
    #[inline]
    pub fn family(&self) -> FamilyMode {
        if self.is_v4() {
            FamilyMode::V4
        } else {
            FamilyMode::V6
        }
    }

    /// Ensures the port is set, failing on the wildcard port where a concrete remote
    /// endpoint is required.
    #[inline]
    pub fn require_port(&self) -> NetworkResult<()> {
        match self.port {
            0 => Err(NetworkError::Fatal(ErrorType::InvalidArgument)),
            _ => Ok(()),
        }
    }
}

impl From<SocketAddr> for Address {
    #[inline]
    fn from(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(v4) => Address::from_v4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::from_v6(*v6.ip(), v6.port(), v6.scope_id()),
        }
    }
}

impl From<Address> for SocketAddr {
    #[inline]
    fn from(addr: Address) -> SocketAddr {
        addr.to_socket_addr()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_mapping_roundtrip() {
        let addr = Address::parse("127.0.0.1:64242").unwrap();

        assert!(addr.is_v4());
        assert_eq!(addr.port, 64242);
        assert_eq!(addr.to_socket_addr().to_string(), "127.0.0.1:64242");
    }

    #[test]
    fn test_v6_roundtrip() {
        let addr = Address::parse("[::1]:9000").unwrap();

        assert!(!addr.is_v4());
        assert_eq!(addr.to_socket_addr().to_string(), "[::1]:9000");
    }

    #[test]
    fn test_family_matching() {
        let v4 = Address::parse("10.0.0.1:1").unwrap();
        let v6 = Address::parse("[fe80::1]:1").unwrap();

        assert!(v4.matches_family(FamilyMode::V4));
        assert!(!v4.matches_family(FamilyMode::V6));
        assert!(v4.matches_family(FamilyMode::Dual));

        assert!(!v6.matches_family(FamilyMode::V4));
        assert!(v6.matches_family(FamilyMode::V6));
        assert!(v6.matches_family(FamilyMode::Dual));
    }

    #[test]
    fn test_parse_rejects_hostname() {
        assert_eq!(
            Address::parse("localhost:80").unwrap_err(),
            NetworkError::Fatal(ErrorType::AddrParse)
        );
    }

    #[test]
    fn test_wildcard_port_rejected_for_remote() {
        let addr = Address::parse("127.0.0.1:0").unwrap();
        assert!(addr.require_port().is_err());

        let addr = Address::parse("127.0.0.1:1234").unwrap();
        assert!(addr.require_port().is_ok());
    }
}
