use crate::address::{Address, FamilyMode};
use crate::network::{InterfaceFilter, Network};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::time::{Duration, Instant};
use undertow::logging;

const RECEIVE_POLL_TOKEN: mio::Token = mio::Token(0);

/// Kernel UDP socket provider. Readiness is observed through a `mio` poll so `receive`
/// can block with a bounded timeout while everything else stays non-blocking.
pub struct UdpNetwork {
    socket: Option<mio::net::UdpSocket>,
    poll: mio::Poll,
    events: mio::Events,
    local: Option<Address>,
    mode: FamilyMode,
    log: logging::Logger,
}

impl UdpNetwork {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> NetworkResult<UdpNetwork> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "udp")),
            _ => logging::discard(),
        };

        Ok(UdpNetwork {
            socket: None,
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(64),
            local: None,
            mode: FamilyMode::V4,
            log,
        })
    }

    /// The socket address actually handed to the kernel: v4-mapped targets go out as
    /// plain v4 on a v4 socket and as mapped v6 on a v6 socket.
    #[inline]
    fn wire_addr(&self, to: &Address) -> SocketAddr {
        match self.mode {
            FamilyMode::V4 => to.to_socket_addr(),
            FamilyMode::V6 | FamilyMode::Dual => {
                let ip = Ipv6Addr::from(to.host);
                SocketAddr::V6(SocketAddrV6::new(ip, to.port, 0, to.scope))
            }
        }
    }

    #[inline]
    fn socket(&self) -> NetworkResult<&mio::net::UdpSocket> {
        self.socket
            .as_ref()
            .ok_or(NetworkError::Fatal(ErrorType::Unbound))
    }
}

impl Network for UdpNetwork {
    fn bind(&mut self, address: &Address, mode: FamilyMode) -> NetworkResult<Address> {
        if !address.matches_family(mode) {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        // A v4 wildcard request on a v6-capable mode rebinds to the v6 wildcard so the
        // socket family matches the mode.
        let bind_addr = match mode {
            FamilyMode::V4 => address.to_socket_addr(),
            FamilyMode::V6 | FamilyMode::Dual => {
                if address.is_v4() {
                    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, address.port, 0, 0))
                } else {
                    address.to_socket_addr()
                }
            }
        };

        let socket = mio::net::UdpSocket::bind(&bind_addr)?;

        self.poll.register(
            &socket,
            RECEIVE_POLL_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let local = Address::from(socket.local_addr()?);

        logging::debug!(self.log, "socket bound";
                        "requested" => %address,
                        "bound" => %local,
                        "mode" => ?mode);

        self.socket = Some(socket);
        self.local = Some(local);
        self.mode = mode;

        Ok(local)
    }

    fn send(&mut self, data: &[u8], to: &Address) -> NetworkResult<()> {
        let target = self.wire_addr(to);
        let socket = self.socket()?;

        match socket.send_to(data, &target) {
            Ok(_) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> NetworkResult<Option<(usize, Address)>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Edge-triggered readiness: data may already be pending from a previous
            // wakeup, so always try the socket first.
            match self.socket()?.recv_from(buffer) {
                Ok((size, from)) => return Ok(Some((size, Address::from(from)))),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => (),
                Err(err) => return Err(err.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            self.poll.poll(&mut self.events, Some(deadline - now))?;

            if self.events.is_empty() {
                return Ok(None);
            }
        }
    }

    fn resolve(&mut self, host: &str, port: u16) -> NetworkResult<Address> {
        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetworkError::Fatal(ErrorType::ResolveFailure))?
            .collect();

        // Prefer an address usable with the bound socket family.
        let preferred = candidates
            .iter()
            .find(|addr| Address::from(**addr).matches_family(self.mode))
            .or_else(|| candidates.first());

        match preferred {
            Some(addr) => Ok(Address::from(*addr)),
            None => Err(NetworkError::Fatal(ErrorType::ResolveFailure)),
        }
    }

    fn interfaces(&mut self, filter: InterfaceFilter) -> NetworkResult<Vec<Address>> {
        let mut found = Vec::new();

        if filter != InterfaceFilter::NonLoopback {
            found.push(Address::from_v4(Ipv4Addr::LOCALHOST, 0));
            found.push(Address::from_v6(Ipv6Addr::LOCALHOST, 0, 0));
        }

        if filter != InterfaceFilter::Loopback {
            // Routing probe: connecting a throwaway socket selects the outbound
            // interface without emitting traffic.
            if let Ok(probe) = std::net::UdpSocket::bind("0.0.0.0:0") {
                if probe.connect("192.0.2.1:9").is_ok() {
                    if let Ok(local) = probe.local_addr() {
                        found.push(Address::from(local));
                    }
                }
            }
        }

        Ok(found)
    }

    fn local_address(&self) -> NetworkResult<Address> {
        self.local.ok_or(NetworkError::Fatal(ErrorType::Unbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_bind_fails() {
        let mut network = UdpNetwork::new(None).unwrap();

        let target = Address::loopback_v4(9999);
        assert_eq!(
            network.send(&[1, 2, 3], &target).unwrap_err(),
            NetworkError::Fatal(ErrorType::Unbound)
        );
    }

    #[test]
    fn test_bind_family_mismatch() {
        let mut network = UdpNetwork::new(None).unwrap();

        let v6 = Address::parse("[::1]:0").unwrap();
        assert_eq!(
            network.bind(&v6, FamilyMode::V4).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidArgument)
        );
    }

    #[test]
    fn test_loopback_datagram_roundtrip() {
        let mut alpha = UdpNetwork::new(None).unwrap();
        let mut beta = UdpNetwork::new(None).unwrap();

        let alpha_addr = alpha.bind(&Address::loopback_v4(0), FamilyMode::V4).unwrap();
        let beta_addr = beta.bind(&Address::loopback_v4(0), FamilyMode::V4).unwrap();

        assert_ne!(alpha_addr.port, 0);

        alpha.send(b"over the wire", &beta_addr).unwrap();

        let mut buffer = [0u8; 64];
        let (size, from) = beta
            .receive(&mut buffer, Duration::from_secs(2))
            .unwrap()
            .expect("datagram expected");

        assert_eq!(&buffer[..size], b"over the wire");
        assert_eq!(from, alpha_addr);
    }

    #[test]
    fn test_receive_timeout_is_none() {
        let mut network = UdpNetwork::new(None).unwrap();
        network.bind(&Address::loopback_v4(0), FamilyMode::V4).unwrap();

        let mut buffer = [0u8; 64];
        let received = network
            .receive(&mut buffer, Duration::from_millis(20))
            .unwrap();

        assert_eq!(received, None);
    }

    #[test]
    fn test_resolve_loopback() {
        let mut network = UdpNetwork::new(None).unwrap();
        let addr = network.resolve("localhost", 4242).unwrap();

        assert_eq!(addr.port, 4242);
    }
}
