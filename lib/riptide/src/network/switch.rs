use crate::address::{Address, FamilyMode};
use crate::network::{InterfaceFilter, Network};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Per-port inbox depth. The substrate is unreliable, so overflow silently drops, the
/// same as a saturated kernel receive buffer would.
const PORT_QUEUE_DEPTH: usize = 1024;

/// First port handed out by the wildcard allocator.
const EPHEMERAL_BASE: u16 = 0x4000;

struct Datagram {
    from: Address,
    data: Vec<u8>,
}

struct FabricState {
    ports: HashMap<u16, VecDeque<Datagram>>,
    next_port: u16,
}

struct FabricShared {
    state: Mutex<FabricState>,
    wakeup: Condvar,
}

/// In-process virtual switch. Every endpoint created from one fabric can reach every
/// other; hosts on different threads may share a fabric, since delivery runs under one
/// mutex with a condvar for blocked receivers.
#[derive(Clone)]
pub struct SwitchFabric {
    shared: Arc<FabricShared>,
}

impl SwitchFabric {
    pub fn new() -> SwitchFabric {
        SwitchFabric {
            shared: Arc::new(FabricShared {
                state: Mutex::new(FabricState {
                    ports: HashMap::new(),
                    next_port: EPHEMERAL_BASE,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Creates an unbound endpoint attached to this fabric.
    pub fn endpoint(&self) -> SwitchNetwork {
        SwitchNetwork {
            shared: self.shared.clone(),
            local: None,
        }
    }
}

/// One endpoint on a `SwitchFabric`. Addresses use the v4 loopback host; only the port
/// distinguishes endpoints.
pub struct SwitchNetwork {
    shared: Arc<FabricShared>,
    local: Option<Address>,
}

impl SwitchNetwork {
    #[inline]
    fn local(&self) -> NetworkResult<Address> {
        self.local.ok_or(NetworkError::Fatal(ErrorType::Unbound))
    }
}

impl Network for SwitchNetwork {
    fn bind(&mut self, address: &Address, _mode: FamilyMode) -> NetworkResult<Address> {
        let mut state = self.shared.state.lock().expect("Fabric lock poisoned");

        let port = match address.port {
            0 => {
                // Scan for a free ephemeral port; the space is 16 bits so a full fabric
                // is an embedder bug.
                let mut candidate = state.next_port;
                loop {
                    if !state.ports.contains_key(&candidate) {
                        break;
                    }
                    candidate = candidate.wrapping_add(1).max(EPHEMERAL_BASE);
                    if candidate == state.next_port {
                        return Err(NetworkError::Fatal(ErrorType::TableFull));
                    }
                }
                state.next_port = candidate.wrapping_add(1).max(EPHEMERAL_BASE);
                candidate
            }
            requested => {
                if state.ports.contains_key(&requested) {
                    return Err(NetworkError::Fatal(ErrorType::Io(
                        std::io::ErrorKind::AddrInUse,
                    )));
                }
                requested
            }
        };

        state.ports.insert(port, VecDeque::new());

        let local = Address::from_v4(Ipv4Addr::LOCALHOST, port);
        self.local = Some(local);

        Ok(local)
    }

    fn send(&mut self, data: &[u8], to: &Address) -> NetworkResult<()> {
        let from = self.local()?;
        let mut state = self.shared.state.lock().expect("Fabric lock poisoned");

        // Unknown target ports swallow traffic, like the real network does.
        if let Some(queue) = state.ports.get_mut(&to.port) {
            if queue.len() < PORT_QUEUE_DEPTH {
                queue.push_back(Datagram {
                    from,
                    data: data.to_vec(),
                });
                self.shared.wakeup.notify_all();
            }
        }

        Ok(())
    }

    fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> NetworkResult<Option<(usize, Address)>> {
        let local = self.local()?;
        let deadline = Instant::now() + timeout;

        let mut state = self.shared.state.lock().expect("Fabric lock poisoned");

        loop {
            let queue = state
                .ports
                .get_mut(&local.port)
                .ok_or(NetworkError::Fatal(ErrorType::Unbound))?;

            if let Some(datagram) = queue.pop_front() {
                let size = datagram.data.len().min(buffer.len());
                buffer[..size].copy_from_slice(&datagram.data[..size]);
                return Ok(Some((size, datagram.from)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (next_state, wait) = self
                .shared
                .wakeup
                .wait_timeout(state, deadline - now)
                .expect("Fabric lock poisoned");

            state = next_state;

            if wait.timed_out() {
                // One last drain attempt before reporting the timeout.
                continue;
            }
        }
    }

    fn resolve(&mut self, host: &str, port: u16) -> NetworkResult<Address> {
        match host {
            "localhost" | "127.0.0.1" => Ok(Address::from_v4(Ipv4Addr::LOCALHOST, port)),
            _ => Err(NetworkError::Fatal(ErrorType::ResolveFailure)),
        }
    }

    fn interfaces(&mut self, _filter: InterfaceFilter) -> NetworkResult<Vec<Address>> {
        Ok(vec![Address::from_v4(Ipv4Addr::LOCALHOST, 0)])
    }

    fn local_address(&self) -> NetworkResult<Address> {
        self.local()
    }
}

impl Drop for SwitchNetwork {
    fn drop(&mut self) {
        // Release the port so no further traffic can be queued for this endpoint.
        if let Some(local) = self.local {
            if let Ok(mut state) = self.shared.state.lock() {
                state.ports.remove(&local.port);
            }
            self.shared.wakeup.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_allocates_distinct_ports() {
        let fabric = SwitchFabric::new();
        let mut alpha = fabric.endpoint();
        let mut beta = fabric.endpoint();

        let a = alpha.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();
        let b = beta.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();

        assert_ne!(a.port, b.port);
    }

    #[test]
    fn test_bind_addr_in_use() {
        let fabric = SwitchFabric::new();
        let mut alpha = fabric.endpoint();
        let mut beta = fabric.endpoint();

        alpha.bind(&Address::any_v4(7777), FamilyMode::V4).unwrap();

        assert_eq!(
            beta.bind(&Address::any_v4(7777), FamilyMode::V4).unwrap_err(),
            NetworkError::Fatal(ErrorType::Io(std::io::ErrorKind::AddrInUse))
        );
    }

    #[test]
    fn test_datagram_roundtrip() {
        let fabric = SwitchFabric::new();
        let mut alpha = fabric.endpoint();
        let mut beta = fabric.endpoint();

        let alpha_addr = alpha.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();
        let beta_addr = beta.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();

        alpha.send(b"through the fabric", &beta_addr).unwrap();

        let mut buffer = [0u8; 64];
        let (size, from) = beta
            .receive(&mut buffer, Duration::from_millis(100))
            .unwrap()
            .expect("datagram expected");

        assert_eq!(&buffer[..size], b"through the fabric");
        assert_eq!(from, alpha_addr);
    }

    #[test]
    fn test_receive_timeout() {
        let fabric = SwitchFabric::new();
        let mut endpoint = fabric.endpoint();
        endpoint.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();

        let mut buffer = [0u8; 16];
        let received = endpoint
            .receive(&mut buffer, Duration::from_millis(10))
            .unwrap();

        assert_eq!(received, None);
    }

    #[test]
    fn test_send_to_unbound_port_is_swallowed() {
        let fabric = SwitchFabric::new();
        let mut endpoint = fabric.endpoint();
        endpoint.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();

        let ghost = Address::from_v4(Ipv4Addr::LOCALHOST, 9);
        endpoint.send(b"into the void", &ghost).unwrap();
    }

    #[test]
    fn test_drop_releases_port() {
        let fabric = SwitchFabric::new();

        let addr = {
            let mut endpoint = fabric.endpoint();
            endpoint.bind(&Address::any_v4(4040), FamilyMode::V4).unwrap()
        };

        let mut second = fabric.endpoint();
        assert_eq!(
            second.bind(&Address::any_v4(addr.port), FamilyMode::V4).unwrap(),
            addr
        );
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let fabric = SwitchFabric::new();
        let mut receiver = fabric.endpoint();
        let receiver_addr = receiver.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();

        let sender_fabric = fabric.clone();
        let handle = std::thread::spawn(move || {
            let mut sender = sender_fabric.endpoint();
            sender.bind(&Address::any_v4(0), FamilyMode::V4).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            sender.send(b"wakeup", &receiver_addr).unwrap();
        });

        let mut buffer = [0u8; 16];
        let received = receiver
            .receive(&mut buffer, Duration::from_secs(2))
            .unwrap();

        assert!(received.is_some());
        handle.join().unwrap();
    }
}
