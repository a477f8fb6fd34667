//! Datagram substrate abstraction. The host speaks to one `Network` implementation and
//! never touches sockets directly: the same protocol engine runs over a kernel UDP
//! socket, the in-process switch, or either of those wrapped in the interference
//! simulator.

use crate::address::{Address, FamilyMode};
use crate::support::NetworkResult;
use std::time::Duration;

pub mod simulator;
pub mod switch;
pub mod udp;

pub use self::simulator::InterferenceSimulator;
pub use self::switch::{SwitchFabric, SwitchNetwork};
pub use self::udp::UdpNetwork;

/// Interface enumeration filter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InterfaceFilter {
    Loopback,
    NonLoopback,
    All,
}

/// An unreliable datagram endpoint. Datagrams are opaque byte buffers; providers never
/// parse them. All operations are non-blocking except `receive`, which blocks up to its
/// timeout.
pub trait Network {
    /// Binds the endpoint. Returns the concrete bound address (with the port filled in
    /// when the wildcard port was requested).
    fn bind(&mut self, address: &Address, mode: FamilyMode) -> NetworkResult<Address>;

    /// Sends one datagram. `Wait` signals transient congestion; the caller retries on
    /// its next pass.
    fn send(&mut self, data: &[u8], to: &Address) -> NetworkResult<()>;

    /// Receives one datagram into `buffer`, waiting up to `timeout`. Returns `None` when
    /// the timeout elapses without traffic.
    fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> NetworkResult<Option<(usize, Address)>>;

    /// Resolves a hostname to an address usable with this provider.
    fn resolve(&mut self, host: &str, port: u16) -> NetworkResult<Address>;

    /// Enumerates local interface addresses matching the filter.
    fn interfaces(&mut self, filter: InterfaceFilter) -> NetworkResult<Vec<Address>>;

    /// The bound local address.
    fn local_address(&self) -> NetworkResult<Address>;
}
