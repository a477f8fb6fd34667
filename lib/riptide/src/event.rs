use std::fmt;

/// Application-side reference to a peer slot. The index addresses host-owned storage and
/// the generation observes staleness: once the slot is reclaimed the generation bumps and
/// old handles dereference to `ErrorType::StaleHandle` instead of aliasing the successor.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct PeerHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl PeerHandle {
    #[inline]
    pub(crate) fn new(index: usize, generation: u32) -> PeerHandle {
        PeerHandle { index, generation }
    }

    /// Slot index, stable for the lifetime of the connection. Useful as a compact map key
    /// on the application side.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "peer#{}.{}", self.index, self.generation)
    }
}

/// Why the listening side refused a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DenialReason {
    TokenRejected,
    AuthenticationRejected,
    ChannelMismatch,
    VersionMismatch,
    TableFull,
    Timeout,
}

/// Everything `Host::service` reports to the application. Events own their payload
/// buffers and release them on drop.
#[derive(Debug, Eq, PartialEq)]
pub enum Event {
    /// An inbound candidate presented its connection token; the embedder must call
    /// `accept_connection_token` or `deny` on the handle to advance the handshake.
    CheckConnectionToken { peer: PeerHandle, token: Box<[u8]> },
    /// The candidate proved key possession and presented its authentication token;
    /// gate with `accept_authentication_token` or `deny`.
    CheckAuthenticationToken { peer: PeerHandle, token: Box<[u8]> },
    /// Connecting side: the remote listener approved the handshake.
    Approval { peer: PeerHandle, data: u32 },
    /// The connection is fully established in both directions.
    Connect { peer: PeerHandle, data: u32 },
    /// Clean teardown observed, locally requested or remote initiated.
    Disconnect { peer: PeerHandle, reason: u32 },
    /// Connecting side: the remote listener refused us.
    Denial { peer: PeerHandle, reason: DenialReason },
    /// Path probing settled on a new maximum datagram size.
    Mtu { peer: PeerHandle, mtu: usize },
    /// One message, in the delivery order of its channel.
    Receive {
        peer: PeerHandle,
        channel: u8,
        message: Box<[u8]>,
    },
}

impl Event {
    /// The peer this event concerns.
    #[inline]
    pub fn peer(&self) -> PeerHandle {
        match self {
            Event::CheckConnectionToken { peer, .. }
            | Event::CheckAuthenticationToken { peer, .. }
            | Event::Approval { peer, .. }
            | Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::Denial { peer, .. }
            | Event::Mtu { peer, .. }
            | Event::Receive { peer, .. } => *peer,
        }
    }
}
