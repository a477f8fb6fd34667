use crate::address::{Address, FamilyMode};
use crate::channel::ChannelKind;
use crate::command::{Command, CommandBody, ConnectBody, DisconnectMode, VerifyConnectBody, CONTROL_CHANNEL, COOKIE_SIZE};
use crate::compress::Compressor;
use crate::config::Config;
use crate::event::{DenialReason, Event, PeerHandle};
use crate::frame::{self, Header, SESSION_UNASSIGNED};
use crate::network::Network;
use crate::peer::{Peer, PeerOutput, PeerState};
use crate::support::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use undertow::crypto;
use undertow::logging;
use undertow::time::Clock;

/// Datagrams drained per wakeup before the pass returns to timer work.
const RECEIVE_BATCH: usize = 256;

/// Cookie time-bucket width; a cookie stays valid for the current and previous bucket.
const COOKIE_BUCKET_MS: u64 = 32_000;

/// Receive scratch size, comfortably above any ceiling MTU.
const RECEIVE_BUFFER_SIZE: usize = 65536;

/// Shared configuration, clock and seed carrier. Multiple hosts may hold the same
/// instance; each host still owns its socket and all its protocol state.
pub struct Instance {
    config: Config,
    clock: Clock,
    seed: u64,
    log: logging::Logger,
}

impl Instance {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(config: Config, log: L) -> Arc<Instance> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Arc::new(Instance {
            config,
            clock: Clock::new(),
            seed: crypto::random_u64(),
            log,
        })
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// One monotonic millisecond clock shared by every host on this instance.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Seed for non-cryptographic random streams (the interference simulator).
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn log(&self) -> &logging::Logger {
        &self.log
    }
}

/// Running protocol counters, readable through `Host::stats`. The peers report their
/// per-datagram outcomes and retransmissions into this struct during every pass.
#[derive(Debug, Default, Clone)]
pub struct HostStats {
    pub delivered_datagrams: u64,
    pub dropped_datagrams: u64,
    pub mac_failures: u64,
    pub decompression_failures: u64,
    pub retransmissions: u64,
    pub sent_datagrams: u64,
}

struct Slot {
    peer: Option<Peer>,
    generation: u32,
}

/// The single entry point the application pumps. Owns the datagram endpoint, the peer
/// table and the event queue; all protocol state advances inside `service`, `connect`,
/// `broadcast`, `flush` and the teardown path, on one thread.
pub struct Host {
    instance: Arc<Instance>,
    network: Box<dyn Network>,
    compressor: Option<Box<dyn Compressor>>,

    bound: Option<Address>,
    channel_kinds: Vec<ChannelKind>,
    terminated: bool,

    slots: Vec<Slot>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    by_connection: HashMap<(Address, u64), usize>,

    events: VecDeque<Event>,
    staged: Vec<(Address, Vec<u8>)>,
    receive_buffer: Vec<u8>,

    cookie_secret: [u8; 32],
    stats: HostStats,

    log: logging::Logger,
}

impl Host {
    /// Constructs an idle host over a network provider. `start` binds and begins
    /// accepting traffic.
    pub fn create(instance: Arc<Instance>, network: Box<dyn Network>) -> Host {
        let mut cookie_secret = [0u8; 32];
        crypto::random_bytes(&mut cookie_secret);

        let log = instance.log().new(logging::o!("component" => "host"));

        Host {
            instance,
            network,
            compressor: None,
            bound: None,
            channel_kinds: Vec::new(),
            terminated: false,
            slots: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            by_connection: HashMap::new(),
            events: VecDeque::new(),
            staged: Vec::new(),
            receive_buffer: vec![0u8; RECEIVE_BUFFER_SIZE],
            cookie_secret,
            stats: HostStats::default(),
            log,
        }
    }

    /// Installs a per-host compressor. Must happen before traffic flows; the wire stays
    /// self-describing either way.
    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        self.compressor = Some(compressor);
    }

    /// Binds the endpoint and fixes the channel-type vector peers negotiate against.
    pub fn start(
        &mut self,
        address: &Address,
        mode: FamilyMode,
        channel_kinds: &[ChannelKind],
    ) -> NetworkResult<Address> {
        self.check_alive()?;

        if self.bound.is_some() {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }
        if channel_kinds.is_empty() || channel_kinds.len() > self.instance.config().max_channels {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        let bound = self.network.bind(address, mode)?;
        self.bound = Some(bound);
        self.channel_kinds = channel_kinds.to_vec();

        logging::info!(self.log, "host started";
                       "address" => %bound,
                       "channels" => channel_kinds.len());

        Ok(bound)
    }

    #[inline]
    pub fn local_address(&self) -> NetworkResult<Address> {
        self.bound.ok_or(NetworkError::Fatal(ErrorType::Unbound))
    }

    #[inline]
    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    /// Resolves a hostname through the underlying provider.
    pub fn resolve(&mut self, host: &str, port: u16) -> NetworkResult<Address> {
        self.network.resolve(host, port)
    }

    /// Initiates a handshake toward a remote host. The returned handle is live
    /// immediately; the connection is usable after the `Connect` event.
    pub fn connect(
        &mut self,
        address: &Address,
        channel_count: usize,
        data: u32,
    ) -> NetworkResult<PeerHandle> {
        self.connect_with_tokens(address, channel_count, data, &[], &[])
    }

    /// `connect` with explicit connection and authentication tokens for the remote
    /// host's two gating decisions.
    pub fn connect_with_tokens(
        &mut self,
        address: &Address,
        channel_count: usize,
        data: u32,
        connection_token: &[u8],
        authentication_token: &[u8],
    ) -> NetworkResult<PeerHandle> {
        self.check_alive()?;
        self.local_address()?;
        address.require_port()?;

        if channel_count == 0 || channel_count > self.channel_kinds.len() {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        let kinds = self.channel_kinds[..channel_count].to_vec();
        let now_ms = self.instance.now_ms();

        let index = self.allocate_slot()?;
        let handle = PeerHandle::new(index, self.slots[index].generation);

        let peer = Peer::connecting(
            handle,
            *address,
            kinds,
            data,
            connection_token.to_vec().into_boxed_slice(),
            authentication_token.to_vec().into_boxed_slice(),
            self.instance.config(),
            now_ms,
            &self.log,
        );

        self.by_connection.insert((*address, peer.connection_id()), index);
        self.slots[index].peer = Some(peer);
        self.live.insert(index);

        // The connect-request leaves on this pass rather than waiting for `service`.
        self.advance_peers(now_ms);
        self.transmit_staged();

        Ok(handle)
    }

    /// Enqueues one message on a connected peer's channel.
    pub fn send(&mut self, peer: PeerHandle, channel: u8, data: &[u8]) -> NetworkResult<()> {
        self.check_alive()?;
        self.peer_mut(peer)?.send(channel, data)
    }

    /// Enqueues a message for every connected peer.
    pub fn broadcast(&mut self, channel: u8, data: &[u8]) -> NetworkResult<()> {
        self.check_alive()?;

        for &index in self.live.iter() {
            if let Some(peer) = self.slots[index].peer.as_mut() {
                if peer.state() == PeerState::Connected {
                    peer.send(channel, data)?;
                }
            }
        }

        Ok(())
    }

    /// Requests teardown. With `linger`, unacked reliable traffic flushes first,
    /// bounded by the peer timeout.
    pub fn disconnect(&mut self, peer: PeerHandle, reason: u32, linger: bool) -> NetworkResult<()> {
        self.check_alive()?;
        let now_ms = self.instance.now_ms();
        let config = self.instance.config().clone();

        let target = self.peer_mut(peer)?;
        target.expect_disconnect_event();
        target.disconnect(reason, linger, &config, now_ms);

        Ok(())
    }

    /// Embedder decision: admit the candidate past the connection-token gate.
    pub fn accept_connection_token(&mut self, peer: PeerHandle) -> NetworkResult<()> {
        self.check_alive()?;
        let now_ms = self.instance.now_ms();
        let config = self.instance.config().clone();
        self.peer_mut(peer)?.accept_connection_token(&config, now_ms)
    }

    /// Embedder decision: admit the candidate past the authentication-token gate.
    pub fn accept_authentication_token(&mut self, peer: PeerHandle) -> NetworkResult<()> {
        self.check_alive()?;

        let config = self.instance.config();
        let (slots, events) = (&mut self.slots, &mut self.events);

        let target = Self::slot_peer(slots, peer)?;
        target.accept_authentication_token(config, events)
    }

    /// Embedder decision: refuse the candidate at either gate.
    pub fn deny(&mut self, peer: PeerHandle, reason: DenialReason) -> NetworkResult<()> {
        self.check_alive()?;
        let now_ms = self.instance.now_ms();
        self.peer_mut(peer)?.deny(reason, now_ms);
        Ok(())
    }

    pub fn peer_state(&self, peer: PeerHandle) -> NetworkResult<PeerState> {
        Ok(self.peer_ref(peer)?.state())
    }

    pub fn peer_address(&self, peer: PeerHandle) -> NetworkResult<Address> {
        Ok(self.peer_ref(peer)?.address())
    }

    pub fn peer_round_trip_ms(&self, peer: PeerHandle) -> NetworkResult<u64> {
        Ok(self.peer_ref(peer)?.round_trip_ms())
    }

    pub fn peer_mtu(&self, peer: PeerHandle) -> NetworkResult<usize> {
        Ok(self.peer_ref(peer)?.mtu())
    }

    /// Coalesces and emits pending datagrams without waiting on the socket.
    pub fn flush(&mut self) -> NetworkResult<()> {
        self.check_alive()?;

        let now_ms = self.instance.now_ms();
        self.advance_peers(now_ms);
        self.transmit_staged();

        Ok(())
    }

    /// Marks the host terminated. The current pass finishes; every later call fails
    /// with `Terminated`.
    pub fn destroy(&mut self) {
        self.terminated = true;
    }

    /// One pass of the event pump. Blocks on the socket up to `timeout_ms`, advances
    /// every timer against a single `now`, emits due retransmissions and pings, and
    /// returns at most one event.
    pub fn service(&mut self, timeout_ms: u64) -> NetworkResult<Option<Event>> {
        self.check_alive()?;
        self.local_address()?;

        let deadline_ms = self.instance.now_ms() + timeout_ms;

        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            let now_ms = self.instance.now_ms();
            self.advance_peers(now_ms);
            self.transmit_staged();

            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }

            let now_ms = self.instance.now_ms();
            if now_ms >= deadline_ms {
                return Ok(None);
            }

            // Sleep no longer than the nearest peer deadline.
            let mut wake_ms = deadline_ms;
            for &index in self.live.iter() {
                if let Some(peer) = self.slots[index].peer.as_ref() {
                    if let Some(timer) = peer.next_timer_ms(self.instance.config()) {
                        wake_ms = wake_ms.min(timer);
                    }
                }
            }

            let wait = Duration::from_millis(wake_ms.saturating_sub(now_ms).min(timeout_ms).max(1));

            match self.network.receive(&mut self.receive_buffer, wait) {
                Ok(Some((size, from))) => {
                    self.ingest_datagram(from, size);

                    // Drain whatever else is already queued before the next timer pass.
                    for _ in 1..RECEIVE_BATCH {
                        match self.network.receive(&mut self.receive_buffer, Duration::from_millis(0)) {
                            Ok(Some((size, from))) => self.ingest_datagram(from, size),
                            Ok(None) | Err(NetworkError::Wait) => break,
                            Err(fatal) => return Err(fatal),
                        }
                    }
                }
                Ok(None) | Err(NetworkError::Wait) => (),
                Err(fatal) => return Err(fatal),
            }
        }
    }

    // ------------------------------------------------------------------ internals

    #[inline]
    fn check_alive(&self) -> NetworkResult<()> {
        match self.terminated {
            true => Err(NetworkError::Fatal(ErrorType::Terminated)),
            false => Ok(()),
        }
    }

    fn allocate_slot(&mut self) -> NetworkResult<usize> {
        if self.live.len() >= self.instance.config().max_peers {
            return Err(NetworkError::Fatal(ErrorType::TableFull));
        }

        Ok(match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    peer: None,
                    generation: 0,
                });
                self.slots.len() - 1
            }
        })
    }

    fn slot_peer<'a>(slots: &'a mut [Slot], handle: PeerHandle) -> NetworkResult<&'a mut Peer> {
        let slot = slots
            .get_mut(handle.index)
            .ok_or(NetworkError::Fatal(ErrorType::StaleHandle))?;

        if slot.generation != handle.generation {
            return Err(NetworkError::Fatal(ErrorType::StaleHandle));
        }

        slot.peer
            .as_mut()
            .ok_or(NetworkError::Fatal(ErrorType::StaleHandle))
    }

    fn peer_mut(&mut self, handle: PeerHandle) -> NetworkResult<&mut Peer> {
        Self::slot_peer(&mut self.slots, handle)
    }

    fn peer_ref(&self, handle: PeerHandle) -> NetworkResult<&Peer> {
        let slot = self
            .slots
            .get(handle.index)
            .ok_or(NetworkError::Fatal(ErrorType::StaleHandle))?;

        if slot.generation != handle.generation {
            return Err(NetworkError::Fatal(ErrorType::StaleHandle));
        }

        slot.peer
            .as_ref()
            .ok_or(NetworkError::Fatal(ErrorType::StaleHandle))
    }

    /// Pumps every live peer against one `now`, then reclaims zombie slots whose grace
    /// period ran out.
    fn advance_peers(&mut self, now_ms: u64) {
        let indices: Vec<usize> = self.live.iter().copied().collect();

        let config = self.instance.config();
        let slots = &mut self.slots;
        let events = &mut self.events;
        let staged = &mut self.staged;
        let stats = &mut self.stats;
        let mut compressor: Option<&mut (dyn Compressor + '_)> = self.compressor.as_deref_mut();

        for &index in &indices {
            if let Some(peer) = slots[index].peer.as_mut() {
                let compressor_ref = match compressor.as_mut() {
                    Some(c) => Some(&mut **c),
                    None => None,
                };
                let mut output = PeerOutput {
                    datagrams: &mut *staged,
                    events: &mut *events,
                    stats: &mut *stats,
                    compressor: compressor_ref,
                };

                peer.pump(config, now_ms, &mut output);
                peer.expire_assemblies(config, now_ms);
            }
        }

        // Reclamation happens outside the pump so handles observed this pass stay
        // valid for its duration.
        for index in indices {
            let reclaim = match self.slots[index].peer.as_ref() {
                Some(peer) => peer.reclaimable(now_ms, self.instance.config()),
                None => false,
            };

            if reclaim {
                let peer = self.slots[index].peer.take().expect("Peer checked above");
                self.by_connection
                    .remove(&(peer.address(), peer.connection_id()));
                self.slots[index].generation = self.slots[index].generation.wrapping_add(1);
                self.live.remove(&index);
                self.free.push(index);

                logging::debug!(self.log, "peer slot reclaimed"; "slot" => index);
            }
        }
    }

    /// Emits staged datagrams in order. Transient congestion leaves the remainder for
    /// the next pass; per-datagram failures drop that datagram only.
    fn transmit_staged(&mut self) {
        let mut sent = 0;

        while sent < self.staged.len() {
            let (address, data) = &self.staged[sent];

            match self.network.send(data, address) {
                Ok(()) => {
                    self.stats.sent_datagrams += 1;
                    sent += 1;
                }
                Err(NetworkError::Wait) => break,
                Err(_) => {
                    self.stats.dropped_datagrams += 1;
                    sent += 1;
                }
            }
        }

        self.staged.drain(..sent);
    }

    fn ingest_datagram(&mut self, from: Address, size: usize) {
        let data = &self.receive_buffer[..size];

        let header = match frame::parse_header(data) {
            Ok(header) => header,
            Err(_) => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        if header.session == SESSION_UNASSIGNED {
            let data = data.to_vec();
            self.ingest_unassigned(from, &header, &data);
            return;
        }

        let index = header.session as usize;
        let now_ms = self.instance.now_ms();

        let config = self.instance.config();
        let slots = &mut self.slots;
        let events = &mut self.events;
        let staged = &mut self.staged;
        let stats = &mut self.stats;
        let mut compressor: Option<&mut (dyn Compressor + '_)> = self.compressor.as_deref_mut();

        let peer = match slots.get_mut(index).and_then(|slot| slot.peer.as_mut()) {
            Some(peer) if peer.address() == from => peer,
            _ => {
                stats.dropped_datagrams += 1;
                return;
            }
        };

        // The peer classifies the datagram's fate (delivered, MAC failure,
        // decompression abort, other drop) directly into the counters.
        let compressor_ref = match compressor.as_mut() {
            Some(c) => Some(&mut **c),
            None => None,
        };
        let mut output = PeerOutput {
            datagrams: staged,
            events,
            stats,
            compressor: compressor_ref,
        };

        let data = &self.receive_buffer[..size];
        peer.ingest(&header, data, config, now_ms, &mut output);
    }

    /// Handles datagrams carrying no session: the connect-request path, including the
    /// stateless cookie exchange and candidate allocation.
    fn ingest_unassigned(&mut self, from: Address, header: &Header, data: &[u8]) {
        if header.has(frame::flags::SEALED) {
            self.stats.dropped_datagrams += 1;
            return;
        }

        let (_, body) = match frame::open(data, header, None, 0) {
            Ok(opened) => opened,
            Err(_) => {
                self.stats.mac_failures += 1;
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        let commands = match crate::command::decode_all(&body) {
            Ok(commands) => commands,
            Err(_) => {
                self.stats.dropped_datagrams += 1;
                return;
            }
        };

        for command in commands {
            if let CommandBody::Connect(connect) = command.body {
                self.handle_connect_request(from, connect);
            }
        }
    }

    fn handle_connect_request(&mut self, from: Address, connect: ConnectBody) {
        let now_ms = self.instance.now_ms();

        // Retransmitted request for an already allocated candidate: the pending
        // verify-connect retransmission covers the lost reply.
        if self
            .by_connection
            .contains_key(&(from, connect.connection_id))
        {
            return;
        }

        if self.bound.is_none() || self.channel_kinds.is_empty() {
            return;
        }

        let count = connect.channel_kinds.len();
        if count == 0
            || count > self.channel_kinds.len()
            || connect.channel_kinds[..] != self.channel_kinds[..count]
        {
            self.send_clear_denial(from, connect.proposed_peer, DenialReason::ChannelMismatch);
            return;
        }

        // Stateless flood gate: no state is allocated until the connector echoes a
        // cookie bound to its address and connection id.
        let current = self.cookie(from, connect.connection_id, now_ms / COOKIE_BUCKET_MS);
        let previous = self.cookie(from, connect.connection_id, (now_ms / COOKIE_BUCKET_MS).wrapping_sub(1));

        if connect.cookie != current && connect.cookie != previous {
            self.send_cookie_challenge(from, &connect, current);
            return;
        }

        let index = match self.allocate_slot() {
            Ok(index) => index,
            Err(_) => {
                self.send_clear_denial(from, connect.proposed_peer, DenialReason::TableFull);
                return;
            }
        };

        let handle = PeerHandle::new(index, self.slots[index].generation);
        let peer = Peer::incoming(
            handle,
            from,
            &connect,
            self.instance.config(),
            now_ms,
            &self.log,
        );

        let token = peer.connection_token().to_vec().into_boxed_slice();

        self.by_connection.insert((from, connect.connection_id), index);
        self.slots[index].peer = Some(peer);
        self.live.insert(index);

        logging::debug!(self.log, "connection candidate allocated";
                        "slot" => index,
                        "from" => %from);

        self.events.push_back(Event::CheckConnectionToken {
            peer: handle,
            token,
        });
    }

    fn cookie(&self, from: Address, connection_id: u64, bucket: u64) -> [u8; COOKIE_SIZE] {
        let mut material = Vec::with_capacity(16 + 2 + 8 + 8);
        material.extend_from_slice(&from.host);
        material.extend_from_slice(&from.port.to_be_bytes());
        material.extend_from_slice(&connection_id.to_be_bytes());
        material.extend_from_slice(&bucket.to_be_bytes());

        let mut cookie = [0u8; COOKIE_SIZE];
        crypto::digest(&mut cookie, &material, &self.cookie_secret);
        cookie
    }

    fn send_cookie_challenge(&mut self, to: Address, connect: &ConnectBody, cookie: [u8; COOKIE_SIZE]) {
        let challenge = Command {
            channel: CONTROL_CHANNEL,
            sequence: 0,
            body: CommandBody::VerifyConnect(VerifyConnectBody {
                connection_id: connect.connection_id,
                assigned_peer: SESSION_UNASSIGNED,
                channel_kinds: connect.channel_kinds.clone(),
                data: 0,
                share: [0u8; crypto::SHARE_SIZE],
                cookie,
                mtu: self.instance.config().mtu_ceiling as u16,
            }),
        };

        self.send_clear(to, connect.proposed_peer, &challenge);
    }

    fn send_clear_denial(&mut self, to: Address, session: u16, reason: DenialReason) {
        let code = match reason {
            DenialReason::TokenRejected => 1,
            DenialReason::AuthenticationRejected => 2,
            DenialReason::ChannelMismatch => 3,
            DenialReason::VersionMismatch => 4,
            _ => 5,
        };

        let denial = Command {
            channel: CONTROL_CHANNEL,
            sequence: 0,
            body: CommandBody::Disconnect {
                reason: code,
                mode: DisconnectMode::Denial,
            },
        };

        self.send_clear(to, session, &denial);
    }

    /// Emits one checksummed clear datagram outside any peer's sequence space.
    fn send_clear(&mut self, to: Address, session: u16, command: &Command) {
        let mut body = vec![0u8; command.wire_size()];
        let mut stream = Cursor::new(&mut body[..]);

        if command.serialize(&mut stream).is_err() {
            return;
        }
        let length = stream.position() as usize;
        body.truncate(length);

        let mut header = Header {
            flags: 0,
            session,
            sequence: 0,
            length: 0,
        };

        let mut wire = Vec::new();
        if frame::seal(&mut wire, &mut header, None, &body, None, 0).is_ok() {
            self.staged.push((to, wire));
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        // Staged datagrams die with the socket: nothing is dispatched after teardown.
        self.terminated = true;
        self.staged.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::DeflateCompressor;
    use crate::config::SimulatorConfig;
    use crate::network::simulator::InterferenceSimulator;
    use crate::network::switch::SwitchFabric;
    use crate::network::InterfaceFilter;

    const HELLOS: [&str; 4] = [
        "Hello world!",
        "Hello another world!",
        "Hello world in an another world! Yet another hello world with an yet another hello world!",
        "Hello another world in an world! Yet another hello world with an yet another hello world!",
    ];

    fn test_config() -> Config {
        let mut config = Config::default();
        // Tight timers keep loopback tests fast without touching the protocol.
        config.retransmission_timeout_initial_ms = 40;
        config.ping_interval_ms = 50;
        config.connect_timeout_ms = 2_000;
        config.zombie_grace_ms = 200;
        config
    }

    fn host_on(fabric: &SwitchFabric, config: Config, kinds: &[ChannelKind]) -> (Host, Address) {
        let instance = Instance::new(config, None);
        let mut host = Host::create(instance, Box::new(fabric.endpoint()));
        host.set_compressor(Box::new(DeflateCompressor::new()));
        let address = host
            .start(&Address::any_v4(0), FamilyMode::V4, kinds)
            .unwrap();
        (host, address)
    }

    fn lossy_host_on(
        fabric: &SwitchFabric,
        config: Config,
        simulator: SimulatorConfig,
        seed: u64,
        kinds: &[ChannelKind],
    ) -> (Host, Address) {
        let instance = Instance::new(config, None);
        let network = InterferenceSimulator::new(Box::new(fabric.endpoint()), simulator, seed, None);
        let mut host = Host::create(instance, Box::new(network));
        host.set_compressor(Box::new(DeflateCompressor::new()));
        let address = host
            .start(&Address::any_v4(0), FamilyMode::V4, kinds)
            .unwrap();
        (host, address)
    }

    /// Pumps both hosts once, auto-accepting both server gates, and appends every
    /// other event to the logs.
    fn pump(server: &mut Host, client: &mut Host, server_events: &mut Vec<Event>, client_events: &mut Vec<Event>) {
        for (host, sink) in [(server, server_events), (client, client_events)] {
            while let Some(event) = host.service(1).unwrap() {
                match event {
                    Event::CheckConnectionToken { peer, .. } => {
                        host.accept_connection_token(peer).unwrap();
                    }
                    Event::CheckAuthenticationToken { peer, .. } => {
                        host.accept_authentication_token(peer).unwrap();
                    }
                    other => sink.push(other),
                }
            }
        }
    }

    fn connected_pair(
        kinds: &[ChannelKind],
    ) -> (Host, Host, PeerHandle, PeerHandle) {
        let fabric = SwitchFabric::new();
        let (mut server, server_addr) = host_on(&fabric, test_config(), kinds);
        let (mut client, _) = host_on(&fabric, test_config(), kinds);

        let client_peer = client.connect(&server_addr, kinds.len(), 0).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();

        for _ in 0..400 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            let server_up = server_events.iter().any(|e| matches!(e, Event::Connect { .. }));
            let client_up = client_events.iter().any(|e| matches!(e, Event::Connect { .. }));
            if server_up && client_up {
                break;
            }
        }

        let server_peer = server_events
            .iter()
            .find_map(|event| match event {
                Event::Connect { peer, .. } => Some(*peer),
                _ => None,
            })
            .expect("server never saw the connect");

        assert!(client_events.iter().any(|e| matches!(e, Event::Connect { .. })));

        (server, client, server_peer, client_peer)
    }

    #[test]
    fn test_connect_before_start_fails() {
        let fabric = SwitchFabric::new();
        let instance = Instance::new(test_config(), None);
        let mut host = Host::create(instance, Box::new(fabric.endpoint()));

        let target = Address::loopback_v4(1000);
        assert!(host.connect(&target, 1, 0).is_err());
    }

    #[test]
    fn test_connect_channel_count_validation() {
        let fabric = SwitchFabric::new();
        let (mut host, _) = host_on(&fabric, test_config(), &[ChannelKind::ReliableOrdered]);

        let target = Address::loopback_v4(1000);
        assert!(host.connect(&target, 0, 0).is_err());
        assert!(host.connect(&target, 2, 0).is_err());
    }

    #[test]
    fn test_terminated_host_refuses_calls() {
        let fabric = SwitchFabric::new();
        let (mut host, _) = host_on(&fabric, test_config(), &[ChannelKind::ReliableOrdered]);

        host.destroy();

        assert_eq!(
            host.service(0).unwrap_err(),
            NetworkError::Fatal(ErrorType::Terminated)
        );
    }

    #[test]
    fn test_handshake_and_hello_exchange() {
        let kinds = [
            ChannelKind::ReliableOrdered,
            ChannelKind::ReliableOrdered,
            ChannelKind::ReliableOrdered,
            ChannelKind::ReliableOrdered,
        ];
        let (mut server, mut client, server_peer, _client_peer) = connected_pair(&kinds);

        for hello in HELLOS.iter() {
            server.send(server_peer, 0, hello.as_bytes()).unwrap();
        }

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        let mut received: Vec<Vec<u8>> = Vec::new();

        for _ in 0..400 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            for event in client_events.drain(..) {
                if let Event::Receive { channel, message, .. } = event {
                    assert_eq!(channel, 0);
                    received.push(message.into_vec());
                }
            }

            if received.len() == 4 {
                break;
            }
        }

        let expected: Vec<Vec<u8>> = HELLOS.iter().map(|s| s.as_bytes().to_vec()).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_lossy_reliable_ordered_delivery() {
        let kinds = [ChannelKind::ReliableOrdered; 4];
        let fabric = SwitchFabric::new();

        let mut simulator = SimulatorConfig::default();
        simulator.incoming_loss = SimulatorConfig::factor(0.25);
        simulator.outgoing_loss = SimulatorConfig::factor(0.25);

        let (mut server, server_addr) =
            lossy_host_on(&fabric, test_config(), simulator, 0x5eed_0001, &kinds);
        let (mut client, _) = lossy_host_on(&fabric, test_config(), simulator, 0x5eed_0002, &kinds);

        client.connect(&server_addr, 4, 0).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        let mut server_peer = None;
        let mut sent = false;
        let mut received: Vec<Vec<u8>> = Vec::new();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            if server_peer.is_none() {
                server_peer = server_events.iter().find_map(|event| match event {
                    Event::Connect { peer, .. } => Some(*peer),
                    _ => None,
                });
            }

            if let (Some(peer), false) = (server_peer, sent) {
                for hello in HELLOS.iter() {
                    server.send(peer, 0, hello.as_bytes()).unwrap();
                }
                sent = true;
            }

            for event in client_events.drain(..) {
                if let Event::Receive { message, .. } = event {
                    received.push(message.into_vec());
                }
            }

            if received.len() == 4 {
                break;
            }
        }

        let expected: Vec<Vec<u8>> = HELLOS.iter().map(|s| s.as_bytes().to_vec()).collect();
        assert_eq!(received, expected);

        // A quarter of the traffic was lost in each direction, so delivery relied on
        // retransmission and the counters must show it.
        assert!(server.stats().retransmissions + client.stats().retransmissions > 0);
    }

    #[test]
    fn test_fragmented_echo() {
        let kinds = [ChannelKind::ReliableOrdered];
        let (mut server, mut client, _server_peer, client_peer) = connected_pair(&kinds);

        let message: Vec<u8> = (0..65536u32).map(|i| (i * 31 + 7) as u8).collect();
        client.send(client_peer, 0, &message).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        let mut echoed = None;

        for _ in 0..4000 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            for event in server_events.drain(..) {
                if let Event::Receive { peer, message, .. } = event {
                    server.send(peer, 0, &message).unwrap();
                }
            }

            for event in client_events.drain(..) {
                if let Event::Receive { message, .. } = event {
                    echoed = Some(message.into_vec());
                }
            }

            if echoed.is_some() {
                break;
            }
        }

        assert_eq!(echoed.expect("echo never arrived"), message);
    }

    #[test]
    fn test_rejected_connection_token() {
        let kinds = [ChannelKind::ReliableOrdered];
        let fabric = SwitchFabric::new();
        let (mut server, server_addr) = host_on(&fabric, test_config(), &kinds);
        let (mut client, _) = host_on(&fabric, test_config(), &kinds);

        client
            .connect_with_tokens(&server_addr, 1, 0, b"bad credentials", b"")
            .unwrap();

        let mut denial = None;
        let mut server_connected = false;

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline && denial.is_none() {
            while let Some(event) = server.service(1).unwrap() {
                match event {
                    Event::CheckConnectionToken { peer, token } => {
                        assert_eq!(&token[..], b"bad credentials");
                        server.deny(peer, DenialReason::TokenRejected).unwrap();
                    }
                    Event::Connect { .. } => server_connected = true,
                    _ => (),
                }
            }

            while let Some(event) = client.service(1).unwrap() {
                if let Event::Denial { reason, .. } = event {
                    denial = Some(reason);
                }
            }
        }

        assert_eq!(denial, Some(DenialReason::TokenRejected));
        assert!(!server_connected);
    }

    #[test]
    fn test_unreliable_ordered_strictly_increasing() {
        let kinds = [ChannelKind::ReliableOrdered, ChannelKind::UnreliableOrdered];
        let fabric = SwitchFabric::new();

        let mut simulator = SimulatorConfig::default();
        simulator.outgoing_reorder = SimulatorConfig::factor(0.5);

        let (mut server, server_addr) = host_on(&fabric, test_config(), &kinds);
        let (mut client, _) = lossy_host_on(&fabric, test_config(), simulator, 0xabcd, &kinds);

        let client_peer = client.connect(&server_addr, 2, 0).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();

        for _ in 0..400 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);
            if client_events.iter().any(|e| matches!(e, Event::Connect { .. })) {
                break;
            }
        }
        assert!(client_events.iter().any(|e| matches!(e, Event::Connect { .. })));

        // One message per pass, so the stream spans many datagrams and the reordering
        // stage has something to scramble.
        let mut next_value = 1u8;
        let mut observed = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if next_value <= 100 {
                client.send(client_peer, 1, &[next_value]).unwrap();
                next_value += 1;
            }

            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            for event in server_events.drain(..) {
                if let Event::Receive { channel, message, .. } = event {
                    if channel == 1 {
                        observed.push(message[0]);
                    }
                }
            }

            if observed.last() == Some(&100) {
                break;
            }
        }

        assert!(!observed.is_empty());
        for pair in observed.windows(2) {
            assert!(pair[0] < pair[1], "sequence regressed: {:?}", observed);
        }
    }

    /// Network wrapper corrupting one mid-datagram byte of everything sent after the
    /// first `corrupt_after` datagrams, so the handshake survives but later sealed
    /// traffic fails its tag.
    struct TamperNetwork {
        inner: Box<dyn Network>,
        sent: usize,
        corrupt_after: usize,
    }

    impl Network for TamperNetwork {
        fn bind(&mut self, address: &Address, mode: FamilyMode) -> NetworkResult<Address> {
            self.inner.bind(address, mode)
        }

        fn send(&mut self, data: &[u8], to: &Address) -> NetworkResult<()> {
            self.sent += 1;

            if self.sent > self.corrupt_after && data.len() > frame::OVERHEAD_SIZE {
                let mut copy = data.to_vec();
                let middle = copy.len() / 2;
                copy[middle] ^= 0x20;
                return self.inner.send(&copy, to);
            }

            self.inner.send(data, to)
        }

        fn receive(
            &mut self,
            buffer: &mut [u8],
            timeout: Duration,
        ) -> NetworkResult<Option<(usize, Address)>> {
            self.inner.receive(buffer, timeout)
        }

        fn resolve(&mut self, host: &str, port: u16) -> NetworkResult<Address> {
            self.inner.resolve(host, port)
        }

        fn interfaces(&mut self, filter: InterfaceFilter) -> NetworkResult<Vec<Address>> {
            self.inner.interfaces(filter)
        }

        fn local_address(&self) -> NetworkResult<Address> {
            self.inner.local_address()
        }
    }

    #[test]
    fn test_mac_failures_counted_on_peer_traffic() {
        let kinds = [ChannelKind::ReliableOrdered];
        let fabric = SwitchFabric::new();
        let (mut server, server_addr) = host_on(&fabric, test_config(), &kinds);

        let instance = Instance::new(test_config(), None);
        let tampering = TamperNetwork {
            inner: Box::new(fabric.endpoint()),
            sent: 0,
            corrupt_after: 40,
        };
        let mut client = Host::create(instance, Box::new(tampering));
        client.set_compressor(Box::new(DeflateCompressor::new()));
        client
            .start(&Address::any_v4(0), FamilyMode::V4, &kinds)
            .unwrap();

        let client_peer = client.connect(&server_addr, 1, 0).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();

        for _ in 0..400 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);
            if client_events.iter().any(|e| matches!(e, Event::Connect { .. })) {
                break;
            }
        }
        assert!(client_events.iter().any(|e| matches!(e, Event::Connect { .. })));

        // Everything the client sends from here on is corrupted in flight; the
        // server's tag checks must observe that.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline && server.stats().mac_failures == 0 {
            let _ = client.send(client_peer, 0, b"garbled in transit");
            pump(&mut server, &mut client, &mut server_events, &mut client_events);
        }

        assert!(server.stats().mac_failures > 0);
        assert!(server.stats().dropped_datagrams > 0);
    }

    #[test]
    fn test_dead_link_detected_by_unanswered_pings() {
        let kinds = [ChannelKind::ReliableOrdered];
        let (server, mut client, _server_peer, client_peer) = connected_pair(&kinds);

        // The remote host disappears without a disconnect; only the ping ceiling can
        // notice this quickly, since the silence timeout is a full 30 seconds.
        drop(server);

        let mut observed = None;
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while std::time::Instant::now() < deadline && observed.is_none() {
            while let Some(event) = client.service(5).unwrap() {
                if let Event::Disconnect { peer, .. } = event {
                    observed = Some(peer);
                }
            }
        }

        assert_eq!(observed, Some(client_peer));
    }

    /// Network wrapper dropping datagrams above a link MTU, for path discovery tests.
    struct ClampNetwork {
        inner: Box<dyn Network>,
        limit: usize,
    }

    impl Network for ClampNetwork {
        fn bind(&mut self, address: &Address, mode: FamilyMode) -> NetworkResult<Address> {
            self.inner.bind(address, mode)
        }

        fn send(&mut self, data: &[u8], to: &Address) -> NetworkResult<()> {
            match data.len() <= self.limit {
                true => self.inner.send(data, to),
                false => Ok(()),
            }
        }

        fn receive(
            &mut self,
            buffer: &mut [u8],
            timeout: Duration,
        ) -> NetworkResult<Option<(usize, Address)>> {
            self.inner.receive(buffer, timeout)
        }

        fn resolve(&mut self, host: &str, port: u16) -> NetworkResult<Address> {
            self.inner.resolve(host, port)
        }

        fn interfaces(&mut self, filter: InterfaceFilter) -> NetworkResult<Vec<Address>> {
            self.inner.interfaces(filter)
        }

        fn local_address(&self) -> NetworkResult<Address> {
            self.inner.local_address()
        }
    }

    #[test]
    fn test_mtu_discovery_under_link_clamp() {
        let kinds = [ChannelKind::ReliableOrdered];
        let fabric = SwitchFabric::new();

        let (mut server, server_addr) = host_on(&fabric, test_config(), &kinds);

        let instance = Instance::new(test_config(), None);
        let clamped = ClampNetwork {
            inner: Box::new(fabric.endpoint()),
            limit: 576,
        };
        let mut client = Host::create(instance, Box::new(clamped));
        client
            .start(&Address::any_v4(0), FamilyMode::V4, &kinds)
            .unwrap();

        client.connect(&server_addr, 1, 0).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        let mut discovered = None;

        let deadline = std::time::Instant::now() + Duration::from_secs(4);
        while std::time::Instant::now() < deadline && discovered.is_none() {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            for event in client_events.drain(..) {
                if let Event::Mtu { mtu, .. } = event {
                    discovered = Some(mtu);
                }
            }
        }

        let mtu = discovered.expect("no MTU event");
        assert!(mtu >= 508 && mtu <= 576, "mtu {}", mtu);
    }

    #[test]
    fn test_zero_byte_message() {
        let kinds = [ChannelKind::ReliableOrdered];
        let (mut server, mut client, server_peer, _) = connected_pair(&kinds);

        server.send(server_peer, 0, b"").unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        let mut got_empty = false;

        for _ in 0..400 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            for event in client_events.drain(..) {
                if let Event::Receive { message, .. } = event {
                    assert!(message.is_empty());
                    got_empty = true;
                }
            }

            if got_empty {
                break;
            }
        }

        assert!(got_empty);
    }

    #[test]
    fn test_broadcast_reaches_all_connected() {
        let kinds = [ChannelKind::ReliableOrdered];
        let fabric = SwitchFabric::new();
        let (mut server, server_addr) = host_on(&fabric, test_config(), &kinds);
        let (mut alpha, _) = host_on(&fabric, test_config(), &kinds);
        let (mut beta, _) = host_on(&fabric, test_config(), &kinds);

        alpha.connect(&server_addr, 1, 0).unwrap();
        beta.connect(&server_addr, 1, 0).unwrap();

        let mut scratch = Vec::new();
        let mut connects = 0;
        for _ in 0..600 {
            let mut server_events = Vec::new();
            pump(&mut server, &mut alpha, &mut server_events, &mut scratch);
            pump(&mut server, &mut beta, &mut server_events, &mut scratch);
            connects += server_events
                .iter()
                .filter(|e| matches!(e, Event::Connect { .. }))
                .count();
            if connects == 2 {
                break;
            }
        }
        assert_eq!(connects, 2);

        server.broadcast(0, b"to everyone").unwrap();

        let mut alpha_got = false;
        let mut beta_got = false;
        for _ in 0..400 {
            let mut sink = Vec::new();
            pump(&mut server, &mut alpha, &mut sink, &mut scratch);
            alpha_got |= scratch
                .drain(..)
                .any(|e| matches!(e, Event::Receive { ref message, .. } if &message[..] == b"to everyone"));
            pump(&mut server, &mut beta, &mut sink, &mut scratch);
            beta_got |= scratch
                .drain(..)
                .any(|e| matches!(e, Event::Receive { ref message, .. } if &message[..] == b"to everyone"));

            if alpha_got && beta_got {
                break;
            }
        }

        assert!(alpha_got && beta_got);
    }

    #[test]
    fn test_disconnect_observed_on_both_sides() {
        let kinds = [ChannelKind::ReliableOrdered];
        let (mut server, mut client, server_peer, client_peer) = connected_pair(&kinds);

        client.disconnect(client_peer, 42, false).unwrap();

        let mut server_events = Vec::new();
        let mut client_events = Vec::new();
        let mut server_saw = None;
        let mut client_saw = None;

        for _ in 0..600 {
            pump(&mut server, &mut client, &mut server_events, &mut client_events);

            for event in server_events.drain(..) {
                if let Event::Disconnect { reason, .. } = event {
                    server_saw = Some(reason);
                }
            }
            for event in client_events.drain(..) {
                if let Event::Disconnect { reason, .. } = event {
                    client_saw = Some(reason);
                }
            }

            if server_saw.is_some() && client_saw.is_some() {
                break;
            }
        }

        assert_eq!(server_saw, Some(42));
        assert_eq!(client_saw, Some(42));
        let _ = server_peer;
    }

    #[test]
    fn test_stale_handle_after_reclaim() {
        let kinds = [ChannelKind::ReliableOrdered];
        let (mut server, mut client, _server_peer, client_peer) = connected_pair(&kinds);

        client.disconnect(client_peer, 0, false).unwrap();

        // Run both sides past teardown and the zombie grace period.
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while std::time::Instant::now() < deadline {
            let mut a = Vec::new();
            let mut b = Vec::new();
            pump(&mut server, &mut client, &mut a, &mut b);

            if client.peer_state(client_peer).is_err() {
                break;
            }
        }

        assert_eq!(
            client.peer_state(client_peer).unwrap_err(),
            NetworkError::Fatal(ErrorType::StaleHandle)
        );

        // The handle stays inert: every operation on it reports staleness.
        assert_eq!(
            client.send(client_peer, 0, b"late").unwrap_err(),
            NetworkError::Fatal(ErrorType::StaleHandle)
        );
    }
}
