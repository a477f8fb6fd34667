use crate::address::Address;
use crate::channel::{Channel, ChannelKind};
use crate::command::{
    Command, CommandBody, ConnectBody, DisconnectMode, VerifyConnectBody, CONTROL_CHANNEL,
    COOKIE_SIZE,
};
use crate::compress::Compressor;
use crate::config::Config;
use crate::event::{DenialReason, Event, PeerHandle};
use crate::frame::{self, Header, SESSION_UNASSIGNED};
use crate::host::HostStats;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use std::collections::VecDeque;
use std::io::Cursor;
use undertow::crypto::{self, SessionKeys};
use undertow::logging;

/// Replay shield width in datagrams.
const REPLAY_WINDOW: u64 = 128;

/// Handshake datagram retransmission attempts before the connection is written off.
const HANDSHAKE_ATTEMPTS: u32 = 10;

/// Retries per MTU probe size before the size is declared unreachable.
const PROBE_ATTEMPTS: u32 = 3;

/// Absolute smallest MTU the prober may halve down to.
const MIN_MTU: usize = 256;

/// Fixed overhead of an MTU probe datagram around its padding.
const PROBE_ENVELOPE: usize =
    frame::OVERHEAD_SIZE + frame::SENT_TIME_SIZE + crate::command::COMMAND_HEADER_SIZE + 4;

/// Denial reason codes carried in disconnect commands.
const DENIAL_TOKEN: u32 = 1;
const DENIAL_AUTHENTICATION: u32 = 2;
const DENIAL_CHANNELS: u32 = 3;
const DENIAL_VERSION: u32 = 4;
const DENIAL_TABLE_FULL: u32 = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    Disconnected,
    /// Locally initiated, connect-request in flight.
    Connecting,
    /// Inbound candidate awaiting the connection-token gate.
    ConnectionPending,
    /// Listener side, verify-connect in flight, awaiting proof of key possession and
    /// the authentication token.
    AuthenticationPending,
    /// Authentication accepted, approval event queued for the embedder.
    ApprovalPending,
    Connected,
    /// Teardown requested once pending reliable traffic flushes.
    DisconnectLater,
    /// Disconnect notice in flight.
    Disconnecting,
    /// Connector side, connect-ack in flight awaiting the listener's sealed confirmation.
    AcknowledgingConnect,
    /// Remote disconnect observed, final ack owed.
    AcknowledgingDisconnect,
    /// Terminal: all traffic suppressed, slot reclaimed after the grace period.
    Zombie,
}

/// Sliding anti-replay window over extended datagram sequences.
struct ReplayShield {
    highest: u64,
    mask: u128,
    primed: bool,
}

impl ReplayShield {
    fn new() -> ReplayShield {
        ReplayShield {
            highest: 0,
            mask: 0,
            primed: false,
        }
    }

    /// Admits each sequence at most once; anything older than the window is dropped.
    fn admit(&mut self, sequence: u64) -> bool {
        if !self.primed {
            self.primed = true;
            self.highest = sequence;
            self.mask = 1;
            return true;
        }

        if sequence > self.highest {
            let shift = sequence - self.highest;
            self.mask = if shift >= REPLAY_WINDOW as u64 {
                1
            } else {
                (self.mask << shift) | 1
            };
            self.highest = sequence;
            return true;
        }

        let age = self.highest - sequence;
        if age >= REPLAY_WINDOW {
            return false;
        }

        let bit = 1u128 << age;
        if self.mask & bit != 0 {
            return false;
        }

        self.mask |= bit;
        true
    }
}

/// Smoothed RTT estimator (alpha 1/8, beta 1/4) in integer milliseconds.
struct RttEstimator {
    srtt_ms: u64,
    rttvar_ms: u64,
    primed: bool,
}

impl RttEstimator {
    fn new() -> RttEstimator {
        RttEstimator {
            srtt_ms: 0,
            rttvar_ms: 0,
            primed: false,
        }
    }

    fn sample(&mut self, rtt_ms: u64) {
        if !self.primed {
            self.primed = true;
            self.srtt_ms = rtt_ms;
            self.rttvar_ms = rtt_ms / 2;
            return;
        }

        let deviation = if self.srtt_ms > rtt_ms {
            self.srtt_ms - rtt_ms
        } else {
            rtt_ms - self.srtt_ms
        };

        self.rttvar_ms = (3 * self.rttvar_ms + deviation) / 4;
        self.srtt_ms = (7 * self.srtt_ms + rtt_ms) / 8;
    }

    /// Retransmission timeout: srtt + 4 * rttvar, floored so near-zero loopback RTTs
    /// do not cause retransmission storms, and clamped by the caller's cap.
    fn rto_ms(&self, initial_ms: u64, cap_ms: u64) -> u64 {
        match self.primed {
            true => (self.srtt_ms + 4 * self.rttvar_ms).max(10).min(cap_ms),
            false => initial_ms.min(cap_ms),
        }
    }
}

/// AIMD outbound rate limiter. The rate climbs while windows complete without loss and
/// collapses multiplicatively when retransmissions occur.
struct Throttle {
    rate_bytes_per_s: u64,
    allowance: i64,
    last_refill_ms: u64,
    window_start_ms: u64,
    loss_in_window: bool,
    interval_ms: u64,
    acceleration: u64,
    deceleration: u64,
    ceiling: u64,
}

const THROTTLE_FLOOR: u64 = 8 * 1024;
const THROTTLE_START: u64 = 256 * 1024;
const THROTTLE_STEP: u64 = 16 * 1024;

impl Throttle {
    fn new(config: &Config, now_ms: u64) -> Throttle {
        let ceiling = match config.outgoing_bandwidth {
            0 => u64::max_value(),
            limit => u64::from(limit),
        };

        Throttle {
            rate_bytes_per_s: THROTTLE_START.min(ceiling),
            allowance: THROTTLE_START as i64,
            last_refill_ms: now_ms,
            window_start_ms: now_ms,
            loss_in_window: false,
            interval_ms: u64::from(config.throttle.interval_ms).max(1),
            acceleration: u64::from(config.throttle.acceleration).max(1),
            deceleration: u64::from(config.throttle.deceleration).max(1),
            ceiling,
        }
    }

    fn configure(&mut self, interval_ms: u32, acceleration: u32, deceleration: u32) {
        self.interval_ms = u64::from(interval_ms).max(1);
        self.acceleration = u64::from(acceleration).max(1);
        self.deceleration = u64::from(deceleration).max(1);
    }

    fn limit(&mut self, remote_incoming: u32) {
        if remote_incoming != 0 {
            self.ceiling = u64::from(remote_incoming);
            self.rate_bytes_per_s = self.rate_bytes_per_s.min(self.ceiling);
        }
    }

    fn advance(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed > 0 {
            let refill = (self.rate_bytes_per_s * elapsed / 1000) as i64;
            // Unused allowance does not bank past one interval's worth.
            self.allowance =
                (self.allowance + refill).min((self.rate_bytes_per_s * self.interval_ms / 1000).max(THROTTLE_FLOOR) as i64);
            self.last_refill_ms = now_ms;
        }

        if now_ms.saturating_sub(self.window_start_ms) >= self.interval_ms {
            if self.loss_in_window {
                self.rate_bytes_per_s =
                    (self.rate_bytes_per_s / self.deceleration).max(THROTTLE_FLOOR);
            } else {
                self.rate_bytes_per_s = self
                    .rate_bytes_per_s
                    .saturating_add(self.acceleration * THROTTLE_STEP)
                    .min(self.ceiling);
            }
            self.loss_in_window = false;
            self.window_start_ms = now_ms;
        }
    }

    fn note_loss(&mut self) {
        self.loss_in_window = true;
    }

    #[inline]
    fn admits(&self) -> bool {
        self.allowance > 0
    }

    #[inline]
    fn consume(&mut self, bytes: usize) {
        self.allowance -= bytes as i64;
    }
}

struct HandshakeSlot {
    next_ms: u64,
    interval_ms: u64,
    attempts: u32,
}

struct MtuProbe {
    lo: usize,
    hi: usize,
    in_flight: Option<(u16, usize, u64)>,
    retries: u32,
    next_sequence: u16,
    /// First probe validates the floor itself; losing it halves the working MTU.
    floor_check: bool,
}

/// Per-peer outgoing datagrams assembled during a pump pass, plus the host counters
/// the peer reports into.
pub struct PeerOutput<'a> {
    pub datagrams: &'a mut Vec<(Address, Vec<u8>)>,
    pub events: &'a mut VecDeque<Event>,
    pub stats: &'a mut HostStats,
    pub compressor: Option<&'a mut dyn Compressor>,
}

/// One logical connection: the state machine, its channels, and every estimator the
/// protocol hangs off it.
pub struct Peer {
    handle: PeerHandle,
    state: PeerState,
    address: Address,
    connection_id: u64,
    remote_session: u16,
    data: u32,

    channel_kinds: Vec<ChannelKind>,
    channels: Vec<Channel>,
    control: Channel,

    share_public: [u8; crypto::SHARE_SIZE],
    share_secret: [u8; crypto::SHARE_SECRET_SIZE],
    keys: Option<SessionKeys>,

    send_sequence: u64,
    receive_expected: u64,
    replay: ReplayShield,

    handshake: Option<HandshakeSlot>,
    cookie: [u8; COOKIE_SIZE],
    connection_token: Box<[u8]>,
    authentication_token: Box<[u8]>,
    auth_event_emitted: bool,

    rtt: RttEstimator,
    throttle: Throttle,
    last_received_sent_time: u16,

    mtu: usize,
    remote_mtu_ceiling: usize,
    probe: Option<MtuProbe>,
    immediate: Vec<Command>,

    last_receive_ms: u64,
    last_ping_ms: u64,
    unanswered_pings: u32,

    protocol_errors: u32,
    disconnect_reason: u32,
    linger_deadline_ms: Option<u64>,
    zombie_since_ms: Option<u64>,
    disconnect_event_pending: bool,
    pending_denial: Option<u32>,

    log: logging::Logger,
}

impl Peer {
    /// Connector-side construction: the connect-request goes out on the next pump.
    #[allow(clippy::too_many_arguments)]
    pub fn connecting(
        handle: PeerHandle,
        address: Address,
        channel_kinds: Vec<ChannelKind>,
        data: u32,
        connection_token: Box<[u8]>,
        authentication_token: Box<[u8]>,
        config: &Config,
        now_ms: u64,
        log: &logging::Logger,
    ) -> Peer {
        let (share_public, share_secret) = crypto::share_keypair();

        let mut peer = Peer::base(
            handle,
            address,
            crypto::random_u64(),
            channel_kinds,
            data,
            config,
            now_ms,
            log,
        );

        peer.state = PeerState::Connecting;
        peer.share_public = share_public;
        peer.share_secret = share_secret;
        peer.connection_token = connection_token;
        peer.authentication_token = authentication_token;
        peer.handshake = Some(HandshakeSlot {
            next_ms: now_ms,
            interval_ms: config.retransmission_timeout_initial_ms,
            attempts: 0,
        });

        peer
    }

    /// Listener-side construction from a cookie-validated connect-request.
    pub fn incoming(
        handle: PeerHandle,
        address: Address,
        connect: &ConnectBody,
        config: &Config,
        now_ms: u64,
        log: &logging::Logger,
    ) -> Peer {
        let (share_public, share_secret) = crypto::share_keypair();

        let mut peer = Peer::base(
            handle,
            address,
            connect.connection_id,
            connect.channel_kinds.clone(),
            connect.data,
            config,
            now_ms,
            log,
        );

        peer.state = PeerState::ConnectionPending;
        peer.share_public = share_public;
        peer.share_secret = share_secret;
        peer.remote_session = connect.proposed_peer;
        peer.connection_token = connect.token.clone();

        // The listener can derive both directions as soon as it has the connector's
        // share; the keys install here, exactly once.
        peer.keys = crypto::listener_session_keys(&share_public, &share_secret, &connect.share);

        peer
    }

    #[allow(clippy::too_many_arguments)]
    fn base(
        handle: PeerHandle,
        address: Address,
        connection_id: u64,
        channel_kinds: Vec<ChannelKind>,
        data: u32,
        config: &Config,
        now_ms: u64,
        log: &logging::Logger,
    ) -> Peer {
        let channels = channel_kinds
            .iter()
            .enumerate()
            .map(|(index, kind)| Channel::new(*kind, index as u8))
            .collect();

        Peer {
            handle,
            state: PeerState::Disconnected,
            address,
            connection_id,
            remote_session: SESSION_UNASSIGNED,
            data,
            channel_kinds,
            channels,
            control: Channel::new(ChannelKind::ReliableOrdered, CONTROL_CHANNEL),
            share_public: [0u8; crypto::SHARE_SIZE],
            share_secret: [0u8; crypto::SHARE_SECRET_SIZE],
            keys: None,
            send_sequence: 0,
            receive_expected: 0,
            replay: ReplayShield::new(),
            handshake: None,
            cookie: [0u8; COOKIE_SIZE],
            connection_token: Box::new([]),
            authentication_token: Box::new([]),
            auth_event_emitted: false,
            rtt: RttEstimator::new(),
            throttle: Throttle::new(config, now_ms),
            last_received_sent_time: 0,
            mtu: config.mtu_floor,
            remote_mtu_ceiling: config.mtu_ceiling,
            probe: None,
            immediate: Vec::new(),
            last_receive_ms: now_ms,
            last_ping_ms: now_ms,
            unanswered_pings: 0,
            protocol_errors: 0,
            disconnect_reason: 0,
            linger_deadline_ms: None,
            zombie_since_ms: None,
            disconnect_event_pending: false,
            pending_denial: None,
            log: log.new(logging::o!("peer" => handle.index())),
        }
    }

    #[inline]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    #[inline]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[inline]
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    #[inline]
    pub fn round_trip_ms(&self) -> u64 {
        self.rtt.srtt_ms
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        !matches!(self.state, PeerState::Disconnected | PeerState::Zombie)
    }

    /// True once the zombie grace period has run out and the slot can be reused.
    pub fn reclaimable(&self, now_ms: u64, config: &Config) -> bool {
        match self.zombie_since_ms {
            Some(since) => now_ms >= since + config.zombie_grace_ms,
            None => false,
        }
    }

    /// Queues one application message on a channel.
    pub fn send(&mut self, channel: u8, payload: &[u8]) -> NetworkResult<()> {
        if self.state != PeerState::Connected {
            return Err(NetworkError::Fatal(ErrorType::NotConnected));
        }

        let index = channel as usize;
        if index >= self.channels.len() {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        let threshold = self.fragment_threshold();
        let fragment = self.fragment_size();

        self.channels[index].enqueue(payload, threshold, fragment)
    }

    /// Largest payload that still fits a single send command at the current MTU.
    #[inline]
    fn fragment_threshold(&self) -> usize {
        self.mtu - frame::OVERHEAD_SIZE - frame::SENT_TIME_SIZE - crate::command::COMMAND_HEADER_SIZE - 2
    }

    /// Per-fragment payload budget, accounting for the larger fragment command header.
    #[inline]
    fn fragment_size(&self) -> usize {
        self.mtu
            - frame::OVERHEAD_SIZE
            - frame::SENT_TIME_SIZE
            - crate::command::COMMAND_HEADER_SIZE
            - 10
    }

    /// Local disconnect request. With `linger`, pending reliable traffic is flushed
    /// first, bounded by the peer timeout.
    pub fn disconnect(&mut self, reason: u32, linger: bool, config: &Config, now_ms: u64) {
        match self.state {
            PeerState::Connected => {
                self.disconnect_reason = reason;
                if linger && self.has_outstanding() {
                    self.state = PeerState::DisconnectLater;
                    self.linger_deadline_ms = Some(now_ms + config.peer_timeout_ms);
                } else {
                    self.begin_disconnect(reason);
                }
            }
            PeerState::Connecting | PeerState::AcknowledgingConnect => {
                // Abandon the handshake without ceremony.
                self.zombie(now_ms);
            }
            PeerState::ConnectionPending
            | PeerState::AuthenticationPending
            | PeerState::ApprovalPending => {
                self.zombie(now_ms);
            }
            _ => (),
        }
    }

    fn begin_disconnect(&mut self, reason: u32) {
        self.control.enqueue_control(CommandBody::Disconnect {
            reason,
            mode: DisconnectMode::Notify,
        });
        self.state = PeerState::Disconnecting;
    }

    /// Listener-side gate: the embedder accepted the connection token.
    pub fn accept_connection_token(&mut self, config: &Config, now_ms: u64) -> NetworkResult<()> {
        if self.state != PeerState::AuthenticationPending
            && self.state != PeerState::ConnectionPending
        {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        if self.state == PeerState::ConnectionPending {
            self.state = PeerState::AuthenticationPending;
            // The verify-connect occupies control sequence zero even though the
            // handshake slot retransmits it, keeping both sequence spaces aligned.
            self.control.reserve_sequence();
            self.handshake = Some(HandshakeSlot {
                next_ms: now_ms,
                interval_ms: config.retransmission_timeout_initial_ms,
                attempts: 0,
            });
        }

        Ok(())
    }

    /// Listener-side gate: the embedder accepted the authentication token. The peer
    /// promotes to connected and the sealed confirmation ping goes out.
    pub fn accept_authentication_token(
        &mut self,
        config: &Config,
        events: &mut VecDeque<Event>,
    ) -> NetworkResult<()> {
        if self.state != PeerState::AuthenticationPending || !self.auth_event_emitted {
            return Err(NetworkError::Fatal(ErrorType::InvalidArgument));
        }

        self.state = PeerState::ApprovalPending;
        self.handshake = None;

        events.push_back(Event::Connect {
            peer: self.handle,
            data: self.data,
        });

        // The sealed ping doubles as the connected signal to the connector.
        self.control.enqueue_control(CommandBody::Ping);
        self.state = PeerState::Connected;
        self.announce_parameters(config);
        self.start_mtu_probe();

        Ok(())
    }

    /// Advertises local bandwidth and throttle parameters once the link is up.
    fn announce_parameters(&mut self, config: &Config) {
        if config.incoming_bandwidth != 0 || config.outgoing_bandwidth != 0 {
            self.control.enqueue_control(CommandBody::BandwidthLimit {
                incoming: config.incoming_bandwidth,
                outgoing: config.outgoing_bandwidth,
            });
        }

        self.control.enqueue_control(CommandBody::ThrottleConfigure {
            interval_ms: config.throttle.interval_ms,
            acceleration: config.throttle.acceleration,
            deceleration: config.throttle.deceleration,
        });
    }

    /// Listener-side refusal of either token gate. The denial leaves as a clear
    /// one-shot datagram, since the connector may not have installed keys yet; a lost
    /// denial degrades into the connector's own handshake timeout.
    pub fn deny(&mut self, reason: DenialReason, now_ms: u64) {
        let code = match reason {
            DenialReason::TokenRejected => DENIAL_TOKEN,
            DenialReason::AuthenticationRejected => DENIAL_AUTHENTICATION,
            DenialReason::ChannelMismatch => DENIAL_CHANNELS,
            DenialReason::VersionMismatch => DENIAL_VERSION,
            DenialReason::TableFull => DENIAL_TABLE_FULL,
            DenialReason::Timeout => DENIAL_TABLE_FULL,
        };

        self.pending_denial = Some(code);
        let _ = now_ms;
    }

    fn zombie(&mut self, now_ms: u64) {
        if self.state != PeerState::Zombie {
            logging::debug!(self.log, "peer zombied"; "state" => ?self.state);
            self.state = PeerState::Zombie;
            self.zombie_since_ms = Some(now_ms);
            self.keys = None;
        }
    }

    fn zombie_with_event(&mut self, now_ms: u64, events: &mut VecDeque<Event>, reason: u32) {
        if self.state != PeerState::Zombie {
            events.push_back(Event::Disconnect {
                peer: self.handle,
                reason,
            });
            self.zombie(now_ms);
        }
    }

    #[inline]
    fn has_outstanding(&self) -> bool {
        self.control.has_outstanding() || self.channels.iter().any(Channel::has_outstanding)
    }

    // ---------------------------------------------------------------- inbound

    /// Processes one raw datagram already matched to this peer. Protocol failures
    /// silently drop the datagram and feed both the host counters and the per-peer
    /// error budget; enough of them zombie the peer.
    pub fn ingest(
        &mut self,
        header: &Header,
        data: &[u8],
        config: &Config,
        now_ms: u64,
        output: &mut PeerOutput,
    ) {
        match self.ingest_inner(header, data, config, now_ms, output) {
            Ok(()) => output.stats.delivered_datagrams += 1,
            Err(NetworkError::Wait) => (),
            Err(NetworkError::Fatal(error)) => {
                output.stats.dropped_datagrams += 1;
                match error {
                    ErrorType::Crypto => output.stats.mac_failures += 1,
                    ErrorType::Decompression | ErrorType::DecompressionOverflow => {
                        output.stats.decompression_failures += 1
                    }
                    _ => (),
                }

                self.protocol_errors += 1;
                logging::debug!(self.log, "datagram dropped";
                                "error" => ?error,
                                "errors" => self.protocol_errors);

                if self.protocol_errors >= config.protocol_error_threshold {
                    self.zombie_with_event(now_ms, output.events, 0);
                }
            }
        }
    }

    fn ingest_inner(
        &mut self,
        header: &Header,
        data: &[u8],
        config: &Config,
        now_ms: u64,
        output: &mut PeerOutput,
    ) -> NetworkResult<()> {
        if self.state == PeerState::Zombie {
            return Ok(());
        }

        let sequence = frame::extend_sequence(self.receive_expected, header.sequence);

        let sealed = header.has(frame::flags::SEALED);
        if sealed && self.keys.is_none() {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        let key = match sealed {
            true => Some(&self.keys.as_ref().expect("Keys checked above").receive),
            false => None,
        };

        let (sent_time, body) = frame::open(data, header, key, sequence)?;

        if sealed {
            // Only authenticated datagrams advance replay state or the extension
            // anchor; a forged clear sequence must not be able to poison either.
            if !self.replay.admit(sequence) {
                return Ok(());
            }
            self.receive_expected = self.replay.highest + 1;
        } else {
            // Clear datagrams exist only during the handshake (challenge,
            // verify-connect, denial) and every one of them is idempotent, so replay
            // protection is not needed and they are ignored outright afterwards.
            if !matches!(
                self.state,
                PeerState::Connecting | PeerState::ConnectionPending | PeerState::AcknowledgingConnect
            ) {
                return Ok(());
            }
        }

        let body = match header.has(frame::flags::COMPRESSED) {
            true => {
                let compressor = output
                    .compressor
                    .as_mut()
                    .ok_or(NetworkError::Fatal(ErrorType::Decompression))?;
                let mut expanded = Vec::new();
                compressor.decompress(&body, config.max_decompressed_size, &mut expanded)?;
                expanded
            }
            false => body,
        };

        if let Some(time) = sent_time {
            self.last_received_sent_time = time;
        }
        self.last_receive_ms = now_ms;
        self.unanswered_pings = 0;

        // The first sealed datagram is the connector's proof that the handshake
        // completed on its side.
        if sealed && self.state == PeerState::AcknowledgingConnect {
            self.handshake = None;
            self.state = PeerState::Connected;
            output.events.push_back(Event::Connect {
                peer: self.handle,
                data: self.data,
            });
            self.announce_parameters(config);
            self.start_mtu_probe();
        }

        let commands = crate::command::decode_all(&body)?;
        for command in commands {
            self.dispatch(command, config, now_ms, output)?;
        }

        Ok(())
    }

    fn dispatch(
        &mut self,
        command: Command,
        config: &Config,
        now_ms: u64,
        output: &mut PeerOutput,
    ) -> NetworkResult<()> {
        match command.body {
            CommandBody::Connect(_) => {
                // Duplicate connect-requests for an allocated peer: the verify-connect
                // retransmission already covers the lost reply, nothing to do.
                Ok(())
            }
            CommandBody::VerifyConnect(verify) => {
                self.on_verify_connect(verify, config, now_ms, output)
            }
            CommandBody::Ack {
                base,
                bits,
                sent_time_echo,
            } => {
                self.on_ack(command.channel, base, bits, sent_time_echo, now_ms);
                Ok(())
            }
            CommandBody::Ping => {
                if command.channel == CONTROL_CHANNEL {
                    self.control.receive_bare(command.sequence);
                }
                Ok(())
            }
            CommandBody::Disconnect { reason, mode } => {
                self.on_disconnect(command.sequence, reason, mode, now_ms, output);
                Ok(())
            }
            CommandBody::BandwidthLimit { incoming, outgoing } => {
                if command.channel == CONTROL_CHANNEL
                    && self.control.receive_bare(command.sequence)
                {
                    let _ = outgoing;
                    self.throttle.limit(incoming);
                }
                Ok(())
            }
            CommandBody::ThrottleConfigure {
                interval_ms,
                acceleration,
                deceleration,
            } => {
                if command.channel == CONTROL_CHANNEL
                    && self.control.receive_bare(command.sequence)
                {
                    self.throttle.configure(interval_ms, acceleration, deceleration);
                }
                Ok(())
            }
            CommandBody::MtuProbe { size, .. } => {
                // Echo so the prober learns this size survived the path.
                self.immediate.push(Command {
                    channel: CONTROL_CHANNEL,
                    sequence: command.sequence,
                    body: CommandBody::MtuResponse { size },
                });
                Ok(())
            }
            CommandBody::MtuResponse { size } => {
                self.on_mtu_response(command.sequence, size, output);
                Ok(())
            }
            CommandBody::SendUnsequenced { payload } if command.channel == CONTROL_CHANNEL => {
                self.on_authentication_token(payload, output);
                Ok(())
            }
            CommandBody::SendReliable { .. }
            | CommandBody::SendUnreliable { .. }
            | CommandBody::SendFragment { .. }
            | CommandBody::SendUnsequenced { .. } => {
                let index = command.channel as usize;
                if index >= self.channels.len() {
                    return Err(NetworkError::Fatal(ErrorType::ChannelMismatch));
                }

                self.channels[index].receive(command, now_ms)?;

                while let Some(message) = self.channels[index].pop_ready() {
                    output.events.push_back(Event::Receive {
                        peer: self.handle,
                        channel: index as u8,
                        message,
                    });
                }
                Ok(())
            }
        }
    }

    fn on_verify_connect(
        &mut self,
        verify: VerifyConnectBody,
        config: &Config,
        now_ms: u64,
        output: &mut PeerOutput,
    ) -> NetworkResult<()> {
        if self.state != PeerState::Connecting {
            return Ok(());
        }

        if verify.connection_id != self.connection_id {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        // Stateless cookie challenge: adopt the cookie and retry the connect-request.
        if verify.assigned_peer == SESSION_UNASSIGNED {
            self.cookie = verify.cookie;
            if let Some(slot) = self.handshake.as_mut() {
                slot.next_ms = now_ms;
            }
            return Ok(());
        }

        if verify.channel_kinds != self.channel_kinds {
            self.zombie(now_ms);
            output.events.push_back(Event::Denial {
                peer: self.handle,
                reason: DenialReason::ChannelMismatch,
            });
            return Ok(());
        }

        let keys = crypto::connector_session_keys(
            &self.share_public,
            &self.share_secret,
            &verify.share,
        )
        .ok_or(NetworkError::Fatal(ErrorType::Crypto))?;

        // Install exactly once.
        if self.keys.is_none() {
            self.keys = Some(keys);
        }

        self.remote_session = verify.assigned_peer;
        self.remote_mtu_ceiling = (verify.mtu as usize).max(config.mtu_floor);
        self.control.receive_bare(0);

        self.state = PeerState::AcknowledgingConnect;
        self.handshake = Some(HandshakeSlot {
            next_ms: now_ms,
            interval_ms: config.retransmission_timeout_initial_ms,
            attempts: 0,
        });

        output.events.push_back(Event::Approval {
            peer: self.handle,
            data: verify.data,
        });

        Ok(())
    }

    fn on_ack(&mut self, channel: u8, base: u16, bits: u32, sent_time_echo: u16, now_ms: u64) {
        let outcome = if channel == CONTROL_CHANNEL {
            self.control.process_ack(base, bits, now_ms)
        } else {
            match self.channels.get_mut(channel as usize) {
                Some(channel) => channel.process_ack(base, bits, now_ms),
                None => return,
            }
        };

        if outcome.fast_retransmit {
            self.throttle.note_loss();
        }

        if outcome.acked_commands > 0 {
            // Echo-based RTT sample; implausible values are clock-wrap noise.
            let rtt = u64::from((now_ms as u16).wrapping_sub(sent_time_echo));
            if rtt < 30_000 {
                self.rtt.sample(rtt);
            }
        }
    }

    fn on_disconnect(
        &mut self,
        sequence: u16,
        reason: u32,
        mode: DisconnectMode,
        now_ms: u64,
        output: &mut PeerOutput,
    ) {
        match mode {
            DisconnectMode::Denial => {
                let reason = match reason {
                    DENIAL_TOKEN => DenialReason::TokenRejected,
                    DENIAL_AUTHENTICATION => DenialReason::AuthenticationRejected,
                    DENIAL_CHANNELS => DenialReason::ChannelMismatch,
                    DENIAL_VERSION => DenialReason::VersionMismatch,
                    _ => DenialReason::TableFull,
                };
                output.events.push_back(Event::Denial {
                    peer: self.handle,
                    reason,
                });
                self.zombie(now_ms);
            }
            DisconnectMode::Force => {
                self.zombie_with_event(now_ms, output.events, reason);
            }
            DisconnectMode::Notify => {
                if self.control.receive_bare(sequence) {
                    output.events.push_back(Event::Disconnect {
                        peer: self.handle,
                        reason,
                    });
                    // The final ack still owes the remote side one datagram.
                    self.state = PeerState::AcknowledgingDisconnect;
                }
            }
        }
    }

    fn on_authentication_token(&mut self, token: Box<[u8]>, output: &mut PeerOutput) {
        if self.state == PeerState::AuthenticationPending && !self.auth_event_emitted {
            self.auth_event_emitted = true;
            self.authentication_token = token.clone();
            // Verify-connect reached the other side; stop resending it.
            self.handshake = None;
            output.events.push_back(Event::CheckAuthenticationToken {
                peer: self.handle,
                token,
            });
        }
    }

    fn on_mtu_response(&mut self, sequence: u16, size: u16, output: &mut PeerOutput) {
        let probe = match self.probe.as_mut() {
            Some(probe) => probe,
            None => return,
        };

        match probe.in_flight {
            Some((expected_sequence, expected_size, _))
                if expected_sequence == sequence && expected_size == size as usize =>
            {
                probe.in_flight = None;
                probe.retries = 0;

                if probe.floor_check {
                    probe.floor_check = false;
                } else {
                    probe.lo = size as usize;
                }

                self.advance_mtu_probe(output);
            }
            _ => (),
        }
    }

    fn start_mtu_probe(&mut self) {
        let hi = self.remote_mtu_ceiling.min(usize::max_value());
        self.probe = Some(MtuProbe {
            lo: self.mtu,
            hi,
            in_flight: None,
            retries: 0,
            next_sequence: 0,
            floor_check: true,
        });
    }

    /// Picks the next probe size, or finishes the search and announces the result.
    fn advance_mtu_probe(&mut self, output: &mut PeerOutput) {
        let probe = match self.probe.as_mut() {
            Some(probe) => probe,
            None => return,
        };

        if probe.in_flight.is_some() {
            return;
        }

        if !probe.floor_check && probe.lo >= probe.hi {
            let mtu = probe.lo;
            self.probe = None;
            self.mtu = mtu;
            output.events.push_back(Event::Mtu {
                peer: self.handle,
                mtu,
            });
            return;
        }

        // The actual send happens in the pump, where the datagram budget is known.
    }

    // ---------------------------------------------------------------- outbound

    /// Advances timers and flushes every due datagram for this peer: handshake
    /// retransmissions, acks, control and channel traffic, pings and MTU probes.
    pub fn pump(&mut self, config: &Config, now_ms: u64, output: &mut PeerOutput) {
        if self.state == PeerState::Zombie || self.state == PeerState::Disconnected {
            return;
        }

        // A queued denial preempts everything: one clear datagram, then the slot waits
        // out its grace period.
        if let Some(code) = self.pending_denial.take() {
            let denial = Command {
                channel: CONTROL_CHANNEL,
                sequence: 0,
                body: CommandBody::Disconnect {
                    reason: code,
                    mode: DisconnectMode::Denial,
                },
            };
            let _ = self.emit_datagram(&[denial], false, now_ms, output);
            self.zombie(now_ms);
            return;
        }

        self.throttle.advance(now_ms);

        // Liveness first: a silent link zombies the peer before anything is sent,
        // either by outright silence or by pings going unanswered past the ceiling.
        if self.is_established()
            && now_ms.saturating_sub(self.last_receive_ms) >= config.peer_timeout_ms
        {
            self.zombie_with_event(now_ms, output.events, 0);
            return;
        }

        if self.is_established() && self.unanswered_pings > config.ping_failure_ceiling {
            self.zombie_with_event(now_ms, output.events, 0);
            return;
        }

        // A candidate parked at an embedder gate with no handshake retransmission
        // running cannot time out any other way.
        if matches!(
            self.state,
            PeerState::ConnectionPending | PeerState::AuthenticationPending | PeerState::ApprovalPending
        ) && self.handshake.is_none()
            && now_ms.saturating_sub(self.last_receive_ms) >= config.connect_timeout_ms
        {
            self.zombie(now_ms);
            return;
        }

        if let Err(()) = self.pump_handshake(config, now_ms, output) {
            return;
        }

        if self.state == PeerState::DisconnectLater {
            let flushed = !self.has_outstanding();
            let expired = self
                .linger_deadline_ms
                .map(|deadline| now_ms >= deadline)
                .unwrap_or(true);

            if flushed || expired {
                self.begin_disconnect(self.disconnect_reason);
            }
        }

        if self.is_established() {
            self.maybe_ping(config, now_ms);
            self.pump_mtu_probe(config, now_ms, output);
        }

        self.flush_traffic(config, now_ms, output);

        // Retransmission exhaustion surfaces after the flush so the last attempt went
        // onto the wire.
        let worst = self
            .channels
            .iter()
            .map(Channel::max_retries)
            .chain(std::iter::once(self.control.max_retries()))
            .max()
            .unwrap_or(0);

        if worst > config.retransmission_cap {
            self.zombie_with_event(now_ms, output.events, 0);
            return;
        }

        // A disconnecting peer is done once the notice is acked; the final ack of a
        // remote disconnect leaves with the flush above.
        match self.state {
            PeerState::Disconnecting if !self.has_outstanding() => {
                if self.disconnect_event_pending {
                    self.zombie_with_event(now_ms, output.events, self.disconnect_reason);
                } else {
                    self.zombie(now_ms);
                }
            }
            PeerState::AcknowledgingDisconnect if !self.wants_transmit(now_ms) => {
                self.zombie(now_ms);
            }
            _ => (),
        }
    }

    #[inline]
    fn is_established(&self) -> bool {
        matches!(
            self.state,
            PeerState::Connected
                | PeerState::DisconnectLater
                | PeerState::Disconnecting
                | PeerState::AcknowledgingDisconnect
        )
    }

    fn pump_handshake(
        &mut self,
        config: &Config,
        now_ms: u64,
        output: &mut PeerOutput,
    ) -> Result<(), ()> {
        let state = self.state;
        let slot = match self.handshake.as_mut() {
            Some(slot) => slot,
            None => return Ok(()),
        };

        if slot.next_ms > now_ms {
            return Ok(());
        }

        if slot.attempts >= HANDSHAKE_ATTEMPTS {
            self.handshake = None;
            match state {
                PeerState::Connecting | PeerState::AcknowledgingConnect => {
                    output.events.push_back(Event::Denial {
                        peer: self.handle,
                        reason: DenialReason::Timeout,
                    });
                    self.zombie(now_ms);
                }
                // Listener side gives up silently; the connector observes its own
                // timeout.
                _ => self.zombie(now_ms),
            }
            return Err(());
        }

        slot.attempts += 1;
        slot.next_ms = now_ms + slot.interval_ms;
        slot.interval_ms = (slot.interval_ms * 2).min(config.retransmission_timeout_max_ms);

        // Anything past the first attempt of a handshake datagram is a retransmission.
        if slot.attempts > 1 {
            output.stats.retransmissions += 1;
        }

        let commands = match state {
            PeerState::Connecting => vec![Command {
                channel: CONTROL_CHANNEL,
                sequence: 0,
                body: CommandBody::Connect(ConnectBody {
                    connection_id: self.connection_id,
                    proposed_peer: self.handle.index() as u16,
                    channel_kinds: self.channel_kinds.clone(),
                    capabilities: 0,
                    data: self.data,
                    share: self.share_public,
                    cookie: self.cookie,
                    token: self.connection_token.clone(),
                }),
            }],
            PeerState::AuthenticationPending => vec![Command {
                channel: CONTROL_CHANNEL,
                sequence: 0,
                body: CommandBody::VerifyConnect(VerifyConnectBody {
                    connection_id: self.connection_id,
                    assigned_peer: self.handle.index() as u16,
                    channel_kinds: self.channel_kinds.clone(),
                    data: self.data,
                    share: self.share_public,
                    cookie: self.cookie,
                    mtu: config.mtu_ceiling as u16,
                }),
            }],
            PeerState::AcknowledgingConnect => {
                let mut commands = Vec::new();
                if let Some(ack) = self.control.take_ack() {
                    commands.push(self.stamp_ack(ack));
                } else {
                    // Re-arm: the verify-connect sequence needs re-acking each attempt.
                    self.control.receive_bare(0);
                    if let Some(ack) = self.control.take_ack() {
                        commands.push(self.stamp_ack(ack));
                    }
                }
                commands.push(Command {
                    channel: CONTROL_CHANNEL,
                    sequence: 0,
                    body: CommandBody::SendUnsequenced {
                        payload: self.authentication_token.clone(),
                    },
                });
                commands
            }
            _ => Vec::new(),
        };

        if commands.is_empty() {
            return Ok(());
        }

        // Handshake datagrams before key installation go out clear; the connect-ack is
        // the first sealed one.
        let sealed = state == PeerState::AcknowledgingConnect;
        let _ = self.emit_datagram(&commands, sealed, now_ms, output);

        Ok(())
    }

    fn maybe_ping(&mut self, config: &Config, now_ms: u64) {
        if self.state != PeerState::Connected {
            return;
        }

        let interval = config.ping_interval_ms.max(self.rtt.srtt_ms);
        if now_ms.saturating_sub(self.last_ping_ms) < interval {
            return;
        }

        self.last_ping_ms = now_ms;

        // Every elapsed interval with no inbound traffic counts as one unanswered
        // cycle; any received datagram resets the count.
        self.unanswered_pings += 1;

        // Pending outbound traffic already keeps the link probed; a fresh ping only
        // fills silence.
        if self.wants_transmit(now_ms) {
            return;
        }

        self.control.enqueue_control(CommandBody::Ping);
    }

    fn pump_mtu_probe(&mut self, config: &Config, now_ms: u64, output: &mut PeerOutput) {
        self.advance_mtu_probe(output);

        let rto = self
            .rtt
            .rto_ms(config.retransmission_timeout_initial_ms, config.retransmission_timeout_max_ms);

        let probe = match self.probe.as_mut() {
            Some(probe) => probe,
            None => return,
        };

        // Retry or expire the in-flight probe.
        if let Some((sequence, size, sent_ms)) = probe.in_flight {
            if now_ms.saturating_sub(sent_ms) < rto {
                return;
            }

            probe.retries += 1;
            if probe.retries >= PROBE_ATTEMPTS {
                probe.in_flight = None;
                probe.retries = 0;

                if probe.floor_check {
                    // Even the floor does not survive this path: halve and settle.
                    let mtu = (probe.lo / 2).max(MIN_MTU);
                    self.probe = None;
                    self.mtu = mtu;
                    output.events.push_back(Event::Mtu {
                        peer: self.handle,
                        mtu,
                    });
                    return;
                }

                probe.hi = size - 1;
                self.advance_mtu_probe(output);
                let _ = sequence;
            } else {
                probe.in_flight = Some((sequence, size, now_ms));
                let command = Self::probe_command(sequence, size);
                let _ = self.emit_datagram(&[command], true, now_ms, output);
                return;
            }
        }

        let probe = match self.probe.as_mut() {
            Some(probe) => probe,
            None => return,
        };

        if probe.in_flight.is_none() {
            let size = match probe.floor_check {
                true => probe.lo,
                false => (probe.lo + probe.hi + 1) / 2,
            };

            let sequence = probe.next_sequence;
            probe.next_sequence = probe.next_sequence.wrapping_add(1);
            probe.in_flight = Some((sequence, size, now_ms));

            let command = Self::probe_command(sequence, size);
            let _ = self.emit_datagram(&[command], true, now_ms, output);
        }
    }

    fn probe_command(sequence: u16, size: usize) -> Command {
        let padding = size.saturating_sub(PROBE_ENVELOPE);
        Command {
            channel: CONTROL_CHANNEL,
            sequence,
            body: CommandBody::MtuProbe {
                size: size as u16,
                padding: vec![0u8; padding].into_boxed_slice(),
            },
        }
    }

    #[inline]
    fn wants_transmit(&self, now_ms: u64) -> bool {
        self.control.wants_transmit(now_ms)
            || self
                .channels
                .iter()
                .any(|channel| channel.wants_transmit(now_ms))
            || !self.immediate.is_empty()
    }

    /// Aggregates acks, control traffic and channel traffic into MTU-bounded sealed
    /// datagrams until nothing is due or the throttle runs dry.
    fn flush_traffic(&mut self, config: &Config, now_ms: u64, output: &mut PeerOutput) {
        if !self.is_established() && self.state != PeerState::AcknowledgingConnect {
            return;
        }
        if self.keys.is_none() {
            return;
        }

        let rto = self
            .rtt
            .rto_ms(config.retransmission_timeout_initial_ms, config.retransmission_timeout_max_ms);

        loop {
            if !self.wants_transmit(now_ms) {
                break;
            }

            let mut budget = self.mtu - frame::OVERHEAD_SIZE - frame::SENT_TIME_SIZE;
            let mut commands: Vec<Command> = Vec::new();

            // Acks ride every datagram ahead of anything else.
            if let Some(ack) = self.control.take_ack() {
                let ack = self.stamp_ack(ack);
                budget -= ack.wire_size();
                commands.push(ack);
            }
            for index in 0..self.channels.len() {
                if let Some(ack) = self.channels[index].take_ack() {
                    let ack = self.stamp_ack(ack);
                    if ack.wire_size() <= budget {
                        budget -= ack.wire_size();
                        commands.push(ack);
                    }
                }
            }

            for command in self.immediate.drain(..) {
                if command.wire_size() <= budget {
                    budget -= command.wire_size();
                    commands.push(command);
                }
            }

            let suppress_fresh = !self.throttle.admits();

            let mut retransmitted = self.control.transmit(
                now_ms,
                rto,
                config.retransmission_timeout_max_ms,
                &mut budget,
                &mut commands,
            );

            if !suppress_fresh {
                for channel in self.channels.iter_mut() {
                    retransmitted += channel.transmit(
                        now_ms,
                        rto,
                        config.retransmission_timeout_max_ms,
                        &mut budget,
                        &mut commands,
                    );
                }
            }

            output.stats.retransmissions += retransmitted as u64;

            if commands.is_empty() {
                break;
            }

            match self.emit_datagram(&commands, true, now_ms, output) {
                Ok(bytes) => self.throttle.consume(bytes),
                Err(_) => break,
            }
        }
    }

    #[inline]
    fn stamp_ack(&self, mut ack: Command) -> Command {
        if let CommandBody::Ack {
            ref mut sent_time_echo,
            ..
        } = ack.body
        {
            *sent_time_echo = self.last_received_sent_time;
        }
        ack
    }

    /// Serializes, optionally compresses, seals and hands one datagram to the host.
    fn emit_datagram(
        &mut self,
        commands: &[Command],
        sealed: bool,
        now_ms: u64,
        output: &mut PeerOutput,
    ) -> NetworkResult<usize> {
        // MTU probes intentionally exceed the current MTU, so size the scratch buffer
        // by the actual command set.
        let capacity = commands
            .iter()
            .map(Command::wire_size)
            .sum::<usize>()
            .max(self.mtu);
        let mut body = vec![0u8; capacity];
        let mut stream = Cursor::new(&mut body[..]);

        let mut carries_ack = false;
        let mut fragmented = false;
        let mut probing = false;

        for command in commands {
            command.serialize(&mut stream)?;
            match command.body {
                CommandBody::Ack { .. } => carries_ack = true,
                CommandBody::SendFragment { .. } => fragmented = true,
                CommandBody::MtuProbe { .. } => probing = true,
                _ => (),
            }
        }

        let length = stream.position() as usize;
        body.truncate(length);

        let mut flags = 0u16;
        if carries_ack {
            flags |= frame::flags::CARRIES_ACK;
        }
        if fragmented {
            flags |= frame::flags::FRAGMENTED;
        }

        // Compression earns its flag only when the encoded form is smaller. Probe
        // datagrams are exempt: shrinking their padding would test the wrong size.
        let mut compressed = Vec::new();
        let compressed_ok = !probing
            && output
                .compressor
                .as_mut()
                .map(|compressor| compressor.compress(&body, &mut compressed))
                .unwrap_or(false);
        let body_ref: &[u8] = if compressed_ok {
            flags |= frame::flags::COMPRESSED;
            &compressed
        } else {
            &body
        };

        let mut header = Header {
            flags,
            session: self.remote_session,
            sequence: (self.send_sequence & 0x00ff_ffff) as u32,
            length: 0,
        };

        let nonce = self.send_sequence;
        let key = match sealed {
            true => Some(
                &self
                    .keys
                    .as_ref()
                    .ok_or(NetworkError::Fatal(ErrorType::Crypto))?
                    .send,
            ),
            false => None,
        };

        let mut wire = Vec::new();
        frame::seal(
            &mut wire,
            &mut header,
            Some(now_ms as u16),
            body_ref,
            key,
            nonce,
        )?;

        self.send_sequence += 1;
        let size = wire.len();
        output.datagrams.push((self.address, wire));

        Ok(size)
    }

    /// Drops timed-out unreliable partial assemblies on every channel.
    pub fn expire_assemblies(&mut self, config: &Config, now_ms: u64) {
        for channel in self.channels.iter_mut() {
            channel.expire_assemblies(now_ms, config.reassembly_timeout_ms);
        }
    }

    /// Earliest deadline at which this peer wants another pump, for the service loop's
    /// sleep calculation.
    pub fn next_timer_ms(&self, config: &Config) -> Option<u64> {
        if !self.is_live() {
            return None;
        }

        let mut deadline = self
            .handshake
            .as_ref()
            .map(|slot| slot.next_ms);

        let mut fold = |candidate: Option<u64>| {
            deadline = match (deadline, candidate) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
        };

        fold(self.control.next_timer_ms());
        for channel in &self.channels {
            fold(channel.next_timer_ms());
        }

        if self.state == PeerState::Connected {
            fold(Some(self.last_ping_ms + config.ping_interval_ms));
            fold(Some(self.last_receive_ms + config.peer_timeout_ms));
        }

        deadline
    }

    /// Marks the remote disconnect event as locally requested so teardown reports it.
    pub fn expect_disconnect_event(&mut self) {
        self.disconnect_event_pending = true;
    }

    /// Connection token received with the connect-request (listener side).
    pub fn connection_token(&self) -> &[u8] {
        &self.connection_token
    }
}
