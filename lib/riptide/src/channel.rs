use crate::command::{Command, CommandBody};
use crate::support::{extend_nearest, ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Modulus of the 16 bit reliable sequence space carried on the wire. Internally every
/// sequence is a 64 bit counter extended to the nearest candidate.
const SEQUENCE_SPACE: u64 = 1 << 16;

/// Maximum reliable sequences outstanding per channel. The ack format covers a base
/// plus 32 prior sequences, so anything wider could strand an unackable command.
pub const TRANSFER_WINDOW: u64 = 32;

/// Consecutive uncovered acks before a command is retransmitted early.
const FAST_RETRANSMIT_MISSES: u32 = 3;

/// Per-peer channel discipline, selected independently per channel at host start.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelKind {
    /// Guaranteed, in order; newer messages wait for gaps to fill.
    ReliableOrdered = 0,
    /// Guaranteed; delivered as completed regardless of send order.
    ReliableUnordered = 1,
    /// Best effort; messages older than the last delivered are dropped.
    UnreliableOrdered = 2,
    /// Best effort; delivered on arrival.
    UnreliableUnordered = 3,
}

impl ChannelKind {
    #[inline]
    pub fn from_wire(value: u8) -> NetworkResult<ChannelKind> {
        match value {
            0 => Ok(ChannelKind::ReliableOrdered),
            1 => Ok(ChannelKind::ReliableUnordered),
            2 => Ok(ChannelKind::UnreliableOrdered),
            3 => Ok(ChannelKind::UnreliableUnordered),
            _ => Err(NetworkError::Fatal(ErrorType::ChannelMismatch)),
        }
    }

    #[inline]
    pub fn is_reliable(&self) -> bool {
        matches!(self, ChannelKind::ReliableOrdered | ChannelKind::ReliableUnordered)
    }

    #[inline]
    pub fn is_ordered(&self) -> bool {
        matches!(self, ChannelKind::ReliableOrdered | ChannelKind::UnreliableOrdered)
    }
}

/// A reliable command in flight: sent at least once, not yet acked.
struct InFlight {
    sequence: u64,
    body: CommandBody,
    size: usize,
    next_retry_ms: u64,
    retry_interval_ms: u64,
    retries: u32,
    missed_acks: u32,
}

/// A command queued but never transmitted.
struct Outgoing {
    sequence: Option<u64>,
    body: CommandBody,
}

struct Assembly {
    count: u16,
    total_length: u32,
    have: u16,
    parts: Vec<Option<Box<[u8]>>>,
    started_ms: u64,
}

impl Assembly {
    fn new(count: u16, total_length: u32, now_ms: u64) -> Assembly {
        Assembly {
            count,
            total_length,
            have: 0,
            parts: vec![None; count as usize],
            started_ms: now_ms,
        }
    }

    /// Stores one fragment; true once every part is present.
    fn insert(&mut self, index: u16, payload: Box<[u8]>) -> bool {
        let slot = &mut self.parts[index as usize];
        if slot.is_none() {
            *slot = Some(payload);
            self.have += 1;
        }
        self.have == self.count
    }

    fn assemble(self) -> NetworkResult<Box<[u8]>> {
        let mut message = Vec::with_capacity(self.total_length as usize);

        for part in self.parts {
            message.extend_from_slice(&part.expect("Assembly must be complete"));
        }

        if message.len() != self.total_length as usize {
            return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
        }

        Ok(message.into_boxed_slice())
    }
}

/// Result of applying one ack command to the outgoing side.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct AckOutcome {
    pub acked_commands: usize,
    pub acked_bytes: usize,
    /// A gap in the ack coverage scheduled an early retransmission.
    pub fast_retransmit: bool,
}

/// One message lane of a peer. Owns both directions: the outgoing queue with its
/// retransmission bookkeeping, and the incoming reassembly, ordering and ack state.
pub struct Channel {
    kind: ChannelKind,
    index: u8,

    // Outgoing direction.
    next_out: u64,
    pending: VecDeque<Outgoing>,
    in_flight: Vec<InFlight>,

    // Incoming direction, reliable kinds: every sequence below `in_floor` has been
    // received; `received` holds the sparse set above it.
    in_floor: u64,
    received: BTreeSet<u64>,
    highest_in: u64,
    seen_any: bool,

    // Ordered delivery state. For reliable-ordered, `deliver_next` is the sequence the
    // next released message must start at; for unreliable-ordered, the newest delivered
    // sequence gates staleness.
    deliver_next: u64,
    newest_delivered: Option<u64>,

    ordering: BTreeMap<u64, (u16, Box<[u8]>)>,
    assembly: HashMap<u64, Assembly>,

    ready: VecDeque<Box<[u8]>>,
    ack_pending: bool,
}

impl Channel {
    pub fn new(kind: ChannelKind, index: u8) -> Channel {
        Channel {
            kind,
            index,
            next_out: 0,
            pending: VecDeque::new(),
            in_flight: Vec::new(),
            in_floor: 0,
            received: BTreeSet::new(),
            highest_in: 0,
            seen_any: false,
            deliver_next: 0,
            newest_delivered: None,
            ordering: BTreeMap::new(),
            assembly: HashMap::new(),
            ready: VecDeque::new(),
            ack_pending: false,
        }
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Queues one application message, splitting it into fragments when it exceeds the
    /// threshold. `fragment_size` is the per-fragment payload budget at the current MTU.
    pub fn enqueue(
        &mut self,
        payload: &[u8],
        threshold: usize,
        fragment_size: usize,
    ) -> NetworkResult<()> {
        if payload.len() <= threshold {
            let body = match self.kind {
                ChannelKind::ReliableOrdered | ChannelKind::ReliableUnordered => {
                    CommandBody::SendReliable {
                        payload: payload.to_vec().into_boxed_slice(),
                    }
                }
                ChannelKind::UnreliableOrdered => CommandBody::SendUnreliable {
                    payload: payload.to_vec().into_boxed_slice(),
                },
                ChannelKind::UnreliableUnordered => CommandBody::SendUnsequenced {
                    payload: payload.to_vec().into_boxed_slice(),
                },
            };

            let sequence = match self.kind {
                ChannelKind::UnreliableUnordered => None,
                _ => Some(self.assign_sequence()),
            };

            self.pending.push_back(Outgoing { sequence, body });
            return Ok(());
        }

        let count = (payload.len() + fragment_size - 1) / fragment_size;
        if count > u16::max_value() as usize {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        // Each fragment consumes its own sequence so acks and retransmission work at
        // fragment granularity; the message occupies the contiguous run.
        for index in 0..count {
            let offset = index * fragment_size;
            let end = (offset + fragment_size).min(payload.len());

            let sequence = self.assign_sequence();
            self.pending.push_back(Outgoing {
                sequence: Some(sequence),
                body: CommandBody::SendFragment {
                    index: index as u16,
                    count: count as u16,
                    total_length: payload.len() as u32,
                    payload: payload[offset..end].to_vec().into_boxed_slice(),
                },
            });
        }

        Ok(())
    }

    /// Queues a bare control command (ping, disconnect, parameter exchange) on this
    /// channel's reliable sequence space.
    pub fn enqueue_control(&mut self, body: CommandBody) {
        let sequence = Some(self.assign_sequence());
        self.pending.push_back(Outgoing { sequence, body });
    }

    /// Consumes one outgoing sequence without queueing anything. The handshake burns
    /// sequence zero this way for the verify-connect it retransmits itself, so the
    /// remote side's received-mark for it stays consistent.
    pub fn reserve_sequence(&mut self) -> u64 {
        self.assign_sequence()
    }

    #[inline]
    fn assign_sequence(&mut self) -> u64 {
        let sequence = self.next_out;
        self.next_out += 1;
        sequence
    }

    /// Lowest assigned sequence not yet acked.
    fn window_base(&self) -> u64 {
        self.in_flight
            .iter()
            .map(|entry| entry.sequence)
            .min()
            .or_else(|| self.pending.front().and_then(|entry| entry.sequence))
            .unwrap_or(self.next_out)
    }

    /// Collects commands to transmit within `budget` bytes: due retransmissions first,
    /// then fresh traffic while the transfer window allows. Reliable commands move to
    /// the in-flight store with their retry timers armed. Returns the number of
    /// retransmitted commands, for the host's counters.
    pub fn transmit(
        &mut self,
        now_ms: u64,
        rto_ms: u64,
        rto_cap_ms: u64,
        budget: &mut usize,
        out: &mut Vec<Command>,
    ) -> usize {
        let index = self.index;
        let mut retransmitted = 0;

        for entry in self.in_flight.iter_mut() {
            if entry.next_retry_ms > now_ms {
                continue;
            }

            let command = Command {
                channel: index,
                sequence: (entry.sequence & 0xffff) as u16,
                body: entry.body.clone(),
            };

            let size = command.wire_size();
            if size > *budget {
                continue;
            }

            *budget -= size;
            entry.retries += 1;
            entry.retry_interval_ms = (entry.retry_interval_ms * 2).min(rto_cap_ms);
            entry.next_retry_ms = now_ms + entry.retry_interval_ms;
            entry.missed_acks = 0;
            retransmitted += 1;

            out.push(command);
        }

        let window_limit = self.window_base() + TRANSFER_WINDOW;

        while let Some(front) = self.pending.front() {
            if let Some(sequence) = front.sequence {
                if self.kind.is_reliable() && sequence >= window_limit {
                    break;
                }
            }

            let wire_sequence = front.sequence.map(|seq| (seq & 0xffff) as u16).unwrap_or(0);
            let command = Command {
                channel: index,
                sequence: wire_sequence,
                body: front.body.clone(),
            };

            let size = command.wire_size();
            if size > *budget {
                break;
            }

            *budget -= size;
            let entry = self.pending.pop_front().expect("Front checked above");

            if self.kind.is_reliable() {
                if let Some(sequence) = entry.sequence {
                    let interval = rto_ms.min(rto_cap_ms);
                    self.in_flight.push(InFlight {
                        sequence,
                        body: entry.body,
                        size,
                        next_retry_ms: now_ms + interval,
                        retry_interval_ms: interval,
                        retries: 0,
                        missed_acks: 0,
                    });
                }
            }

            out.push(command);
        }

        retransmitted
    }

    /// Applies an ack (base plus bitfield of the 32 prior sequences) to the in-flight
    /// store.
    pub fn process_ack(&mut self, base: u16, bits: u32, now_ms: u64) -> AckOutcome {
        let base = extend_nearest(self.next_out, u64::from(base), SEQUENCE_SPACE);

        // An ack for traffic never sent is protocol noise.
        if base >= self.next_out {
            return AckOutcome::default();
        }

        let covered = |sequence: u64| -> bool {
            if sequence == base {
                return true;
            }
            if sequence < base {
                let offset = base - sequence;
                return offset <= 32 && bits & (1 << (offset - 1)) != 0;
            }
            false
        };

        let mut outcome = AckOutcome::default();

        self.in_flight.retain(|entry| {
            if covered(entry.sequence) {
                outcome.acked_commands += 1;
                outcome.acked_bytes += entry.size;
                false
            } else {
                true
            }
        });

        // Sequences the ack window has passed over without covering are presumed lost;
        // after a few such misses the command retransmits without waiting for its timer.
        for entry in self.in_flight.iter_mut() {
            if entry.sequence < base {
                entry.missed_acks += 1;
                if entry.missed_acks >= FAST_RETRANSMIT_MISSES {
                    entry.next_retry_ms = now_ms;
                    entry.missed_acks = 0;
                    outcome.fast_retransmit = true;
                }
            }
        }

        outcome
    }

    /// Highest retry count across in-flight commands, for the retransmission ceiling.
    pub fn max_retries(&self) -> u32 {
        self.in_flight.iter().map(|entry| entry.retries).max().unwrap_or(0)
    }

    /// Processes one incoming channel command. Reliable arrivals mark ack state even
    /// when the payload is a duplicate.
    pub fn receive(&mut self, command: Command, now_ms: u64) -> NetworkResult<()> {
        match command.body {
            CommandBody::SendUnsequenced { payload } => {
                self.ready.push_back(payload);
                Ok(())
            }
            CommandBody::SendReliable { payload } => {
                let sequence = self.extend_incoming(command.sequence);
                self.receive_sequenced(sequence, 1, payload, now_ms)
            }
            CommandBody::SendUnreliable { payload } => {
                let sequence = self.extend_incoming(command.sequence);
                self.receive_sequenced(sequence, 1, payload, now_ms)
            }
            CommandBody::SendFragment {
                index,
                count,
                total_length,
                payload,
            } => {
                let sequence = self.extend_incoming(command.sequence);
                self.receive_fragment(sequence, index, count, total_length, payload, now_ms)
            }
            _ => Err(NetworkError::Fatal(ErrorType::MalformedCommand)),
        }
    }

    /// Marks a bare reliable command (control traffic) received. Returns true when the
    /// sequence is fresh and the command should be dispatched.
    pub fn receive_bare(&mut self, wire_sequence: u16) -> bool {
        let sequence = self.extend_incoming(wire_sequence);
        self.ack_pending = true;

        if self.already_received(sequence) {
            return false;
        }

        self.mark_received(sequence);
        // Bare commands occupy the sequence space without producing a message, so
        // ordered delivery must not wait for them.
        if self.deliver_next == sequence {
            self.deliver_next = sequence + 1;
        }
        self.release_ordered();
        true
    }

    #[inline]
    fn extend_incoming(&mut self, wire: u16) -> u64 {
        let anchor = match self.seen_any {
            true => self.highest_in + 1,
            false => 0,
        };
        extend_nearest(anchor, u64::from(wire), SEQUENCE_SPACE)
    }

    #[inline]
    fn already_received(&self, sequence: u64) -> bool {
        sequence < self.in_floor || self.received.contains(&sequence)
    }

    fn mark_received(&mut self, sequence: u64) {
        if self.seen_any {
            self.highest_in = self.highest_in.max(sequence);
        } else {
            self.highest_in = sequence;
            self.seen_any = true;
        }

        if sequence == self.in_floor {
            self.in_floor += 1;
            while self.received.remove(&self.in_floor) {
                self.in_floor += 1;
            }
        } else if sequence > self.in_floor {
            self.received.insert(sequence);
        }
    }

    fn receive_sequenced(
        &mut self,
        sequence: u64,
        count: u16,
        payload: Box<[u8]>,
        _now_ms: u64,
    ) -> NetworkResult<()> {
        match self.kind {
            ChannelKind::ReliableOrdered | ChannelKind::ReliableUnordered => {
                self.ack_pending = true;

                if self.already_received(sequence) {
                    return Ok(());
                }
                self.mark_received(sequence);

                match self.kind {
                    ChannelKind::ReliableOrdered => {
                        self.ordering.insert(sequence, (count, payload));
                        self.release_ordered();
                    }
                    _ => self.ready.push_back(payload),
                }
                Ok(())
            }
            ChannelKind::UnreliableOrdered => {
                self.track_unreliable(sequence);
                self.deliver_if_newer(sequence, count, payload);
                Ok(())
            }
            ChannelKind::UnreliableUnordered => {
                self.track_unreliable(sequence);
                self.ready.push_back(payload);
                Ok(())
            }
        }
    }

    fn receive_fragment(
        &mut self,
        sequence: u64,
        index: u16,
        count: u16,
        total_length: u32,
        payload: Box<[u8]>,
        now_ms: u64,
    ) -> NetworkResult<()> {
        if count == 0 || index >= count {
            return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
        }

        let start = sequence
            .checked_sub(u64::from(index))
            .ok_or(NetworkError::Fatal(ErrorType::MalformedCommand))?;

        if self.kind.is_reliable() {
            self.ack_pending = true;

            if self.already_received(sequence) {
                return Ok(());
            }
            self.mark_received(sequence);
        } else {
            self.track_unreliable(sequence);

            // Stale fragments of an already superseded message are not worth holding.
            if let Some(newest) = self.newest_delivered {
                if self.kind == ChannelKind::UnreliableOrdered && start <= newest {
                    return Ok(());
                }
            }
        }

        let assembly = self
            .assembly
            .entry(start)
            .or_insert_with(|| Assembly::new(count, total_length, now_ms));

        if assembly.count != count || assembly.total_length != total_length {
            return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
        }

        if !assembly.insert(index, payload) {
            return Ok(());
        }

        let assembly = self.assembly.remove(&start).expect("Assembly present");
        let message = assembly.assemble()?;

        match self.kind {
            ChannelKind::ReliableOrdered => {
                self.ordering.insert(start, (count, message));
                self.release_ordered();
            }
            ChannelKind::ReliableUnordered | ChannelKind::UnreliableUnordered => {
                self.ready.push_back(message);
            }
            ChannelKind::UnreliableOrdered => {
                self.deliver_if_newer(start, count, message);
            }
        }

        Ok(())
    }

    #[inline]
    fn track_unreliable(&mut self, sequence: u64) {
        if self.seen_any {
            self.highest_in = self.highest_in.max(sequence);
        } else {
            self.highest_in = sequence;
            self.seen_any = true;
        }
    }

    /// Unreliable-ordered gate: drop anything not strictly newer than the newest
    /// delivered message.
    fn deliver_if_newer(&mut self, start: u64, count: u16, message: Box<[u8]>) {
        let newest_end = start + u64::from(count) - 1;

        match self.newest_delivered {
            Some(newest) if start <= newest => (),
            _ => {
                self.newest_delivered = Some(newest_end);
                self.ready.push_back(message);
            }
        }
    }

    /// Pops the longest contiguous prefix of completed messages starting at the expected
    /// delivery sequence.
    fn release_ordered(&mut self) {
        loop {
            // Fragments complete out of order, so release only messages whose whole run
            // has been received (the floor has passed their end).
            let entry = match self.ordering.get(&self.deliver_next) {
                Some((count, _)) if self.deliver_next + u64::from(*count) <= self.in_floor => {
                    self.ordering.remove(&self.deliver_next)
                }
                _ => None,
            };

            match entry {
                Some((count, message)) => {
                    self.deliver_next += u64::from(count);
                    self.ready.push_back(message);
                }
                None => break,
            }
        }
    }

    /// Builds the pending ack command, if any arrival since the last call warrants one.
    /// The sent-time echo is stamped by the peer when the carrying datagram is built.
    pub fn take_ack(&mut self) -> Option<Command> {
        if !self.ack_pending || !self.seen_any {
            return None;
        }
        self.ack_pending = false;

        let base = self.highest_in;
        let mut bits = 0u32;

        for offset in 1..=32u64 {
            match base.checked_sub(offset) {
                Some(sequence) => {
                    if sequence < self.in_floor || self.received.contains(&sequence) {
                        bits |= 1 << (offset - 1);
                    }
                }
                None => break,
            }
        }

        Some(Command {
            channel: self.index,
            sequence: 0,
            body: CommandBody::Ack {
                base: (base & 0xffff) as u16,
                bits,
                sent_time_echo: 0,
            },
        })
    }

    /// Drops unreliable partial assemblies that have outlived the reassembly window.
    /// Reliable assemblies stay: their missing fragments are retransmitted by the
    /// sender's timers.
    pub fn expire_assemblies(&mut self, now_ms: u64, timeout_ms: u64) {
        if self.kind.is_reliable() {
            return;
        }

        self.assembly
            .retain(|_, assembly| now_ms < assembly.started_ms + timeout_ms);
    }

    /// One delivered message, in this channel's delivery order.
    #[inline]
    pub fn pop_ready(&mut self) -> Option<Box<[u8]>> {
        self.ready.pop_front()
    }

    /// True when unsent or unacked traffic remains.
    #[inline]
    pub fn has_outstanding(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// True when an ack is owed to the remote side.
    #[inline]
    pub fn wants_transmit(&self, now_ms: u64) -> bool {
        self.ack_pending
            || !self.pending.is_empty()
            || self
                .in_flight
                .iter()
                .any(|entry| entry.next_retry_ms <= now_ms)
    }

    /// Earliest pending retransmission deadline, for service-pass scheduling.
    pub fn next_timer_ms(&self) -> Option<u64> {
        self.in_flight.iter().map(|entry| entry.next_retry_ms).min()
    }
}
