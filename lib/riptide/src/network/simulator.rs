use crate::address::{Address, FamilyMode};
use crate::config::SimulatorConfig;
use crate::network::{InterfaceFilter, Network};
use crate::support::{NetworkError, NetworkResult};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use undertow::logging;
use undertow::time::{duration_millis, Clock};

/// Extra hold applied to a reordered datagram so traffic sent after it overtakes it.
const REORDER_HOLD_MS: u64 = 16;

const SCRATCH_SIZE: usize = 65536;

#[derive(Eq, PartialEq)]
struct Delayed {
    due_ms: u64,
    order: u64,
    endpoint: Address,
    data: Vec<u8>,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Delayed) -> std::cmp::Ordering {
        (self.due_ms, self.order).cmp(&(other.due_ms, other.order))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Delayed) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct DelayQueue {
    entries: BinaryHeap<Reverse<Delayed>>,
}

impl DelayQueue {
    fn new() -> DelayQueue {
        DelayQueue {
            entries: BinaryHeap::new(),
        }
    }

    #[inline]
    fn push(&mut self, entry: Delayed) {
        self.entries.push(Reverse(entry));
    }

    #[inline]
    fn pop_due(&mut self, now_ms: u64) -> Option<Delayed> {
        let due = match self.entries.peek() {
            Some(Reverse(head)) => head.due_ms <= now_ms,
            None => false,
        };

        match due {
            true => self.entries.pop().map(|Reverse(entry)| entry),
            false => None,
        }
    }

    #[inline]
    fn next_due(&self) -> Option<u64> {
        self.entries.peek().map(|Reverse(head)| head.due_ms)
    }
}

struct DirectionConfig {
    loss: u32,
    duplicate: u32,
    reorder: u32,
    latency_ms: u64,
}

/// Interference injector wrapping another provider. Per direction it applies, in order:
/// probabilistic loss, probabilistic duplication, probabilistic reorder, probabilistic
/// bit corruption, then fixed latency plus uniform jitter. Random draws come from a
/// non-cryptographic stream seeded by the host.
pub struct InterferenceSimulator {
    inner: Box<dyn Network>,
    config: SimulatorConfig,
    incoming_cfg: DirectionConfig,
    outgoing_cfg: DirectionConfig,
    rng: SmallRng,
    clock: Clock,
    outgoing: DelayQueue,
    incoming: DelayQueue,
    order_counter: u64,
    scratch: Vec<u8>,
    log: logging::Logger,
}

impl InterferenceSimulator {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        inner: Box<dyn Network>,
        config: SimulatorConfig,
        seed: u64,
        log: L,
    ) -> InterferenceSimulator {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "simulator")),
            _ => logging::discard(),
        };

        InterferenceSimulator {
            inner,
            incoming_cfg: DirectionConfig {
                loss: config.incoming_loss,
                duplicate: config.incoming_duplicate,
                reorder: config.incoming_reorder,
                latency_ms: config.incoming_latency_ms,
            },
            outgoing_cfg: DirectionConfig {
                loss: config.outgoing_loss,
                duplicate: config.outgoing_duplicate,
                reorder: config.outgoing_reorder,
                latency_ms: config.outgoing_latency_ms,
            },
            config,
            rng: SmallRng::seed_from_u64(seed),
            clock: Clock::new(),
            outgoing: DelayQueue::new(),
            incoming: DelayQueue::new(),
            order_counter: 0,
            scratch: vec![0u8; SCRATCH_SIZE],
            log,
        }
    }

    #[inline]
    fn draw(rng: &mut SmallRng, factor: u32) -> bool {
        factor != 0 && rng.gen::<u32>() < factor
    }

    /// Runs one datagram through the loss/duplicate/reorder/corrupt/delay stages and
    /// schedules the survivors on `queue`. Returns false when the datagram was lost.
    fn stage(
        queue: &mut DelayQueue,
        rng: &mut SmallRng,
        config: &SimulatorConfig,
        direction: &DirectionConfig,
        order_counter: &mut u64,
        data: &[u8],
        endpoint: Address,
        now_ms: u64,
    ) -> bool {
        if Self::draw(rng, direction.loss) {
            return false;
        }

        let jitter = match config.jitter_ms {
            0 => 0,
            jitter_ms => rng.gen_range(0..=jitter_ms),
        };
        let mut due_ms = now_ms + direction.latency_ms + jitter;

        if Self::draw(rng, direction.duplicate) {
            let copy_jitter = match config.jitter_ms {
                0 => 1,
                jitter_ms => rng.gen_range(1..=jitter_ms.max(1)),
            };
            *order_counter += 1;
            queue.push(Delayed {
                due_ms: now_ms + direction.latency_ms + copy_jitter,
                order: *order_counter,
                endpoint,
                data: data.to_vec(),
            });
        }

        if Self::draw(rng, direction.reorder) {
            due_ms += rng.gen_range(1..=REORDER_HOLD_MS);
        }

        let mut data = data.to_vec();

        if Self::draw(rng, config.bit_flip) && !data.is_empty() {
            let flips = rng.gen_range(config.bit_flip_min..=config.bit_flip_max.max(config.bit_flip_min));
            for _ in 0..flips {
                let bit = rng.gen_range(0..data.len() * 8);
                data[bit / 8] ^= 1 << (bit % 8);
            }
        }

        *order_counter += 1;
        queue.push(Delayed {
            due_ms,
            order: *order_counter,
            endpoint,
            data,
        });

        true
    }

    /// Emits every due outgoing datagram. Transient send congestion reschedules the
    /// datagram for the next pass.
    fn pump_outgoing(&mut self, now_ms: u64) -> NetworkResult<()> {
        while let Some(entry) = self.outgoing.pop_due(now_ms) {
            match self.inner.send(&entry.data, &entry.endpoint) {
                Ok(()) => (),
                Err(NetworkError::Wait) => {
                    self.outgoing.push(entry);
                    return Ok(());
                }
                Err(fatal) => return Err(fatal),
            }
        }

        Ok(())
    }
}

impl Network for InterferenceSimulator {
    fn bind(&mut self, address: &Address, mode: FamilyMode) -> NetworkResult<Address> {
        self.inner.bind(address, mode)
    }

    fn send(&mut self, data: &[u8], to: &Address) -> NetworkResult<()> {
        let now_ms = self.clock.now_ms();
        self.pump_outgoing(now_ms)?;

        let kept = Self::stage(
            &mut self.outgoing,
            &mut self.rng,
            &self.config,
            &self.outgoing_cfg,
            &mut self.order_counter,
            data,
            *to,
            now_ms,
        );

        if !kept {
            logging::trace!(self.log, "outgoing datagram lost"; "size" => data.len());
        }

        self.pump_outgoing(self.clock.now_ms())
    }

    fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> NetworkResult<Option<(usize, Address)>> {
        let deadline_ms = self.clock.now_ms() + duration_millis(timeout);

        loop {
            let now_ms = self.clock.now_ms();
            self.pump_outgoing(now_ms)?;

            if let Some(entry) = self.incoming.pop_due(now_ms) {
                let size = entry.data.len().min(buffer.len());
                buffer[..size].copy_from_slice(&entry.data[..size]);
                return Ok(Some((size, entry.endpoint)));
            }

            if now_ms >= deadline_ms {
                return Ok(None);
            }

            // Sleep no further than the next scheduled event in either direction.
            let mut wake_ms = deadline_ms;
            if let Some(due) = self.incoming.next_due() {
                wake_ms = wake_ms.min(due);
            }
            if let Some(due) = self.outgoing.next_due() {
                wake_ms = wake_ms.min(due);
            }

            let wait = Duration::from_millis(wake_ms.saturating_sub(now_ms).max(1));

            if let Some((size, from)) = self.inner.receive(&mut self.scratch[..], wait)? {
                let arrival_ms = self.clock.now_ms();
                let scratch = &self.scratch[..size];

                let kept = Self::stage(
                    &mut self.incoming,
                    &mut self.rng,
                    &self.config,
                    &self.incoming_cfg,
                    &mut self.order_counter,
                    scratch,
                    from,
                    arrival_ms,
                );

                if !kept {
                    logging::trace!(self.log, "incoming datagram lost"; "size" => size);
                }
            }
        }
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
