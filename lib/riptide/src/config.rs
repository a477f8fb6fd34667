use serde_derive::{Deserialize, Serialize};

/// Host and peer tuning knobs. Every field has a workable default; embedders override
/// selectively (the reference driver loads these from TOML).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on concurrently live peers. Further handshakes are denied.
    pub max_peers: usize,
    /// Maximum channel count a peer may negotiate.
    pub max_channels: usize,

    /// Largest datagram the host will ever emit, before path probing narrows it down.
    pub mtu_ceiling: usize,
    /// Smallest MTU the prober may settle on.
    pub mtu_floor: usize,

    /// A reliable command abandoning delivery after this many retransmissions turns the
    /// peer into a zombie.
    pub retransmission_cap: u32,
    /// Ceiling for the per-command backoff timer, milliseconds.
    pub retransmission_timeout_max_ms: u64,
    /// Initial retransmission timeout used before an RTT estimate exists, milliseconds.
    pub retransmission_timeout_initial_ms: u64,

    /// Quiet-link ping cadence, milliseconds.
    pub ping_interval_ms: u64,
    /// Consecutive ping intervals without any inbound traffic before the peer is
    /// declared dead; a faster detector than the silence timeout on idle links.
    pub ping_failure_ceiling: u32,
    /// Silence interval after which a peer is declared dead, milliseconds.
    pub peer_timeout_ms: u64,
    /// Handshake deadline for both sides, milliseconds.
    pub connect_timeout_ms: u64,
    /// Incomplete fragment sets older than this are retransmitted (reliable) or dropped
    /// (unreliable), milliseconds.
    pub reassembly_timeout_ms: u64,
    /// A zombie slot is reclaimed for reuse after this grace period, milliseconds.
    pub zombie_grace_ms: u64,

    /// Advertised bandwidth hints, bytes per second; zero means unlimited.
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,

    /// Decompression output cap; a datagram inflating beyond this is dropped.
    pub max_decompressed_size: usize,

    /// Protocol error count at which a peer is zombied.
    pub protocol_error_threshold: u32,

    pub throttle: ThrottleConfig,
    pub simulator: SimulatorConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_peers: 4096,
            max_channels: 256,
            mtu_ceiling: 1400,
            mtu_floor: 576,
            retransmission_cap: 16,
            retransmission_timeout_max_ms: 5_000,
            retransmission_timeout_initial_ms: 500,
            ping_interval_ms: 500,
            ping_failure_ceiling: 16,
            peer_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            reassembly_timeout_ms: 10_000,
            zombie_grace_ms: 30_000,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            max_decompressed_size: 1 << 20,
            protocol_error_threshold: 32,
            throttle: ThrottleConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

/// Outbound rate limiter parameters, exchangeable over the wire via the
/// throttle-configure command.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Measurement window, milliseconds.
    pub interval_ms: u32,
    /// Additive rate growth per clean window, bytes per second.
    pub acceleration: u32,
    /// Divisor applied to the rate when a window sees loss.
    pub deceleration: u32,
}

impl Default for ThrottleConfig {
    fn default() -> ThrottleConfig {
        ThrottleConfig {
            interval_ms: 5_000,
            acceleration: 2,
            deceleration: 2,
        }
    }
}

/// Interference injection factors. All probability factors are numerators over 2^32,
/// so zero disables a stage and `u32::max_value()` makes it (near) certain.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub incoming_loss: u32,
    pub outgoing_loss: u32,
    pub incoming_duplicate: u32,
    pub outgoing_duplicate: u32,
    pub incoming_reorder: u32,
    pub outgoing_reorder: u32,
    pub bit_flip: u32,
    /// Bounds on the number of bits flipped when the bit-flip stage fires. At least
    /// `min` bits flip, at most `max`, chosen uniformly.
    pub bit_flip_min: u32,
    pub bit_flip_max: u32,
    pub incoming_latency_ms: u64,
    pub outgoing_latency_ms: u64,
    pub jitter_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> SimulatorConfig {
        SimulatorConfig {
            incoming_loss: 0,
            outgoing_loss: 0,
            incoming_duplicate: 0,
            outgoing_duplicate: 0,
            incoming_reorder: 0,
            outgoing_reorder: 0,
            bit_flip: 0,
            bit_flip_min: 1,
            bit_flip_max: 1,
            incoming_latency_ms: 0,
            outgoing_latency_ms: 0,
            jitter_ms: 0,
        }
    }
}

impl SimulatorConfig {
    /// True when every stage is disabled and the simulator would be a passthrough.
    #[inline]
    pub fn is_inert(&self) -> bool {
        self.incoming_loss == 0
            && self.outgoing_loss == 0
            && self.incoming_duplicate == 0
            && self.outgoing_duplicate == 0
            && self.incoming_reorder == 0
            && self.outgoing_reorder == 0
            && self.bit_flip == 0
            && self.incoming_latency_ms == 0
            && self.outgoing_latency_ms == 0
            && self.jitter_ms == 0
    }

    /// Probability factor for a loss rate, e.g. `factor(0.25)` for 25% loss.
    #[inline]
    pub fn factor(probability: f64) -> u32 {
        (probability.max(0.0).min(1.0) * f64::from(u32::max_value())) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();

        assert!(config.mtu_floor <= config.mtu_ceiling);
        assert!(config.retransmission_timeout_initial_ms <= config.retransmission_timeout_max_ms);
        assert!(config.ping_interval_ms < config.peer_timeout_ms);
        assert!(config.ping_failure_ceiling > 0);
        // The ping detector must fire well before the silence timeout does.
        assert!(
            u64::from(config.ping_failure_ceiling) * config.ping_interval_ms
                < config.peer_timeout_ms
        );
        assert!(config.simulator.is_inert());
    }

    #[test]
    fn test_probability_factor() {
        assert_eq!(SimulatorConfig::factor(0.0), 0);
        assert_eq!(SimulatorConfig::factor(1.0), u32::max_value());

        let quarter = SimulatorConfig::factor(0.25);
        assert!(quarter > u32::max_value() / 5 && quarter < u32::max_value() / 3);
    }

    #[test]
    fn test_simulator_inert_detection() {
        let mut config = SimulatorConfig::default();
        assert!(config.is_inert());

        config.incoming_loss = 1;
        assert!(!config.is_inert());
    }
}
