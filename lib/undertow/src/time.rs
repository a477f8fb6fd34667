use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Monotonic millisecond clock anchored at construction. All protocol timers are driven
/// off a single clock so one service pass observes one `now`.
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    #[inline]
    pub fn new() -> Clock {
        Clock { epoch: Instant::now() }
    }

    /// Milliseconds elapsed since the clock was created.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        duration_millis(self.epoch.elapsed())
    }

    /// The low 16 bits of `now_ms`, as carried in the sent-time header extension.
    #[inline]
    pub fn now_ms16(&self) -> u16 {
        self.now_ms() as u16
    }
}

#[inline]
pub fn duration_millis(duration: Duration) -> u64 {
    duration.as_secs() * 1000 + u64::from(duration.subsec_millis())
}
