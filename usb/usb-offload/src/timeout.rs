use std::time::{Duration, Instant};

/// Deadline for condvar waits on command completions and DSP releases.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    /// Time left before expiry, zero once expired. Waits re-arm with this so that
    /// spurious wakeups do not extend the deadline.
    #[inline]
    pub fn remaining(&self) -> Duration {
        self.duration
            .checked_sub(self.instant.elapsed())
            .unwrap_or_default()
    }
}
