use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Wall clock in epoch milliseconds.
///
/// The epoch reading is taken once and then advanced with the Tokio clock, so
/// a paused test runtime moves session expiry and record timestamps forward
/// together with its timers.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch_ms: u64,
    anchor: Instant,
}

impl Clock {
    pub fn system() -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self::starting_at(epoch_ms)
    }

    pub fn starting_at(epoch_ms: u64) -> Self {
        Self {
            epoch_ms,
            anchor: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch_ms
            .saturating_add(self.anchor.elapsed().as_millis() as u64)
    }

    /// Time left until `deadline_ms`, zero once it has passed.
    pub fn until(&self, deadline_ms: u64) -> Duration {
        Duration::from_millis(deadline_ms.saturating_sub(self.now_ms()))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
