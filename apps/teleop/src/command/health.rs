use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub since_last_success: Duration,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub latest_acked_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Applied,
    /// A newer publish already resolved; this result is ignored.
    Stale,
}

/// Write health of one open command link.
#[derive(Debug)]
pub struct ConnectionHealth {
    opened_at: Instant,
    last_success: Option<Instant>,
    last_resolved_seq: u64,
    latest_acked_seq: u64,
    consecutive_failures: u32,
    total_failures: u64,
}

impl ConnectionHealth {
    pub fn new(opened_at: Instant) -> Self {
        Self {
            opened_at,
            last_success: None,
            last_resolved_seq: 0,
            latest_acked_seq: 0,
            consecutive_failures: 0,
            total_failures: 0,
        }
    }

    /// A write outside the tick sequence (status record, probe) went through.
    pub fn mark_success(&mut self, now: Instant) {
        self.last_success = Some(now);
        self.consecutive_failures = 0;
    }

    pub fn record(&mut self, seq: u64, ok: bool, now: Instant) -> PublishOutcome {
        if seq <= self.last_resolved_seq {
            return PublishOutcome::Stale;
        }
        self.last_resolved_seq = seq;
        if ok {
            self.latest_acked_seq = seq;
            self.mark_success(now);
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.total_failures = self.total_failures.saturating_add(1);
        }
        PublishOutcome::Applied
    }

    /// Time without a successful write, counted from open if none succeeded.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_success.unwrap_or(self.opened_at))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        HealthSnapshot {
            since_last_success: self.silence(now),
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            latest_acked_seq: self.latest_acked_seq,
        }
    }
}
