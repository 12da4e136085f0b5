use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Conditions that force the emergency stop, evaluated fresh every tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopCauses {
    pub input: bool,
    pub cannot_send: bool,
    pub not_active: bool,
    pub connection_timeout: bool,
}

impl StopCauses {
    pub fn any(&self) -> bool {
        self.input || self.cannot_send || self.not_active || self.connection_timeout
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.input {
            parts.push("input");
        }
        if self.cannot_send {
            parts.push("cannot_send");
        }
        if self.not_active {
            parts.push("not_active");
        }
        if self.connection_timeout {
            parts.push("connection_timeout");
        }
        if parts.is_empty() {
            "none".to_string()
        } else {
            parts.join(",")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchTransition {
    Engaged,
    Released,
}

/// Edge-triggered stop latch. Engages on the first tick any cause holds and
/// releases once no cause holds and `hold` has passed since engagement.
#[derive(Debug)]
pub struct DeadmanLatch {
    hold: Duration,
    engaged_at: Option<Instant>,
}

impl DeadmanLatch {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            engaged_at: None,
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged_at.is_some()
    }

    pub fn update(&mut self, causes: StopCauses, now: Instant) -> Option<LatchTransition> {
        match self.engaged_at {
            None if causes.any() => {
                self.engaged_at = Some(now);
                Some(LatchTransition::Engaged)
            }
            None => None,
            Some(at) if !causes.any() && now.saturating_duration_since(at) >= self.hold => {
                self.engaged_at = None;
                Some(LatchTransition::Released)
            }
            Some(_) => None,
        }
    }
}
