//! Bounded blocking helpers for the process-exit teardown path.

use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::warn;

/// One wall-clock budget shared by consecutive teardown steps.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    until: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            until: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.until.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Run `work` on its own thread and wait at most `budget` for it. A step
/// that overruns keeps running detached; its result is dropped.
pub fn run_bounded<T, F>(name: &str, budget: Duration, work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if budget.is_zero() {
        warn!(target: "teleop::session", step = name, "no time left for teardown step");
        return None;
    }
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(work());
        });
    if let Err(err) = spawned {
        warn!(target: "teleop::session", step = name, error = %err, "unable to start teardown thread");
        return None;
    }
    match rx.recv_timeout(budget) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                target: "teleop::session",
                step = name,
                budget_ms = budget.as_millis() as u64,
                "teardown step overran its budget"
            );
            None
        }
    }
}

/// Drive a future to completion on a private current-thread runtime.
pub fn block_on_private<F>(future: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime.block_on(future)),
        Err(err) => {
            warn!(target: "teleop::session", error = %err, "unable to build teardown runtime");
            None
        }
    }
}
