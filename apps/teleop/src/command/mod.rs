//! Bounded-rate command relay into the session's command slot.
//!
//! [`CommandChannel::open`] signs in to the data store and writes the
//! connected status; [`CommandChannel::start`] spawns the tick loop that
//! samples input, evaluates the deadman latch and overwrites
//! `sessions/{code}/robot_commands/latest`. Publishes run concurrently with
//! the loop so a slow write never delays the next tick; a result that
//! resolves after a newer one is discarded.

pub mod deadman;
pub mod health;
pub mod record;

pub use deadman::{DeadmanLatch, LatchTransition, StopCauses};
pub use health::{ConnectionHealth, HealthSnapshot, PublishOutcome};
pub use record::{CommandMeta, DISCONNECT_SOURCE, OPERATOR_SOURCE};

use crate::auth::SessionCredentials;
use crate::clock::Clock;
use crate::config::{CommandConfig, TeleopConfig};
use crate::events::EventStream;
use crate::input::{AxisThresholds, InputMethod, InputRouter, map_input};
use crate::metrics;
use crate::store::{DataStore, StoreConnector, StoreError, encode};
use authority_proto::{
    CONNECTION_PROBE_PATH, CommandRecord, ConnectionProbe, command_slot_path,
    connection_status_path,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("data store sign-in failed: {0}")]
    Connect(StoreError),
    #[error("initial status write failed: {0}")]
    StatusWrite(StoreError),
    #[error("command channel already open")]
    AlreadyOpen,
    #[error("command channel is not open")]
    NotOpen,
}

/// Which of the three close writes went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    pub stop_written: bool,
    pub status_written: bool,
    pub slot_cleared: bool,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.stop_written && self.status_written && self.slot_cleared
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Opened {
        session_code: String,
        operator_id: String,
    },
    Started,
    InputMethodChanged {
        method: InputMethod,
    },
    EmergencyStop {
        engaged: bool,
        causes: StopCauses,
    },
    PublishFailed {
        seq: u64,
        consecutive_failures: u32,
        error: StoreError,
    },
    Halted,
    Closed {
        report: CloseReport,
    },
}

struct LinkState {
    can_send: AtomicBool,
    session_active: AtomicBool,
    stop_engaged: AtomicBool,
    seq: AtomicU64,
    health: Mutex<ConnectionHealth>,
    method: Mutex<Option<InputMethod>>,
    /// Outcome of the stop record written on halt, `None` until attempted.
    stop_flushed: Mutex<Option<bool>>,
}

struct Link {
    store: Arc<dyn DataStore>,
    meta: CommandMeta,
    state: Arc<LinkState>,
    ticker: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

pub struct CommandChannel {
    config: CommandConfig,
    thresholds: AxisThresholds,
    haptic: Option<(f32, Duration)>,
    probe_timeout: Duration,
    connector: Arc<dyn StoreConnector>,
    router: Arc<InputRouter>,
    clock: Clock,
    link: Mutex<Option<Link>>,
    events: EventStream<CommandEvent>,
}

impl CommandChannel {
    pub fn new(
        config: &TeleopConfig,
        connector: Arc<dyn StoreConnector>,
        router: Arc<InputRouter>,
        clock: Clock,
    ) -> Self {
        let haptic = config
            .input
            .haptics
            .then_some((config.input.haptic_intensity, config.input.haptic_duration));
        Self {
            config: config.command.clone(),
            thresholds: AxisThresholds::from(&config.input),
            haptic,
            probe_timeout: config.store.probe_timeout,
            connector,
            router,
            clock,
            link: Mutex::new(None),
            events: EventStream::new(config.session.event_capacity),
        }
    }

    pub fn events(&self) -> &EventStream<CommandEvent> {
        &self.events
    }

    /// Sign in, write the connected status and reset the sequence to zero.
    pub async fn open(&self, credentials: &SessionCredentials) -> Result<(), CommandError> {
        if self.link.lock().is_some() {
            return Err(CommandError::AlreadyOpen);
        }
        let session_code = credentials.session_code().to_string();

        let session = self
            .connector
            .connect(&credentials.data_store)
            .await
            .map_err(CommandError::Connect)?;
        let meta = CommandMeta {
            session_code: session_code.clone(),
            robot_id: credentials.robot_id().to_string(),
            operator_id: session.operator_id.clone(),
            platform: self.config.platform.clone(),
        };

        let status = meta.connected(self.clock.now_ms());
        write_record(
            session.store.as_ref(),
            &connection_status_path(&session_code),
            &status,
            self.config.write_timeout,
        )
        .await
        .map_err(CommandError::StatusWrite)?;
        let mut health = ConnectionHealth::new(Instant::now());
        health.mark_success(Instant::now());
        info!(
            target: "teleop::command",
            session_code = %session_code,
            operator = %meta.operator_id,
            "connected status written"
        );

        let probe = ConnectionProbe {
            timestamp: self.clock.now_ms(),
            platform: self.config.platform.clone(),
            test: record::PROBE_TAG.to_string(),
        };
        match write_record(
            session.store.as_ref(),
            CONNECTION_PROBE_PATH,
            &probe,
            self.probe_timeout,
        )
        .await
        {
            Ok(()) => {
                health.mark_success(Instant::now());
                debug!(target: "teleop::command", "connection probe written");
            }
            Err(err) => {
                warn!(target: "teleop::command", error = %err, "connection probe failed");
            }
        }

        let state = Arc::new(LinkState {
            can_send: AtomicBool::new(false),
            session_active: AtomicBool::new(false),
            stop_engaged: AtomicBool::new(true),
            seq: AtomicU64::new(0),
            health: Mutex::new(health),
            method: Mutex::new(None),
            stop_flushed: Mutex::new(None),
        });
        let operator_id = meta.operator_id.clone();
        {
            let mut slot = self.link.lock();
            if slot.is_some() {
                return Err(CommandError::AlreadyOpen);
            }
            *slot = Some(Link {
                store: session.store,
                meta,
                state,
                ticker: None,
            });
        }
        self.events.emit(CommandEvent::Opened {
            session_code,
            operator_id,
        });
        Ok(())
    }

    /// Start ticking. Calling it again while the loop runs does nothing.
    pub fn start(&self) -> Result<(), CommandError> {
        let mut guard = self.link.lock();
        let link = guard.as_mut().ok_or(CommandError::NotOpen)?;
        if link.ticker.is_some() {
            return Ok(());
        }
        link.state.can_send.store(true, Ordering::SeqCst);
        *link.state.stop_flushed.lock() = None;

        let (halt_tx, halt_rx) = watch::channel(false);
        let tick_loop = TickLoop {
            store: link.store.clone(),
            slot: command_slot_path(&link.meta.session_code),
            meta: link.meta.clone(),
            state: link.state.clone(),
            router: self.router.clone(),
            thresholds: self.thresholds,
            config: self.config.clone(),
            haptic: self.haptic,
            clock: self.clock,
            events: self.events.clone(),
            latch: DeadmanLatch::new(self.config.stop_hold),
        };
        let handle = tokio::spawn(tick_loop.run(halt_rx));
        link.ticker = Some((halt_tx, handle));
        self.events.emit(CommandEvent::Started);
        Ok(())
    }

    /// Orchestrator state feed for the deadman.
    pub fn set_session_active(&self, active: bool) {
        if let Some(link) = self.link.lock().as_ref() {
            link.state.session_active.store(active, Ordering::SeqCst);
        }
    }

    /// Stop the tick loop, drop in-flight publishes and overwrite the command
    /// slot with the emergency-stop record. The link stays open.
    pub async fn halt(&self) {
        let (ticker, flush) = {
            let mut guard = self.link.lock();
            let Some(link) = guard.as_mut() else {
                return;
            };
            link.state.can_send.store(false, Ordering::SeqCst);
            let flush = {
                let mut flushed = link.state.stop_flushed.lock();
                flushed.is_none().then(|| {
                    *flushed = Some(false);
                    (link.store.clone(), link.meta.clone(), link.state.clone())
                })
            };
            (link.ticker.take(), flush)
        };
        if let Some((halt, handle)) = ticker {
            let _ = halt.send(true);
            if let Err(err) = handle.await {
                warn!(target: "teleop::command", error = %err, "tick loop ended abnormally");
            }
            self.events.emit(CommandEvent::Halted);
        }
        let Some((store, meta, state)) = flush else {
            return;
        };
        self.engage_stop(&state);

        let seq = state.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let method = state.method.lock().unwrap_or(InputMethod::Keyboard);
        let stop = meta.final_stop(seq, self.clock.now_ms(), method);
        let written = best_effort(
            "final emergency stop",
            write_record(
                store.as_ref(),
                &command_slot_path(&meta.session_code),
                &stop,
                self.config.write_timeout,
            ),
        )
        .await;
        *state.stop_flushed.lock() = Some(written);
    }

    /// Stop the tick loop without waiting for it, for callers that cannot
    /// await. The stop record is left to [`CommandChannel::halt`].
    pub fn abort(&self) {
        let mut guard = self.link.lock();
        if let Some(link) = guard.as_mut() {
            link.state.can_send.store(false, Ordering::SeqCst);
            if let Some((halt, handle)) = link.ticker.take() {
                let _ = halt.send(true);
                handle.abort();
            }
            self.engage_stop(&link.state);
        }
    }

    /// Latch the stop once sending has ended. Emits the transition only when
    /// no tick had engaged it already.
    fn engage_stop(&self, state: &LinkState) {
        if state.stop_engaged.swap(true, Ordering::SeqCst) {
            return;
        }
        let causes = StopCauses {
            cannot_send: true,
            not_active: !state.session_active.load(Ordering::SeqCst),
            ..StopCauses::default()
        };
        metrics::EMERGENCY_STOP_TRANSITIONS
            .with_label_values(&["engaged"])
            .inc();
        warn!(
            target: "teleop::command",
            causes = %causes.describe(),
            "emergency stop engaged"
        );
        if let Some((intensity, duration)) = self.haptic {
            self.router.haptic_pulse(intensity, duration);
        }
        self.events.emit(CommandEvent::EmergencyStop {
            engaged: true,
            causes,
        });
    }

    /// Halt (which writes the final stop record if it has not gone out yet),
    /// then the disconnected status and slot removal. Every write is
    /// best-effort and bounded. `None` when nothing was open.
    pub async fn close(&self, reason: &str) -> Option<CloseReport> {
        self.halt().await;
        let link = self.link.lock().take()?;

        let limit = self.config.write_timeout;
        let code = link.meta.session_code.as_str();
        let slot = command_slot_path(code);
        let mut report = CloseReport {
            stop_written: link.state.stop_flushed.lock().unwrap_or(false),
            ..CloseReport::default()
        };

        let status = link.meta.disconnected(self.clock.now_ms(), reason);
        report.status_written = best_effort(
            "disconnected status",
            write_record(
                link.store.as_ref(),
                &connection_status_path(code),
                &status,
                limit,
            ),
        )
        .await;

        report.slot_cleared = best_effort(
            "command slot clear",
            bounded(limit, link.store.remove(&slot)),
        )
        .await;

        info!(
            target: "teleop::command",
            session_code = %code,
            final_seq = link.state.seq.load(Ordering::SeqCst),
            clean = report.is_clean(),
            "command channel closed"
        );
        self.events.emit(CommandEvent::Closed { report });
        Some(report)
    }

    pub fn is_open(&self) -> bool {
        self.link.lock().is_some()
    }

    pub fn is_sending(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.ticker.is_some() && link.state.can_send.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Last sequence number handed out, zero when closed.
    pub fn sequence(&self) -> u64 {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.state.seq.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// A closed channel reports the stop as engaged.
    pub fn emergency_stop_engaged(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.state.stop_engaged.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    pub fn health(&self) -> Option<HealthSnapshot> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.state.health.lock().snapshot(Instant::now()))
    }

    pub fn operator_id(&self) -> Option<String> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.meta.operator_id.clone())
    }
}

struct TickLoop {
    store: Arc<dyn DataStore>,
    slot: String,
    meta: CommandMeta,
    state: Arc<LinkState>,
    router: Arc<InputRouter>,
    thresholds: AxisThresholds,
    config: CommandConfig,
    haptic: Option<(f32, Duration)>,
    clock: Clock,
    events: EventStream<CommandEvent>,
    latch: DeadmanLatch,
}

type Published = (u64, String, Result<(), StoreError>);

impl TickLoop {
    async fn run(mut self, mut halt: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight: JoinSet<Published> = JoinSet::new();
        info!(
            target: "teleop::command",
            session_code = %self.meta.session_code,
            rate_hz = self.config.rate_hz,
            "command loop started"
        );

        loop {
            tokio::select! {
                biased;
                changed = halt.changed() => {
                    if changed.is_err() || *halt.borrow() {
                        break;
                    }
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Ok((seq, summary, result)) = joined {
                        self.absorb(seq, &summary, result);
                    }
                }
                _ = ticker.tick() => {
                    if !self.state.can_send.load(Ordering::SeqCst) {
                        break;
                    }
                    let command = self.next_record();
                    let store = self.store.clone();
                    let slot = self.slot.clone();
                    let limit = self.config.write_timeout;
                    // Writes may land out of order; the next tick overwrites the slot.
                    inflight.spawn(async move {
                        let summary = record::movement_summary(&command);
                        let result = write_record(store.as_ref(), &slot, &command, limit).await;
                        (command.seq, summary, result)
                    });
                }
            }
        }

        inflight.abort_all();
        info!(
            target: "teleop::command",
            session_code = %self.meta.session_code,
            last_seq = self.state.seq.load(Ordering::SeqCst),
            "command loop stopped"
        );
    }

    fn next_record(&mut self) -> CommandRecord {
        let now = Instant::now();
        let (method, raw) = self.router.sample();
        self.note_method(method);
        let directions = map_input(&raw, &self.thresholds);

        let silence = self.state.health.lock().silence(now);
        let causes = StopCauses {
            input: directions.stop,
            cannot_send: !self.state.can_send.load(Ordering::SeqCst),
            not_active: !self.state.session_active.load(Ordering::SeqCst),
            connection_timeout: silence > self.config.connection_timeout,
        };
        match self.latch.update(causes, now) {
            Some(LatchTransition::Engaged) => {
                metrics::EMERGENCY_STOP_TRANSITIONS
                    .with_label_values(&["engaged"])
                    .inc();
                warn!(
                    target: "teleop::command",
                    causes = %causes.describe(),
                    silence_ms = silence.as_millis() as u64,
                    "emergency stop engaged"
                );
                if let Some((intensity, duration)) = self.haptic {
                    self.router.haptic_pulse(intensity, duration);
                }
                self.events.emit(CommandEvent::EmergencyStop {
                    engaged: true,
                    causes,
                });
            }
            Some(LatchTransition::Released) => {
                metrics::EMERGENCY_STOP_TRANSITIONS
                    .with_label_values(&["released"])
                    .inc();
                info!(target: "teleop::command", "emergency stop released");
                self.events.emit(CommandEvent::EmergencyStop {
                    engaged: false,
                    causes,
                });
            }
            None => {}
        }
        let engaged = self.latch.is_engaged();
        self.state.stop_engaged.store(engaged, Ordering::SeqCst);

        let seq = self.state.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.meta
            .command(seq, self.clock.now_ms(), &directions, engaged, method)
    }

    fn note_method(&self, method: InputMethod) {
        let mut current = self.state.method.lock();
        if *current != Some(method) {
            if current.is_some() {
                info!(target: "teleop::command", method = method.as_str(), "input method changed");
            }
            *current = Some(method);
            self.events.emit(CommandEvent::InputMethodChanged { method });
        }
    }

    fn absorb(&self, seq: u64, summary: &str, result: Result<(), StoreError>) {
        let outcome = self
            .state
            .health
            .lock()
            .record(seq, result.is_ok(), Instant::now());
        match (outcome, result) {
            (PublishOutcome::Stale, _) => {
                metrics::COMMANDS_PUBLISHED
                    .with_label_values(&["stale"])
                    .inc();
                trace!(target: "teleop::command", seq, "discarding stale publish result");
            }
            (PublishOutcome::Applied, Ok(())) => {
                metrics::COMMANDS_PUBLISHED.with_label_values(&["ok"]).inc();
                if !summary.is_empty() {
                    debug!(target: "teleop::command", seq, movements = %summary, "command sent");
                }
            }
            (PublishOutcome::Applied, Err(error)) => {
                metrics::COMMANDS_PUBLISHED
                    .with_label_values(&["failed"])
                    .inc();
                let consecutive_failures = self.state.health.lock().consecutive_failures();
                warn!(
                    target: "teleop::command",
                    seq,
                    consecutive_failures,
                    error = %error,
                    "command publish failed"
                );
                self.events.emit(CommandEvent::PublishFailed {
                    seq,
                    consecutive_failures,
                    error,
                });
            }
        }
    }
}

async fn bounded<F>(limit: Duration, write: F) -> Result<(), StoreError>
where
    F: Future<Output = Result<(), StoreError>>,
{
    match tokio::time::timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

async fn write_record<T: Serialize>(
    store: &dyn DataStore,
    path: &str,
    record: &T,
    limit: Duration,
) -> Result<(), StoreError> {
    let value = encode(record)?;
    bounded(limit, store.set(path, value)).await
}

async fn best_effort<F>(what: &'static str, write: F) -> bool
where
    F: Future<Output = Result<(), StoreError>>,
{
    match write.await {
        Ok(()) => {
            debug!(target: "teleop::command", what, "teardown write done");
            true
        }
        Err(err) => {
            warn!(target: "teleop::command", what, error = %err, "teardown write failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::fixtures;
    use crate::events::drain;
    use crate::input::{AnalogInput, HandSample, Key, KeyboardInput, SelectionPolicy};
    use crate::store::{MemoryConnector, MemoryStore};
    use authority_proto::{ConnectionStatus, ConnectionStatusRecord};

    const SLOT: &str = "sessions/ABC123/robot_commands/latest";
    const STATUS: &str = "sessions/ABC123/connection_status";

    fn channel_with(store: Arc<MemoryStore>, router: InputRouter) -> CommandChannel {
        CommandChannel::new(
            &TeleopConfig::default(),
            Arc::new(MemoryConnector::new(store)),
            Arc::new(router),
            Clock::starting_at(1_000),
        )
    }

    fn keyboard_channel(store: Arc<MemoryStore>) -> (CommandChannel, Arc<KeyboardInput>) {
        let keyboard = Arc::new(KeyboardInput::default());
        let channel = channel_with(store, InputRouter::keyboard_only(keyboard.clone()));
        (channel, keyboard)
    }

    fn published(store: &MemoryStore) -> Vec<CommandRecord> {
        store
            .writes_to(SLOT)
            .into_iter()
            .filter_map(|write| write.value)
            .map(|value| serde_json::from_value(value).unwrap())
            .collect()
    }

    async fn open_and_start(channel: &CommandChannel) {
        channel
            .open(&fixtures::credentials("ABC123", u64::MAX))
            .await
            .unwrap();
        channel.set_session_active(true);
        channel.start().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn open_writes_status_and_probe() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        channel
            .open(&fixtures::credentials("ABC123", u64::MAX))
            .await
            .unwrap();

        let status: ConnectionStatusRecord =
            serde_json::from_value(store.get(STATUS).unwrap()).unwrap();
        assert_eq!(status.status, ConnectionStatus::Connected);
        assert!(status.operator_id.unwrap().starts_with("anon-"));
        assert_eq!(store.get(CONNECTION_PROBE_PATH).unwrap()["test"], "connection_check");
        assert_eq!(channel.sequence(), 0);
        assert!(!channel.is_sending());
        assert_eq!(
            channel
                .open(&fixtures::credentials("ABC123", u64::MAX))
                .await,
            Err(CommandError::AlreadyOpen)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_write_fails_open() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let (channel, _) = keyboard_channel(store);
        let result = channel
            .open(&fixtures::credentials("ABC123", u64::MAX))
            .await;
        assert!(matches!(result, Err(CommandError::StatusWrite(_))));
        assert!(!channel.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_publish_contiguous_sequence_numbers() {
        let store = MemoryStore::new();
        let (channel, keyboard) = keyboard_channel(store.clone());
        keyboard.press(Key::Forward);
        open_and_start(&channel).await;

        tokio::time::sleep(Duration::from_millis(950)).await;
        let records = published(&store);
        let seqs: Vec<u64> = records.iter().map(|record| record.seq).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        assert!(records.iter().all(|record| record.walk_forward));
        assert_eq!(records[0].source, OPERATOR_SOURCE);
        assert_eq!(records[0].input_method, "keyboard");
        assert_eq!(channel.health().unwrap().latest_acked_seq, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn close_writes_teardown_records_once() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let last_seq = channel.sequence();

        let report = channel.close("user_disconnect").await.unwrap();
        assert!(report.is_clean());

        let slot_writes = store.writes_to(SLOT);
        let stop: CommandRecord =
            serde_json::from_value(slot_writes[slot_writes.len() - 2].value.clone().unwrap())
                .unwrap();
        assert_eq!(stop.seq, last_seq + 1);
        assert!(stop.emergency_stop);
        assert_eq!(stop.source, DISCONNECT_SOURCE);
        assert_eq!(slot_writes.last().unwrap().value, None);
        assert_eq!(store.get(STATUS).unwrap()["status"], "disconnected");
        assert_eq!(store.get(STATUS).unwrap()["reason"], "user_disconnect");

        let writes = store.writes().len();
        assert_eq!(channel.close("user_disconnect").await, None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.writes().len(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn close_survives_hanging_store() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        store.set_hanging(true);

        let started = Instant::now();
        let report = channel.close("user_disconnect").await.unwrap();
        assert_eq!(report, CloseReport::default());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert!(!channel.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn late_publishes_never_land_after_close() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        store.set_latency(Some(Duration::from_secs(3)));
        tokio::time::sleep(Duration::from_millis(500)).await;

        channel.close("user_disconnect").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let slot_writes = store.writes_to(SLOT);
        assert_eq!(slot_writes.last().unwrap().value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_restarts_at_zero_on_reopen() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(450)).await;
        channel.close("user_disconnect").await.unwrap();

        open_and_start(&channel).await;
        assert!(channel.sequence() <= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let last = published(&store).pop().unwrap();
        assert_eq!(last.seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_session_forces_stop_until_hold_passes() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        channel
            .open(&fixtures::credentials("ABC123", u64::MAX))
            .await
            .unwrap();
        channel.start().unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(published(&store).iter().all(|record| record.emergency_stop));

        channel.set_session_active(true);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(channel.emergency_stop_engaged());
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!channel.emergency_stop_engaged());
        assert!(!published(&store).last().unwrap().emergency_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_silence_engages_deadman() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!channel.emergency_stop_engaged());

        let mut events = channel.events().subscribe();
        store.set_failing(true);
        tokio::time::sleep(Duration::from_millis(9_800)).await;
        assert!(!channel.emergency_stop_engaged());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(channel.emergency_stop_engaged());
        assert!(channel.health().unwrap().consecutive_failures > 90);
        let engaged: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, CommandEvent::EmergencyStop { engaged: true, causes } if causes.connection_timeout))
            .collect();
        assert_eq!(engaged.len(), 1);

        store.set_failing(false);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!channel.emergency_stop_engaged());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_input_pulses_haptics_once_per_engagement() {
        let store = MemoryStore::new();
        let analog = Arc::new(AnalogInput::default());
        analog.set_present(true);
        let router = InputRouter::new(
            Arc::new(KeyboardInput::default()),
            Some(analog.clone()),
            SelectionPolicy::default(),
        );
        let channel = channel_with(store.clone(), router);
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let baseline = analog.pulses().len();

        analog.update(
            Some(HandSample {
                grip: 0.95,
                ..HandSample::default()
            }),
            None,
        );
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(channel.emergency_stop_engaged());
        assert_eq!(analog.pulses().len(), baseline + 1);
        assert_eq!(published(&store).last().unwrap().input_method, "controllers");
    }

    #[tokio::test(start_paused = true)]
    async fn halt_latches_stop_and_overwrites_slot() {
        let store = MemoryStore::new();
        let (channel, keyboard) = keyboard_channel(store.clone());
        keyboard.press(Key::Forward);
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!channel.emergency_stop_engaged());
        assert!(published(&store).last().unwrap().walk_forward);

        let mut events = channel.events().subscribe();
        channel.halt().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!channel.is_sending());
        assert!(channel.emergency_stop_engaged());
        let last = published(&store).pop().unwrap();
        assert!(last.emergency_stop);
        assert!(!last.walk_forward);
        assert_eq!(last.source, DISCONNECT_SOURCE);
        assert_eq!(last.seq, channel.sequence());

        let engaged: Vec<StopCauses> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                CommandEvent::EmergencyStop {
                    engaged: true,
                    causes,
                } => Some(causes),
                _ => None,
            })
            .collect();
        assert_eq!(engaged.len(), 1);
        assert!(engaged[0].cannot_send);

        let stops = published(&store).len();
        let report = channel.close("user_disconnect").await.unwrap();
        assert!(report.is_clean());
        assert_eq!(published(&store).len(), stops);
        assert!(drain(&mut events).iter().all(|event| !matches!(
            event,
            CommandEvent::EmergencyStop { engaged: true, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_latches_stop_without_waiting() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!channel.emergency_stop_engaged());

        channel.abort();
        assert!(channel.emergency_stop_engaged());
        assert!(!channel.is_sending());
        let report = channel.close("shutdown").await.unwrap();
        assert!(report.stop_written);
        assert!(published(&store).last().unwrap().emergency_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn halt_stops_publishing_but_keeps_link() {
        let store = MemoryStore::new();
        let (channel, _) = keyboard_channel(store.clone());
        open_and_start(&channel).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        channel.halt().await;
        let count = published(&store).len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(published(&store).len(), count);
        assert!(channel.is_open());
        assert!(!channel.is_sending());
        assert_eq!(channel.start(), Ok(()));
    }
}
