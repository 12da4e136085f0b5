//! Top-level session state machine.
//!
//! [`SessionOrchestrator`] is the single writer of [`SessionState`]. Connect
//! exchanges the pairing code, then opens the command channel and joins video
//! concurrently. Disconnect runs a fixed order: halt input and write the stop
//! record, leave video, close the command channel, revoke with the authority,
//! clear credentials. A second connect or disconnect while either is in flight is rejected with
//! [`SessionError::Busy`]; a disconnect during a connect cancels it first.

pub mod shutdown;

use crate::auth::{BrokerError, CredentialBroker, RevokeOutcome, SessionCredentials};
use crate::command::{CloseReport, CommandChannel, CommandError, CommandEvent, StopCauses};
use crate::config::{SessionConfig, TeleopConfig};
use crate::events::EventStream;
use crate::input::InputMethod;
use crate::metrics;
use crate::video::{LeaveOutcome, VideoChannel, VideoError, VideoEvent};
use parking_lot::Mutex;
use serde::Serialize;
use shutdown::{Deadline, block_on_private, run_bounded};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedMutexGuard, broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    User,
    Expired,
    ConnectFailed,
    Shutdown,
}

impl DisconnectReason {
    /// Value written to `connection_status.reason`.
    pub fn status_reason(self) -> &'static str {
        match self {
            DisconnectReason::User => "user_disconnect",
            DisconnectReason::Expired => "session_expired",
            DisconnectReason::ConnectFailed => "connect_failed",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectSummary {
    pub reason: DisconnectReason,
    pub video: LeaveOutcome,
    /// `None` when the command channel was never opened.
    pub command: Option<CloseReport>,
    pub revoke: RevokeOutcome,
    /// Advisory wait before reusing the code after an unverified revoke.
    pub caution: Option<Duration>,
}

impl DisconnectSummary {
    pub fn is_verified(&self) -> bool {
        self.revoke.is_verified()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        previous: SessionState,
        current: SessionState,
    },
    AuthSuccess {
        session_code: String,
        robot_id: String,
        expires_at_ms: u64,
    },
    AuthFailed {
        error: BrokerError,
        message: String,
    },
    ConnectFailed {
        message: String,
    },
    VideoJoinFailed {
        message: String,
    },
    EmergencyStop {
        engaged: bool,
        causes: StopCauses,
    },
    CommandPublishFailed {
        seq: u64,
        consecutive_failures: u32,
        message: String,
    },
    InputMethodChanged {
        method: InputMethod,
    },
    Video(VideoEvent),
    SessionExpired {
        session_code: String,
    },
    DisconnectComplete {
        summary: DisconnectSummary,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] BrokerError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Video(#[from] VideoError),
    #[error("another connect or disconnect is in progress")]
    Busy,
    #[error("a session is already active")]
    AlreadyActive,
    #[error("connect cancelled by disconnect")]
    Cancelled,
    #[error("no active session")]
    NotActive,
}

impl SessionError {
    /// Short text for the operator.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Auth(err) => err.user_message(),
            SessionError::Command(err) => format!("Connection failed: {err}"),
            SessionError::Video(err) => format!("Video unavailable: {err}"),
            other => other.to_string(),
        }
    }
}

struct Inner {
    config: SessionConfig,
    broker: Arc<CredentialBroker>,
    command: Arc<CommandChannel>,
    video: Arc<VideoChannel>,
    state: Mutex<SessionState>,
    connect_guard: Arc<tokio::sync::Mutex<()>>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    events: EventStream<SessionEvent>,
    relay: Mutex<Option<JoinHandle<()>>>,
    expiry: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.relay.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.expiry.lock().take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    pub fn new(
        config: &TeleopConfig,
        broker: Arc<CredentialBroker>,
        command: Arc<CommandChannel>,
        video: Arc<VideoChannel>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.session.clone(),
                broker,
                command,
                video,
                state: Mutex::new(SessionState::Idle),
                connect_guard: Arc::new(tokio::sync::Mutex::new(())),
                cancel: Mutex::new(None),
                events: EventStream::new(config.session.event_capacity),
                relay: Mutex::new(None),
                expiry: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventStream<SessionEvent> {
        &self.inner.events
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.inner.broker
    }

    pub fn command(&self) -> &Arc<CommandChannel> {
        &self.inner.command
    }

    pub fn video(&self) -> &Arc<VideoChannel> {
        &self.inner.video
    }

    /// Exchange `code` and bring both channels up. Resolves once the session
    /// is Active; video streaming continues to come up in the background.
    pub async fn connect(&self, code: &str) -> Result<Arc<SessionCredentials>, SessionError> {
        let (_guard, mut cancelled) = self.enter_connecting()?;
        self.announce(SessionState::Idle, SessionState::Connecting);
        self.ensure_relay();

        let result = self.run_connect(code, &mut cancelled).await;
        self.inner.cancel.lock().take();
        if let Err(err) = &result {
            debug!(target: "teleop::session", error = %err, "connect did not complete");
        }
        result
    }

    fn enter_connecting(
        &self,
    ) -> Result<(OwnedMutexGuard<()>, watch::Receiver<bool>), SessionError> {
        let mut state = self.inner.state.lock();
        match *state {
            SessionState::Idle => {}
            SessionState::Active => return Err(SessionError::AlreadyActive),
            SessionState::Connecting | SessionState::Disconnecting => {
                return Err(SessionError::Busy);
            }
        }
        let guard = self
            .inner
            .connect_guard
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::Busy)?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.inner.cancel.lock() = Some(cancel_tx);
        *state = SessionState::Connecting;
        Ok((guard, cancel_rx))
    }

    async fn run_connect(
        &self,
        code: &str,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<Arc<SessionCredentials>, SessionError> {
        let inner = &self.inner;

        let exchanged = tokio::select! {
            biased;
            _ = wait_cancelled(cancelled) => return Err(SessionError::Cancelled),
            result = inner.broker.exchange(code) => result,
        };
        let credentials = match exchanged {
            Ok(credentials) => credentials,
            Err(error) => {
                inner.events.emit(SessionEvent::AuthFailed {
                    message: error.user_message(),
                    error: error.clone(),
                });
                self.abandon_connect(false).await;
                return Err(error.into());
            }
        };
        inner.events.emit(SessionEvent::AuthSuccess {
            session_code: credentials.session_code().to_string(),
            robot_id: credentials.robot_id().to_string(),
            expires_at_ms: credentials.expires_at_ms(),
        });

        let (opened, joined) = tokio::select! {
            biased;
            _ = wait_cancelled(cancelled) => return Err(SessionError::Cancelled),
            pair = futures::future::join(
                inner.command.open(&credentials),
                inner.video.join(&credentials.video),
            ) => pair,
        };

        if let Err(err) = joined {
            warn!(target: "teleop::session", error = %err, "video join request failed; continuing without video");
            inner.events.emit(SessionEvent::VideoJoinFailed {
                message: err.to_string(),
            });
        }
        if let Err(err) = opened {
            warn!(target: "teleop::session", error = %err, "command channel failed to open");
            inner.events.emit(SessionEvent::ConnectFailed {
                message: err.to_string(),
            });
            self.abandon_connect(true).await;
            return Err(err.into());
        }

        {
            let mut state = inner.state.lock();
            if *state != SessionState::Connecting || *cancelled.borrow() {
                return Err(SessionError::Cancelled);
            }
            *state = SessionState::Active;
        }
        self.announce(SessionState::Connecting, SessionState::Active);
        inner.command.set_session_active(true);
        inner.command.start()?;
        metrics::SESSION_ACTIVE.set(1);
        self.spawn_expiry_watch();
        info!(
            target: "teleop::session",
            session_code = %credentials.session_code(),
            robot_id = %credentials.robot_id(),
            expires_in_secs = inner.broker.time_remaining().as_secs(),
            "session active"
        );
        Ok(credentials)
    }

    /// Return to Idle after a failed connect, unless a disconnect already
    /// owns the teardown.
    async fn abandon_connect(&self, teardown: bool) {
        let next = if teardown {
            SessionState::Disconnecting
        } else {
            SessionState::Idle
        };
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Connecting {
                return;
            }
            *state = next;
        }
        self.announce(SessionState::Connecting, next);
        if teardown {
            let summary = self.teardown(DisconnectReason::ConnectFailed).await;
            debug!(
                target: "teleop::session",
                verified = summary.is_verified(),
                "partial connect torn down"
            );
            self.set_state(SessionState::Idle);
        }
    }

    /// Orderly user disconnect.
    pub async fn disconnect(&self) -> Result<DisconnectSummary, SessionError> {
        self.disconnect_with(DisconnectReason::User).await
    }

    async fn disconnect_with(
        &self,
        reason: DisconnectReason,
    ) -> Result<DisconnectSummary, SessionError> {
        let inner = &self.inner;
        let previous = {
            let mut state = inner.state.lock();
            let previous = *state;
            match previous {
                SessionState::Disconnecting => return Err(SessionError::Busy),
                SessionState::Idle => None,
                SessionState::Connecting | SessionState::Active => {
                    *state = SessionState::Disconnecting;
                    Some(previous)
                }
            }
        };

        let Some(previous) = previous else {
            let summary = self.idle_summary(reason);
            inner.events.emit(SessionEvent::DisconnectComplete {
                summary: summary.clone(),
            });
            return Ok(summary);
        };
        self.announce(previous, SessionState::Disconnecting);

        if previous == SessionState::Connecting {
            info!(target: "teleop::session", "cancelling connect in progress");
            if let Some(cancel) = inner.cancel.lock().take() {
                let _ = cancel.send(true);
            }
        }
        if previous == SessionState::Active {
            inner.command.set_session_active(false);
            inner.command.halt().await;
        }
        // Wait out a connect or video restart still holding the guard.
        drop(inner.connect_guard.lock().await);

        let summary = self.teardown(reason).await;
        self.set_state(SessionState::Idle);
        inner.events.emit(SessionEvent::DisconnectComplete {
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Steps 1 through 5 of the disconnect order. Each step has its own bound.
    async fn teardown(&self, reason: DisconnectReason) -> DisconnectSummary {
        let inner = &self.inner;
        self.stop_expiry_watch();
        metrics::SESSION_ACTIVE.set(0);
        info!(target: "teleop::session", reason = reason.status_reason(), "disconnect sequence start");

        // The stop record lands before anything that can stall.
        inner.command.set_session_active(false);
        inner.command.halt().await;

        let video = inner.video.leave().await;
        debug!(target: "teleop::session", outcome = ?video, "video left");

        let command = inner.command.close(reason.status_reason()).await;

        let revoke = inner.broker.revoke().await;

        inner.broker.clear();
        let caution = inner.broker.reconnect_caution();

        match &revoke {
            RevokeOutcome::Verified { .. } => {
                info!(target: "teleop::session", "disconnect sequence complete");
            }
            RevokeOutcome::Unverified { reason } => {
                warn!(
                    target: "teleop::session",
                    reason = %reason,
                    caution_secs = caution.map(|wait| wait.as_secs()).unwrap_or(0),
                    "disconnect complete but not verified"
                );
            }
        }
        DisconnectSummary {
            reason,
            video,
            command,
            revoke,
            caution,
        }
    }

    /// Leave and rejoin video, the only way out of its failed state. Holds
    /// the connect guard; a disconnect waits for it before tearing down.
    pub async fn restart_video(&self) -> Result<(), SessionError> {
        let _guard = self
            .inner
            .connect_guard
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::Busy)?;
        if self.state() != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let credentials = self
            .inner
            .broker
            .current()
            .ok_or(SessionError::NotActive)?;
        let left = self.inner.video.leave().await;
        debug!(target: "teleop::session", outcome = ?left, "video left for restart");
        if self.state() != SessionState::Active {
            info!(target: "teleop::session", "session ending; video restart abandoned");
            return Err(SessionError::Cancelled);
        }
        self.inner.video.join(&credentials.video).await?;
        Ok(())
    }

    /// Blocking teardown for process exit, capped at the configured
    /// shutdown budget. Returns `None` when there was nothing to tear down.
    pub fn shutdown_blocking(&self) -> Option<DisconnectSummary> {
        let inner = &self.inner;
        let deadline = Deadline::after(inner.config.shutdown_timeout);
        let previous = {
            let mut state = inner.state.lock();
            let previous = *state;
            if previous == SessionState::Idle && !inner.broker.credentials_loaded() {
                return None;
            }
            *state = SessionState::Disconnecting;
            previous
        };
        self.announce(previous, SessionState::Disconnecting);
        warn!(
            target: "teleop::session",
            budget_secs = inner.config.shutdown_timeout.as_secs(),
            "running blocking shutdown"
        );

        if let Some(cancel) = inner.cancel.lock().take() {
            let _ = cancel.send(true);
        }
        self.stop_expiry_watch();
        metrics::SESSION_ACTIVE.set(0);
        inner.command.set_session_active(false);
        inner.command.abort();
        let stopper = inner.command.clone();
        let stopped = run_bounded("teleop-stop", deadline.remaining(), move || {
            block_on_private(async move { stopper.halt().await }).is_some()
        })
        .unwrap_or(false);
        debug!(target: "teleop::session", stopped, "stop record flushed");

        let video = inner.video.leave_blocking(deadline.remaining());

        let command_channel = inner.command.clone();
        let reason = DisconnectReason::Shutdown;
        let command = run_bounded("teleop-close", deadline.remaining(), move || {
            block_on_private(command_channel.close(reason.status_reason())).flatten()
        })
        .flatten();

        let revoke = inner.broker.revoke_blocking(deadline.remaining());
        inner.broker.clear();
        let caution = inner.broker.reconnect_caution();

        self.set_state(SessionState::Idle);
        let summary = DisconnectSummary {
            reason,
            video,
            command,
            revoke,
            caution,
        };
        inner.events.emit(SessionEvent::DisconnectComplete {
            summary: summary.clone(),
        });
        Some(summary)
    }

    fn idle_summary(&self, reason: DisconnectReason) -> DisconnectSummary {
        DisconnectSummary {
            reason,
            video: LeaveOutcome::NotJoined,
            command: None,
            revoke: RevokeOutcome::Verified { warning: None },
            caution: self.inner.broker.reconnect_caution(),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), next);
        self.announce(previous, next);
    }

    fn announce(&self, previous: SessionState, current: SessionState) {
        if previous == current {
            return;
        }
        info!(
            target: "teleop::session",
            from = previous.as_str(),
            to = current.as_str(),
            "session state changed"
        );
        self.inner
            .events
            .emit(SessionEvent::StateChanged { previous, current });
    }

    fn spawn_expiry_watch(&self) {
        let this = self.clone();
        let period = self.inner.config.expiry_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.state() != SessionState::Active {
                    break;
                }
                if !this.inner.broker.is_expired() {
                    continue;
                }
                let session_code = this
                    .inner
                    .broker
                    .current()
                    .map(|credentials| credentials.session_code().to_string())
                    .unwrap_or_default();
                warn!(target: "teleop::session", session_code = %session_code, "session expired");
                this.inner
                    .events
                    .emit(SessionEvent::SessionExpired { session_code });
                // The teardown aborts this watcher, so it runs on its own task.
                let orchestrator = this.clone();
                tokio::spawn(async move {
                    if let Err(err) = orchestrator.disconnect_with(DisconnectReason::Expired).await {
                        debug!(target: "teleop::session", error = %err, "expiry disconnect skipped");
                    }
                });
                break;
            }
        });
        if let Some(previous) = self.inner.expiry.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_expiry_watch(&self) {
        if let Some(handle) = self.inner.expiry.lock().take() {
            handle.abort();
        }
    }

    /// Forward command and video events into the session stream.
    fn ensure_relay(&self) {
        let mut relay = self.inner.relay.lock();
        if relay.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let mut commands = self.inner.command.events().subscribe();
        let mut video = self.inner.video.events().subscribe();
        let events = self.inner.events.clone();
        *relay = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = commands.recv() => match received {
                        Ok(event) => {
                            if let Some(event) = relay_command(event) {
                                events.emit(event);
                            }
                        }
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                    received = video.recv() => match received {
                        Ok(event) => events.emit(SessionEvent::Video(event)),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));
    }
}

fn relay_command(event: CommandEvent) -> Option<SessionEvent> {
    match event {
        CommandEvent::EmergencyStop { engaged, causes } => {
            Some(SessionEvent::EmergencyStop { engaged, causes })
        }
        CommandEvent::PublishFailed {
            seq,
            consecutive_failures,
            error,
        } => Some(SessionEvent::CommandPublishFailed {
            seq,
            consecutive_failures,
            message: error.to_string(),
        }),
        CommandEvent::InputMethodChanged { method } => {
            Some(SessionEvent::InputMethodChanged { method })
        }
        _ => None,
    }
}

async fn wait_cancelled(cancelled: &mut watch::Receiver<bool>) {
    loop {
        if *cancelled.borrow_and_update() {
            return;
        }
        if cancelled.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
