//! Viewer-only video channel with a frame watchdog and bounded rejoin.

pub mod engine;
pub mod fps;
pub mod loopback;
pub mod state;

pub use engine::{
    EncoderProfile, EngineEvent, JoinRequest, PeerLeaveReason, VIEWER_PROFILE, VideoEngine,
};
pub use fps::{FrameRateMeter, FrameRateSample, StreamQuality};
pub use loopback::{LoopbackEngine, LoopbackScript};
pub use state::VideoState;

use crate::config::VideoConfig;
use crate::events::EventStream;
use crate::metrics;
use authority_proto::VideoCredentials;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VideoError {
    #[error("video engine initialization failed: {0}")]
    Init(String),
    #[error("join request rejected: {0}")]
    JoinRejected(String),
    #[error("leave request failed: {0}")]
    Leave(String),
    #[error("cannot join while {0}")]
    InvalidState(VideoState),
    #[error("video credentials missing {0}")]
    InvalidCredentials(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VideoWarning {
    Frozen,
    PoorNetwork { rx_quality: u8 },
    LowFrameRate { fps: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoEvent {
    StateChanged {
        previous: VideoState,
        current: VideoState,
        reason: String,
    },
    FrameRate(FrameRateSample),
    Warning(VideoWarning),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotJoined,
    Confirmed,
    /// Torn down locally; the remote side may still list this viewer for a while.
    Unconfirmed { reason: String },
}

struct VideoShared {
    state: Mutex<VideoState>,
    frame_rate: Mutex<Option<FrameRateSample>>,
    attempts: Mutex<u32>,
    events: EventStream<VideoEvent>,
}

impl VideoShared {
    fn state(&self) -> VideoState {
        *self.state.lock()
    }

    fn transition(&self, next: VideoState, reason: &str) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == next {
                return;
            }
            *state = next;
            previous
        };
        info!(
            target: "teleop::video",
            from = previous.as_str(),
            to = next.as_str(),
            reason,
            "video state changed"
        );
        self.events.emit(VideoEvent::StateChanged {
            previous,
            current: next,
            reason: reason.to_string(),
        });
    }
}

pub struct VideoChannel {
    config: VideoConfig,
    engine: Arc<dyn VideoEngine>,
    shared: Arc<VideoShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl VideoChannel {
    pub fn new(config: VideoConfig, engine: Arc<dyn VideoEngine>, event_capacity: usize) -> Self {
        Self {
            config,
            engine,
            shared: Arc::new(VideoShared {
                state: Mutex::new(VideoState::Idle),
                frame_rate: Mutex::new(None),
                attempts: Mutex::new(0),
                events: EventStream::new(event_capacity),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventStream<VideoEvent> {
        &self.shared.events
    }

    pub fn state(&self) -> VideoState {
        self.shared.state()
    }

    pub fn frame_rate(&self) -> Option<FrameRateSample> {
        *self.shared.frame_rate.lock()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        *self.shared.attempts.lock()
    }

    /// Issue the join request. Returns once the request is accepted; the
    /// confirmation moves the state on asynchronously.
    pub async fn join(&self, credentials: &VideoCredentials) -> Result<(), VideoError> {
        let request = JoinRequest::viewer(credentials)?;
        {
            let mut state = self.shared.state.lock();
            if *state != VideoState::Idle {
                return Err(VideoError::InvalidState(*state));
            }
            *state = VideoState::Joining;
        }
        self.shared.events.emit(VideoEvent::StateChanged {
            previous: VideoState::Idle,
            current: VideoState::Joining,
            reason: "join requested".into(),
        });
        *self.shared.attempts.lock() = 0;

        if let Err(err) = self
            .engine
            .initialize(&request.app_id, &VIEWER_PROFILE)
            .await
        {
            self.shared.transition(VideoState::Failed, "engine initialization failed");
            return Err(err);
        }

        // Subscribe before the request so the confirmation cannot be missed.
        let events = self.engine.events();
        let supervisor = Supervisor {
            engine: self.engine.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            request: request.clone(),
            attempts: 0,
            deadline: Some(Instant::now() + self.config.join_timeout),
            meter: FrameRateMeter::new(Instant::now()),
        };
        let handle = tokio::spawn(supervisor.run(events));
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }

        debug!(
            target: "teleop::video",
            channel = %request.channel_name,
            token = !request.token.is_empty(),
            "sending join request"
        );
        if let Err(err) = self.engine.join(&request).await {
            self.stop_supervisor();
            warn!(target: "teleop::video", error = %err, "join request failed");
            self.shared.transition(VideoState::Failed, "join request rejected");
            return Err(err);
        }
        Ok(())
    }

    /// Leave and wait for the confirmation, bounded by the leave timeout.
    /// Local state reaches `Idle` either way.
    pub async fn leave(&self) -> LeaveOutcome {
        self.stop_supervisor_and_wait().await;
        if self.state() == VideoState::Idle {
            return LeaveOutcome::NotJoined;
        }
        self.shared
            .transition(VideoState::Disconnecting, "leave requested");

        let mut events = self.engine.events();
        let limit = self.config.leave_timeout;
        let wait = async {
            self.engine.leave().await?;
            loop {
                match events.recv().await {
                    Ok(EngineEvent::LeaveConfirmed) => break Ok::<(), VideoError>(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        break Err(VideoError::Leave("engine event stream closed".into()));
                    }
                }
            }
        };
        let outcome = match tokio::time::timeout(limit, wait).await {
            Ok(Ok(())) => LeaveOutcome::Confirmed,
            Ok(Err(err)) => LeaveOutcome::Unconfirmed {
                reason: err.to_string(),
            },
            Err(_) => LeaveOutcome::Unconfirmed {
                reason: format!("no leave confirmation within {}s", limit.as_secs()),
            },
        };

        self.finish_leave(&outcome);
        outcome
    }

    /// Blocking leave for process teardown.
    pub fn leave_blocking(&self, budget: Duration) -> LeaveOutcome {
        self.stop_supervisor();
        if self.state() == VideoState::Idle {
            return LeaveOutcome::NotJoined;
        }
        self.shared
            .transition(VideoState::Disconnecting, "leave requested");
        let outcome = if self.engine.leave_blocking(budget.min(self.config.leave_timeout)) {
            LeaveOutcome::Confirmed
        } else {
            LeaveOutcome::Unconfirmed {
                reason: "engine did not confirm before shutdown".into(),
            }
        };
        self.finish_leave(&outcome);
        outcome
    }

    fn finish_leave(&self, outcome: &LeaveOutcome) {
        *self.shared.frame_rate.lock() = None;
        *self.shared.attempts.lock() = 0;
        metrics::VIDEO_FRAME_RATE.set(0.0);
        match outcome {
            LeaveOutcome::Unconfirmed { reason } => {
                warn!(
                    target: "teleop::video",
                    reason = %reason,
                    "leave not confirmed; remote may still list this viewer"
                );
                self.shared.transition(VideoState::Idle, "leave unconfirmed");
            }
            _ => self.shared.transition(VideoState::Idle, "leave confirmed"),
        }
    }

    fn stop_supervisor(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }

    async fn stop_supervisor_and_wait(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for VideoChannel {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}

/// Owns the engine event stream while joined: drives state from engine
/// callbacks and runs the join, frame and recovery watchdogs.
struct Supervisor {
    engine: Arc<dyn VideoEngine>,
    config: VideoConfig,
    shared: Arc<VideoShared>,
    request: JoinRequest,
    attempts: u32,
    deadline: Option<Instant>,
    meter: FrameRateMeter,
}

impl Supervisor {
    async fn run(mut self, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            if self.shared.state() == VideoState::Failed {
                break;
            }
            let deadline = self.deadline;
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "teleop::video", skipped, "engine events dropped");
                    }
                    Err(RecvError::Closed) => {
                        self.shared.transition(VideoState::Failed, "engine event stream closed");
                    }
                },
                _ = sleep_until(deadline) => self.on_deadline().await,
            }
        }
        debug!(target: "teleop::video", "video supervisor stopped");
    }

    fn on_event(&mut self, event: EngineEvent) {
        let now = Instant::now();
        let state = self.shared.state();
        match event {
            EngineEvent::JoinConfirmed { uid } => {
                if matches!(state, VideoState::Joining | VideoState::Reconnecting) {
                    debug!(target: "teleop::video", uid, "join confirmed");
                    self.shared
                        .transition(VideoState::WaitingForPeer, "join confirmed");
                    self.deadline = self.recovery_deadline(now);
                }
            }
            EngineEvent::PeerJoined { uid } => {
                info!(target: "teleop::video", uid, "robot joined the channel");
            }
            EngineEvent::FirstFrame { uid, .. } | EngineEvent::Decoding { uid } => {
                if state == VideoState::WaitingForPeer {
                    debug!(target: "teleop::video", uid, "remote video decoding");
                    self.begin_streaming(now, "first frame");
                }
            }
            EngineEvent::Frame { .. } => match state {
                VideoState::Streaming => {
                    self.deadline = Some(now + self.config.frame_timeout);
                    if let Some(sample) = self.meter.frame(now) {
                        self.publish_sample(sample);
                    }
                }
                VideoState::WaitingForPeer => self.begin_streaming(now, "first frame"),
                _ => {}
            },
            EngineEvent::Frozen { uid } => {
                warn!(target: "teleop::video", uid, "remote video frozen");
                self.shared
                    .events
                    .emit(VideoEvent::Warning(VideoWarning::Frozen));
            }
            EngineEvent::NetworkQuality { rx_quality, .. } => {
                if rx_quality >= 4 {
                    warn!(target: "teleop::video", rx_quality, "poor network quality");
                    self.shared
                        .events
                        .emit(VideoEvent::Warning(VideoWarning::PoorNetwork { rx_quality }));
                }
            }
            EngineEvent::PeerOffline { uid, reason } => {
                if !state.is_joined() {
                    return;
                }
                match reason {
                    PeerLeaveReason::Quit => {
                        info!(target: "teleop::video", uid, "robot left the channel");
                        self.shared
                            .transition(VideoState::WaitingForPeer, "peer left");
                        self.deadline = self.recovery_deadline(now);
                    }
                    PeerLeaveReason::Dropped => self.begin_reconnect("peer dropped"),
                }
            }
            EngineEvent::ConnectionLost => {
                if state != VideoState::Reconnecting {
                    self.begin_reconnect("connection lost");
                }
            }
            EngineEvent::ConnectionFailed { reason } => {
                warn!(target: "teleop::video", reason = %reason, "engine reported connection failure");
                if state != VideoState::Reconnecting {
                    self.begin_reconnect("connection failed");
                }
            }
            EngineEvent::Error { code, message } => {
                warn!(target: "teleop::video", code, message = %message, "engine error");
            }
            EngineEvent::LeaveConfirmed => {}
        }
    }

    async fn on_deadline(&mut self) {
        self.deadline = None;
        match self.shared.state() {
            VideoState::Joining => self.begin_reconnect("join timed out"),
            VideoState::Streaming => self.begin_reconnect("no frames"),
            VideoState::WaitingForPeer => self.begin_reconnect("peer did not return"),
            VideoState::Reconnecting => self.rejoin().await,
            _ => {}
        }
    }

    fn begin_streaming(&mut self, now: Instant, reason: &str) {
        self.attempts = 0;
        *self.shared.attempts.lock() = 0;
        self.meter.reset(now);
        self.deadline = Some(now + self.config.frame_timeout);
        self.shared.transition(VideoState::Streaming, reason);
    }

    /// While recovering, waiting for the peer is bounded by the frame timeout.
    fn recovery_deadline(&self, now: Instant) -> Option<Instant> {
        (self.attempts > 0).then(|| now + self.config.frame_timeout)
    }

    fn begin_reconnect(&mut self, reason: &'static str) {
        if !self.config.auto_reconnect {
            self.shared
                .transition(VideoState::Failed, &format!("{reason}; auto reconnect off"));
            return;
        }
        self.attempts += 1;
        *self.shared.attempts.lock() = self.attempts;
        if self.attempts > self.config.max_reconnect_attempts {
            warn!(
                target: "teleop::video",
                attempts = self.config.max_reconnect_attempts,
                "giving up on video"
            );
            self.shared.transition(
                VideoState::Failed,
                &format!(
                    "{reason}; gave up after {} attempts",
                    self.config.max_reconnect_attempts
                ),
            );
            return;
        }
        metrics::VIDEO_RECONNECTS.with_label_values(&[reason]).inc();
        metrics::VIDEO_FRAME_RATE.set(0.0);
        let backoff = self.config.backoff_for(self.attempts);
        info!(
            target: "teleop::video",
            attempt = self.attempts,
            backoff_ms = backoff.as_millis() as u64,
            reason,
            "scheduling video rejoin"
        );
        self.deadline = Some(Instant::now() + backoff);
        self.shared.transition(VideoState::Reconnecting, reason);
    }

    async fn rejoin(&mut self) {
        if let Err(err) = self.engine.leave().await {
            debug!(target: "teleop::video", error = %err, "leave before rejoin failed");
        }
        match self.engine.join(&self.request).await {
            Ok(()) => {
                self.deadline = Some(Instant::now() + self.config.join_timeout);
                // A synchronous engine may already have confirmed; that event
                // is buffered and handled on the next loop turn.
                self.shared.transition(VideoState::Joining, "rejoining");
            }
            Err(err) => {
                warn!(target: "teleop::video", error = %err, "rejoin request failed");
                self.begin_reconnect("rejoin failed");
            }
        }
    }

    fn publish_sample(&self, sample: FrameRateSample) {
        metrics::VIDEO_FRAME_RATE.set(sample.fps);
        *self.shared.frame_rate.lock() = Some(sample);
        self.shared.events.emit(VideoEvent::FrameRate(sample));
        if sample.fps < self.config.low_fps_threshold {
            warn!(target: "teleop::video", fps = sample.fps, "low frame rate");
            self.shared
                .events
                .emit(VideoEvent::Warning(VideoWarning::LowFrameRate { fps: sample.fps }));
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
