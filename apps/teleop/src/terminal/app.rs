use crate::auth::{CredentialBroker, ReqwestAuthority, RevokeOutcome};
use crate::clock::Clock;
use crate::command::CommandChannel;
use crate::config::TeleopConfig;
use crate::input::{InputRouter, KeyboardInput};
use crate::metrics;
use crate::session::{DisconnectSummary, SessionEvent, SessionOrchestrator};
use crate::store::FirebaseConnector;
use crate::terminal::cli::{Cli, Command, ConnectArgs};
use crate::terminal::error::CliError;
use crate::terminal::keys::{self, KeyAction, RawModeGuard};
use crate::video::{LoopbackEngine, VideoChannel, VideoEvent, VideoWarning};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = TeleopConfig::from_env()?;
    cli.overrides.apply(&mut config)?;

    let result = match cli.command {
        Command::Connect(args) => connect(config, args).await,
        Command::Config => print_config(&config),
    };

    if cli.metrics_dump {
        eprint!("{}", metrics::render());
    }
    result
}

fn print_config(config: &TeleopConfig) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(config)
        .map_err(|err| CliError::Io(std::io::Error::other(err)))?;
    println!("{rendered}");
    Ok(())
}

fn build_session(
    config: &TeleopConfig,
    keyboard: Arc<KeyboardInput>,
) -> Result<SessionOrchestrator, CliError> {
    let clock = Clock::system();
    let authority = ReqwestAuthority::new(
        config.authority.auth_url.clone(),
        config.authority.disconnect_url.clone(),
    )?;
    let broker = Arc::new(CredentialBroker::new(
        config.authority.clone(),
        Arc::new(authority),
        clock,
    ));
    let connector = FirebaseConnector::new(config.store.clone())?;
    let command = Arc::new(CommandChannel::new(
        config,
        Arc::new(connector),
        Arc::new(InputRouter::keyboard_only(keyboard)),
        clock,
    ));
    warn!(
        target: "teleop::terminal",
        "no video backend linked; the video channel runs against the loopback engine"
    );
    let video = Arc::new(VideoChannel::new(
        config.video.clone(),
        Arc::new(LoopbackEngine::default()),
        config.session.event_capacity,
    ));
    Ok(SessionOrchestrator::new(config, broker, command, video))
}

async fn connect(config: TeleopConfig, args: ConnectArgs) -> Result<(), CliError> {
    let keyboard = Arc::new(match args.tap_hold_ms {
        Some(ms) => KeyboardInput::with_tap_hold(Duration::from_millis(ms)),
        None => KeyboardInput::default(),
    });
    let session = build_session(&config, keyboard.clone())?;
    let mut session_events = session.events().subscribe();
    let printer = tokio::spawn(print_events(session.events().subscribe()));

    let credentials = match session.connect(&args.code).await {
        Ok(credentials) => credentials,
        Err(err) => {
            printer.abort();
            eprintln!("❌ {}", err.user_message());
            return Err(err.into());
        }
    };
    eprintln!(
        "connected to {} (session {}, {}s left)",
        credentials.robot_id(),
        credentials.session_code(),
        session.broker().time_remaining().as_secs()
    );
    eprintln!("W/S forward/back  A/D strafe  Q/E turn  Space stop  V restart video  Esc quit");

    let raw = RawModeGuard::new();
    if !raw.is_raw() {
        warn!(target: "teleop::terminal", "stdin is not a terminal; keyboard driving disabled");
    }
    let (action_tx, mut actions) = mpsc::unbounded_channel();
    let stop_keys = Arc::new(AtomicBool::new(false));
    let listener = if raw.is_raw() {
        Some(keys::spawn_key_listener(
            keyboard.clone(),
            action_tx,
            stop_keys.clone(),
        )?)
    } else {
        drop(action_tx);
        None
    };

    let mut signals = ShutdownSignal::install();
    let ended_remotely = loop {
        tokio::select! {
            action = actions.recv(), if listener.is_some() => match action {
                Some(KeyAction::Disconnect) | None => break None,
                Some(KeyAction::RestartVideo) => {
                    if let Err(err) = session.restart_video().await {
                        warn!(target: "teleop::terminal", error = %err, "video restart failed");
                    }
                }
                Some(KeyAction::Drive(_)) => {}
            },
            signal = signals.recv() => {
                info!(target: "teleop::terminal", signal, "shutdown requested");
                break None;
            }
            event = session_events.recv() => match event {
                Ok(SessionEvent::DisconnectComplete { summary }) => break Some(summary),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break None,
            },
        }
    };

    stop_keys.store(true, Ordering::SeqCst);
    keyboard.release_all();
    if let Some(listener) = listener {
        if listener.join().is_err() {
            warn!(target: "teleop::terminal", "key listener panicked");
        }
    }
    drop(raw);

    let summary = match ended_remotely {
        Some(summary) => summary,
        None => disconnect(&session, config.session.shutdown_timeout).await?,
    };
    printer.abort();
    report_summary(&summary);
    Ok(())
}

/// Process-exit signals that run the orderly disconnect: Ctrl-C everywhere,
/// SIGTERM on Unix.
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl ShutdownSignal {
    fn install() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => Some(stream),
                Err(err) => {
                    warn!(target: "teleop::terminal", error = %err, "unable to listen for SIGTERM");
                    None
                }
            };
            Self { terminate }
        }
        #[cfg(not(unix))]
        Self {}
    }

    async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            if let Some(terminate) = self.terminate.as_mut() {
                return tokio::select! {
                    _ = interrupted() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                };
            }
        }
        interrupted().await;
        "SIGINT"
    }
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Orderly disconnect bounded by the shutdown budget, falling back to the
/// blocking teardown when the async path overruns.
async fn disconnect(
    session: &SessionOrchestrator,
    budget: Duration,
) -> Result<DisconnectSummary, CliError> {
    eprintln!("disconnecting…");
    match tokio::time::timeout(budget, session.disconnect()).await {
        Ok(Ok(summary)) => Ok(summary),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => {
            warn!(
                target: "teleop::terminal",
                budget_secs = budget.as_secs(),
                "disconnect overran its budget; forcing shutdown"
            );
            let session = session.clone();
            tokio::task::spawn_blocking(move || session.shutdown_blocking())
                .await
                .map_err(|err| CliError::Shutdown(err.to_string()))?
                .ok_or_else(|| CliError::Shutdown("nothing left to tear down".into()))
        }
    }
}

fn report_summary(summary: &DisconnectSummary) {
    info!(
        target: "teleop::terminal",
        reason = summary.reason.status_reason(),
        verified = summary.is_verified(),
        "session ended"
    );
    match &summary.revoke {
        RevokeOutcome::Verified { warning: None } => eprintln!("✅ disconnected"),
        RevokeOutcome::Verified {
            warning: Some(warning),
        } => eprintln!("✅ disconnected ({warning})"),
        RevokeOutcome::Unverified { reason } => {
            eprintln!("⚠️  disconnect not confirmed by the server: {reason}");
            if let Some(wait) = summary.caution {
                eprintln!(
                    "⚠️  wait about {}s before reconnecting to this robot",
                    wait.as_secs()
                );
            }
        }
    }
    if summary.command.is_some_and(|report| !report.is_clean()) {
        eprintln!("⚠️  some final command records could not be written");
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = describe(&event) {
                    // Raw mode needs an explicit carriage return.
                    eprint!("{line}\r\n");
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}

/// One line for the operator, `None` for events not worth showing.
pub fn describe(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::StateChanged { previous, current } => {
            format!("session {previous} → {current}")
        }
        SessionEvent::AuthFailed { message, .. } => format!("❌ {message}"),
        SessionEvent::ConnectFailed { message } => format!("❌ connection failed: {message}"),
        SessionEvent::VideoJoinFailed { message } => format!("⚠️  video unavailable: {message}"),
        SessionEvent::EmergencyStop { engaged: true, causes } => {
            format!("🛑 emergency stop ({})", causes.describe())
        }
        SessionEvent::EmergencyStop { engaged: false, .. } => "emergency stop released".into(),
        SessionEvent::CommandPublishFailed {
            consecutive_failures,
            message,
            ..
        } if *consecutive_failures == 1 || consecutive_failures % 10 == 0 => {
            format!("⚠️  command publish failing ({consecutive_failures} in a row): {message}")
        }
        SessionEvent::InputMethodChanged { method } => format!("input: {}", method.as_str()),
        SessionEvent::Video(VideoEvent::StateChanged {
            current, reason, ..
        }) => format!("video {current} ({reason})"),
        SessionEvent::Video(VideoEvent::Warning(warning)) => match warning {
            VideoWarning::Frozen => "⚠️  video frozen".into(),
            VideoWarning::PoorNetwork { rx_quality } => {
                format!("⚠️  poor video network (quality {rx_quality})")
            }
            VideoWarning::LowFrameRate { fps } => format!("⚠️  low frame rate ({fps:.0} fps)"),
        },
        SessionEvent::SessionExpired { session_code } => {
            format!("⏰ session {session_code} expired")
        }
        _ => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StopCauses;
    use crate::session::SessionState;

    #[test]
    fn describes_operator_facing_events() {
        assert_eq!(
            describe(&SessionEvent::StateChanged {
                previous: SessionState::Connecting,
                current: SessionState::Active,
            })
            .as_deref(),
            Some("session connecting → active")
        );
        let stop = describe(&SessionEvent::EmergencyStop {
            engaged: true,
            causes: StopCauses {
                input: true,
                ..StopCauses::default()
            },
        })
        .unwrap();
        assert!(stop.starts_with("🛑 emergency stop"));
    }

    #[cfg(unix)]
    #[test_timeout::tokio_timeout_test]
    async fn sigterm_requests_shutdown() {
        let mut signals = ShutdownSignal::install();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        assert_eq!(signals.recv().await, "SIGTERM");
    }

    #[test]
    fn publish_failures_are_throttled() {
        let failure = |n| SessionEvent::CommandPublishFailed {
            seq: 1,
            consecutive_failures: n,
            message: "offline".into(),
        };
        assert!(describe(&failure(1)).is_some());
        assert!(describe(&failure(2)).is_none());
        assert!(describe(&failure(10)).is_some());
    }
}
