use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use authority_proto::{
    AuthRequest, AuthResponse, CommandRecord, ConnectionStatus, ConnectionStatusRecord,
    DisconnectRequest, DisconnectResponse, command_slot_path, connection_status_path,
};
use parking_lot::Mutex;
use serde_json::json;
use teleop_core::auth::{AuthorityBackend, AuthorityError, BrokerError, CredentialBroker};
use teleop_core::clock::Clock;
use teleop_core::command::{CommandChannel, OPERATOR_SOURCE};
use teleop_core::config::TeleopConfig;
use teleop_core::events::drain;
use teleop_core::input::{InputRouter, Key, KeyboardInput};
use teleop_core::session::{
    DisconnectReason, SessionError, SessionEvent, SessionOrchestrator, SessionState,
};
use teleop_core::store::{MemoryConnector, MemoryStore};
use teleop_core::video::{LeaveOutcome, LoopbackEngine, LoopbackScript, VideoChannel, VideoState};
use tokio::time::Instant;

const EPOCH_MS: u64 = 1_700_000_000_000;

enum Reply<T> {
    Now(Result<T, AuthorityError>),
    Never,
}

#[derive(Default)]
struct FakeAuthority {
    auth: Mutex<VecDeque<Reply<AuthResponse>>>,
    disconnect: Mutex<VecDeque<Reply<DisconnectResponse>>>,
    auth_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl FakeAuthority {
    fn grant(&self, code: &str, expires_at: u64) {
        self.auth.lock().push_back(Reply::Now(Ok(granted(code, expires_at))));
    }
}

#[async_trait]
impl AuthorityBackend for FakeAuthority {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<AuthResponse, AuthorityError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.auth.lock().pop_front();
        match next {
            Some(Reply::Now(reply)) => reply,
            Some(Reply::Never) => std::future::pending().await,
            None => Err(AuthorityError::Network("unexpected authenticate".into())),
        }
    }

    async fn disconnect(
        &self,
        _request: &DisconnectRequest,
    ) -> Result<DisconnectResponse, AuthorityError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.disconnect.lock().pop_front();
        match next {
            Some(Reply::Now(reply)) => reply,
            Some(Reply::Never) => std::future::pending().await,
            None => Ok(DisconnectResponse {
                success: true,
                ..DisconnectResponse::default()
            }),
        }
    }

    fn disconnect_blocking(
        &self,
        _request: &DisconnectRequest,
        _timeout: Duration,
    ) -> Result<DisconnectResponse, AuthorityError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(DisconnectResponse {
            success: true,
            ..DisconnectResponse::default()
        })
    }
}

fn granted(code: &str, expires_at: u64) -> AuthResponse {
    serde_json::from_value(json!({
        "success": true,
        "firebase": {
            "databaseURL": "https://db.example",
            "projectId": "teleop",
            "apiKey": "key",
            "appId": "app",
            "storageBucket": "bucket"
        },
        "agora": { "appId": "video-app", "channel": "hexa-01", "token": "" },
        "session_info": {
            "session_code": code,
            "robot_id": "hexa-01",
            "expires_at": expires_at,
            "agora_channel": "hexa-01",
            "connection_token": format!("tok-{code}")
        }
    }))
    .unwrap()
}

struct Harness {
    session: SessionOrchestrator,
    authority: Arc<FakeAuthority>,
    store: Arc<MemoryStore>,
    engine: Arc<LoopbackEngine>,
    keyboard: Arc<KeyboardInput>,
}

fn harness() -> Harness {
    let config = TeleopConfig::default();
    let clock = Clock::starting_at(EPOCH_MS);
    let authority = Arc::new(FakeAuthority::default());
    let store = MemoryStore::new();
    let engine = Arc::new(LoopbackEngine::default());
    let keyboard = Arc::new(KeyboardInput::default());

    let broker = Arc::new(CredentialBroker::new(
        config.authority.clone(),
        authority.clone(),
        clock,
    ));
    let command = Arc::new(CommandChannel::new(
        &config,
        Arc::new(MemoryConnector::new(store.clone())),
        Arc::new(InputRouter::keyboard_only(keyboard.clone())),
        clock,
    ));
    let video = Arc::new(VideoChannel::new(
        config.video.clone(),
        engine.clone(),
        config.session.event_capacity,
    ));
    Harness {
        session: SessionOrchestrator::new(&config, broker, command, video),
        authority,
        store,
        engine,
        keyboard,
    }
}

fn operator_records(store: &MemoryStore, code: &str) -> Vec<CommandRecord> {
    store
        .writes_to(&command_slot_path(code))
        .into_iter()
        .filter_map(|write| write.value)
        .map(|value| serde_json::from_value::<CommandRecord>(value).unwrap())
        .filter(|record| record.source == OPERATOR_SOURCE)
        .collect()
}

fn status(store: &MemoryStore, code: &str) -> ConnectionStatusRecord {
    serde_json::from_value(store.get(&connection_status_path(code)).unwrap()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn malformed_codes_never_reach_the_authority() {
    let h = harness();
    for code in ["", "ABC12", "ABC1234", "  AB  ", "ABCDEFG"] {
        let err = h.session.connect(code).await.unwrap_err();
        assert_eq!(err, SessionError::Auth(BrokerError::InvalidFormat), "code {code:?}");
        assert_eq!(h.session.state(), SessionState::Idle);
    }
    assert_eq!(h.authority.auth_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn happy_path_publishes_ten_ticks_and_disconnects() {
    let h = harness();
    let started = Instant::now();
    h.authority.grant("ABC123", EPOCH_MS + 3_600_000);

    let credentials = h.session.connect("ABC123").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(credentials.session_code(), "ABC123");
    assert_eq!(h.session.state(), SessionState::Active);

    tokio::time::sleep(Duration::from_millis(950)).await;
    let disconnect_started = Instant::now();
    let summary = h.session.disconnect().await.unwrap();
    assert!(disconnect_started.elapsed() < Duration::from_secs(15));

    let seqs: Vec<u64> = operator_records(&h.store, "ABC123")
        .iter()
        .map(|record| record.seq)
        .collect();
    assert_eq!(seqs, (1..=10).collect::<Vec<_>>());

    assert_eq!(summary.reason, DisconnectReason::User);
    assert!(summary.is_verified());
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(!h.session.broker().credentials_loaded());
    assert!(h.session.broker().current().is_none());
    assert_eq!(h.session.broker().time_remaining(), Duration::ZERO);
    assert_eq!(status(&h.store, "ABC123").status, ConnectionStatus::Disconnected);
    assert!(h.store.get(&command_slot_path("ABC123")).is_none());
}

#[tokio::test(start_paused = true)]
async fn sequence_restarts_with_each_connect() {
    let h = harness();
    h.authority.grant("ABC123", EPOCH_MS + 3_600_000);
    h.authority.grant("XYZ789", EPOCH_MS + 3_600_000);

    h.session.connect("ABC123").await.unwrap();
    tokio::time::sleep(Duration::from_millis(550)).await;
    h.session.disconnect().await.unwrap();

    h.session.connect("XYZ789").await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(h.session.command().sequence() >= 1);
    h.session.disconnect().await.unwrap();

    for code in ["ABC123", "XYZ789"] {
        let seqs: Vec<u64> = operator_records(&h.store, code)
            .iter()
            .map(|record| record.seq)
            .collect();
        assert_eq!(seqs.first(), Some(&1), "session {code}");
        assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]), "session {code}");
    }
}

#[tokio::test(start_paused = true)]
async fn same_code_is_refused_right_after_disconnect() {
    let h = harness();
    h.authority.grant("ABC123", EPOCH_MS + 3_600_000);
    h.session.connect("ABC123").await.unwrap();
    h.session.disconnect().await.unwrap();

    let err = h.session.connect("ABC123").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Auth(BrokerError::RecentlyUsed { .. })
    ));
    assert_eq!(h.authority.auth_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn overlapping_requests_are_busy() {
    let h = harness();
    h.authority.grant("ABC123", EPOCH_MS + 3_600_000);
    h.authority.disconnect.lock().push_back(Reply::Never);
    h.session.connect("ABC123").await.unwrap();

    let first = {
        let session = h.session.clone();
        tokio::spawn(async move { session.disconnect().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.session.state(), SessionState::Disconnecting);

    assert_eq!(h.session.disconnect().await.unwrap_err(), SessionError::Busy);
    assert_eq!(h.session.connect("XYZ789").await.unwrap_err(), SessionError::Busy);
    assert_eq!(h.session.state(), SessionState::Disconnecting);

    let summary = first.await.unwrap().unwrap();
    assert!(!summary.is_verified());
    assert!(summary.caution.is_some());
    assert!(!h.session.broker().credentials_loaded());
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.authority.disconnect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn incomplete_response_is_rejected_whole() {
    let h = harness();
    let mut events = h.session.events().subscribe();
    let mut response = granted("ABC123", EPOCH_MS + 3_600_000);
    response.video = None;
    h.authority.auth.lock().push_back(Reply::Now(Ok(response)));

    let err = h.session.connect("ABC123").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Auth(BrokerError::IncompleteResponse { .. })
    ));
    assert!(!h.session.broker().credentials_loaded());
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.store.writes().is_empty());
    assert!(
        drain(&mut events)
            .iter()
            .any(|event| matches!(event, SessionEvent::AuthFailed { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_video_leave_does_not_stall_disconnect() {
    let h = harness();
    h.engine.set_script(LoopbackScript {
        confirm_leave: false,
        ..LoopbackScript::default()
    });
    h.authority.grant("ABC123", EPOCH_MS + 3_600_000);
    h.session.connect("ABC123").await.unwrap();

    let started = Instant::now();
    let summary = h.session.disconnect().await.unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(summary.video, LeaveOutcome::Unconfirmed { .. }));
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(6));
    assert!(summary.command.unwrap().status_written);
    assert!(summary.is_verified());
    assert_eq!(h.session.video().state(), VideoState::Idle);
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn expiry_runs_the_full_disconnect() {
    let h = harness();
    let mut events = h.session.events().subscribe();
    h.authority.grant("ABC123", EPOCH_MS + 30_000);
    h.session.connect("ABC123").await.unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.session.state(), SessionState::Active);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(!h.session.broker().credentials_loaded());
    assert_eq!(h.authority.disconnect_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        status(&h.store, "ABC123").reason.as_deref(),
        Some("session_expired")
    );

    let seen = drain(&mut events);
    let expired = seen
        .iter()
        .position(|event| matches!(event, SessionEvent::SessionExpired { .. }))
        .unwrap();
    let complete = seen
        .iter()
        .position(|event| matches!(event, SessionEvent::DisconnectComplete { .. }))
        .unwrap();
    assert!(expired < complete);
}

#[tokio::test(start_paused = true)]
async fn stop_key_engages_within_one_tick() {
    let h = harness();
    h.authority.grant("ABC123", EPOCH_MS + 3_600_000);
    h.session.connect("ABC123").await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!h.session.command().emergency_stop_engaged());

    h.keyboard.press(Key::Stop);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.session.command().emergency_stop_engaged());

    h.keyboard.release(Key::Stop);
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(!h.session.command().emergency_stop_engaged());
    h.session.disconnect().await.unwrap();

    let records = operator_records(&h.store, "ABC123");
    assert!(records.iter().any(|record| record.emergency_stop));
    assert!(!records.last().unwrap().emergency_stop);
}
