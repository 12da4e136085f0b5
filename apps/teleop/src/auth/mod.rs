//! Pairing-code exchange and verified revocation against the authority.
//!
//! [`CredentialBroker`] is the only owner of [`SessionCredentials`]. Other
//! components receive an `Arc` snapshot at connect time and never mutate it.

pub mod authority;
pub mod credentials;
pub mod error;
pub mod pairing;

pub use authority::{AuthorityBackend, ReqwestAuthority};
pub use credentials::SessionCredentials;
pub use error::{AuthorityError, BrokerError, RejectCategory, RevokeOutcome};
pub use pairing::PairingCode;

use crate::clock::Clock;
use crate::config::AuthorityConfig;
use crate::events::EventStream;
use crate::metrics;
use authority_proto::{AuthRequest, AuthResponse, DisconnectRequest, DisconnectResponse};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    AuthSuccess {
        session_code: String,
        robot_id: String,
        expires_at_ms: u64,
    },
    AuthFailed {
        error: BrokerError,
    },
    Revoked {
        session_code: String,
        outcome: RevokeOutcome,
    },
    Cleared,
}

pub struct CredentialBroker {
    config: AuthorityConfig,
    backend: Arc<dyn AuthorityBackend>,
    clock: Clock,
    credentials: RwLock<Option<Arc<SessionCredentials>>>,
    prior_token: Mutex<Option<String>>,
    recent_codes: Mutex<HashMap<String, Instant>>,
    unverified_at: Mutex<Option<Instant>>,
    disconnecting: AtomicBool,
    events: EventStream<BrokerEvent>,
}

impl CredentialBroker {
    pub fn new(config: AuthorityConfig, backend: Arc<dyn AuthorityBackend>, clock: Clock) -> Self {
        Self {
            config,
            backend,
            clock,
            credentials: RwLock::new(None),
            prior_token: Mutex::new(None),
            recent_codes: Mutex::new(HashMap::new()),
            unverified_at: Mutex::new(None),
            disconnecting: AtomicBool::new(false),
            events: EventStream::default(),
        }
    }

    pub fn events(&self) -> &EventStream<BrokerEvent> {
        &self.events
    }

    pub fn current(&self) -> Option<Arc<SessionCredentials>> {
        self.credentials.read().clone()
    }

    pub fn credentials_loaded(&self) -> bool {
        self.credentials.read().is_some()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    /// Exchange a pairing code for session credentials.
    pub async fn exchange(&self, raw_code: &str) -> Result<Arc<SessionCredentials>, BrokerError> {
        let result = self.exchange_inner(raw_code).await;
        match &result {
            Ok(credentials) => {
                metrics::CREDENTIAL_EXCHANGES
                    .with_label_values(&["ok"])
                    .inc();
                self.events.emit(BrokerEvent::AuthSuccess {
                    session_code: credentials.session_code().to_string(),
                    robot_id: credentials.robot_id().to_string(),
                    expires_at_ms: credentials.expires_at_ms(),
                });
            }
            Err(error) => {
                metrics::CREDENTIAL_EXCHANGES
                    .with_label_values(&[error.label()])
                    .inc();
                warn!(
                    target: "teleop::auth",
                    error = %error,
                    user_message = %error.user_message(),
                    "credential exchange failed"
                );
                self.events.emit(BrokerEvent::AuthFailed {
                    error: error.clone(),
                });
            }
        }
        result
    }

    async fn exchange_inner(&self, raw_code: &str) -> Result<Arc<SessionCredentials>, BrokerError> {
        let code = PairingCode::parse(raw_code)?;
        if self.is_disconnecting() {
            return Err(BrokerError::Busy);
        }
        self.note_code_use(&code)?;

        let request = AuthRequest {
            session_code: code.as_str().to_string(),
            connection_token: self.prior_token.lock().clone().unwrap_or_default(),
        };
        debug!(
            target: "teleop::auth",
            session_code = %code,
            has_prior_token = !request.connection_token.is_empty(),
            "sending authentication request"
        );

        let timeout = self.config.exchange_timeout;
        let outcome = tokio::time::timeout(timeout, self.backend.authenticate(&request)).await;
        let response = match outcome {
            Err(_) => {
                self.clear();
                return Err(BrokerError::NetworkTimeout { after: timeout });
            }
            Ok(Err(err)) => {
                self.clear();
                return Err(map_authority_error(err));
            }
            Ok(Ok(response)) => response,
        };

        let credentials = match adopt_response(response) {
            Ok(credentials) => Arc::new(credentials),
            Err(err) => {
                self.clear();
                return Err(err);
            }
        };

        {
            let mut slot = self.credentials.write();
            if slot.is_some() {
                warn!(
                    target: "teleop::auth",
                    "replacing credentials that were never cleared"
                );
            }
            *slot = Some(credentials.clone());
        }
        *self.prior_token.lock() = Some(credentials.session.connection_token.clone());
        info!(
            target: "teleop::auth",
            session_code = %credentials.session_code(),
            robot_id = %credentials.robot_id(),
            expires_in_secs = self.clock.until(credentials.expires_at_ms()).as_secs(),
            "credentials stored"
        );
        Ok(credentials)
    }

    /// Release the session with the authority. Local credentials are cleared
    /// whatever the authority answers.
    pub async fn revoke(&self) -> RevokeOutcome {
        let Some(credentials) = self.current() else {
            return RevokeOutcome::Verified { warning: None };
        };
        let _flag = DisconnectingFlag::raise(&self.disconnecting);
        self.note_revoke(&credentials);

        let request = disconnect_request(&credentials);
        let timeout = self.config.revoke_timeout;
        let outcome =
            match tokio::time::timeout(timeout, self.backend.disconnect(&request)).await {
                Err(_) => RevokeOutcome::Unverified {
                    reason: format!("no answer within {}s", timeout.as_secs()),
                },
                Ok(result) => verify(result),
            };

        self.finish_revoke(&credentials, &outcome);
        outcome
    }

    /// Blocking revoke for process teardown, capped at `budget` of wall time.
    /// Safe to call from any thread, including runtime worker threads.
    pub fn revoke_blocking(&self, budget: Duration) -> RevokeOutcome {
        let Some(credentials) = self.current() else {
            return RevokeOutcome::Verified { warning: None };
        };
        let _flag = DisconnectingFlag::raise(&self.disconnecting);
        self.note_revoke(&credentials);

        let request = disconnect_request(&credentials);
        let backend = self.backend.clone();
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("teleop-revoke".into())
            .spawn(move || {
                let _ = tx.send(backend.disconnect_blocking(&request, budget));
            });

        let outcome = match spawned {
            Err(err) => RevokeOutcome::Unverified {
                reason: format!("unable to start revoke thread: {err}"),
            },
            Ok(_) => match rx.recv_timeout(budget) {
                Ok(result) => verify(result),
                Err(_) => RevokeOutcome::Unverified {
                    reason: format!("no answer within {}s", budget.as_secs()),
                },
            },
        };

        self.finish_revoke(&credentials, &outcome);
        outcome
    }

    /// Drop every credential field at once.
    pub fn clear(&self) {
        let had = self.credentials.write().take().is_some();
        if had {
            debug!(target: "teleop::auth", "credentials cleared");
            self.events.emit(BrokerEvent::Cleared);
        }
    }

    /// Seconds left on the session, zero without credentials.
    pub fn time_remaining(&self) -> Duration {
        match self.current() {
            Some(credentials) => self.clock.until(credentials.expires_at_ms()),
            None => Duration::ZERO,
        }
    }

    /// No recorded expiry counts as expired.
    pub fn is_expired(&self) -> bool {
        match self.current() {
            Some(credentials) => self.clock.now_ms() >= credentials.expires_at_ms(),
            None => true,
        }
    }

    /// Remaining part of the advisory window after an unverified revoke.
    pub fn reconnect_caution(&self) -> Option<Duration> {
        let since = (*self.unverified_at.lock())?;
        self.config
            .reconnect_caution
            .checked_sub(since.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    fn note_code_use(&self, code: &PairingCode) -> Result<(), BrokerError> {
        let window = self.config.same_code_window;
        let now = Instant::now();
        let mut recent = self.recent_codes.lock();
        recent.retain(|_, at| now.duration_since(*at) < window);
        if let Some(at) = recent.get(code.as_str()) {
            let elapsed = now.duration_since(*at);
            return Err(BrokerError::RecentlyUsed {
                elapsed,
                wait: window.saturating_sub(elapsed),
            });
        }
        recent.insert(code.as_str().to_string(), now);
        Ok(())
    }

    fn note_revoke(&self, credentials: &SessionCredentials) {
        self.recent_codes
            .lock()
            .insert(credentials.session_code().to_string(), Instant::now());
        info!(
            target: "teleop::auth",
            session_code = %credentials.session_code(),
            robot_id = %credentials.robot_id(),
            "sending disconnect request"
        );
    }

    fn finish_revoke(&self, credentials: &SessionCredentials, outcome: &RevokeOutcome) {
        self.clear();
        match outcome {
            RevokeOutcome::Verified { warning } => {
                metrics::REVOCATIONS.with_label_values(&["verified"]).inc();
                *self.unverified_at.lock() = None;
                if let Some(warning) = warning {
                    warn!(target: "teleop::auth", warning = %warning, "disconnect verified with warning");
                } else {
                    info!(target: "teleop::auth", "disconnect verified");
                }
            }
            RevokeOutcome::Unverified { reason } => {
                metrics::REVOCATIONS.with_label_values(&["unverified"]).inc();
                *self.unverified_at.lock() = Some(Instant::now());
                warn!(
                    target: "teleop::auth",
                    reason = %reason,
                    caution_secs = self.config.reconnect_caution.as_secs(),
                    "disconnect not verified; wait before reconnecting"
                );
            }
        }
        self.events.emit(BrokerEvent::Revoked {
            session_code: credentials.session_code().to_string(),
            outcome: outcome.clone(),
        });
    }
}

struct DisconnectingFlag<'a>(&'a AtomicBool);

impl<'a> DisconnectingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DisconnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn disconnect_request(credentials: &SessionCredentials) -> DisconnectRequest {
    DisconnectRequest {
        session_code: credentials.session_code().to_string(),
        robot_id: credentials.robot_id().to_string(),
        connection_token: credentials.session.connection_token.clone(),
    }
}

fn verify(result: Result<DisconnectResponse, AuthorityError>) -> RevokeOutcome {
    match result {
        Ok(response) if response.success => RevokeOutcome::Verified {
            warning: response.warning.filter(|w| !w.trim().is_empty()),
        },
        Ok(response) => RevokeOutcome::Unverified {
            reason: response
                .error
                .or(response.message)
                .unwrap_or_else(|| "authority refused the disconnect".into()),
        },
        Err(err) => RevokeOutcome::Unverified {
            reason: err.to_string(),
        },
    }
}

fn adopt_response(response: AuthResponse) -> Result<SessionCredentials, BrokerError> {
    if !response.success {
        let message = response.reason().unwrap_or("Unknown error").to_string();
        return Err(BrokerError::ServerRejected {
            category: RejectCategory::from_server_text(&message),
            retry_after: response.retry_after.map(Duration::from_secs),
            message,
        });
    }
    SessionCredentials::from_response(response)
}

fn map_authority_error(err: AuthorityError) -> BrokerError {
    match err {
        AuthorityError::Status {
            status,
            reason,
            retry_after,
        } => match RejectCategory::from_status(status) {
            Some(by_status) => {
                let message = reason.unwrap_or_default();
                let category = match RejectCategory::from_server_text(&message) {
                    RejectCategory::Other => by_status,
                    by_text => by_text,
                };
                BrokerError::ServerRejected {
                    category,
                    message,
                    retry_after: retry_after.map(Duration::from_secs),
                }
            }
            None => BrokerError::TransportError {
                status: Some(status),
                message: reason.unwrap_or_else(|| format!("http {status}")),
            },
        },
        AuthorityError::Network(message) | AuthorityError::Request(message) => {
            BrokerError::TransportError {
                status: None,
                message,
            }
        }
        AuthorityError::Decode(_) => BrokerError::IncompleteResponse {
            missing: "a decodable response body",
        },
    }
}
