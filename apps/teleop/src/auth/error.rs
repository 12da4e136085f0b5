use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// User-facing bucket for a refusal from the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCategory {
    AlreadyConnected,
    Expired,
    NotFound,
    TooManyAttempts,
    Other,
}

impl RejectCategory {
    /// Classify server error text by case-insensitive substring.
    pub fn from_server_text(text: &str) -> Self {
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("already connected") {
            RejectCategory::AlreadyConnected
        } else if lowered.contains("expired") {
            RejectCategory::Expired
        } else if lowered.contains("not found") {
            RejectCategory::NotFound
        } else if lowered.contains("too many") {
            RejectCategory::TooManyAttempts
        } else {
            RejectCategory::Other
        }
    }

    /// Category implied by the HTTP status alone.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            404 => Some(RejectCategory::NotFound),
            403 => Some(RejectCategory::Expired),
            409 => Some(RejectCategory::AlreadyConnected),
            429 => Some(RejectCategory::TooManyAttempts),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RejectCategory::AlreadyConnected => "already_connected",
            RejectCategory::Expired => "expired",
            RejectCategory::NotFound => "not_found",
            RejectCategory::TooManyAttempts => "too_many_attempts",
            RejectCategory::Other => "other",
        }
    }
}

impl fmt::Display for RejectCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("pairing code must be exactly six characters")]
    InvalidFormat,
    #[error("a disconnect is in progress")]
    Busy,
    #[error("pairing code was used {elapsed:?} ago; wait {wait:?}")]
    RecentlyUsed { elapsed: Duration, wait: Duration },
    #[error("authority did not answer within {after:?}")]
    NetworkTimeout { after: Duration },
    #[error("transport error (status {status:?}): {message}")]
    TransportError {
        status: Option<u16>,
        message: String,
    },
    #[error("authority response is missing {missing}")]
    IncompleteResponse { missing: &'static str },
    #[error("authority rejected the code ({category}): {message}")]
    ServerRejected {
        category: RejectCategory,
        message: String,
        retry_after: Option<Duration>,
    },
}

impl BrokerError {
    /// One short, actionable line for the operator.
    pub fn user_message(&self) -> String {
        match self {
            BrokerError::InvalidFormat => "Enter the 6-character code shown on the robot".into(),
            BrokerError::Busy => "Please wait, disconnecting...".into(),
            BrokerError::RecentlyUsed { wait, .. } => {
                format!(
                    "Wait {}s before retrying same code",
                    (wait.as_secs_f64().ceil() as u64).max(1)
                )
            }
            BrokerError::NetworkTimeout { .. } => "Connection timeout - Check your network".into(),
            BrokerError::TransportError { status: None, .. } => {
                "Cannot connect - Check internet".into()
            }
            BrokerError::TransportError { .. } => "Connection failed - Try again".into(),
            BrokerError::IncompleteResponse { .. } => "Incomplete server response".into(),
            BrokerError::ServerRejected {
                category,
                message,
                retry_after,
            } => match category {
                RejectCategory::AlreadyConnected => {
                    "Robot already connected - Press disconnect first".into()
                }
                RejectCategory::Expired => "Session expired - Generate new code on robot".into(),
                RejectCategory::NotFound => "Invalid code - Check robot display".into(),
                RejectCategory::TooManyAttempts => match retry_after {
                    Some(wait) if message.is_empty() => {
                        format!("Too many failed attempts - Wait {}s", wait.as_secs())
                    }
                    _ if message.is_empty() => "Too many failed attempts - Wait and try again".into(),
                    _ => message.clone(),
                },
                RejectCategory::Other if message.is_empty() => "Connection failed - Try again".into(),
                RejectCategory::Other => message.clone(),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BrokerError::InvalidFormat => "invalid_format",
            BrokerError::Busy => "busy",
            BrokerError::RecentlyUsed { .. } => "recently_used",
            BrokerError::NetworkTimeout { .. } => "timeout",
            BrokerError::TransportError { .. } => "transport",
            BrokerError::IncompleteResponse { .. } => "incomplete",
            BrokerError::ServerRejected { .. } => "rejected",
        }
    }
}

/// Failure talking to the authority endpoints.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AuthorityError {
    #[error("authority returned http {status}")]
    Status {
        status: u16,
        reason: Option<String>,
        retry_after: Option<u64>,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid authority response: {0}")]
    Decode(String),
    #[error("unable to build request: {0}")]
    Request(String),
}

impl From<reqwest::Error> for AuthorityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthorityError::Decode(err.to_string())
        } else if err.is_builder() {
            AuthorityError::Request(err.to_string())
        } else {
            AuthorityError::Network(err.to_string())
        }
    }
}

/// Result of a revoke. Local credentials are cleared in both cases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RevokeOutcome {
    Verified { warning: Option<String> },
    Unverified { reason: String },
}

impl RevokeOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, RevokeOutcome::Verified { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorises_server_text_case_insensitively() {
        assert_eq!(
            RejectCategory::from_server_text("Robot already connected. Disconnect first or wait 42s."),
            RejectCategory::AlreadyConnected
        );
        assert_eq!(
            RejectCategory::from_server_text("Session EXPIRED. Robot must generate new code."),
            RejectCategory::Expired
        );
        assert_eq!(
            RejectCategory::from_server_text("Session not found. Check code on robot display."),
            RejectCategory::NotFound
        );
        assert_eq!(
            RejectCategory::from_server_text("Too many failed attempts. Try again in 300 seconds."),
            RejectCategory::TooManyAttempts
        );
        assert_eq!(
            RejectCategory::from_server_text("database unavailable"),
            RejectCategory::Other
        );
    }

    #[test]
    fn short_circuit_categories_hide_server_text() {
        let err = BrokerError::ServerRejected {
            category: RejectCategory::Expired,
            message: "Session expired 3.2 minutes ago".into(),
            retry_after: None,
        };
        assert_eq!(err.user_message(), "Session expired - Generate new code on robot");
    }

    #[test]
    fn other_categories_pass_server_text_through() {
        let err = BrokerError::ServerRejected {
            category: RejectCategory::Other,
            message: "Robot offline".into(),
            retry_after: None,
        };
        assert_eq!(err.user_message(), "Robot offline");

        let err = BrokerError::ServerRejected {
            category: RejectCategory::TooManyAttempts,
            message: String::new(),
            retry_after: Some(Duration::from_secs(300)),
        };
        assert_eq!(err.user_message(), "Too many failed attempts - Wait 300s");
    }

    #[test]
    fn transport_messages_distinguish_connectivity() {
        let offline = BrokerError::TransportError {
            status: None,
            message: "dns".into(),
        };
        assert_eq!(offline.user_message(), "Cannot connect - Check internet");
        let server = BrokerError::TransportError {
            status: Some(502),
            message: "bad gateway".into(),
        };
        assert_eq!(server.user_message(), "Connection failed - Try again");
    }

    #[test]
    fn recently_used_reports_remaining_wait() {
        let err = BrokerError::RecentlyUsed {
            elapsed: Duration::from_secs(2),
            wait: Duration::from_secs(3),
        };
        assert_eq!(err.user_message(), "Wait 3s before retrying same code");
    }
}
