use serde::{Serialize, Serializer};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_AUTH_URL: &str = "http://localhost:8787/authenticate";
pub const DEFAULT_DISCONNECT_URL: &str = "http://localhost:8787/disconnect";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} is not a valid url: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("{var}={value} could not be parsed")]
    InvalidValue { var: String, value: String },
    #[error("{field}={value} is outside {range}")]
    OutOfRange {
        field: &'static str,
        value: String,
        range: &'static str,
    },
}

/// Effective client configuration. Every group carries the documented defaults.
#[derive(Debug, Clone, Serialize, Default)]
pub struct TeleopConfig {
    pub authority: AuthorityConfig,
    pub store: StoreConfig,
    pub command: CommandConfig,
    pub input: InputConfig,
    pub video: VideoConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorityConfig {
    #[serde(serialize_with = "display")]
    pub auth_url: Url,
    #[serde(serialize_with = "display")]
    pub disconnect_url: Url,
    #[serde(serialize_with = "secs")]
    pub exchange_timeout: Duration,
    #[serde(serialize_with = "secs")]
    pub revoke_timeout: Duration,
    /// Local window in which the same pairing code is refused.
    #[serde(serialize_with = "secs")]
    pub same_code_window: Duration,
    /// Advisory wait after an unverified revoke.
    #[serde(serialize_with = "secs")]
    pub reconnect_caution: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            auth_url: Url::parse(DEFAULT_AUTH_URL).expect("default auth url parses"),
            disconnect_url: Url::parse(DEFAULT_DISCONNECT_URL)
                .expect("default disconnect url parses"),
            exchange_timeout: Duration::from_secs(20),
            revoke_timeout: Duration::from_secs(15),
            same_code_window: Duration::from_secs(5),
            reconnect_caution: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreConfig {
    pub signin_attempts: u32,
    #[serde(serialize_with = "secs")]
    pub signin_retry_delay: Duration,
    #[serde(serialize_with = "secs")]
    pub signin_timeout: Duration,
    #[serde(serialize_with = "secs")]
    pub probe_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            signin_attempts: 3,
            signin_retry_delay: Duration::from_secs(2),
            signin_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandConfig {
    pub rate_hz: u32,
    /// Publish silence after which the deadman engages.
    #[serde(serialize_with = "secs")]
    pub connection_timeout: Duration,
    /// Minimum time the stop stays latched once engaged.
    #[serde(serialize_with = "secs")]
    pub stop_hold: Duration,
    #[serde(serialize_with = "secs")]
    pub write_timeout: Duration,
    pub platform: String,
}

impl CommandConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_hz.max(1)))
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            rate_hz: 10,
            connection_timeout: Duration::from_secs(10),
            stop_hold: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            platform: env::consts::OS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InputConfig {
    pub forward_threshold: f32,
    pub strafe_threshold: f32,
    pub turn_threshold: f32,
    pub deadzone: f32,
    pub grip_stop_threshold: f32,
    pub force_keyboard: bool,
    pub editor: bool,
    pub prefer_keyboard_in_editor: bool,
    pub haptics: bool,
    pub haptic_intensity: f32,
    #[serde(serialize_with = "secs")]
    pub haptic_duration: Duration,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            forward_threshold: 0.3,
            strafe_threshold: 0.5,
            turn_threshold: 0.3,
            deadzone: 0.15,
            grip_stop_threshold: 0.8,
            force_keyboard: false,
            editor: false,
            prefer_keyboard_in_editor: true,
            haptics: true,
            haptic_intensity: 0.8,
            haptic_duration: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoConfig {
    /// Wait for the engine's join confirmation before treating the join as lost.
    #[serde(serialize_with = "secs")]
    pub join_timeout: Duration,
    #[serde(serialize_with = "secs")]
    pub leave_timeout: Duration,
    #[serde(serialize_with = "secs")]
    pub frame_timeout: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(serialize_with = "secs")]
    pub backoff_step: Duration,
    #[serde(serialize_with = "secs")]
    pub backoff_cap: Duration,
    pub auto_reconnect: bool,
    pub low_fps_threshold: f64,
}

impl VideoConfig {
    /// `attempt × step`, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step
            .saturating_mul(attempt)
            .min(self.backoff_cap)
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(15),
            leave_timeout: Duration::from_secs(5),
            frame_timeout: Duration::from_secs(15),
            max_reconnect_attempts: 5,
            backoff_step: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(10),
            auto_reconnect: true,
            low_fps_threshold: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(serialize_with = "secs")]
    pub expiry_check_interval: Duration,
    /// Hard cap for the blocking teardown run from process exit.
    #[serde(serialize_with = "secs")]
    pub shutdown_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            event_capacity: crate::events::DEFAULT_CAPACITY,
        }
    }
}

impl TeleopConfig {
    /// Defaults overlaid with `TELEOP_*` environment variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = env_string("TELEOP_AUTH_URL") {
            config.authority.auth_url = normalize_url("auth_url", &raw)?;
        }
        if let Some(raw) = env_string("TELEOP_DISCONNECT_URL") {
            config.authority.disconnect_url = normalize_url("disconnect_url", &raw)?;
        }
        if let Some(secs) = env_parse::<u64>("TELEOP_EXCHANGE_TIMEOUT_SECS")? {
            config.authority.exchange_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TELEOP_REVOKE_TIMEOUT_SECS")? {
            config.authority.revoke_timeout = Duration::from_secs(secs);
        }
        if let Some(rate) = env_parse::<u32>("TELEOP_COMMAND_RATE_HZ")? {
            config.command.rate_hz = rate;
        }
        if let Some(secs) = env_parse::<u64>("TELEOP_CONNECTION_TIMEOUT_SECS")? {
            config.command.connection_timeout = Duration::from_secs(secs);
        }
        if let Some(platform) = env_string("TELEOP_PLATFORM") {
            config.command.platform = platform;
        }
        if let Some(value) = env_parse::<f32>("TELEOP_FORWARD_THRESHOLD")? {
            config.input.forward_threshold = value;
        }
        if let Some(value) = env_parse::<f32>("TELEOP_STRAFE_THRESHOLD")? {
            config.input.strafe_threshold = value;
        }
        if let Some(value) = env_parse::<f32>("TELEOP_TURN_THRESHOLD")? {
            config.input.turn_threshold = value;
        }
        if let Some(value) = env_parse::<f32>("TELEOP_DEADZONE")? {
            config.input.deadzone = value;
        }
        if let Some(flag) = env_flag("TELEOP_FORCE_KEYBOARD") {
            config.input.force_keyboard = flag;
        }
        if let Some(flag) = env_flag("TELEOP_HAPTICS") {
            config.input.haptics = flag;
        }
        if let Some(flag) = env_flag("TELEOP_VIDEO_AUTO_RECONNECT") {
            config.video.auto_reconnect = flag;
        }
        if let Some(attempts) = env_parse::<u32>("TELEOP_VIDEO_MAX_RECONNECTS")? {
            config.video.max_reconnect_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("command.rate_hz", self.command.rate_hz, 1, 30, "1..=30 Hz")?;
        check_range(
            "input.forward_threshold",
            self.input.forward_threshold,
            0.1,
            0.9,
            "0.1..=0.9",
        )?;
        check_range(
            "input.strafe_threshold",
            self.input.strafe_threshold,
            0.1,
            0.9,
            "0.1..=0.9",
        )?;
        check_range(
            "input.turn_threshold",
            self.input.turn_threshold,
            0.1,
            0.9,
            "0.1..=0.9",
        )?;
        check_range("input.deadzone", self.input.deadzone, 0.05, 0.5, "0.05..=0.5")?;
        check_range(
            "input.haptic_intensity",
            self.input.haptic_intensity,
            0.0,
            1.0,
            "0.0..=1.0",
        )?;

        for (field, value) in [
            ("authority.exchange_timeout", self.authority.exchange_timeout),
            ("authority.revoke_timeout", self.authority.revoke_timeout),
            ("command.connection_timeout", self.command.connection_timeout),
            ("command.write_timeout", self.command.write_timeout),
            ("store.signin_timeout", self.store.signin_timeout),
            ("video.join_timeout", self.video.join_timeout),
            ("video.leave_timeout", self.video.leave_timeout),
            ("video.frame_timeout", self.video.frame_timeout),
            ("session.expiry_check_interval", self.session.expiry_check_interval),
            ("session.shutdown_timeout", self.session.shutdown_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: "0s".into(),
                    range: "> 0s",
                });
            }
        }
        if self.store.signin_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "store.signin_attempts",
                value: "0".into(),
                range: ">= 1",
            });
        }
        Ok(())
    }
}

/// Parse an authority url, adding a scheme when the operator left it out.
pub fn normalize_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Empty { field });
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{trimmed}", infer_scheme(trimmed))
    };
    Url::parse(&candidate).map_err(|err| ConfigError::InvalidUrl {
        field,
        reason: err.to_string(),
    })
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower == "0.0.0.0"
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

fn check_range<T: PartialOrd + Display>(
    field: &'static str,
    value: T,
    min: T,
    max: T,
    range: &'static str,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            range,
        });
    }
    Ok(())
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env_string(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value: raw,
            }),
    }
}

fn env_flag(var: &str) -> Option<bool> {
    env_string(var).map(|value| {
        !matches!(
            value.to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        )
    })
}

fn secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn display<S: Serializer, T: Display>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
