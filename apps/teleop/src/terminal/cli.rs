use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ConfigError, TeleopConfig, normalize_url};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "teleop",
    about = "Drive a robot session from the terminal",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[arg(
        long = "metrics-dump",
        global = true,
        env = "TELEOP_METRICS_DUMP",
        help = "Print the metrics exposition to stderr on exit"
    )]
    pub metrics_dump: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "TELEOP_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "TELEOP_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

/// Flags layered over the `TELEOP_*` environment.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigOverrides {
    #[arg(
        long = "auth-url",
        global = true,
        value_name = "URL",
        help = "Authority endpoint that exchanges pairing codes"
    )]
    pub auth_url: Option<String>,

    #[arg(
        long = "disconnect-url",
        global = true,
        value_name = "URL",
        help = "Authority endpoint that releases a session"
    )]
    pub disconnect_url: Option<String>,

    #[arg(
        long = "rate",
        global = true,
        value_name = "HZ",
        help = "Command publish rate (1-30 Hz)"
    )]
    pub rate_hz: Option<u32>,

    #[arg(
        long = "platform",
        global = true,
        value_name = "NAME",
        help = "Platform tag written into status and command records"
    )]
    pub platform: Option<String>,

    #[arg(
        long = "no-video-reconnect",
        global = true,
        help = "Do not retry the video channel after a lost stream"
    )]
    pub no_video_reconnect: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut TeleopConfig) -> Result<(), ConfigError> {
        if let Some(raw) = self.auth_url.as_deref() {
            config.authority.auth_url = normalize_url("auth_url", raw)?;
        }
        if let Some(raw) = self.disconnect_url.as_deref() {
            config.authority.disconnect_url = normalize_url("disconnect_url", raw)?;
        }
        if let Some(rate) = self.rate_hz {
            config.command.rate_hz = rate;
        }
        if let Some(platform) = self.platform.as_ref() {
            config.command.platform = platform.clone();
        }
        if self.no_video_reconnect {
            config.video.auto_reconnect = false;
        }
        config.validate()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pair with a robot and drive it from the keyboard
    Connect(ConnectArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    #[arg(
        long,
        short = 'c',
        env = "TELEOP_CODE",
        value_name = "CODE",
        help = "Six character pairing code shown on the robot"
    )]
    pub code: String,

    #[arg(
        long = "tap-hold-ms",
        value_name = "MS",
        help = "How long one key press keeps a direction held"
    )]
    pub tap_hold_ms: Option<u64>,
}
