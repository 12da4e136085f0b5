use super::VideoError;
use async_trait::async_trait;
use authority_proto::VideoCredentials;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Adaptive,
    Landscape,
    Portrait,
}

/// Encode/decode parameters. Fixed for the life of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncoderProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    pub min_bitrate_kbps: u32,
    pub orientation: Orientation,
}

pub const VIEWER_PROFILE: EncoderProfile = EncoderProfile {
    width: 1280,
    height: 720,
    frame_rate: 30,
    bitrate_kbps: 2000,
    min_bitrate_kbps: 1000,
    orientation: Orientation::Adaptive,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Receives remote streams, never publishes camera or microphone.
    Audience,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_id: String,
    pub channel_name: String,
    /// Empty when the channel runs without token security.
    pub token: String,
    pub role: ClientRole,
}

impl JoinRequest {
    pub fn viewer(credentials: &VideoCredentials) -> Result<Self, VideoError> {
        if credentials.app_id.trim().is_empty() {
            return Err(VideoError::InvalidCredentials("app_id"));
        }
        if credentials.channel_name.trim().is_empty() {
            return Err(VideoError::InvalidCredentials("channel_name"));
        }
        Ok(Self {
            app_id: credentials.app_id.clone(),
            channel_name: credentials.channel_name.clone(),
            token: credentials.token.clone().unwrap_or_default(),
            role: ClientRole::Audience,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerLeaveReason {
    Quit,
    Dropped,
}

/// Callbacks from the underlying engine, delivered as a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    JoinConfirmed { uid: u32 },
    LeaveConfirmed,
    PeerJoined { uid: u32 },
    PeerOffline { uid: u32, reason: PeerLeaveReason },
    FirstFrame { uid: u32, width: u32, height: u32 },
    Decoding { uid: u32 },
    Frame { uid: u32 },
    Frozen { uid: u32 },
    /// 0 unknown, 1 excellent through 6 down.
    NetworkQuality { uid: u32, rx_quality: u8 },
    ConnectionLost,
    ConnectionFailed { reason: String },
    Error { code: i32, message: String },
}

/// Opaque video engine. Requests return once issued; completion arrives
/// as an [`EngineEvent`].
#[async_trait]
pub trait VideoEngine: Send + Sync {
    async fn initialize(&self, app_id: &str, profile: &EncoderProfile) -> Result<(), VideoError>;

    async fn join(&self, request: &JoinRequest) -> Result<(), VideoError>;

    async fn leave(&self) -> Result<(), VideoError>;

    /// Leave from a thread with no runtime. Returns whether the engine
    /// confirmed within `budget`.
    fn leave_blocking(&self, budget: Duration) -> bool;

    fn events(&self) -> broadcast::Receiver<EngineEvent>;
}
