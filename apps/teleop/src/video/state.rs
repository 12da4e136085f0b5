use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoState {
    Idle,
    Joining,
    WaitingForPeer,
    Streaming,
    Reconnecting,
    Disconnecting,
    /// Terminal until a full leave and join.
    Failed,
}

impl VideoState {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoState::Idle => "idle",
            VideoState::Joining => "joining",
            VideoState::WaitingForPeer => "waiting_for_peer",
            VideoState::Streaming => "streaming",
            VideoState::Reconnecting => "reconnecting",
            VideoState::Disconnecting => "disconnecting",
            VideoState::Failed => "failed",
        }
    }

    /// Joined at the engine level, whether or not frames flow.
    pub fn is_joined(self) -> bool {
        matches!(self, VideoState::WaitingForPeer | VideoState::Streaming)
    }
}

impl fmt::Display for VideoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
