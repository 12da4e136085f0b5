//! Shared wire definitions for operator ↔ authority ↔ robot communication.
//! Keeping this in a dedicated crate lets the robot runtime and the dashboards
//! decode the same records without pulling in the operator client.

use serde::{Deserialize, Serialize};

pub const SESSIONS_ROOT: &str = "sessions";
pub const CONNECTION_STATUS_KEY: &str = "connection_status";
pub const COMMAND_SLOT_KEY: &str = "robot_commands/latest";
pub const CONNECTION_PROBE_PATH: &str = "connection_test";

pub fn session_path(session_code: &str) -> String {
    format!("{SESSIONS_ROOT}/{session_code}")
}

pub fn connection_status_path(session_code: &str) -> String {
    format!("{SESSIONS_ROOT}/{session_code}/{CONNECTION_STATUS_KEY}")
}

pub fn command_slot_path(session_code: &str) -> String {
    format!("{SESSIONS_ROOT}/{session_code}/{COMMAND_SLOT_KEY}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub session_code: String,
    /// Token from the previous successful exchange, empty on first contact.
    #[serde(default)]
    pub connection_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "firebase")]
    pub data_store: Option<DataStoreCredentials>,
    #[serde(default, rename = "agora")]
    pub video: Option<VideoCredentials>,
    #[serde(default)]
    pub session_info: Option<SessionInfo>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_after: Option<u64>,
}

impl AuthResponse {
    /// Server supplied explanation, preferring `error` over `message`.
    pub fn reason(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStoreCredentials {
    #[serde(rename = "databaseURL", alias = "databaseUrl")]
    pub endpoint: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "storageBucket", default)]
    pub storage_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCredentials {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "channel")]
    pub channel_name: String,
    /// Optional: channels without token security accept an empty string.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_code: String,
    pub robot_id: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
    #[serde(default)]
    pub agora_channel: Option<String>,
    pub connection_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub session_code: String,
    pub robot_id: String,
    pub connection_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Value stored at `sessions/{code}/connection_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusRecord {
    pub status: ConnectionStatus,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
}

/// Value stored at `sessions/{code}/robot_commands/latest`. The robot reads only
/// the most recent value; there is no queue and no acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp: u64,
    pub seq: u64,
    pub walk_forward: bool,
    pub walk_backward: bool,
    pub strafe_left: bool,
    pub strafe_right: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub emergency_stop: bool,
    pub source: String,
    pub robot_id: String,
    pub session_code: String,
    pub operator_id: String,
    pub input_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl CommandRecord {
    pub fn is_moving(&self) -> bool {
        self.walk_forward
            || self.walk_backward
            || self.strafe_left
            || self.strafe_right
            || self.turn_left
            || self.turn_right
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProbe {
    pub timestamp: u64,
    pub platform: String,
    pub test: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_response_tolerates_null_video_block() {
        let payload = json!({
            "success": true,
            "firebase": {
                "databaseURL": "https://db.example",
                "projectId": "proj",
                "apiKey": "key",
                "appId": "app",
                "storageBucket": "bucket"
            },
            "agora": null,
            "session_info": {
                "session_code": "ABC123",
                "robot_id": "hexa-01",
                "expires_at": 1_700_000_000_000u64,
                "agora_channel": "hexa-01",
                "connection_token": "tok"
            }
        });
        let parsed: AuthResponse = serde_json::from_value(payload).expect("decodes");
        assert!(parsed.success);
        assert!(parsed.video.is_none());
        assert_eq!(
            parsed.data_store.as_ref().map(|c| c.endpoint.as_str()),
            Some("https://db.example")
        );
        assert_eq!(parsed.session_info.unwrap().robot_id, "hexa-01");
    }

    #[test]
    fn reason_prefers_error_over_message() {
        let response = AuthResponse {
            error: Some("Session expired. Robot must generate new code.".into()),
            message: Some("ignored".into()),
            ..AuthResponse::default()
        };
        assert_eq!(
            response.reason(),
            Some("Session expired. Robot must generate new code.")
        );
        assert_eq!(AuthResponse::default().reason(), None);
    }

    #[test]
    fn command_record_serializes_flat_field_names() {
        let record = CommandRecord {
            timestamp: 42,
            seq: 7,
            walk_forward: true,
            source: "operator".into(),
            input_method: "keyboard".into(),
            ..CommandRecord::default()
        };
        let value = serde_json::to_value(&record).expect("encodes");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["walk_forward"], true);
        assert_eq!(value["emergency_stop"], false);
        assert!(value.get("platform").is_none());
        assert!(record.is_moving());
    }

    #[test]
    fn status_record_omits_absent_fields() {
        let record = ConnectionStatusRecord {
            status: ConnectionStatus::Disconnected,
            timestamp: 1,
            reason: Some("user_disconnect".into()),
            platform: None,
            operator_id: None,
        };
        let value = serde_json::to_value(&record).expect("encodes");
        assert_eq!(value["status"], "disconnected");
        assert_eq!(value["reason"], "user_disconnect");
        assert!(value.get("operator_id").is_none());
    }

    #[test]
    fn paths_follow_session_layout() {
        assert_eq!(
            connection_status_path("ABC123"),
            "sessions/ABC123/connection_status"
        );
        assert_eq!(
            command_slot_path("ABC123"),
            "sessions/ABC123/robot_commands/latest"
        );
        assert_eq!(session_path("ABC123"), "sessions/ABC123");
    }
}
