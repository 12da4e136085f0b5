use super::error::BrokerError;
use authority_proto::{AuthResponse, DataStoreCredentials, SessionInfo, VideoCredentials};

/// Scoped credentials from one successful exchange. Built whole or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub data_store: DataStoreCredentials,
    pub video: VideoCredentials,
    pub session: SessionInfo,
}

impl SessionCredentials {
    /// Adopt a success payload, refusing anything with a missing or empty
    /// required block.
    pub fn from_response(response: AuthResponse) -> Result<Self, BrokerError> {
        let data_store = response
            .data_store
            .ok_or(BrokerError::IncompleteResponse {
                missing: "data store credentials",
            })?;
        let video = response.video.ok_or(BrokerError::IncompleteResponse {
            missing: "video credentials",
        })?;
        let session = response
            .session_info
            .ok_or(BrokerError::IncompleteResponse {
                missing: "session info",
            })?;

        let required = [
            (data_store.endpoint.as_str(), "data store endpoint"),
            (data_store.api_key.as_str(), "data store api key"),
            (video.app_id.as_str(), "video app id"),
            (video.channel_name.as_str(), "video channel"),
            (session.session_code.as_str(), "session code"),
            (session.robot_id.as_str(), "robot id"),
            (session.connection_token.as_str(), "connection token"),
        ];
        if let Some(&(_, missing)) = required.iter().find(|(value, _)| value.trim().is_empty()) {
            return Err(BrokerError::IncompleteResponse { missing });
        }
        if session.expires_at == 0 {
            return Err(BrokerError::IncompleteResponse {
                missing: "session expiry",
            });
        }

        Ok(Self {
            data_store,
            video,
            session,
        })
    }

    pub fn session_code(&self) -> &str {
        &self.session.session_code
    }

    pub fn robot_id(&self) -> &str {
        &self.session.robot_id
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.session.expires_at
    }

    /// Video token, empty when the channel runs without token security.
    pub fn video_token(&self) -> &str {
        self.video.token.as_deref().unwrap_or("")
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::response;
    use super::*;

    #[test]
    fn accepts_complete_payload() {
        let creds = SessionCredentials::from_response(response("ABC123", 99)).unwrap();
        assert_eq!(creds.session_code(), "ABC123");
        assert_eq!(creds.video_token(), "");
        assert_eq!(creds.expires_at_ms(), 99);
    }

    #[test]
    fn missing_video_block_is_incomplete() {
        let mut payload = response("ABC123", 99);
        payload.video = None;
        assert_eq!(
            SessionCredentials::from_response(payload),
            Err(BrokerError::IncompleteResponse {
                missing: "video credentials"
            })
        );
    }

    #[test]
    fn empty_required_field_is_incomplete() {
        let mut payload = response("ABC123", 99);
        if let Some(info) = payload.session_info.as_mut() {
            info.robot_id = " ".into();
        }
        assert_eq!(
            SessionCredentials::from_response(payload),
            Err(BrokerError::IncompleteResponse {
                missing: "robot id"
            })
        );
    }
}
