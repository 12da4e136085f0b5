//! Realtime-database REST client with anonymous operator sign-in.

use super::{DataStore, StoreConnector, StoreError, StoreSession};
use crate::config::StoreConfig;
use async_trait::async_trait;
use authority_proto::DataStoreCredentials;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const DEFAULT_IDENTITY_BASE: &str = "https://identitytoolkit.googleapis.com/v1/";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignUpRequest {
    return_secure_token: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpResponse {
    id_token: String,
    local_id: String,
}

pub struct FirebaseConnector {
    client: reqwest::Client,
    config: StoreConfig,
    identity_base: Url,
}

impl FirebaseConnector {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let identity_base = Url::parse(DEFAULT_IDENTITY_BASE)
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        Self::with_identity_base(config, identity_base)
    }

    pub fn with_identity_base(config: StoreConfig, identity_base: Url) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(config.signin_timeout)
            .build()
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        Ok(Self {
            client,
            config,
            identity_base,
        })
    }

    async fn sign_up(&self, api_key: &str) -> Result<SignUpResponse, StoreError> {
        let mut endpoint = self
            .identity_base
            .join("./accounts:signUp")
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        endpoint.query_pairs_mut().append_pair("key", api_key);

        let request = self
            .client
            .post(endpoint)
            .json(&SignUpRequest {
                return_secure_token: true,
            })
            .send();
        let response = tokio::time::timeout(self.config.signin_timeout, request)
            .await
            .map_err(|_| StoreError::Timeout)??;
        if !response.status().is_success() {
            return Err(StoreError::SignIn(format!(
                "identity service returned http {}",
                response.status().as_u16()
            )));
        }
        response
            .json::<SignUpResponse>()
            .await
            .map_err(|err| StoreError::SignIn(err.to_string()))
    }
}

#[async_trait]
impl StoreConnector for FirebaseConnector {
    async fn connect(
        &self,
        credentials: &DataStoreCredentials,
    ) -> Result<StoreSession, StoreError> {
        let endpoint = database_root(&credentials.endpoint)?;

        let attempts = self.config.signin_attempts.max(1);
        let mut last_error = StoreError::SignIn("no attempt made".into());
        for attempt in 1..=attempts {
            match self.sign_up(&credentials.api_key).await {
                Ok(account) => {
                    info!(
                        target: "teleop::store",
                        attempt,
                        operator = %short_id(&account.local_id),
                        "operator signed in"
                    );
                    let store = FirebaseStore {
                        client: self.client.clone(),
                        endpoint,
                        id_token: account.id_token,
                    };
                    return Ok(StoreSession {
                        store: Arc::new(store),
                        operator_id: account.local_id,
                    });
                }
                Err(err) => {
                    warn!(
                        target: "teleop::store",
                        attempt,
                        attempts,
                        error = %err,
                        "operator sign-in failed"
                    );
                    last_error = err;
                    if attempt < attempts {
                        tokio::time::sleep(self.config.signin_retry_delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }
}

pub struct FirebaseStore {
    client: reqwest::Client,
    endpoint: Url,
    id_token: String,
}

impl FirebaseStore {
    fn url_for(&self, path: &str) -> Result<Url, StoreError> {
        let mut url = self
            .endpoint
            .join(&format!("./{}.json", path.trim_matches('/')))
            .map_err(|err| StoreError::InvalidConfig(err.to_string()))?;
        url.query_pairs_mut().append_pair("auth", &self.id_token);
        Ok(url)
    }
}

#[async_trait]
impl DataStore for FirebaseStore {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let response = self.client.put(self.url_for(path)?).json(&value).send().await?;
        check_status(response.status())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let response = self.client.delete(self.url_for(path)?).send().await?;
        check_status(response.status())
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), StoreError> {
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(StoreError::Rejected(format!("permission denied (http {})", status.as_u16())))
    } else {
        Err(StoreError::Status {
            status: status.as_u16(),
        })
    }
}

/// Database root with a trailing slash so relative joins keep the full path.
fn database_root(raw: &str) -> Result<Url, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidConfig("database url is empty".into()));
    }
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|err| StoreError::InvalidConfig(err.to_string()))
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_root_keeps_nested_paths() {
        let root = database_root("https://demo-rtdb.example.com").unwrap();
        let store = FirebaseStore {
            client: reqwest::Client::new(),
            endpoint: root,
            id_token: "tok en".into(),
        };
        let url = store.url_for("sessions/ABC123/connection_status").unwrap();
        assert_eq!(
            url.as_str(),
            "https://demo-rtdb.example.com/sessions/ABC123/connection_status.json?auth=tok+en"
        );
    }

    #[test]
    fn empty_database_url_is_rejected() {
        assert!(matches!(
            database_root("  "),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn permission_errors_are_rejections() {
        assert!(check_status(reqwest::StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(reqwest::StatusCode::UNAUTHORIZED),
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(
            check_status(reqwest::StatusCode::SERVICE_UNAVAILABLE),
            Err(StoreError::Status { status: 503 })
        );
    }

    #[test]
    fn short_id_tolerates_short_values() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789"), "01234567");
    }
}
