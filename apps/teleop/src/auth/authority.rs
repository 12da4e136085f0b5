use super::error::AuthorityError;
use async_trait::async_trait;
use authority_proto::{AuthRequest, AuthResponse, DisconnectRequest, DisconnectResponse};
use std::time::Duration;
use url::Url;

/// The remote service that issues and revokes session credentials.
#[async_trait]
pub trait AuthorityBackend: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResponse, AuthorityError>;

    async fn disconnect(
        &self,
        request: &DisconnectRequest,
    ) -> Result<DisconnectResponse, AuthorityError>;

    /// Blocking variant for process teardown. Must not be called from inside
    /// an async runtime thread.
    fn disconnect_blocking(
        &self,
        request: &DisconnectRequest,
        timeout: Duration,
    ) -> Result<DisconnectResponse, AuthorityError>;
}

pub struct ReqwestAuthority {
    client: reqwest::Client,
    auth_url: Url,
    disconnect_url: Url,
}

impl ReqwestAuthority {
    pub fn new(auth_url: Url, disconnect_url: Url) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            auth_url,
            disconnect_url,
        })
    }
}

#[async_trait]
impl AuthorityBackend for ReqwestAuthority {
    async fn authenticate(&self, request: &AuthRequest) -> Result<AuthResponse, AuthorityError> {
        let response = self
            .client
            .post(self.auth_url.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<AuthResponse>().await.ok();
            return Err(AuthorityError::Status {
                status: status.as_u16(),
                reason: body.as_ref().and_then(|b| b.reason().map(str::to_string)),
                retry_after: body.and_then(|b| b.retry_after),
            });
        }
        Ok(response.json::<AuthResponse>().await?)
    }

    async fn disconnect(
        &self,
        request: &DisconnectRequest,
    ) -> Result<DisconnectResponse, AuthorityError> {
        let response = self
            .client
            .post(self.disconnect_url.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.json::<DisconnectResponse>().await.ok();
            return Err(AuthorityError::Status {
                status: status.as_u16(),
                reason: body.and_then(|b| b.error.or(b.message)),
                retry_after: None,
            });
        }
        Ok(response.json::<DisconnectResponse>().await?)
    }

    fn disconnect_blocking(
        &self,
        request: &DisconnectRequest,
        timeout: Duration,
    ) -> Result<DisconnectResponse, AuthorityError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .build()?;
        let response = client
            .post(self.disconnect_url.clone())
            .json(request)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::Status {
                status: status.as_u16(),
                reason: None,
                retry_after: None,
            });
        }
        Ok(response.json::<DisconnectResponse>()?)
    }
}
