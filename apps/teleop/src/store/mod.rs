//! Path-addressed key/value store the session records live in.

pub mod firebase;
pub mod memory;

pub use firebase::FirebaseConnector;
pub use memory::{MemoryConnector, MemoryStore, StoreWrite};

use async_trait::async_trait;
use authority_proto::DataStoreCredentials;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store write timed out")]
    Timeout,
    #[error("store returned http {status}")]
    Status { status: u16 },
    #[error("store network error: {0}")]
    Network(String),
    #[error("store sign-in failed: {0}")]
    SignIn(String),
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    #[error("store rejected the write: {0}")]
    Rejected(String),
    #[error("unable to encode record: {0}")]
    Encode(String),
}

/// Serialize a record for a `set` call.
pub fn encode<T: serde::Serialize>(record: &T) -> Result<Value, StoreError> {
    serde_json::to_value(record).map_err(|err| StoreError::Encode(err.to_string()))
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if let Some(status) = err.status() {
            StoreError::Status {
                status: status.as_u16(),
            }
        } else {
            StoreError::Network(err.to_string())
        }
    }
}

/// Single-value overwrite semantics: `set` replaces whatever sits at `path`.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, path: &str) -> Result<(), StoreError>;
}

/// A signed-in handle on the store plus the identity it writes as.
#[derive(Clone)]
pub struct StoreSession {
    pub store: Arc<dyn DataStore>,
    pub operator_id: String,
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, credentials: &DataStoreCredentials)
    -> Result<StoreSession, StoreError>;
}
