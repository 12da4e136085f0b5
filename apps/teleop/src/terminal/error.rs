use crate::auth::AuthorityError;
use crate::config::ConfigError;
use crate::session::SessionError;
use crate::store::StoreError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("authority client error: {0}")]
    Authority(#[from] AuthorityError),
    #[error("data store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("disconnect did not finish: {0}")]
    Shutdown(String),
}

impl CliError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            _ => 1,
        }
    }
}
