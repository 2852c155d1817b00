use foliosync_exchanges::ExchangeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Credential error: {0}")]
    Credentials(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn credentials(msg: impl Into<String>) -> Self {
        Error::Credentials(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
