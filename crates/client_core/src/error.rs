use std::time::Duration;

use shared::{domain::TempId, error::ApiException};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("server rejected request: {0}")]
    Api(#[from] ApiException),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl RestError {
    /// Errors that are worth retrying without user involvement.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            Self::Timeout(_) => true,
            Self::Api(err) => err.code.is_transient(),
            Self::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no outbound message with temp id {0}")]
    UnknownMessage(TempId),
    #[error("cannot {action} a message that is {from}")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },
}
