pub mod auth;
pub mod rest;
pub mod types;

use crate::engine::project::{Build, Project};
use async_trait::async_trait;
use auth::{Credentials, Session};
use thiserror::Error;

/// Typed contract for the CI provider. Every call resolves exactly once.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ClientError>;
    async fn fetch_projects(&self, session: &Session) -> Result<Vec<Project>, ClientError>;
    async fn fetch_builds(&self, session: &Session, project: &Project) -> Result<Vec<Build>, ClientError>;
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Bad or expired credentials. Any HTTP 401 lands here.
    #[error("unauthorized")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(#[from] NetworkCause),
    /// Payload did not match the expected document shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum NetworkCause {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Cloneable classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    Network,
    InvalidResponse,
}

impl ClientError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ClientError::Unauthorized => FailureKind::Unauthorized,
            ClientError::Network(_) => FailureKind::Network,
            ClientError::InvalidResponse(_) => FailureKind::InvalidResponse,
        }
    }

    /// Transient failures are worth another attempt on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Network(NetworkCause::Transport(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(ClientError::Unauthorized.kind(), FailureKind::Unauthorized);
        assert_eq!(
            ClientError::InvalidResponse("missing id".into()).kind(),
            FailureKind::InvalidResponse
        );
        let status = ClientError::from(NetworkCause::Status { status: 503, body: String::new() });
        assert_eq!(status.kind(), FailureKind::Network);
    }

    #[test]
    fn test_only_network_failures_are_retryable() {
        let status = ClientError::from(NetworkCause::Status { status: 500, body: "boom".into() });
        assert!(status.is_retryable());
        assert!(!ClientError::Unauthorized.is_retryable());
        assert!(!ClientError::InvalidResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_status_cause_display() {
        let e = ClientError::from(NetworkCause::Status { status: 502, body: "bad gateway".into() });
        assert_eq!(e.to_string(), "network error: HTTP 502: bad gateway");
    }
}
