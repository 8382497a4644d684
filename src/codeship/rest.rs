use super::auth::{Credentials, Session};
use super::types::*;
use super::{ClientError, NetworkCause, RemoteClient};
use crate::engine::project::{Build, Project};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub struct CodeshipRest {
    client: Client,
    base_url: String,
}

impl CodeshipRest {
    pub fn new(base_url: &str, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Authenticated GET returning a parsed document.
    async fn get_authed<T: DeserializeOwned>(&self, session: &Session, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", session.bearer())
            .header("Accept", "application/json")
            .send()
            .await?;
        read_document(resp, path).await
    }
}

/// Classify a response: 401 is always `Unauthorized`, other non-2xx are
/// network failures, and a body that does not parse is `InvalidResponse`.
async fn read_document<T: DeserializeOwned>(resp: Response, path: &str) -> Result<T, ClientError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(NetworkCause::Status { status: status.as_u16(), body }.into());
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ClientError::InvalidResponse(format!("{}: {}", path, e)))
}

fn session_from(doc: AuthResponse) -> Result<Session, ClientError> {
    if doc.access_token.is_empty() || !doc.expires_at.is_finite() {
        return Err(ClientError::InvalidResponse("auth: empty session".to_string()));
    }
    let expires_at = DateTime::<Utc>::from_timestamp(doc.expires_at.trunc() as i64, 0)
        .ok_or_else(|| ClientError::InvalidResponse(format!("auth: bad expires_at {}", doc.expires_at)))?;
    Ok(Session::new(doc.access_token, expires_at))
}

#[async_trait]
impl RemoteClient for CodeshipRest {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ClientError> {
        if credentials.is_blank() {
            return Err(ClientError::Unauthorized);
        }
        let header = match credentials {
            Credentials::ApiKey { key } => return Ok(Session::from_api_key(key)),
            Credentials::Password { .. } => match credentials.basic_authorization() {
                Some(h) => h,
                None => return Err(ClientError::Unauthorized),
            },
        };

        let path = "/auth";
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", header)
            .header("Accept", "application/json")
            .send()
            .await?;
        let doc: AuthResponse = read_document(resp, path).await?;
        let session = session_from(doc)?;
        tracing::debug!(expires_at = %session.expires_at, "authenticated with Codeship");
        Ok(session)
    }

    async fn fetch_projects(&self, session: &Session) -> Result<Vec<Project>, ClientError> {
        let doc: ProjectsResponse = self.get_authed(session, "/projects").await?;
        let projects = doc.into_projects().map_err(ClientError::InvalidResponse)?;
        tracing::debug!(count = projects.len(), "fetched projects");
        Ok(projects)
    }

    async fn fetch_builds(&self, session: &Session, project: &Project) -> Result<Vec<Build>, ClientError> {
        let path = format!("/projects/{}/builds", project.id);
        let doc: BuildsResponse = self.get_authed(session, &path).await?;
        into_builds(doc.builds).map_err(ClientError::InvalidResponse)
    }
}
