use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Re-authenticate this long before a session actually expires.
const EXPIRY_SKEW_SECS: i64 = 30;

/// User-supplied credentials. Opaque to everything but the remote client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    Password { email: String, password: String },
    ApiKey { key: String },
}

impl Credentials {
    /// True when there is nothing to authenticate with.
    pub fn is_blank(&self) -> bool {
        match self {
            Credentials::Password { email, password } => {
                email.trim().is_empty() || password.is_empty()
            }
            Credentials::ApiKey { key } => key.trim().is_empty(),
        }
    }

    /// `Authorization` header value for the auth endpoint.
    pub fn basic_authorization(&self) -> Option<String> {
        match self {
            Credentials::Password { email, password } if !self.is_blank() => {
                let raw = format!("{}:{}", email, password);
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }
}

// Keep secrets out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .field("password", &"***")
                .finish(),
            Credentials::ApiKey { .. } => f.debug_struct("ApiKey").field("key", &"***").finish(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(access_token: String, expires_at: DateTime<Utc>) -> Self {
        Self { access_token, expires_at }
    }

    /// Session for an API key: the key itself is the bearer token and never expires.
    pub fn from_api_key(key: &str) -> Self {
        Self {
            access_token: key.trim().to_string(),
            expires_at: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match now.checked_add_signed(Duration::seconds(EXPIRY_SKEW_SECS)) {
            Some(deadline) => deadline >= self.expires_at,
            None => true,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
