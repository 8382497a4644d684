use crate::codeship::auth::Credentials;
use crate::codeship::rest::CodeshipRest;
use crate::codeship::RemoteClient;
use crate::config::Config;
use crate::engine::{RefreshOutcome, Scheduler, SyncProvider};
use crate::settings::persistence::{EnvFileSecrets, TomlFileBackend};
use crate::settings::{SettingsDefaults, SettingsStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// One per process. Owns the settings store, provider and scheduler and
/// wires their subscriptions.
pub struct Core {
    pub settings: Arc<SettingsStore>,
    pub provider: Arc<SyncProvider>,
    pub scheduler: Arc<Scheduler>,
    client: Arc<dyn RemoteClient>,
}

impl Core {
    pub fn new(settings: Arc<SettingsStore>, client: Arc<dyn RemoteClient>, runtime: Handle) -> Self {
        let provider = SyncProvider::new(client.clone(), settings.clone(), runtime.clone());
        provider.watch_settings();
        let scheduler = Scheduler::new(provider.clone(), settings.clone(), runtime);
        scheduler.watch_settings();
        Self { settings, provider, scheduler, client }
    }

    /// File-backed settings and the live Codeship client. `credentials`,
    /// when given and different from the stored ones, are saved before the
    /// engine is wired so they do not trigger a refresh of their own.
    pub fn from_config(config: &Config, runtime: Handle, credentials: Option<Credentials>) -> Result<Self> {
        let settings = open_settings(config)?;
        if let Some(credentials) = credentials {
            if settings.credentials().as_ref() != Some(&credentials) {
                tracing::info!("using credentials from the environment");
                if let Err(e) = settings.set_credentials(Some(credentials)) {
                    tracing::error!(error = %e, "could not persist environment credentials");
                }
            }
        }
        let rest = open_client(config)?;
        Ok(Self::new(Arc::new(settings), Arc::new(rest), runtime))
    }

    /// Settings startup, arm the timer, then refresh once without waiting
    /// for the first tick.
    pub async fn start(&self) -> RefreshOutcome {
        if let Err(e) = self.settings.startup() {
            tracing::error!(error = %e, "failed to record first launch");
        }
        self.scheduler.start_timer();
        self.provider.refresh().await
    }

    /// Verify `credentials` against Codeship before storing them. Storing
    /// publishes `ApiKey`, which triggers a refresh.
    pub async fn sign_in(&self, credentials: Credentials) -> Result<()> {
        verify_and_store(self.client.as_ref(), &self.settings, credentials).await
    }

    /// Stop the timer and detach from settings changes.
    pub fn shutdown(&self) {
        self.scheduler.unwatch_settings();
        self.provider.unwatch_settings();
        self.scheduler.stop();
    }
}

/// Verify and store credentials without starting the engine, for one-shot
/// sign-in from the command line.
pub async fn sign_in(config: &Config, credentials: Credentials) -> Result<()> {
    let settings = open_settings(config)?;
    let rest = open_client(config)?;
    verify_and_store(&rest, &settings, credentials).await
}

async fn verify_and_store(client: &dyn RemoteClient, settings: &SettingsStore, credentials: Credentials) -> Result<()> {
    client
        .authenticate(&credentials)
        .await
        .context("Codeship rejected the sign-in")?;
    settings
        .set_credentials(Some(credentials))
        .context("Signed in, but the credentials could not be saved")?;
    tracing::info!("credentials stored");
    Ok(())
}

fn open_settings(config: &Config) -> Result<SettingsStore> {
    let backend = TomlFileBackend::open(&config.storage.settings_path)
        .with_context(|| format!("Failed to open settings: {}", config.storage.settings_path.display()))?;
    let secrets = EnvFileSecrets::new(&config.storage.credentials_path);
    let defaults = SettingsDefaults {
        refresh_interval_secs: config.sync.default_refresh_interval_s,
    };
    SettingsStore::load(Arc::new(backend), Arc::new(secrets), defaults).context("Failed to load settings")
}

fn open_client(config: &Config) -> Result<CodeshipRest> {
    let timeout = Duration::from_millis(config.codeship.request_timeout_ms);
    let rest = CodeshipRest::new(&config.codeship.api_base, timeout).context("Failed to build HTTP client")?;
    tracing::debug!(api_base = rest.base_url(), "Codeship client ready");
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SchedulerState;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::path::Path;

    fn config_in(dir: &Path, api_base: &str) -> Config {
        let path = |name: &str| dir.join(name).display().to_string().replace('\\', "/");
        Config::parse(&format!(
            r#"
[codeship]
api_base = "{}"

[sync]
default_refresh_interval_s = 90

[storage]
settings_path = "{}"
credentials_path = "{}"
"#,
            api_base,
            path("settings.toml"),
            path("creds"),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_from_config_uses_storage_paths_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), "http://127.0.0.1:9");

        let core = Core::from_config(&config, Handle::current(), None).unwrap();
        assert_eq!(core.settings.refresh_interval_secs(), 90);
        assert!(core.settings.credentials().is_none());
        assert_eq!(core.scheduler.state(), SchedulerState::Idle);

        core.settings.set_refresh_interval_secs(45).unwrap();
        assert!(dir.path().join("settings.toml").exists());
        core.shutdown();
    }

    #[tokio::test]
    async fn test_environment_credentials_do_not_cause_extra_fetch() {
        let server = MockServer::start_async().await;
        let projects = server
            .mock_async(|when, then| {
                when.method(GET).path("/projects").header("Authorization", "Bearer env-key");
                then.status(200).json_body(json!({ "projects": [] }));
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &server.base_url());

        let creds = Credentials::ApiKey { key: "env-key".into() };
        let core = Core::from_config(&config, Handle::current(), Some(creds.clone())).unwrap();
        assert_eq!(core.settings.credentials(), Some(creds));

        assert_eq!(core.start().await, RefreshOutcome::Updated { projects: 0 });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(projects.hits_async().await, 1);
        core.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_detaches_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), "http://127.0.0.1:9");
        let core = Core::from_config(&config, Handle::current(), None).unwrap();

        core.shutdown();
        core.settings.set_refresh_interval_secs(30).unwrap();
        assert_eq!(core.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_sign_in_stores_verified_credentials() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth");
                then.status(200).json_body(json!({ "access_token": "tok", "expires_at": 4_000_000_000u64 }));
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &server.base_url());
        let creds = Credentials::Password { email: "dev@example.com".into(), password: "pw".into() };

        sign_in(&config, creds.clone()).await.unwrap();

        let reopened = Core::from_config(&config, Handle::current(), None).unwrap();
        assert_eq!(reopened.settings.credentials(), Some(creds));
    }
}
