//! Persisted user configuration plus a typed change bus.
//!
//! Every mutation goes through a setter, which updates the in-memory value,
//! writes it to the backend, and only then notifies subscribers of that
//! field's [`SettingsEvent`]. A failed write is returned to the caller but
//! neither rolls back the value nor suppresses the notification.

pub mod persistence;

use crate::codeship::auth::Credentials;
use crate::engine::project::ProjectId;
use persistence::{PersistenceError, SecretStore, SettingsBackend};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use thiserror::Error;

/// Change notifications, one per observable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsEvent {
    ApiKey,
    RefreshRate,
    DisabledProjects,
    LaunchOnLogin,
}

/// Storage keys. Only `ApiKey` lives in the secret store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    ApiKey,
    RefreshRate,
    DisabledProjects,
    LaunchOnLogin,
    HasLaunched,
}

impl Field {
    const ALL: [Field; 5] = [
        Field::ApiKey,
        Field::RefreshRate,
        Field::DisabledProjects,
        Field::LaunchOnLogin,
        Field::HasLaunched,
    ];

    fn key(self) -> &'static str {
        match self {
            Field::ApiKey => "ApiKey",
            Field::RefreshRate => "RefreshRate",
            Field::DisabledProjects => "DisabledProjects",
            Field::LaunchOnLogin => "LaunchOnLogin",
            Field::HasLaunched => "HasLaunched",
        }
    }

    fn stored_in_secret_store(self) -> bool {
        self == Field::ApiKey
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings were applied but not saved: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub credentials: Option<Credentials>,
    pub refresh_interval_secs: u64,
    pub disabled_project_ids: BTreeSet<ProjectId>,
    pub launch_on_login: bool,
}

/// Values used when a field has never been stored.
#[derive(Debug, Clone, Copy)]
pub struct SettingsDefaults {
    pub refresh_interval_secs: u64,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self { refresh_interval_secs: 60 }
    }
}

type Handler = Arc<dyn Fn(SettingsEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<SettingsEvent, Vec<(u64, Handler)>>,
}

/// Token returned by [`SettingsStore::observe`]. Dropping it keeps the
/// handler registered; call [`Subscription::cancel`] to remove it.
pub struct Subscription {
    id: u64,
    event: SettingsEvent,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn cancel(self) {
        let Some(registry) = self.registry.upgrade() else { return };
        let Ok(mut registry) = registry.lock() else { return };
        if let Some(list) = registry.handlers.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

pub struct SettingsStore {
    backend: Arc<dyn SettingsBackend>,
    secrets: Arc<dyn SecretStore>,
    defaults: SettingsDefaults,
    state: RwLock<Settings>,
    is_first_run: RwLock<bool>,
    registry: Arc<Mutex<Registry>>,
}

impl SettingsStore {
    /// Read every field from storage. Unreadable values fall back to defaults
    /// with a warning; a storage that cannot be read at all is an error.
    pub fn load(
        backend: Arc<dyn SettingsBackend>,
        secrets: Arc<dyn SecretStore>,
        defaults: SettingsDefaults,
    ) -> Result<Self, PersistenceError> {
        let credentials = match secrets.read_secret(Field::ApiKey.key())? {
            None => None,
            Some(raw) => match serde_json::from_str::<Credentials>(&raw) {
                Ok(creds) => Some(creds),
                Err(e) => {
                    tracing::warn!(error = %e, "stored credentials unreadable, ignoring");
                    None
                }
            },
        };

        let refresh_interval_secs = match backend.read_field(Field::RefreshRate.key())? {
            None => defaults.refresh_interval_secs,
            Some(value) => decode_interval(&value).unwrap_or_else(|| {
                tracing::warn!(?value, "stored refresh rate unreadable, using default");
                defaults.refresh_interval_secs
            }),
        };

        let disabled_project_ids = match backend.read_field(Field::DisabledProjects.key())? {
            None => BTreeSet::new(),
            Some(value) => decode_ids(&value).unwrap_or_else(|| {
                tracing::warn!(?value, "stored disabled projects unreadable, ignoring");
                BTreeSet::new()
            }),
        };

        let has_launched = backend
            .read_field(Field::HasLaunched.key())?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let is_first_run = !has_launched;

        let launch_on_login = if is_first_run {
            true
        } else {
            backend
                .read_field(Field::LaunchOnLogin.key())?
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        };

        Ok(Self {
            backend,
            secrets,
            defaults,
            state: RwLock::new(Settings {
                credentials,
                refresh_interval_secs,
                disabled_project_ids,
                launch_on_login,
            }),
            is_first_run: RwLock::new(is_first_run),
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    // --- getters -----------------------------------------------------------

    pub fn snapshot(&self) -> Settings {
        self.read(|s| s.clone())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.read(|s| s.credentials.clone())
    }

    pub fn refresh_interval_secs(&self) -> u64 {
        self.read(|s| s.refresh_interval_secs)
    }

    pub fn disabled_project_ids(&self) -> BTreeSet<ProjectId> {
        self.read(|s| s.disabled_project_ids.clone())
    }

    pub fn launch_on_login(&self) -> bool {
        self.read(|s| s.launch_on_login)
    }

    pub fn is_first_run(&self) -> bool {
        match self.is_first_run.read() {
            Ok(v) => *v,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    // --- setters -----------------------------------------------------------

    pub fn set_credentials(&self, credentials: Option<Credentials>) -> Result<(), SettingsError> {
        self.commit(Field::ApiKey, SettingsEvent::ApiKey, |s| s.credentials = credentials)
    }

    pub fn set_refresh_interval_secs(&self, secs: u64) -> Result<(), SettingsError> {
        self.commit(Field::RefreshRate, SettingsEvent::RefreshRate, |s| {
            s.refresh_interval_secs = secs
        })
    }

    pub fn set_disabled_project_ids(&self, ids: BTreeSet<ProjectId>) -> Result<(), SettingsError> {
        self.commit(Field::DisabledProjects, SettingsEvent::DisabledProjects, |s| {
            s.disabled_project_ids = ids
        })
    }

    /// Toggle one project in or out of the disabled set.
    pub fn set_project_enabled(&self, id: &str, enabled: bool) -> Result<(), SettingsError> {
        self.commit(Field::DisabledProjects, SettingsEvent::DisabledProjects, |s| {
            if enabled {
                s.disabled_project_ids.remove(id);
            } else {
                s.disabled_project_ids.insert(id.to_string());
            }
        })
    }

    pub fn set_launch_on_login(&self, enabled: bool) -> Result<(), SettingsError> {
        self.commit(Field::LaunchOnLogin, SettingsEvent::LaunchOnLogin, |s| {
            s.launch_on_login = enabled
        })
    }

    /// On first run, persist the launch-on-login default and mark the app launched.
    pub fn startup(&self) -> Result<(), SettingsError> {
        if !self.is_first_run() {
            return Ok(());
        }
        let launched = self
            .backend
            .write_field(Field::HasLaunched.key(), toml::Value::Boolean(true));
        if let Ok(mut first) = self.is_first_run.write() {
            *first = false;
        }
        let enabled = self.launch_on_login();
        let login = self.set_launch_on_login(enabled);
        tracing::info!(launch_on_login = enabled, "first run");
        launched?;
        login
    }

    /// Remove every stored field and return to defaults. Subscribers are
    /// notified of each observable field.
    pub fn reset(&self) -> Result<(), SettingsError> {
        let mut first_error: Option<PersistenceError> = None;
        {
            let mut state = self.write_state();
            for field in Field::ALL {
                let result = if field.stored_in_secret_store() {
                    self.secrets.remove_secret(field.key())
                } else {
                    self.backend.remove_field(field.key())
                };
                if let Err(e) = result {
                    tracing::error!(field = field.key(), error = %e, "failed to clear setting");
                    first_error.get_or_insert(e);
                }
            }
            *state = Settings {
                credentials: None,
                refresh_interval_secs: self.defaults.refresh_interval_secs,
                disabled_project_ids: BTreeSet::new(),
                launch_on_login: true,
            };
        }
        if let Ok(mut first) = self.is_first_run.write() {
            *first = true;
        }
        for event in [
            SettingsEvent::ApiKey,
            SettingsEvent::RefreshRate,
            SettingsEvent::DisabledProjects,
            SettingsEvent::LaunchOnLogin,
        ] {
            self.publish(event);
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    // --- subscriptions -----------------------------------------------------

    /// Register `handler` for future `event` notifications. Handlers for one
    /// event run in registration order. Nothing is invoked from here.
    pub fn observe<F>(&self, event: SettingsEvent, handler: F) -> Subscription
    where
        F: Fn(SettingsEvent) + Send + Sync + 'static,
    {
        let mut registry = match self.registry.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            event,
            registry: Arc::downgrade(&self.registry),
        }
    }

    // --- internals ---------------------------------------------------------

    fn read<T>(&self, f: impl FnOnce(&Settings) -> T) -> T {
        match self.state.read() {
            Ok(s) => f(&s),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, Settings> {
        match self.state.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply, persist, then publish. The state lock is held across the write
    /// so storage sees mutations in the same order as memory.
    fn commit(
        &self,
        field: Field,
        event: SettingsEvent,
        mutate: impl FnOnce(&mut Settings),
    ) -> Result<(), SettingsError> {
        let persisted = {
            let mut state = self.write_state();
            mutate(&mut state);
            self.persist(field, &state)
        };
        if let Err(e) = &persisted {
            tracing::error!(field = field.key(), error = %e, "failed to persist setting");
        }
        self.publish(event);
        persisted.map_err(SettingsError::from)
    }

    fn persist(&self, field: Field, state: &Settings) -> Result<(), PersistenceError> {
        match field {
            Field::ApiKey => match &state.credentials {
                Some(creds) => {
                    let raw = serde_json::to_string(creds)
                        .map_err(|e| PersistenceError::Encode(e.to_string()))?;
                    self.secrets.write_secret(field.key(), &raw)
                }
                None => self.secrets.remove_secret(field.key()),
            },
            Field::RefreshRate => {
                let secs = i64::try_from(state.refresh_interval_secs)
                    .map_err(|e| PersistenceError::Encode(e.to_string()))?;
                self.backend.write_field(field.key(), toml::Value::Integer(secs))
            }
            Field::DisabledProjects => {
                let ids = state
                    .disabled_project_ids
                    .iter()
                    .map(|id| toml::Value::String(id.clone()))
                    .collect();
                self.backend.write_field(field.key(), toml::Value::Array(ids))
            }
            Field::LaunchOnLogin => self
                .backend
                .write_field(field.key(), toml::Value::Boolean(state.launch_on_login)),
            Field::HasLaunched => self.backend.write_field(field.key(), toml::Value::Boolean(true)),
        }
    }

    fn publish(&self, event: SettingsEvent) {
        // Snapshot the handlers so a handler may observe or set without deadlocking.
        let handlers: Vec<Handler> = {
            let registry = match self.registry.lock() {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            registry
                .handlers
                .get(&event)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };
        tracing::debug!(?event, subscribers = handlers.len(), "settings changed");
        for handler in handlers {
            handler(event);
        }
    }
}

fn decode_interval(value: &toml::Value) -> Option<u64> {
    match value {
        toml::Value::Integer(n) => u64::try_from(*n).ok(),
        // Older files stored the rate as a float.
        toml::Value::Float(f) if f.is_finite() && *f >= 0.0 => Some(f.round() as u64),
        _ => None,
    }
}

fn decode_ids(value: &toml::Value) -> Option<BTreeSet<ProjectId>> {
    value
        .as_array()?
        .iter()
        .map(|v| match v {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(n) => Some(n.to_string()),
            _ => None,
        })
        .collect()
}
