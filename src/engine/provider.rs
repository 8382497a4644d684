use super::lock;
use super::project::{merge_enablement, Project};
use super::scheduler::RefreshTarget;
use crate::codeship::auth::Session;
use crate::codeship::{ClientError, FailureKind, RemoteClient};
use crate::settings::{SettingsEvent, SettingsStore, Subscription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;

/// Receives the full project list on every change. Treat it as read-only.
pub type ProjectListener = Arc<dyn Fn(&[Project]) + Send + Sync>;

/// Receives every fetch failure the provider absorbs.
pub type ErrorObserver = Arc<dyn Fn(&ClientError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { projects: usize },
    Failed(FailureKind),
    /// Nothing attempted (credentials known bad, or unknown project).
    Skipped,
}

/// The held list and the number of times it has been replaced.
struct Held {
    seq: u64,
    list: Arc<[Project]>,
}

/// Fan-out bookkeeping. Only one caller delivers at a time; others leave
/// their snapshot in `pending` for it, and an older snapshot never replaces
/// a newer one. Listeners therefore always end on the held list.
#[derive(Default)]
struct Delivery {
    pending: Option<(u64, Arc<[Project]>)>,
    delivered_seq: u64,
    running: bool,
}

/// Clears `running` if a listener panics mid-delivery.
struct Draining<'a> {
    delivery: &'a Mutex<Delivery>,
    finished: bool,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.delivery).running = false;
        }
    }
}

/// Owns the last known project list and fans it out to listeners.
pub struct SyncProvider {
    client: Arc<dyn RemoteClient>,
    settings: Arc<SettingsStore>,
    runtime: Handle,
    projects: Mutex<Held>,
    delivery: Mutex<Delivery>,
    listeners: Mutex<Vec<ProjectListener>>,
    error_observers: Mutex<Vec<ErrorObserver>>,
    subscriptions: Mutex<Vec<Subscription>>,
    session: Mutex<Option<Session>>,
    /// Bumped whenever credentials change; a session authenticated under an
    /// older epoch is never cached.
    credentials_epoch: AtomicU64,
    /// Set by an `Unauthorized` outcome; scheduled ticks skip until cleared.
    auth_failed: AtomicBool,
    last_failure: Mutex<Option<FailureKind>>,
}

impl SyncProvider {
    pub fn new(client: Arc<dyn RemoteClient>, settings: Arc<SettingsStore>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            client,
            settings,
            runtime,
            projects: Mutex::new(Held { seq: 0, list: Arc::from(Vec::new()) }),
            delivery: Mutex::new(Delivery::default()),
            listeners: Mutex::new(Vec::new()),
            error_observers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            credentials_epoch: AtomicU64::new(0),
            auth_failed: AtomicBool::new(false),
            last_failure: Mutex::new(None),
        })
    }

    /// Refetch on credential changes, re-merge on enablement changes.
    /// Handlers hold weak references so the settings store does not keep
    /// the provider alive. Calling this again while watching is a no-op.
    pub fn watch_settings(self: &Arc<Self>) {
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        subscriptions.push(self.settings.observe(SettingsEvent::ApiKey, move |_| {
            if let Some(provider) = weak.upgrade() {
                provider.credentials_changed();
            }
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(self.settings.observe(SettingsEvent::DisabledProjects, move |_| {
            if let Some(provider) = weak.upgrade() {
                provider.refresh_current();
            }
        }));
    }

    /// Stop reacting to settings changes.
    pub fn unwatch_settings(&self) {
        let subscriptions: Vec<Subscription> = lock(&self.subscriptions).drain(..).collect();
        for subscription in subscriptions {
            subscription.cancel();
        }
    }

    /// Current snapshot. Cheap to clone.
    pub fn projects(&self) -> Arc<[Project]> {
        lock(&self.projects).list.clone()
    }

    pub fn last_failure(&self) -> Option<FailureKind> {
        *lock(&self.last_failure)
    }

    pub fn needs_credentials(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    /// Register `listener` and call it once with the current list before returning.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&[Project]) + Send + Sync + 'static,
    {
        let listener: ProjectListener = Arc::new(listener);
        lock(&self.listeners).push(listener.clone());
        let current = self.projects();
        listener(&current);
    }

    pub fn add_error_observer<F>(&self, observer: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        lock(&self.error_observers).push(Arc::new(observer));
    }

    /// Fetch, merge enablement, replace the held list, notify. Failures are
    /// reported to error observers and leave the held list untouched.
    pub async fn refresh(&self) -> RefreshOutcome {
        let session = match self.session().await {
            Ok(s) => s,
            Err(e) => return self.absorb(e),
        };
        match self.client.fetch_projects(&session).await {
            Ok(projects) => {
                let count = projects.len();
                self.auth_failed.store(false, Ordering::SeqCst);
                *lock(&self.last_failure) = None;
                self.store(|_| Some(projects));
                tracing::info!(projects = count, "projects refreshed");
                RefreshOutcome::Updated { projects: count }
            }
            Err(e) => self.absorb(e),
        }
    }

    /// Tick-driven refresh. Skipped while the stored credentials are known bad.
    pub async fn refresh_scheduled(&self) -> RefreshOutcome {
        if self.needs_credentials() {
            tracing::debug!("skipping scheduled refresh until credentials change");
            return RefreshOutcome::Skipped;
        }
        self.refresh().await
    }

    /// Re-merge enablement into the held list and notify. No network.
    pub fn refresh_current(&self) {
        self.store(|held| Some(held.to_vec()));
    }

    /// Refetch one held project's builds and replace them wholesale.
    pub async fn refresh_builds(&self, project_id: &str) -> RefreshOutcome {
        let Some(project) = self.projects().iter().find(|p| p.id == project_id).cloned() else {
            tracing::debug!(project_id, "refresh_builds: project not held");
            return RefreshOutcome::Skipped;
        };
        let session = match self.session().await {
            Ok(s) => s,
            Err(e) => return self.absorb(e),
        };
        let builds = match self.client.fetch_builds(&session, &project).await {
            Ok(b) => b,
            Err(e) => return self.absorb(e),
        };

        // The list may have been replaced while we were fetching.
        let stored = self.store(|held| {
            let mut projects = held.to_vec();
            let target = projects.iter_mut().find(|p| p.id == project_id)?;
            target.replace_builds(builds);
            Some(projects)
        });
        match stored {
            Some(count) => RefreshOutcome::Updated { projects: count },
            None => RefreshOutcome::Skipped,
        }
    }

    fn credentials_changed(self: &Arc<Self>) {
        self.credentials_epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.session) = None;
        self.auth_failed.store(false, Ordering::SeqCst);
        let provider = self.clone();
        self.runtime.spawn(async move {
            provider.refresh().await;
        });
    }

    async fn session(&self) -> Result<Session, ClientError> {
        if let Some(session) = lock(&self.session).clone() {
            if !session.is_expired() {
                return Ok(session);
            }
        }
        let epoch = self.credentials_epoch.load(Ordering::SeqCst);
        let Some(credentials) = self.settings.credentials() else {
            return Err(ClientError::Unauthorized);
        };
        let session = self.client.authenticate(&credentials).await?;
        if self.credentials_epoch.load(Ordering::SeqCst) == epoch {
            *lock(&self.session) = Some(session.clone());
        }
        Ok(session)
    }

    /// Build the next list from the held one, merge enablement and swap it in,
    /// all under the list lock, then notify. `next` returning `None` leaves the
    /// held list alone. Returns the stored list's length.
    fn store<F>(&self, next: F) -> Option<usize>
    where
        F: FnOnce(&[Project]) -> Option<Vec<Project>>,
    {
        let (seq, snapshot) = {
            let mut held = lock(&self.projects);
            let mut projects = next(&held.list)?;
            // Read under the lock so a concurrent enablement change cannot be
            // overwritten by a list merged against the older set.
            merge_enablement(&mut projects, &self.settings.disabled_project_ids());
            held.seq += 1;
            held.list = Arc::from(projects);
            (held.seq, held.list.clone())
        };
        let count = snapshot.len();
        self.notify(seq, snapshot);
        Some(count)
    }

    fn absorb(&self, error: ClientError) -> RefreshOutcome {
        let kind = error.kind();
        match kind {
            FailureKind::Unauthorized => {
                *lock(&self.session) = None;
                self.auth_failed.store(true, Ordering::SeqCst);
                tracing::warn!("Codeship rejected the stored credentials");
            }
            FailureKind::Network => tracing::warn!(error = %error, "project refresh failed"),
            FailureKind::InvalidResponse => {
                tracing::error!(error = %error, "unexpected response from Codeship")
            }
        }
        *lock(&self.last_failure) = Some(kind);

        let observers: Vec<ErrorObserver> = lock(&self.error_observers).clone();
        for observer in observers {
            observer(&error);
        }
        RefreshOutcome::Failed(kind)
    }

    fn notify(&self, seq: u64, snapshot: Arc<[Project]>) {
        {
            let mut delivery = lock(&self.delivery);
            let newest = delivery.pending.as_ref().map_or(delivery.delivered_seq, |(s, _)| *s);
            if seq <= newest {
                return;
            }
            delivery.pending = Some((seq, snapshot));
            if delivery.running {
                return;
            }
            delivery.running = true;
        }

        let mut draining = Draining { delivery: &self.delivery, finished: false };
        loop {
            let next = {
                let mut delivery = lock(&self.delivery);
                match delivery.pending.take() {
                    Some((seq, snapshot)) => {
                        delivery.delivered_seq = seq;
                        snapshot
                    }
                    None => {
                        delivery.running = false;
                        draining.finished = true;
                        return;
                    }
                }
            };
            // Clone out so listeners can register more listeners or trigger refreshes.
            let listeners: Vec<ProjectListener> = lock(&self.listeners).clone();
            for listener in listeners {
                listener(&next);
            }
        }
    }
}

#[async_trait]
impl RefreshTarget for SyncProvider {
    async fn refresh_on_tick(&self) {
        self.refresh_scheduled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codeship::auth::Credentials;
    use crate::codeship::NetworkCause;
    use crate::engine::project::fixtures::project;
    use crate::engine::project::{Build, BuildStatus};
    use crate::settings::persistence::MemoryBackend;
    use crate::settings::SettingsDefaults;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<Vec<Project>, ClientError>>>,
        builds: Mutex<VecDeque<Result<Vec<Build>, ClientError>>>,
        auth_calls: AtomicUsize,
        fetch_calls: AtomicUsize,
        reject_auth: AtomicBool,
    }

    impl ScriptedClient {
        fn push(&self, response: Result<Vec<Project>, ClientError>) {
            self.responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl RemoteClient for ScriptedClient {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Session, ClientError> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(ClientError::Unauthorized);
            }
            Ok(Session::from_api_key("token"))
        }

        async fn fetch_projects(&self, _session: &Session) -> Result<Vec<Project>, ClientError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn fetch_builds(&self, _session: &Session, _project: &Project) -> Result<Vec<Build>, ClientError> {
            self.builds.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn network_error() -> ClientError {
        NetworkCause::Status { status: 503, body: String::new() }.into()
    }

    fn setup() -> (Arc<ScriptedClient>, Arc<SettingsStore>, Arc<SyncProvider>) {
        let backend = Arc::new(MemoryBackend::new());
        let settings = Arc::new(
            SettingsStore::load(backend.clone(), backend, SettingsDefaults::default()).unwrap(),
        );
        settings.set_credentials(Some(Credentials::ApiKey { key: "k".into() })).unwrap();
        let client = Arc::new(ScriptedClient::default());
        let provider = SyncProvider::new(client.clone(), settings.clone(), Handle::current());
        (client, settings, provider)
    }

    fn recorder(provider: &SyncProvider) -> Arc<Mutex<Vec<Vec<(String, bool)>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        provider.add_listener(move |projects| {
            sink.lock()
                .unwrap()
                .push(projects.iter().map(|p| (p.id.clone(), p.is_enabled())).collect());
        });
        seen
    }

    #[tokio::test]
    async fn test_add_listener_fires_immediately_with_empty_list() {
        let (_, _, provider) = setup();
        let seen = recorder(&provider);
        assert_eq!(*seen.lock().unwrap(), vec![Vec::<(String, bool)>::new()]);
    }

    #[tokio::test]
    async fn test_refresh_replaces_and_notifies_full_list() {
        let (client, _, provider) = setup();
        let seen = recorder(&provider);
        client.push(Ok(vec![project("1", BuildStatus::Passing), project("2", BuildStatus::Failing)]));

        let outcome = provider.refresh().await;
        assert_eq!(outcome, RefreshOutcome::Updated { projects: 2 });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], vec![("1".to_string(), true), ("2".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_refresh_merges_disabled_ids() {
        let (client, settings, provider) = setup();
        settings.set_project_enabled("2", false).unwrap();
        client.push(Ok(vec![project("1", BuildStatus::Passing), project("2", BuildStatus::Passing)]));
        provider.refresh().await;
        let held = provider.projects();
        assert!(held[0].is_enabled());
        assert!(!held[1].is_enabled());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_previous_list() {
        let (client, _, provider) = setup();
        client.push(Ok(vec![project("1", BuildStatus::Passing)]));
        provider.refresh().await;

        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        provider.add_error_observer(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });
        client.push(Err(network_error()));
        let outcome = provider.refresh().await;

        assert_eq!(outcome, RefreshOutcome::Failed(FailureKind::Network));
        assert_eq!(provider.projects().len(), 1);
        assert_eq!(provider.last_failure(), Some(FailureKind::Network));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!provider.needs_credentials());
    }

    #[tokio::test]
    async fn test_disabled_projects_event_recomputes_without_fetch() {
        let (client, settings, provider) = setup();
        provider.watch_settings();
        client.push(Ok(vec![project("1", BuildStatus::Passing), project("2", BuildStatus::Passing)]));
        provider.refresh().await;
        let seen = recorder(&provider);
        let fetches = client.fetch_calls.load(Ordering::SeqCst);

        settings.set_project_enabled("2", false).unwrap();

        assert_eq!(client.fetch_calls.load(Ordering::SeqCst), fetches);
        let last = seen.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last, vec![("1".to_string(), true), ("2".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_session_is_reused_between_refreshes() {
        let (client, _, provider) = setup();
        provider.refresh().await;
        provider.refresh().await;
        assert_eq!(client.auth_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.fetch_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_unauthorized_without_network() {
        let (client, settings, provider) = setup();
        settings.set_credentials(None).unwrap();
        let outcome = provider.refresh().await;
        assert_eq!(outcome, RefreshOutcome::Failed(FailureKind::Unauthorized));
        assert_eq!(client.auth_calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.fetch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_latches_scheduled_refreshes() {
        let (client, _, provider) = setup();
        client.reject_auth.store(true, Ordering::SeqCst);

        assert_eq!(provider.refresh().await, RefreshOutcome::Failed(FailureKind::Unauthorized));
        assert!(provider.needs_credentials());
        assert_eq!(provider.refresh_scheduled().await, RefreshOutcome::Skipped);
        assert_eq!(client.auth_calls.load(Ordering::SeqCst), 1);

        // An explicit refresh still tries, and success clears the latch.
        client.reject_auth.store(false, Ordering::SeqCst);
        assert_eq!(provider.refresh().await, RefreshOutcome::Updated { projects: 0 });
        assert!(!provider.needs_credentials());
    }

    #[tokio::test]
    async fn test_unauthorized_fetch_drops_cached_session() {
        let (client, _, provider) = setup();
        provider.refresh().await;
        client.push(Err(ClientError::Unauthorized));
        provider.refresh().await;
        provider.refresh().await;
        assert_eq!(client.auth_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_builds_replaces_one_project() {
        let (client, _, provider) = setup();
        client.push(Ok(vec![project("1", BuildStatus::Failing), project("2", BuildStatus::Passing)]));
        provider.refresh().await;

        let fresh = crate::engine::project::fixtures::build("9", BuildStatus::Passing, 59);
        client.builds.lock().unwrap().push_back(Ok(vec![fresh]));
        let outcome = provider.refresh_builds("1").await;

        assert_eq!(outcome, RefreshOutcome::Updated { projects: 2 });
        let held = provider.projects();
        assert_eq!(held[0].status(), BuildStatus::Passing);
        assert_eq!(held[0].builds()[0].id, "9");
        assert_eq!(provider.refresh_builds("missing").await, RefreshOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_watch_settings_twice_registers_once() {
        let (client, settings, provider) = setup();
        provider.watch_settings();
        provider.watch_settings();

        settings.set_credentials(Some(Credentials::ApiKey { key: "k2".into() })).unwrap();
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.fetch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unwatch_settings_stops_reacting() {
        let (client, settings, provider) = setup();
        provider.watch_settings();
        client.push(Ok(vec![project("1", BuildStatus::Passing), project("2", BuildStatus::Passing)]));
        provider.refresh().await;

        provider.unwatch_settings();
        settings.set_project_enabled("2", false).unwrap();
        assert!(provider.projects()[1].is_enabled());

        // A later merge still picks up the stored set.
        provider.refresh_current();
        assert!(!provider.projects()[1].is_enabled());
    }

    #[tokio::test]
    async fn test_change_made_from_listener_is_delivered_last() {
        let (client, settings, provider) = setup();
        provider.watch_settings();
        client.push(Ok(vec![project("1", BuildStatus::Failing), project("2", BuildStatus::Passing)]));

        let toggler = settings.clone();
        provider.add_listener(move |projects| {
            if projects.iter().any(|p| p.id == "1" && p.is_enabled()) {
                toggler.set_project_enabled("1", false).unwrap();
            }
        });
        let seen = recorder(&provider);

        provider.refresh().await;

        let held: Vec<(String, bool)> =
            provider.projects().iter().map(|p| (p.id.clone(), p.is_enabled())).collect();
        assert_eq!(held, vec![("1".to_string(), false), ("2".to_string(), true)]);
        assert_eq!(seen.lock().unwrap().last().cloned().unwrap(), held);
    }
}
