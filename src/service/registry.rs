//! Service Registry
//!
//! Holds one instance per registered service name. Instances are created
//! on first access and bound to the active project; a project switch
//! rebinds every service that was already initialized.
//!
//! Lookups and initialization state live under one `RwLock`. Calls into a
//! service happen outside it, serialized per name by a dedicated mutex so a
//! slow remote call never blocks unrelated lookups.

use super::{Service, ServiceFactory};
use crate::cache::SharedCache;
use crate::gcp::http::is_cancellation;
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no service registered under '{0}'")]
    NotRegistered(String),

    #[error("no project selected")]
    NoActiveProject,

    #[error("failed to initialize {name} for project {project}")]
    Initialization {
        name: String,
        project: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistryError {
    /// True when initialization stopped because the caller cancelled
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Initialization { source, .. } => is_cancellation(source),
            _ => false,
        }
    }
}

/// Initialization state of one registered service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initialized(String),
}

struct Entry {
    service: Arc<dyn Service>,
    state: InitState,
    /// Serializes init/reinit calls for this name
    init_lock: Arc<Mutex<()>>,
}

/// A service returned by [`ServiceRegistry::get_or_initialize`].
///
/// The service is usable even when `init_error` is set, so a view can
/// render a degraded state instead of failing outright.
pub struct ServiceHandle {
    pub service: Arc<dyn Service>,
    pub init_error: Option<RegistryError>,
}

impl ServiceHandle {
    fn ready(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            init_error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.init_error.is_none()
    }

    /// Drop the degraded instance and keep only the error, if any
    pub fn into_result(self) -> Result<Arc<dyn Service>, RegistryError> {
        match self.init_error {
            Some(err) => Err(err),
            None => Ok(self.service),
        }
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("init_error", &self.init_error)
            .finish_non_exhaustive()
    }
}

/// Per-service failures from a project switch, keyed by service name
pub type ReinitReport = HashMap<String, RegistryError>;

pub struct ServiceRegistry {
    cache: SharedCache,
    factories: RwLock<HashMap<String, ServiceFactory>>,
    entries: RwLock<HashMap<String, Entry>>,
    active_project: RwLock<String>,
}

impl ServiceRegistry {
    pub fn new(cache: SharedCache, project_id: &str) -> Self {
        Self {
            cache,
            factories: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            active_project: RwLock::new(project_id.to_string()),
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Register a factory under `name`, replacing any previous factory
    pub async fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(SharedCache) -> Arc<dyn Service> + Send + Sync + 'static,
    {
        let factory: ServiceFactory = Arc::new(factory);
        self.factories
            .write()
            .await
            .insert(name.to_string(), factory);
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.factories.read().await.contains_key(name)
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn active_project(&self) -> String {
        self.active_project.read().await.clone()
    }

    /// Change the active project without touching any service.
    /// Initialized services rebind lazily on their next access.
    pub async fn set_active_project(&self, project_id: &str) {
        *self.active_project.write().await = project_id.to_string();
    }

    /// Initialization state of `name`; `None` until first access
    pub async fn state(&self, name: &str) -> Option<InitState> {
        self.entries
            .read()
            .await
            .get(name)
            .map(|entry| entry.state.clone())
    }

    async fn set_state(&self, name: &str, state: InitState) {
        if let Some(entry) = self.entries.write().await.get_mut(name) {
            entry.state = state;
        }
    }

    /// Existing instance for `name`, or a new one from its factory
    async fn instance(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn Service>, Arc<Mutex<()>>), RegistryError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(name) {
                return Ok((entry.service.clone(), entry.init_lock.clone()));
            }
        }

        let factory = self
            .factories
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))?;

        // Re-check under the write lock; another caller may have won
        let mut entries = self.entries.write().await;
        let entry = entries.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!("Creating service {}", name);
            Entry {
                service: factory(self.cache.clone()),
                state: InitState::Uninitialized,
                init_lock: Arc::new(Mutex::new(())),
            }
        });

        Ok((entry.service.clone(), entry.init_lock.clone()))
    }

    /// Get the service registered as `name`, initializing it against the
    /// active project (or reinitializing it if the project changed).
    ///
    /// Initialization failures are reported in [`ServiceHandle::init_error`]
    /// alongside the instance; only an unknown name is an `Err`.
    pub async fn get_or_initialize(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<ServiceHandle, RegistryError> {
        let (service, init_lock) = self.instance(name).await?;

        // The active project is read under the per-name lock so a concurrent
        // project switch cannot be undone with a stale project id
        let _guard = init_lock.lock().await;

        let project = self.active_project().await;
        if project.is_empty() {
            return Ok(ServiceHandle {
                service,
                init_error: Some(RegistryError::NoActiveProject),
            });
        }

        let outcome = match self.state(name).await {
            Some(InitState::Initialized(current)) if current == project => {
                return Ok(ServiceHandle::ready(service));
            }
            Some(InitState::Initialized(previous)) => {
                tracing::info!("Reinitializing {} for {} (was {})", name, project, previous);
                service.reinit(cancel, &project).await
            }
            _ => {
                tracing::debug!("Initializing {} for {}", name, project);
                service.init_service(cancel, &project).await
            }
        };

        match outcome {
            Ok(()) => {
                self.set_state(name, InitState::Initialized(project)).await;
                Ok(ServiceHandle::ready(service))
            }
            Err(source) => {
                if !is_cancellation(&source) {
                    tracing::warn!("Failed to initialize {} for {}: {:#}", name, project, source);
                }
                Ok(ServiceHandle {
                    service,
                    init_error: Some(RegistryError::Initialization {
                        name: name.to_string(),
                        project,
                        source,
                    }),
                })
            }
        }
    }

    /// Make `project_id` active and rebind every initialized service to it.
    ///
    /// Services never initialized are left alone; they pick up the new
    /// project on first access. A service that fails to reinitialize keeps
    /// its previous project (so its next access retries) and is reported in
    /// the returned map; the others are unaffected.
    pub async fn reinitialize_all(
        &self,
        project_id: &str,
        cancel: &CancellationToken,
    ) -> ReinitReport {
        self.set_active_project(project_id).await;
        tracing::info!("Switching services to project {}", project_id);

        let targets: Vec<(String, Arc<dyn Service>, Arc<Mutex<()>>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.service.clone(), entry.init_lock.clone()))
            .collect();

        let results = join_all(targets.into_iter().map(|(name, service, init_lock)| async move {
            let _guard = init_lock.lock().await;

            // A later switch already moved on; its own pass rebinds this service
            if self.active_project().await != project_id {
                return (name, None);
            }
            match self.state(&name).await {
                Some(InitState::Initialized(current)) if current != project_id => {}
                _ => return (name, None),
            }

            match service.reinit(cancel, project_id).await {
                Ok(()) => {
                    self.set_state(&name, InitState::Initialized(project_id.to_string()))
                        .await;
                    (name, None)
                }
                Err(source) => {
                    if !is_cancellation(&source) {
                        tracing::warn!("Failed to reinitialize {}: {:#}", name, source);
                    }
                    let err = RegistryError::Initialization {
                        name: name.clone(),
                        project: project_id.to_string(),
                        source,
                    };
                    (name, Some(err))
                }
            }
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(name, err)| err.map(|e| (name, e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::gcp::http::ApiError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeService {
        inits: AtomicUsize,
        reinits: AtomicUsize,
        fail: AtomicBool,
        cancel_on_init: AtomicBool,
        project: std::sync::Mutex<Option<String>>,
    }

    impl FakeService {
        fn inits(&self) -> usize {
            self.inits.load(Ordering::SeqCst)
        }

        fn reinits(&self) -> usize {
            self.reinits.load(Ordering::SeqCst)
        }

        fn bind(&self, project_id: &str) -> anyhow::Result<()> {
            if self.cancel_on_init.load(Ordering::SeqCst) {
                return Err(ApiError::Cancelled.into());
            }
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("permission denied for {}", project_id);
            }
            *self.project.lock().unwrap() = Some(project_id.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl Service for FakeService {
        async fn init_service(
            &self,
            _cancel: &CancellationToken,
            project_id: &str,
        ) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.bind(project_id)
        }

        async fn reinit(
            &self,
            _cancel: &CancellationToken,
            project_id: &str,
        ) -> anyhow::Result<()> {
            self.reinits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.bind(project_id)
        }

        async fn fetch(&self, _cancel: &CancellationToken) -> anyhow::Result<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn registry(project: &str) -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(TtlCache::new()), project)
    }

    async fn register_fake(registry: &ServiceRegistry, name: &str) -> Arc<FakeService> {
        let fake = Arc::new(FakeService::default());
        let shared = fake.clone();
        registry
            .register(name, move |_cache| shared.clone() as Arc<dyn Service>)
            .await;
        fake
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_access_initializes_once() {
        let registry = registry("project-a");
        let fake = register_fake(&registry, "svc").await;
        let cancel = CancellationToken::new();

        let handle = registry.get_or_initialize("svc", &cancel).await.unwrap();
        assert!(handle.is_ready());
        assert_eq!(fake.inits(), 1);
        assert_eq!(
            registry.state("svc").await,
            Some(InitState::Initialized("project-a".to_string()))
        );

        registry.get_or_initialize("svc", &cancel).await.unwrap();
        assert_eq!(fake.inits(), 1);
        assert_eq!(fake.reinits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_project_change_triggers_single_reinit() {
        let registry = registry("project-a");
        let fake = register_fake(&registry, "svc").await;
        let cancel = CancellationToken::new();

        registry.get_or_initialize("svc", &cancel).await.unwrap();
        registry.set_active_project("project-b").await;

        registry.get_or_initialize("svc", &cancel).await.unwrap();
        registry.get_or_initialize("svc", &cancel).await.unwrap();

        assert_eq!(fake.inits(), 1);
        assert_eq!(fake.reinits(), 1);
        assert_eq!(fake.project.lock().unwrap().as_deref(), Some("project-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_name_is_an_error() {
        let registry = registry("project-a");
        let cancel = CancellationToken::new();

        let err = registry.get_or_initialize("nope", &cancel).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(name) if name == "nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_init_returns_instance_and_retries_later() {
        let registry = registry("project-a");
        let fake = register_fake(&registry, "svc").await;
        fake.fail.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let handle = registry.get_or_initialize("svc", &cancel).await.unwrap();
        assert!(!handle.is_ready());
        assert!(matches!(
            handle.init_error,
            Some(RegistryError::Initialization { ref project, .. }) if project == "project-a"
        ));
        assert_eq!(registry.state("svc").await, Some(InitState::Uninitialized));

        fake.fail.store(false, Ordering::SeqCst);
        let handle = registry.get_or_initialize("svc", &cancel).await.unwrap();
        assert!(handle.is_ready());
        assert_eq!(fake.inits(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_access_builds_and_initializes_once() {
        let registry = registry("project-a");
        let built = Arc::new(AtomicUsize::new(0));
        let fake = Arc::new(FakeService::default());
        {
            let built = built.clone();
            let fake = fake.clone();
            registry
                .register("svc", move |_cache| {
                    built.fetch_add(1, Ordering::SeqCst);
                    fake.clone() as Arc<dyn Service>
                })
                .await;
        }
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            registry.get_or_initialize("svc", &cancel),
            registry.get_or_initialize("svc", &cancel)
        );
        assert!(a.unwrap().is_ready());
        assert!(b.unwrap().is_ready());

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(fake.inits(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinitialize_all_isolates_failures() {
        let registry = registry("project-a");
        let good = register_fake(&registry, "good").await;
        let bad = register_fake(&registry, "bad").await;
        let cancel = CancellationToken::new();

        registry.get_or_initialize("good", &cancel).await.unwrap();
        registry.get_or_initialize("bad", &cancel).await.unwrap();
        bad.fail.store(true, Ordering::SeqCst);

        let report = registry.reinitialize_all("project-b", &cancel).await;

        assert_eq!(report.len(), 1);
        assert!(report.contains_key("bad"));
        assert_eq!(
            registry.state("good").await,
            Some(InitState::Initialized("project-b".to_string()))
        );
        assert_eq!(
            registry.state("bad").await,
            Some(InitState::Initialized("project-a".to_string()))
        );
        assert_eq!(good.reinits(), 1);
        assert_eq!(bad.reinits(), 1);

        // The registry is not left locked; the failed service retries on access
        bad.fail.store(false, Ordering::SeqCst);
        let handle = registry.get_or_initialize("bad", &cancel).await.unwrap();
        assert!(handle.is_ready());
        assert_eq!(bad.reinits(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access_during_switch_keeps_new_project() {
        for _ in 0..25 {
            let registry = Arc::new(registry("project-a"));
            let fake = register_fake(&registry, "svc").await;
            let cancel = CancellationToken::new();
            registry.get_or_initialize("svc", &cancel).await.unwrap();

            let access = {
                let registry = registry.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { registry.get_or_initialize("svc", &cancel).await })
            };
            let switch = {
                let registry = registry.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { registry.reinitialize_all("project-b", &cancel).await })
            };

            let handle = access.await.unwrap().unwrap();
            let report = switch.await.unwrap();
            assert!(handle.is_ready());
            assert!(report.is_empty());

            assert_eq!(
                registry.state("svc").await,
                Some(InitState::Initialized("project-b".to_string()))
            );
            assert_eq!(fake.project.lock().unwrap().as_deref(), Some("project-b"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_switch_does_not_rebind() {
        let registry = registry("project-a");
        let fake = register_fake(&registry, "svc").await;
        let cancel = CancellationToken::new();
        registry.get_or_initialize("svc", &cancel).await.unwrap();

        // "b" holds the init lock while "c" and then "d" queue behind it
        let (b, c, d) = tokio::join!(
            registry.reinitialize_all("project-b", &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                registry.reinitialize_all("project-c", &cancel).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(2)).await;
                registry.reinitialize_all("project-d", &cancel).await
            }
        );
        assert!(b.is_empty() && c.is_empty() && d.is_empty());

        assert_eq!(fake.reinits(), 2);
        assert_eq!(
            registry.state("svc").await,
            Some(InitState::Initialized("project-d".to_string()))
        );
        assert_eq!(fake.project.lock().unwrap().as_deref(), Some("project-d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reinitialize_all_skips_uninitialized() {
        let registry = registry("project-a");
        let used = register_fake(&registry, "used").await;
        let idle = register_fake(&registry, "idle").await;
        let cancel = CancellationToken::new();

        registry.get_or_initialize("used", &cancel).await.unwrap();
        let report = registry.reinitialize_all("project-b", &cancel).await;

        assert!(report.is_empty());
        assert_eq!(used.reinits(), 1);
        assert_eq!(idle.inits() + idle.reinits(), 0);
        assert_eq!(registry.state("idle").await, None);

        registry.get_or_initialize("idle", &cancel).await.unwrap();
        assert_eq!(idle.inits(), 1);
        assert_eq!(idle.project.lock().unwrap().as_deref(), Some("project-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_init_is_distinguishable() {
        let registry = registry("project-a");
        let fake = register_fake(&registry, "svc").await;
        fake.cancel_on_init.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let handle = registry.get_or_initialize("svc", &cancel).await.unwrap();
        let err = handle.init_error.expect("init should fail");
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_active_project() {
        let registry = registry("");
        let fake = register_fake(&registry, "svc").await;
        let cancel = CancellationToken::new();

        let handle = registry.get_or_initialize("svc", &cancel).await.unwrap();
        assert!(matches!(handle.init_error, Some(RegistryError::NoActiveProject)));
        assert_eq!(fake.inits(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_overwrites_factory() {
        let registry = registry("project-a");
        let first = register_fake(&registry, "svc").await;
        let second = register_fake(&registry, "svc").await;
        let cancel = CancellationToken::new();

        assert_eq!(registry.names().await, vec!["svc".to_string()]);
        registry.get_or_initialize("svc", &cancel).await.unwrap();

        assert_eq!(first.inits(), 0);
        assert_eq!(second.inits(), 1);
    }
}
