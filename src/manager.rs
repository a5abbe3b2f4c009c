//! The lifecycle coordinator.
//!
//! [`ProjectManager`] owns the open-project collection and the active
//! project pointer. It drives the load, save, refresh, close and activate
//! sequences. Each sequence runs under the per-location lock from
//! [`OperationSynchronizer`], updates the [`StateTracker`], and raises its
//! staged events through [`ProjectEvents`].
//!
//! Recovered failures (validation, I/O, single-document violations) are
//! reported through the matching `*Failed` event and a `false`/`None`
//! return. Listener failures are not recovered and come back as
//! [`DispatchError`].

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::collaborator::{
    NullUpgrader, NullValidator, ProjectReader, ProjectUpgrader, ProjectValidator, ProjectWriter,
    ValidationContext,
};
use crate::config::{ManagerConfig, ProjectManagementMode};
use crate::dispatch::{EventChannel, ProjectEvents};
use crate::error::{BuildError, DispatchError, ProjectError};
use crate::event::{
    ActivationEventArgs, ActivationFailedArgs, ProjectEventArgs, ProjectFailedArgs,
    RefreshRequiredArgs,
};
use crate::project::{LocationKey, SharedProject, same_project};
use crate::state::{ProjectState, StateEvent, StateTracker};
use crate::synchronizer::OperationSynchronizer;
use crate::watcher::{
    NullRefresherSelector, RefresherSelector, ResourceUpdate, ResourceWatcher, UpdateHandler,
};

/// Which checks a project read runs.
#[derive(Debug, Clone, Copy)]
struct LoadPolicy {
    upgrade: bool,
    enforce_single_document: bool,
    check_can_start: bool,
    validate_location: bool,
    validate_project: bool,
}

impl LoadPolicy {
    const LOAD: LoadPolicy = LoadPolicy {
        upgrade: true,
        enforce_single_document: true,
        check_can_start: true,
        validate_location: true,
        validate_project: true,
    };
}

/// Open projects in insertion order plus the active pointer.
#[derive(Default)]
struct Registry {
    projects: Vec<(LocationKey, SharedProject)>,
    active: Option<SharedProject>,
    /// Locations whose project is out of the collection while a refresh
    /// reloads it. They still count as open.
    reserved: Vec<LocationKey>,
}

/// How [`ManagerInner::register`] treats the target location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// A newly opened project: the location must be free and the
    /// single-document limit applies.
    New,
    /// Filling the slot a refresh reserved for this location.
    Reserved,
}

impl Registry {
    /// Location of some open or reserved project, if any.
    fn occupant(&self) -> Option<String> {
        self.projects
            .first()
            .map(|(_, project)| project.location())
            .or_else(|| self.reserved.first().map(|key| key.as_str().to_owned()))
    }

    fn find(&self, key: &LocationKey) -> Option<&SharedProject> {
        self.projects
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, project)| project)
    }

    fn position(&self, project: &SharedProject) -> Option<usize> {
        let id = project.id();
        self.projects.iter().position(|(_, p)| p.id() == id)
    }
}

struct ManagerInner {
    mode: ProjectManagementMode,
    event_timeout: Duration,
    check_can_start_on_refresh: bool,
    reader: Arc<dyn ProjectReader>,
    writer: Arc<dyn ProjectWriter>,
    validator: Arc<dyn ProjectValidator>,
    upgrader: Arc<dyn ProjectUpgrader>,
    refreshers: Arc<dyn RefresherSelector>,
    events: Arc<ProjectEvents>,
    states: StateTracker,
    synchronizer: OperationSynchronizer,
    /// Serializes activation across all locations.
    activation: tokio::sync::Mutex<()>,
    registry: Mutex<Registry>,
    watchers: Mutex<HashMap<LocationKey, ResourceWatcher>>,
    /// Locations with a load or save running, counted.
    in_flight: Mutex<HashMap<LocationKey, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManagerInner {
    fn find(&self, location: &str) -> Option<SharedProject> {
        lock(&self.registry)
            .find(&LocationKey::new(location))
            .cloned()
    }

    fn is_registered(&self, project: &SharedProject) -> bool {
        lock(&self.registry).position(project).is_some()
    }

    fn active(&self) -> Option<SharedProject> {
        lock(&self.registry).active.clone()
    }

    fn check_single_document(&self, location: &str) -> Result<(), ProjectError> {
        if self.mode != ProjectManagementMode::SingleDocument {
            return Ok(());
        }
        match lock(&self.registry).occupant() {
            Some(existing) => Err(ProjectError::SdiViolation {
                location: location.to_owned(),
                existing,
            }),
            None => Ok(()),
        }
    }

    /// Add a project at the end of the collection, or at `index`.
    ///
    /// Locations stay unique. A [`Slot::New`] project must also respect
    /// reservations and the single-document limit.
    fn register(
        &self,
        project: &SharedProject,
        index: Option<usize>,
        slot: Slot,
    ) -> Result<(), ProjectError> {
        let location = project.location();
        let key = LocationKey::new(&location);
        let mut registry = lock(&self.registry);
        if registry.find(&key).is_some()
            || (slot == Slot::New && registry.reserved.contains(&key))
        {
            return Err(ProjectError::LocationInUse { location });
        }
        if slot == Slot::New
            && self.mode == ProjectManagementMode::SingleDocument
            && let Some(existing) = registry.occupant()
        {
            return Err(ProjectError::SdiViolation { location, existing });
        }
        let entry = (key, Arc::clone(project));
        match index {
            Some(index) if index <= registry.projects.len() => {
                registry.projects.insert(index, entry)
            }
            _ => registry.projects.push(entry),
        }
        Ok(())
    }

    /// Remove a project, returning its former position. Clears the active
    /// pointer if it referred to the project.
    fn unregister(&self, project: &SharedProject) -> Option<usize> {
        let mut registry = lock(&self.registry);
        let index = registry.position(project)?;
        registry.projects.remove(index);
        if same_project(registry.active.as_ref(), Some(project)) {
            registry.active = None;
        }
        Some(index)
    }

    /// Take `project` out of the collection for a reload, keeping its
    /// location reserved until the returned guard is dropped.
    fn reserve(&self, project: &SharedProject) -> Reservation<'_> {
        let key = LocationKey::new(&project.location());
        let mut registry = lock(&self.registry);
        let index = registry.position(project);
        if let Some(index) = index {
            registry.projects.remove(index);
        }
        if same_project(registry.active.as_ref(), Some(project)) {
            registry.active = None;
        }
        registry.reserved.push(key.clone());
        Reservation {
            inner: self,
            key,
            index,
        }
    }

    /// Point the collection entry of `project` at its current location.
    fn rekey(&self, project: &SharedProject) {
        let mut registry = lock(&self.registry);
        if let Some(index) = registry.position(project) {
            registry.projects[index].0 = LocationKey::new(&project.location());
        }
    }

    /// Swap the active pointer. Fails if `project` left the collection.
    fn try_set_active(&self, project: Option<&SharedProject>) -> bool {
        let mut registry = lock(&self.registry);
        if let Some(project) = project
            && registry.position(project).is_none()
        {
            return false;
        }
        registry.active = project.cloned();
        true
    }

    fn begin_in_flight(&self, location: &str) -> InFlight<'_> {
        let key = LocationKey::new(location);
        *lock(&self.in_flight).entry(key.clone()).or_default() += 1;
        InFlight { inner: self, key }
    }

    fn is_in_flight(&self, key: &LocationKey) -> bool {
        lock(&self.in_flight).contains_key(key)
    }
}

/// A refresh's hold on its location while the project is out of the
/// collection.
struct Reservation<'a> {
    inner: &'a ManagerInner,
    key: LocationKey,
    /// Former position of the project in the collection.
    index: Option<usize>,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut registry = lock(&self.inner.registry);
        if let Some(position) = registry.reserved.iter().position(|k| *k == self.key) {
            registry.reserved.swap_remove(position);
        }
    }
}

/// Marks a location as mid-load or mid-save until dropped.
struct InFlight<'a> {
    inner: &'a ManagerInner,
    key: LocationKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(count) = in_flight.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.key);
            }
        }
    }
}

/// Coordinates the lifecycle of every open project.
///
/// Build one with [`ProjectManager::builder`]. `Clone` is cheap: all
/// internal state is `Arc`-wrapped.
///
/// Every lifecycle method returns `Err` only when an event listener fails.
/// Other failures are reported through events and a `false`/`None` result.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use projectfold::ProjectManager;
/// use projectfold::memory::MemoryBackend;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
/// let backend = Arc::new(MemoryBackend::new().with_document("/work/plan.txt", "draft"));
/// let manager = ProjectManager::builder()
///     .reader(backend.clone())
///     .writer(backend.clone())
///     .build()?;
///
/// let project = manager.load("/work/plan.txt").await?.expect("document exists");
/// assert_eq!(manager.active_project().map(|p| p.id()), Some(project.id()));
///
/// assert!(manager.close(&project).await?);
/// assert!(manager.projects().is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProjectManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ProjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = lock(&self.inner.registry);
        f.debug_struct("ProjectManager")
            .field("mode", &self.inner.mode)
            .field("projects", &registry.projects.len())
            .field("active", &registry.active.as_ref().map(|p| p.location()))
            .finish()
    }
}

impl ProjectManager {
    /// Start configuring a manager.
    pub fn builder() -> ProjectManagerBuilder {
        ProjectManagerBuilder::new()
    }

    /// The event channels. Subscribe here to observe or cancel operations.
    ///
    /// A listener that captures a clone of the manager keeps the manager
    /// alive for as long as it stays subscribed.
    pub fn events(&self) -> &ProjectEvents {
        &self.inner.events
    }

    pub fn mode(&self) -> ProjectManagementMode {
        self.inner.mode
    }

    pub fn event_timeout(&self) -> Duration {
        self.inner.event_timeout
    }

    /// Open projects in the order they were loaded.
    pub fn projects(&self) -> Vec<SharedProject> {
        lock(&self.inner.registry)
            .projects
            .iter()
            .map(|(_, project)| Arc::clone(project))
            .collect()
    }

    /// The open project at `location` (case-insensitive), if any.
    pub fn project(&self, location: &str) -> Option<SharedProject> {
        self.inner.find(location)
    }

    pub fn active_project(&self) -> Option<SharedProject> {
        self.inner.active()
    }

    /// Snapshot of the lifecycle flags for `location`.
    pub fn state(&self, location: &str) -> ProjectState {
        self.inner.states.state(location)
    }

    pub fn is_refreshing_active_project(&self) -> bool {
        self.inner.states.is_refreshing_active_project()
    }

    /// Subscribe to state-change notifications.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.inner.states.subscribe()
    }

    /// Load the project at `location` and make it active.
    ///
    /// If the location is already open, the open project is returned and no
    /// events are raised.
    ///
    /// # Returns
    ///
    /// The project, or `None` if loading was canceled or failed. The reason
    /// for a failure is carried by the `LoadingFailed` event.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn load(&self, location: &str) -> Result<Option<SharedProject>, DispatchError> {
        self.load_with(location, true).await
    }

    /// Load the project at `location` without activating it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn load_inactive(
        &self,
        location: &str,
    ) -> Result<Option<SharedProject>, DispatchError> {
        self.load_with(location, false).await
    }

    /// Make `project` the active project, or clear the active project with
    /// `None`.
    ///
    /// # Returns
    ///
    /// `false` if nothing changed: the project is already active, is not
    /// open, or a listener canceled the activation.
    ///
    /// Activations are serialized by one lock that is not re-entrant.
    /// `Activating` and `Activated` listeners must not change the active
    /// project themselves.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn set_active_project(
        &self,
        project: Option<&SharedProject>,
    ) -> Result<bool, DispatchError> {
        self.activate(project.cloned(), None)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "activation aborted by listener"))
    }

    /// Reload an open project from its location, replacing the instance.
    ///
    /// The project is resolved by location, so a stale instance refreshes
    /// whatever is currently open there. An active project is deactivated
    /// during the reload and reactivated with the new instance afterwards.
    /// If the reload fails the previous instance is restored.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn refresh(&self, project: &SharedProject) -> Result<bool, DispatchError> {
        let location = project.location();
        self.inner
            .synchronizer
            .run_exclusive(&location, || self.refresh_locked(&location))
            .await
            .inspect_err(|e| tracing::error!(location = %location, error = %e, "refresh aborted by listener"))
    }

    /// Write `project` to `location`, or to its own location when `None`.
    ///
    /// Saving to a different location is a save-as: on success the project
    /// takes the new location, and its collection entry and watcher move
    /// with it.
    ///
    /// # Returns
    ///
    /// `true` if the writer stored the project.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn save(
        &self,
        project: &SharedProject,
        location: Option<&str>,
    ) -> Result<bool, DispatchError> {
        let source = project.location();
        let target = location.map_or_else(|| source.clone(), str::to_owned);
        self.inner
            .synchronizer
            .run_exclusive(&target, || self.save_locked(project, &source, &target))
            .await
            .inspect_err(|e| tracing::error!(location = %target, error = %e, "save aborted by listener"))
    }

    /// Close an open project, deactivating it first if it is active.
    ///
    /// Resolved by location, like [`refresh`](ProjectManager::refresh).
    ///
    /// # Returns
    ///
    /// `false` if the project is not open or the close was canceled.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn close(&self, project: &SharedProject) -> Result<bool, DispatchError> {
        let location = project.location();
        self.inner
            .synchronizer
            .run_exclusive(&location, || self.close_locked(&location))
            .await
            .inspect_err(|e| tracing::error!(location = %location, error = %e, "close aborted by listener"))
    }

    /// Close every open project in load order, stopping at the first one
    /// that is not closed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] if a listener fails.
    pub async fn close_all(&self) -> Result<bool, DispatchError> {
        for project in self.projects() {
            if !self.close(&project).await? {
                tracing::info!(location = %project.location(), "close-all stopped");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn raise<P: Send + Sync + 'static>(
        &self,
        channel: &EventChannel<P>,
        payload: P,
    ) -> Result<(), DispatchError> {
        channel
            .raise(Arc::new(payload), self.inner.event_timeout)
            .await
            .map(|_| ())
    }

    // --- Load ---

    async fn load_with(
        &self,
        location: &str,
        activate: bool,
    ) -> Result<Option<SharedProject>, DispatchError> {
        self.inner
            .synchronizer
            .run_exclusive(location, || self.load_locked(location, activate))
            .await
            .inspect_err(|e| tracing::error!(location = %location, error = %e, "load aborted by listener"))
    }

    async fn load_locked(
        &self,
        location: &str,
        activate: bool,
    ) -> Result<Option<SharedProject>, DispatchError> {
        if let Some(existing) = self.inner.find(location) {
            tracing::debug!(location = %location, "project already loaded");
            return Ok(Some(existing));
        }

        let _in_flight = self.inner.begin_in_flight(location);
        self.inner.states.set_loading(location, true);
        let outcome = self.load_stages(location).await;
        if outcome.is_err() {
            self.inner.states.set_loading(location, false);
        }

        match outcome? {
            Some(project) if activate => {
                self.activate(Some(Arc::clone(&project)), None).await?;
                Ok(Some(project))
            }
            outcome => Ok(outcome),
        }
    }

    async fn load_stages(&self, location: &str) -> Result<Option<SharedProject>, DispatchError> {
        let states = &self.inner.states;
        let events = &self.inner.events;

        let args = Arc::new(ProjectEventArgs::new(location));
        events
            .loading
            .raise(Arc::clone(&args), self.inner.event_timeout)
            .await?;
        if args.is_canceled() {
            tracing::info!(location = %location, "loading canceled");
            states.set_loading(location, false);
            self.raise(&events.loading_canceled, ProjectEventArgs::new(location))
                .await?;
            return Ok(None);
        }

        let loaded = match self.read_project(location, LoadPolicy::LOAD).await {
            Ok(project) => self
                .inner
                .register(&project, None, Slot::New)
                .map(|()| project),
            Err(e) => Err(e),
        };

        match loaded {
            Ok(project) => {
                self.attach_watcher(&project);
                project.clear_is_dirty();
                states.set_loading(location, false);
                tracing::info!(location = %project.location(), id = %project.id(), "project loaded");
                self.raise(
                    &events.loaded,
                    ProjectEventArgs::new(project.location()).with_project(Arc::clone(&project)),
                )
                .await?;
                Ok(Some(project))
            }
            Err(error) => {
                log_failure("loading", location, &error);
                states.set_loading(location, false);
                self.raise(&events.loading_failed, ProjectFailedArgs::new(location, error))
                    .await?;
                Ok(None)
            }
        }
    }

    /// Run the upgrade, validation and read steps for `location`.
    async fn read_project(
        &self,
        location: &str,
        policy: LoadPolicy,
    ) -> Result<SharedProject, ProjectError> {
        let inner = &self.inner;
        let mut location = location.to_owned();

        if policy.upgrade && inner.upgrader.requires_upgrade(&location).await {
            let upgraded = inner
                .upgrader
                .upgrade(&location)
                .await
                .map_err(|source| ProjectError::Upgrade {
                    location: location.clone(),
                    source,
                })?;
            tracing::info!(from = %location, to = %upgraded, "project upgraded");
            if !LocationKey::new(&location).matches(&upgraded) && inner.find(&upgraded).is_some() {
                return Err(ProjectError::LocationInUse { location: upgraded });
            }
            location = upgraded;
        }

        if policy.enforce_single_document {
            inner.check_single_document(&location)?;
        }

        if policy.check_can_start && !inner.validator.can_start_loading(&location).await {
            return Err(ProjectError::CannotLoad {
                validation: ValidationContext::new()
                    .with_error(format!("loading '{location}' is not allowed")),
                location,
            });
        }

        if policy.validate_location {
            let validation = inner.validator.validate_before_loading(&location).await;
            if validation.has_errors() {
                return Err(ProjectError::Validation {
                    location,
                    validation,
                });
            }
        }

        let project = inner
            .reader
            .read(&location)
            .await
            .map_err(|source| ProjectError::Read {
                location: location.clone(),
                source,
            })?;

        let actual = project.location();
        if !LocationKey::new(&location).matches(&actual) {
            return Err(ProjectError::LocationMismatch {
                expected: location,
                actual,
            });
        }

        if policy.validate_project {
            let validation = inner.validator.validate_project(&project).await;
            if validation.has_errors() {
                return Err(ProjectError::Validation {
                    location,
                    validation,
                });
            }
        }

        Ok(project)
    }

    // --- Activation ---

    /// Swap the active project under the global activation lock.
    ///
    /// `predecessor` overrides the `old` side reported to listeners. A
    /// refresh passes the replaced instance so the activation is tagged as
    /// a refresh.
    async fn activate(
        &self,
        new: Option<SharedProject>,
        predecessor: Option<SharedProject>,
    ) -> Result<bool, DispatchError> {
        let _serial = self.inner.activation.lock().await;

        let current = self.inner.active();
        if same_project(current.as_ref(), new.as_ref()) {
            tracing::debug!("project is already active");
            return Ok(false);
        }
        if let Some(project) = &new
            && !self.inner.is_registered(project)
        {
            tracing::debug!(location = %project.location(), "cannot activate a project that is not loaded");
            return Ok(false);
        }

        let outgoing = current.as_ref().map(|p| p.location());
        let incoming = new.as_ref().map(|p| p.location());
        let old = predecessor.or(current);

        self.mark_activation(outgoing.as_deref(), incoming.as_deref(), true);
        let outcome = self
            .activation_stages(old, new, outgoing.as_deref(), incoming.as_deref())
            .await;
        if outcome.is_err() {
            self.mark_activation(outgoing.as_deref(), incoming.as_deref(), false);
        }
        outcome
    }

    fn mark_activation(&self, outgoing: Option<&str>, incoming: Option<&str>, value: bool) {
        if let Some(location) = outgoing {
            self.inner.states.set_deactivating(location, value);
        }
        if let Some(location) = incoming {
            self.inner.states.set_activating(location, value);
        }
    }

    async fn activation_stages(
        &self,
        old: Option<SharedProject>,
        new: Option<SharedProject>,
        outgoing: Option<&str>,
        incoming: Option<&str>,
    ) -> Result<bool, DispatchError> {
        let events = &self.inner.events;

        let args = Arc::new(ActivationEventArgs::new(old.clone(), new.clone()));
        events
            .activating
            .raise(Arc::clone(&args), self.inner.event_timeout)
            .await?;
        if args.is_canceled() {
            tracing::info!(location = ?incoming, "activation canceled");
            self.mark_activation(outgoing, incoming, false);
            self.raise(&events.activation_canceled, ActivationEventArgs::new(old, new))
                .await?;
            return Ok(false);
        }

        if !self.inner.try_set_active(new.as_ref()) {
            let location = incoming.unwrap_or_default().to_owned();
            let error = ProjectError::NotRegistered { location };
            tracing::warn!(error = %error, "activation failed");
            self.mark_activation(outgoing, incoming, false);
            self.raise(
                &events.activation_failed,
                ActivationFailedArgs {
                    old,
                    new,
                    error: Arc::new(error),
                },
            )
            .await?;
            return Ok(false);
        }

        self.mark_activation(outgoing, incoming, false);
        tracing::info!(from = ?outgoing, to = ?incoming, is_refresh = args.is_refresh, "active project changed");
        events
            .activated
            .raise(args, self.inner.event_timeout)
            .await?;
        Ok(true)
    }

    // --- Refresh ---

    async fn refresh_locked(&self, location: &str) -> Result<bool, DispatchError> {
        let Some(old) = self.inner.find(location) else {
            let error = ProjectError::NotRegistered {
                location: location.to_owned(),
            };
            tracing::warn!(error = %error, "refresh failed");
            self.raise(
                &self.inner.events.refreshing_failed,
                ProjectFailedArgs::new(location, error),
            )
            .await?;
            return Ok(false);
        };

        let is_active = same_project(self.inner.active().as_ref(), Some(&old));
        self.inner.states.set_refreshing(location, true, is_active);
        let outcome = self.refresh_stages(location, old, is_active).await;
        if outcome.is_err() {
            self.inner.states.set_refreshing(location, false, is_active);
        }
        outcome
    }

    async fn refresh_stages(
        &self,
        location: &str,
        old: SharedProject,
        is_active: bool,
    ) -> Result<bool, DispatchError> {
        let states = &self.inner.states;
        let events = &self.inner.events;

        let args = Arc::new(ProjectEventArgs::new(location).with_project(Arc::clone(&old)));
        events
            .refreshing
            .raise(Arc::clone(&args), self.inner.event_timeout)
            .await?;
        if args.is_canceled() {
            tracing::info!(location = %location, "refresh canceled");
            return self.refresh_canceled(location, &old, is_active).await;
        }

        if is_active && !self.activate(None, None).await? {
            tracing::info!(location = %location, "refresh canceled: active project was not deactivated");
            return self.refresh_canceled(location, &old, is_active).await;
        }

        let reservation = self.inner.reserve(&old);
        let policy = LoadPolicy {
            upgrade: false,
            enforce_single_document: false,
            check_can_start: self.inner.check_can_start_on_refresh,
            validate_location: self.inner.validator.validate_location_on_refresh(),
            validate_project: self.inner.validator.validate_project_on_refresh(),
        };
        let reloaded = match self.read_project(location, policy).await {
            Ok(project) => self
                .inner
                .register(&project, reservation.index, Slot::Reserved)
                .map(|()| project),
            Err(e) => Err(e),
        };
        let restored = match &reloaded {
            Ok(_) => Ok(()),
            Err(_) => self.inner.register(&old, reservation.index, Slot::Reserved),
        };
        drop(reservation);

        match reloaded {
            Ok(project) => {
                project.clear_is_dirty();
                states.set_refreshing(location, false, false);
                tracing::info!(location = %location, id = %project.id(), "project refreshed");
                self.raise(
                    &events.refreshed,
                    ProjectEventArgs::new(location).with_project(Arc::clone(&project)),
                )
                .await?;
                if is_active && !self.activate(Some(project), Some(old)).await? {
                    // The reactivation did not happen, so it cannot clear the flag.
                    states.set_refreshing(location, false, true);
                }
                Ok(true)
            }
            Err(error) => {
                log_failure("refreshing", location, &error);
                if let Err(e) = restored {
                    tracing::error!(location = %location, error = %e, "could not restore project after failed refresh");
                }
                states.set_refreshing(location, false, is_active);
                self.raise(
                    &events.refreshing_failed,
                    ProjectFailedArgs::new(location, error).with_project(Arc::clone(&old)),
                )
                .await?;
                if is_active {
                    self.activate(Some(old), None).await?;
                }
                Ok(false)
            }
        }
    }

    async fn refresh_canceled(
        &self,
        location: &str,
        old: &SharedProject,
        is_active: bool,
    ) -> Result<bool, DispatchError> {
        self.inner.states.set_refreshing(location, false, is_active);
        self.raise(
            &self.inner.events.refreshing_canceled,
            ProjectEventArgs::new(location).with_project(Arc::clone(old)),
        )
        .await?;
        Ok(false)
    }

    // --- Save ---

    async fn save_locked(
        &self,
        project: &SharedProject,
        source: &str,
        target: &str,
    ) -> Result<bool, DispatchError> {
        let _in_flight = self.inner.begin_in_flight(target);
        self.inner.states.set_saving(target, true);
        let outcome = self.save_stages(project, source, target).await;
        if outcome.is_err() {
            self.inner.states.set_saving(target, false);
        }
        outcome
    }

    async fn save_stages(
        &self,
        project: &SharedProject,
        source: &str,
        target: &str,
    ) -> Result<bool, DispatchError> {
        let states = &self.inner.states;
        let events = &self.inner.events;

        let args = Arc::new(ProjectEventArgs::new(target).with_project(Arc::clone(project)));
        events
            .saving
            .raise(Arc::clone(&args), self.inner.event_timeout)
            .await?;
        if args.is_canceled() {
            tracing::info!(location = %target, "saving canceled");
            states.set_saving(target, false);
            self.raise(
                &events.saving_canceled,
                ProjectEventArgs::new(target).with_project(Arc::clone(project)),
            )
            .await?;
            return Ok(false);
        }

        let is_save_as = !LocationKey::new(source).matches(target);
        let written = if is_save_as
            && self
                .inner
                .find(target)
                .is_some_and(|other| other.id() != project.id())
        {
            Err(ProjectError::LocationInUse {
                location: target.to_owned(),
            })
        } else {
            match self.inner.writer.write(project, target).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    tracing::warn!(location = %target, "writer reported the project was not saved");
                    Err(ProjectError::WriteRejected {
                        location: target.to_owned(),
                    })
                }
                Err(source) => Err(ProjectError::Write {
                    location: target.to_owned(),
                    source,
                }),
            }
        };

        match written {
            Ok(()) => {
                if is_save_as {
                    project.core().set_location(target);
                    self.inner.rekey(project);
                    if self.inner.is_registered(project) {
                        self.detach_watcher(source);
                        self.attach_watcher(project);
                    }
                }
                project.clear_is_dirty();
                states.set_saving(target, false);
                tracing::info!(location = %target, save_as = is_save_as, "project saved");
                self.raise(
                    &events.saved,
                    ProjectEventArgs::new(target).with_project(Arc::clone(project)),
                )
                .await?;
                Ok(true)
            }
            Err(error) => {
                if !matches!(error, ProjectError::WriteRejected { .. }) {
                    log_failure("saving", target, &error);
                }
                states.set_saving(target, false);
                self.raise(
                    &events.saving_failed,
                    ProjectFailedArgs::new(target, error).with_project(Arc::clone(project)),
                )
                .await?;
                Ok(false)
            }
        }
    }

    // --- Close ---

    async fn close_locked(&self, location: &str) -> Result<bool, DispatchError> {
        let Some(project) = self.inner.find(location) else {
            tracing::debug!(location = %location, "nothing to close");
            return Ok(false);
        };

        self.inner.states.set_closing(location, true);
        let outcome = self.close_stages(location, project).await;
        if outcome.is_err() {
            self.inner.states.set_closing(location, false);
        }
        outcome
    }

    async fn close_stages(
        &self,
        location: &str,
        project: SharedProject,
    ) -> Result<bool, DispatchError> {
        let states = &self.inner.states;
        let events = &self.inner.events;

        let args = Arc::new(ProjectEventArgs::new(location).with_project(Arc::clone(&project)));
        events
            .closing
            .raise(Arc::clone(&args), self.inner.event_timeout)
            .await?;

        let mut canceled = args.is_canceled();
        if canceled {
            tracing::info!(location = %location, "closing canceled");
        } else if same_project(self.inner.active().as_ref(), Some(&project))
            && !self.activate(None, None).await?
        {
            tracing::info!(location = %location, "closing canceled: project was not deactivated");
            canceled = true;
        }
        if canceled {
            states.set_closing(location, false);
            self.raise(
                &events.closing_canceled,
                ProjectEventArgs::new(location).with_project(project),
            )
            .await?;
            return Ok(false);
        }

        self.inner.unregister(&project);
        self.detach_watcher(location);
        states.set_closing(location, false);
        tracing::info!(location = %location, "project closed");
        self.raise(
            &events.closed,
            ProjectEventArgs::new(location).with_project(project),
        )
        .await?;
        Ok(true)
    }

    // --- Watchers ---

    fn attach_watcher(&self, project: &SharedProject) {
        let location = project.location();
        let mut watchers = lock(&self.inner.watchers);
        let Entry::Vacant(slot) = watchers.entry(LocationKey::new(&location)) else {
            return;
        };
        let Some(refresher) = self.inner.refreshers.select(&location) else {
            tracing::trace!(location = %location, "no refresher for location");
            return;
        };

        let handler = update_handler(Arc::downgrade(&self.inner));
        match ResourceWatcher::attach(&location, refresher, Arc::clone(&self.inner.events), handler)
        {
            Ok(watcher) => {
                slot.insert(watcher);
            }
            Err(e) => {
                tracing::warn!(location = %location, error = %e, "project location will not be watched");
            }
        }
    }

    fn detach_watcher(&self, location: &str) {
        let watcher = lock(&self.inner.watchers).remove(&LocationKey::new(location));
        drop(watcher);
    }

    async fn handle_resource_update(&self, update: ResourceUpdate) -> Result<(), DispatchError> {
        let key = LocationKey::new(&update.location);
        if self.inner.is_in_flight(&key) {
            tracing::debug!(location = %update.location, "change ignored during own load or save");
            return Ok(());
        }
        let Some(project) = self.inner.find(&update.location) else {
            return Ok(());
        };
        tracing::debug!(
            location = %update.location,
            path = %update.changed_path.display(),
            "project changed externally"
        );
        self.raise(
            &self.inner.events.refresh_required,
            RefreshRequiredArgs {
                location: project.location(),
                project,
                changed_path: update.changed_path,
            },
        )
        .await
    }
}

/// Route watcher updates to the manager without keeping it alive.
fn update_handler(inner: Weak<ManagerInner>) -> UpdateHandler {
    Arc::new(move |update: ResourceUpdate| -> BoxFuture<'static, ()> {
        let inner = inner.clone();
        Box::pin(async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let manager = ProjectManager { inner };
            // Detached so that a listener closing the project, which drops
            // the watcher and aborts its forwarder, still runs to completion.
            let handled = tokio::spawn(async move {
                if let Err(e) = manager.handle_resource_update(update).await {
                    tracing::error!(error = %e, "refresh-required listener failed");
                }
            });
            let _ = handled.await;
        })
    })
}

fn log_failure(operation: &str, location: &str, error: &ProjectError) {
    match error {
        ProjectError::Read { .. } | ProjectError::Write { .. } | ProjectError::Upgrade { .. } => {
            tracing::error!(location = %location, error = %error, "{operation} failed");
        }
        _ => {
            tracing::warn!(location = %location, error = %error, "{operation} failed");
        }
    }
}

/// Builder for [`ProjectManager`].
///
/// A reader and a writer are required. Everything else has a default:
/// multi-document mode, a 3 second event timeout, a validator and upgrader
/// that accept everything, and no change watching.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use projectfold::{ProjectManager, ProjectManagementMode};
/// use projectfold::memory::MemoryBackend;
///
/// let backend = Arc::new(MemoryBackend::new());
/// let manager = ProjectManager::builder()
///     .mode(ProjectManagementMode::SingleDocument)
///     .event_timeout(Duration::from_millis(500))
///     .reader(backend.clone())
///     .writer(backend)
///     .build()
///     .unwrap();
/// assert_eq!(manager.mode(), ProjectManagementMode::SingleDocument);
/// ```
pub struct ProjectManagerBuilder {
    config: ManagerConfig,
    reader: Option<Arc<dyn ProjectReader>>,
    writer: Option<Arc<dyn ProjectWriter>>,
    validator: Arc<dyn ProjectValidator>,
    upgrader: Arc<dyn ProjectUpgrader>,
    refreshers: Arc<dyn RefresherSelector>,
}

impl ProjectManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
            reader: None,
            writer: None,
            validator: Arc::new(NullValidator),
            upgrader: Arc::new(NullUpgrader),
            refreshers: Arc::new(NullRefresherSelector),
        }
    }

    /// Replace the whole configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Mode, event timeout and refresh policy.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set single- or multi-document mode. Read once by
    /// [`build`](ProjectManagerBuilder::build).
    pub fn mode(mut self, mode: ProjectManagementMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the soft timeout applied to each event fan-out.
    pub fn event_timeout(mut self, timeout: Duration) -> Self {
        self.config.event_timeout = timeout;
        self
    }

    pub fn reader(mut self, reader: Arc<dyn ProjectReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn ProjectWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ProjectValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn upgrader(mut self, upgrader: Arc<dyn ProjectUpgrader>) -> Self {
        self.upgrader = upgrader;
        self
    }

    /// Choose how loaded locations are watched for external changes.
    pub fn refresher_selector(mut self, selector: Arc<dyn RefresherSelector>) -> Self {
        self.refreshers = selector;
        self
    }

    /// Build the manager.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] if the reader or the writer is missing.
    pub fn build(self) -> Result<ProjectManager, BuildError> {
        let reader = self.reader.ok_or(BuildError::MissingReader)?;
        let writer = self.writer.ok_or(BuildError::MissingWriter)?;
        tracing::debug!(
            mode = ?self.config.mode,
            event_timeout = ?self.config.event_timeout,
            "project manager built"
        );
        Ok(ProjectManager {
            inner: Arc::new(ManagerInner {
                mode: self.config.mode,
                event_timeout: self.config.event_timeout,
                check_can_start_on_refresh: self.config.check_can_start_on_refresh,
                reader,
                writer,
                validator: self.validator,
                upgrader: self.upgrader,
                refreshers: self.refreshers,
                events: Arc::new(ProjectEvents::new()),
                states: StateTracker::new(),
                synchronizer: OperationSynchronizer::new(),
                activation: tokio::sync::Mutex::new(()),
                registry: Mutex::new(Registry::default()),
                watchers: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Default for ProjectManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
