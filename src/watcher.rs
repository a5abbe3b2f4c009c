//! Change notification for open projects.
//!
//! A [`RefresherSelector`] picks a [`ProjectRefresher`] for each loaded
//! location. The manager wraps it in a `ResourceWatcher` that forwards
//! external changes back to it, except while the manager is saving that
//! location itself.
//!
//! [`FileRefresher`] is the filesystem implementation, built on `notify`
//! with a bridge into a tokio channel.

use std::future::Ready;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::{ListenerId, ListenerResult, ProjectEvents};
use crate::error::WatchError;
use crate::event::{ProjectEventArgs, ProjectFailedArgs};
use crate::project::LocationKey;

/// An external change observed for a watched location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUpdate {
    /// The watched project location.
    pub location: String,
    /// The path the change source reported.
    pub changed_path: PathBuf,
}

/// Where refreshers deliver their updates.
pub type UpdateSink = mpsc::UnboundedSender<ResourceUpdate>;

/// Source of change notifications for one location.
pub trait ProjectRefresher: Send + Sync {
    /// Start delivering updates into `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError`] if the change source cannot be attached.
    fn subscribe(&self, sink: UpdateSink) -> Result<(), WatchError>;

    /// Stop delivering updates. Calling it twice is harmless.
    fn unsubscribe(&self);
}

/// Chooses a refresher for a location, or none when the location kind
/// cannot be watched.
pub trait RefresherSelector: Send + Sync {
    fn select(&self, location: &str) -> Option<Arc<dyn ProjectRefresher>>;
}

/// Selector that never watches anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRefresherSelector;

impl RefresherSelector for NullRefresherSelector {
    fn select(&self, _location: &str) -> Option<Arc<dyn ProjectRefresher>> {
        None
    }
}

/// Selector that watches every location that exists on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileRefresherSelector;

impl RefresherSelector for FileRefresherSelector {
    fn select(&self, location: &str) -> Option<Arc<dyn ProjectRefresher>> {
        Path::new(location)
            .exists()
            .then(|| Arc::new(FileRefresher::new(location)) as Arc<dyn ProjectRefresher>)
    }
}

/// Watches a file or directory with the platform's recommended watcher.
///
/// A directory is watched recursively. A file is watched through its parent
/// directory, filtered to the file itself, so that editors replacing the
/// file by rename are still seen. Only create, modify and remove events are
/// forwarded.
pub struct FileRefresher {
    location: String,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl std::fmt::Debug for FileRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRefresher")
            .field("location", &self.location)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl FileRefresher {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            watcher: Mutex::new(None),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn is_subscribed(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn watch_error(&self, source: notify::Error) -> WatchError {
        WatchError::Notify {
            location: self.location.clone(),
            source,
        }
    }
}

impl ProjectRefresher for FileRefresher {
    fn subscribe(&self, sink: UpdateSink) -> Result<(), WatchError> {
        let path = std::fs::canonicalize(&self.location)
            .map_err(|e| self.watch_error(notify::Error::io(e)))?;

        let (root, mode, only) = if path.is_dir() {
            (path, RecursiveMode::Recursive, None)
        } else {
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone());
            (parent, RecursiveMode::NonRecursive, Some(path))
        };

        let location = self.location.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for changed_path in event.paths {
                        if only.as_ref().is_some_and(|file| *file != changed_path) {
                            continue;
                        }
                        let update = ResourceUpdate {
                            location: location.clone(),
                            changed_path,
                        };
                        // Receiver gone: the watcher is being torn down.
                        if sink.send(update).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(location = %location, error = %e, "filesystem watcher error");
                }
            },
        )
        .map_err(|e| self.watch_error(e))?;
        watcher
            .watch(&root, mode)
            .map_err(|e| self.watch_error(e))?;

        tracing::debug!(location = %self.location, root = %root.display(), "watching project location");
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(())
    }

    fn unsubscribe(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if watcher.is_some() {
            tracing::debug!(location = %self.location, "stopped watching project location");
        }
    }
}

/// Callback receiving updates that survive suspension.
pub(crate) type UpdateHandler = Arc<dyn Fn(ResourceUpdate) -> BoxFuture<'static, ()> + Send + Sync>;

/// Listener ids registered on the save channels.
struct SaveListeners {
    saving: ListenerId,
    saved: ListenerId,
    saving_failed: ListenerId,
    saving_canceled: ListenerId,
}

/// Per-location binding between a refresher and the manager.
///
/// While the manager saves the location, updates are dropped. Dropping the
/// watcher unsubscribes everything it attached.
pub(crate) struct ResourceWatcher {
    key: LocationKey,
    refresher: Arc<dyn ProjectRefresher>,
    suspended: Arc<AtomicBool>,
    events: Arc<ProjectEvents>,
    listeners: SaveListeners,
    forwarder: JoinHandle<()>,
}

impl ResourceWatcher {
    /// Subscribe `refresher` and start forwarding its updates to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn attach(
        location: &str,
        refresher: Arc<dyn ProjectRefresher>,
        events: Arc<ProjectEvents>,
        handler: UpdateHandler,
    ) -> Result<Self, WatchError> {
        let key = LocationKey::new(location);
        let (sink, mut updates) = mpsc::unbounded_channel();
        refresher.subscribe(sink)?;

        let suspended = Arc::new(AtomicBool::new(false));
        let forwarder = {
            let suspended = Arc::clone(&suspended);
            let key = key.clone();
            tokio::spawn(async move {
                while let Some(update) = updates.recv().await {
                    if suspended.load(Ordering::Acquire) {
                        tracing::trace!(location = %key, path = %update.changed_path.display(), "update ignored while saving");
                        continue;
                    }
                    handler(update).await;
                }
            })
        };

        let listeners = SaveListeners {
            saving: events
                .saving
                .subscribe(suspend_on::<ProjectEventArgs>(&key, &suspended, true, |a| &a.location)),
            saved: events
                .saved
                .subscribe(suspend_on::<ProjectEventArgs>(&key, &suspended, false, |a| &a.location)),
            saving_failed: events
                .saving_failed
                .subscribe(suspend_on::<ProjectFailedArgs>(&key, &suspended, false, |a| &a.location)),
            saving_canceled: events
                .saving_canceled
                .subscribe(suspend_on::<ProjectEventArgs>(&key, &suspended, false, |a| &a.location)),
        };

        Ok(Self {
            key,
            refresher,
            suspended,
            events,
            listeners,
            forwarder,
        })
    }

    #[cfg(test)]
    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

/// Build a save-channel listener that sets `suspended` to `value` when the
/// event targets `key`.
fn suspend_on<P>(
    key: &LocationKey,
    suspended: &Arc<AtomicBool>,
    value: bool,
    location: fn(&P) -> &String,
) -> impl Fn(Arc<P>) -> Ready<ListenerResult> + Send + Sync + 'static
where
    P: Send + Sync + 'static,
{
    let key = key.clone();
    let suspended = Arc::clone(suspended);
    move |args: Arc<P>| {
        if key.matches(location(args.as_ref())) {
            suspended.store(value, Ordering::Release);
        }
        std::future::ready(Ok(()))
    }
}

impl Drop for ResourceWatcher {
    fn drop(&mut self) {
        self.refresher.unsubscribe();
        self.forwarder.abort();
        self.events.saving.unsubscribe(self.listeners.saving);
        self.events.saved.unsubscribe(self.listeners.saved);
        self.events.saving_failed.unsubscribe(self.listeners.saving_failed);
        self.events
            .saving_canceled
            .unsubscribe(self.listeners.saving_canceled);
        tracing::trace!(location = %self.key, "resource watcher detached");
    }
}
