use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use projectfold::memory::{MemoryBackend, MemoryProject};
use projectfold::{
    ActivationEventArgs, BoxError, EventChannel, ProjectError, ProjectEventArgs, ProjectFailedArgs,
    ProjectManagementMode, ProjectManager, ProjectRefresher, RefreshRequiredArgs,
    RefresherSelector, ResourceUpdate, SharedProject, StateEvent, UpdateSink, WatchError,
};
use tokio::sync::{Notify, mpsc};

const DEADLOCK_GUARD: Duration = Duration::from_secs(5);

type Log = Arc<Mutex<Vec<&'static str>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager(backend: &Arc<MemoryBackend>) -> ProjectManager {
    init_tracing();
    ProjectManager::builder()
        .reader(backend.clone())
        .writer(backend.clone())
        .build()
        .unwrap()
}

/// Append the channel's event name to `log` on every raise.
fn record<P: Send + Sync + 'static>(channel: &EventChannel<P>, log: &Log) {
    let log = Arc::clone(log);
    let name = channel.kind().name();
    channel.subscribe(move |_| {
        log.lock().unwrap().push(name);
        async { Ok(()) }
    });
}

fn record_all(manager: &ProjectManager) -> Log {
    let log = Log::default();
    let events = manager.events();
    record(&events.loading, &log);
    record(&events.loaded, &log);
    record(&events.loading_failed, &log);
    record(&events.loading_canceled, &log);
    record(&events.closing, &log);
    record(&events.closed, &log);
    record(&events.activating, &log);
    record(&events.activated, &log);
    log
}

fn count(log: &Log, name: &str) -> usize {
    log.lock().unwrap().iter().filter(|n| **n == name).count()
}

#[tokio::test(start_paused = true)]
async fn concurrent_loads_of_one_location_read_once() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("x", "content")
            .with_read_delay(Duration::from_millis(50)),
    );
    let manager = manager(&backend);
    let log = record_all(&manager);

    let (first, second) = tokio::join!(manager.load("x"), manager.load("X"));
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(backend.read_count(), 1);
    assert_eq!(backend.peak_reads_per_location(), 1);
    assert_eq!(count(&log, "Loading"), 1);
    assert_eq!(count(&log, "Loaded"), 1);
    assert_eq!(manager.projects().len(), 1);
}

#[tokio::test]
async fn loads_of_different_locations_progress_independently() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("a", "")
            .with_document("b", ""),
    );
    let manager = manager(&backend);
    let b_loaded = Arc::new(Notify::new());

    // A's Loading listener only finishes once B is loaded.
    {
        let b_loaded = Arc::clone(&b_loaded);
        manager
            .events()
            .loading
            .subscribe(move |args: Arc<ProjectEventArgs>| {
                let b_loaded = Arc::clone(&b_loaded);
                async move {
                    if args.location == "a" {
                        b_loaded.notified().await;
                    }
                    Ok(())
                }
            });
    }
    {
        let b_loaded = Arc::clone(&b_loaded);
        manager
            .events()
            .loaded
            .subscribe(move |args: Arc<ProjectEventArgs>| {
                if args.location == "b" {
                    b_loaded.notify_one();
                }
                async { Ok(()) }
            });
    }

    let (a, b) = tokio::time::timeout(
        DEADLOCK_GUARD,
        async { tokio::join!(manager.load("a"), manager.load("b")) },
    )
    .await
    .expect("load of b must not wait for a's listener");
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());
}

#[tokio::test]
async fn close_then_reload_gives_a_fresh_instance() {
    let backend = Arc::new(MemoryBackend::new().with_document("x", ""));
    let manager = manager(&backend);

    let first = manager.load("x").await.unwrap().unwrap();
    assert!(manager.close(&first).await.unwrap());
    assert!(manager.projects().is_empty());
    assert!(manager.active_project().is_none());

    let second = manager.load("x").await.unwrap().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(second.location(), "x");
}

#[tokio::test]
async fn single_document_mode_rejects_second_load() {
    init_tracing();
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("a", "")
            .with_document("b", ""),
    );
    let manager = ProjectManager::builder()
        .mode(ProjectManagementMode::SingleDocument)
        .reader(backend.clone())
        .writer(backend.clone())
        .build()
        .unwrap();

    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        manager
            .events()
            .loading_failed
            .subscribe(move |args: Arc<ProjectFailedArgs>| {
                failures.lock().unwrap().push(Arc::clone(&args.error));
                async { Ok(()) }
            });
    }

    let a = manager.load("a").await.unwrap().unwrap();
    assert!(manager.load("b").await.unwrap().is_none());

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(*failures[0], ProjectError::SdiViolation { .. }));
    assert_eq!(manager.active_project().unwrap().id(), a.id());
    assert_eq!(backend.read_count(), 1);
}

#[tokio::test]
async fn canceled_load_leaves_collection_untouched() {
    let backend = Arc::new(MemoryBackend::new().with_document("a", ""));
    let manager = manager(&backend);
    manager
        .events()
        .loading
        .subscribe(|args: Arc<ProjectEventArgs>| async move {
            args.cancel();
            Ok(())
        });
    let log = record_all(&manager);

    assert!(manager.load("a").await.unwrap().is_none());
    assert_eq!(count(&log, "LoadingCanceled"), 1);
    assert_eq!(count(&log, "LoadingFailed"), 0);
    assert_eq!(count(&log, "Loaded"), 0);
    assert!(manager.projects().is_empty());
    assert!(!manager.state("a").is_loading);
    assert_eq!(backend.read_count(), 0);
}

#[tokio::test]
async fn reactivation_after_refresh_is_tagged_as_refresh() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("a", "")
            .with_document("b", ""),
    );
    let manager = manager(&backend);
    let a = manager.load("a").await.unwrap().unwrap();
    manager.load("b").await.unwrap().unwrap();

    let activations = Arc::new(Mutex::new(Vec::new()));
    {
        let activations = Arc::clone(&activations);
        manager
            .events()
            .activated
            .subscribe(move |args: Arc<ActivationEventArgs>| {
                let new = args.new.as_ref().map(|p| p.location());
                activations.lock().unwrap().push((new, args.is_refresh));
                async { Ok(()) }
            });
    }

    // Switching between locations.
    assert!(manager.set_active_project(Some(&a)).await.unwrap());
    // Reloading the active project deactivates it, then activates the new
    // instance at the same location.
    assert!(manager.refresh(&a).await.unwrap());

    let activations = activations.lock().unwrap().clone();
    assert_eq!(
        activations,
        vec![
            (Some("a".to_owned()), false),
            (None, false),
            (Some("a".to_owned()), true),
        ]
    );
    let active = manager.active_project().unwrap();
    assert_eq!(active.location(), "a");
    assert_ne!(active.id(), a.id());
}

#[tokio::test]
async fn save_from_closing_listener_does_not_deadlock() {
    let backend = Arc::new(MemoryBackend::new().with_document("a", ""));
    let manager = manager(&backend);
    let project = manager.load("a").await.unwrap().unwrap();
    project.mark_dirty();

    {
        let saver = manager.clone();
        manager
            .events()
            .closing
            .subscribe(move |args: Arc<ProjectEventArgs>| {
                let saver = saver.clone();
                async move {
                    if let Some(project) = &args.project
                        && project.is_dirty()
                    {
                        saver.save(project, None).await?;
                    }
                    Ok::<(), BoxError>(())
                }
            });
    }

    let closed = tokio::time::timeout(DEADLOCK_GUARD, manager.close(&project))
        .await
        .expect("save inside close must not deadlock")
        .unwrap();
    assert!(closed);
    assert_eq!(backend.write_count(), 1);
    assert!(!project.is_dirty());
}

#[tokio::test]
async fn save_from_refreshing_listener_does_not_deadlock() {
    let backend = Arc::new(MemoryBackend::new().with_document("a", "v1"));
    let manager = manager(&backend);
    let project = manager.load("a").await.unwrap().unwrap();

    {
        let saver = manager.clone();
        manager
            .events()
            .refreshing
            .subscribe(move |args: Arc<ProjectEventArgs>| {
                let saver = saver.clone();
                async move {
                    if let Some(project) = &args.project {
                        saver.save(project, None).await?;
                    }
                    Ok::<(), BoxError>(())
                }
            });
    }

    let refreshed = tokio::time::timeout(DEADLOCK_GUARD, manager.refresh(&project))
        .await
        .expect("save inside refresh must not deadlock")
        .unwrap();
    assert!(refreshed);
    assert_eq!(backend.write_count(), 1);
}

#[tokio::test]
async fn load_events_fire_in_stage_order() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("a", "")
            .with_document("b", ""),
    );
    let manager = manager(&backend);
    let log = record_all(&manager);

    manager.load("a").await.unwrap().unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        ["Loading", "Loaded", "Activating", "Activated"]
    );

    log.lock().unwrap().clear();
    manager.load_inactive("b").await.unwrap().unwrap();
    assert_eq!(*log.lock().unwrap(), ["Loading", "Loaded"]);
}

#[tokio::test]
async fn loading_into_empty_manager_activates_the_project() {
    let backend = Arc::new(MemoryBackend::new().with_document("dummyLocation", ""));
    let manager = manager(&backend);
    let log = record_all(&manager);

    manager.load("dummyLocation").await.unwrap().unwrap();

    assert_eq!(manager.active_project().unwrap().location(), "dummyLocation");
    assert_eq!(count(&log, "Loading"), 1);
    assert_eq!(count(&log, "Loaded"), 1);
    assert_eq!(count(&log, "Activating"), 1);
    assert_eq!(count(&log, "Activated"), 1);
}

#[tokio::test]
async fn reader_failure_is_reported_through_loading_failed() {
    let backend = Arc::new(MemoryBackend::new().with_failing_read("cannotload"));
    let manager = manager(&backend);

    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        manager
            .events()
            .loading_failed
            .subscribe(move |args: Arc<ProjectFailedArgs>| {
                failures.lock().unwrap().push(Arc::clone(&args.error));
                async { Ok(()) }
            });
    }

    assert!(manager.load("cannotload").await.unwrap().is_none());
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(*failures[0], ProjectError::Read { .. }));
    assert!(manager.active_project().is_none());
    assert!(manager.projects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_listener_does_not_hold_up_the_operation() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new().with_document("a", ""));
    let manager = ProjectManager::builder()
        .event_timeout(Duration::from_millis(100))
        .reader(backend.clone())
        .writer(backend.clone())
        .build()
        .unwrap();

    let finished = Arc::new(AtomicBool::new(false));
    {
        let finished = Arc::clone(&finished);
        manager.events().loaded.subscribe(move |_| {
            let finished = Arc::clone(&finished);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
    }

    let project = manager.load("a").await.unwrap().unwrap();
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(manager.active_project().unwrap().id(), project.id());

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn state_changes_are_published() {
    let backend = Arc::new(MemoryBackend::new().with_document("a", ""));
    let manager = manager(&backend);
    let mut states = manager.subscribe_state();

    manager.load_inactive("a").await.unwrap().unwrap();

    let mut loading = Vec::new();
    while let Ok(event) = states.try_recv() {
        if let StateEvent::StateChanged { location, state } = event {
            assert_eq!(location.as_str(), "a");
            loading.push(state.is_loading);
        }
    }
    assert_eq!(loading.first(), Some(&true));
    assert_eq!(loading.last(), Some(&false));
    assert!(!manager.state("a").is_busy());
}

/// Change source driven by the test.
#[derive(Default)]
struct ManualRefresher {
    sink: Mutex<Option<UpdateSink>>,
}

impl ManualRefresher {
    fn is_subscribed(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    fn emit(&self, location: &str, path: &str) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            let _ = sink.send(ResourceUpdate {
                location: location.to_owned(),
                changed_path: PathBuf::from(path),
            });
        }
    }
}

impl ProjectRefresher for ManualRefresher {
    fn subscribe(&self, sink: UpdateSink) -> Result<(), WatchError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn unsubscribe(&self) {
        self.sink.lock().unwrap().take();
    }
}

struct ManualSelector(Arc<ManualRefresher>);

impl RefresherSelector for ManualSelector {
    fn select(&self, _location: &str) -> Option<Arc<dyn ProjectRefresher>> {
        Some(Arc::clone(&self.0) as Arc<dyn ProjectRefresher>)
    }
}

#[tokio::test]
async fn external_change_raises_refresh_required() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new().with_document("doc", ""));
    let refresher = Arc::new(ManualRefresher::default());
    let manager = ProjectManager::builder()
        .reader(backend.clone())
        .writer(backend.clone())
        .refresher_selector(Arc::new(ManualSelector(Arc::clone(&refresher))))
        .build()
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<(String, PathBuf, SharedProject)>();
    manager
        .events()
        .refresh_required
        .subscribe(move |args: Arc<RefreshRequiredArgs>| {
            let _ = tx.send((
                args.location.clone(),
                args.changed_path.clone(),
                Arc::clone(&args.project),
            ));
            async { Ok(()) }
        });

    let project = manager.load("doc").await.unwrap().unwrap();
    assert!(refresher.is_subscribed());

    refresher.emit("doc", "/work/doc");
    let (location, path, reported) = tokio::time::timeout(DEADLOCK_GUARD, rx.recv())
        .await
        .expect("refresh-required should be raised")
        .unwrap();
    assert_eq!(location, "doc");
    assert_eq!(path, PathBuf::from("/work/doc"));
    assert_eq!(reported.id(), project.id());

    assert!(manager.close(&project).await.unwrap());
    assert!(!refresher.is_subscribed());
}

fn watched_manager(backend: &Arc<MemoryBackend>, refresher: &Arc<ManualRefresher>) -> ProjectManager {
    init_tracing();
    ProjectManager::builder()
        .reader(backend.clone())
        .writer(backend.clone())
        .refresher_selector(Arc::new(ManualSelector(Arc::clone(refresher))))
        .build()
        .unwrap()
}

/// Forward the changed path of every refresh-required event.
fn changed_paths(manager: &ProjectManager) -> mpsc::UnboundedReceiver<PathBuf> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager
        .events()
        .refresh_required
        .subscribe(move |args: Arc<RefreshRequiredArgs>| {
            let _ = tx.send(args.changed_path.clone());
            async { Ok(()) }
        });
    rx
}

#[tokio::test]
async fn change_during_own_load_is_ignored() {
    let backend = Arc::new(MemoryBackend::new().with_document("doc", ""));
    let refresher = Arc::new(ManualRefresher::default());
    let manager = watched_manager(&backend, &refresher);
    let mut paths = changed_paths(&manager);
    {
        let refresher = Arc::clone(&refresher);
        manager.events().loaded.subscribe(move |args: Arc<ProjectEventArgs>| {
            refresher.emit(&args.location, "/during-load");
            async {
                // Give the watcher time to deliver the update.
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        });
    }

    manager.load("doc").await.unwrap().unwrap();
    refresher.emit("doc", "/after-load");

    let first = tokio::time::timeout(DEADLOCK_GUARD, paths.recv())
        .await
        .expect("change after the load should be reported")
        .unwrap();
    assert_eq!(first, PathBuf::from("/after-load"));
    assert!(paths.try_recv().is_err());
}

#[tokio::test]
async fn change_during_own_save_is_ignored() {
    let backend = Arc::new(MemoryBackend::new().with_document("doc", ""));
    let refresher = Arc::new(ManualRefresher::default());
    let manager = watched_manager(&backend, &refresher);
    let mut paths = changed_paths(&manager);
    let project = manager.load("doc").await.unwrap().unwrap();

    // Subscribed after the watcher, so the watcher is no longer suspended here.
    {
        let refresher = Arc::clone(&refresher);
        manager.events().saved.subscribe(move |args: Arc<ProjectEventArgs>| {
            refresher.emit(&args.location, "/during-save");
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        });
    }

    assert!(manager.save(&project, None).await.unwrap());
    refresher.emit("doc", "/after-save");

    let first = tokio::time::timeout(DEADLOCK_GUARD, paths.recv())
        .await
        .expect("change after the save should be reported")
        .unwrap();
    assert_eq!(first, PathBuf::from("/after-save"));
    assert!(paths.try_recv().is_err());
}

#[tokio::test]
async fn canceled_save_writes_nothing() {
    let backend = Arc::new(MemoryBackend::new().with_document("a", "alpha"));
    let manager = manager(&backend);
    let project = manager.load("a").await.unwrap().unwrap();
    project
        .downcast_ref::<MemoryProject>()
        .unwrap()
        .set_content("edited");
    manager
        .events()
        .saving
        .subscribe(|args: Arc<ProjectEventArgs>| async move {
            args.cancel();
            Ok(())
        });
    let log = Log::default();
    record(&manager.events().saving_canceled, &log);
    record(&manager.events().saved, &log);

    assert!(!manager.save(&project, None).await.unwrap());
    assert_eq!(count(&log, "SavingCanceled"), 1);
    assert_eq!(count(&log, "Saved"), 0);
    assert_eq!(backend.write_count(), 0);
    assert_eq!(backend.document("a").as_deref(), Some("alpha"));
    assert!(project.is_dirty());
    assert!(!manager.state("a").is_saving);
}

#[tokio::test]
async fn canceled_refresh_keeps_instance() {
    let backend = Arc::new(MemoryBackend::new().with_document("a", ""));
    let manager = manager(&backend);
    let project = manager.load("a").await.unwrap().unwrap();
    manager
        .events()
        .refreshing
        .subscribe(|args: Arc<ProjectEventArgs>| async move {
            args.cancel();
            Ok(())
        });
    let log = record_all(&manager);
    record(&manager.events().refreshing_canceled, &log);
    record(&manager.events().refreshed, &log);

    assert!(!manager.refresh(&project).await.unwrap());
    assert_eq!(count(&log, "RefreshingCanceled"), 1);
    assert_eq!(count(&log, "Refreshed"), 0);
    assert_eq!(count(&log, "Activating"), 0);
    assert_eq!(backend.read_count(), 1);
    assert_eq!(manager.project("a").unwrap().id(), project.id());
    assert_eq!(manager.active_project().unwrap().id(), project.id());
    assert!(!manager.state("a").is_refreshing);
    assert!(!manager.is_refreshing_active_project());
}

#[tokio::test]
async fn canceled_activation_keeps_previous_project() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("a", "")
            .with_document("b", ""),
    );
    let manager = manager(&backend);
    let a = manager.load("a").await.unwrap().unwrap();
    let b = manager.load_inactive("b").await.unwrap().unwrap();
    manager
        .events()
        .activating
        .subscribe(|args: Arc<ActivationEventArgs>| async move {
            args.cancel();
            Ok(())
        });
    let log = Log::default();
    record(&manager.events().activation_canceled, &log);
    record(&manager.events().activated, &log);

    assert!(!manager.set_active_project(Some(&b)).await.unwrap());
    assert_eq!(count(&log, "ActivationCanceled"), 1);
    assert_eq!(count(&log, "Activated"), 0);
    assert_eq!(manager.active_project().unwrap().id(), a.id());
    assert!(!manager.state("a").is_deactivating);
    assert!(!manager.state("b").is_activating);
}

#[tokio::test]
async fn writer_error_is_reported_through_saving_failed() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_document("a", "alpha")
            .with_failing_write("a"),
    );
    let manager = manager(&backend);
    let project = manager.load("a").await.unwrap().unwrap();
    project
        .downcast_ref::<MemoryProject>()
        .unwrap()
        .set_content("edited");

    let failures = Arc::new(Mutex::new(Vec::new()));
    {
        let failures = Arc::clone(&failures);
        manager
            .events()
            .saving_failed
            .subscribe(move |args: Arc<ProjectFailedArgs>| {
                failures.lock().unwrap().push(Arc::clone(&args.error));
                async { Ok(()) }
            });
    }

    assert!(!manager.save(&project, None).await.unwrap());
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert!(matches!(&*failures[0], ProjectError::Write { location, .. } if location == "a"));
    assert_eq!(backend.write_count(), 1);
    assert_eq!(backend.document("a").as_deref(), Some("alpha"));
    assert!(project.is_dirty());
    assert!(!manager.state("a").is_saving);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_listener_timeout_is_ignored() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new().with_document("a", ""));
    let manager = ProjectManager::builder()
        .event_timeout(Duration::from_millis(100))
        .reader(backend.clone())
        .writer(backend.clone())
        .build()
        .unwrap();

    let canceled = Arc::new(AtomicBool::new(false));
    {
        let canceled = Arc::clone(&canceled);
        manager
            .events()
            .loading
            .subscribe(move |args: Arc<ProjectEventArgs>| {
                let canceled = Arc::clone(&canceled);
                async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    args.cancel();
                    canceled.store(true, Ordering::SeqCst);
                    Ok(())
                }
            });
    }
    let log = record_all(&manager);

    let project = manager.load("a").await.unwrap().unwrap();
    assert!(!canceled.load(Ordering::SeqCst));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(canceled.load(Ordering::SeqCst));
    assert_eq!(count(&log, "LoadingCanceled"), 0);
    assert_eq!(count(&log, "Loaded"), 1);
    assert_eq!(manager.project("a").unwrap().id(), project.id());
    assert_eq!(manager.active_project().unwrap().id(), project.id());
}
