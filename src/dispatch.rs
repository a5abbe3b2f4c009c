//! Ordered, cancelable async event fan-out with a soft timeout.
//!
//! Each lifecycle event has its own [`EventChannel`]. Listeners run one
//! after another in registration order. If the whole fan-out outlives the
//! timeout, the rest of it moves to a background task and the caller goes
//! on with a warning. A listener error stops the fan-out and is returned.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{BoxError, DispatchError};
use crate::event::{
    ActivationEventArgs, ActivationFailedArgs, ProjectEventArgs, ProjectEventKind,
    ProjectFailedArgs, RefreshRequiredArgs,
};
use crate::synchronizer::{current_chain, scope_chain};

/// What a listener returns. An `Err` aborts the lifecycle operation.
pub type ListenerResult = Result<(), BoxError>;

type Listener<P> = Arc<dyn Fn(Arc<P>) -> BoxFuture<'static, ListenerResult> + Send + Sync>;

/// Handle returned by [`EventChannel::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// How a fan-out ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nobody was listening.
    NoListeners,
    /// Every listener ran to completion.
    Completed,
    /// The timeout elapsed; remaining listeners continue in the background.
    TimedOut,
}

/// Ordered listener list for one event.
///
/// `P` is the payload type. Listeners receive it behind an `Arc`, so
/// cancelable payloads expose their cancel flag through `&self`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use projectfold::{DispatchOutcome, EventChannel, ProjectEventArgs, ProjectEventKind};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), projectfold::DispatchError> {
/// let loading = EventChannel::<ProjectEventArgs>::new(ProjectEventKind::Loading);
/// loading.subscribe(|args: Arc<ProjectEventArgs>| async move {
///     if args.location.ends_with(".tmp") {
///         args.cancel();
///     }
///     Ok(())
/// });
///
/// let args = Arc::new(ProjectEventArgs::new("scratch.tmp"));
/// let outcome = loading.raise(Arc::clone(&args), Duration::from_secs(3)).await?;
/// assert_eq!(outcome, DispatchOutcome::Completed);
/// assert!(args.is_canceled());
/// # Ok(())
/// # }
/// ```
pub struct EventChannel<P> {
    kind: ProjectEventKind,
    listeners: RwLock<Vec<(ListenerId, Listener<P>)>>,
    next_id: AtomicU64,
}

impl<P> fmt::Debug for EventChannel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("kind", &self.kind)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl<P> EventChannel<P> {
    pub fn new(kind: ProjectEventKind) -> Self {
        Self {
            kind,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> ProjectEventKind {
        self.kind
    }

    /// Remove a listener. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<P: Send + Sync + 'static> EventChannel<P> {
    /// Register a listener at the end of the list.
    ///
    /// # Arguments
    ///
    /// * `listener` - Async callback invoked with the payload on every raise.
    ///
    /// # Returns
    ///
    /// A [`ListenerId`] for [`unsubscribe`](EventChannel::unsubscribe).
    pub fn subscribe<F, Fut>(&self, listener: F) -> ListenerId
    where
        F: Fn(Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener<P> =
            Arc::new(move |payload| -> BoxFuture<'static, ListenerResult> {
                Box::pin(listener(payload))
            });
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Invoke every listener in order, bounded by `timeout`.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe
    /// or unsubscribe without affecting the running fan-out.
    ///
    /// # Returns
    ///
    /// The [`DispatchOutcome`]. Any cancel flag on the payload is left for
    /// the caller to inspect.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Listener`] if a listener fails before the
    /// timeout. Failures after the timeout are logged by the background task.
    pub async fn raise(
        &self,
        payload: Arc<P>,
        timeout: Duration,
    ) -> Result<DispatchOutcome, DispatchError> {
        let listeners: Vec<Listener<P>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        if listeners.is_empty() {
            return Ok(DispatchOutcome::NoListeners);
        }

        let kind = self.kind;
        let mut fan_out: BoxFuture<'static, ListenerResult> = Box::pin(async move {
            for listener in listeners {
                listener(Arc::clone(&payload)).await?;
            }
            Ok(())
        });

        match tokio::time::timeout(timeout, &mut fan_out).await {
            Ok(Ok(())) => Ok(DispatchOutcome::Completed),
            Ok(Err(source)) => Err(DispatchError::Listener {
                event: kind,
                source,
            }),
            Err(_) => {
                tracing::warn!(
                    event = %kind,
                    timeout = ?timeout,
                    "event listeners did not finish in time, continuing in background"
                );
                let chain = current_chain();
                tokio::spawn(async move {
                    if let Err(e) = scope_chain(chain, fan_out).await {
                        tracing::error!(
                            event = %kind,
                            error = %e,
                            "background event listener failed"
                        );
                    }
                });
                Ok(DispatchOutcome::TimedOut)
            }
        }
    }
}

/// One [`EventChannel`] per lifecycle event.
///
/// Obtained from [`ProjectManager::events`](crate::ProjectManager::events).
#[derive(Debug)]
pub struct ProjectEvents {
    pub loading: EventChannel<ProjectEventArgs>,
    pub loaded: EventChannel<ProjectEventArgs>,
    pub loading_failed: EventChannel<ProjectFailedArgs>,
    pub loading_canceled: EventChannel<ProjectEventArgs>,

    pub saving: EventChannel<ProjectEventArgs>,
    pub saved: EventChannel<ProjectEventArgs>,
    pub saving_failed: EventChannel<ProjectFailedArgs>,
    pub saving_canceled: EventChannel<ProjectEventArgs>,

    pub refreshing: EventChannel<ProjectEventArgs>,
    pub refreshed: EventChannel<ProjectEventArgs>,
    pub refreshing_failed: EventChannel<ProjectFailedArgs>,
    pub refreshing_canceled: EventChannel<ProjectEventArgs>,
    pub refresh_required: EventChannel<RefreshRequiredArgs>,

    pub closing: EventChannel<ProjectEventArgs>,
    pub closed: EventChannel<ProjectEventArgs>,
    pub closing_canceled: EventChannel<ProjectEventArgs>,

    pub activating: EventChannel<ActivationEventArgs>,
    pub activated: EventChannel<ActivationEventArgs>,
    pub activation_failed: EventChannel<ActivationFailedArgs>,
    pub activation_canceled: EventChannel<ActivationEventArgs>,
}

impl Default for ProjectEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectEvents {
    pub fn new() -> Self {
        use ProjectEventKind as K;
        Self {
            loading: EventChannel::new(K::Loading),
            loaded: EventChannel::new(K::Loaded),
            loading_failed: EventChannel::new(K::LoadingFailed),
            loading_canceled: EventChannel::new(K::LoadingCanceled),
            saving: EventChannel::new(K::Saving),
            saved: EventChannel::new(K::Saved),
            saving_failed: EventChannel::new(K::SavingFailed),
            saving_canceled: EventChannel::new(K::SavingCanceled),
            refreshing: EventChannel::new(K::Refreshing),
            refreshed: EventChannel::new(K::Refreshed),
            refreshing_failed: EventChannel::new(K::RefreshingFailed),
            refreshing_canceled: EventChannel::new(K::RefreshingCanceled),
            refresh_required: EventChannel::new(K::RefreshRequired),
            closing: EventChannel::new(K::Closing),
            closed: EventChannel::new(K::Closed),
            closing_canceled: EventChannel::new(K::ClosingCanceled),
            activating: EventChannel::new(K::Activating),
            activated: EventChannel::new(K::Activated),
            activation_failed: EventChannel::new(K::ActivationFailed),
            activation_canceled: EventChannel::new(K::ActivationCanceled),
        }
    }
}
