//! Observer-visible lifecycle flags per location.
//!
//! [`StateTracker`] owns one [`ProjectState`] record per location that has
//! taken part in an operation. Callers only ever see copies. Every change is
//! published on a broadcast channel as a [`StateEvent`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::project::LocationKey;

/// Capacity of the state-change broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 256;

/// Snapshot of the lifecycle flags for one location.
///
/// All flags default to `false`. Records are created lazily on the first
/// transition and persist after the operation completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectState {
    pub is_loading: bool,
    pub is_saving: bool,
    pub is_closing: bool,
    pub is_activating: bool,
    pub is_deactivating: bool,
    pub is_refreshing: bool,
}

impl ProjectState {
    /// The state reported for a location the tracker has never seen.
    pub const DEFAULT: ProjectState = ProjectState {
        is_loading: false,
        is_saving: false,
        is_closing: false,
        is_activating: false,
        is_deactivating: false,
        is_refreshing: false,
    };

    /// Returns `true` if any lifecycle flag is set.
    pub fn is_busy(&self) -> bool {
        self.is_loading
            || self.is_saving
            || self.is_closing
            || self.is_activating
            || self.is_deactivating
            || self.is_refreshing
    }
}

/// Notification published by the [`StateTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A location's flags were updated. Carries a copy of the new state.
    StateChanged {
        location: LocationKey,
        state: ProjectState,
    },
    /// The derived "refreshing the active project" flag flipped.
    RefreshingActiveProjectChanged(bool),
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<LocationKey, ProjectState>,
    refreshing_active: Option<LocationKey>,
}

/// Maintains the per-location [`ProjectState`] map and the derived
/// "is refreshing the active project" flag.
///
/// Mutations take a short exclusive lock for the read-modify-write only.
/// Notifications are sent after the lock is released, so subscribers may
/// query the tracker freely.
#[derive(Debug)]
pub struct StateTracker {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Subscribe to state-change notifications.
    ///
    /// Slow receivers may observe `RecvError::Lagged`; the tracker never
    /// blocks on subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Returns a copy of the state for `location`, or
    /// [`ProjectState::DEFAULT`] if the location is unknown.
    pub fn state(&self, location: &str) -> ProjectState {
        let key = LocationKey::new(location);
        self.lock()
            .states
            .get(&key)
            .copied()
            .unwrap_or(ProjectState::DEFAULT)
    }

    /// Returns the derived "refreshing the active project" flag.
    pub fn is_refreshing_active_project(&self) -> bool {
        self.lock().refreshing_active.is_some()
    }

    pub fn set_loading(&self, location: &str, value: bool) {
        self.update(location, |state, _| state.is_loading = value);
    }

    pub fn set_saving(&self, location: &str, value: bool) {
        self.update(location, |state, _| state.is_saving = value);
    }

    pub fn set_closing(&self, location: &str, value: bool) {
        self.update(location, |state, _| state.is_closing = value);
    }

    pub fn set_deactivating(&self, location: &str, value: bool) {
        self.update(location, |state, _| state.is_deactivating = value);
    }

    /// Set the refreshing flag.
    ///
    /// With `is_active_project`, the derived flag follows `value`. Without
    /// it, clearing the flag for the location that owns the derived flag
    /// leaves the derived flag alone: it is cleared by the activation that
    /// completes the refresh.
    pub fn set_refreshing(&self, location: &str, value: bool, is_active_project: bool) {
        self.update(location, |state, refreshing_active| {
            state.is_refreshing = value;
            if is_active_project {
                *refreshing_active = value.then(|| LocationKey::new(location));
            }
        });
    }

    /// Set the activating flag.
    ///
    /// If the location is mid-refresh, the derived flag follows `value`.
    /// Clearing activation on the location that owns the derived flag also
    /// clears it.
    pub fn set_activating(&self, location: &str, value: bool) {
        let key = LocationKey::new(location);
        self.update(location, |state, refreshing_active| {
            state.is_activating = value;
            if state.is_refreshing && value {
                *refreshing_active = Some(key.clone());
            } else if !value && refreshing_active.as_ref() == Some(&key) {
                *refreshing_active = None;
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, location: &str, apply: F)
    where
        F: FnOnce(&mut ProjectState, &mut Option<LocationKey>),
    {
        if location.is_empty() {
            return;
        }
        let key = LocationKey::new(location);

        let (state, derived_change) = {
            let mut inner = self.lock();
            let Inner {
                states,
                refreshing_active,
            } = &mut *inner;
            let was_refreshing_active = refreshing_active.is_some();
            let state = states.entry(key.clone()).or_default();
            apply(state, refreshing_active);
            let now_refreshing_active = refreshing_active.is_some();
            let derived_change =
                (was_refreshing_active != now_refreshing_active).then_some(now_refreshing_active);
            (*state, derived_change)
        };

        tracing::trace!(location = %key, ?state, "project state changed");
        // No receivers is not an error.
        let _ = self.events.send(StateEvent::StateChanged {
            location: key,
            state,
        });
        if let Some(flag) = derived_change {
            tracing::debug!(refreshing_active = flag, "refreshing-active-project changed");
            let _ = self
                .events
                .send(StateEvent::RefreshingActiveProjectChanged(flag));
        }
    }
}
