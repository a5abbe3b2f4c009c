//! Lifecycle event kinds and their payloads.
//!
//! Every lifecycle operation raises a fixed sequence of staged events. The
//! "before" stages (`Loading`, `Saving`, `Refreshing`, `Closing`,
//! `Activating`) carry a [`CancelFlag`]; the manager inspects it once the
//! whole fan-out has finished.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::collaborator::ValidationContext;
use crate::error::ProjectError;
use crate::project::{LocationKey, SharedProject};

/// Identifies one lifecycle event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectEventKind {
    Loading,
    Loaded,
    LoadingFailed,
    LoadingCanceled,
    Saving,
    Saved,
    SavingFailed,
    SavingCanceled,
    Refreshing,
    Refreshed,
    RefreshingFailed,
    RefreshingCanceled,
    RefreshRequired,
    Closing,
    Closed,
    ClosingCanceled,
    Activating,
    Activated,
    ActivationFailed,
    ActivationCanceled,
}

impl ProjectEventKind {
    /// Stable event name, used in log fields and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Loading => "Loading",
            Self::Loaded => "Loaded",
            Self::LoadingFailed => "LoadingFailed",
            Self::LoadingCanceled => "LoadingCanceled",
            Self::Saving => "Saving",
            Self::Saved => "Saved",
            Self::SavingFailed => "SavingFailed",
            Self::SavingCanceled => "SavingCanceled",
            Self::Refreshing => "Refreshing",
            Self::Refreshed => "Refreshed",
            Self::RefreshingFailed => "RefreshingFailed",
            Self::RefreshingCanceled => "RefreshingCanceled",
            Self::RefreshRequired => "RefreshRequired",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::ClosingCanceled => "ClosingCanceled",
            Self::Activating => "Activating",
            Self::Activated => "Activated",
            Self::ActivationFailed => "ActivationFailed",
            Self::ActivationCanceled => "ActivationCanceled",
        }
    }

    /// Returns `true` for the stages whose payload can be canceled.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Saving | Self::Refreshing | Self::Closing | Self::Activating
        )
    }
}

impl fmt::Display for ProjectEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cancellation request set by a listener.
///
/// Listeners receive payloads behind an `Arc`, so the flag is atomic. Once
/// set it stays set.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Payload for load, save, refresh and close stages.
///
/// `project` is `None` while a load has not produced an instance yet.
#[derive(Debug)]
pub struct ProjectEventArgs {
    /// Location the operation targets.
    pub location: String,
    /// The project involved, when one exists.
    pub project: Option<SharedProject>,
    cancel: CancelFlag,
}

impl ProjectEventArgs {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            project: None,
            cancel: CancelFlag::default(),
        }
    }

    /// Attach the project to the payload.
    pub fn with_project(mut self, project: SharedProject) -> Self {
        self.project = Some(project);
        self
    }

    /// Request cancellation. Only honoured on cancelable stages.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

/// Payload for `LoadingFailed`, `SavingFailed` and `RefreshingFailed`.
#[derive(Debug)]
pub struct ProjectFailedArgs {
    pub location: String,
    pub project: Option<SharedProject>,
    /// Why the operation failed.
    pub error: Arc<ProjectError>,
}

impl ProjectFailedArgs {
    pub fn new(location: impl Into<String>, error: ProjectError) -> Self {
        Self {
            location: location.into(),
            project: None,
            error: Arc::new(error),
        }
    }

    pub fn with_project(mut self, project: SharedProject) -> Self {
        self.project = Some(project);
        self
    }

    /// Validation details, when the failure came from the validator.
    pub fn validation(&self) -> Option<&ValidationContext> {
        self.error.validation()
    }
}

/// Payload for activation stages.
///
/// `is_refresh` is `true` when both sides are set and share a location: the
/// same project was reloaded as a new instance.
#[derive(Debug)]
pub struct ActivationEventArgs {
    /// Project being deactivated, if any.
    pub old: Option<SharedProject>,
    /// Project being activated, or `None` to clear the active project.
    pub new: Option<SharedProject>,
    pub is_refresh: bool,
    cancel: CancelFlag,
}

impl ActivationEventArgs {
    pub fn new(old: Option<SharedProject>, new: Option<SharedProject>) -> Self {
        let is_refresh = is_refresh(old.as_ref(), new.as_ref());
        Self {
            old,
            new,
            is_refresh,
            cancel: CancelFlag::default(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }
}

/// Payload for `ActivationFailed`.
#[derive(Debug)]
pub struct ActivationFailedArgs {
    pub old: Option<SharedProject>,
    pub new: Option<SharedProject>,
    pub error: Arc<ProjectError>,
}

/// Payload for `RefreshRequired`: an external change was observed for an
/// open project.
#[derive(Debug)]
pub struct RefreshRequiredArgs {
    pub location: String,
    pub project: SharedProject,
    /// The path reported by the change source.
    pub changed_path: PathBuf,
}

fn is_refresh(old: Option<&SharedProject>, new: Option<&SharedProject>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => LocationKey::new(&old.location()).matches(&new.location()),
        _ => false,
    }
}
