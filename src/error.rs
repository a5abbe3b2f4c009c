//! Crate-level error types for lifecycle operations and event dispatch.

use crate::collaborator::ValidationContext;
use crate::event::ProjectEventKind;

/// Boxed error produced by collaborators (readers, writers, upgraders) and
/// event listeners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A recovered lifecycle failure.
///
/// These never escape a lifecycle method as `Err`. They are attached to the
/// matching `*Failed` event payload and the method returns `false` / `None`.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    /// A second project was loaded while the manager runs in single-document
    /// mode and another project is still open.
    #[error("cannot load '{location}': '{existing}' is already open in single-document mode")]
    SdiViolation {
        /// The location that was requested.
        location: String,
        /// The location of the project that is already open.
        existing: String,
    },

    /// The validator refused to start loading the location.
    #[error("loading '{location}' was refused by the validator")]
    CannotLoad {
        /// The location that was requested.
        location: String,
        /// Validation details collected for the refusal.
        validation: ValidationContext,
    },

    /// Location or project validation reported errors.
    #[error("validation of '{location}' failed: {validation}")]
    Validation {
        /// The location being validated.
        location: String,
        /// The validation result carrying at least one error.
        validation: ValidationContext,
    },

    /// The reader produced a project for a different location than requested.
    #[error("reader returned a project for '{actual}' while loading '{expected}'")]
    LocationMismatch {
        /// The location that was requested.
        expected: String,
        /// The location reported by the materialized project.
        actual: String,
    },

    /// The reader failed to materialize the project.
    #[error("failed to read '{location}': {source}")]
    Read {
        /// The location being read.
        location: String,
        /// The reader's error.
        #[source]
        source: BoxError,
    },

    /// The upgrader failed to migrate the location.
    #[error("failed to upgrade '{location}': {source}")]
    Upgrade {
        /// The location being upgraded.
        location: String,
        /// The upgrader's error.
        #[source]
        source: BoxError,
    },

    /// The writer raised an error.
    #[error("failed to write '{location}': {source}")]
    Write {
        /// The target location of the save.
        location: String,
        /// The writer's error.
        #[source]
        source: BoxError,
    },

    /// The writer completed without error but reported that nothing was saved.
    #[error("writer reported failure for '{location}'")]
    WriteRejected {
        /// The target location of the save.
        location: String,
    },

    /// A save-as targeted a location that another open project already uses.
    #[error("location '{location}' is already used by another open project")]
    LocationInUse {
        /// The contested location.
        location: String,
    },

    /// The project is not part of the open-project collection.
    #[error("project '{location}' is not loaded")]
    NotRegistered {
        /// The location of the project.
        location: String,
    },
}

impl ProjectError {
    /// Returns the validation context attached to this failure, if any.
    pub fn validation(&self) -> Option<&ValidationContext> {
        match self {
            Self::CannotLoad { validation, .. } | Self::Validation { validation, .. } => {
                Some(validation)
            }
            _ => None,
        }
    }
}

/// Error returned when an event listener fails.
///
/// Listener failures are not recovered: they abort the lifecycle operation
/// in progress and propagate to the original caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A listener returned an error; remaining listeners were skipped.
    #[error("listener for {event} failed: {source}")]
    Listener {
        /// The event whose fan-out failed.
        event: ProjectEventKind,
        /// The listener's error.
        #[source]
        source: BoxError,
    },
}

/// Error returned by [`ProjectManagerBuilder::build`](crate::ProjectManagerBuilder::build).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// No reader was configured.
    #[error("a project reader is required")]
    MissingReader,

    /// No writer was configured.
    #[error("a project writer is required")]
    MissingWriter,
}

/// Error returned when a refresher cannot attach to its change source.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The underlying filesystem watcher could not be created or attached.
    #[error("failed to watch '{location}': {source}")]
    Notify {
        /// The watched location.
        location: String,
        /// The watcher error.
        #[source]
        source: notify::Error,
    },
}
