//! Concurrency-safe lifecycle coordination for open projects.
//!
//! A [`ProjectManager`] loads, saves, refreshes, closes and activates
//! projects through pluggable readers, writers, validators and upgraders.
//! Operations on the same location are serialized, and every step raises
//! staged, cancelable async events on [`ProjectEvents`].

mod collaborator;
mod config;
mod dispatch;
mod error;
mod event;
mod manager;
pub mod memory;
mod project;
mod state;
mod synchronizer;
mod watcher;

pub use collaborator::{
    NullUpgrader, NullValidator, ProjectReader, ProjectUpgrader, ProjectValidator, ProjectWriter,
    ValidationContext,
};
pub use config::{DEFAULT_EVENT_TIMEOUT, ManagerConfig, ProjectManagementMode};
pub use dispatch::{DispatchOutcome, EventChannel, ListenerId, ListenerResult, ProjectEvents};
pub use error::{BoxError, BuildError, DispatchError, ProjectError, WatchError};
pub use event::{
    ActivationEventArgs, ActivationFailedArgs, ProjectEventArgs, ProjectEventKind,
    ProjectFailedArgs, RefreshRequiredArgs,
};
pub use manager::{ProjectManager, ProjectManagerBuilder};
pub use project::{LocationKey, Project, ProjectCore, ProjectId, SharedProject, title_from_location};
pub use state::{ProjectState, StateEvent, StateTracker};
pub use synchronizer::OperationSynchronizer;
pub use watcher::{
    FileRefresher, FileRefresherSelector, NullRefresherSelector, ProjectRefresher,
    RefresherSelector, ResourceUpdate, UpdateSink,
};
