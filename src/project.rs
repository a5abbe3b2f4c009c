//! Project capability trait plus the identity and location-key types shared
//! by the lifecycle machinery.
//!
//! A project is arbitrary user data loaded from (and written to) a location
//! string such as a path or URI. The manager only needs the small capability
//! surface expressed by [`Project`]; concrete kinds embed a [`ProjectCore`]
//! and get the rest for free.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier assigned when a project instance is constructed.
///
/// Stable for the lifetime of the instance. A refreshed project is a new
/// instance and therefore carries a new id, even though its location is
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Case-insensitive key derived from a location string.
///
/// Used for the open-project collection, the per-location lock registry,
/// the state tracker and the watcher registry, so that `C:/Data/A.proj`
/// and `c:/data/a.proj` address the same project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationKey(String);

impl LocationKey {
    /// Build the key for `location`.
    pub fn new(location: &str) -> Self {
        Self(location.to_lowercase())
    }

    /// Returns the normalized key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for the key of an empty location.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `location` maps to this key.
    pub fn matches(&self, location: &str) -> bool {
        *self == Self::new(location)
    }
}

impl From<&str> for LocationKey {
    fn from(location: &str) -> Self {
        Self::new(location)
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive a display title from a location: its last path segment.
///
/// Both `/` and `\` are treated as separators; trailing separators are
/// ignored. Falls back to the whole location when no segment remains.
pub fn title_from_location(location: &str) -> String {
    location
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(location)
        .to_owned()
}

/// Identity, location and dirty-flag bookkeeping shared by every project kind.
///
/// The id, title and creation time are fixed at construction. The location
/// only changes after a successful save-as, and the dirty flag is set by
/// mutations and cleared by the manager after a successful load or save.
#[derive(Debug)]
pub struct ProjectCore {
    id: ProjectId,
    title: String,
    created_on: DateTime<Utc>,
    location: RwLock<String>,
    dirty: AtomicBool,
}

impl ProjectCore {
    /// Create the core for a project at `location`.
    ///
    /// The title is derived from the location via [`title_from_location`]
    /// and the creation time is the current instant.
    pub fn new(location: impl Into<String>) -> Self {
        let location = location.into();
        Self {
            id: ProjectId::new(),
            title: title_from_location(&location),
            created_on: Utc::now(),
            location: RwLock::new(location),
            dirty: AtomicBool::new(false),
        }
    }

    /// Override the derived title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Override the creation timestamp (e.g. with a value stored in the file).
    pub fn with_created_on(mut self, created_on: DateTime<Utc>) -> Self {
        self.created_on = created_on;
        self
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn created_on(&self) -> DateTime<Utc> {
        self.created_on
    }

    pub fn location(&self) -> String {
        self.location
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_location(&self, location: &str) {
        *self
            .location
            .write()
            .unwrap_or_else(PoisonError::into_inner) = location.to_owned();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_is_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }
}

/// A resource whose lifecycle is coordinated by the
/// [`ProjectManager`](crate::ProjectManager).
///
/// Implementors only provide [`core`](Project::core); every other method has
/// a default that delegates to it. Concrete types can be recovered from a
/// [`SharedProject`] with [`downcast_ref`](trait.Project.html#method.downcast_ref).
///
/// # Examples
///
/// ```
/// use projectfold::{Project, ProjectCore};
///
/// #[derive(Debug)]
/// struct Sketch {
///     core: ProjectCore,
/// }
///
/// impl Project for Sketch {
///     fn core(&self) -> &ProjectCore {
///         &self.core
///     }
/// }
///
/// let sketch = Sketch { core: ProjectCore::new("/work/sketch.svg") };
/// assert_eq!(sketch.title(), "sketch.svg");
/// assert!(!sketch.is_dirty());
/// ```
pub trait Project: Any + Send + Sync {
    /// Shared identity and bookkeeping fields.
    fn core(&self) -> &ProjectCore;

    fn id(&self) -> ProjectId {
        self.core().id()
    }

    fn location(&self) -> String {
        self.core().location()
    }

    fn title(&self) -> &str {
        self.core().title()
    }

    fn created_on(&self) -> DateTime<Utc> {
        self.core().created_on()
    }

    fn is_dirty(&self) -> bool {
        self.core().is_dirty()
    }

    fn mark_dirty(&self) {
        self.core().mark_dirty();
    }

    fn clear_is_dirty(&self) {
        self.core().clear_is_dirty();
    }
}

/// Reference-counted handle to a project of any kind.
pub type SharedProject = Arc<dyn Project>;

impl dyn Project {
    /// Recover the concrete project type.
    pub fn downcast_ref<T: Project>(&self) -> Option<&T> {
        (self as &dyn Any).downcast_ref::<T>()
    }
}

impl fmt::Debug for dyn Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Project")
            .field("id", &self.id())
            .field("location", &self.location())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

/// Identity comparison used for "is this the active project" checks.
pub(crate) fn same_project(a: Option<&SharedProject>, b: Option<&SharedProject>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.id() == b.id(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Plain {
        core: ProjectCore,
    }

    impl Project for Plain {
        fn core(&self) -> &ProjectCore {
            &self.core
        }
    }

    fn plain(location: &str) -> SharedProject {
        Arc::new(Plain {
            core: ProjectCore::new(location),
        })
    }

    #[test]
    fn location_key_ignores_case() {
        assert_eq!(LocationKey::new("C:/Data/A.proj"), LocationKey::new("c:/data/a.proj"));
        assert!(LocationKey::new("Docs").matches("DOCS"));
        assert!(!LocationKey::new("docs").matches("docs2"));
    }

    #[test]
    fn title_is_last_segment() {
        assert_eq!(title_from_location("/work/site/index.html"), "index.html");
        assert_eq!(title_from_location(r"C:\work\model.xml"), "model.xml");
        assert_eq!(title_from_location("/work/site/"), "site");
        assert_eq!(title_from_location("dummyLocation"), "dummyLocation");
        assert_eq!(title_from_location(""), "");
    }

    #[test]
    fn ids_are_unique_per_instance() {
        let a = plain("x");
        let b = plain("x");
        assert_ne!(a.id(), b.id());
        assert!(same_project(Some(&a), Some(&a)));
        assert!(!same_project(Some(&a), Some(&b)));
        assert!(same_project(None, None));
        assert!(!same_project(Some(&a), None));
    }

    #[test]
    fn dirty_flag_round_trip() {
        let project = plain("x");
        assert!(!project.is_dirty());
        project.mark_dirty();
        assert!(project.is_dirty());
        project.clear_is_dirty();
        assert!(!project.is_dirty());
    }

    #[test]
    fn set_location_keeps_title() {
        let core = ProjectCore::new("/a/first.txt").with_title("First");
        core.set_location("/b/second.txt");
        assert_eq!(core.location(), "/b/second.txt");
        assert_eq!(core.title(), "First");
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        let project = plain("x");
        let concrete = project.downcast_ref::<Plain>().expect("should downcast");
        assert_eq!(concrete.core.location(), "x");
    }

    #[test]
    fn debug_format_includes_location() {
        let project = plain("debug-me");
        assert!(format!("{project:?}").contains("debug-me"));
    }
}
