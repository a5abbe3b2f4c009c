//! External collaborator contracts consumed by the manager.
//!
//! Readers, writers, validators and upgraders are narrow I/O adapters. The
//! manager only depends on the traits here; the null objects
//! ([`NullValidator`], [`NullUpgrader`]) supply pass-through behaviour for
//! applications that don't need validation or migration.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::project::SharedProject;

/// Outcome of a validation pass: a list of errors and a list of warnings.
///
/// Only errors fail an operation. Warnings are carried along for listeners.
///
/// # Examples
///
/// ```
/// use projectfold::ValidationContext;
///
/// let ctx = ValidationContext::new()
///     .with_warning("schema is outdated")
///     .with_error("root element missing");
/// assert!(ctx.has_errors());
/// assert_eq!(ctx.errors(), ["root element missing"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationContext {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl ValidationContext {
    /// Create an empty (passing) context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error, builder style.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.add_error(message);
        self
    }

    /// Append a warning, builder style.
    pub fn with_warning(mut self, message: impl Into<String>) -> Self {
        self.add_warning(message);
        self
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Absorb the messages of another context.
    pub fn merge(&mut self, other: ValidationContext) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl fmt::Display for ValidationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} error(s), {} warning(s)",
            self.errors.len(),
            self.warnings.len()
        )?;
        if !self.errors.is_empty() {
            write!(f, ": {}", self.errors.join("; "))?;
        }
        Ok(())
    }
}

/// Materializes a project from a location.
///
/// # Contract
///
/// - Missing or corrupt data must be reported as `Err`.
/// - The returned project's location must equal `location` (compared
///   case-insensitively); otherwise the manager treats the load as failed.
#[async_trait]
pub trait ProjectReader: Send + Sync {
    async fn read(&self, location: &str) -> Result<SharedProject, BoxError>;
}

/// Persists a project to a location.
///
/// Returning `Ok(false)` and returning `Err` both fail the save. They only
/// differ in log severity (warning vs. error).
#[async_trait]
pub trait ProjectWriter: Send + Sync {
    async fn write(&self, project: &SharedProject, location: &str) -> Result<bool, BoxError>;
}

/// Gatekeeper consulted before and after a project is materialized.
///
/// Every method has a permissive default, so implementors override only
/// the checks they need.
#[async_trait]
pub trait ProjectValidator: Send + Sync {
    /// Whether loading `location` may start at all.
    async fn can_start_loading(&self, _location: &str) -> bool {
        true
    }

    /// Validate the location before the reader runs.
    async fn validate_before_loading(&self, _location: &str) -> ValidationContext {
        ValidationContext::new()
    }

    /// Validate a freshly materialized project.
    async fn validate_project(&self, _project: &SharedProject) -> ValidationContext {
        ValidationContext::new()
    }

    /// Whether a refresh re-runs [`validate_before_loading`](ProjectValidator::validate_before_loading).
    fn validate_location_on_refresh(&self) -> bool {
        true
    }

    /// Whether a refresh re-runs [`validate_project`](ProjectValidator::validate_project).
    fn validate_project_on_refresh(&self) -> bool {
        true
    }
}

/// Migrates outdated project data before it is loaded.
#[async_trait]
pub trait ProjectUpgrader: Send + Sync {
    async fn requires_upgrade(&self, location: &str) -> bool;

    /// Upgrade the data at `location`, returning the location to load from.
    /// This may be `location` itself or a new location.
    async fn upgrade(&self, location: &str) -> Result<String, BoxError>;
}

/// Validator that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullValidator;

#[async_trait]
impl ProjectValidator for NullValidator {}

/// Upgrader that never requires an upgrade.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullUpgrader;

#[async_trait]
impl ProjectUpgrader for NullUpgrader {
    async fn requires_upgrade(&self, _location: &str) -> bool {
        false
    }

    async fn upgrade(&self, location: &str) -> Result<String, BoxError> {
        Ok(location.to_owned())
    }
}
