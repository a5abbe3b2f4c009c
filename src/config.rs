//! Manager configuration.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default soft timeout for one event fan-out: 3 seconds.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Whether the manager keeps one project open or many.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectManagementMode {
    /// At most one open project. Loading a second one fails until the
    /// first is closed.
    SingleDocument,
    /// Any number of open projects, each at a unique location.
    #[default]
    MultipleDocuments,
}

/// Settings read once when the [`ProjectManager`](crate::ProjectManager) is built.
///
/// Serialized as JSON with the timeout in milliseconds:
///
/// ```
/// use std::time::Duration;
/// use projectfold::{ManagerConfig, ProjectManagementMode};
///
/// let config = ManagerConfig::from_json(
///     r#"{ "mode": "single_document", "event_timeout_ms": 500 }"#,
/// )
/// .unwrap();
/// assert_eq!(config.mode, ProjectManagementMode::SingleDocument);
/// assert_eq!(config.event_timeout, Duration::from_millis(500));
/// assert!(!config.check_can_start_on_refresh);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Single- or multi-document mode.
    ///
    /// Default: [`ProjectManagementMode::MultipleDocuments`].
    pub mode: ProjectManagementMode,

    /// Soft timeout applied to every event fan-out. Elapsing only logs a
    /// warning; slow listeners keep running.
    ///
    /// Default: 3 seconds.
    #[serde(rename = "event_timeout_ms", with = "duration_ms")]
    pub event_timeout: Duration,

    /// Whether a refresh asks the validator's `can_start_loading` again.
    ///
    /// Default: `false`.
    pub check_can_start_on_refresh: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mode: ProjectManagementMode::default(),
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            check_can_start_on_refresh: false,
        }
    }
}

impl ManagerConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the text is not a valid configuration.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the file cannot be read or does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(io::Error::other)
    }
}

/// Serde for `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
