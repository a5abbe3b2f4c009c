//! In-memory project storage.
//!
//! [`MemoryBackend`] implements both [`ProjectReader`] and [`ProjectWriter`]
//! over a map of location to text, and materializes [`MemoryProject`]s. It
//! can be told to fail reads or writes for chosen locations and to delay
//! reads, and it counts what it was asked to do.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::collaborator::{ProjectReader, ProjectWriter};
use crate::error::BoxError;
use crate::project::{LocationKey, Project, ProjectCore, SharedProject};

/// A project whose data is a single text document.
#[derive(Debug)]
pub struct MemoryProject {
    core: ProjectCore,
    content: RwLock<String>,
}

impl MemoryProject {
    pub fn new(location: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            core: ProjectCore::new(location),
            content: RwLock::new(content.into()),
        }
    }

    pub fn content(&self) -> String {
        self.content
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the content and mark the project dirty.
    pub fn set_content(&self, content: impl Into<String>) {
        *self.content.write().unwrap_or_else(PoisonError::into_inner) = content.into();
        self.mark_dirty();
    }
}

impl Project for MemoryProject {
    fn core(&self) -> &ProjectCore {
        &self.core
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_reads: HashSet<LocationKey>,
    failing_writes: HashSet<LocationKey>,
    rejected_writes: HashSet<LocationKey>,
    read_delay: Duration,
}

#[derive(Debug, Default)]
struct ReadTracker {
    active: HashMap<LocationKey, usize>,
    peak_per_location: usize,
    active_total: usize,
    peak_total: usize,
}

/// Reader and writer backed by a map.
///
/// # Examples
///
/// ```
/// use projectfold::memory::MemoryBackend;
///
/// let backend = MemoryBackend::new()
///     .with_document("notes.txt", "hello")
///     .with_failing_read("broken.txt");
/// assert_eq!(backend.document("NOTES.TXT").as_deref(), Some("hello"));
/// ```
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<LocationKey, String>>,
    faults: Mutex<Faults>,
    reads: Mutex<ReadTracker>,
    read_count: AtomicUsize,
    write_count: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, builder style.
    pub fn with_document(self, location: &str, content: impl Into<String>) -> Self {
        self.insert_document(location, content);
        self
    }

    /// Make every read of `location` fail.
    pub fn with_failing_read(self, location: &str) -> Self {
        lock(&self.faults)
            .failing_reads
            .insert(LocationKey::new(location));
        self
    }

    /// Make every write to `location` fail with an error.
    pub fn with_failing_write(self, location: &str) -> Self {
        lock(&self.faults)
            .failing_writes
            .insert(LocationKey::new(location));
        self
    }

    /// Make every write to `location` report `false` without an error.
    pub fn with_rejected_write(self, location: &str) -> Self {
        lock(&self.faults)
            .rejected_writes
            .insert(LocationKey::new(location));
        self
    }

    /// Sleep for `delay` inside every read.
    pub fn with_read_delay(self, delay: Duration) -> Self {
        lock(&self.faults).read_delay = delay;
        self
    }

    /// Insert or replace a document.
    pub fn insert_document(&self, location: &str, content: impl Into<String>) {
        lock(&self.documents).insert(LocationKey::new(location), content.into());
    }

    pub fn remove_document(&self, location: &str) -> Option<String> {
        lock(&self.documents).remove(&LocationKey::new(location))
    }

    pub fn document(&self, location: &str) -> Option<String> {
        lock(&self.documents).get(&LocationKey::new(location)).cloned()
    }

    /// Clear the read failure for `location`.
    pub fn heal_read(&self, location: &str) {
        lock(&self.faults)
            .failing_reads
            .remove(&LocationKey::new(location));
    }

    /// Make reads of `location` fail from now on.
    pub fn break_read(&self, location: &str) {
        lock(&self.faults)
            .failing_reads
            .insert(LocationKey::new(location));
    }

    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Highest number of reads seen running at once for a single location.
    pub fn peak_reads_per_location(&self) -> usize {
        lock(&self.reads).peak_per_location
    }

    /// Highest number of reads seen running at once across all locations.
    pub fn peak_concurrent_reads(&self) -> usize {
        lock(&self.reads).peak_total
    }

    fn begin_read(&self, key: &LocationKey) -> ReadGuard<'_> {
        let mut reads = lock(&self.reads);
        let active = reads.active.entry(key.clone()).or_default();
        *active += 1;
        let per_location = *active;
        reads.peak_per_location = reads.peak_per_location.max(per_location);
        reads.active_total += 1;
        reads.peak_total = reads.peak_total.max(reads.active_total);
        ReadGuard {
            backend: self,
            key: key.clone(),
        }
    }
}

struct ReadGuard<'a> {
    backend: &'a MemoryBackend,
    key: LocationKey,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut reads = lock(&self.backend.reads);
        if let Some(active) = reads.active.get_mut(&self.key) {
            *active -= 1;
            if *active == 0 {
                reads.active.remove(&self.key);
            }
        }
        reads.active_total = reads.active_total.saturating_sub(1);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found(location: &str) -> BoxError {
    Box::new(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no document at '{location}'"),
    ))
}

#[async_trait]
impl ProjectReader for MemoryBackend {
    async fn read(&self, location: &str) -> Result<SharedProject, BoxError> {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let key = LocationKey::new(location);
        let _guard = self.begin_read(&key);

        let delay = lock(&self.faults).read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.faults).failing_reads.contains(&key) {
            return Err(format!("simulated read failure for '{location}'").into());
        }
        let content = self.document(location).ok_or_else(|| not_found(location))?;
        Ok(Arc::new(MemoryProject::new(location, content)))
    }
}

#[async_trait]
impl ProjectWriter for MemoryBackend {
    async fn write(&self, project: &SharedProject, location: &str) -> Result<bool, BoxError> {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let key = LocationKey::new(location);
        {
            let faults = lock(&self.faults);
            if faults.failing_writes.contains(&key) {
                return Err(format!("simulated write failure for '{location}'").into());
            }
            if faults.rejected_writes.contains(&key) {
                return Ok(false);
            }
        }

        let content = match project.downcast_ref::<MemoryProject>() {
            Some(memory) => memory.content(),
            None => project.title().to_owned(),
        };
        self.insert_document(location, content);
        Ok(true)
    }
}
