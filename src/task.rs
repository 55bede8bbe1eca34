//! Tasks and completion accounting.
//!
//! A [`Task`] is one file to push to every eligible target server. It is
//! built from a file name relative to the distribution root by
//! [`Task::assemble()`], which stats and hashes the file up front: a task
//! that exists is always backed by a readable, non-empty file.
//!
//! # Completion
//!
//! The scheduler counts, per `(host filter, target server)` pair, transfers
//! that succeeded plus pairs skipped because the server is not in the
//! filter's group. [`Task::done()`] compares that count against
//! `expected_success_threshold * host_filters.len()`:
//!
//! ```text
//! count >= threshold × filters  → 200 Complete
//! otherwise                     → 500 Incomplete
//! ```
//!
//! Ephemeral tasks (`id <= 0`, created by the control plane) are never
//! persisted. Store write failures are logged and dropped: the row stays
//! pending and the next poll picks it up again.

use crate::error::{DistributionError, Result};
use crate::metrics;
use crate::protocol::{is_header_safe, TransferHeader};
use crate::store::TaskStore;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

/// Host filter matching every target server.
pub const WILDCARD_FILTER: &str = "*";

/// Default retry budget per target server.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Status codes written back to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Every required (filter, target) pair was satisfied.
    Complete,
    /// The row cannot be distributed (missing file, bad checksum, no filter).
    NotFound,
    /// Attempted, but some target servers did not acknowledge.
    Incomplete,
}

impl TaskStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Complete => 200,
            Self::NotFound => 404,
            Self::Incomplete => 500,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Self::Complete),
            404 => Some(Self::NotFound),
            500 => Some(Self::Incomplete),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One file to distribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Store row id; `0` for ephemeral control-plane requests.
    pub id: i64,
    /// File name (last path component).
    pub name: String,
    /// Size in bytes, always > 0.
    pub size: u64,
    /// Absolute path of the source file.
    pub path: PathBuf,
    /// Lower-case hex MD5 of the content.
    pub checksum: String,
    /// Directory of the file relative to the distribution root (`""` at the root).
    pub relative_path: String,
    /// Upper-cased group tags or `*`, in request order, no duplicates.
    pub host_filters: Vec<String>,
    /// Successes required per host filter (normally the number of target servers).
    pub expected_success_threshold: usize,
    /// Retry budget per target server.
    pub max_attempts_per_target: usize,
}

impl Task {
    /// Resolve `file` against `repository`, stat it and hash it.
    ///
    /// Fails with [`DistributionError::Validation`] when the name escapes the
    /// root, the file is missing, not a regular file, empty or unreadable.
    pub async fn assemble(
        id: i64,
        repository: &Path,
        file: &str,
        expected_success_threshold: usize,
    ) -> Result<Self> {
        let relative = normalize_relative(file)?;
        let path = repository.join(&relative);
        let display = path.display().to_string();

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| DistributionError::validation(&display, e.to_string()))?;
        if !metadata.is_file() {
            return Err(DistributionError::validation(&display, "not a regular file"));
        }
        if metadata.len() == 0 {
            return Err(DistributionError::validation(&display, "file is empty"));
        }

        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DistributionError::validation(&display, "missing file name"))?;
        let relative_path = relative
            .parent()
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();

        if !is_header_safe(&name) || !is_header_safe(&relative_path) {
            return Err(DistributionError::validation(
                &display,
                "name contains a protocol separator",
            ));
        }

        let checksum = file_md5(&path)
            .await
            .map_err(|e| DistributionError::validation(&display, e.to_string()))?;

        Ok(Self {
            id,
            name,
            size: metadata.len(),
            path,
            checksum,
            relative_path,
            host_filters: Vec::new(),
            expected_success_threshold,
            max_attempts_per_target: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Attach host filters (already parsed with [`parse_host_filters()`]).
    pub fn with_host_filters(mut self, filters: Vec<String>) -> Self {
        self.host_filters = filters;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts_per_target = attempts;
        self
    }

    /// Compare a caller-supplied checksum (any case) with the computed one.
    pub fn verify_checksum(&self, expected: &str) -> Result<()> {
        let expected = expected.to_lowercase();
        if expected == self.checksum {
            Ok(())
        } else {
            Err(DistributionError::ChecksumMismatch {
                expected,
                actual: self.checksum.clone(),
            })
        }
    }

    /// The header line announcing this file to a target.
    pub fn header(&self) -> TransferHeader {
        TransferHeader {
            name: self.name.clone(),
            size: self.size,
            checksum: self.checksum.clone(),
            relative_path: self.relative_path.clone(),
        }
    }

    /// Ephemeral tasks are not persisted.
    pub fn is_ephemeral(&self) -> bool {
        self.id <= 0
    }

    /// Number of satisfied (filter, target) pairs needed for `Complete`.
    pub fn required_successes(&self) -> usize {
        self.expected_success_threshold * self.host_filters.len()
    }

    /// Final status for a success count.
    pub fn status_for(&self, success_count: usize) -> TaskStatus {
        if success_count >= self.required_successes() {
            TaskStatus::Complete
        } else {
            TaskStatus::Incomplete
        }
    }

    /// Record the outcome of a dispatch. Returns the status written, if any.
    pub async fn done<S: TaskStore + ?Sized>(&self, store: &S, success_count: usize) -> Option<TaskStatus> {
        let status = self.status_for(success_count);
        metrics::record_task_status(status.code());
        if self.is_ephemeral() {
            return None;
        }
        report_status(store, self.id, status).await;
        Some(status)
    }

    /// Persist an explicit status for row `id` without dispatching it.
    ///
    /// Used when a pending row cannot become a task. Ephemeral ids are
    /// skipped. Returns the status written, if any.
    pub async fn cancel<S: TaskStore + ?Sized>(store: &S, id: i64, status: TaskStatus) -> Option<TaskStatus> {
        if id <= 0 {
            return None;
        }
        report_status(store, id, status).await;
        Some(status)
    }
}

/// Write a status through the store, logging instead of failing.
pub async fn report_status<S: TaskStore + ?Sized>(store: &S, id: i64, status: TaskStatus) {
    match store.update_status(id, status).await {
        Ok(affected_rows) => {
            info!(task_id = id, status = status.code(), affected_rows, "Updated task status");
        }
        Err(e) => {
            metrics::record_store_update_failure();
            warn!(task_id = id, status = status.code(), error = %e, "Updating task status failed");
        }
    }
}

/// Split a comma-separated destination into upper-cased filters.
///
/// Blank entries are dropped, duplicates collapse to their first occurrence.
pub fn parse_host_filters(raw: &str) -> Vec<String> {
    let mut filters: Vec<String> = Vec::new();
    for part in raw.split(',') {
        let filter = part.trim().to_uppercase();
        if !filter.is_empty() && !filters.contains(&filter) {
            filters.push(filter);
        }
    }
    filters
}

/// Lower-case hex MD5 of a file.
pub async fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Strip leading separators and refuse anything that leaves the root.
fn normalize_relative(file: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(file).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(DistributionError::validation(file, "path escapes the repository"));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(DistributionError::validation(file, "empty file name"));
    }
    Ok(relative)
}
