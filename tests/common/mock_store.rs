//! Mock TaskStore for testing.
//!
//! Serves a fixed set of pending rows and records every status update.
//! Rows leave the pending set once they reach 200 or 404, like the SQLite
//! store.

use file_distributor::store::{BoxFuture, PendingRow, TaskStore};
use file_distributor::task::TaskStatus;
use file_distributor::DistributionError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockStore {
    rows: Mutex<Vec<PendingRow>>,
    updates: Mutex<Vec<(i64, TaskStatus)>>,
    fail_updates: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&self, id: i64, uri: &str, checksum: Option<&str>, dest: &str) {
        self.rows.lock().unwrap().push(PendingRow {
            id,
            source_uri: Some(uri.to_string()),
            checksum_hint: checksum.map(String::from),
            destination_host_filter: Some(dest.to_string()),
        });
    }

    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(i64, TaskStatus)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn pending_ids(&self) -> Vec<i64> {
        self.rows.lock().unwrap().iter().map(|r| r.id).collect()
    }

    /// Wait until a status was recorded for `id`.
    pub async fn wait_for_status(&self, id: i64, timeout: Duration) -> Option<TaskStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .updates
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(row, _)| *row == id)
                .map(|(_, status)| *status);
            if found.is_some() || tokio::time::Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl TaskStore for MockStore {
    fn fetch_pending_tasks(&self) -> BoxFuture<'_, Vec<PendingRow>> {
        let rows = self.rows.lock().unwrap().clone();
        Box::pin(async move { Ok(rows) })
    }

    fn update_status(&self, id: i64, status: TaskStatus) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            self.updates.lock().unwrap().push((id, status));
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(DistributionError::StoreMessage("store unavailable".to_string()));
            }
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            if matches!(status, TaskStatus::Complete | TaskStatus::NotFound) {
                rows.retain(|r| r.id != id);
            }
            Ok(if rows.len() < before { 1 } else { 0 })
        })
    }
}
