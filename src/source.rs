// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Job queue producers: store polling and resync triggers.
//!
//! # Pull Cycle
//!
//! ```text
//! fetch_pending_tasks ──► for each row (ascending id):
//!     in flight?              → skip
//!     missing uri / filter    → 404, drop
//!     file unusable           → 404, drop
//!     checksum hint mismatch  → 404, drop
//!     otherwise               → claim id, push onto the job queue
//! ```
//!
//! The push blocks while the queue is full, which holds the poll loop back
//! until the scheduler catches up.
//!
//! # In-Flight Registry
//!
//! A row stays pending in the store until its final status is written, so
//! a poll that fires mid-transfer would see it again. [`InFlight`] tracks
//! claimed ids; the scheduler releases them after completion accounting.

use crate::config::DistributorConfig;
use crate::error::{DistributionError, Result};
use crate::metrics;
use crate::store::{PendingRow, TaskStore};
use crate::task::{parse_host_filters, Task, TaskStatus};
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Ids of rows queued or being transferred.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: DashSet<i64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim an id. Ephemeral ids (`<= 0`) are never tracked.
    ///
    /// Returns `false` if the id is already in flight.
    pub fn try_claim(&self, id: i64) -> bool {
        if id <= 0 {
            return true;
        }
        self.ids.insert(id)
    }

    pub fn release(&self, id: i64) {
        if id > 0 {
            self.ids.remove(&id);
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Turns pending store rows into queued tasks.
pub struct TaskSource<S: TaskStore + ?Sized> {
    store: Arc<S>,
    config: Arc<DistributorConfig>,
    inflight: Arc<InFlight>,
    queue: mpsc::Sender<Task>,
}

impl<S: TaskStore + ?Sized> TaskSource<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<DistributorConfig>,
        inflight: Arc<InFlight>,
        queue: mpsc::Sender<Task>,
    ) -> Self {
        Self {
            store,
            config,
            inflight,
            queue,
        }
    }

    /// Fetch pending rows and push the valid ones. Returns how many were queued.
    pub async fn pull_pending(&self) -> Result<usize> {
        let rows = self.store.fetch_pending_tasks().await?;
        let mut queued = 0;

        for row in rows {
            if self.inflight.contains(row.id) {
                debug!(task_id = row.id, "Row already in flight, skipping");
                continue;
            }

            let task = match self.validate(&row).await {
                Ok(task) => task,
                Err(e) => {
                    metrics::record_rejected(rejection_reason(&e));
                    warn!(task_id = row.id, error = %e, "Rejecting pending row");
                    Task::cancel(self.store.as_ref(), row.id, TaskStatus::NotFound).await;
                    continue;
                }
            };

            if !self.inflight.try_claim(task.id) {
                continue;
            }
            let id = task.id;
            if self.queue.send(task).await.is_err() {
                self.inflight.release(id);
                return Err(DistributionError::Shutdown);
            }
            metrics::record_enqueued("poll");
            queued += 1;
        }

        if queued > 0 {
            info!(queued, in_flight = self.inflight.len(), "Queued pending tasks");
        }
        Ok(queued)
    }

    /// Build a task from a row, or say why it cannot be distributed.
    async fn validate(&self, row: &PendingRow) -> Result<Task> {
        let uri = non_empty(row.source_uri.as_deref())
            .ok_or_else(|| DistributionError::validation(row.id.to_string(), "missing source uri"))?;
        let dest = non_empty(row.destination_host_filter.as_deref())
            .ok_or_else(|| DistributionError::validation(uri, "missing destination host filter"))?;

        let filters = parse_host_filters(dest);
        if filters.is_empty() {
            return Err(DistributionError::validation(uri, "empty destination host filter"));
        }

        let task = Task::assemble(
            row.id,
            &self.config.repository,
            uri,
            self.config.targets.len(),
        )
        .await?
        .with_host_filters(filters)
        .with_max_attempts(self.config.settings.max_attempts_per_target);

        if let Some(hint) = non_empty(row.checksum_hint.as_deref()) {
            task.verify_checksum(hint)?;
        }
        Ok(task)
    }

    /// Poll on the configured interval and on every trigger until shutdown.
    ///
    /// Returns immediately if polling is disabled.
    pub async fn run(self, trigger: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        let Some(period) = self.config.settings.poll_interval() else {
            info!("Store polling disabled");
            return;
        };

        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_sec = period.as_secs(), "Poll loop started");

        loop {
            let cause = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = timer.tick() => "interval",
                _ = trigger.notified() => "trigger",
            };

            debug!(cause, "Pulling pending tasks");
            match self.pull_pending().await {
                Ok(_) => {}
                Err(DistributionError::Shutdown) => break,
                Err(e) => warn!(error = %e, "Pulling pending tasks failed"),
            }
        }
        info!("Poll loop stopped");
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn rejection_reason(e: &DistributionError) -> &'static str {
    match e {
        DistributionError::ChecksumMismatch { .. } => "checksum",
        DistributionError::Validation { .. } => "invalid",
        _ => "other",
    }
}
