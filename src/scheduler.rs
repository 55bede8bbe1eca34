//! Scheduler: pulls tasks off the job queue and fans them out over lanes.
//!
//! # Fan-Out
//!
//! For every host filter, every link of the checked-out lane is visited in
//! configuration order:
//!
//! | Link's groups vs filter | Action | Counted |
//! |-------------------------|--------|---------|
//! | filter is `*` or groups contain it | transfer with retry | on success |
//! | no match | skipped | always |
//!
//! A skipped pair counts like a success. A failed transfer is the only thing
//! that lowers the count, so a filter that matches no target still
//! completes.
//!
//! Each task runs in its own spawned unit holding a [`LaneGuard`]; the lane
//! returns to the pool after completion accounting.

use crate::error::DistributionError;
use crate::metrics;
use crate::pool::{Lane, LaneGuard, LanePool};
use crate::source::InFlight;
use crate::store::TaskStore;
use crate::task::{Task, TaskStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Run every (filter, link) pair of a task on one lane. Returns the success count.
///
/// Never exceeds `host_filters.len() * lane.links().len()`.
pub async fn fan_out(task: &Task, lane: &Lane) -> usize {
    let mut success_count = 0;

    for filter in &task.host_filters {
        for link in lane.links() {
            if !link.target().matches_filter(filter) {
                debug!(
                    task_id = task.id,
                    filter = %filter,
                    target = %link.target_name(),
                    "Target not in filter group, counted as satisfied"
                );
                success_count += 1;
                continue;
            }

            match link.rsync(task, task.max_attempts_per_target).await {
                Ok(outcome) => {
                    debug!(
                        task_id = task.id,
                        slot = %link.slot(),
                        target = %link.target_name(),
                        ?outcome,
                        "Target acknowledged"
                    );
                    success_count += 1;
                }
                Err(_) => {
                    // Already logged by the retry loop
                }
            }
        }
    }
    success_count
}

/// Fan a task out on `lane` and persist its final status.
pub async fn dispatch<S: TaskStore + ?Sized>(task: &Task, lane: &Lane, store: &S) -> Option<TaskStatus> {
    let started = Instant::now();
    let success_count = fan_out(task, lane).await;
    let status = task.done(store, success_count).await;

    let elapsed = started.elapsed();
    metrics::record_task_duration(elapsed);
    info!(
        task_id = task.id,
        lane = lane.index(),
        path = %task.path.display(),
        success_count,
        required = task.required_successes(),
        status = ?task.status_for(success_count),
        elapsed_ms = elapsed.as_millis() as u64,
        "Task finished"
    );
    status
}

/// Dispatch one task on its own unit of work, releasing the id and lane after.
pub fn spawn_dispatch<S: TaskStore + ?Sized>(
    task: Task,
    lane: LaneGuard,
    store: Arc<S>,
    inflight: Arc<InFlight>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        dispatch(&task, &lane, store.as_ref()).await;
        inflight.release(task.id);
        drop(lane);
    })
}

/// Consume the job queue until shutdown.
///
/// Each task waits for a free lane before it is spawned; a stop signal wins
/// over both the queue and lane checkout. Tasks left in the queue stay
/// pending in the store and are picked up after restart.
pub async fn run_dispatch_loop<S: TaskStore + ?Sized>(
    mut queue: mpsc::Receiver<Task>,
    pool: Arc<LanePool>,
    store: Arc<S>,
    inflight: Arc<InFlight>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(lanes = pool.capacity(), "Dispatch loop started");

    loop {
        let task = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = queue.recv() => match next {
                Some(task) => task,
                None => break,
            },
        };

        let lane = tokio::select! {
            biased;
            _ = wait_for_stop(&mut shutdown) => {
                inflight.release(task.id);
                break;
            }
            lane = pool.checkout() => lane,
        };

        match lane {
            Ok(lane) => {
                debug!(task_id = task.id, lane = lane.index(), "Dispatching task");
                spawn_dispatch(task, lane, Arc::clone(&store), Arc::clone(&inflight));
            }
            Err(DistributionError::Shutdown) => {
                inflight.release(task.id);
                break;
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Lane checkout failed, dropping task");
                inflight.release(task.id);
            }
        }
    }

    queue.close();
    let mut dropped = 0;
    while let Ok(task) = queue.try_recv() {
        inflight.release(task.id);
        dropped += 1;
    }
    info!(dropped, "Dispatch loop stopped");
}

async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which is also a stop
    let _ = shutdown.wait_for(|stop| *stop).await;
}
