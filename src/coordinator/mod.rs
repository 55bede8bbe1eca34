// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Distribution engine coordinator.
//!
//! Ties together:
//! - The lane pool of target links via [`crate::pool::LanePool`]
//! - Store polling via [`crate::source::TaskSource`]
//! - Fan-out dispatch via [`crate::scheduler`]
//! - Remote requests via [`crate::control::EngineHandle`]
//!
//! # Architecture
//!
//! ```text
//! poll timer ─┐
//! SYNC ───────┴─► TaskSource ──┐
//!                              ├─► job queue ──► dispatch loop ──► lane ──► links
//! SET / SETEX ─► EngineHandle ─┘
//! ```
//!
//! # Shutdown Order
//!
//! 1. Signal the poll and dispatch loops and wait for both
//! 2. Wait for every lane to return to the pool (bounded by the drain timeout)
//! 3. Stop every link's keepalive and close its socket
//! 4. Close the pool

mod types;

pub use types::{EngineState, HealthCheck};

use crate::config::DistributorConfig;
use crate::control::EngineHandle;
use crate::error::{DistributionError, Result};
use crate::metrics;
use crate::pool::LanePool;
use crate::scheduler::run_dispatch_loop;
use crate::source::{InFlight, TaskSource};
use crate::store::{NoOpTaskStore, TaskStore};
use crate::task::Task;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// The file distribution engine.
///
/// Generic over the backing store so tests and control-plane-only
/// deployments can run without a database.
pub struct DistributionEngine<S: TaskStore = NoOpTaskStore> {
    /// Immutable configuration shared with every component
    config: Arc<DistributorConfig>,

    /// Backing store for pending rows and statuses
    store: Arc<S>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Job queue producer side (poll loop, control plane)
    queue_tx: mpsc::Sender<Task>,

    /// Job queue consumer side, moved into the dispatch loop on start
    queue_rx: Option<mpsc::Receiver<Task>>,

    /// Immediate-poll trigger
    trigger: Arc<Notify>,

    /// Store ids queued or transferring
    inflight: Arc<InFlight>,

    /// Lane pool, built on start
    pool: Option<Arc<LanePool>>,

    /// Poll and dispatch loop handles
    handles: Vec<JoinHandle<()>>,
}

impl DistributionEngine<NoOpTaskStore> {
    /// Create an engine with no backing store (control-plane requests only).
    pub fn new(config: DistributorConfig) -> Self {
        Self::with_store(config, Arc::new(NoOpTaskStore))
    }
}

impl<S: TaskStore> DistributionEngine<S> {
    /// Create an engine over a backing store. Starts in `Created`.
    pub fn with_store(config: DistributorConfig, store: Arc<S>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(config.settings.queue_capacity.max(1));

        Self {
            config: Arc::new(config),
            store,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            queue_tx,
            queue_rx: Some(queue_rx),
            trigger: Arc::new(Notify::new()),
            inflight: Arc::new(InFlight::new()),
            pool: None,
            handles: Vec::new(),
        }
    }

    pub fn config(&self) -> &Arc<DistributorConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// The lane pool, once started.
    pub fn pool(&self) -> Option<&Arc<LanePool>> {
        self.pool.as_ref()
    }

    pub fn inflight(&self) -> &Arc<InFlight> {
        &self.inflight
    }

    /// Control-plane handle feeding this engine's job queue.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(
            Arc::clone(&self.config),
            self.queue_tx.clone(),
            Arc::clone(&self.trigger),
        )
    }

    /// A source bound to this engine's store, queue and in-flight registry.
    pub fn source(&self) -> TaskSource<S> {
        TaskSource::new(
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&self.inflight),
            self.queue_tx.clone(),
        )
    }

    fn set_state(&self, state: EngineState) {
        self.state_tx.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Validates the configuration
    /// 2. Opens `lanes × targets` links (unreachable targets are not fatal)
    /// 3. Spawns the dispatch loop
    /// 4. Spawns the poll loop (exits at once if polling is disabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(DistributionError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            repository = %self.config.repository.display(),
            targets = self.config.targets.len(),
            lanes = self.config.settings.lanes,
            "Starting distribution engine"
        );
        self.set_state(EngineState::Starting);

        if let Err(e) = self.config.validate() {
            error!(error = %e, "Invalid configuration");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let queue_rx = match self.queue_rx.take() {
            Some(rx) => rx,
            None => {
                self.set_state(EngineState::Failed);
                return Err(DistributionError::Internal("job queue already consumed".into()));
            }
        };

        let pool = match LanePool::build(&self.config).await {
            Ok(pool) => pool,
            Err(e) => {
                error!(error = %e, "Building lane pool failed");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        self.handles.push(tokio::spawn(run_dispatch_loop(
            queue_rx,
            Arc::clone(&pool),
            Arc::clone(&self.store),
            Arc::clone(&self.inflight),
            self.shutdown_rx.clone(),
        )));

        let source = self.source();
        let trigger = Arc::clone(&self.trigger);
        let shutdown_rx = self.shutdown_rx.clone();
        self.handles.push(tokio::spawn(async move {
            source.run(trigger, shutdown_rx).await;
        }));

        self.pool = Some(pool);
        self.set_state(EngineState::Running);
        info!(
            poll_interval_sec = self.config.settings.poll_interval_sec,
            "Distribution engine running"
        );
        Ok(())
    }

    /// Shutdown the engine gracefully.
    ///
    /// Transfers already running finish (success or I/O failure) and record
    /// their status before links are closed.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), EngineState::Stopped) {
            return;
        }
        info!("Shutting down distribution engine");
        self.set_state(EngineState::ShuttingDown);

        self.shutdown_tx.send_replace(true);

        let drain_timeout = self.config.settings.drain_timeout();
        let handles = std::mem::take(&mut self.handles);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Loop stopped"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Loop panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Loop did not stop within the drain timeout"),
            }
        }

        if let Some(pool) = self.pool.take() {
            if !pool.wait_idle(drain_timeout).await {
                warn!("Closing links while transfers are still running");
            }
            pool.stop_all().await;
            pool.close();
            metrics::set_lanes_available(0);
        }

        self.set_state(EngineState::Stopped);
        info!("Distribution engine stopped");
    }

    /// Snapshot of pool, link and queue state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let (lanes_total, lanes_available, links_total, links_connected) = match &self.pool {
            Some(pool) => {
                let mut total = 0;
                let mut connected = 0;
                for link in pool.all_links() {
                    total += 1;
                    if !link.needs_reconnect().await {
                        connected += 1;
                    }
                }
                (pool.capacity(), pool.available(), total, connected)
            }
            None => (0, 0, 0, 0),
        };
        let queued = self.queue_tx.max_capacity() - self.queue_tx.capacity();

        HealthCheck {
            state,
            healthy: state == EngineState::Running && links_connected > 0,
            lanes_total,
            lanes_available,
            links_total,
            links_connected,
            in_flight: self.inflight.len(),
            queued,
        }
    }
}
