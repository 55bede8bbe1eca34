//! Engine state types.
//!
//! Defines the state machine for the distribution engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                            │    │
//!    │ shutdown()       (pool up) │    │ (invalid config, pool build failed)
//!    ↓                            ↓    ↓
//! Stopped                     Running  Failed
//!    ↑                            │
//!    │                 shutdown() │
//!    │                            ↓
//!    └─────────────────── ShuttingDown
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after construction. No links open.
//! - **Starting**: `start()` called, opening target links.
//! - **Running**: Dispatch loop consuming the job queue; poll loop active if enabled.
//! - **ShuttingDown**: `shutdown()` called. Loops stopped, waiting for lanes to return.
//! - **Stopped**: All links closed. Safe to drop.
//! - **Failed**: Start aborted. Engine cannot continue.

/// State of the distribution engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    Created,

    /// Opening target links and spawning loops.
    Starting,

    /// Running and distributing.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight tasks finish their transfers and accounting first.
    ShuttingDown,

    /// Stopped cleanly.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for error details.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time snapshot of engine health.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running with at least one connected link.
    pub healthy: bool,
    pub lanes_total: usize,
    pub lanes_available: usize,
    pub links_total: usize,
    pub links_connected: usize,
    /// Store rows queued or transferring.
    pub in_flight: usize,
    /// Tasks waiting in the job queue.
    pub queued: usize,
}
