//! # File Distributor
//!
//! Pushes files from a local repository to a fleet of target servers over a
//! line-framed TCP protocol, tracking per-file delivery state in a backing
//! store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           file-distributor                              │
//! │                                                                         │
//! │  ┌────────────┐   ┌────────────┐   ┌───────────┐   ┌─────────────────┐  │
//! │  │ TaskStore  │──►│ TaskSource │──►│ job queue │──►│ dispatch loop   │  │
//! │  │ (SQLite)   │   │ (poll)     │   │ (bounded) │   │ (lane checkout) │  │
//! │  └────────────┘   └────────────┘   └───────────┘   └─────────────────┘  │
//! │        ▲                ▲                ▲                  │           │
//! │        │ status         │ SYNC           │ SET/SETEX        ▼           │
//! │        │          ┌─────────────────────────┐      ┌─────────────────┐  │
//! │        │          │ ControlServer (RESP)    │      │ lane: one link  │  │
//! │        │          └─────────────────────────┘      │ per target      │  │
//! │        │                                           └─────────────────┘  │
//! │        └──────────── completion accounting ◄────── transfer + retry     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use file_distributor::{DistributionEngine, DistributorConfig};
//!
//! #[tokio::main]
//! async fn main() -> file_distributor::Result<()> {
//!     let config = DistributorConfig::load("config.yaml")?;
//!     let mut engine = DistributionEngine::new(config);
//!     engine.start().await?;
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod task;
pub mod transfer;

// Re-exports for convenience
pub use config::{DistributionSettings, DistributorConfig, StoreConfig, TargetServerConfig};
pub use control::{ControlError, ControlPlane, ControlServer, EngineHandle};
pub use coordinator::{DistributionEngine, EngineState, HealthCheck};
pub use error::{DistributionError, Result};
pub use link::TargetLink;
pub use pool::{Lane, LanePool};
pub use protocol::{HandshakeReply, TransferHeader};
pub use source::{InFlight, TaskSource};
pub use store::{NoOpTaskStore, PendingRow, SqliteTaskStore, TaskStore};
pub use task::{Task, TaskStatus};
pub use transfer::TransferOutcome;
