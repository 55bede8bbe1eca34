//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - A scripted target server on a loopback port
//! - A recording TaskStore
//! - Repository and config helpers

#![allow(dead_code)]

pub mod mock_store;
pub mod mock_target;

pub use mock_store::*;
pub use mock_target::*;

use file_distributor::{DistributorConfig, TargetServerConfig};
use std::path::Path;
use std::time::Duration;

/// Upper bound for waiting on asynchronous outcomes.
pub const WAIT: Duration = Duration::from_secs(10);

/// Write `content` at `relative` under `repo`, creating directories.
pub fn write_file(repo: &Path, relative: &str, content: &[u8]) {
    let path = repo.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Lower-case hex MD5 of `content`.
pub fn md5_hex(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

/// Test config over `repo` with one target per `(name, address, groups)`.
pub fn config(repo: &Path, targets: &[(&str, &str, &[&str])]) -> DistributorConfig {
    DistributorConfig::for_testing(
        repo,
        targets
            .iter()
            .map(|(name, addr, groups)| TargetServerConfig::for_testing(name, addr, groups))
            .collect(),
    )
}
