//! Lane pool: bounded set of per-target link groups.
//!
//! With `T` targets and a duplication factor `F`, the pool holds `F` lanes
//! of `T` links each. A lane is checked out for the whole of one task, so at
//! most `F` tasks transfer at once.
//!
//! ```text
//!            ┌── lane 0: [0-0 → edge-1, 0-1 → edge-2, ...]
//! LanePool ──┼── lane 1: [1-0 → edge-1, 1-1 → edge-2, ...]
//!            └── lane F-1
//! ```
//!
//! Free lanes sit in a lock-free [`ArrayQueue`]; a semaphore with one permit
//! per queued lane makes checkout block when the queue is empty. Returning a
//! lane pushes it back before releasing the permit, so a permit always
//! corresponds to a lane in the queue.

use crate::config::{DistributionSettings, DistributorConfig, TargetServerConfig};
use crate::error::{DistributionError, Result};
use crate::link::TargetLink;
use crate::metrics;
use crossbeam_queue::ArrayQueue;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// One link per configured target server, in configuration order.
pub struct Lane {
    index: usize,
    links: Vec<Arc<TargetLink>>,
}

impl Lane {
    pub fn new(index: usize, links: Vec<Arc<TargetLink>>) -> Self {
        Self { index, links }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn links(&self) -> &[Arc<TargetLink>] {
        &self.links
    }
}

/// Fixed-capacity pool of lanes.
pub struct LanePool {
    free: ArrayQueue<Arc<Lane>>,
    all: Vec<Arc<Lane>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl LanePool {
    /// Wrap already-built lanes; all start free.
    pub fn from_lanes(lanes: Vec<Lane>) -> Arc<Self> {
        let capacity = lanes.len().max(1);
        let free = ArrayQueue::new(capacity);
        let all: Vec<Arc<Lane>> = lanes.into_iter().map(Arc::new).collect();
        for lane in &all {
            // Capacity equals the lane count, so this cannot overflow
            let _ = free.push(Arc::clone(lane));
        }
        let permits = Arc::new(Semaphore::new(all.len()));
        metrics::set_lanes_available(all.len());

        Arc::new(Self {
            free,
            all,
            permits,
            capacity,
        })
    }

    /// Open `lanes × targets` links and build the pool.
    ///
    /// Links are opened concurrently. A target that cannot be reached leaves
    /// its links broken; they reconnect on the next keepalive or transfer.
    pub async fn build(config: &DistributorConfig) -> Result<Arc<Self>> {
        let settings = &config.settings;
        let specs: Vec<Arc<TargetServerConfig>> =
            config.targets.iter().cloned().map(Arc::new).collect();

        info!(lanes = settings.lanes, targets = specs.len(), "Opening target links");

        let mut opening: JoinSet<(usize, usize, Arc<TargetLink>)> = JoinSet::new();
        for lane in 0..settings.lanes {
            for (index, spec) in specs.iter().enumerate() {
                let spec = Arc::clone(spec);
                let settings: DistributionSettings = settings.clone();
                opening.spawn(async move {
                    let link = TargetLink::open(spec, format!("{}-{}", lane, index), &settings).await;
                    (lane, index, link)
                });
            }
        }

        let mut slots: Vec<Vec<Option<Arc<TargetLink>>>> =
            (0..settings.lanes).map(|_| vec![None; specs.len()]).collect();
        while let Some(joined) = opening.join_next().await {
            let (lane, index, link) =
                joined.map_err(|e| DistributionError::Internal(format!("link open task failed: {}", e)))?;
            slots[lane][index] = Some(link);
        }

        let mut lanes = Vec::with_capacity(settings.lanes);
        for (index, row) in slots.into_iter().enumerate() {
            let links = row
                .into_iter()
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| DistributionError::Internal(format!("lane {} is missing links", index)))?;
            lanes.push(Lane::new(index, links));
        }

        let pool = Self::from_lanes(lanes);
        let broken = pool.broken_link_count().await;
        if broken > 0 {
            warn!(broken, total = pool.all_links().count(), "Some target links are not connected yet");
        }
        info!(lanes = pool.all.len(), "Lane pool ready");
        Ok(pool)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lanes currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a lane, waiting until one is free.
    ///
    /// Fails with [`DistributionError::Shutdown`] once the pool is closed.
    pub async fn checkout(self: &Arc<Self>) -> Result<LaneGuard> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DistributionError::Shutdown)?;
        let lane = self
            .free
            .pop()
            .ok_or_else(|| DistributionError::Internal("lane permit without a free lane".into()))?;
        metrics::set_lanes_available(self.available());
        debug!(lane = lane.index(), "Lane checked out");

        Ok(LaneGuard {
            lane,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Wait until every lane is back, then refuse further checkouts.
    ///
    /// Returns `false` if lanes were still out when `timeout` elapsed.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let all = self.all.len() as u32;
        match tokio::time::timeout(timeout, self.permits.acquire_many(all)).await {
            Ok(Ok(permits)) => {
                self.permits.close();
                drop(permits);
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(
                    in_use = self.all.len().saturating_sub(self.available()),
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for lanes to drain"
                );
                self.permits.close();
                false
            }
        }
    }

    /// Every link in every lane, checked out or not.
    pub fn all_links(&self) -> impl Iterator<Item = &Arc<TargetLink>> {
        self.all.iter().flat_map(|lane| lane.links().iter())
    }

    async fn broken_link_count(&self) -> usize {
        let mut broken = 0;
        for link in self.all_links() {
            if link.needs_reconnect().await {
                broken += 1;
            }
        }
        broken
    }

    /// Stop every link's keepalive and close its socket. Waits for each.
    pub async fn stop_all(&self) {
        for link in self.all_links() {
            link.stop().await;
        }
        info!(links = self.all_links().count(), "All target links stopped");
    }

    /// Refuse further checkouts; pending ones fail with `Shutdown`.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A checked-out lane. Returned to the pool on drop.
pub struct LaneGuard {
    lane: Arc<Lane>,
    pool: Arc<LanePool>,
    // Released after the lane is pushed back
    _permit: OwnedSemaphorePermit,
}

impl Deref for LaneGuard {
    type Target = Lane;

    fn deref(&self) -> &Lane {
        &self.lane
    }
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        let index = self.lane.index();
        if self.pool.free.push(Arc::clone(&self.lane)).is_err() {
            warn!(lane = index, "Lane pool overflow on return");
        }
        debug!(lane = index, "Lane returned");
        metrics::set_lanes_available(self.pool.available() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetServerConfig;

    fn lanes(count: usize, targets: usize) -> Vec<Lane> {
        let settings = DistributionSettings::for_testing();
        (0..count)
            .map(|lane| {
                let links = (0..targets)
                    .map(|t| {
                        let spec = Arc::new(TargetServerConfig::for_testing(
                            &format!("edge-{}", t),
                            "127.0.0.1:1",
                            &["east"],
                        ));
                        Arc::new(TargetLink::new(spec, format!("{}-{}", lane, t), &settings))
                    })
                    .collect();
                Lane::new(lane, links)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_checkout_and_return() {
        let pool = LanePool::from_lanes(lanes(2, 3));
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.all_links().count(), 6);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(a.links().len(), 3);
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_links_kept_in_config_order() {
        let pool = LanePool::from_lanes(lanes(1, 3));
        let lane = pool.checkout().await.unwrap();
        let names: Vec<&str> = lane.links().iter().map(|l| l.target_name()).collect();
        assert_eq!(names, vec!["edge-0", "edge-1", "edge-2"]);
        assert_eq!(lane.links()[2].slot(), "0-2");
    }

    #[tokio::test]
    async fn test_checkout_blocks_until_return() {
        let pool = LanePool::from_lanes(lanes(1, 1));
        let held = pool.checkout().await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.checkout().await.map(|g| g.index()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_then_closed() {
        let pool = LanePool::from_lanes(lanes(2, 1));
        let held = pool.checkout().await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(held);
        });

        assert!(pool.wait_idle(Duration::from_secs(2)).await);
        releaser.await.unwrap();

        let err = pool.checkout().await.err().unwrap();
        assert!(matches!(err, DistributionError::Shutdown));
    }

    #[tokio::test]
    async fn test_wait_idle_times_out() {
        let pool = LanePool::from_lanes(lanes(1, 1));
        let _held = pool.checkout().await.unwrap();
        assert!(!pool.wait_idle(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_build_against_dead_targets() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = DistributorConfig::for_testing(
            dir.path(),
            vec![
                TargetServerConfig::for_testing("edge-1", &addr, &["east"]),
                TargetServerConfig::for_testing("edge-2", &addr, &["west"]),
            ],
        );
        config.settings.lanes = 3;

        let pool = LanePool::build(&config).await.unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.all_links().count(), 6);
        assert_eq!(pool.broken_link_count().await, 6);

        let slots: Vec<&str> = pool.all_links().map(|l| l.slot()).collect();
        assert_eq!(slots, vec!["0-0", "0-1", "1-0", "1-1", "2-0", "2-1"]);

        pool.stop_all().await;
    }
}
