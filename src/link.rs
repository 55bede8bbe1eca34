//! Target link: one persistent TCP connection to one target server.
//!
//! # Connection Lifecycle
//!
//! ```text
//! open() ──► Connected ──(I/O failure)──► Broken
//!               ▲                            │
//!               └──── lazy reconnect ◄───────┘
//!                (next transfer or keepalive tick)
//! ```
//!
//! A link is driven by two units of work: the lane that owns it (transfers)
//! and its own keepalive task. Both go through [`TargetLink::lock()`], which
//! hands out a [`LinkSession`] guarding the socket, the receive buffer and
//! the broken flag as one unit. A keepalive PING can therefore never
//! interleave with an in-flight transfer.
//!
//! Connecting is never retried inline: a failed connect leaves the link
//! broken and returns the error, and whoever touches the link next tries
//! again.

use crate::config::{DistributionSettings, TargetServerConfig};
use crate::error::{DistributionError, Result};
use crate::metrics;
use crate::protocol::{PING, PING_REPLY_MIN_LEN};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Size of the fixed per-link receive buffer.
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

/// State guarded by the link's exclusion primitive.
struct LinkState {
    stream: Option<TcpStream>,
    local_addr: String,
    buffer: Box<[u8; RECEIVE_BUFFER_SIZE]>,
    needs_reconnect: bool,
}

/// A managed connection to one target server.
pub struct TargetLink {
    spec: Arc<TargetServerConfig>,
    /// `lane-index` slot identifier, for logs.
    slot: String,
    io_timeout: Duration,
    connect_timeout: Duration,
    chunk_size: usize,
    state: Mutex<LinkState>,
    shutdown_tx: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl TargetLink {
    /// Create a link (not yet connected, marked broken).
    pub fn new(spec: Arc<TargetServerConfig>, slot: impl Into<String>, settings: &DistributionSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            spec,
            slot: slot.into(),
            io_timeout: settings.io_timeout(),
            connect_timeout: settings.connect_timeout(),
            chunk_size: settings.chunk_size.max(1),
            state: Mutex::new(LinkState {
                stream: None,
                local_addr: String::new(),
                buffer: Box::new([0u8; RECEIVE_BUFFER_SIZE]),
                needs_reconnect: true,
            }),
            shutdown_tx,
            keepalive: Mutex::new(None),
        }
    }

    /// Create a link, connect it once and start its keepalive loop.
    ///
    /// A failed initial connect is logged and left for the keepalive or the
    /// next transfer to repair.
    pub async fn open(
        spec: Arc<TargetServerConfig>,
        slot: impl Into<String>,
        settings: &DistributionSettings,
    ) -> Arc<Self> {
        let link = Arc::new(Self::new(spec, slot, settings));
        {
            let mut session = link.lock().await;
            let _ = session.connect().await;
        }
        link.start_keepalive(settings.keepalive_interval()).await;
        link
    }

    pub fn target(&self) -> &TargetServerConfig {
        &self.spec
    }

    pub fn target_name(&self) -> &str {
        &self.spec.name
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Body chunk size used when streaming files over this link.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Take exclusive access to the connection.
    pub async fn lock(&self) -> LinkSession<'_> {
        LinkSession {
            link: self,
            state: self.state.lock().await,
        }
    }

    /// Whether the next operation will reconnect first.
    pub async fn needs_reconnect(&self) -> bool {
        self.state.lock().await.needs_reconnect
    }

    // =========================================================================
    // Keepalive
    // =========================================================================

    /// One keepalive cycle: reconnect if broken, send `PING`, expect ≥6 bytes back.
    ///
    /// Failures only mark the link broken; they never surface as task failures.
    pub async fn keepalive_tick(&self) -> Result<()> {
        let mut session = self.lock().await;
        if let Err(e) = session.ensure_connected().await {
            metrics::record_keepalive(&self.spec.name, false);
            return Err(e);
        }

        let result = match session.write_all(PING).await {
            Ok(()) => session
                .read_at_least(PING_REPLY_MIN_LEN)
                .await
                .map(|reply| reply.len()),
            Err(e) => Err(e),
        };

        match result {
            Ok(received) => {
                metrics::record_keepalive(&self.spec.name, true);
                debug!(slot = %self.slot, target = %self.spec.name, received, "Keepalive ok");
                Ok(())
            }
            Err(e) => {
                session.mark_broken();
                metrics::record_keepalive(&self.spec.name, false);
                warn!(
                    slot = %self.slot,
                    target = %self.spec.name,
                    address = %self.spec.address,
                    error = %e,
                    "Keepalive failed, link marked for reconnect"
                );
                Err(e)
            }
        }
    }

    /// Spawn the keepalive loop (no-op if already running).
    pub async fn start_keepalive(self: &Arc<Self>, interval: Duration) {
        let mut handle = self.keepalive.lock().await;
        if handle.is_some() {
            return;
        }

        let link = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        *handle = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut timer = tokio::time::interval_at(start, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let _ = link.keepalive_tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(slot = %link.slot, target = %link.spec.name, "Keepalive loop stopping");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the keepalive loop and close the socket.
    ///
    /// Returns only after the keepalive task has exited.
    pub async fn stop(&self) {
        debug!(slot = %self.slot, target = %self.spec.name, "Sending stop signal to link");
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.keepalive.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(slot = %self.slot, target = %self.spec.name, error = %e, "Keepalive task panicked");
            }
        }

        let mut state = self.state.lock().await;
        if let Some(mut stream) = state.stream.take() {
            let _ = stream.shutdown().await;
        }
        state.needs_reconnect = true;
        debug!(slot = %self.slot, target = %self.spec.name, "Link stopped");
    }
}

/// Exclusive access to a link's connection, buffer and broken flag.
pub struct LinkSession<'a> {
    link: &'a TargetLink,
    state: MutexGuard<'a, LinkState>,
}

impl LinkSession<'_> {
    fn target_error(&self, message: impl Into<String>) -> DistributionError {
        DistributionError::LinkConnection {
            target: self.link.spec.name.clone(),
            message: message.into(),
        }
    }

    pub fn needs_reconnect(&self) -> bool {
        self.state.needs_reconnect
    }

    pub fn local_addr(&self) -> &str {
        &self.state.local_addr
    }

    /// Flag the connection as broken; the next operation reconnects.
    pub fn mark_broken(&mut self) {
        if !self.state.needs_reconnect {
            metrics::record_link_broken(&self.link.spec.name);
        }
        self.state.needs_reconnect = true;
    }

    /// Open a fresh TCP connection, replacing any previous one.
    pub async fn connect(&mut self) -> Result<()> {
        let spec = Arc::clone(&self.link.spec);
        self.state.stream = None;
        self.state.needs_reconnect = true;

        let outcome = timeout(self.link.connect_timeout, TcpStream::connect(&spec.address)).await;
        let stream = match outcome {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                metrics::record_link_connect(&spec.name, false);
                warn!(slot = %self.link.slot, target = %spec.name, address = %spec.address, error = %e, "Connecting target server failed");
                return Err(self.target_error(e.to_string()));
            }
            Err(_) => {
                metrics::record_link_connect(&spec.name, false);
                warn!(
                    slot = %self.link.slot,
                    target = %spec.name,
                    address = %spec.address,
                    timeout_ms = self.link.connect_timeout.as_millis() as u64,
                    "Connecting target server timed out"
                );
                return Err(self.target_error("connect timed out"));
            }
        };

        let _ = stream.set_nodelay(true);
        self.state.local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.state.stream = Some(stream);
        self.state.needs_reconnect = false;

        metrics::record_link_connect(&spec.name, true);
        info!(
            slot = %self.link.slot,
            local = %self.state.local_addr,
            target = %spec.name,
            address = %spec.address,
            "Connected to target server"
        );
        Ok(())
    }

    /// Reconnect if a previous operation left the link broken.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.state.needs_reconnect || self.state.stream.is_none() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Write the whole buffer, with a fresh deadline before every write call.
    ///
    /// Does not mark the link broken; the caller decides.
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let io_timeout = self.link.io_timeout;
        let state = &mut *self.state;
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| DistributionError::Io(io::ErrorKind::NotConnected.into()))?;

        let mut written = 0;
        while written < bytes.len() {
            let n = match timeout(io_timeout, stream.write(&bytes[written..])).await {
                Ok(Ok(0)) => Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
            };
            match n {
                Ok(n) => written += n,
                Err(e) => {
                    debug!(
                        slot = %self.link.slot,
                        local = %state.local_addr,
                        target = %self.link.spec.name,
                        written,
                        total = bytes.len(),
                        error = %e,
                        "Write to target server failed"
                    );
                    return Err(DistributionError::Io(e));
                }
            }
        }
        Ok(())
    }

    /// Read into the receive buffer until at least `min_len` bytes arrived.
    ///
    /// May return more than `min_len` bytes; the caller validates the
    /// payload. End of stream maps to `UnexpectedEof`.
    pub async fn read_at_least(&mut self, min_len: usize) -> Result<&[u8]> {
        let io_timeout = self.link.io_timeout;
        let min_len = min_len.min(RECEIVE_BUFFER_SIZE);
        let state = &mut *self.state;
        let stream = state
            .stream
            .as_mut()
            .ok_or_else(|| DistributionError::Io(io::ErrorKind::NotConnected.into()))?;

        let mut filled = 0;
        while filled < min_len {
            let read = match timeout(io_timeout, stream.read(&mut state.buffer[filled..])).await {
                Ok(Ok(0)) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "target closed the connection")),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")),
            };
            match read {
                Ok(n) => filled += n,
                Err(e) => {
                    debug!(
                        slot = %self.link.slot,
                        local = %state.local_addr,
                        target = %self.link.spec.name,
                        received = filled,
                        expected = min_len,
                        error = %e,
                        "Read from target server failed"
                    );
                    return Err(DistributionError::Io(e));
                }
            }
        }
        Ok(&state.buffer[..filled])
    }
}
