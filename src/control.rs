// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Control plane: ad-hoc enqueue and resync requests.
//!
//! [`ControlPlane`] is the capability the engine exposes; [`EngineHandle`]
//! implements it on top of the job queue and the poll trigger.
//! [`ControlServer`] speaks a small subset of RESP so any Redis client can
//! drive it:
//!
//! | Command | Effect | Reply |
//! |---------|--------|-------|
//! | `PING [msg]` | - | `+PONG` or bulk `msg` |
//! | `VERSION` | - | bulk version string |
//! | `SYNC` | poll the store now | `+OK` |
//! | `SET host file [EX md5]` | enqueue an ephemeral task | `+OK` |
//! | `SETEX host file md5` | same, checksum required | `+OK` |
//! | `QUIT` | close the connection | `+OK` |
//!
//! Failures reply `-ERR <message>`.

use crate::config::DistributorConfig;
use crate::error::Result;
use crate::metrics;
use crate::task::{parse_host_filters, Task, WILDCARD_FILTER};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Version reported by `VERSION`.
pub const VERSION: &str = "0.0.1";

/// Length of a hex MD5 checksum.
const CHECKSUM_LEN: usize = 32;

const MAX_ARGS: usize = 16;
const MAX_BULK_LEN: usize = 64 * 1024;

/// Typed control-plane failures. The `Display` text is the wire reply.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("error params")]
    Params,
    #[error("error target host")]
    TargetHost,
    #[error("not found rsync files")]
    NotFound,
    #[error("error transfer file md5sum")]
    ChecksumMismatch,
    #[error("polling disabled")]
    PollingDisabled,
    #[error("shutting down")]
    Shutdown,
}

pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Boxed future returned by [`ControlPlane`] methods.
pub type ControlFuture<'a, T> = Pin<Box<dyn Future<Output = ControlResult<T>> + Send + 'a>>;

/// What the engine offers to remote callers.
pub trait ControlPlane: Send + Sync + 'static {
    /// Validate and queue an ephemeral task for `file` to `host_filter`.
    fn enqueue<'a>(
        &'a self,
        host_filter: &'a str,
        file: &'a str,
        checksum: Option<&'a str>,
    ) -> ControlFuture<'a, ()>;

    /// Ask the poll loop to pull pending rows now.
    fn trigger_resync(&self) -> ControlResult<()>;

    fn version(&self) -> &'static str {
        VERSION
    }
}

/// [`ControlPlane`] backed by a running engine's queue and poll trigger.
#[derive(Clone)]
pub struct EngineHandle {
    config: Arc<DistributorConfig>,
    known_groups: Arc<Vec<String>>,
    queue: mpsc::Sender<Task>,
    trigger: Arc<Notify>,
}

impl EngineHandle {
    pub fn new(config: Arc<DistributorConfig>, queue: mpsc::Sender<Task>, trigger: Arc<Notify>) -> Self {
        let known_groups = Arc::new(config.all_groups());
        Self {
            config,
            known_groups,
            queue,
            trigger,
        }
    }

    async fn build_task(&self, host_filter: &str, file: &str, checksum: Option<&str>) -> ControlResult<Task> {
        if host_filter.trim().is_empty() || file.trim().is_empty() {
            return Err(ControlError::Params);
        }
        if checksum.is_some_and(|c| c.len() != CHECKSUM_LEN) {
            return Err(ControlError::Params);
        }

        let filters = parse_host_filters(host_filter);
        if filters.is_empty() {
            return Err(ControlError::Params);
        }
        let wildcard = filters.iter().any(|f| f == WILDCARD_FILTER);
        if !wildcard && !filters.iter().any(|f| self.known_groups.contains(f)) {
            return Err(ControlError::TargetHost);
        }

        let task = Task::assemble(0, &self.config.repository, file, self.config.targets.len())
            .await
            .map_err(|e| {
                debug!(file, error = %e, "Control enqueue: file not usable");
                ControlError::NotFound
            })?
            .with_host_filters(filters)
            .with_max_attempts(self.config.settings.max_attempts_per_target);

        if let Some(checksum) = checksum {
            task.verify_checksum(checksum)
                .map_err(|_| ControlError::ChecksumMismatch)?;
        }
        Ok(task)
    }
}

impl ControlPlane for EngineHandle {
    fn enqueue<'a>(
        &'a self,
        host_filter: &'a str,
        file: &'a str,
        checksum: Option<&'a str>,
    ) -> ControlFuture<'a, ()> {
        Box::pin(async move {
            let task = match self.build_task(host_filter, file, checksum).await {
                Ok(task) => task,
                Err(e) => {
                    metrics::record_rejected("control");
                    return Err(e);
                }
            };
            info!(host_filter, file, checksum = %task.checksum, "Control enqueue");
            self.queue.send(task).await.map_err(|_| ControlError::Shutdown)?;
            metrics::record_enqueued("control");
            Ok(())
        })
    }

    fn trigger_resync(&self) -> ControlResult<()> {
        if self.config.settings.poll_interval().is_none() {
            return Err(ControlError::PollingDisabled);
        }
        if self.queue.is_closed() {
            return Err(ControlError::Shutdown);
        }
        self.trigger.notify_one();
        debug!("Resync triggered");
        Ok(())
    }
}

// =============================================================================
// RESP listener
// =============================================================================

/// A reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Simple(&'static str),
    Bulk(String),
    Error(String),
}

impl Reply {
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Simple(s) => format!("+{}\r\n", s).into_bytes(),
            Self::Bulk(s) => format!("${}\r\n{}\r\n", s.len(), s).into_bytes(),
            Self::Error(s) => format!("-ERR {}\r\n", single_line(s)).into_bytes(),
        }
    }
}

impl From<ControlResult<()>> for Reply {
    fn from(result: ControlResult<()>) -> Self {
        match result {
            Ok(()) => Reply::Simple("OK"),
            Err(e) => Reply::Error(e.to_string()),
        }
    }
}

/// TCP listener translating RESP commands into [`ControlPlane`] calls.
pub struct ControlServer {
    listener: TcpListener,
    control: Arc<dyn ControlPlane>,
}

impl ControlServer {
    pub async fn bind(address: &str, control: Arc<dyn ControlPlane>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %listener.local_addr()?, "Control listener bound");
        Ok(Self { listener, control })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown. Open connections end with the process.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Control connection accepted");
                        let control = Arc::clone(&self.control);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, control).await {
                                debug!(peer = %peer, error = %e, "Control connection closed with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accepting control connection failed"),
                },
            }
        }
        info!("Control listener stopped");
    }
}

async fn serve_connection(stream: TcpStream, control: Arc<dyn ControlPlane>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    while let Some(args) = read_command(&mut reader).await? {
        if args.is_empty() {
            continue;
        }
        let quit = args[0].eq_ignore_ascii_case("QUIT");
        let reply = execute(control.as_ref(), &args).await;
        write_half.write_all(&reply.encode()).await?;
        if quit {
            break;
        }
    }
    Ok(())
}

async fn execute(control: &dyn ControlPlane, args: &[String]) -> Reply {
    let name = args[0].to_ascii_uppercase();
    let rest = &args[1..];
    match (name.as_str(), rest.len()) {
        ("PING", 0) => Reply::Simple("PONG"),
        ("PING", 1) => Reply::Bulk(rest[0].clone()),
        ("VERSION", 0) => Reply::Bulk(control.version().to_string()),
        ("SYNC", 0) => control.trigger_resync().into(),
        ("QUIT", _) => Reply::Simple("OK"),
        ("SET", 2) => control.enqueue(&rest[0], &rest[1], None).await.into(),
        ("SET", 4) => {
            if !rest[2].eq_ignore_ascii_case("EX") {
                return Reply::from(Err(ControlError::Params));
            }
            control.enqueue(&rest[0], &rest[1], Some(&rest[3])).await.into()
        }
        ("SETEX", 3) => control.enqueue(&rest[0], &rest[1], Some(&rest[2])).await.into(),
        ("PING" | "VERSION" | "SYNC" | "SET" | "SETEX", _) => Reply::Error(format!(
            "wrong number of arguments for '{}' command",
            name.to_ascii_lowercase()
        )),
        _ => Reply::Error(format!("unknown command '{}'", single_line(&args[0]))),
    }
}

/// Read one command: a RESP array of bulk strings or an inline line.
///
/// `Ok(None)` on a clean end of stream.
async fn read_command<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<Vec<String>>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };

    let Some(count) = line.strip_prefix('*') else {
        return Ok(Some(line.split_whitespace().map(String::from).collect()));
    };
    let count = parse_len(count, MAX_ARGS)?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let header = read_line(reader).await?.ok_or_else(eof)?;
        let len = header
            .strip_prefix('$')
            .ok_or_else(|| invalid("expected bulk string"))
            .and_then(|n| parse_len(n, MAX_BULK_LEN))?;
        let mut bulk = vec![0u8; len + 2];
        reader.read_exact(&mut bulk).await?;
        if !bulk.ends_with(b"\r\n") {
            return Err(invalid("bulk string not terminated"));
        }
        bulk.truncate(len);
        args.push(String::from_utf8(bulk).map_err(|_| invalid("argument is not UTF-8"))?);
    }
    Ok(Some(args))
}

/// Read one CRLF line, buffering at most `MAX_BULK_LEN` bytes plus the terminator.
async fn read_line<R>(reader: &mut BufReader<R>) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let limit = (MAX_BULK_LEN + 2) as u64;
    let mut line = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with(b"\n") && n as u64 >= limit {
        return Err(invalid("line too long"));
    }
    let line = String::from_utf8(line).map_err(|_| invalid("line is not UTF-8"))?;
    Ok(Some(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()))
}

/// Replace line breaks so client text cannot split a reply frame.
fn single_line(text: &str) -> String {
    text.replace(|c: char| c == '\r' || c == '\n', " ")
}

fn parse_len(text: &str, max: usize) -> std::io::Result<usize> {
    text.parse::<usize>()
        .ok()
        .filter(|n| *n <= max)
        .ok_or_else(|| invalid("invalid length"))
}

fn invalid(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

fn eof() -> std::io::Error {
    std::io::ErrorKind::UnexpectedEof.into()
}
