//! Transfer protocol: push one file over one [`TargetLink`].
//!
//! # Attempt
//!
//! ```text
//! lock link ──► reconnect if broken ──► header ──► ALL_SAME ──► done (no body)
//!                                          │
//!                                          └──► CONTINUE ──► body ──► trailer OK ──► done
//! ```
//!
//! Any failure after the header is written marks the link broken, so the
//! next attempt starts on a fresh connection. A local read error or short
//! read while streaming the body stops the body early; the trailer read
//! still happens and is expected to fail.
//!
//! # Retry
//!
//! [`TargetLink::rsync()`] runs up to `max_attempts + 1` attempts and
//! returns on the first success. Errors that a new attempt cannot fix, such
//! as a source file that no longer opens, end the loop at once.

use crate::error::{DistributionError, Result};
use crate::link::{LinkSession, TargetLink};
use crate::metrics;
use crate::protocol::{parse_trailer, HandshakeReply, HANDSHAKE_REPLY_LEN, TRAILER_MIN_LEN};
use crate::task::Task;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, warn};

/// How a successful attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Target already held identical content.
    AllSame,
    /// Body streamed and acknowledged.
    Delivered,
}

impl TransferOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::AllSame => "all_same",
            Self::Delivered => "ok",
        }
    }
}

impl TargetLink {
    /// Run one transfer attempt. Never retries internally.
    pub async fn transfer_once(&self, task: &Task) -> Result<TransferOutcome> {
        let file = File::open(&task.path)
            .await
            .map_err(|e| DistributionError::validation(task.path.display().to_string(), e.to_string()))?;

        let mut session = self.lock().await;
        if let Err(e) = session.ensure_connected().await {
            metrics::record_transfer_attempt(self.target_name(), "failed");
            return Err(e);
        }

        match self.exchange(&mut session, task, file).await {
            Ok(outcome) => {
                metrics::record_transfer_attempt(self.target_name(), outcome.label());
                Ok(outcome)
            }
            Err(e) => {
                session.mark_broken();
                metrics::record_transfer_attempt(self.target_name(), "failed");
                Err(e)
            }
        }
    }

    /// Transfer with retry: up to `max_attempts + 1` attempts.
    pub async fn rsync(&self, task: &Task, max_attempts: usize) -> Result<TransferOutcome> {
        let mut attempt = 0;
        loop {
            if attempt > max_attempts {
                error!(
                    slot = %self.slot(),
                    task_id = task.id,
                    path = %task.path.display(),
                    target = %self.target_name(),
                    attempts = attempt,
                    "Transfer attempts exhausted"
                );
                return Err(DistributionError::TransferExhausted {
                    path: task.path.display().to_string(),
                    target: self.target_name().to_string(),
                    attempts: attempt,
                });
            }
            attempt += 1;

            match self.transfer_once(task).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !e.is_retryable() => {
                    warn!(
                        slot = %self.slot(),
                        task_id = task.id,
                        path = %task.path.display(),
                        target = %self.target_name(),
                        attempt,
                        error = %e,
                        "Transfer failed, not retrying"
                    );
                    return Err(e);
                }
                Err(e) if e.is_end_of_stream() => {
                    debug!(
                        slot = %self.slot(),
                        task_id = task.id,
                        target = %self.target_name(),
                        attempt,
                        "Target closed the connection during transfer"
                    );
                }
                Err(e) => {
                    warn!(
                        slot = %self.slot(),
                        task_id = task.id,
                        path = %task.path.display(),
                        target = %self.target_name(),
                        attempt,
                        error = %e,
                        "Transfer attempt failed"
                    );
                }
            }
        }
    }

    /// Header, optional body and trailer on an already connected session.
    async fn exchange(
        &self,
        session: &mut LinkSession<'_>,
        task: &Task,
        mut file: File,
    ) -> Result<TransferOutcome> {
        session.write_all(&task.header().encode()).await?;

        let reply = session.read_at_least(HANDSHAKE_REPLY_LEN).await?;
        let handshake = HandshakeReply::parse(reply)
            .map_err(|e| DistributionError::protocol(self.target_name(), e.to_string()))?;
        if handshake == HandshakeReply::AllSame {
            debug!(slot = %self.slot(), task_id = task.id, target = %self.target_name(), "Target already holds file");
            return Ok(TransferOutcome::AllSame);
        }

        let sent = self.stream_body(session, task, &mut file).await;
        metrics::record_bytes_sent(self.target_name(), sent);

        let reply = session.read_at_least(TRAILER_MIN_LEN).await?;
        parse_trailer(reply).map_err(|e| DistributionError::protocol(self.target_name(), e.to_string()))?;

        debug!(
            slot = %self.slot(),
            local = %session.local_addr(),
            task_id = task.id,
            target = %self.target_name(),
            bytes = sent,
            "Transfer acknowledged"
        );
        Ok(TransferOutcome::Delivered)
    }

    /// Stream exactly `task.size` bytes, stopping early on any error.
    /// Returns the number of bytes written.
    async fn stream_body(&self, session: &mut LinkSession<'_>, task: &Task, file: &mut File) -> u64 {
        let mut buf = vec![0u8; self.chunk_size()];
        let mut sent: u64 = 0;

        while sent < task.size {
            let want = (task.size - sent).min(buf.len() as u64) as usize;
            let n = match file.read(&mut buf[..want]).await {
                Ok(0) => {
                    warn!(
                        task_id = task.id,
                        path = %task.path.display(),
                        sent,
                        size = task.size,
                        "Source file shorter than announced"
                    );
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(task_id = task.id, path = %task.path.display(), error = %e, "Reading source file failed");
                    break;
                }
            };
            if session.write_all(&buf[..n]).await.is_err() {
                break;
            }
            sent += n as u64;
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistributionSettings, TargetServerConfig};
    use crate::task::DEFAULT_MAX_ATTEMPTS;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn make_task(dir: &Path, content: &[u8]) -> Task {
        std::fs::create_dir_all(dir.join("docs")).unwrap();
        std::fs::write(dir.join("docs/f.bin"), content).unwrap();
        Task::assemble(1, dir, "docs/f.bin", 1)
            .await
            .unwrap()
            .with_host_filters(vec!["*".to_string()])
    }

    fn link(addr: &str) -> TargetLink {
        let spec = Arc::new(TargetServerConfig::for_testing("edge-1", addr, &["east"]));
        TargetLink::new(spec, "0-0", &DistributionSettings::for_testing())
    }

    async fn read_line(sock: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\r\n") {
            sock.read_exact(&mut byte).await.unwrap();
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn test_all_same_skips_body() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), b"hello").await;
        let expected_header = String::from_utf8(task.header().encode()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let header = read_line(&mut sock).await;
            sock.write_all(b"ALL_SAME\r\n").await.unwrap();
            // Nothing else should arrive
            let mut rest = Vec::new();
            sock.read_to_end(&mut rest).await.unwrap();
            (header, rest)
        });

        let link = link(&addr);
        let outcome = link.transfer_once(&task).await.unwrap();
        assert_eq!(outcome, TransferOutcome::AllSame);
        link.stop().await;

        let (header, rest) = server.await.unwrap();
        assert_eq!(header, expected_header);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_continue_streams_exact_body() {
        let dir = tempfile::tempdir().unwrap();
        // Larger than one chunk to exercise the loop
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let task = make_task(dir.path(), &content).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let size = content.len();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_line(&mut sock).await;
            sock.write_all(b"CONTINUE\r\n").await.unwrap();
            let mut body = vec![0u8; size];
            sock.read_exact(&mut body).await.unwrap();
            sock.write_all(b"OK\r\n").await.unwrap();
            body
        });

        let link = link(&addr);
        assert_eq!(link.transfer_once(&task).await.unwrap(), TransferOutcome::Delivered);
        assert!(!link.needs_reconnect().await);
        assert_eq!(server.await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_unexpected_handshake_marks_broken() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), b"abc").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_line(&mut sock).await;
            sock.write_all(b"GARBAGE!\r\n").await.unwrap();
            let _ = sock.read_to_end(&mut Vec::new()).await;
        });

        let link = link(&addr);
        let err = link.transfer_once(&task).await.unwrap_err();
        assert!(matches!(err, DistributionError::Protocol { .. }));
        assert!(link.needs_reconnect().await);
    }

    #[tokio::test]
    async fn test_failed_trailer_marks_broken() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), b"abc").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_line(&mut sock).await;
            sock.write_all(b"CONTINUE\r\n").await.unwrap();
            let mut body = [0u8; 3];
            sock.read_exact(&mut body).await.unwrap();
            sock.write_all(b"FAIL\r\n").await.unwrap();
        });

        let link = link(&addr);
        assert!(link.transfer_once(&task).await.is_err());
        assert!(link.needs_reconnect().await);
    }

    #[tokio::test]
    async fn test_rsync_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), b"abc").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            // Two connections closed right after the header, then a good one
            for _ in 0..2 {
                let (mut sock, _) = listener.accept().await.unwrap();
                read_line(&mut sock).await;
            }
            let (mut sock, _) = listener.accept().await.unwrap();
            read_line(&mut sock).await;
            sock.write_all(b"ALL_SAME\r\n").await.unwrap();
            let _ = sock.read_to_end(&mut Vec::new()).await;
        });

        let link = link(&addr);
        let outcome = link.rsync(&task, DEFAULT_MAX_ATTEMPTS).await.unwrap();
        assert_eq!(outcome, TransferOutcome::AllSame);
        link.stop().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rsync_exhausts_budget() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), b"abc").await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok(Ok((mut sock, _))) =
                tokio::time::timeout(std::time::Duration::from_millis(500), listener.accept()).await
            {
                accepted += 1;
                read_line(&mut sock).await;
                drop(sock);
            }
            accepted
        });

        let link = link(&addr);
        let err = link.rsync(&task, 2).await.unwrap_err();
        match err {
            DistributionError::TransferExhausted { attempts, target, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(target, "edge-1");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(server.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_short_source_still_reads_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; 3000];
        let task = make_task(dir.path(), &content).await;
        // Shrink the file after the header size was fixed
        std::fs::write(&task.path, &content[..1000]).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let header = read_line(&mut sock).await;
            sock.write_all(b"CONTINUE\r\n").await.unwrap();

            let mut body = Vec::new();
            let mut buf = [0u8; 4096];
            while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(300), sock.read(&mut buf)).await {
                if n == 0 {
                    break;
                }
                body.extend_from_slice(&buf[..n]);
            }
            sock.write_all(b"FAIL\r\n").await.unwrap();
            let _ = sock.read_to_end(&mut Vec::new()).await;
            (header, body)
        });

        let link = link(&addr);
        let err = link.transfer_once(&task).await.unwrap_err();
        // The trailer was read and rejected, not skipped
        assert!(matches!(err, DistributionError::Protocol { .. }), "{err:?}");
        assert!(link.needs_reconnect().await);
        link.stop().await;

        let (header, body) = server.await.unwrap();
        assert!(header.starts_with("f.bin@3000@"), "{header}");
        assert_eq!(body, content[..1000]);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let task = make_task(dir.path(), b"abc").await;
        std::fs::remove_file(&task.path).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok(Ok(_)) = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await {
                accepted += 1;
            }
            accepted
        });

        let link = link(&addr);
        let err = link.rsync(&task, DEFAULT_MAX_ATTEMPTS).await.unwrap_err();
        assert!(matches!(err, DistributionError::Validation { .. }), "{err:?}");
        assert!(!err.is_retryable());
        assert_eq!(server.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_keepalive_waits_for_running_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let task = make_task(dir.path(), &content).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let size = content.len();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // PINGs may run before the transfer takes the link
            let header = loop {
                let line = read_line(&mut sock).await;
                if line != "PING\r\n" {
                    break line;
                }
                sock.write_all(b"PONG\r\n").await.unwrap();
            };

            // Slow target: keepalive ticks come due meanwhile
            tokio::time::sleep(Duration::from_millis(300)).await;
            sock.write_all(b"CONTINUE\r\n").await.unwrap();
            let mut body = vec![0u8; size];
            sock.read_exact(&mut body).await.unwrap();

            // Nothing may arrive before the trailer is sent
            let mut extra = [0u8; 1];
            let quiet = tokio::time::timeout(Duration::from_millis(200), sock.read(&mut extra))
                .await
                .is_err();
            sock.write_all(b"OK\r\n").await.unwrap();

            // Probing resumes once the transfer releases the link
            let after = read_line(&mut sock).await;
            sock.write_all(b"PONG\r\n").await.unwrap();
            (header, body, quiet, after)
        });

        let link = Arc::new(link(&addr));
        link.start_keepalive(Duration::from_millis(20)).await;
        assert_eq!(link.transfer_once(&task).await.unwrap(), TransferOutcome::Delivered);

        let (header, body, quiet, after) = server.await.unwrap();
        link.stop().await;
        assert!(header.starts_with("f.bin@3000@"), "{header}");
        assert_eq!(body, content);
        assert!(quiet, "bytes arrived between body and trailer");
        assert_eq!(after, "PING\r\n");
    }
}
