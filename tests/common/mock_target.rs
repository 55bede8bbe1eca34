//! Scripted target server for integration tests.
//!
//! Listens on a loopback port and speaks the target side of the transfer
//! protocol. Each header consumes one [`Step`] from the script; once the
//! script is empty the default step applies. Headers, bodies, pings and
//! connections are recorded for assertions.

use file_distributor::protocol::TransferHeader;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// How the target answers one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Reply `ALL_SAME`.
    AllSame,
    /// Reply `CONTINUE`, read the body, reply `OK`.
    Accept,
    /// Reply `CONTINUE`, read the body, reply `FAIL`.
    Reject,
    /// Close the connection without replying.
    Drop,
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<Step>>,
    headers: Mutex<Vec<TransferHeader>>,
    bodies: Mutex<Vec<Vec<u8>>>,
    pings: AtomicUsize,
    connections: AtomicUsize,
}

pub struct MockTarget {
    addr: String,
    state: Arc<MockState>,
    kill: broadcast::Sender<()>,
}

impl MockTarget {
    /// Start a target that applies `default` to every header.
    pub async fn start(default: Step) -> Self {
        Self::with_script(default, Vec::new()).await
    }

    /// Start a target that plays `script` first, then `default`.
    pub async fn with_script(default: Step, script: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(MockState {
            script: Mutex::new(script.into()),
            ..Default::default()
        });
        let (kill, _) = broadcast::channel(4);

        let accept_state = Arc::clone(&state);
        let accept_kill = kill.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&accept_state);
                let kill_rx = accept_kill.subscribe();
                tokio::spawn(serve(sock, state, default, kill_rx));
            }
        });

        Self { addr, state, kill }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn headers(&self) -> Vec<TransferHeader> {
        self.state.headers.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.state.bodies.lock().unwrap().clone()
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open connection (the listener stays up).
    pub fn disconnect_all(&self) {
        let _ = self.kill.send(());
    }
}

async fn serve(sock: TcpStream, state: Arc<MockState>, default: Step, mut kill: broadcast::Receiver<()>) {
    let mut reader = BufReader::new(sock);
    loop {
        let mut line = Vec::new();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = kill.recv() => return,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        if line == b"PING\r\n" {
            state.pings.fetch_add(1, Ordering::SeqCst);
            if reader.get_mut().write_all(b"PONG\r\n").await.is_err() {
                return;
            }
            continue;
        }

        let Ok(header) = TransferHeader::decode(&line) else {
            return;
        };
        let size = header.size as usize;
        state.headers.lock().unwrap().push(header);

        let step = state.script.lock().unwrap().pop_front().unwrap_or(default);
        match step {
            Step::Drop => return,
            Step::AllSame => {
                if reader.get_mut().write_all(b"ALL_SAME\r\n").await.is_err() {
                    return;
                }
            }
            Step::Accept | Step::Reject => {
                if reader.get_mut().write_all(b"CONTINUE\r\n").await.is_err() {
                    return;
                }
                let mut body = vec![0u8; size];
                if reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                state.bodies.lock().unwrap().push(body);
                let trailer: &[u8] = if step == Step::Accept { b"OK\r\n" } else { b"FAIL\r\n" };
                if reader.get_mut().write_all(trailer).await.is_err() {
                    return;
                }
            }
        }
    }
}
