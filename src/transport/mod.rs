//! Transport implementations for the host/unit boundary.
//!
//! Supports:
//! - Channel: paired in-process queues for thread-style execution units
//! - Process: spawn a child process and exchange newline-delimited JSON
//!   over stdin/stdout
//!
//! Which transport a unit uses is decided once at construction and
//! injected; nothing sniffs the environment at call time.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{HostError, HostResult};
use crate::protocol::WireMessage;

/// A bidirectional message channel between the host and one isolated
/// execution unit. The whole protocol runs over these two methods.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one message to the peer.
    async fn send(&self, message: WireMessage) -> HostResult<()>;

    /// Receive the next message from the peer. `None` means the peer is
    /// gone and no further messages will arrive.
    async fn recv(&self) -> Option<WireMessage>;
}

/// In-process transport over paired tokio channels. Used when the
/// execution unit runs as a task/thread inside the host process.
pub struct ChannelTransport {
    tx: mpsc::Sender<WireMessage>,
    rx: Mutex<mpsc::Receiver<WireMessage>>,
}

impl ChannelTransport {
    /// Create a connected pair: one end for the host, one for the unit.
    pub fn pair(capacity: usize) -> (ChannelTransport, ChannelTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            ChannelTransport {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            ChannelTransport {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: WireMessage) -> HostResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| HostError::Transport("peer channel closed".into()))
    }

    async fn recv(&self) -> Option<WireMessage> {
        self.rx.lock().await.recv().await
    }
}

/// Transport to a sandboxed child process, exchanging newline-delimited
/// JSON over stdin/stdout. Stderr passes through for debugging; the child
/// is killed when the transport drops.
pub struct ProcessTransport {
    child: Arc<Mutex<Child>>,
    stdin: Mutex<tokio::process::ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
}

impl ProcessTransport {
    /// Spawn the unit process.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&PathBuf>,
    ) -> HostResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::Transport(format!("failed to spawn unit {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Transport("failed to capture unit stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Transport("failed to capture unit stdout".into()))?;

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
        })
    }

    /// Check whether the unit process is still running.
    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Kill the unit process.
    pub async fn kill(&self) -> HostResult<()> {
        let mut child = self.child.lock().await;
        child
            .kill()
            .await
            .map_err(|e| HostError::Transport(format!("failed to kill unit: {e}")))
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, message: WireMessage) -> HostResult<()> {
        let line = serde_json::to_string(&message)?;
        tracing::trace!("unit send: {}", line);

        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write
            .await
            .map_err(|e| HostError::Transport(format!("unit stdin write failed: {e}")))
    }

    async fn recv(&self) -> Option<WireMessage> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let mut line = String::new();
            match stdout.read_line(&mut line).await {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str(trimmed) {
                        Ok(msg) => return Some(msg),
                        Err(e) => {
                            // A garbled line from a misbehaving unit must not
                            // wedge the protocol loop.
                            tracing::warn!("discarding unparseable unit message: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("unit stdout read failed: {}", e);
                    return None;
                }
            }
        }
    }
}
