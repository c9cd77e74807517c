//! Event intake socket
//!
//! The external event source (pod watcher, node pressure monitor) connects
//! to a Unix socket and publishes one JSON event per line. Malformed lines
//! are discarded; a publisher disconnecting does not stop the agent.

use anyhow::{Context, Result};
use qos_agent_lib::events::AgentEvent;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct EventSocket {
    listener: UnixListener,
    event_tx: mpsc::Sender<AgentEvent>,
}

impl EventSocket {
    /// Bind the intake socket, replacing a stale socket file if present
    pub fn bind(path: impl AsRef<Path>, event_tx: mpsc::Sender<AgentEvent>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("failed to bind event socket {}", path.display()))?;
        info!(path = %path.display(), "Listening for events");
        Ok(Self { listener, event_tx })
    }

    /// Accept publishers until the process exits
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("Event publisher connected");
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = read_events(stream, event_tx).await {
                            warn!(error = %err, "Event publisher connection failed");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept event connection");
                }
            }
        }
    }
}

async fn read_events(stream: UnixStream, event_tx: mpsc::Sender<AgentEvent>) -> Result<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AgentEvent>(line) {
            Ok(event) => {
                if event_tx.send(event).await.is_err() {
                    // Receiver gone, the agent is shutting down.
                    break;
                }
            }
            Err(err) => warn!(error = %err, "Discarding malformed event"),
        }
    }
    debug!("Event publisher disconnected");
    Ok(())
}
