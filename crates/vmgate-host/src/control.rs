use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::clients::ClientId;
use crate::config::LaunchConfig;
use crate::error::HostError;
use crate::launcher::Launcher;
use crate::scope::Scope;
use crate::status::VmStatus;

pub const LAUNCH: &str = "launch";
pub const TERMINATE: &str = "terminate";

/// A control message as received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Sender identity; `None` when the sender could not be identified.
    pub source: Option<ClientId>,
    pub data: String,
}

impl ControlMessage {
    pub fn new(source: ClientId, data: impl Into<String>) -> Self {
        Self {
            source: Some(source),
            data: data.into(),
        }
    }
}

/// First line written to every control connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "type")]
    pub kind: String,
    pub client: ClientId,
}

/// Turns `launch` / `terminate` messages into launcher calls.
pub struct ControlHandler {
    scope: Arc<Scope>,
    launcher: Arc<Launcher>,
    launch: LaunchConfig,
}

impl ControlHandler {
    pub fn new(scope: Arc<Scope>, launcher: Arc<Launcher>, launch: LaunchConfig) -> Self {
        Self {
            scope,
            launcher,
            launch,
        }
    }

    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    /// Context activation: take control of every client already connected.
    pub fn activate(&self) -> usize {
        tracing::info!("claiming control");
        self.scope.clients().claim()
    }

    pub async fn handle_message(&self, message: ControlMessage) {
        let Some(source) = message.source else {
            tracing::error!("no client id on control message");
            return;
        };
        let Some(client) = self.scope.clients().get(source) else {
            tracing::error!(client = %source, "no client");
            return;
        };

        match message.data.trim() {
            TERMINATE => {
                client.post_status(&VmStatus::Exited);
                self.launcher.terminate().await;
            }
            LAUNCH => {
                self.launcher.launch(&self.launch, client).await;
            }
            other => {
                tracing::debug!(client = %source, "ignoring control message '{other}'");
            }
        }
    }
}

/// Control server on a Unix socket with line framing.
///
/// Every connection is one client. Each line it sends is a control message;
/// status broadcasts come back as JSON lines.
pub struct ControlServer {
    path: PathBuf,
    handler: Arc<ControlHandler>,
    scope: Arc<Scope>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ControlServer {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        handler: Arc<ControlHandler>,
        scope: Arc<Scope>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Self {
        Self {
            path: path.into(),
            handler,
            scope,
            shutdown_rx: shutdown_tx.subscribe(),
        }
    }

    pub async fn run(mut self) -> Result<(), HostError> {
        // Ensure no stale socket exists
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }

        let listener = UnixListener::bind(&self.path)
            .map_err(|e| HostError::Control(format!("failed to bind control socket: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        tracing::info!("control socket listening at {}", self.path.display());

        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            tokio::spawn(handle_conn(stream, self.handler.clone(), self.scope.clone()));
                        }
                        Err(err) => tracing::warn!("control accept failed: {err}"),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    let _ = std::fs::remove_file(&self.path);
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_conn(stream: UnixStream, handler: Arc<ControlHandler>, scope: Arc<Scope>) {
    let (client, mut outbox) = scope.clients().register();
    let id = client.id();
    let hello = Hello {
        kind: "hello".into(),
        client: id,
    };
    if let Ok(json) = serde_json::to_string(&hello) {
        client.post_message(json);
    }
    drop(client);
    tracing::debug!(client = %id, "control client connected");

    let (r, mut w) = stream.into_split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if w.write_all(message.as_bytes()).await.is_err() || w.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut reader = BufReader::new(r);
    let mut line = String::new();
    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 {
            break;
        }
        let data = line.trim();
        if !data.is_empty() {
            let handler = handler.clone();
            let message = ControlMessage::new(id, data);
            tokio::spawn(async move { handler.handle_message(message).await });
        }
        line.clear();
    }

    scope.clients().remove(id);
    tracing::debug!(client = %id, "control client disconnected");
    // In-flight launches may still hold the client; the writer ends with them.
    drop(writer);
}
