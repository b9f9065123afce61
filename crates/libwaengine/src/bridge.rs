//! Protocol client backed by an external bridge process.
//!
//! The bridge implements the chat protocol for one instance. It is spawned as
//! `<command> <args..> --instance-id <id> --auth-dir <dir>` and speaks JSON
//! lines: [`BridgeCommand`]s on stdin, [`BridgeEvent`]s on stdout. Stderr is
//! inherited so the bridge's own logs land next to ours.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use waengine_protocol::{BridgeCommand, BridgeEvent, InstanceId, MAX_BRIDGE_LINE_BYTES};

use crate::client::{ClientEvent, ClientEvents, ClientFactory, ProtocolClient};
use crate::error::ClientError;

const EVENT_QUEUE: usize = 32;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Root directory handed to the bridge for its credential entries.
    pub auth_dir: PathBuf,
    /// Limit on send and destroy round-trips.
    pub request_timeout: Duration,
}

pub struct BridgeFactory {
    config: BridgeConfig,
}

impl BridgeFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for BridgeFactory {
    fn create(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn ProtocolClient>, ClientEvents), ClientError> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg("--instance-id")
            .arg(instance_id)
            .arg("--auth-dir")
            .arg(&self.config.auth_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClientError::Spawn(format!("{}: {e}", self.config.command.display()))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Spawn("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Spawn("bridge stdout unavailable".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let client = Arc::new(BridgeClient {
            instance_id: instance_id.to_string(),
            writer: Mutex::new(FramedWrite::new(
                stdin,
                LinesCodec::new_with_max_length(MAX_BRIDGE_LINE_BYTES),
            )),
            pending: Pending::default(),
            next_id: AtomicU64::new(1),
            child: Mutex::new(child),
            destroyed: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            request_timeout: self.config.request_timeout,
        });

        tokio::spawn(read_events(
            client.instance_id.clone(),
            stdout,
            Arc::clone(&client.pending),
            Arc::clone(&client.destroyed),
            Arc::clone(&client.exited),
            events_tx,
        ));

        debug!(instance_id, pid = ?client_pid(&client), "bridge spawned");
        Ok((client, events_rx))
    }
}

fn client_pid(client: &BridgeClient) -> Option<u32> {
    client.child.try_lock().ok().and_then(|c| c.id())
}

pub struct BridgeClient {
    instance_id: InstanceId,
    writer: Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    pending: Pending,
    next_id: AtomicU64,
    child: Mutex<Child>,
    destroyed: Arc<AtomicBool>,
    /// Set once the bridge's stdout reaches EOF.
    exited: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl BridgeClient {
    async fn request(
        &self,
        build: impl FnOnce(u64) -> BridgeCommand,
        limit: Option<Duration>,
    ) -> Result<(), ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        if self.exited.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let line = serde_json::to_string(&build(id))
            .map_err(|e| ClientError::Remote(format!("encode bridge command: {e}")))?;
        if let Err(e) = self.writer.lock().await.send(line).await {
            self.pending.lock().await.remove(&id);
            debug!(instance_id = %self.instance_id, error = %e, "bridge write failed");
            return Err(ClientError::Closed);
        }

        let answer = match limit {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    return Err(ClientError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        match answer {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(ClientError::Remote(message)),
            Err(_) => Err(ClientError::Closed),
        }
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        self.request(|id| BridgeCommand::Initialize { id }, None)
            .await
    }

    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), ClientError> {
        self.request(
            |id| BridgeCommand::SendMessage {
                id,
                chat_id: chat_id.to_string(),
                body: body.to_string(),
            },
            Some(self.request_timeout),
        )
        .await
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let graceful = self
            .request(|id| BridgeCommand::Destroy { id }, Some(self.request_timeout))
            .await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.request_timeout, child.wait()).await {
            Ok(Ok(status)) => debug!(instance_id = %self.instance_id, %status, "bridge exited"),
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => {
                warn!(instance_id = %self.instance_id, "bridge ignored destroy, killing it");
                child.kill().await?;
            }
        }

        match graceful {
            // The bridge may exit before acknowledging.
            Err(ClientError::Closed) => Ok(()),
            other => other,
        }
    }
}

async fn read_events(
    instance_id: InstanceId,
    stdout: ChildStdout,
    pending: Pending,
    destroyed: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    events: mpsc::Sender<ClientEvent>,
) {
    let mut lines = FramedRead::new(
        stdout,
        LinesCodec::new_with_max_length(MAX_BRIDGE_LINE_BYTES),
    );

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(%instance_id, error = %e, "bridge output unreadable");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: BridgeEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                debug!(%instance_id, error = %e, "ignoring non-protocol bridge output");
                continue;
            }
        };

        let client_event = match event {
            BridgeEvent::Qr { code } => ClientEvent::PairingCode(code),
            BridgeEvent::Ready { account } => ClientEvent::Ready { account },
            BridgeEvent::Disconnected { reason } => ClientEvent::Disconnected { reason },
            BridgeEvent::Message { from, body } => ClientEvent::Message { from, body },
            BridgeEvent::Ack { id } => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(Ok(()));
                }
                continue;
            }
            BridgeEvent::Error {
                id: Some(id),
                message,
            } => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(Err(message));
                }
                continue;
            }
            BridgeEvent::Error { id: None, message } => {
                warn!(%instance_id, %message, "bridge reported an error");
                continue;
            }
        };

        if events.send(client_event).await.is_err() {
            break;
        }
    }

    // Outstanding and later requests observe `Closed`.
    exited.store(true, Ordering::SeqCst);
    pending.lock().await.clear();

    if !destroyed.load(Ordering::SeqCst) {
        let _ = events
            .send(ClientEvent::Disconnected {
                reason: "bridge exited".to_string(),
            })
            .await;
    }
}
