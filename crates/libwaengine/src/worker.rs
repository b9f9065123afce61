//! Per-instance transition loop.
//!
//! Every input for one instance id (connect requests, client events,
//! start-up failures, reconcile and shutdown) goes through a single mpsc
//! inbox and is handled to completion before the next one, which is what
//! serializes transitions per instance. Different instances run on
//! independent tasks.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use waengine_protocol::{BackendReport, InstanceId, SessionSnapshot, SessionState};

use crate::client::{ClientEvent, ClientEvents, ProtocolClient};
use crate::error::ClientError;
use crate::lifecycle::{ConnectOutcome, Effect, Lifecycle, Trigger};
use crate::registry::SessionHandle;
use crate::session::Services;

const COMMAND_QUEUE: usize = 64;

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<ConnectOutcome>,
    },
    Client {
        generation: u64,
        event: ClientEvent,
    },
    StartupFailed {
        generation: u64,
        reason: String,
    },
    Reconcile {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// What the worker publishes after every transition.
#[derive(Clone)]
pub(crate) struct SessionView {
    pub snapshot: SessionSnapshot,
    pub client: Option<Arc<dyn ProtocolClient>>,
}

struct Worker {
    instance_id: InstanceId,
    lifecycle: Lifecycle,
    client: Option<Arc<dyn ProtocolClient>>,
    view: watch::Sender<SessionView>,
    inbox: mpsc::Receiver<Command>,
    commands: mpsc::WeakSender<Command>,
    services: Arc<Services>,
}

/// Spawn the worker for a new session in state `Uninitialized`.
pub(crate) fn spawn(instance_id: &str, services: Arc<Services>) -> SessionHandle {
    let (tx, inbox) = mpsc::channel(COMMAND_QUEUE);
    let lifecycle = Lifecycle::new();
    let (view, view_rx) = watch::channel(SessionView {
        snapshot: SessionSnapshot {
            instance_id: instance_id.to_string(),
            state: lifecycle.state(),
            account_identifier: None,
        },
        client: None,
    });

    let worker = Worker {
        instance_id: instance_id.to_string(),
        lifecycle,
        client: None,
        view,
        inbox,
        commands: tx.downgrade(),
        services,
    };
    tokio::spawn(worker.run());

    SessionHandle::new(instance_id.to_string(), tx, view_rx)
}

impl Worker {
    async fn run(mut self) {
        while let Some(cmd) = self.inbox.recv().await {
            self.handle(cmd).await;
        }
        debug!(instance_id = %self.instance_id, "session worker stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let outcome = self.drive(Trigger::ConnectRequested).await;
                if let Some(outcome) = outcome {
                    let _ = reply.send(outcome);
                }
            }
            Command::Client { generation, event } => self.on_client_event(generation, event).await,
            Command::StartupFailed { generation, reason } => {
                if self.lifecycle.state() == SessionState::Connected {
                    debug!(instance_id = %self.instance_id, generation, %reason, "late start-up error ignored");
                } else {
                    warn!(instance_id = %self.instance_id, generation, %reason, "client start-up failed");
                }
                self.drive(Trigger::StartupFailed { generation, reason }).await;
            }
            Command::Reconcile { done } => {
                info!(instance_id = %self.instance_id, "found saved session, marking as disconnected");
                self.drive(Trigger::Reconcile).await;
                let _ = done.send(());
            }
            Command::Shutdown { done } => {
                self.drive(Trigger::Shutdown).await;
                let _ = done.send(());
            }
        }
    }

    async fn on_client_event(&mut self, generation: u64, event: ClientEvent) {
        let trigger = match event {
            ClientEvent::PairingCode(code) => Trigger::PairingCode { generation, code },
            ClientEvent::Ready { account } => {
                info!(instance_id = %self.instance_id, %account, "client ready");
                Trigger::Ready {
                    generation,
                    account,
                }
            }
            ClientEvent::Disconnected { reason } => {
                info!(instance_id = %self.instance_id, %reason, "client disconnected");
                Trigger::Disconnected { generation, reason }
            }
            ClientEvent::Message { from, .. } => {
                debug!(instance_id = %self.instance_id, %from, "inbound message");
                return;
            }
        };
        self.drive(trigger).await;
    }

    /// Apply a trigger and run its effects, including any follow-up
    /// triggers the effects produce.
    async fn drive(&mut self, trigger: Trigger) -> Option<ConnectOutcome> {
        let mut reply = None;
        let mut queue = VecDeque::from([trigger]);

        while let Some(trigger) = queue.pop_front() {
            let step = self.lifecycle.apply(trigger);
            reply = reply.or(step.reply);

            // Clear the reference before publishing so that no sender can
            // pick up a client that is about to be destroyed.
            let mut retiring = if step.effects.contains(&Effect::DestroyClient) {
                self.client.take()
            } else {
                None
            };
            self.publish();

            for effect in step.effects {
                if let Some(follow_up) = self.execute(effect, &mut retiring).await {
                    queue.push_back(follow_up);
                }
            }
        }
        reply
    }

    async fn execute(
        &mut self,
        effect: Effect,
        retiring: &mut Option<Arc<dyn ProtocolClient>>,
    ) -> Option<Trigger> {
        let id = self.instance_id.as_str();
        match effect {
            Effect::StartClient { generation } => return self.start_client(generation),
            Effect::ShowPairingCode { code } => {
                self.services.dispatcher.show_pairing_code(id, &code);
            }
            Effect::AnnounceReady { account } => {
                self.services.dispatcher.announce_ready(id, &account);
            }
            Effect::ReportConnected { account } => {
                self.services
                    .dispatcher
                    .report(BackendReport::connected(id, &account))
                    .await;
            }
            Effect::DestroyClient => {
                if let Some(client) = retiring.take() {
                    self.destroy_client(client).await;
                }
            }
            Effect::DeleteCredentials => match self.services.credentials.delete(id).await {
                Ok(true) => info!(instance_id = id, "session credentials deleted"),
                Ok(false) => debug!(instance_id = id, "no session credentials to delete"),
                Err(e) => error!(instance_id = id, error = %e, "failed to delete session credentials"),
            },
            Effect::ReportDisconnected => {
                self.services
                    .dispatcher
                    .report(BackendReport::disconnected(id))
                    .await;
            }
        }
        None
    }

    fn start_client(&mut self, generation: u64) -> Option<Trigger> {
        let (client, events) = match self.services.factory.create(&self.instance_id) {
            Ok(pair) => pair,
            Err(e) => {
                return Some(Trigger::StartupFailed {
                    generation,
                    reason: e.to_string(),
                });
            }
        };
        let Some(commands) = self.commands.upgrade() else {
            return Some(Trigger::StartupFailed {
                generation,
                reason: "session worker is shutting down".to_string(),
            });
        };

        self.client = Some(Arc::clone(&client));
        self.publish();
        info!(instance_id = %self.instance_id, generation, "protocol client created");

        tokio::spawn(forward_events(generation, events, commands.clone()));

        let startup = self.services.timeouts.startup;
        tokio::spawn(async move {
            let reason = match tokio::time::timeout(startup, client.initialize()).await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(_) => ClientError::Timeout(startup).to_string(),
            };
            let _ = commands
                .send(Command::StartupFailed { generation, reason })
                .await;
        });
        None
    }

    async fn destroy_client(&self, client: Arc<dyn ProtocolClient>) {
        let limit = self.services.timeouts.destroy;
        match tokio::time::timeout(limit, client.destroy()).await {
            Ok(Ok(())) => info!(instance_id = %self.instance_id, "client destroyed"),
            Ok(Err(e)) => warn!(instance_id = %self.instance_id, error = %e, "error destroying client"),
            Err(_) => warn!(instance_id = %self.instance_id, ?limit, "timed out destroying client"),
        }
    }

    fn publish(&self) {
        let account = self.lifecycle.account().map(str::to_string);
        self.view.send_replace(SessionView {
            snapshot: SessionSnapshot {
                instance_id: self.instance_id.clone(),
                state: self.lifecycle.state(),
                account_identifier: account,
            },
            client: self.client.clone(),
        });
    }
}

async fn forward_events(generation: u64, mut events: ClientEvents, commands: mpsc::Sender<Command>) {
    while let Some(event) = events.recv().await {
        if commands
            .send(Command::Client { generation, event })
            .await
            .is_err()
        {
            break;
        }
    }
}
