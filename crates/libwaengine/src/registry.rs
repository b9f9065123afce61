use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot, watch};

use waengine_protocol::{InstanceId, SessionSnapshot, SessionState};

use crate::client::ProtocolClient;
use crate::error::EngineError;
use crate::lifecycle::ConnectOutcome;
use crate::session::Services;
use crate::worker::{self, Command, SessionView};

/// Handle to one instance's session. Reads go through the snapshot its
/// worker publishes; every mutation is a command to that worker.
pub struct SessionHandle {
    instance_id: InstanceId,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    pub(crate) fn new(
        instance_id: InstanceId,
        commands: mpsc::Sender<Command>,
        view: watch::Receiver<SessionView>,
    ) -> Self {
        Self {
            instance_id,
            commands,
            view,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.view.borrow().snapshot.clone()
    }

    pub fn state(&self) -> SessionState {
        self.view.borrow().snapshot.state
    }

    /// Wait until the session reaches `state`; `None` if the worker is gone.
    pub async fn wait_for_state(&self, state: SessionState) -> Option<SessionSnapshot> {
        let mut view = self.view.clone();
        let snapshot = view
            .wait_for(|v| v.snapshot.state == state)
            .await
            .ok()
            .map(|v| v.snapshot.clone());
        snapshot
    }

    /// The protocol client, only while the session is connected.
    pub(crate) fn connected_client(&self) -> Option<Arc<dyn ProtocolClient>> {
        let view = self.view.borrow();
        if view.snapshot.state == SessionState::Connected {
            view.client.clone()
        } else {
            None
        }
    }

    pub(crate) async fn connect(&self) -> Result<ConnectOutcome, EngineError> {
        // Live states answer without a transition, so skip the worker queue,
        // which may be busy with backend reports or a teardown.
        match self.state() {
            SessionState::Initializing | SessionState::AwaitingPairing => {
                return Ok(ConnectOutcome::AlreadyInitializing);
            }
            SessionState::Connected => return Ok(ConnectOutcome::AlreadyConnected),
            SessionState::Uninitialized | SessionState::Disconnected => {}
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect { reply }).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub(crate) async fn reconcile(&self) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Reconcile { done }).await?;
        rx.await.map_err(|_| self.gone())
    }

    pub(crate) async fn shutdown(&self) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Shutdown { done }).await?;
        rx.await.map_err(|_| self.gone())
    }

    async fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.commands.send(cmd).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> EngineError {
        EngineError::WorkerGone(self.instance_id.clone())
    }
}

/// In-memory map from instance id to session. Sessions are never removed;
/// they are re-driven through their states for the life of the process.
pub struct Registry {
    sessions: DashMap<InstanceId, Arc<SessionHandle>>,
    services: Arc<Services>,
}

impl Registry {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            sessions: DashMap::new(),
            services,
        }
    }

    /// Return the session for `instance_id`, creating it in `Uninitialized`
    /// if absent. Creation does not start a protocol client.
    pub fn get_or_create(&self, instance_id: &str) -> (Arc<SessionHandle>, bool) {
        match self.sessions.entry(instance_id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let handle = Arc::new(worker::spawn(instance_id, Arc::clone(&self.services)));
                entry.insert(Arc::clone(&handle));
                (handle, true)
            }
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(instance_id).map(|r| Arc::clone(r.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots of every session, ordered by instance id.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|r| r.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        snapshots
    }

    pub(crate) fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|r| Arc::clone(r.value())).collect()
    }
}
