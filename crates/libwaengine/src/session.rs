use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use waengine_protocol::{
    SessionSnapshot, ViewerEvent, normalize_recipient, validate_instance_id,
};

use crate::broker::ViewerHub;
use crate::client::ClientFactory;
use crate::credentials::CredentialStore;
use crate::dispatch::Dispatcher;
use crate::error::EngineError;
use crate::lifecycle::ConnectOutcome;
use crate::reconcile;
use crate::registry::{Registry, SessionHandle};

/// Bounds on protocol client operations that can hang.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Limit on a client's start-up sequence; exceeding it forces a disconnect.
    pub startup: Duration,
    /// Limit on a client's teardown; exceeding it is logged and ignored.
    pub destroy: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(120),
            destroy: Duration::from_secs(15),
        }
    }
}

/// Collaborators shared by every session worker.
pub struct Services {
    pub factory: Arc<dyn ClientFactory>,
    pub credentials: Arc<dyn CredentialStore>,
    pub dispatcher: Dispatcher,
    pub timeouts: Timeouts,
}

/// Entry point for request handlers: owns the registry and routes requests
/// to per-instance sessions.
pub struct SessionManager {
    registry: Registry,
    services: Arc<Services>,
}

impl SessionManager {
    pub fn new(services: Services) -> Self {
        let services = Arc::new(services);
        Self {
            registry: Registry::new(Arc::clone(&services)),
            services,
        }
    }

    /// Start (or observe) the session for `instance_id`. Never waits for
    /// pairing or connection to complete.
    pub async fn connect(&self, instance_id: &str) -> Result<ConnectOutcome, EngineError> {
        validate_instance_id(instance_id).map_err(EngineError::Validation)?;

        let (session, created) = self.registry.get_or_create(instance_id);
        if created {
            debug!(instance_id, "session registered");
        }
        let outcome = session.connect().await?;
        info!(instance_id, ?outcome, "connect requested");
        Ok(outcome)
    }

    /// Send `body` to `recipient` through the instance's connected client.
    pub async fn send_message(
        &self,
        instance_id: &str,
        recipient: &str,
        body: &str,
    ) -> Result<(), EngineError> {
        validate_instance_id(instance_id).map_err(EngineError::Validation)?;
        if recipient.trim().is_empty() {
            return Err(EngineError::Validation("number must not be empty".to_string()));
        }
        if body.is_empty() {
            return Err(EngineError::Validation("message must not be empty".to_string()));
        }

        let client = self
            .registry
            .get(instance_id)
            .and_then(|session| session.connected_client())
            .ok_or_else(|| EngineError::NotConnected(instance_id.to_string()))?;

        let chat_id = normalize_recipient(recipient);
        client.send_message(&chat_id, body).await.map_err(|e| {
            warn!(instance_id, %chat_id, error = %e, "send failed");
            EngineError::SendFailure(e)
        })?;
        info!(instance_id, %chat_id, "message sent");
        Ok(())
    }

    pub fn session(&self, instance_id: &str) -> Option<Arc<SessionHandle>> {
        self.registry.get(instance_id)
    }

    pub fn snapshot(&self, instance_id: &str) -> Option<SessionSnapshot> {
        self.registry.get(instance_id).map(|s| s.snapshot())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.registry.list()
    }

    /// Subscribe to viewer events for one instance. Works before the
    /// instance has ever been connected.
    pub fn subscribe(&self, instance_id: &str) -> broadcast::Receiver<ViewerEvent> {
        self.viewers().subscribe(instance_id)
    }

    pub fn viewers(&self) -> &Arc<ViewerHub> {
        self.services.dispatcher.viewers()
    }

    /// Force every instance with persisted credentials to `Disconnected`.
    /// Meant to run once at process start, before requests are served.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        reconcile::run(&self.registry, self.services.credentials.as_ref()).await
    }

    /// Destroy every live protocol client. Credentials are kept so that the
    /// next start reconciles and reports them.
    pub async fn shutdown(&self) {
        for session in self.registry.handles() {
            if !session.state().is_live() {
                continue;
            }
            if let Err(e) = session.shutdown().await {
                warn!(instance_id = session.instance_id(), error = %e, "shutdown failed");
            }
        }
    }
}
