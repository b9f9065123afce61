//! Boundary to the external chat-protocol implementation.
//!
//! A [`ProtocolClient`] is owned by exactly one session. Its lifecycle
//! notifications arrive on the [`ClientEvents`] receiver handed out by the
//! [`ClientFactory`] together with the client, so the session worker can
//! consume them as a typed stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Lifecycle and traffic notifications emitted by a protocol client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A pairing code is available for the user to scan.
    PairingCode(String),
    /// Pairing completed; `account` is the protocol-level account id.
    Ready { account: String },
    /// The client lost its session.
    Disconnected { reason: String },
    /// An inbound message. Content is not processed by the engine.
    Message { from: String, body: String },
}

pub type ClientEvents = mpsc::Receiver<ClientEvent>;

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Run the client's start-up sequence. Pairing and readiness are reported
    /// through the event stream, not through this call.
    async fn initialize(&self) -> Result<(), ClientError>;

    /// Send `body` to an already-normalized chat id.
    async fn send_message(&self, chat_id: &str, body: &str) -> Result<(), ClientError>;

    /// Tear the client down. Must tolerate being called more than once.
    async fn destroy(&self) -> Result<(), ClientError>;
}

/// Builds one protocol client per session start.
pub trait ClientFactory: Send + Sync {
    fn create(
        &self,
        instance_id: &str,
    ) -> Result<(Arc<dyn ProtocolClient>, ClientEvents), ClientError>;
}
