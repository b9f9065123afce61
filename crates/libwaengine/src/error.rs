use thiserror::Error;
use waengine_protocol::InstanceId;

/// Errors surfaced to callers of the session manager.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("instance {0} is not connected")]
    NotConnected(InstanceId),

    #[error("send failed: {0}")]
    SendFailure(#[source] ClientError),

    #[error("session worker for {0} is gone")]
    WorkerGone(InstanceId),

    #[error("credential store error: {0}")]
    Credentials(#[from] CredentialError),
}

/// Coarse classification used by the request layer to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Invalid,
    NotConnected,
    Upstream,
    Internal,
}

impl EngineError {
    /// Classify and produce the message shown to the caller.
    pub fn to_error_kind(&self) -> (ErrorKind, String) {
        match self {
            EngineError::Validation(msg) => (ErrorKind::Invalid, msg.clone()),
            EngineError::NotConnected(_) => (ErrorKind::NotConnected, "Not connected".to_string()),
            EngineError::SendFailure(err) => (ErrorKind::Upstream, err.to_string()),
            EngineError::WorkerGone(_) => (ErrorKind::Internal, self.to_string()),
            EngineError::Credentials(_) => (ErrorKind::Internal, "internal storage error".to_string()),
        }
    }
}

/// Errors produced by a protocol client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to start client: {0}")]
    Spawn(String),

    #[error("client closed")]
    Closed,

    #[error("client timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("{0}")]
    Remote(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the credential store.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to read credential root {path}: {source}")]
    List {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to delete credentials for {instance_id}: {source}")]
    Delete {
        instance_id: InstanceId,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the backend reporter.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend rejected report: {0}")]
    Rejected(String),
}
