pub mod bridge;
pub mod broker;
pub mod client;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod pairing;
pub mod registry;
pub mod report;
pub mod session;

mod reconcile;
mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use bridge::{BridgeConfig, BridgeFactory};
pub use broker::ViewerHub;
pub use client::{ClientEvent, ClientEvents, ClientFactory, ProtocolClient};
pub use credentials::{CredentialStore, FsCredentialStore};
pub use dispatch::Dispatcher;
pub use error::{ClientError, CredentialError, EngineError, ErrorKind, ReportError};
pub use lifecycle::ConnectOutcome;
pub use registry::SessionHandle;
pub use report::{BackendReporter, HttpReporter};
pub use session::{Services, SessionManager, Timeouts};
