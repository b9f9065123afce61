use tracing::{info, warn};

use waengine_protocol::validate_instance_id;

use crate::credentials::CredentialStore;
use crate::error::EngineError;
use crate::registry::Registry;

/// Drive every instance that has a persisted credential entry through the
/// disconnect path: its client died with the previous process, so the entry
/// is deleted and the backend is told it is disconnected.
pub(crate) async fn run(
    registry: &Registry,
    credentials: &dyn CredentialStore,
) -> Result<usize, EngineError> {
    let stale = credentials.list().await?;
    if stale.is_empty() {
        return Ok(0);
    }

    let mut reconciled = 0;
    for instance_id in stale {
        if let Err(reason) = validate_instance_id(&instance_id) {
            // Not addressable as a session, but still stale.
            match credentials.delete(&instance_id).await {
                Ok(_) => warn!(%instance_id, %reason, "removed credential entry with invalid id"),
                Err(e) => warn!(%instance_id, error = %e, "failed to remove credential entry with invalid id"),
            }
            continue;
        }
        let (session, _) = registry.get_or_create(&instance_id);
        session.reconcile().await?;
        reconciled += 1;
    }

    info!(count = reconciled, "stale sessions reconciled");
    Ok(reconciled)
}
