use std::sync::Arc;

use tracing::{debug, error, info, warn};

use waengine_protocol::{BackendReport, ReportStatus, ViewerEvent};

use crate::broker::ViewerHub;
use crate::pairing;
use crate::report::BackendReporter;

/// Fans one transition out to the two independent sinks: live viewers
/// (fire-and-forget) and the backend (awaited, failure logged).
#[derive(Clone)]
pub struct Dispatcher {
    viewers: Arc<ViewerHub>,
    reporter: Arc<dyn BackendReporter>,
    print_pairing_qr: bool,
}

impl Dispatcher {
    pub fn new(viewers: Arc<ViewerHub>, reporter: Arc<dyn BackendReporter>) -> Self {
        Self {
            viewers,
            reporter,
            print_pairing_qr: false,
        }
    }

    /// Also print pairing codes as terminal QR codes on stderr.
    pub fn with_terminal_qr(mut self, enabled: bool) -> Self {
        self.print_pairing_qr = enabled;
        self
    }

    pub fn viewers(&self) -> &Arc<ViewerHub> {
        &self.viewers
    }

    pub fn show_pairing_code(&self, instance_id: &str, code: &str) {
        if self.print_pairing_qr
            && let Some(qr) = pairing::render_terminal(code)
        {
            eprintln!("[{instance_id}] scan to pair:\n{qr}");
        }

        let image = match pairing::render_data_url(code) {
            Ok(image) => image,
            Err(e) => {
                warn!(instance_id, error = %e, "failed to render pairing code");
                return;
            }
        };
        let reached = self
            .viewers
            .broadcast(instance_id, ViewerEvent::PairingCode { image });
        info!(instance_id, viewers = reached, "pairing code emitted");
    }

    pub fn announce_ready(&self, instance_id: &str, account: &str) {
        let reached = self.viewers.broadcast(
            instance_id,
            ViewerEvent::Ready {
                status: ReportStatus::Connected,
                phone: account.to_string(),
            },
        );
        debug!(instance_id, viewers = reached, "ready announced");
    }

    /// Report to the backend. Never fails the caller: the in-memory state is
    /// authoritative whether or not the backend heard about it.
    pub async fn report(&self, report: BackendReport) {
        match self.reporter.report(&report).await {
            Ok(()) => info!(
                instance_id = %report.instance_id,
                status = %report.status,
                "backend updated"
            ),
            Err(e) => error!(
                instance_id = %report.instance_id,
                status = %report.status,
                error = %e,
                "failed to update backend"
            ),
        }
    }
}
