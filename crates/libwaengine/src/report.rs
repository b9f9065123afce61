use std::time::Duration;

use async_trait::async_trait;

use waengine_protocol::BackendReport;

use crate::error::ReportError;

/// Path of the status endpoint on the backend.
pub const UPDATE_STATUS_PATH: &str = "/api/device/update-status";

/// Outbound channel to the backend system of record.
#[async_trait]
pub trait BackendReporter: Send + Sync {
    async fn report(&self, report: &BackendReport) -> Result<(), ReportError>;
}

/// Posts reports as JSON to `{base_url}/api/device/update-status`.
pub struct HttpReporter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpReporter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("waengine/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{UPDATE_STATUS_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BackendReporter for HttpReporter {
    async fn report(&self, report: &BackendReport) -> Result<(), ReportError> {
        let resp = self.client.post(&self.endpoint).json(report).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReportError::Rejected(format!("{status}: {body}")));
        }
        Ok(())
    }
}
