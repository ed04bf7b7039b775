use report_registry::{ReportV1, StoredReportV1};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteAck {
    Created,
    /// The server already held a record with this id.
    Duplicate,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote rejected report ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("remote server error ({status})")]
    Server { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,
}

impl RemoteError {
    /// Everything except an explicit client-error rejection is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RemoteError::Rejected { .. })
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
            return RemoteError::Server {
                status: status.as_u16(),
            };
        }
        if status.is_client_error() {
            RemoteError::Rejected {
                status: status.as_u16(),
                body,
            }
        } else {
            RemoteError::Server {
                status: status.as_u16(),
            }
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// The remote create-report call. Implementations must treat `report.id`
/// as an idempotency key.
pub trait ReportsRemote: Send + Sync + 'static {
    fn create_report(
        &self,
        report: &ReportV1,
    ) -> impl Future<Output = Result<RemoteAck, RemoteError>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpReportsRemote {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReportsRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("http client error: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn reports_url(&self) -> String {
        format!("{}/api/reports", self.base_url)
    }

    /// `GET /api/reports`, for read-only views.
    pub async fn list_reports(&self) -> Result<Vec<StoredReportV1>, RemoteError> {
        let response = self.client.get(self.reports_url()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        Ok(response.json().await?)
    }
}

impl ReportsRemote for HttpReportsRemote {
    async fn create_report(&self, report: &ReportV1) -> Result<RemoteAck, RemoteError> {
        let response = self
            .client
            .post(self.reports_url())
            .json(report)
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::CREATED => Ok(RemoteAck::Created),
            s if s.is_success() => Ok(RemoteAck::Duplicate),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(RemoteError::from_status(s, body))
            }
        }
    }
}
