//! Run status notification.
//!
//! One message per run, sent after the archive step. Delivery problems are
//! reported to the caller, which logs them; they never change the verdict.

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::archive::{ArchiveReport, RunStatus};

/// Timestamp format used in the message body.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Webhook request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// What gets reported about a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNotice {
    pub status: RunStatus,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub empty_archive: bool,
}

impl RunNotice {
    pub fn from_report(report: &ArchiveReport) -> Self {
        Self {
            status: report.verdict.status,
            started_at: report.started_at(),
            finished_at: report.finished_at,
            empty_archive: report.verdict.is_empty_archive(),
        }
    }

    /// Message body, one fact per line.
    pub fn text(&self) -> String {
        let mut text = format!(
            "Archive Status: {}\nStart Time: {}\nEnd Time: {}",
            self.status,
            self.started_at.format(TIME_FORMAT),
            self.finished_at.format(TIME_FORMAT)
        );
        if self.empty_archive {
            text.push_str("\nNote: no category data found, archive is empty");
        }
        text
    }

    pub fn payload(&self) -> WebhookPayload {
        WebhookPayload {
            msg_type: "text",
            content: TextContent { text: self.text() },
        }
    }
}

/// JSON body of a text webhook message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub msg_type: &'static str,
    pub content: TextContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextContent {
    pub text: String,
}

pub trait Notifier {
    fn notify(&self, notice: &RunNotice) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for &N {
    fn notify(&self, notice: &RunNotice) -> Result<(), NotifyError> {
        (**self).notify(notice)
    }
}

/// Posts the notice as JSON to a webhook endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("roadvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notice: &RunNotice) -> Result<(), NotifyError> {
        debug!("Posting run notice to {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&notice.payload())
            .send()
            .map_err(|source| NotifyError::Request {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(())
    }
}
