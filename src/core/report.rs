//! Call-end reporting with backup failover.
//!
//! When a session closes, a form-encoded summary is POSTed to the primary
//! endpoint. Any failure (transport error or non-2xx) is retried once
//! against the backup endpoint with the identical body. If that fails too,
//! one line is appended to the durable error log and the error is swallowed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Report endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No report endpoint configured")]
    NotConfigured,
}

pub type ReportResult<T> = Result<T, ReportError>;

/// Whole seconds between `start` and `end`, never negative.
pub fn call_duration_secs(start: Instant, end: Instant) -> u64 {
    end.saturating_duration_since(start).as_secs()
}

/// Summary of one finished call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub stream_sid: String,
    pub call_sid: String,
    pub external_ref_id: Option<String>,
    pub conversation_id: Option<String>,
    pub duration_secs: u64,
    /// Advanced-mode dynamic variables, echoed back to the report consumer
    pub dynamic_variables: Map<String, Value>,
}

impl CallReport {
    const RESERVED: [&'static str; 5] = [
        "stream_sid",
        "call_sid",
        "external_ref_id",
        "duration",
        "conversation_id",
    ];

    /// Form body: dynamic variables followed by the call fields.
    ///
    /// Call fields win over dynamic variables of the same name. Non-string
    /// variables are sent as their JSON text.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = self
            .dynamic_variables
            .iter()
            .filter(|(key, _)| !Self::RESERVED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), form_value(value)))
            .collect();

        fields.push(("stream_sid".to_string(), self.stream_sid.clone()));
        fields.push(("call_sid".to_string(), self.call_sid.clone()));
        if let Some(ref_id) = &self.external_ref_id {
            fields.push(("external_ref_id".to_string(), ref_id.clone()));
        }
        fields.push(("duration".to_string(), self.duration_secs.to_string()));
        fields.push((
            "conversation_id".to_string(),
            self.conversation_id.clone().unwrap_or_default(),
        ));
        fields
    }
}

fn form_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Successful endpoint response.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportReceipt {
    /// Body was JSON
    Json(Value),
    /// Body was plain text; kept as `{success: true, message}`
    Text { success: bool, message: String },
}

/// Append-only file of delivery failures.
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `[timestamp] message` as one line.
    pub async fn append(&self, message: &str) -> std::io::Result<()> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string());
        let line = format!("[{timestamp}] {message}\n");

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

/// Delivers call-end reports.
pub struct CallEndReporter {
    client: reqwest::Client,
    primary_url: Option<String>,
    backup_url: Option<String>,
    error_log: ErrorLog,
}

impl CallEndReporter {
    /// `timeout` bounds each delivery attempt separately.
    pub fn new(
        primary_url: Option<String>,
        backup_url: Option<String>,
        timeout: Duration,
        error_log: ErrorLog,
    ) -> ReportResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            primary_url,
            backup_url,
            error_log,
        })
    }

    pub fn from_server_config(config: &ServerConfig) -> ReportResult<Self> {
        Self::new(
            config.report_primary_url.clone(),
            config.report_backup_url.clone(),
            config.report_timeout(),
            ErrorLog::new(config.error_log_path.clone()),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.primary_url.is_some()
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    /// Deliver a report: primary first, then backup with the same body.
    ///
    /// When every attempt fails, exactly one record is written to the error
    /// log and the last error is returned.
    pub async fn deliver(&self, report: &CallReport) -> ReportResult<ReportReceipt> {
        let Some(primary) = self.primary_url.as_deref() else {
            return Err(ReportError::NotConfigured);
        };

        let fields = report.form_fields();

        let primary_err = match self.post(primary, &fields).await {
            Ok(receipt) => {
                info!(call_sid = %report.call_sid, "Call-end report delivered");
                return Ok(receipt);
            }
            Err(e) => e,
        };
        warn!(
            call_sid = %report.call_sid,
            url = %primary,
            error = %primary_err,
            "Primary report endpoint failed"
        );

        let Some(backup) = self.backup_url.as_deref() else {
            self.record_failure(&format!(
                "Call-end report failed for call {}: primary: {}",
                report.call_sid, primary_err
            ))
            .await;
            return Err(primary_err);
        };

        match self.post(backup, &fields).await {
            Ok(receipt) => {
                info!(call_sid = %report.call_sid, "Call-end report delivered to backup endpoint");
                Ok(receipt)
            }
            Err(backup_err) => {
                self.record_failure(&format!(
                    "Call-end report failed for call {}: primary: {}; backup: {}",
                    report.call_sid, primary_err, backup_err
                ))
                .await;
                Err(backup_err)
            }
        }
    }

    /// Deliver in the background on `tracker`. Errors are already logged by
    /// [`deliver`](Self::deliver) and go no further.
    pub fn dispatch(self: &Arc<Self>, tracker: &TaskTracker, report: CallReport) {
        if !self.is_enabled() {
            debug!(call_sid = %report.call_sid, "Call-end reporting disabled");
            return;
        }
        let reporter = Arc::clone(self);
        tracker.spawn(async move {
            if let Err(e) = reporter.deliver(&report).await {
                debug!(call_sid = %report.call_sid, "Call-end report not delivered: {}", e);
            }
        });
    }

    async fn post(&self, url: &str, fields: &[(String, String)]) -> ReportResult<ReportReceipt> {
        let response = self.client.post(url).form(fields).send().await?;

        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ReportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if is_json {
            if let Ok(json) = serde_json::from_str::<Value>(&body) {
                return Ok(ReportReceipt::Json(json));
            }
        }
        Ok(ReportReceipt::Text {
            success: true,
            message: body,
        })
    }

    async fn record_failure(&self, message: &str) {
        error!("{}", message);
        if let Err(e) = self.error_log.append(message).await {
            error!(
                path = %self.error_log.path().display(),
                "Failed to write error log: {}", e
            );
        }
    }
}
