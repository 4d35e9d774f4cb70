//! Call control through the Twilio REST API.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CallControlError {
    #[error("Call control request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Call control returned status {status}: {body}")]
    Status { status: u16, body: String },
}

pub type CallControlResult<T> = Result<T, CallControlError>;

/// Ends calls on the telephony side.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Mark the call completed (hang up).
    async fn complete_call(&self, call_sid: &str) -> CallControlResult<()>;
}

/// Twilio REST implementation of [`CallControl`].
pub struct TwilioCallControl {
    client: reqwest::Client,
    api_url: String,
    account_sid: String,
    auth_token: String,
}

impl TwilioCallControl {
    pub fn new(
        api_url: impl Into<String>,
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        timeout: Duration,
    ) -> CallControlResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
        })
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.api_url, self.account_sid, call_sid
        )
    }
}

impl Drop for TwilioCallControl {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.auth_token.zeroize();
    }
}

#[async_trait]
impl CallControl for TwilioCallControl {
    async fn complete_call(&self, call_sid: &str) -> CallControlResult<()> {
        let url = self.call_url(call_sid);
        debug!(call_sid = %call_sid, "Requesting call completion");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallControlError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
