use crate::backup::function_path;
use crate::backup::notifications::{Notification, Severity};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use bon::Builder;
use function_name::named;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use validator::Validate;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP channel: POSTs `{"subject", "body", "severity"}` as JSON.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct WebhookNotificationConfig {
    #[validate(url)]
    #[builder(into)]
    url: String,
    /// Sent as `Authorization: Bearer <token>`.
    #[validate(nested)]
    token: Option<RedactedString>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
    severity: Severity,
}

impl Notification for WebhookNotificationConfig {
    #[named]
    fn send(&self, subject: &str, body: &str, severity: Severity) -> Result<()> {
        tracing::info!("Posting {} notification to webhook", severity);
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(Error::from)
            .add_fn_name(function_path!())?;

        let mut request = client.post(&self.url).json(&WebhookPayload {
            subject,
            body,
            severity,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request
            .send()
            .map_err(Error::from)
            .add_msg("Webhook request failed")
            .add_fn_name(function_path!())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::NotificationChannel {
                method: "webhook".into(),
                detail: format!("HTTP {status}"),
            })
        }
    }
}
