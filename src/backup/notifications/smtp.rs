use crate::backup::function_path;
use crate::backup::notifications::{Notification, Severity};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::time::Duration;
use validator::Validate;

/// E-mail channel.
///
/// `username`/`password` are only sent when both are set. The password is a
/// [`RedactedString`] so it never shows up in logs.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SmtpNotificationConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    port: Option<u16>,
    #[builder(into)]
    smtp_mode: SmtpMode,
    #[builder(into)]
    from: Mailbox,
    #[validate(length(min = 1))]
    #[builder(into)]
    to: Vec<Mailbox>,
    #[builder(into)]
    username: Option<String>,
    #[validate(nested)]
    password: Option<RedactedString>,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
}

/// - `Unsecured`: plain text, for relays on a trusted network
/// - `Ssl`: TLS from the first byte
/// - `StartTls`: plain text upgraded to TLS
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmtpMode {
    Unsecured,
    Ssl,
    StartTls,
}

impl SmtpNotificationConfig {
    #[named]
    fn transport(&self) -> Result<SmtpTransport> {
        let mut builder = match self.smtp_mode {
            SmtpMode::Unsecured => Ok(SmtpTransport::builder_dangerous(self.host.as_str())),
            SmtpMode::Ssl => SmtpTransport::relay(self.host.as_str()),
            SmtpMode::StartTls => SmtpTransport::starttls_relay(self.host.as_str()),
        }
        .map_err(Error::from)
        .add_msg(format!(
            "Failed to build smtp client for host: {:?} with mode {:?}",
            self.host, self.smtp_mode
        ))
        .add_fn_name(function_path!())?
        .timeout(self.timeout);

        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose().to_string(),
            ));
        }
        Ok(builder.build())
    }

    /// Configured recipients followed by any extra ones not already listed.
    fn recipients(&self, extra: &[Mailbox]) -> Vec<Mailbox> {
        let mut recipients = self.to.clone();
        for mailbox in extra {
            if !recipients.iter().any(|r| r.email == mailbox.email) {
                recipients.push(mailbox.clone());
            }
        }
        recipients
    }
}

impl Notification for SmtpNotificationConfig {
    fn send(&self, subject: &str, body: &str, severity: Severity) -> Result<()> {
        self.send_to(subject, body, severity, &[])
    }

    #[named]
    fn send_to(
        &self,
        subject: &str,
        body: &str,
        severity: Severity,
        extra_recipients: &[Mailbox],
    ) -> Result<()> {
        let recipients = self.recipients(extra_recipients);
        tracing::info!(
            "Sending {} e-mail notification from {} to [{}]",
            severity,
            self.from,
            recipients.iter().join(", ")
        );
        let email = recipients
            .iter()
            .fold(Message::builder(), |email, send_to| email.to(send_to.clone()))
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(Error::from)
            .add_msg(format!("Fail to build notification email from {}", self.from))
            .add_fn_name(function_path!())?;

        let response = self
            .transport()?
            .send(&email)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        if response.is_positive() {
            Ok(())
        } else {
            let error_vec = response
                .message()
                .map(|m| Error::smtp_send_error(m.to_owned()))
                .collect_vec();
            Err(Error::lots_of_error(error_vec))
        }
    }
}
