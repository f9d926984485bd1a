use crate::backup::notifications::smtp::SmtpNotificationConfig;
use crate::backup::notifications::webhook::WebhookNotificationConfig;
use crate::backup::result_error::result::Result;
use derive_more::{Display, From};
use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use std::result;
use validator::{Validate, ValidationErrors};

pub mod smtp;
pub mod webhook;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[display("info")]
    Info,
    #[display("error")]
    Error,
}

/// One configured channel, selected by `type` in the YAML.
#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum NotificationConfig {
    Smtp(SmtpNotificationConfig),
    Webhook(WebhookNotificationConfig),
}

impl Validate for NotificationConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            Self::Smtp(inner) => inner.validate(),
            Self::Webhook(inner) => inner.validate(),
        }
    }
}

impl Notification for NotificationConfig {
    fn send(&self, subject: &str, body: &str, severity: Severity) -> Result<()> {
        match self {
            Self::Smtp(inner) => inner.send(subject, body, severity),
            Self::Webhook(inner) => inner.send(subject, body, severity),
        }
    }

    fn send_to(
        &self,
        subject: &str,
        body: &str,
        severity: Severity,
        extra_recipients: &[Mailbox],
    ) -> Result<()> {
        match self {
            Self::Smtp(inner) => inner.send_to(subject, body, severity, extra_recipients),
            Self::Webhook(inner) => inner.send_to(subject, body, severity, extra_recipients),
        }
    }
}

pub trait Notification {
    fn send(&self, subject: &str, body: &str, severity: Severity) -> Result<()>;

    /// Like [`Notification::send`], also addressing `extra_recipients` on
    /// channels that deliver to mailboxes. Other channels ignore them.
    fn send_to(
        &self,
        subject: &str,
        body: &str,
        severity: Severity,
        _extra_recipients: &[Mailbox],
    ) -> Result<()> {
        self.send(subject, body, severity)
    }
}
