//! Secrets read from the configuration file (SMTP passwords, webhook tokens).
//!
//! The value never shows up in `Debug` output or when the configuration is
//! serialized back out, and it is zeroed on drop.

use bon::Builder;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::result;
use validator::Validate;
use zeroize::Zeroize;

pub static REDACTED: &str = "###REDACTED###";

#[derive(Validate, Clone, Builder, PartialEq, Eq)]
pub struct RedactedString {
    #[validate(length(min = 1))]
    #[builder(into)]
    secret: String,
}

impl RedactedString {
    /// Plain value, for handing to the transport that needs it.
    pub fn expose(&self) -> &str {
        &self.secret
    }
}

impl Debug for RedactedString {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for RedactedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for RedactedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(RedactedStringVisitor)
    }
}

impl Drop for RedactedString {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

struct RedactedStringVisitor;

impl Visitor<'_> for RedactedStringVisitor {
    type Value = RedactedString;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a secret string")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(RedactedString::builder().secret(v).build())
    }
}
