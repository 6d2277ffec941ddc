//! Outbound messages and delivery receipts
//!
//! A [`Message`] is fully self-contained: attachment content is carried
//! inline, never as a filesystem path or URL. Unknown fields such as
//! `path` are rejected when a message is deserialized, so a caller
//! cannot make the sender read server-local files.

use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use lettre::message::Mailbox;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// An email to submit over SMTP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Message {
    /// Sender; the account's auth user when absent.
    pub from: Option<String>,
    #[serde(deserialize_with = "address_list")]
    pub to: Vec<String>,
    #[serde(deserialize_with = "address_list")]
    pub cc: Vec<String>,
    #[serde(deserialize_with = "address_list")]
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Bare sender and recipient addresses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if there is no sender or no
    /// recipient, or if any address does not parse.
    pub fn envelope(&self) -> Result<Envelope> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| Error::ConfigInvalid("message has no sender".into()))?;
        let to = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|a| bare_address(a))
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            return Err(Error::ConfigInvalid("message has no recipients".into()));
        }
        Ok(Envelope {
            from: bare_address(from)?,
            to,
        })
    }
}

fn bare_address(address: &str) -> Result<String> {
    Mailbox::from_str(address.trim())
        .map(|mailbox| mailbox.email.to_string())
        .map_err(|e| Error::ConfigInvalid(format!("invalid address '{address}': {e}")))
}

/// Accepts either a list of addresses or one comma-separated string.
fn address_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => split_addresses(&s),
        OneOrMany::Many(list) => list,
    })
}

/// Split `a@x, "Doe, John" <b@y>` on commas outside quotes and angle
/// brackets.
fn split_addresses(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let (mut quoted, mut angle) = (false, false);

    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                out.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    out.push(current);

    out.into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

/// How [`Attachment::content`] is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

/// An inline attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Attachment {
    pub filename: Option<String>,
    pub content: String,
    pub encoding: ContentEncoding,
    pub content_type: Option<String>,
    /// Content id for embedding via `cid:` references in HTML.
    pub cid: Option<String>,
}

impl Attachment {
    #[must_use]
    pub fn text(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            content: content.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn binary(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            filename: Some(filename.into()),
            content: STANDARD.encode(bytes),
            encoding: ContentEncoding::Base64,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cid(mut self, cid: impl Into<String>) -> Self {
        self.cid = Some(cid.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Decoded attachment bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if base64 content is malformed.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self.encoding {
            ContentEncoding::Utf8 => Ok(self.content.as_bytes().to_vec()),
            ContentEncoding::Base64 => STANDARD.decode(&self.content).map_err(|e| {
                Error::ConfigInvalid(format!(
                    "attachment {} is not valid base64: {e}",
                    self.filename.as_deref().unwrap_or("<unnamed>")
                ))
            }),
        }
    }
}

/// SMTP envelope: bare addresses only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
}

/// Outcome of submitting one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    /// Final server reply, e.g. `250 Accepted`.
    pub response: String,
    pub envelope: Envelope,
}
