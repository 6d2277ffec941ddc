//! IMAP mailbox protocol seam
//!
//! The fetch engine talks to an IMAP server only through
//! [`MailboxProtocol`] and [`MailboxSession`]. A session reports a fetch
//! as a stream of [`SessionEvent`]s, one small event per protocol
//! happening, which the engine folds into finished [`FetchMessage`]s.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, FixedOffset};
use futures::stream::BoxStream;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::account::AccountSettings;
use crate::error::{Error, Result};
use crate::flag::Flag;

/// Implicit TLS port.
pub const IMAPS_PORT: u16 = 993;
/// Plain port, upgraded with STARTTLS.
pub const IMAP_PORT: u16 = 143;

/// Everything needed to open one IMAP session.
#[derive(Debug, Clone)]
pub struct ImapTarget {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when `true`, STARTTLS otherwise.
    pub tls: bool,
    pub user: String,
    pub pass: SecretString,
}

impl ImapTarget {
    /// Build a target from a decrypted account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] naming the missing fields.
    pub fn from_settings(account: &AccountSettings) -> Result<Self> {
        let host = account.imap.host.as_deref().filter(|h| !h.is_empty());
        let user = account.auth.user.as_deref().filter(|u| !u.is_empty());
        let (Some(host), Some(user), Some(pass)) = (host, user, account.auth.pass.as_ref()) else {
            let missing: Vec<&str> = [
                (host.is_none(), "imap.host"),
                (user.is_none(), "auth.user"),
                (account.auth.pass.is_none(), "auth.pass"),
            ]
            .into_iter()
            .filter_map(|(absent, name)| absent.then_some(name))
            .collect();
            return Err(Error::ConfigInvalid(format!("missing {}", missing.join(", "))));
        };

        let tls = account.imap.tls.unwrap_or(true);
        Ok(Self {
            host: host.to_string(),
            port: account
                .imap
                .port
                .unwrap_or(if tls { IMAPS_PORT } else { IMAP_PORT }),
            tls,
            user: user.to_string(),
            pass: pass.clone(),
        })
    }
}

/// Which messages to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchRequest {
    /// Mailbox to open read-only; `INBOX` when absent.
    pub mailbox: Option<String>,
    /// One message by sequence number.
    pub seq: Option<u32>,
    /// UID set such as `42` or `40:45`.
    pub uid: Option<String>,
}

impl FetchRequest {
    #[must_use]
    pub fn mailbox(&self) -> &str {
        self.mailbox.as_deref().unwrap_or("INBOX")
    }

    /// Resolve the request into a protocol query. With neither `seq` nor
    /// `uid` every message (`1:*`) is fetched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if both selectors are given,
    /// `seq` is zero, or `uid` is not a valid UID set.
    pub fn query(&self) -> Result<FetchQuery> {
        match (self.seq, self.uid.as_deref()) {
            (Some(_), Some(_)) => Err(Error::ConfigInvalid(
                "specify either seq or uid, not both".into(),
            )),
            (Some(0), None) => Err(Error::ConfigInvalid(
                "sequence numbers start at 1".into(),
            )),
            (Some(seq), None) => Ok(FetchQuery::Sequence(seq.to_string())),
            (None, Some(uid)) => {
                let uid = uid.trim();
                if is_sequence_set(uid) {
                    Ok(FetchQuery::Uid(uid.to_string()))
                } else {
                    Err(Error::ConfigInvalid(format!("invalid uid set '{uid}'")))
                }
            }
            (None, None) => Ok(FetchQuery::Sequence("1:*".to_string())),
        }
    }
}

/// `n`, `n:m`, `n:*` and comma-joined lists thereof.
fn is_sequence_set(s: &str) -> bool {
    let number = |n: &str| n == "*" || n.parse::<u32>().is_ok_and(|v| v > 0);
    !s.is_empty()
        && s.split(',').all(|range| match range.split_once(':') {
            Some((a, b)) => number(a) && number(b),
            None => number(range),
        })
}

/// A validated fetch selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchQuery {
    Sequence(String),
    Uid(String),
}

impl FetchQuery {
    #[must_use]
    pub fn set(&self) -> &str {
        match self {
            Self::Sequence(set) | Self::Uid(set) => set,
        }
    }
}

/// Per-message attributes reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttributes {
    pub uid: Option<u32>,
    pub flags: Vec<Flag>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub size: Option<u32>,
}

/// One fetched message. The body is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMessage {
    pub seq: u32,
    pub attributes: MessageAttributes,
    #[serde(
        serialize_with = "body_to_base64",
        deserialize_with = "body_from_base64",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub body: Option<Vec<u8>>,
}

impl FetchMessage {
    #[must_use]
    pub const fn body_available(&self) -> bool {
        self.body.is_some()
    }
}

#[allow(clippy::ref_option)]
fn body_to_base64<S: Serializer>(body: &Option<Vec<u8>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match body {
        Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

fn body_from_base64<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Vec<u8>>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Mailbox state reported when a mailbox is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxInfo {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub read_only: bool,
}

/// One protocol happening during a fetch.
///
/// Message sub-events carry the sequence number they belong to and may
/// interleave across messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessageStart { seq: u32 },
    Attributes { seq: u32, attributes: MessageAttributes },
    Body { seq: u32, chunk: Vec<u8> },
    MessageEnd { seq: u32 },
    /// The server completed the FETCH command.
    FetchEnd,
    /// The server failed the FETCH command.
    FetchError(String),
    ConnectionError(String),
    ConnectionClosed,
}

/// IMAP wire-protocol collaborator.
#[async_trait]
pub trait MailboxProtocol: Send + Sync {
    /// Connect and log in.
    ///
    /// Fails with [`Error::AuthenticationFailed`] when the server
    /// rejects the credentials and [`Error::ConnectionError`] otherwise.
    async fn connect(&self, target: &ImapTarget) -> Result<Box<dyn MailboxSession>>;
}

/// An authenticated IMAP session.
#[async_trait]
pub trait MailboxSession: Send {
    /// Open `mailbox` read-only.
    async fn open_mailbox(&mut self, mailbox: &str) -> Result<MailboxInfo>;

    /// Start fetching; events arrive on the returned stream until
    /// [`SessionEvent::FetchEnd`] or an error event.
    async fn fetch<'a>(&'a mut self, query: &'a FetchQuery) -> Result<BoxStream<'a, SessionEvent>>;

    /// Log out and drop the connection.
    async fn close(&mut self) -> Result<()>;
}
