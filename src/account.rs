//! Account records
//!
//! An account exists in two shapes. [`Account`] is the sealed form that
//! is persisted: connection parameters in plaintext, the password as an
//! [`EncryptedField`]. [`AccountSettings`] is the plaintext form used
//! for settings updates and for the in-memory copy handed to a single
//! verify/send/fetch operation.
//!
//! Every field is optional so that a record can hold SMTP only, IMAP
//! only, or both, and so that a partial update can be merged into an
//! existing record field by field.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedField;

/// SMTP connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Implicit TLS when `true`, required STARTTLS otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

impl SmtpSettings {
    fn merge(&mut self, partial: Self) {
        if partial.host.is_some() {
            self.host = partial.host;
        }
        if partial.port.is_some() {
            self.port = partial.port;
        }
        if partial.secure.is_some() {
            self.secure = partial.secure;
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.secure.is_none()
    }
}

/// IMAP connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Implicit TLS when `true`, required STARTTLS otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<bool>,
}

impl ImapSettings {
    fn merge(&mut self, partial: Self) {
        if partial.host.is_some() {
            self.host = partial.host;
        }
        if partial.port.is_some() {
            self.port = partial.port;
        }
        if partial.tls.is_some() {
            self.tls = partial.tls;
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.tls.is_none()
    }
}

/// Credentials as persisted: user in plaintext, password sealed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealedAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<EncryptedField>,
}

impl SealedAuth {
    fn merge(&mut self, partial: Self) {
        if partial.user.is_some() {
            self.user = partial.user;
        }
        if partial.pass.is_some() {
            self.pass = partial.pass;
        }
    }
}

/// Sealed account record, the form owned by the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub smtp: SmtpSettings,
    pub imap: ImapSettings,
    pub auth: SealedAuth,
}

impl Account {
    /// Deep-merge `partial` into `self` one level down.
    ///
    /// Each field of `smtp`, `imap` and `auth` that is present in
    /// `partial` overwrites the existing value; absent fields are kept.
    #[must_use]
    pub fn merge(mut self, partial: Self) -> Self {
        self.smtp.merge(partial.smtp);
        self.imap.merge(partial.imap);
        self.auth.merge(partial.auth);
        self
    }
}

/// Plaintext credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub user: Option<String>,
    pub pass: Option<SecretString>,
}

/// Plaintext account settings.
///
/// Used as partial update input, as an inline account for `verify`, and
/// as the decrypted copy a single operation works on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    pub smtp: SmtpSettings,
    pub imap: ImapSettings,
    pub auth: AuthSettings,
}

impl AccountSettings {
    /// Keep only the SMTP and auth parts of an update.
    #[must_use]
    pub fn smtp_only(self) -> Self {
        Self {
            imap: ImapSettings::default(),
            ..self
        }
    }

    /// Keep only the IMAP and auth parts of an update.
    #[must_use]
    pub fn imap_only(self) -> Self {
        Self {
            smtp: SmtpSettings::default(),
            ..self
        }
    }
}
