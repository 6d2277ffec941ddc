//! Error types for mailgate

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::DeliveryReceipt;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not authorized to {action} account {account}")]
    NotAuthorized { account: String, action: String },

    #[error("Authorization provider error: {0}")]
    Authorization(String),

    #[error("Account {0} does not exist")]
    AccountNotFound(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid account configuration: {0}")]
    ConfigInvalid(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connectivity failed: {0}")]
    ConnectivityFailed(String),

    #[error("Delivery rejected: {reason}")]
    DeliveryRejected {
        reason: String,
        receipt: Box<DeliveryReceipt>,
    },

    #[error("IMAP connection error: {0}")]
    ConnectionError(String),

    #[error("Mailbox error: {0}")]
    MailboxError(String),

    #[error("Fetch error: {0}")]
    FetchError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable name of the error variant.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::AccountNotFound(_) => ErrorKind::AccountNotFound,
            Self::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            Self::EncryptionFailed(_) => ErrorKind::EncryptionFailed,
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            Self::ConnectivityFailed(_) => ErrorKind::ConnectivityFailed,
            Self::DeliveryRejected { .. } => ErrorKind::DeliveryRejected,
            Self::ConnectionError(_) => ErrorKind::ConnectionError,
            Self::MailboxError(_) => ErrorKind::MailboxError,
            Self::FetchError(_) => ErrorKind::FetchError,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Serializable summary of this error, used where failures are
    /// reported as data rather than raised.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Discriminant of [`Error`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotAuthorized,
    Authorization,
    AccountNotFound,
    DecryptionFailed,
    EncryptionFailed,
    ConfigInvalid,
    AuthenticationFailed,
    ConnectivityFailed,
    DeliveryRejected,
    ConnectionError,
    MailboxError,
    FetchError,
    Storage,
    Serialization,
    Config,
    Io,
}

/// Error detail carried inside structured results such as
/// [`Verification`](crate::Verification).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;
