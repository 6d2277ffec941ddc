//! SMTP transport orchestration
//!
//! Turns a decrypted account into an [`SmtpTarget`] and drives the
//! [`MailTransport`] provider for verify and send. Authentication and
//! connectivity failures during verify are reported as data in a
//! [`Verification`]; everything else stays a typed error.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::account::AccountSettings;
use crate::error::{Error, ErrorInfo, ErrorKind, Result};
use crate::message::{DeliveryReceipt, Message};

/// Port used when `secure` is set and no port is configured.
pub const SMTPS_PORT: u16 = 465;
/// Port used for STARTTLS submission when no port is configured.
pub const SUBMISSION_PORT: u16 = 587;

/// Everything needed to open one SMTP session.
#[derive(Debug, Clone)]
pub struct SmtpTarget {
    pub host: String,
    pub port: u16,
    /// Implicit TLS when `true`, required STARTTLS otherwise.
    pub secure: bool,
    pub user: String,
    pub pass: SecretString,
}

impl SmtpTarget {
    /// Build a target from a decrypted account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] naming the missing fields.
    pub fn from_settings(account: &AccountSettings) -> Result<Self> {
        let host = account.smtp.host.as_deref().filter(|h| !h.is_empty());
        let user = account.auth.user.as_deref().filter(|u| !u.is_empty());
        let (Some(host), Some(user), Some(pass)) = (host, user, account.auth.pass.as_ref()) else {
            let missing: Vec<&str> = [
                (host.is_none(), "smtp.host"),
                (user.is_none(), "auth.user"),
                (account.auth.pass.is_none(), "auth.pass"),
            ]
            .into_iter()
            .filter_map(|(absent, name)| absent.then_some(name))
            .collect();
            return Err(Error::ConfigInvalid(format!("missing {}", missing.join(", "))));
        };

        let secure = account.smtp.secure.unwrap_or(false);
        Ok(Self {
            host: host.to_string(),
            port: account
                .smtp
                .port
                .unwrap_or(if secure { SMTPS_PORT } else { SUBMISSION_PORT }),
            secure,
            user: user.to_string(),
            pass: pass.clone(),
        })
    }
}

/// SMTP wire-protocol collaborator.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Connect, authenticate and disconnect.
    ///
    /// Fails with [`Error::AuthenticationFailed`] or
    /// [`Error::ConnectivityFailed`] for the expected failure modes.
    async fn verify(&self, target: &SmtpTarget) -> Result<()>;

    /// Submit one message whose `from` is already resolved.
    async fn send(&self, target: &SmtpTarget, message: &Message) -> Result<DeliveryReceipt>;
}

/// Result of checking one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Verification {
    #[must_use]
    pub const fn passed() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    #[must_use]
    pub const fn failed(error: ErrorInfo) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }

    /// Fold a provider result into a verification. Errors whose kind is
    /// in `expected` become a failed verification; any other error is
    /// passed through.
    pub(crate) fn from_outcome(outcome: Result<()>, expected: &[ErrorKind]) -> Result<Self> {
        match outcome {
            Ok(()) => Ok(Self::passed()),
            Err(e) if expected.contains(&e.kind()) => Ok(Self::failed(e.info())),
            Err(e) => Err(e),
        }
    }
}

/// Drives a [`MailTransport`] on behalf of one decrypted account.
#[derive(Clone)]
pub struct TransportOrchestrator {
    transport: Arc<dyn MailTransport>,
}

impl TransportOrchestrator {
    #[must_use]
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { transport }
    }

    /// Check that the account's SMTP server accepts its credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if SMTP settings are incomplete.
    /// Authentication and connectivity failures are reported in the
    /// returned [`Verification`] instead.
    pub async fn verify(&self, account: &AccountSettings) -> Result<Verification> {
        let target = SmtpTarget::from_settings(account)?;
        debug!(host = %target.host, port = target.port, "Verifying SMTP account");

        let verification = Verification::from_outcome(
            self.transport.verify(&target).await,
            &[ErrorKind::AuthenticationFailed, ErrorKind::ConnectivityFailed],
        )?;
        info!(host = %target.host, ok = verification.ok, "Verify smtp");
        Ok(verification)
    }

    /// Submit `message` through the account's SMTP server.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigInvalid`] for incomplete settings or an invalid
    ///   message (no recipients, bad address, bad attachment encoding)
    /// - [`Error::AuthenticationFailed`] / [`Error::ConnectivityFailed`]
    /// - [`Error::DeliveryRejected`] if any recipient was rejected; the
    ///   receipt lists accepted and rejected recipients
    pub async fn send(&self, account: &AccountSettings, message: Message) -> Result<DeliveryReceipt> {
        let target = SmtpTarget::from_settings(account)?;

        let mut message = message;
        if message.from.is_none() {
            message.from = Some(target.user.clone());
        }
        let envelope = message.envelope()?;
        for attachment in &message.attachments {
            attachment.bytes()?;
        }

        debug!(
            host = %target.host,
            recipients = envelope.to.len(),
            attachments = message.attachments.len(),
            "Submitting message"
        );
        let receipt = self.transport.send(&target, &message).await?;

        if receipt.rejected.is_empty() {
            info!(
                message_id = receipt.message_id.as_deref().unwrap_or("-"),
                accepted = receipt.accepted.len(),
                "Message successfully sent"
            );
            Ok(receipt)
        } else {
            warn!(
                accepted = receipt.accepted.len(),
                rejected = receipt.rejected.len(),
                "Recipients rejected"
            );
            Err(Error::DeliveryRejected {
                reason: format!("{} recipient(s) rejected", receipt.rejected.len()),
                receipt: Box::new(receipt),
            })
        }
    }
}
