//! Request handlers
//!
//! Every account-scoped handler runs the same sequence: authorization
//! gate, then vault, then the SMTP orchestrator or the fetch engine. A
//! denied request stops at the gate without touching storage or the
//! network.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::account::{Account, AccountSettings};
use crate::authz::{Action, Authorizer, Gate};
use crate::config::ServiceConfig;
use crate::connection::ImapProvider;
use crate::context::RequestContext;
use crate::crypto::{Cipher, KeyProvider};
use crate::error::{Error, Result};
use crate::fetch::FetchEngine;
use crate::mailbox::{FetchMessage, FetchRequest, MailboxProtocol};
use crate::message::{DeliveryReceipt, Message};
use crate::smtp::LettreTransport;
use crate::store::{FileStore, Storage};
use crate::transport::{MailTransport, TransportOrchestrator, Verification};
use crate::vault::AccountVault;

/// Name of the account a handler acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub account: String,
}

/// Outcome of [`MailService::rekey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyOutcome {
    pub account: String,
    /// Whether the stored record was re-encrypted.
    pub changed: bool,
}

/// The account a verify request is about.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AccountSelector {
    /// A stored account; subject to authorization.
    Named(String),
    /// An unsaved account whose secrets are already sealed.
    Sealed(Account),
    /// An unsaved account in plaintext.
    Inline(AccountSettings),
}

/// Which transports to verify. `None` means "if configured".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VerifyOptions {
    pub smtp: Option<bool>,
    pub imap: Option<bool>,
}

/// Per-transport verification results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<Verification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imap: Option<Verification>,
}

impl VerifyReport {
    /// Every verification that ran succeeded.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.smtp.iter().chain(&self.imap).all(|v| v.ok)
    }
}

/// Entry points for account settings and mail operations.
pub struct MailService {
    gate: Gate,
    vault: AccountVault,
    transport: TransportOrchestrator,
    mailbox: FetchEngine,
}

impl MailService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Storage>,
        authorizer: Arc<dyn Authorizer>,
        keys: Arc<dyn KeyProvider>,
        transport: Arc<dyn MailTransport>,
        protocol: Arc<dyn MailboxProtocol>,
    ) -> Self {
        Self {
            gate: Gate::new(authorizer),
            vault: AccountVault::new(store, Cipher::new(keys)),
            transport: TransportOrchestrator::new(transport),
            mailbox: FetchEngine::new(protocol),
        }
    }

    /// Wire the default collaborators: file store, static key ring,
    /// lettre SMTP and the async-imap provider.
    #[must_use]
    pub fn from_config(config: ServiceConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self::new(
            Arc::new(FileStore::new(config.store_dir)),
            authorizer,
            Arc::new(config.keys),
            Arc::new(LettreTransport::new(&config.provider)),
            Arc::new(ImapProvider::new(&config.provider)),
        )
    }

    async fn authorize(&self, ctx: &RequestContext, account: &str, action: Action) -> Result<()> {
        if account.trim().is_empty() {
            return Err(Error::ConfigInvalid("account name must not be empty".into()));
        }
        self.gate.check(ctx, account, action).await
    }

    async fn open(&self, ctx: &RequestContext, account: &str) -> Result<AccountSettings> {
        let sealed = self.vault.load(ctx, account).await?;
        self.vault.decrypt(&sealed).await
    }

    /// Save the SMTP and auth parts of `settings` into `account`.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthorized`] on denial; storage and encryption
    /// failures leave the prior record untouched.
    pub async fn save_smtp_settings(
        &self,
        ctx: &RequestContext,
        account: &str,
        settings: AccountSettings,
    ) -> Result<AccountRef> {
        self.authorize(ctx, account, Action::Smtp).await?;
        self.vault.update(ctx, account, &settings.smtp_only()).await?;
        info!(tenant = %ctx.tenant, account, "Saved SMTP settings");
        Ok(AccountRef {
            account: account.to_string(),
        })
    }

    /// Save the IMAP and auth parts of `settings` into `account`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::save_smtp_settings`].
    pub async fn save_imap_settings(
        &self,
        ctx: &RequestContext,
        account: &str,
        settings: AccountSettings,
    ) -> Result<AccountRef> {
        self.authorize(ctx, account, Action::Imap).await?;
        self.vault.update(ctx, account, &settings.imap_only()).await?;
        info!(tenant = %ctx.tenant, account, "Saved IMAP settings");
        Ok(AccountRef {
            account: account.to_string(),
        })
    }

    /// Check that the account's servers accept its credentials.
    ///
    /// Only a named account goes through authorization; inline accounts
    /// carry their own credentials.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthorized`], [`Error::AccountNotFound`],
    /// [`Error::DecryptionFailed`], or [`Error::ConfigInvalid`] when a
    /// transport is requested explicitly but not configured.
    pub async fn verify(
        &self,
        ctx: &RequestContext,
        selector: AccountSelector,
        options: VerifyOptions,
    ) -> Result<VerifyReport> {
        let settings = match selector {
            AccountSelector::Named(name) => {
                self.authorize(ctx, &name, Action::Verify).await?;
                self.open(ctx, &name).await?
            }
            AccountSelector::Sealed(account) => self.vault.decrypt(&account).await?,
            AccountSelector::Inline(settings) => settings,
        };

        let smtp = if options.smtp.unwrap_or(!settings.smtp.is_empty()) {
            Some(self.transport.verify(&settings).await?)
        } else {
            None
        };
        let imap = if options.imap.unwrap_or(!settings.imap.is_empty()) {
            Some(self.mailbox.verify(&settings).await?)
        } else {
            None
        };
        Ok(VerifyReport { smtp, imap })
    }

    /// Send `message` through the account's SMTP server.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthorized`], [`Error::AccountNotFound`], and the
    /// send failures of [`TransportOrchestrator::send`].
    pub async fn send(
        &self,
        ctx: &RequestContext,
        account: &str,
        message: Message,
    ) -> Result<DeliveryReceipt> {
        self.authorize(ctx, account, Action::Send).await?;
        let settings = self.open(ctx, account).await?;
        self.transport.send(&settings, message).await
    }

    /// Fetch messages from the account's IMAP server.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthorized`], [`Error::AccountNotFound`], and the
    /// fetch failures of [`FetchEngine::fetch`].
    pub async fn fetch(
        &self,
        ctx: &RequestContext,
        account: &str,
        request: &FetchRequest,
    ) -> Result<Vec<FetchMessage>> {
        self.authorize(ctx, account, Action::Fetch).await?;
        request.query()?;
        let settings = self.open(ctx, account).await?;
        self.mailbox.fetch(&settings, request).await
    }

    /// Delete the account record.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthorized`] or [`Error::AccountNotFound`].
    pub async fn remove(&self, ctx: &RequestContext, account: &str) -> Result<AccountRef> {
        self.authorize(ctx, account, Action::Remove).await?;
        self.vault.remove(ctx, account).await?;
        Ok(AccountRef {
            account: account.to_string(),
        })
    }

    /// Re-encrypt the account's secrets under the current key.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthorized`], [`Error::AccountNotFound`], or
    /// [`Error::DecryptionFailed`] if the old key is gone.
    pub async fn rekey(&self, ctx: &RequestContext, account: &str) -> Result<RekeyOutcome> {
        self.authorize(ctx, account, Action::Rekey).await?;
        let changed = self.vault.rekey(ctx, account).await?;
        Ok(RekeyOutcome {
            account: account.to_string(),
            changed,
        })
    }
}
