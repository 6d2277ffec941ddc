//! Account vault
//!
//! Owns the canonical, sealed account record of each tenant. Handlers
//! go through the vault to read a record, decrypt a private copy of it,
//! or fold a partial settings update into it.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::account::{Account, AccountSettings, AuthSettings, SealedAuth};
use crate::context::RequestContext;
use crate::crypto::{Cipher, EncryptedField};
use crate::error::{Error, Result};
use crate::store::Storage;

pub struct AccountVault {
    store: Arc<dyn Storage>,
    cipher: Cipher,
}

impl AccountVault {
    #[must_use]
    pub fn new(store: Arc<dyn Storage>, cipher: Cipher) -> Self {
        Self { store, cipher }
    }

    /// Read the stored record for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] if no record exists for this
    /// tenant and name, or a storage/serialization error.
    pub async fn load(&self, ctx: &RequestContext, name: &str) -> Result<Account> {
        self.find(ctx, name)
            .await?
            .ok_or_else(|| Error::AccountNotFound(name.to_string()))
    }

    async fn find(&self, ctx: &RequestContext, name: &str) -> Result<Option<Account>> {
        let Some(bytes) = self.store.get(&ctx.tenant, name).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Decrypt a sealed record into a plaintext copy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionFailed`] if a secret was sealed under
    /// an unknown key or is malformed.
    pub async fn decrypt(&self, account: &Account) -> Result<AccountSettings> {
        let pass = match &account.auth.pass {
            Some(field) => Some(self.cipher.open(field).await?),
            None => None,
        };
        Ok(AccountSettings {
            smtp: account.smtp.clone(),
            imap: account.imap.clone(),
            auth: AuthSettings {
                user: account.auth.user.clone(),
                pass,
            },
        })
    }

    /// Deep-merge a partial record into an existing one.
    #[must_use]
    pub fn merge(existing: Account, partial: Account) -> Account {
        existing.merge(partial)
    }

    /// Seal the secret fields of `settings`.
    ///
    /// If `previous` already holds the same password sealed under the
    /// current key, that ciphertext is reused so that saving identical
    /// settings twice stores identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionFailed`] if sealing fails.
    pub async fn encrypt(
        &self,
        settings: &AccountSettings,
        previous: Option<&Account>,
    ) -> Result<Account> {
        let pass = match &settings.auth.pass {
            Some(secret) => {
                let reusable = match previous.and_then(|a| a.auth.pass.as_ref()) {
                    Some(field) => self.reusable(field, secret.expose_secret()).await?,
                    None => None,
                };
                match reusable {
                    Some(field) => Some(field),
                    None => Some(self.cipher.seal(secret).await?),
                }
            }
            None => None,
        };

        Ok(Account {
            smtp: settings.smtp.clone(),
            imap: settings.imap.clone(),
            auth: SealedAuth {
                user: settings.auth.user.clone(),
                pass,
            },
        })
    }

    async fn reusable(&self, field: &EncryptedField, plain: &str) -> Result<Option<EncryptedField>> {
        if field.key_id != self.cipher.current_key_id().await? {
            return Ok(None);
        }
        match self.cipher.open(field).await {
            Ok(existing) if existing.expose_secret() == plain => Ok(Some(field.clone())),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(error = %e, "Stored secret unreadable, sealing afresh");
                Ok(None)
            }
        }
    }

    /// Persist `account` under `name`, replacing any prior record.
    ///
    /// # Errors
    ///
    /// Propagates serialization and storage failures.
    pub async fn save(&self, ctx: &RequestContext, name: &str, account: &Account) -> Result<()> {
        let bytes = serde_json::to_vec(account)?;
        self.store.put(&ctx.tenant, name, bytes).await?;
        debug!(tenant = %ctx.tenant, account = name, "Saved account record");
        Ok(())
    }

    /// Load (or start empty), seal `update`, merge and save.
    ///
    /// The stored record is replaced only after every step succeeded.
    ///
    /// # Errors
    ///
    /// Propagates storage, serialization and encryption failures; the
    /// prior record is left untouched in every failure case.
    pub async fn update(
        &self,
        ctx: &RequestContext,
        name: &str,
        update: &AccountSettings,
    ) -> Result<Account> {
        let existing = self.find(ctx, name).await?;
        if existing.is_none() {
            debug!(tenant = %ctx.tenant, account = name, "Account not yet existing");
        }
        let partial = self.encrypt(update, existing.as_ref()).await?;
        let merged = Self::merge(existing.unwrap_or_default(), partial);
        self.save(ctx, name, &merged).await?;
        Ok(merged)
    }

    /// Delete the record for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] if there was nothing to delete.
    pub async fn remove(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        if self.store.delete(&ctx.tenant, name).await? {
            info!(tenant = %ctx.tenant, account = name, "Removed account");
            Ok(())
        } else {
            Err(Error::AccountNotFound(name.to_string()))
        }
    }

    /// Re-seal secrets that are not under the current key. Returns
    /// whether the stored record changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] or [`Error::DecryptionFailed`]
    /// if the old key is no longer resolvable.
    pub async fn rekey(&self, ctx: &RequestContext, name: &str) -> Result<bool> {
        let account = self.load(ctx, name).await?;
        let current = self.cipher.current_key_id().await?;

        let Some(field) = &account.auth.pass else {
            return Ok(false);
        };
        if field.key_id == current {
            return Ok(false);
        }

        let plain = self.cipher.open(field).await?;
        let resealed = self.cipher.seal(&plain).await?;
        info!(
            tenant = %ctx.tenant,
            account = name,
            from = %field.key_id,
            to = %resealed.key_id,
            "Re-encrypted account secret"
        );

        let mut account = account;
        account.auth.pass = Some(resealed);
        self.save(ctx, name, &account).await?;
        Ok(true)
    }
}
