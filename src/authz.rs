//! Authorization gate
//!
//! Every account-scoped handler asks the gate before it touches storage
//! or opens a transport session.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::{Error, Result};

/// Operation a caller wants to perform on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Save SMTP settings.
    Smtp,
    /// Save IMAP settings.
    Imap,
    Verify,
    Send,
    Fetch,
    Remove,
    /// Re-encrypt stored secrets under the current key.
    Rekey,
}

impl Action {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Smtp => "smtp",
            Self::Imap => "imap",
            Self::Verify => "verify",
            Self::Send => "send",
            Self::Fetch => "fetch",
            Self::Remove => "remove",
            Self::Rekey => "rekey",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource an authorization decision is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub account: String,
}

impl Resource {
    #[must_use]
    pub fn account(name: impl Into<String>) -> Self {
        Self {
            account: name.into(),
        }
    }
}

/// Authorization decision collaborator.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(
        &self,
        ctx: &RequestContext,
        resource: &Resource,
        action: Action,
    ) -> Result<bool>;
}

/// Wraps an [`Authorizer`] and turns a denial into
/// [`Error::NotAuthorized`].
#[derive(Clone)]
pub struct Gate {
    authorizer: Arc<dyn Authorizer>,
}

impl Gate {
    #[must_use]
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self { authorizer }
    }

    /// Fail unless the caller may perform `action` on `account`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAuthorized`] on denial and
    /// [`Error::Authorization`] if the provider itself fails.
    pub async fn check(&self, ctx: &RequestContext, account: &str, action: Action) -> Result<()> {
        let resource = Resource::account(account);
        let allowed = self
            .authorizer
            .is_authorized(ctx, &resource, action)
            .await
            .map_err(|e| match e {
                Error::Authorization(_) => e,
                other => Error::Authorization(other.to_string()),
            })?;

        if allowed {
            debug!(tenant = %ctx.tenant, user = %ctx.user, account, %action, "Access granted");
            Ok(())
        } else {
            warn!(tenant = %ctx.tenant, user = %ctx.user, account, %action, "Access denied");
            Err(Error::NotAuthorized {
                account: account.to_string(),
                action: action.to_string(),
            })
        }
    }
}

/// Allows everything. For single-user tools such as the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

#[async_trait]
impl Authorizer for Unrestricted {
    async fn is_authorized(&self, _: &RequestContext, _: &Resource, _: Action) -> Result<bool> {
        Ok(true)
    }
}

/// Explicit allow-list of `(tenant, user, account, action)` grants.
///
/// An account of `*` matches every account of that tenant.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    grants: HashSet<(String, String, String, Action)>,
}

impl StaticPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn allow(
        mut self,
        tenant: impl Into<String>,
        user: impl Into<String>,
        account: impl Into<String>,
        actions: &[Action],
    ) -> Self {
        let (tenant, user, account) = (tenant.into(), user.into(), account.into());
        for action in actions {
            self.grants
                .insert((tenant.clone(), user.clone(), account.clone(), *action));
        }
        self
    }

    fn grants(&self, ctx: &RequestContext, account: &str, action: Action) -> bool {
        self.grants.contains(&(
            ctx.tenant.clone(),
            ctx.user.clone(),
            account.to_string(),
            action,
        ))
    }
}

#[async_trait]
impl Authorizer for StaticPolicy {
    async fn is_authorized(
        &self,
        ctx: &RequestContext,
        resource: &Resource,
        action: Action,
    ) -> Result<bool> {
        Ok(self.grants(ctx, &resource.account, action) || self.grants(ctx, "*", action))
    }
}
