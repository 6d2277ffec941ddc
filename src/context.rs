//! Per-request caller identity

use secrecy::SecretString;

/// Identity of the caller on whose behalf a handler runs.
///
/// Passed explicitly to every handler and collaborator. The tenant
/// scopes storage keys; the user is what the authorization provider
/// evaluates.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant: String,
    pub user: String,
    /// Opaque token forwarded to the authorization provider.
    pub access_token: Option<SecretString>,
}

impl RequestContext {
    #[must_use]
    pub fn new(tenant: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            user: user.into(),
            access_token: None,
        }
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(SecretString::from(token.into()));
        self
    }
}
