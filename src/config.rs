//! Service configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::StaticKeyRing;
use crate::error::{Error, Result};

/// Settings shared by the SMTP and IMAP providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Upper bound for each network step.
    pub timeout: Duration,
    /// Skip certificate verification (self-signed test servers).
    pub accept_invalid_certs: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

/// Configuration for a [`MailService`](crate::MailService) backed by
/// the default collaborators.
#[derive(Debug)]
pub struct ServiceConfig {
    pub keys: StaticKeyRing,
    pub store_dir: PathBuf,
    pub provider: ProviderConfig,
}

impl ServiceConfig {
    /// Load configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `MAILGATE_KEYS` (`id:base64key[,id:base64key]`, current first)
    ///
    /// Optional (with defaults):
    /// - `MAILGATE_STORE_DIR` (default: `./mailgate-data`)
    /// - `MAILGATE_TIMEOUT_SECS` (default: `30`)
    /// - `MAILGATE_ACCEPT_INVALID_CERTS` (default: `false`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for missing or malformed values.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Same as [`Self::from_env`] with an explicit variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for missing or malformed values.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let keys = var("MAILGATE_KEYS").ok_or_else(|| Error::Config("MAILGATE_KEYS not set".into()))?;

        let timeout = var("MAILGATE_TIMEOUT_SECS")
            .unwrap_or_else(|| "30".to_string())
            .parse::<u64>()
            .map_err(|e| Error::Config(format!("Invalid MAILGATE_TIMEOUT_SECS: {e}")))?;
        if timeout == 0 {
            return Err(Error::Config("MAILGATE_TIMEOUT_SECS must be positive".into()));
        }

        Ok(Self {
            keys: StaticKeyRing::parse(&keys)?,
            store_dir: var("MAILGATE_STORE_DIR")
                .map_or_else(|| PathBuf::from("./mailgate-data"), PathBuf::from),
            provider: ProviderConfig {
                timeout: Duration::from_secs(timeout),
                accept_invalid_certs: parse_bool(
                    "MAILGATE_ACCEPT_INVALID_CERTS",
                    var("MAILGATE_ACCEPT_INVALID_CERTS"),
                )?,
            },
        })
    }
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes") => {
            Ok(true)
        }
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" || v.eq_ignore_ascii_case("no") => {
            Ok(false)
        }
        Some(v) => Err(Error::Config(format!("Invalid {name}: {v}"))),
    }
}
