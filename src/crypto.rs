//! Credential encryption
//!
//! Secrets are sealed with AES-256-GCM under a data key named by a
//! [`KeyId`]. The key id travels with the ciphertext in an
//! [`EncryptedField`] so that decryption always picks the key that was
//! used, which is what allows a key ring to rotate without re-encrypting
//! every stored record at once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Length in bytes of a data key.
pub const KEY_LEN: usize = 32;

/// Opaque identifier of a data key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for KeyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Raw key material. Zeroed on drop, redacted in debug output.
pub type SecretKey = SecretBox<[u8; KEY_LEN]>;

/// Ciphertext plus the id of the key that produced it.
///
/// `data` is base64 of `nonce || ciphertext || tag`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    pub key_id: KeyId,
    pub data: String,
}

impl EncryptedField {
    #[must_use]
    pub fn new(key_id: KeyId, data: impl Into<String>) -> Self {
        Self {
            key_id,
            data: data.into(),
        }
    }
}

impl fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedField")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Key-management collaborator.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Id of the key new secrets are sealed under.
    async fn current_key_id(&self) -> Result<KeyId>;

    /// Key material for `id`, or `None` if the id is not (or no longer)
    /// known to the provider.
    async fn resolve_key(&self, id: &KeyId) -> Result<Option<SecretKey>>;
}

/// In-process key ring holding a current key and at most one previous
/// key.
#[derive(Debug)]
pub struct StaticKeyRing {
    current: (KeyId, SecretKey),
    previous: Option<(KeyId, SecretKey)>,
}

impl StaticKeyRing {
    #[must_use]
    pub fn new(id: impl Into<KeyId>, key: [u8; KEY_LEN]) -> Self {
        Self {
            current: (id.into(), SecretBox::new(Box::new(key))),
            previous: None,
        }
    }

    /// Keep `id` around for decrypting ciphertext sealed before the
    /// last rotation.
    #[must_use]
    pub fn with_previous(mut self, id: impl Into<KeyId>, key: [u8; KEY_LEN]) -> Self {
        self.previous = Some((id.into(), SecretBox::new(Box::new(key))));
        self
    }

    /// Make `key` current. The old current key becomes the previous
    /// key; the old previous key is forgotten.
    #[must_use]
    pub fn rotate(self, id: impl Into<KeyId>, key: [u8; KEY_LEN]) -> Self {
        Self {
            current: (id.into(), SecretBox::new(Box::new(key))),
            previous: Some(self.current),
        }
    }

    /// Parse `id:base64key[,id:base64key]`. The first entry is the
    /// current key, the optional second entry the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed entries, keys that are
    /// not exactly [`KEY_LEN`] bytes, or more than two entries.
    pub fn parse(keys: &str) -> Result<Self> {
        let mut entries = keys
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_entry);

        let (id, key) = entries
            .next()
            .ok_or_else(|| Error::Config("no encryption key configured".into()))??;
        let mut ring = Self::new(id, key);

        if let Some(previous) = entries.next() {
            let (id, key) = previous?;
            ring = ring.with_previous(id, key);
        }
        if entries.next().is_some() {
            return Err(Error::Config(
                "at most two keys (current, previous) may be configured".into(),
            ));
        }
        Ok(ring)
    }

    /// Fresh random key, base64 encoded, suitable for [`Self::parse`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionFailed`] if the system RNG fails.
    pub fn generate_key() -> Result<String> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| Error::EncryptionFailed("random number generator failed".into()))?;
        Ok(STANDARD.encode(key))
    }

    #[must_use]
    pub const fn current_id(&self) -> &KeyId {
        &self.current.0
    }
}

fn parse_entry(entry: &str) -> Result<(KeyId, [u8; KEY_LEN])> {
    let (id, encoded) = entry
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("key entry '{entry}' is not id:base64")))?;
    if id.is_empty() {
        return Err(Error::Config("empty key id".into()));
    }
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Config(format!("key {id} is not valid base64: {e}")))?;
    let key: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| Error::Config(format!("key {id} must be {KEY_LEN} bytes")))?;
    Ok((KeyId::from(id), key))
}

#[async_trait]
impl KeyProvider for StaticKeyRing {
    async fn current_key_id(&self) -> Result<KeyId> {
        Ok(self.current.0.clone())
    }

    async fn resolve_key(&self, id: &KeyId) -> Result<Option<SecretKey>> {
        let found = std::iter::once(&self.current)
            .chain(self.previous.as_ref())
            .find(|(key_id, _)| key_id == id)
            .map(|(_, key)| SecretBox::new(Box::new(*key.expose_secret())));
        Ok(found)
    }
}

/// Encryption adapter: seals and opens secret fields using keys from a
/// [`KeyProvider`].
#[derive(Clone)]
pub struct Cipher {
    keys: Arc<dyn KeyProvider>,
    rng: SystemRandom,
}

impl Cipher {
    #[must_use]
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            keys,
            rng: SystemRandom::new(),
        }
    }

    /// Id of the key [`Self::seal`] currently uses.
    ///
    /// # Errors
    ///
    /// Propagates key provider failures.
    pub async fn current_key_id(&self) -> Result<KeyId> {
        self.keys.current_key_id().await
    }

    /// Encrypt `secret` under the current key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionFailed`] if the current key cannot be
    /// resolved or sealing fails.
    pub async fn seal(&self, secret: &SecretString) -> Result<EncryptedField> {
        let key_id = self.keys.current_key_id().await?;
        let key = self
            .keys
            .resolve_key(&key_id)
            .await?
            .ok_or_else(|| Error::EncryptionFailed(format!("current key {key_id} is unknown")))?;
        let key = aead_key(&key).map_err(Error::EncryptionFailed)?;

        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| Error::EncryptionFailed("random number generator failed".into()))?;

        let mut in_out = secret.expose_secret().as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(key_id.as_str().as_bytes()),
            &mut in_out,
        )
        .map_err(|_| Error::EncryptionFailed("seal failed".into()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + in_out.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&in_out);

        debug!(key_id = %key_id, "Sealed secret field");
        Ok(EncryptedField::new(key_id, STANDARD.encode(payload)))
    }

    /// Decrypt `field` with the key named in it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionFailed`] if the key id is unknown or
    /// the payload is malformed or fails authentication.
    pub async fn open(&self, field: &EncryptedField) -> Result<SecretString> {
        let key = self
            .keys
            .resolve_key(&field.key_id)
            .await?
            .ok_or_else(|| Error::DecryptionFailed(format!("unknown key id {}", field.key_id)))?;
        let key = aead_key(&key).map_err(Error::DecryptionFailed)?;

        let payload = STANDARD
            .decode(&field.data)
            .map_err(|e| Error::DecryptionFailed(format!("malformed ciphertext: {e}")))?;
        if payload.len() < NONCE_LEN {
            return Err(Error::DecryptionFailed("ciphertext too short".into()));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| Error::DecryptionFailed("malformed nonce".into()))?;

        let mut in_out = sealed.to_vec();
        let plain = key
            .open_in_place(nonce, Aad::from(field.key_id.as_str().as_bytes()), &mut in_out)
            .map_err(|_| Error::DecryptionFailed("ciphertext failed authentication".into()))?;
        let plain = String::from_utf8(plain.to_vec())
            .map_err(|_| Error::DecryptionFailed("secret is not valid UTF-8".into()))?;
        Ok(SecretString::from(plain))
    }
}

fn aead_key(key: &SecretKey) -> std::result::Result<LessSafeKey, String> {
    UnboundKey::new(&AES_256_GCM, key.expose_secret())
        .map(LessSafeKey::new)
        .map_err(|_| "invalid key material".to_string())
}
