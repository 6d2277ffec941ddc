//! Multi-tenant mail account gateway
//!
//! Stores SMTP/IMAP account settings per tenant with the password
//! sealed under AES-256-GCM, and runs authorization-gated mail
//! operations against them: saving settings, verifying credentials,
//! sending a [`Message`] and fetching raw messages read-only.
//!
//! [`MailService`] is the entry point. Its collaborators (storage,
//! authorizer, key provider, SMTP transport, IMAP protocol) are traits,
//! so each can be swapped for a test double or a platform service.

mod account;
mod authz;
mod config;
mod connection;
mod context;
mod crypto;
mod error;
mod fetch;
mod flag;
mod mailbox;
mod message;
mod service;
mod smtp;
mod store;
mod transport;
mod vault;

pub use account::{
    Account, AccountSettings, AuthSettings, ImapSettings, SealedAuth, SmtpSettings,
};
pub use authz::{Action, Authorizer, Resource, StaticPolicy, Unrestricted};
pub use config::{ProviderConfig, ServiceConfig};
pub use connection::ImapProvider;
pub use context::RequestContext;
pub use crypto::{Cipher, EncryptedField, KeyId, KeyProvider, SecretKey, StaticKeyRing};
pub use error::{Error, ErrorInfo, ErrorKind, Result};
pub use fetch::{FetchEngine, FetchMachine, FetchState, Settle};
pub use flag::Flag;
pub use mailbox::{
    FetchMessage, FetchQuery, FetchRequest, ImapTarget, MailboxInfo, MailboxProtocol,
    MailboxSession, MessageAttributes, SessionEvent,
};
pub use message::{Attachment, ContentEncoding, DeliveryReceipt, Envelope, Message};
pub use service::{
    AccountRef, AccountSelector, MailService, RekeyOutcome, VerifyOptions, VerifyReport,
};
pub use smtp::LettreTransport;
pub use store::{FileStore, MemoryStore, Storage};
pub use transport::{MailTransport, SmtpTarget, TransportOrchestrator, Verification};
pub use vault::AccountVault;
