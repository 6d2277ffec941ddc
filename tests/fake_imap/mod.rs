//! Fake IMAP server for integration testing
//!
//! An in-process server that speaks the read-only subset of IMAP the
//! gateway needs, over STARTTLS or implicit TLS:
//!
//! TCP -> (TLS) -> greeting -> (STARTTLS -> TLS) -> LOGIN -> EXAMINE -> FETCH -> LOGOUT
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, TLS setup, and connection dispatch
//! - `handlers/` -- one file per IMAP command
//! - `mailbox` -- test data model (folders, messages, credentials)
//! - `io` -- tagged and untagged response writers

pub mod mailbox;
mod server;

pub use mailbox::MailboxBuilder;
pub use server::FakeImapServer;
