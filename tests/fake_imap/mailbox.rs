//! Test data model for the fake IMAP server
//!
//! ```ignore
//! let mailbox = MailboxBuilder::new()
//!     .credentials("me@example.com", "s3cret")
//!     .folder("INBOX")
//!         .message(41, &["\\Seen"], raw_rfc2822_bytes)
//!         .message(42, &[], raw_rfc2822_bytes)
//!     .folder("Archive")
//!     .build();
//! ```

/// Internal date reported for every message.
pub const INTERNAL_DATE: &str = "01-Jan-2024 10:00:00 +0000";

/// Server state shared with every connection.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub folders: Vec<Folder>,
    /// Accepted `(user, pass)`; any login succeeds when `None`.
    pub credentials: Option<(String, String)>,
}

impl Mailbox {
    /// Look up a folder by name (case-sensitive, matching real IMAP).
    pub fn get_folder(&self, name: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.name == name)
    }

    pub fn accepts(&self, user: &str, pass: &str) -> bool {
        self.credentials
            .as_ref()
            .is_none_or(|(u, p)| u == user && p == pass)
    }
}

#[derive(Debug, Clone)]
pub struct Folder {
    pub name: String,
    pub messages: Vec<TestMessage>,
}

/// A stored message. Its sequence number is its 1-based position.
#[derive(Debug, Clone)]
pub struct TestMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub raw: Vec<u8>,
}

pub struct MailboxBuilder {
    folders: Vec<Folder>,
    credentials: Option<(String, String)>,
}

impl MailboxBuilder {
    pub fn new() -> Self {
        Self {
            folders: Vec::new(),
            credentials: None,
        }
    }

    /// Only accept this user and password.
    pub fn credentials(mut self, user: &str, pass: &str) -> Self {
        self.credentials = Some((user.to_string(), pass.to_string()));
        self
    }

    /// Add a new folder. Subsequent `.message()` calls add to it.
    pub fn folder(mut self, name: &str) -> Self {
        self.folders.push(Folder {
            name: name.to_string(),
            messages: Vec::new(),
        });
        self
    }

    /// Add a message to the most recently added folder.
    ///
    /// # Panics
    ///
    /// Panics if called before any `.folder()` call.
    pub fn message(mut self, uid: u32, flags: &[&str], raw: &[u8]) -> Self {
        self.folders
            .last_mut()
            .expect("call .folder() before .message()")
            .messages
            .push(TestMessage {
                uid,
                flags: flags.iter().map(ToString::to_string).collect(),
                raw: raw.to_vec(),
            });
        self
    }

    pub fn build(self) -> Mailbox {
        Mailbox {
            folders: self.folders,
            credentials: self.credentials,
        }
    }
}
