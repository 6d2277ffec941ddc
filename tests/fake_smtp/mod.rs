//! Fake SMTP server for integration testing
//!
//! An in-process submission server that answers each command from a
//! [`Script`]:
//!
//! TCP -> (TLS) -> 220 greeting -> EHLO -> (STARTTLS -> TLS -> EHLO) -> AUTH PLAIN
//!     -> MAIL FROM -> RCPT TO ... -> DATA | RSET -> QUIT
//!
//! Recipients listed with [`Script::refuse`] get a `550` at RCPT time.
//! Every completed DATA is recorded as a [`Received`] message.

mod server;

pub use server::{FakeSmtpServer, Received};

/// How the fake server answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub greeting: String,
    pub credentials: (String, String),
    pub refused: Vec<String>,
}

impl Script {
    /// Accept this user and password and every recipient.
    pub fn new(user: &str, pass: &str) -> Self {
        Self {
            greeting: "220 fake.test ESMTP ready".to_string(),
            credentials: (user.to_string(), pass.to_string()),
            refused: Vec::new(),
        }
    }

    /// Answer `RCPT TO:<address>` with `550`.
    pub fn refuse(mut self, address: &str) -> Self {
        self.refused.push(address.to_string());
        self
    }

    /// Replace the greeting; anything but a `220` closes the connection.
    pub fn greeting(mut self, line: &str) -> Self {
        self.greeting = line.to_string();
        self
    }
}
