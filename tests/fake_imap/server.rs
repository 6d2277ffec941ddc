//! In-process fake IMAP server for integration testing
//!
//! ## Connection lifecycle
//!
//! ```text
//!   STARTTLS mode                      implicit TLS mode
//!   -------------                      -----------------
//!   TCP connect                        TCP connect
//!   greeting (plaintext)               TLS handshake
//!   STARTTLS -> OK                     greeting (encrypted)
//!   TLS handshake
//!              \                      /
//!               LOGIN -> EXAMINE -> FETCH / UID FETCH -> LOGOUT
//! ```
//!
//! ## Command format
//!
//! Every client command starts with a **tag** chosen by the client
//! (async-imap uses `A0001`, `A0002`, ...). The server echoes the tag in
//! its completion response; lines prefixed with `*` are untagged data
//! sent before it:
//!
//! ```text
//!   Client:  A0002 EXAMINE "INBOX"
//!   Server:  * 3 EXISTS
//!   Server:  * OK [UIDVALIDITY 7]
//!   Server:  A0002 OK [READ-ONLY] EXAMINE completed
//! ```
//!
//! Only the read-only subset the gateway uses is implemented; any other
//! command gets `BAD`.

use super::handlers::{handle_examine, handle_fetch, handle_login, handle_logout};
use super::io::{respond, send};
use super::mailbox::Mailbox;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::mailbox::Mailbox as ImapMailbox;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

const GREETING: &str = "* OK IMAP4rev1 Fake server ready\r\n";

/// How a connection is secured before LOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    StartTls,
    Implicit,
}

/// A fake IMAP server on localhost with an OS-assigned port.
///
/// A self-signed certificate for `127.0.0.1` is generated at startup
/// with `rcgen`, so clients must accept invalid certificates.
pub struct FakeImapServer {
    port: u16,
    logouts: Arc<AtomicUsize>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Plain listener that requires STARTTLS before LOGIN.
    pub async fn start(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Security::StartTls).await
    }

    /// Listener that expects a TLS handshake right after connect.
    pub async fn start_implicit_tls(mailbox: Mailbox) -> Self {
        Self::spawn(mailbox, Security::Implicit).await
    }

    async fn spawn(mailbox: Mailbox, security: Security) -> Self {
        // Several tests may race to install the provider; losing is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let mailbox = Arc::new(mailbox);
        let logouts = Arc::new(AtomicUsize::new(0));

        let handle = tokio::spawn({
            let logouts = logouts.clone();
            async move {
                loop {
                    let Ok((stream, _addr)) = listener.accept().await else {
                        break;
                    };
                    let acceptor = acceptor.clone();
                    let mailbox = mailbox.clone();
                    let logouts = logouts.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, security, acceptor, &mailbox, &logouts).await;
                    });
                }
            }
        });

        Self {
            port,
            logouts,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Number of LOGOUT commands served so far.
    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    stream: TcpStream,
    security: Security,
    acceptor: TlsAcceptor,
    mailbox: &Mailbox,
    logouts: &AtomicUsize,
) {
    if security == Security::Implicit {
        let Ok(tls_stream) = acceptor.accept(stream).await else {
            return;
        };
        let mut reader = BufReader::new(tls_stream);
        if send(&mut reader, GREETING.as_bytes()).await.is_err() {
            return;
        }
        handle_imap_session(reader, mailbox, logouts).await;
        return;
    }

    let mut reader = BufReader::new(stream);
    if send(&mut reader, GREETING.as_bytes()).await.is_err() {
        return;
    }

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }
    let Some((tag, command)) = line.trim().split_once(' ') else {
        return;
    };
    if !command.eq_ignore_ascii_case("STARTTLS") {
        let _ = respond(&mut reader, tag, "BAD Expected STARTTLS").await;
        return;
    }
    if respond(&mut reader, tag, "OK Begin TLS negotiation now")
        .await
        .is_err()
    {
        return;
    }

    let Ok(tls_stream) = acceptor.accept(reader.into_inner()).await else {
        return;
    };
    handle_imap_session(BufReader::new(tls_stream), mailbox, logouts).await;
}

fn mailbox_name(mb: &ImapMailbox<'_>) -> String {
    match mb {
        ImapMailbox::Inbox => "INBOX".to_string(),
        ImapMailbox::Other(other) => {
            let bytes: &[u8] = other.as_ref();
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Command loop over an established TLS stream.
///
/// Each line is parsed with `imap-codec`'s `CommandCodec` and dispatched
/// on its `CommandBody`.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    mut reader: BufReader<S>,
    mailbox: &Mailbox,
    logouts: &AtomicUsize,
) {
    let mut examined: Option<String> = None;
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            if respond(&mut reader, tag, "BAD Parse error").await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();

        match command.body {
            CommandBody::Login { .. } => {
                if !handle_login(tag, trimmed, mailbox, &mut reader).await {
                    break;
                }
            }
            CommandBody::Examine { mailbox: mb, .. } => {
                examined = handle_examine(tag, &mailbox_name(&mb), mailbox, &mut reader).await;
            }
            CommandBody::Fetch {
                sequence_set, uid, ..
            } => {
                handle_fetch(
                    tag,
                    &sequence_set,
                    uid,
                    mailbox,
                    examined.as_deref(),
                    &mut reader,
                )
                .await;
            }
            CommandBody::Logout => {
                handle_logout(tag, logouts, &mut reader).await;
                break;
            }
            _ => {
                if respond(&mut reader, tag, "BAD Unknown command")
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
