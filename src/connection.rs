//! IMAP provider over async-imap and rustls
//!
//! `tls = true` performs the TLS handshake right after the TCP connect
//! (IMAPS); otherwise the greeting is read in plaintext and the session
//! is upgraded with STARTTLS before LOGIN. Credentials are never sent
//! over an unencrypted stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::Session;
use async_imap::types::Fetch;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::flag::Flag;
use crate::mailbox::{
    FetchQuery, ImapTarget, MailboxInfo, MailboxProtocol, MailboxSession, MessageAttributes,
    SessionEvent,
};

/// A TLS-wrapped IMAP session.
pub type ImapSession = Session<Compat<TlsStream<TcpStream>>>;

/// Attributes requested for every fetched message. `BODY.PEEK` leaves
/// `\Seen` untouched.
pub const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])";

/// [`MailboxProtocol`] implementation for real IMAP servers.
#[derive(Debug, Clone)]
pub struct ImapProvider {
    timeout: Duration,
    accept_invalid_certs: bool,
}

impl ImapProvider {
    #[must_use]
    pub const fn new(config: &ProviderConfig) -> Self {
        Self {
            timeout: config.timeout,
            accept_invalid_certs: config.accept_invalid_certs,
        }
    }

    fn tls_connector(&self) -> Result<TlsConnector> {
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::ConnectionError(format!("TLS setup failed: {e}")))?;

        let config = if self.accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }

    async fn within<F: Future>(&self, step: &str, fut: F) -> Result<F::Output> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::ConnectionError(format!("{step} timed out after {:?}", self.timeout)))
    }

    async fn handshake(&self, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::ConnectionError(format!("Invalid server name: {e}")))?;
        self.within("TLS handshake", self.tls_connector()?.connect(server_name, tcp))
            .await?
            .map_err(|e| Error::ConnectionError(format!("TLS handshake failed: {e}")))
    }

    async fn greeting<T>(&self, client: &mut async_imap::Client<T>) -> Result<()>
    where
        T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + std::fmt::Debug,
    {
        let greeting = self
            .within("IMAP greeting", client.read_response())
            .await?
            .map_err(|e| Error::ConnectionError(format!("IMAP greeting failed: {e}")))?;
        if greeting.is_none() {
            return Err(Error::ConnectionError(
                "server closed connection before greeting".into(),
            ));
        }
        Ok(())
    }

    async fn open_tls(&self, target: &ImapTarget) -> Result<async_imap::Client<Compat<TlsStream<TcpStream>>>> {
        let tcp = self
            .within("TCP connect", TcpStream::connect((target.host.as_str(), target.port)))
            .await?
            .map_err(|e| Error::ConnectionError(format!("TCP connect failed: {e}")))?;

        if target.tls {
            let tls_stream = self.handshake(&target.host, tcp).await?;
            let mut client = async_imap::Client::new(tls_stream.compat());
            self.greeting(&mut client).await?;
            return Ok(client);
        }

        let mut client = async_imap::Client::new(tcp.compat());
        self.greeting(&mut client).await?;
        self.within("STARTTLS", client.run_command_and_check_ok("STARTTLS", None))
            .await?
            .map_err(|e| Error::ConnectionError(format!("STARTTLS failed: {e}")))?;

        let inner = client.into_inner().into_inner();
        let tls_stream = self.handshake(&target.host, inner).await?;
        Ok(async_imap::Client::new(tls_stream.compat()))
    }
}

#[async_trait]
impl MailboxProtocol for ImapProvider {
    async fn connect(&self, target: &ImapTarget) -> Result<Box<dyn MailboxSession>> {
        debug!(host = %target.host, port = target.port, tls = target.tls, "Connecting to IMAP server");
        let client = self.open_tls(target).await?;

        let session = self
            .within(
                "IMAP login",
                client.login(&target.user, target.pass.expose_secret()),
            )
            .await?
            .map_err(|(e, _)| match e {
                async_imap::error::Error::No(reason) => Error::AuthenticationFailed(reason),
                other => Error::ConnectionError(format!("Login failed: {other}")),
            })?;

        info!(host = %target.host, "Connected to IMAP server");
        Ok(Box::new(ImapConnection {
            session,
            timeout: self.timeout,
        }))
    }
}

struct ImapConnection {
    session: ImapSession,
    timeout: Duration,
}

#[async_trait]
impl MailboxSession for ImapConnection {
    async fn open_mailbox(&mut self, mailbox: &str) -> Result<MailboxInfo> {
        let opened = tokio::time::timeout(self.timeout, self.session.examine(mailbox))
            .await
            .map_err(|_| Error::ConnectionError(format!("EXAMINE {mailbox} timed out")))?
            .map_err(|e| Error::MailboxError(format!("Failed to examine {mailbox}: {e}")))?;
        Ok(MailboxInfo {
            exists: opened.exists,
            uid_validity: opened.uid_validity,
            read_only: true,
        })
    }

    async fn fetch<'a>(&'a mut self, query: &'a FetchQuery) -> Result<BoxStream<'a, SessionEvent>> {
        let timeout = self.timeout;
        let started = match query {
            FetchQuery::Sequence(set) => tokio::time::timeout(timeout, self.session.fetch(set, FETCH_ITEMS))
                .await
                .map(|r| r.map(StreamExt::boxed)),
            FetchQuery::Uid(set) => tokio::time::timeout(timeout, self.session.uid_fetch(set, FETCH_ITEMS))
                .await
                .map(|r| r.map(StreamExt::boxed)),
        };
        let fetches = started
            .map_err(|_| Error::ConnectionError("FETCH timed out".into()))?
            .map_err(|e| Error::FetchError(format!("Fetch failed: {e}")))?;

        let events = stream::unfold(Some(fetches), move |state| async move {
            let mut fetches = state?;
            match tokio::time::timeout(timeout, fetches.next()).await {
                Err(_) => Some((
                    vec![SessionEvent::ConnectionError(format!(
                        "no FETCH response within {timeout:?}"
                    ))],
                    None,
                )),
                Ok(None) => Some((vec![SessionEvent::FetchEnd], None)),
                Ok(Some(Ok(fetch))) => Some((fetch_events(&fetch), Some(fetches))),
                Ok(Some(Err(e))) => Some((vec![error_event(e)], None)),
            }
        })
        .flat_map(stream::iter);

        Ok(events.boxed())
    }

    async fn close(&mut self) -> Result<()> {
        tokio::time::timeout(self.timeout, self.session.logout())
            .await
            .map_err(|_| Error::ConnectionError("LOGOUT timed out".into()))?
            .map_err(|e| Error::ConnectionError(format!("Logout failed: {e}")))
    }
}

/// Split one FETCH response into message sub-events.
fn fetch_events(fetch: &Fetch) -> Vec<SessionEvent> {
    let seq = fetch.message;
    let mut events = vec![
        SessionEvent::MessageStart { seq },
        SessionEvent::Attributes {
            seq,
            attributes: MessageAttributes {
                uid: fetch.uid,
                flags: fetch.flags().map(Flag::from).collect(),
                internal_date: fetch.internal_date(),
                size: fetch.size,
            },
        },
    ];
    if let Some(body) = fetch.body() {
        events.push(SessionEvent::Body {
            seq,
            chunk: body.to_vec(),
        });
    }
    events.push(SessionEvent::MessageEnd { seq });
    events
}

fn error_event(e: async_imap::error::Error) -> SessionEvent {
    match e {
        async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost => {
            SessionEvent::ConnectionError(e.to_string())
        }
        other => SessionEvent::FetchError(other.to_string()),
    }
}

/// Certificate verifier that accepts any server certificate, for test
/// servers with self-signed certificates.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
