//! Listener, TLS setup and the command loop of the fake SMTP server.
//!
//! ```text
//!   Client:  MAIL FROM:<me@example.com>
//!   Server:  250 OK
//!   Client:  RCPT TO:<ghost@example.com>
//!   Server:  550 5.1.1 No such user
//! ```
//!
//! STARTTLS is only offered on a plaintext session and AUTH only on an
//! encrypted one, so a client that skips the upgrade cannot log in.

use super::Script;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

const EHLO_PLAIN: &str = "250-fake.test\r\n250-8BITMIME\r\n250 STARTTLS";
const EHLO_TLS: &str = "250-fake.test\r\n250-8BITMIME\r\n250 AUTH PLAIN";

/// One message accepted through DATA.
#[derive(Debug, Clone, Default)]
pub struct Received {
    pub from: String,
    pub recipients: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    StartTls,
    Implicit,
}

#[derive(Debug, PartialEq, Eq)]
enum Ended {
    StartTls,
    Closed,
}

/// A fake SMTP server on localhost with an OS-assigned port and a
/// self-signed certificate for `127.0.0.1`.
pub struct FakeSmtpServer {
    port: u16,
    received: Arc<Mutex<Vec<Received>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeSmtpServer {
    /// Plain listener that requires STARTTLS before AUTH.
    pub async fn start(script: Script) -> Self {
        Self::spawn(script, Security::StartTls).await
    }

    /// Listener that expects a TLS handshake right after connect.
    pub async fn start_implicit_tls(script: Script) -> Self {
        Self::spawn(script, Security::Implicit).await
    }

    async fn spawn(script: Script, security: Security) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.cert.der().clone()], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let script = Arc::new(script);
        let received = Arc::new(Mutex::new(Vec::new()));

        let handle = tokio::spawn({
            let received = received.clone();
            async move {
                while let Ok((stream, _addr)) = listener.accept().await {
                    let acceptor = acceptor.clone();
                    let script = script.clone();
                    let received = received.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, security, acceptor, &script, &received).await;
                    });
                }
            }
        });

        Self {
            port,
            received,
            _handle: handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Messages accepted so far, in arrival order.
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle_connection(
    stream: TcpStream,
    security: Security,
    acceptor: TlsAcceptor,
    script: &Script,
    received: &Mutex<Vec<Received>>,
) {
    if security == Security::Implicit {
        let Ok(tls_stream) = acceptor.accept(stream).await else {
            return;
        };
        serve(&mut BufReader::new(tls_stream), script, received, true, true).await;
        return;
    }

    let mut reader = BufReader::new(stream);
    if serve(&mut reader, script, received, false, true).await != Ended::StartTls {
        return;
    }
    let Ok(tls_stream) = acceptor.accept(reader.into_inner()).await else {
        return;
    };
    serve(&mut BufReader::new(tls_stream), script, received, true, false).await;
}

async fn reply<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(format!("{line}\r\n").as_bytes()).await?;
    stream.get_mut().flush().await
}

/// Address between the angle brackets of `FROM:<..>` or `TO:<..>`.
fn path(argument: &str) -> String {
    argument
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(address, _)| address.to_string())
        .unwrap_or_default()
}

/// User and password of an `AUTH PLAIN <base64>` argument.
fn plain_credentials(argument: &str) -> Option<(String, String)> {
    let (mechanism, initial) = argument.split_once(' ')?;
    if !mechanism.eq_ignore_ascii_case("PLAIN") {
        return None;
    }
    let decoded = String::from_utf8(STANDARD.decode(initial.trim()).ok()?).ok()?;
    let mut parts = decoded.split('\0').skip(1);
    Some((parts.next()?.to_string(), parts.next()?.to_string()))
}

/// Read the DATA payload up to the lone `.` line, undoing dot-stuffing.
async fn read_data<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut BufReader<S>) -> Option<String> {
    let mut data = String::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        if line == ".\r\n" {
            return Some(data);
        }
        data.push_str(line.strip_prefix('.').unwrap_or(&line));
    }
}

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    script: &Script,
    received: &Mutex<Vec<Received>>,
    encrypted: bool,
    greet: bool,
) -> Ended {
    if greet
        && (reply(stream, &script.greeting).await.is_err() || !script.greeting.starts_with("220"))
    {
        return Ended::Closed;
    }

    let mut authenticated = false;
    let mut envelope: Option<Received> = None;
    loop {
        let mut line = String::new();
        match stream.read_line(&mut line).await {
            Ok(0) | Err(_) => return Ended::Closed,
            Ok(_) => {}
        }
        let line = line.trim_end();
        let (verb, argument) = line.split_once(' ').unwrap_or((line, ""));

        let response = match verb.to_ascii_uppercase().as_str() {
            "EHLO" if encrypted => EHLO_TLS,
            "EHLO" => EHLO_PLAIN,
            "STARTTLS" if !encrypted => {
                let _ = reply(stream, "220 2.0.0 Ready to start TLS").await;
                return Ended::StartTls;
            }
            "AUTH" if !encrypted => "530 5.7.0 Must issue a STARTTLS command first",
            "AUTH" => {
                let (user, pass) = &script.credentials;
                if plain_credentials(argument).is_some_and(|(u, p)| &u == user && &p == pass) {
                    authenticated = true;
                    "235 2.7.0 Authentication successful"
                } else {
                    "535 5.7.8 Authentication credentials invalid"
                }
            }
            "NOOP" => "250 2.0.0 OK",
            "MAIL" if !authenticated => "530 5.7.0 Authentication required",
            "MAIL" => {
                envelope = Some(Received {
                    from: path(argument),
                    ..Received::default()
                });
                "250 2.1.0 OK"
            }
            "RCPT" => match envelope.as_mut() {
                None => "503 5.5.1 Need MAIL first",
                Some(_) if script.refused.contains(&path(argument)) => "550 5.1.1 No such user",
                Some(envelope) => {
                    envelope.recipients.push(path(argument));
                    "250 2.1.5 OK"
                }
            },
            "DATA" => match envelope.take() {
                Some(mut message) if !message.recipients.is_empty() => {
                    if reply(stream, "354 End data with <CR><LF>.<CR><LF>").await.is_err() {
                        return Ended::Closed;
                    }
                    let Some(data) = read_data(stream).await else {
                        return Ended::Closed;
                    };
                    message.data = data;
                    received.lock().unwrap().push(message);
                    "250 2.0.0 Queued as FAKE1"
                }
                _ => "554 5.5.1 No valid recipients",
            },
            "RSET" => {
                envelope = None;
                "250 2.0.0 OK"
            }
            "QUIT" => {
                let _ = reply(stream, "221 2.0.0 Bye").await;
                return Ended::Closed;
            }
            _ => "502 5.5.2 Command not recognized",
        };
        if reply(stream, response).await.is_err() {
            return Ended::Closed;
        }
    }
}
