//! SMTP provider backed by lettre
//!
//! `secure = true` connects with implicit TLS (SMTPS), otherwise the
//! session must upgrade with STARTTLS before authenticating.
//!
//! A send drives one SMTP transaction by hand so every recipient gets
//! its own RCPT reply: refused recipients are reported in the receipt
//! and DATA goes to the ones the server accepted.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use lettre::Address;
use lettre::message::header::ContentType;
use lettre::message::{Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::Error as SmtpError;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::commands::{Data, Mail, Rcpt, Rset};
use lettre::transport::smtp::extension::{ClientId, Extension, MailBodyParameter, MailParameter};
use lettre::transport::smtp::response::Response;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::message::{Attachment, ContentEncoding, DeliveryReceipt, Message};
use crate::transport::{MailTransport, SmtpTarget};

const MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

/// [`MailTransport`] implementation over lettre's tokio SMTP client.
#[derive(Debug, Clone)]
pub struct LettreTransport {
    timeout: Duration,
    accept_invalid_certs: bool,
}

impl LettreTransport {
    #[must_use]
    pub const fn new(config: &ProviderConfig) -> Self {
        Self {
            timeout: config.timeout,
            accept_invalid_certs: config.accept_invalid_certs,
        }
    }

    fn tls_parameters(&self, target: &SmtpTarget) -> Result<TlsParameters> {
        TlsParameters::builder(target.host.clone())
            .dangerous_accept_invalid_certs(self.accept_invalid_certs)
            .build_rustls()
            .map_err(|e| Error::ConnectivityFailed(format!("TLS setup failed: {e}")))
    }

    async fn within<T>(&self, stage: &str, operation: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| Error::ConnectivityFailed(format!("SMTP {stage} timed out")))?
    }

    /// Connect, secure and authenticate a session ready for MAIL FROM.
    async fn open(&self, target: &SmtpTarget) -> Result<AsyncSmtpConnection> {
        debug!(host = %target.host, port = target.port, secure = target.secure, "Connecting to SMTP server");
        let tls = self.tls_parameters(target)?;
        let hello = ClientId::default();
        let (implicit, upgrade) = if target.secure {
            (Some(tls), None)
        } else {
            (None, Some(tls))
        };

        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (target.host.as_str(), target.port),
            Some(self.timeout),
            &hello,
            implicit,
            None,
        )
        .await
        .map_err(|e| classify(&e))?;

        if let Some(tls) = upgrade {
            connection
                .starttls(tls, &hello)
                .await
                .map_err(|e| classify(&e))?;
        }

        let credentials = Credentials::new(
            target.user.clone(),
            target.pass.expose_secret().to_string(),
        );
        if let Err(e) = connection.auth(MECHANISMS, &credentials).await {
            connection.abort().await;
            return Err(classify(&e));
        }
        Ok(connection)
    }
}

#[async_trait]
impl MailTransport for LettreTransport {
    async fn verify(&self, target: &SmtpTarget) -> Result<()> {
        let mut connection = self.within("login", self.open(target)).await?;
        let alive = connection.test_connected().await;
        if let Err(e) = connection.quit().await {
            debug!(error = %e, "SMTP QUIT failed");
        }

        if alive {
            Ok(())
        } else {
            Err(Error::ConnectivityFailed(format!(
                "{}:{} did not answer NOOP",
                target.host, target.port
            )))
        }
    }

    async fn send(&self, target: &SmtpTarget, message: &Message) -> Result<DeliveryReceipt> {
        let envelope = message.envelope()?;
        let email = build_message(message)?;
        let message_id = email.headers().get_raw("Message-ID").map(str::to_string);
        let from = address(&envelope.from)?;
        let recipients = envelope
            .to
            .iter()
            .map(|to| Ok((to.clone(), address(to)?)))
            .collect::<Result<Vec<_>>>()?;
        let body = email.formatted();

        let mut connection = self.within("login", self.open(target)).await?;
        let delivery = self
            .within(
                "transaction",
                transaction(&mut connection, from, &recipients, &body),
            )
            .await?;
        if let Err(e) = connection.quit().await {
            debug!(error = %e, "SMTP QUIT failed");
        }

        info!(
            host = %target.host,
            accepted = delivery.accepted.len(),
            rejected = delivery.rejected.len(),
            response = %delivery.response,
            "SMTP transaction finished"
        );
        let message_id = if delivery.accepted.is_empty() {
            None
        } else {
            message_id
        };
        Ok(DeliveryReceipt {
            message_id,
            accepted: delivery.accepted,
            rejected: delivery.rejected,
            response: delivery.response,
            envelope,
        })
    }
}

/// Per-recipient outcome of one SMTP transaction.
#[derive(Debug, Default, PartialEq, Eq)]
struct Delivery {
    accepted: Vec<String>,
    rejected: Vec<String>,
    response: String,
}

impl Delivery {
    /// Every recipient refused with the same reply.
    fn refused(recipients: &[(String, Address)], response: String) -> Self {
        Self {
            accepted: Vec::new(),
            rejected: recipients.iter().map(|(name, _)| name.clone()).collect(),
            response,
        }
    }

    /// The message body was refused after RCPT; nobody got it.
    fn refuse_accepted(&mut self, response: String) {
        self.rejected.append(&mut self.accepted);
        self.response = response;
    }
}

async fn transaction(
    connection: &mut AsyncSmtpConnection,
    from: Address,
    recipients: &[(String, Address)],
    body: &[u8],
) -> Result<Delivery> {
    let mut parameters = Vec::new();
    if !body.is_ascii() && connection.server_info().supports_feature(Extension::EightBitMime) {
        parameters.push(MailParameter::Body(MailBodyParameter::EightBitMime));
    }
    if let Err(e) = connection.command(Mail::new(Some(from), parameters)).await {
        let response = refusal(&e)?;
        warn!(response = %response, "SMTP refused sender");
        return Ok(Delivery::refused(recipients, response));
    }

    let mut delivery = Delivery::default();
    for (name, address) in recipients {
        match connection.command(Rcpt::new(address.clone(), Vec::new())).await {
            Ok(_) => delivery.accepted.push(name.clone()),
            Err(e) => {
                let response = refusal(&e)?;
                warn!(recipient = %name, response = %response, "SMTP refused recipient");
                delivery.rejected.push(name.clone());
                delivery.response = response;
            }
        }
    }

    if delivery.accepted.is_empty() {
        if let Err(e) = connection.command(Rset).await {
            debug!(error = %e, "SMTP RSET failed");
        }
        return Ok(delivery);
    }

    if let Err(e) = connection.command(Data).await {
        delivery.refuse_accepted(refusal(&e)?);
        return Ok(delivery);
    }
    match connection.message(body).await {
        Ok(response) => delivery.response = reply(&response),
        Err(e) => delivery.refuse_accepted(refusal(&e)?),
    }
    Ok(delivery)
}

/// The server's reply to a refused command, e.g. `550 5.1.1 No such
/// user`. Errors that are not a refusal (I/O, TLS, 421 shutdown) end
/// the transaction.
fn refusal(e: &SmtpError) -> Result<String> {
    match e.status() {
        Some(code) if (e.is_permanent() || e.is_transient()) && code.to_string() != "421" => {
            Ok(std::error::Error::source(e)
                .map_or_else(|| code.to_string(), |text| format!("{code} {text}")))
        }
        _ => Err(classify(e)),
    }
}

fn reply(response: &Response) -> String {
    let lines: Vec<&str> = response.message().collect();
    format!("{} {}", response.code(), lines.join(" "))
}

/// Map a lettre error onto the verify/send failure taxonomy.
fn classify(e: &SmtpError) -> Error {
    let status = e.status().map(|code| code.to_string());
    if status.as_deref().is_some_and(is_auth_status) {
        Error::AuthenticationFailed(e.to_string())
    } else {
        Error::ConnectivityFailed(e.to_string())
    }
}

/// 530 auth required, 534 mechanism too weak, 535 bad credentials.
fn is_auth_status(code: &str) -> bool {
    matches!(code, "530" | "534" | "535")
}

fn address(address: &str) -> Result<Address> {
    address
        .parse()
        .map_err(|e| Error::ConfigInvalid(format!("invalid address '{address}': {e}")))
}

fn mailbox(address: &str) -> Result<Mailbox> {
    address
        .trim()
        .parse()
        .map_err(|e| Error::ConfigInvalid(format!("invalid address '{address}': {e}")))
}

fn build_message(message: &Message) -> Result<lettre::Message> {
    let from = message
        .from
        .as_deref()
        .ok_or_else(|| Error::ConfigInvalid("message has no sender".into()))?;

    let mut builder = lettre::Message::builder().from(mailbox(from)?);
    for to in &message.to {
        builder = builder.to(mailbox(to)?);
    }
    for cc in &message.cc {
        builder = builder.cc(mailbox(cc)?);
    }
    for bcc in &message.bcc {
        builder = builder.bcc(mailbox(bcc)?);
    }
    if let Some(reply_to) = &message.reply_to {
        builder = builder.reply_to(mailbox(reply_to)?);
    }
    if let Some(subject) = &message.subject {
        builder = builder.subject(subject);
    }
    let builder = builder.message_id(None);

    let text = message.text.clone();
    let html = message.html.clone();
    let body = match (text, html) {
        (Some(text), Some(html)) => Body::Multi(MultiPart::alternative_plain_html(text, html)),
        (None, Some(html)) => Body::Single(SinglePart::html(html)),
        (text, None) => Body::Single(SinglePart::plain(text.unwrap_or_default())),
    };

    let result = if message.attachments.is_empty() {
        match body {
            Body::Single(part) => builder.singlepart(part),
            Body::Multi(part) => builder.multipart(part),
        }
    } else {
        let mut mixed = match body {
            Body::Single(part) => MultiPart::mixed().singlepart(part),
            Body::Multi(part) => MultiPart::mixed().multipart(part),
        };
        for attachment in &message.attachments {
            mixed = mixed.singlepart(attachment_part(attachment)?);
        }
        builder.multipart(mixed)
    };

    result.map_err(|e| Error::ConfigInvalid(format!("cannot build message: {e}")))
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

fn attachment_part(attachment: &Attachment) -> Result<SinglePart> {
    let content_type = match &attachment.content_type {
        Some(ct) => ContentType::parse(ct)
            .map_err(|e| Error::ConfigInvalid(format!("invalid content type '{ct}': {e}")))?,
        None if attachment.encoding == ContentEncoding::Utf8 => {
            ContentType::TEXT_PLAIN
        }
        None => ContentType::parse("application/octet-stream")
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?,
    };
    let bytes = attachment.bytes()?;

    let part = match &attachment.cid {
        Some(cid) => MimeAttachment::new_inline(cid.clone()),
        None => MimeAttachment::new(
            attachment
                .filename
                .clone()
                .unwrap_or_else(|| "attachment".to_string()),
        ),
    };
    Ok(part.body(bytes, content_type))
}
