#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for managing mail accounts and running mail operations locally

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mailgate::{
    AccountSelector, AccountSettings, AuthSettings, DeliveryReceipt, FetchMessage, FetchRequest,
    ImapSettings, MailService, Message, RequestContext, ServiceConfig, SmtpSettings,
    StaticKeyRing, Unrestricted, Verification, VerifyOptions,
};
use secrecy::SecretString;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailgate-cli")]
#[command(about = "Manage encrypted mail accounts and send or fetch mail")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Tenant the accounts belong to
    #[arg(long, global = true, env = "MAILGATE_TENANT", default_value = "default")]
    tenant: String,

    /// User the request runs as
    #[arg(long, global = true, env = "MAILGATE_USER", default_value = "cli")]
    user: String,
}

#[derive(clap::Args)]
struct Credentials {
    /// Login user
    #[arg(long)]
    login: Option<String>,

    /// Login password
    #[arg(long, env = "MAILGATE_PASS", hide_env_values = true)]
    pass: Option<String>,
}

impl Credentials {
    fn into_auth(self) -> AuthSettings {
        AuthSettings {
            user: self.login,
            pass: self.pass.map(SecretString::from),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Save SMTP settings for an account
    Smtp {
        account: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Implicit TLS (`true`) or STARTTLS (`false`)
        #[arg(long)]
        secure: Option<bool>,
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Save IMAP settings for an account
    Imap {
        account: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Implicit TLS (`true`) or STARTTLS (`false`)
        #[arg(long)]
        tls: Option<bool>,
        #[command(flatten)]
        credentials: Credentials,
    },

    /// Check that the account's servers accept its credentials
    Verify {
        account: String,
        /// Verify SMTP only
        #[arg(long, conflicts_with = "imap")]
        smtp: bool,
        /// Verify IMAP only
        #[arg(long)]
        imap: bool,
    },

    /// Send a message described by a JSON file (`-` for stdin)
    Send { account: String, message: PathBuf },

    /// Fetch messages read-only
    Fetch {
        account: String,
        #[arg(long, default_value = "INBOX")]
        mailbox: String,
        /// Sequence number of a single message
        #[arg(long, conflicts_with = "uid")]
        seq: Option<u32>,
        /// UID set such as `42` or `40:45`
        #[arg(long)]
        uid: Option<String>,
    },

    /// Delete an account
    Remove { account: String },

    /// Re-encrypt an account's password under the current key
    Rekey { account: String },

    /// Print a fresh encryption key entry for `MAILGATE_KEYS`
    Keygen {
        #[arg(long, default_value = "k1")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Command::Keygen { id } = &args.command {
        println!("{id}:{}", StaticKeyRing::generate_key()?);
        return Ok(());
    }

    let config = ServiceConfig::from_env()?;
    let service = MailService::from_config(config, Arc::new(Unrestricted));
    let ctx = RequestContext::new(&args.tenant, &args.user);

    match args.command {
        Command::Smtp {
            account,
            host,
            port,
            secure,
            credentials,
        } => {
            let settings = AccountSettings {
                smtp: SmtpSettings { host, port, secure },
                auth: credentials.into_auth(),
                ..AccountSettings::default()
            };
            let saved = service.save_smtp_settings(&ctx, &account, settings).await?;
            output(args.json, &saved, || println!("Saved SMTP settings for {}", saved.account))?;
        }
        Command::Imap {
            account,
            host,
            port,
            tls,
            credentials,
        } => {
            let settings = AccountSettings {
                imap: ImapSettings { host, port, tls },
                auth: credentials.into_auth(),
                ..AccountSettings::default()
            };
            let saved = service.save_imap_settings(&ctx, &account, settings).await?;
            output(args.json, &saved, || println!("Saved IMAP settings for {}", saved.account))?;
        }
        Command::Verify { account, smtp, imap } => {
            let options = if smtp || imap {
                VerifyOptions {
                    smtp: Some(smtp),
                    imap: Some(imap),
                }
            } else {
                VerifyOptions::default()
            };
            let report = service
                .verify(&ctx, AccountSelector::Named(account), options)
                .await?;
            output(args.json, &report, || {
                print_verification("SMTP", report.smtp.as_ref());
                print_verification("IMAP", report.imap.as_ref());
            })?;
            if !report.ok() {
                std::process::exit(1);
            }
        }
        Command::Send { account, message } => {
            let message = read_message(&message)?;
            let receipt = service.send(&ctx, &account, message).await?;
            output(args.json, &receipt, || print_receipt(&receipt))?;
        }
        Command::Fetch {
            account,
            mailbox,
            seq,
            uid,
        } => {
            let request = FetchRequest {
                mailbox: Some(mailbox),
                seq,
                uid,
            };
            let messages = service.fetch(&ctx, &account, &request).await?;
            output(args.json, &messages, || print_message_table(&messages))?;
        }
        Command::Remove { account } => {
            let removed = service.remove(&ctx, &account).await?;
            output(args.json, &removed, || println!("Removed {}", removed.account))?;
        }
        Command::Rekey { account } => {
            let outcome = service.rekey(&ctx, &account).await?;
            output(args.json, &outcome, || {
                if outcome.changed {
                    println!("Re-encrypted {}", outcome.account);
                } else {
                    println!("{} already uses the current key", outcome.account);
                }
            })?;
        }
        // Printed before configuration is loaded.
        Command::Keygen { .. } => {}
    }

    Ok(())
}

fn output<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human();
    }
    Ok(())
}

fn read_message(path: &Path) -> anyhow::Result<Message> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&raw)?)
}

fn print_verification(name: &str, verification: Option<&Verification>) {
    match verification {
        None => println!("{name}: not configured"),
        Some(v) if v.ok => println!("{name}: ok"),
        Some(v) => println!(
            "{name}: failed ({})",
            v.error.as_ref().map_or("unknown error", |e| e.message.as_str())
        ),
    }
}

fn print_receipt(receipt: &DeliveryReceipt) {
    println!(
        "Message-ID: {}",
        receipt.message_id.as_deref().unwrap_or("-")
    );
    println!("Accepted:   {}", receipt.accepted.join(", "));
    if !receipt.rejected.is_empty() {
        println!("Rejected:   {}", receipt.rejected.join(", "));
    }
    println!("Response:   {}", receipt.response);
}

fn print_message_table(messages: &[FetchMessage]) {
    if messages.is_empty() {
        println!("No messages found.");
        return;
    }

    let header = format!(
        "{:<6} {:<8} {:<20} {:<10} {}",
        "Seq", "UID", "Date", "Size", "Flags"
    );
    println!("{header}");
    println!("{}", "-".repeat(70));

    for message in messages {
        let attrs = &message.attributes;
        println!(
            "{:<6} {:<8} {:<20} {:<10} {}",
            message.seq,
            attrs.uid.map_or_else(|| "-".to_string(), |u| u.to_string()),
            attrs
                .internal_date
                .map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d %H:%M").to_string()),
            attrs.size.map_or_else(|| "-".to_string(), |s| s.to_string()),
            attrs
                .flags
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
        );
    }

    println!("\n{} message(s)", messages.len());
}
