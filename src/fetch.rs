//! Mailbox fetch engine
//!
//! One fetch runs one IMAP session through
//! `Disconnected -> Connecting -> Ready -> MailboxOpen -> Fetching`
//! and ends in `Completed` or `Failed`. Message sub-events from the
//! session are accumulated per sequence number; a message reaches the
//! result only once its end event has been seen, and a finished message
//! is never replaced by a later frame for the same sequence number.
//!
//! The session is driven on its own task. The caller waits on a
//! channel that is settled exactly once, so the session is still logged
//! out when the caller goes away mid-fetch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::account::AccountSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::mailbox::{
    FetchMessage, FetchQuery, FetchRequest, ImapTarget, MailboxProtocol, MailboxSession,
    MessageAttributes, SessionEvent,
};
use crate::transport::Verification;

/// Lifecycle of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Disconnected,
    Connecting,
    Ready,
    MailboxOpen,
    Fetching,
    Completed,
    Failed,
}

impl FetchState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Ready)
                | (Self::Ready, Self::MailboxOpen)
                | (Self::MailboxOpen, Self::Fetching)
                | (Self::Fetching, Self::Completed)
        ) || (!self.is_terminal() && matches!(next, Self::Failed))
    }
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Default)]
struct PendingMessage {
    attributes: MessageAttributes,
    body: Option<Vec<u8>>,
}

impl PendingMessage {
    fn absorb(&mut self, attributes: MessageAttributes) {
        merge_attributes(&mut self.attributes, attributes);
    }
}

/// Overwrite only the fields `update` carries.
fn merge_attributes(into: &mut MessageAttributes, update: MessageAttributes) {
    if update.uid.is_some() {
        into.uid = update.uid;
    }
    if !update.flags.is_empty() {
        into.flags = update.flags;
    }
    if update.internal_date.is_some() {
        into.internal_date = update.internal_date;
    }
    if update.size.is_some() {
        into.size = update.size;
    }
}

/// Aggregates session events into finished messages.
#[derive(Debug)]
pub struct FetchMachine {
    state: FetchState,
    pending: BTreeMap<u32, PendingMessage>,
    finished: BTreeMap<u32, FetchMessage>,
}

impl Default for FetchMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchMachine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: FetchState::Disconnected,
            pending: BTreeMap::new(),
            finished: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> FetchState {
        self.state
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FetchError`] for a transition the lifecycle does
    /// not allow.
    pub fn advance(&mut self, next: FetchState) -> Result<()> {
        if self.state.can_advance_to(next) {
            debug!(from = %self.state, to = %next, "Fetch state");
            self.state = next;
            Ok(())
        } else {
            Err(Error::FetchError(format!(
                "invalid fetch transition {} -> {next}",
                self.state
            )))
        }
    }

    /// Mark the fetch failed and hand `error` back.
    pub fn fail(&mut self, error: Error) -> Error {
        if !self.state.is_terminal() {
            self.state = FetchState::Failed;
        }
        self.pending.clear();
        self.finished.clear();
        error
    }

    /// Feed one session event.
    ///
    /// Returns the outcome once the fetch settles, `None` while it is
    /// still running and for every event after it settled.
    pub fn apply(&mut self, event: SessionEvent) -> Option<Result<Vec<FetchMessage>>> {
        if self.state.is_terminal() {
            debug!(?event, "Ignoring event after fetch settled");
            return None;
        }

        match event {
            // A finalized message keeps its body. Later attributes for the
            // same sequence number, such as an unsolicited FLAGS update,
            // are folded into it.
            SessionEvent::MessageStart { seq } | SessionEvent::MessageEnd { seq }
                if self.finished.contains_key(&seq) =>
            {
                None
            }
            SessionEvent::Attributes { seq, attributes } if self.finished.contains_key(&seq) => {
                if let Some(message) = self.finished.get_mut(&seq) {
                    merge_attributes(&mut message.attributes, attributes);
                }
                None
            }
            SessionEvent::Body { seq, .. } if self.finished.contains_key(&seq) => {
                debug!(seq, "Dropping body chunk for a finished message");
                None
            }
            SessionEvent::MessageStart { seq } => {
                self.pending.entry(seq).or_default();
                None
            }
            SessionEvent::Attributes { seq, attributes } => {
                self.pending.entry(seq).or_default().absorb(attributes);
                None
            }
            SessionEvent::Body { seq, chunk } => {
                self.pending
                    .entry(seq)
                    .or_default()
                    .body
                    .get_or_insert_with(Vec::new)
                    .extend_from_slice(&chunk);
                None
            }
            SessionEvent::MessageEnd { seq } => {
                let message = self.pending.remove(&seq).unwrap_or_default();
                self.finished.insert(
                    seq,
                    FetchMessage {
                        seq,
                        attributes: message.attributes,
                        body: message.body,
                    },
                );
                None
            }
            SessionEvent::FetchEnd => {
                if self.state != FetchState::Fetching {
                    return Some(Err(self.fail(Error::FetchError(format!(
                        "fetch ended while {}",
                        self.state
                    )))));
                }
                if !self.pending.is_empty() {
                    warn!(
                        unfinished = self.pending.len(),
                        "Discarding messages without end event"
                    );
                    self.pending.clear();
                }
                self.state = FetchState::Completed;
                let messages = std::mem::take(&mut self.finished).into_values().collect();
                Some(Ok(messages))
            }
            SessionEvent::FetchError(reason) => Some(Err(self.fail(Error::FetchError(reason)))),
            SessionEvent::ConnectionError(reason) => {
                Some(Err(self.fail(Error::ConnectionError(reason))))
            }
            SessionEvent::ConnectionClosed => Some(Err(self.fail(Error::ConnectionError(
                "connection closed before fetch completed".into(),
            )))),
        }
    }
}

/// Single-resolution completion guard.
pub struct Settle<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Settle<T> {
    #[must_use]
    pub const fn new(sender: oneshot::Sender<Result<T>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Deliver `outcome` if nothing was delivered yet. Returns whether
    /// this call settled the operation.
    pub fn settle(&mut self, outcome: Result<T>) -> bool {
        let Some(sender) = self.sender.take() else {
            return false;
        };
        if sender.send(outcome).is_err() {
            debug!("Fetch caller went away before the result arrived");
        }
        true
    }

    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.sender.is_none()
    }
}

/// Keep IMAP-stage errors as they are; wrap anything else.
fn stage_error(e: Error, wrap: fn(String) -> Error) -> Error {
    match e.kind() {
        ErrorKind::ConnectionError | ErrorKind::MailboxError | ErrorKind::FetchError => e,
        _ => wrap(e.to_string()),
    }
}

/// Runs fetches and IMAP verification against a [`MailboxProtocol`].
#[derive(Clone)]
pub struct FetchEngine {
    protocol: Arc<dyn MailboxProtocol>,
}

impl FetchEngine {
    #[must_use]
    pub fn new(protocol: Arc<dyn MailboxProtocol>) -> Self {
        Self { protocol }
    }

    /// Fetch the messages selected by `request`, ordered by sequence
    /// number.
    ///
    /// # Errors
    ///
    /// - [`Error::ConfigInvalid`] for incomplete IMAP settings or an
    ///   invalid selector
    /// - [`Error::ConnectionError`] if the session cannot be
    ///   established or drops before the fetch completes
    /// - [`Error::MailboxError`] if the mailbox cannot be opened
    /// - [`Error::FetchError`] if the server fails the fetch
    pub async fn fetch(
        &self,
        account: &AccountSettings,
        request: &FetchRequest,
    ) -> Result<Vec<FetchMessage>> {
        let target = ImapTarget::from_settings(account)?;
        let query = request.query()?;
        let mailbox = request.mailbox().to_string();

        let (tx, rx) = oneshot::channel();
        let span = info_span!("fetch", host = %target.host, mailbox = %mailbox);
        tokio::spawn(
            drive(self.protocol.clone(), target, mailbox, query, Settle::new(tx)).instrument(span),
        );

        rx.await
            .map_err(|_| Error::FetchError("fetch task ended without a result".into()))?
    }

    /// Connect, log in and log out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if IMAP settings are incomplete.
    /// Authentication and connection failures are reported in the
    /// returned [`Verification`].
    pub async fn verify(&self, account: &AccountSettings) -> Result<Verification> {
        let target = ImapTarget::from_settings(account)?;
        let outcome = match self.protocol.connect(&target).await {
            Ok(mut session) => {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Logout after verify failed");
                }
                Ok(())
            }
            Err(e) => Err(e),
        };

        let verification = Verification::from_outcome(
            outcome,
            &[
                ErrorKind::AuthenticationFailed,
                ErrorKind::ConnectionError,
                ErrorKind::ConnectivityFailed,
            ],
        )?;
        info!(host = %target.host, ok = verification.ok, "Verify imap");
        Ok(verification)
    }
}

async fn drive(
    protocol: Arc<dyn MailboxProtocol>,
    target: ImapTarget,
    mailbox: String,
    query: FetchQuery,
    mut settle: Settle<Vec<FetchMessage>>,
) {
    let mut machine = FetchMachine::new();
    if let Err(e) = machine.advance(FetchState::Connecting) {
        settle.settle(Err(e));
        return;
    }

    let mut session = match protocol.connect(&target).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "IMAP connect failed");
            settle.settle(Err(machine.fail(stage_error(e, Error::ConnectionError))));
            return;
        }
    };

    let outcome = run_session(&mut machine, session.as_mut(), &mailbox, &query).await;

    if let Err(e) = session.close().await {
        debug!(error = %e, "IMAP logout failed");
    }
    match &outcome {
        Ok(messages) => info!(count = messages.len(), "Fetch completed"),
        Err(e) => warn!(error = %e, state = %machine.state(), "Fetch failed"),
    }
    settle.settle(outcome);
}

async fn run_session(
    machine: &mut FetchMachine,
    session: &mut dyn MailboxSession,
    mailbox: &str,
    query: &FetchQuery,
) -> Result<Vec<FetchMessage>> {
    machine.advance(FetchState::Ready)?;

    let info = session
        .open_mailbox(mailbox)
        .await
        .map_err(|e| machine.fail(stage_error(e, Error::MailboxError)))?;
    debug!(exists = info.exists, read_only = info.read_only, "Mailbox open");
    machine.advance(FetchState::MailboxOpen)?;

    let mut events = session
        .fetch(query)
        .await
        .map_err(|e| machine.fail(stage_error(e, Error::FetchError)))?;
    machine.advance(FetchState::Fetching)?;

    while let Some(event) = events.next().await {
        if let Some(outcome) = machine.apply(event) {
            return outcome;
        }
    }
    machine
        .apply(SessionEvent::ConnectionClosed)
        .unwrap_or_else(|| Err(Error::ConnectionError("event stream ended".into())))
}
