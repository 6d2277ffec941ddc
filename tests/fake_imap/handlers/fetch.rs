//! FETCH and UID FETCH command handler.
//!
//! Message bodies travel as **counted literals**:
//!
//! ```text
//! * <seq> FETCH (UID <uid> FLAGS (...) INTERNALDATE "..." RFC822.SIZE <n> BODY[] {<n>}
//! <exactly n bytes of raw RFC 2822 message>
//! )
//! ```
//!
//! The `{n}\r\n` marker tells the client that the next `n` bytes are
//! raw data, not protocol text. Plain FETCH addresses messages by
//! sequence number (1-based position in the folder), UID FETCH by UID.
//! In both, `*` stands for the largest value in use.

use crate::fake_imap::io::{respond, send};
use crate::fake_imap::mailbox::{Folder, INTERNAL_DATE, Mailbox, TestMessage};
use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

fn resolve(value: &SeqOrUid, largest: u32) -> u32 {
    match value {
        SeqOrUid::Value(v) => v.get(),
        SeqOrUid::Asterisk => largest,
    }
}

/// Messages addressed by `sequence_set`, in folder order, with their
/// sequence numbers.
fn select<'a>(folder: &'a Folder, sequence_set: &SequenceSet, uid: bool) -> Vec<(u32, &'a TestMessage)> {
    let key = |seq: u32, message: &TestMessage| if uid { message.uid } else { seq };
    let largest = folder
        .messages
        .iter()
        .zip(1u32..)
        .map(|(m, seq)| key(seq, m))
        .max()
        .unwrap_or(0);

    let ranges: Vec<(u32, u32)> = sequence_set
        .0
        .as_ref()
        .iter()
        .map(|seq| match seq {
            Sequence::Single(v) => {
                let v = resolve(v, largest);
                (v, v)
            }
            Sequence::Range(a, b) => {
                let (a, b) = (resolve(a, largest), resolve(b, largest));
                (a.min(b), a.max(b))
            }
        })
        .collect();

    folder
        .messages
        .iter()
        .zip(1u32..)
        .filter(|(m, seq)| {
            let k = key(*seq, m);
            ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&k))
        })
        .map(|(m, seq)| (seq, m))
        .collect()
}

pub async fn handle_fetch<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    sequence_set: &SequenceSet,
    uid: bool,
    mailbox: &Mailbox,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder) = selected_folder.and_then(|name| mailbox.get_folder(name)) else {
        let _ = respond(stream, tag, "BAD No folder selected").await;
        return;
    };

    for (seq, message) in select(folder, sequence_set, uid) {
        let len = message.raw.len();
        let header = format!(
            "* {seq} FETCH (UID {} FLAGS ({}) INTERNALDATE \"{INTERNAL_DATE}\" \
             RFC822.SIZE {len} BODY[] {{{len}}}\r\n",
            message.uid,
            message.flags.join(" "),
        );
        if send(stream, header.as_bytes()).await.is_err()
            || send(stream, &message.raw).await.is_err()
            || send(stream, b")\r\n").await.is_err()
        {
            return;
        }
    }

    let _ = respond(stream, tag, "OK FETCH completed").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use std::num::NonZeroU32;
    use tokio::io::BufReader;

    fn value(v: u32) -> SeqOrUid {
        SeqOrUid::Value(NonZeroU32::new(v).unwrap())
    }

    fn set(sequences: Vec<Sequence>) -> SequenceSet {
        SequenceSet(sequences.try_into().unwrap())
    }

    fn mailbox() -> Mailbox {
        MailboxBuilder::new()
            .folder("INBOX")
            .message(40, &["\\Seen"], b"Subject: one\r\n\r\n1")
            .message(41, &[], b"Subject: two\r\n\r\n2")
            .message(45, &["\\Flagged", "\\Seen"], b"Subject: three\r\n\r\n3")
            .build()
    }

    async fn run(sequence_set: &SequenceSet, uid: bool, selected: Option<&str>) -> String {
        let (client, server) = tokio::io::duplex(8192);
        let mut stream = BufReader::new(server);

        handle_fetch("A1", sequence_set, uid, &mailbox(), selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn fetches_by_sequence_number() {
        let output = run(&set(vec![Sequence::Single(value(2))]), false, Some("INBOX")).await;

        assert!(output.starts_with("* 2 FETCH (UID 41 FLAGS () INTERNALDATE"));
        assert!(output.contains("RFC822.SIZE 17 BODY[] {17}\r\nSubject: two"));
        assert!(output.ends_with("A1 OK FETCH completed\r\n"));
    }

    #[tokio::test]
    async fn uid_range_with_asterisk() {
        let output = run(
            &set(vec![Sequence::Range(value(41), SeqOrUid::Asterisk)]),
            true,
            Some("INBOX"),
        )
        .await;

        assert!(!output.contains("UID 40 "));
        assert!(output.contains("* 2 FETCH (UID 41"));
        assert!(output.contains("* 3 FETCH (UID 45 FLAGS (\\Flagged \\Seen)"));
    }

    #[tokio::test]
    async fn all_messages_in_folder_order() {
        let output = run(
            &set(vec![Sequence::Range(value(1), SeqOrUid::Asterisk)]),
            false,
            Some("INBOX"),
        )
        .await;

        let first = output.find("* 1 FETCH").unwrap();
        let third = output.find("* 3 FETCH").unwrap();
        assert!(first < third);
    }

    #[tokio::test]
    async fn unknown_uid_returns_only_ok() {
        let output = run(&set(vec![Sequence::Single(value(99))]), true, Some("INBOX")).await;
        assert_eq!(output, "A1 OK FETCH completed\r\n");
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let output = run(&set(vec![Sequence::Single(value(1))]), false, None).await;
        assert!(output.contains("A1 BAD No folder selected"));
    }
}
