//! LOGOUT command handler.
//!
//! The server sends an untagged BYE (the connection is ending) followed
//! by the tagged OK, and counts the logout so tests can assert that a
//! session was closed.

use crate::fake_imap::io::{respond, untagged};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

pub async fn handle_logout<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    logouts: &AtomicUsize,
    stream: &mut BufReader<S>,
) {
    logouts.fetch_add(1, Ordering::SeqCst);
    let _ = untagged(stream, &["BYE Logging out".to_string()]).await;
    let _ = respond(stream, tag, "OK LOGOUT completed").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn sends_bye_then_ok_and_counts() {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);
        let logouts = AtomicUsize::new(0);

        handle_logout("A0005", &logouts, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        let output = String::from_utf8(buf).unwrap();

        assert_eq!(output, "* BYE Logging out\r\nA0005 OK LOGOUT completed\r\n");
        assert_eq!(logouts.load(Ordering::SeqCst), 1);
    }
}
