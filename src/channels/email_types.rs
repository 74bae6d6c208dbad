//! Email-specific types: fetched message, quote and signature stripping.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Signature and forwarded-message markers. Everything from the first
/// marker on is dropped.
const SIGNATURE_DELIMITERS: &[&str] = &[
    "\n-- \n",
    "\n--\n",
    "\n___\n",
    "----- Original Message -----",
    "-----Original Message-----",
    "Sent from my iPhone",
    "Sent from my iPad",
];

/// One message fetched from the mailbox.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedEmail {
    /// Message-ID header, or a generated id when absent.
    pub message_id: String,
    /// IMAP UID in the selected mailbox, used for `UID STORE` when marking the message seen.
    pub uid: u32,
    /// Sender address.
    pub from: String,
    pub subject: String,
    /// Readable text body, before cleanup.
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Strip quoted text from an email body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - "On ... wrote:" attribution lines and everything after them
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Cut the body at the earliest signature delimiter.
pub fn strip_signature(body: &str) -> String {
    let normalized = body.replace("\r\n", "\n");
    let cut = SIGNATURE_DELIMITERS
        .iter()
        .filter_map(|d| normalized.find(d))
        .min()
        .unwrap_or(normalized.len());
    normalized[..cut].trim_end().to_string()
}

/// Body cleanup applied before a message reaches the pipeline.
pub fn clean_body(body: &str) -> String {
    strip_quoted_text(&strip_signature(body)).trim().to_string()
}
