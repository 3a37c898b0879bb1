//! Message file codec.
//!
//! ```text
//! <content>
//! --
//! Author: <author>
//! Date: <RFC 3339, microseconds, Z>
//! Signature: <token>            (optional)
//! ```
//!
//! The trailer starts at the last `"\n-- \n"`, so content may itself contain
//! the delimiter. Unknown header keys are ignored.

use bookchat_core::{Message, MessageId, format_timestamp};
use chrono::{DateTime, Utc};

const TRAILER_DELIMITER: &str = "\n-- \n";

/// Fields decoded from a message file, before they are checked against the
/// branch and file name they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub content: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub signature: Option<String>,
}

impl ParsedMessage {
    /// Builds the read-side message. `verified` starts out `false`.
    #[must_use]
    pub fn into_message(self, id: MessageId, archived: bool) -> Message {
        Message {
            id,
            author: self.author,
            content: self.content,
            created_at: self.created_at,
            signature: self.signature,
            verified: false,
            archived,
        }
    }
}

#[must_use]
pub fn encode_message(author: &str, created_at: &DateTime<Utc>, content: &str, signature: Option<&str>) -> String {
    let mut out = String::with_capacity(content.len() + 96);
    out.push_str(content);
    out.push_str(TRAILER_DELIMITER);
    out.push_str("Author: ");
    out.push_str(author);
    out.push('\n');
    out.push_str("Date: ");
    out.push_str(&format_timestamp(created_at));
    out.push('\n');
    if let Some(sig) = signature {
        out.push_str("Signature: ");
        out.push_str(sig);
        out.push('\n');
    }
    out
}

/// Decodes a message file.
///
/// # Errors
/// A human-readable reason when the file is not UTF-8, has no trailer, or
/// lacks a valid `Author` or `Date` header.
pub fn decode_message(bytes: &[u8]) -> Result<ParsedMessage, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not UTF-8: {e}"))?;
    let split = text
        .rfind(TRAILER_DELIMITER)
        .ok_or_else(|| "missing header delimiter".to_string())?;
    let content = &text[..split];
    let trailer = &text[split + TRAILER_DELIMITER.len()..];

    let mut author = None;
    let mut date = None;
    let mut signature = None;
    for line in trailer.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Author" => author = Some(value.to_string()),
            "Date" => date = Some(value.to_string()),
            "Signature" if !value.is_empty() => signature = Some(value.to_string()),
            _ => {}
        }
    }

    let author = author
        .filter(|a| !a.is_empty())
        .ok_or_else(|| "missing Author header".to_string())?;
    let date = date.ok_or_else(|| "missing Date header".to_string())?;
    let created_at = DateTime::parse_from_rfc3339(&date)
        .map_err(|e| format!("bad Date header {date:?}: {e}"))?
        .with_timezone(&Utc);

    Ok(ParsedMessage {
        content: content.to_string(),
        author,
        created_at,
        signature,
    })
}
