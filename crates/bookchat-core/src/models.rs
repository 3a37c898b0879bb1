//! Data models for BookChat
//!
//! Messages are immutable once committed. `verified` and `archived` are derived
//! at read time and are never written into message files.

use crate::error::{Result, ValidationError};
use crate::identity::{MESSAGE_EXT, validate_author};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Message
// =============================================================================

/// A chat message as seen by readers of the unified view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub archived: bool,
}

impl Message {
    /// File name of this message inside its author's directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.id.file_name()
    }

    /// Bytes covered by the signature.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        signing_payload(&self.author, &self.created_at, &self.content)
    }
}

/// Total order of the unified view: `created_at`, then `id`.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });
}

/// Canonical payload for detached signatures:
/// `<author>\n<created_at RFC 3339, micros, Z>\n<content>`.
#[must_use]
pub fn signing_payload(author: &str, created_at: &DateTime<Utc>, content: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(author.len() + content.len() + 32);
    out.extend_from_slice(author.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(format_timestamp(created_at).as_bytes());
    out.push(b'\n');
    out.extend_from_slice(content.as_bytes());
    out
}

/// RFC 3339 with microsecond precision, as written into message headers.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Drops sub-microsecond precision so a timestamp survives a header round trip.
#[must_use]
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Checks content before any repository work starts.
///
/// # Errors
/// `EmptyContent` for blank content, `ContentTooLarge` past `limit` bytes.
pub fn validate_content(content: &str, limit: usize) -> Result<()> {
    if content.trim().is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    if content.len() > limit {
        return Err(ValidationError::ContentTooLarge {
            size: content.len(),
            limit,
        });
    }
    Ok(())
}

// =============================================================================
// MessageId
// =============================================================================

const ID_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%6f";
const ID_TIME_LEN: usize = 21;
const ID_SUFFIX_LEN: usize = 8;

/// `<yyyymmddThhmmssffffff>-<author>-<hex8>`; sorts lexically by time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    /// New id for `author` at `created_at` with a random 32-bit suffix.
    #[must_use]
    pub fn generate(author: &str, created_at: &DateTime<Utc>) -> Self {
        Self::with_suffix(author, created_at, rand::random::<u32>())
    }

    #[must_use]
    pub fn with_suffix(author: &str, created_at: &DateTime<Utc>, suffix: u32) -> Self {
        Self(format!(
            "{}-{author}-{suffix:08x}",
            created_at.format(ID_TIME_FORMAT)
        ))
    }

    /// Parses and validates an id string.
    ///
    /// # Errors
    /// [`ValidationError::InvalidMessageId`] when the shape or author is wrong.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || ValidationError::InvalidMessageId(raw.to_string());
        let (stamp, rest) = raw.split_once('-').ok_or_else(invalid)?;
        let (author, suffix) = rest.rsplit_once('-').ok_or_else(invalid)?;
        if stamp.len() != ID_TIME_LEN
            || chrono::NaiveDateTime::parse_from_str(stamp, ID_TIME_FORMAT).is_err()
        {
            return Err(invalid());
        }
        if suffix.len() != ID_SUFFIX_LEN || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        validate_author(author).map_err(|_| invalid())?;
        Ok(Self(raw.to_string()))
    }

    /// Parses the stem of a message file name (`<id>.txt`).
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{MESSAGE_EXT}"))?;
        Self::parse(stem).ok()
    }

    /// Author embedded in the id.
    #[must_use]
    pub fn author(&self) -> &str {
        let rest = &self.0[ID_TIME_LEN + 1..];
        rest.rsplit_once('-').map_or(rest, |(author, _)| author)
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.{MESSAGE_EXT}", self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MessageId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

// =============================================================================
// Pin
// =============================================================================

/// An annotation on a message id. At most one per message.
///
/// Ids are kept as plain strings: a pin may reference a message that has not
/// been pulled yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pin {
    pub message_id: String,
    pub pinned_by: String,
    pub pinned_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64, micros: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, micros * 1000).single().unwrap()
    }

    #[test]
    fn id_embeds_time_author_suffix() {
        let id = MessageId::with_suffix("alice", &ts(1_700_000_000, 42), 0xdead_beef);
        assert_eq!(id.as_str(), "20231114T221320000042-alice-deadbeef");
        assert_eq!(id.author(), "alice");
        assert_eq!(id.file_name(), "20231114T221320000042-alice-deadbeef.txt");
    }

    #[test]
    fn id_author_may_contain_dashes() {
        let id = MessageId::with_suffix("mary-jane", &ts(1_700_000_000, 0), 1);
        let parsed = MessageId::parse(id.as_str()).unwrap();
        assert_eq!(parsed.author(), "mary-jane");
    }

    #[test]
    fn id_parse_rejects_garbage() {
        for raw in [
            "",
            "msg-1",
            "20231114T221320000042-alice",
            "20231114T221320000042-alice-xyz12345",
            "2023111XT221320000042-alice-deadbeef",
            "20231114T221320000042-a b-deadbeef",
        ] {
            assert!(MessageId::parse(raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn ids_sort_by_time() {
        let a = MessageId::with_suffix("zed", &ts(100, 1), 0xffff_ffff);
        let b = MessageId::with_suffix("amy", &ts(100, 2), 0);
        assert!(a < b);
    }

    #[test]
    fn from_file_name_requires_extension() {
        let id = MessageId::with_suffix("bob", &ts(5, 0), 7);
        assert_eq!(MessageId::from_file_name(&id.file_name()), Some(id.clone()));
        assert_eq!(MessageId::from_file_name(id.as_str()), None);
    }

    #[test]
    fn payload_binds_author_time_content() {
        let t = ts(1_700_000_000, 5);
        let p = signing_payload("alice", &t, "hi");
        assert_eq!(p, b"alice\n2023-11-14T22:13:20.000005Z\nhi".to_vec());
        assert_ne!(p, signing_payload("bob", &t, "hi"));
    }

    #[test]
    fn truncation_keeps_micros() {
        let t = Utc.timestamp_opt(10, 123_456_789).single().unwrap();
        assert_eq!(truncate_to_micros(t), Utc.timestamp_opt(10, 123_456_000).single().unwrap());
    }

    #[test]
    fn content_validation() {
        assert_eq!(validate_content("   \n", 10), Err(ValidationError::EmptyContent));
        assert_eq!(
            validate_content("hello", 3),
            Err(ValidationError::ContentTooLarge { size: 5, limit: 3 })
        );
        assert!(validate_content("hello", 5).is_ok());
    }

    #[test]
    fn chronological_sort_breaks_ties_by_id() {
        let t = ts(50, 0);
        let mk = |author: &str, at, suffix| {
            let id = MessageId::with_suffix(author, &at, suffix);
            Message {
                id,
                author: author.to_string(),
                content: "x".into(),
                created_at: at,
                signature: None,
                verified: false,
                archived: false,
            }
        };
        let mut v = vec![mk("bob", t, 2), mk("amy", ts(10, 0), 9), mk("bob", t, 1)];
        sort_chronologically(&mut v);
        assert_eq!(v[0].author, "amy");
        assert!(v[1].id < v[2].id);
    }

    #[test]
    fn message_json_is_camel_case() {
        let t = ts(1, 0);
        let m = Message {
            id: MessageId::with_suffix("amy", &t, 3),
            author: "amy".into(),
            content: "c".into(),
            created_at: t,
            signature: None,
            verified: true,
            archived: false,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("createdAt").is_some());
        assert!(v.get("signature").is_none());
        assert_eq!(v["verified"], true);
    }
}
