//! Message segment tree.
//!
//! A message body is a single root [`Segment`]. Leaves carry content (text,
//! media, mentions) or metadata (reply targets, routing hints); `List` nodes
//! own their children, so the tree cannot contain cycles.
//!
//! On the wire a segment is `{"type": <kind>, "data": <payload>}`. Payloads
//! that producers historically sent as JSON-encoded strings (mentions,
//! routing hints, reply records) are accepted in either form and decoded
//! once here, so consumers never have to sniff shapes.

use std::fmt;

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ============================================================================
// Segment
// ============================================================================

/// One node of the message content tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Segment {
    /// Plain text.
    Text(String),
    /// Base64-encoded image.
    Image(String),
    /// Base64-encoded sticker/emoji image.
    Emoji(String),
    /// Base64-encoded audio clip.
    Voice(String),
    /// Video reference (URL or identifier).
    Video(String),
    /// File reference (URL or identifier).
    File(String),
    /// Users/roles to mention.
    #[serde(deserialize_with = "embedded_json")]
    Mention(Mention),
    /// The message this one replies to. Metadata only, never rendered.
    Reply(ReplyTarget),
    /// Forces delivery into a specific sub-conversation. Metadata only.
    #[serde(rename = "thread_context", deserialize_with = "embedded_json")]
    RoutingHint(RoutingHint),
    /// System notification payload.
    Notify(Value),
    /// Engine command payload.
    Command(Value),
    /// Ordered children.
    #[serde(rename = "seglist")]
    List(Vec<Segment>),
}

/// Discriminant of a [`Segment`], mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    Text,
    Image,
    Emoji,
    Voice,
    Video,
    File,
    Mention,
    Reply,
    RoutingHint,
    Notify,
    Command,
    List,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SegmentKind::Text => "text",
            SegmentKind::Image => "image",
            SegmentKind::Emoji => "emoji",
            SegmentKind::Voice => "voice",
            SegmentKind::Video => "video",
            SegmentKind::File => "file",
            SegmentKind::Mention => "mention",
            SegmentKind::Reply => "reply",
            SegmentKind::RoutingHint => "thread_context",
            SegmentKind::Notify => "notify",
            SegmentKind::Command => "command",
            SegmentKind::List => "seglist",
        };
        f.write_str(name)
    }
}

impl Segment {
    /// Create a text segment.
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text(text.into())
    }

    /// Create a list segment.
    pub fn list(children: Vec<Segment>) -> Self {
        Segment::List(children)
    }

    /// Create a reply segment pointing at `message_id`.
    pub fn reply(message_id: impl Into<String>) -> Self {
        Segment::Reply(ReplyTarget {
            message_id: message_id.into(),
        })
    }

    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Text(_) => SegmentKind::Text,
            Segment::Image(_) => SegmentKind::Image,
            Segment::Emoji(_) => SegmentKind::Emoji,
            Segment::Voice(_) => SegmentKind::Voice,
            Segment::Video(_) => SegmentKind::Video,
            Segment::File(_) => SegmentKind::File,
            Segment::Mention(_) => SegmentKind::Mention,
            Segment::Reply(_) => SegmentKind::Reply,
            Segment::RoutingHint(_) => SegmentKind::RoutingHint,
            Segment::Notify(_) => SegmentKind::Notify,
            Segment::Command(_) => SegmentKind::Command,
            Segment::List(_) => SegmentKind::List,
        }
    }

    /// Whether this segment only steers delivery and has no visible content.
    pub fn is_metadata(&self) -> bool {
        matches!(self, Segment::Reply(_) | Segment::RoutingHint(_))
    }

    /// Depth-first, pre-order walk over this segment and all descendants.
    pub fn iter(&self) -> Segments<'_> {
        Segments { stack: vec![self] }
    }

    /// First reply target in tree order.
    pub fn reply_target(&self) -> Option<&ReplyTarget> {
        self.iter().find_map(|seg| match seg {
            Segment::Reply(target) => Some(target),
            _ => None,
        })
    }

    /// First routing hint in tree order.
    pub fn routing_hint(&self) -> Option<&RoutingHint> {
        self.iter().find_map(|seg| match seg {
            Segment::RoutingHint(hint) => Some(hint),
            _ => None,
        })
    }
}

/// Iterator returned by [`Segment::iter`].
pub struct Segments<'a> {
    stack: Vec<&'a Segment>,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a Segment;

    fn next(&mut self) -> Option<Self::Item> {
        let seg = self.stack.pop()?;
        if let Segment::List(children) = seg {
            self.stack.extend(children.iter().rev());
        }
        Some(seg)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Target of a `reply` segment.
///
/// Accepted input shapes: a bare id (`"123"` or `123`), a record
/// (`{"message_id": "123"}`), a JSON string encoding such a record, or a
/// list whose first scalar is the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyTarget {
    pub message_id: String,
}

impl<'de> Deserialize<'de> for ReplyTarget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        reply_id_from_value(&value)
            .map(|message_id| ReplyTarget { message_id })
            .ok_or_else(|| D::Error::custom("reply segment carries no message id"))
    }
}

fn reply_id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(s) {
                return map.get("message_id").and_then(scalar_id);
            }
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(_) => scalar_id(value),
        Value::Object(map) => map.get("message_id").and_then(scalar_id),
        Value::Array(items) => items.iter().find_map(scalar_id),
        _ => None,
    }
}

fn scalar_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Producer-attached instruction to deliver into a specific sub-conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingHint {
    /// Sub-conversation (thread) the reply must land in.
    #[serde(deserialize_with = "id_string")]
    pub original_thread_id: String,
    /// Parent conversation the thread was spawned from.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opt_id_string"
    )]
    pub parent_channel_id: Option<String>,
}

/// Payload of a `mention` segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    #[serde(default)]
    pub users: Vec<MentionedUser>,
    #[serde(default)]
    pub roles: Vec<MentionedRole>,
    #[serde(default)]
    pub everyone: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionedUser {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionedRole {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub role_id: Option<String>,
    #[serde(default)]
    pub role_name: Option<String>,
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Decode a payload that may arrive either inline or as a JSON-encoded string.
fn embedded_json<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = match Value::deserialize(deserializer)? {
        Value::String(s) => serde_json::from_str(&s).map_err(D::Error::custom)?,
        other => other,
    };
    T::deserialize(value).map_err(D::Error::custom)
}

/// Snowflake ids show up as strings or integers depending on the producer.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    scalar_id(&value).ok_or_else(|| D::Error::custom("expected a string or integer id"))
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Null => Ok(None),
        other => scalar_id(&other)
            .map(Some)
            .ok_or_else(|| D::Error::custom("expected a string or integer id")),
    }
}

// ============================================================================
// Tests
// ============================================================================
