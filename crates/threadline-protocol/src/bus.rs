//! Bus message envelopes.
//!
//! [`BusMessage`] travels from the bridge to the conversational engine,
//! [`OutboundMessage`] travels back. The bridge does not define how these
//! are transported; the standalone binary happens to use JSON Lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::segment::Segment;

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Platform instance name (e.g. "discord_bot_instance_1").
    pub platform: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Per-guild display name, when it differs from the nickname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cardname: Option<String>,
}

/// Conversation a bus message belongs to. Absent for direct messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A gateway message converted for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub message_id: String,
    pub platform: String,
    pub sender: SenderInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationInfo>,
    pub segment: Segment,
    /// Original text as typed, for engines that want it verbatim.
    pub raw_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Where an outbound message should go before routing refines it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundTarget {
    /// A parent conversation or sub-conversation id.
    Conversation { id: String },
    /// A user; delivered through their direct-message surface.
    User { id: String },
}

/// A reply produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub target: OutboundTarget,
    pub segment: Segment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderInfo>,
}

impl OutboundMessage {
    /// Build an outbound message for a conversation.
    pub fn to_conversation(id: impl Into<String>, segment: Segment) -> Self {
        Self {
            message_id: None,
            target: OutboundTarget::Conversation { id: id.into() },
            segment,
            sender: None,
        }
    }

    /// Build an outbound message for a user's direct messages.
    pub fn to_user(id: impl Into<String>, segment: Segment) -> Self {
        Self {
            message_id: None,
            target: OutboundTarget::User { id: id.into() },
            segment,
            sender: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_message_from_json() {
        let msg: OutboundMessage = serde_json::from_value(json!({
            "target": {"kind": "conversation", "id": "100"},
            "segment": {"type": "text", "data": "hi"}
        }))
        .unwrap();
        assert_eq!(
            msg.target,
            OutboundTarget::Conversation {
                id: "100".to_string()
            }
        );
        assert_eq!(msg.segment, Segment::text("hi"));
        assert!(msg.sender.is_none());
    }

    #[test]
    fn user_target_tag() {
        let msg = OutboundMessage::to_user("7", Segment::text("x"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["target"]["kind"], "user");
        assert_eq!(json["target"]["id"], "7");
        assert!(json.get("message_id").is_none());
    }
}
