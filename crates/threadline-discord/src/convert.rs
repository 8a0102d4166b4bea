//! Conversions between serenity models and core types.

use chrono::{DateTime, Utc};
use serenity::all::{
    ChannelId, ChannelType, GatewayIntents, GuildChannel, Message, MessageId, RoleId, User, UserId,
};

use threadline::client::{LookupError, SurfaceKind};
use threadline::config::IntentsConfig;
use threadline::inbound::{Author, InboundAttachment, InboundMessage};
use threadline_protocol::{Mention, MentionedRole, MentionedUser};

// ============================================================================
// Intents
// ============================================================================

pub fn intents(config: &IntentsConfig) -> GatewayIntents {
    let mut intents = GatewayIntents::empty();
    if config.guilds {
        intents |= GatewayIntents::GUILDS;
    }
    if config.messages {
        intents |= GatewayIntents::GUILD_MESSAGES;
    }
    if config.dm_messages {
        intents |= GatewayIntents::DIRECT_MESSAGES;
    }
    if config.message_content {
        intents |= GatewayIntents::MESSAGE_CONTENT;
    }
    if config.reactions {
        intents |= GatewayIntents::GUILD_MESSAGE_REACTIONS | GatewayIntents::DIRECT_MESSAGE_REACTIONS;
    }
    if config.voice_states {
        intents |= GatewayIntents::GUILD_VOICE_STATES;
    }
    intents
}

// ============================================================================
// Ids
// ============================================================================

/// Snowflakes are non-zero u64s; serenity panics on zero.
pub fn parse_snowflake(id: &str) -> Result<u64, LookupError> {
    match id.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(LookupError::InvalidId(id.to_string())),
        Ok(value) => Ok(value),
    }
}

pub fn channel_id(id: &str) -> Result<ChannelId, LookupError> {
    parse_snowflake(id).map(ChannelId::new)
}

pub fn message_id(id: &str) -> Result<MessageId, LookupError> {
    parse_snowflake(id).map(MessageId::new)
}

pub fn user_id(id: &str) -> Result<UserId, LookupError> {
    parse_snowflake(id).map(UserId::new)
}

// ============================================================================
// Channels
// ============================================================================

pub fn is_thread(kind: ChannelType) -> bool {
    matches!(
        kind,
        ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
    )
}

/// Surface kind for a guild channel. Only threads have a meaningful parent;
/// a text channel's parent is its category.
pub fn surface_kind(kind: ChannelType, parent_id: Option<ChannelId>) -> SurfaceKind {
    match (kind, parent_id) {
        (kind, Some(parent_id)) if is_thread(kind) => SurfaceKind::SubConversation {
            parent_id: parent_id.to_string(),
        },
        (ChannelType::Text | ChannelType::News | ChannelType::Forum, _) => SurfaceKind::Parent,
        (ChannelType::Private, _) => SurfaceKind::Direct,
        _ => SurfaceKind::Other,
    }
}

/// What the inbound path needs to know about the channel a message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: Option<String>,
    /// Set for threads.
    pub parent_id: Option<ChannelId>,
}

impl ChannelInfo {
    pub fn from_guild_channel(channel: &GuildChannel) -> Self {
        Self {
            name: Some(channel.name.clone()),
            parent_id: channel.parent_id.filter(|_| is_thread(channel.kind)),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Mentioned users, roles and `@everyone`/`@here`. `None` when nothing is
/// mentioned. Role names come from `role_name` when the guild is cached.
pub fn mention(
    users: &[User],
    roles: &[RoleId],
    everyone: bool,
    role_name: impl Fn(RoleId) -> Option<String>,
) -> Option<Mention> {
    if users.is_empty() && roles.is_empty() && !everyone {
        return None;
    }
    Some(Mention {
        users: users
            .iter()
            .map(|user| MentionedUser {
                user_id: Some(user.id.to_string()),
                display_name: user.global_name.clone(),
                username: Some(user.name.clone()),
            })
            .collect(),
        roles: roles
            .iter()
            .map(|&id| MentionedRole {
                role_id: Some(id.to_string()),
                role_name: role_name(id),
            })
            .collect(),
        everyone,
    })
}

pub fn inbound_message(
    message: &Message,
    channel: &ChannelInfo,
    self_id: Option<UserId>,
    role_name: impl Fn(RoleId) -> Option<String>,
) -> InboundMessage {
    let author = &message.author;
    InboundMessage {
        message_id: message.id.to_string(),
        conversation_id: message.channel_id.to_string(),
        conversation_name: channel.name.clone(),
        parent_id: channel.parent_id.map(|id| id.to_string()),
        guild_id: message.guild_id.map(|id| id.to_string()),
        author: Author {
            id: author.id.to_string(),
            username: author.name.clone(),
            display_name: author.global_name.clone(),
            nickname: message.member.as_ref().and_then(|member| member.nick.clone()),
            is_self: self_id == Some(author.id),
        },
        content: message.content.clone(),
        mention: mention(
            &message.mentions,
            &message.mention_roles,
            message.mention_everyone,
            role_name,
        ),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| InboundAttachment {
                url: attachment.url.clone(),
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
            })
            .collect(),
        stickers: message
            .sticker_items
            .iter()
            .map(|sticker| sticker.name.clone())
            .collect(),
        reply_to: message
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| id.to_string()),
        timestamp: DateTime::from_timestamp(message.timestamp.unix_timestamp(), 0)
            .unwrap_or_else(Utc::now),
    }
}
